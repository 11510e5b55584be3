//! Pluggable persistence: one trait, one concrete SQLite-backed implementation.
//!
//! Grounded in the teacher's `scheduler::job_store::JobStore` trait and
//! `SqliteJobStore`: `tokio::sync::Mutex<rusqlite::Connection>`, schema
//! initialized before the connection is wrapped in the mutex, JSON-text
//! columns for free-form data, RFC 3339 text for instants.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{GroupName, JobName, Run, RunSnapshot, TriggerType};

/// A finished run as persisted: the fields a terminal row carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedRun {
    pub id: String,
    pub job_name: JobName,
    pub trigger_type: TriggerType,
    pub trigger_data: serde_json::Map<String, serde_json::Value>,
    pub run_data: serde_json::Map<String, serde_json::Value>,
    pub schedule_time: chrono::DateTime<chrono::Utc>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub stop_time: chrono::DateTime<chrono::Utc>,
    pub exit_code: i32,
    pub concurrency_group: Option<GroupName>,
}

impl FinishedRun {
    pub fn from_run(run: &Run) -> Self {
        FinishedRun {
            id: run.id.clone(),
            job_name: run.job_name.clone(),
            trigger_type: run.trigger_type,
            trigger_data: run.trigger_data.clone(),
            run_data: run.run_data.clone(),
            schedule_time: run.schedule_time,
            start_time: run.start_time.expect("finished run must have started"),
            stop_time: run.stop_time.expect("finished run must have stopped"),
            exit_code: run.exit_code.expect("finished run must have an exit code"),
            concurrency_group: run.concurrency_group.clone(),
        }
    }

    pub fn as_snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id.clone(),
            schedule_time: self.schedule_time,
            start_time: self.start_time,
            stop_time: self.stop_time,
            exit_code: self.exit_code,
        }
    }
}

/// Filter for [`Store::get_runs`]: external consumers narrow by job name
/// and/or by a specific set of run ids. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_names: Option<Vec<JobName>>,
    pub run_ids: Option<Vec<String>>,
    pub limit: Option<usize>,
}

/// The three "previous run" snapshots a new [`Run`] is seeded with.
pub struct PreviousRuns {
    pub previous: Option<RunSnapshot>,
    pub previous_good: Option<RunSnapshot>,
    pub previous_bad: Option<RunSnapshot>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically records a run that has started but not finished.
    async fn insert_running(&self, run: &Run) -> Result<(), StoreError>;

    /// Atomically records the terminal row and removes the matching running row.
    async fn insert_finished(&self, run: &FinishedRun) -> Result<(), StoreError>;

    /// Removes every running row. Called once at daemon startup: a
    /// crash-recovered daemon's previous owners are dead.
    async fn clear_running(&self) -> Result<(), StoreError>;

    /// The finished run with the greatest `stop_time`, the greatest
    /// `stop_time` with `exit_code == 0`, and the greatest `stop_time`
    /// with `exit_code != 0`, each nullable.
    async fn previous_runs(&self, job_name: &str) -> Result<PreviousRuns, StoreError>;

    /// Finished runs filtered by job-name set or run-id set.
    async fn get_runs(&self, filter: &RunFilter) -> Result<Vec<FinishedRun>, StoreError>;

    /// Releases back-end handles in a forked child before `exec`. A no-op
    /// for back-ends with no OS handle to release.
    fn child_close_resources(&self) {}
}

#[cfg(test)]
pub(crate) fn sample_finished_run(job: &str, stop_secs: i64, exit_code: i32) -> FinishedRun {
    use chrono::{TimeZone, Utc};
    let stop_time = Utc.timestamp_opt(stop_secs, 0).unwrap();
    FinishedRun {
        id: uuid::Uuid::new_v4().to_string(),
        job_name: job.to_string(),
        trigger_type: TriggerType::Schedule,
        trigger_data: serde_json::Map::new(),
        run_data: serde_json::Map::new(),
        schedule_time: stop_time - chrono::Duration::seconds(10),
        start_time: stop_time - chrono::Duration::seconds(5),
        stop_time,
        exit_code,
        concurrency_group: None,
    }
}
