//! Trigger Intake: turns `<data_dir>/trigger/<job_name>/trigger.{json,yaml}`
//! files into one-off scheduled runs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::TriggerError;
use crate::model::Run;

/// Directory for a given job's trigger file, rooted at `data_dir`.
pub fn trigger_dir(data_dir: &Path, job_name: &str) -> PathBuf {
    data_dir.join("trigger").join(job_name)
}

fn candidate_paths(data_dir: &Path, job_name: &str) -> Vec<PathBuf> {
    let dir = trigger_dir(data_dir, job_name);
    let mut paths = vec![dir.join("trigger.json")];
    if cfg!(feature = "yaml") {
        paths.push(dir.join("trigger.yaml"));
    }
    paths
}

/// Parsed, validated trigger-file contents.
struct ParsedTrigger {
    schedule_time: Option<DateTime<Utc>>,
    data: serde_json::Map<String, Value>,
}

fn coerce_environment(map: &serde_json::Map<String, Value>) -> Result<(), TriggerError> {
    let env = match map.get("environment") {
        None => return Ok(()),
        Some(Value::Object(o)) => o,
        Some(_) => return Err(TriggerError::EnvironmentNotAMapping),
    };
    for (k, v) in env {
        match v {
            Value::String(_) | Value::Number(_) => {}
            _ => return Err(TriggerError::UncoercibleEnvironmentValue(k.clone())),
        }
    }
    Ok(())
}

fn parse_schedule_time(value: &Value) -> Result<DateTime<Utc>, TriggerError> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64().ok_or(TriggerError::InvalidScheduleTime)?;
            Utc.timestamp_opt(secs.trunc() as i64, 0)
                .single()
                .ok_or(TriggerError::InvalidScheduleTime)
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| TriggerError::InvalidScheduleTime),
        _ => Err(TriggerError::InvalidScheduleTime),
    }
}

fn parse_trigger_body(body: &str, is_yaml: bool) -> Result<ParsedTrigger, TriggerError> {
    let value: Value = if is_yaml {
        #[cfg(feature = "yaml")]
        {
            serde_yaml::from_str(body).map_err(|_| TriggerError::NotAMapping)?
        }
        #[cfg(not(feature = "yaml"))]
        {
            return Err(TriggerError::NotAMapping);
        }
    } else {
        serde_json::from_str(body).map_err(|_| TriggerError::NotAMapping)?
    };

    let map = match value {
        Value::Object(o) => o,
        _ => return Err(TriggerError::NotAMapping),
    };

    coerce_environment(&map)?;

    let schedule_time = match map.get("schedule_time") {
        None => None,
        Some(v) => Some(parse_schedule_time(v)?),
    };

    Ok(ParsedTrigger {
        schedule_time,
        data: map,
    })
}

/// Scan one job's trigger file. Reads then deletes it. Returns `Ok(None)`
/// when no trigger file exists or an IO race caused it to disappear
/// between the existence check and the read (silently ignored, per spec,
/// to avoid log spam). Returns `Ok(Some(run))` on success. Logs and
/// returns `Ok(None)` on a malformed trigger file — the reject-and-drop
/// policy never propagates an error up to the scheduler loop.
pub fn poll_job(data_dir: &Path, job_name: &str) -> std::io::Result<Option<Run>> {
    for path in candidate_paths(data_dir, job_name) {
        if !path.exists() {
            continue;
        }
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime: DateTime<Utc> = meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        let body = match std::fs::read_to_string(&path) {
            Ok(b) => b,
            Err(_) => continue,
        };
        // Best-effort delete; an IO race here is not our problem to report.
        let _ = std::fs::remove_file(&path);

        let is_yaml = path.extension().and_then(|e| e.to_str()) == Some("yaml");
        match parse_trigger_body(&body, is_yaml) {
            Ok(parsed) => {
                let schedule_time = parsed.schedule_time.unwrap_or(mtime);
                return Ok(Some(Run::new_triggered(
                    job_name.to_string(),
                    schedule_time,
                    parsed.data,
                )));
            }
            Err(e) => {
                warn!(job = job_name, error = %e, "rejecting malformed trigger file");
                return Ok(None);
            }
        }
    }
    Ok(None)
}
