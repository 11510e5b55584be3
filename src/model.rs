//! Core data model: Job, ConcurrencyGroup, Run.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, human-chosen job identifier. Matches `^[- A-Za-z0-9_+.:@]+$`, <= 64 chars.
pub type JobName = String;

/// Unique, human-chosen concurrency group identifier. Same charset rules as [`JobName`].
pub type GroupName = String;

pub(crate) const NAME_PATTERN: &str = r"^[- A-Za-z0-9_+.:@]+$";
pub(crate) const NAME_MAX_LEN: usize = 64;

/// A job as loaded from configuration. Replaced/removed only on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: JobName,
    /// Ordered argv; `command[0]` is the executable.
    pub command: Vec<String>,
    /// Recurrence expression (cron-like, `@alias`, or `RRULE:...`). `None` means trigger-only.
    pub schedule: Option<String>,
    pub schedule_timezone: Option<String>,
    #[serde(with = "humantime_serde::option", default)]
    pub max_execution: Option<Duration>,
    #[serde(with = "humantime_serde", default = "default_grace")]
    pub max_execution_grace: Duration,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub render_reports: bool,
    #[serde(default)]
    pub command_append_run: bool,
    #[serde(default)]
    pub jenkins_environment: bool,
    pub job_group: Option<String>,
    #[serde(default)]
    pub concurrent_runs: bool,
    #[serde(default)]
    pub concurrency_groups: Vec<GroupName>,
}

fn default_grace() -> Duration {
    Duration::from_secs(60)
}

impl Job {
    pub fn validate_name(name: &str) -> Result<(), String> {
        validate_name(name)
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(format!(
            "name {:?} must be 1-{} characters",
            name, NAME_MAX_LEN
        ));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "- _+.:@".contains(c));
    if !ok {
        return Err(format!("name {:?} contains characters outside [- A-Za-z0-9_+.:@]", name));
    }
    Ok(())
}

/// A named capacity bucket; each running [`Run`] occupies at most one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyGroup {
    pub name: GroupName,
    #[serde(default = "default_group_max")]
    pub max: u32,
}

fn default_group_max() -> u32 {
    1
}

/// How a [`Run`] came to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    File,
}

/// A snapshot of a previously-finished run, embedded into a later run's environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub schedule_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub exit_code: i32,
}

/// One invocation of a Job's command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_name: JobName,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub run_data: serde_json::Map<String, serde_json::Value>,
    pub schedule_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub concurrency_group: Option<GroupName>,
    pub previous_run: Option<RunSnapshot>,
    pub previous_good_run: Option<RunSnapshot>,
    pub previous_bad_run: Option<RunSnapshot>,
    /// Whether a successor should be queued via the recurrence engine once this run finishes.
    pub respawn: bool,

    /// Runtime-only bookkeeping, never persisted as config: the live child's pid and
    /// escalation state, populated by the Child Executor / Scheduler Loop.
    #[serde(skip)]
    pub pid: Option<i32>,
    #[serde(skip)]
    pub term_sent: bool,
    #[serde(skip)]
    pub kill_sent: bool,
}

impl Run {
    pub fn new_scheduled(job_name: JobName, schedule_time: DateTime<Utc>) -> Self {
        Run {
            id: Uuid::new_v4().to_string(),
            job_name,
            trigger_type: TriggerType::Schedule,
            trigger_data: serde_json::Map::new(),
            run_data: serde_json::Map::new(),
            schedule_time,
            start_time: None,
            stop_time: None,
            exit_code: None,
            concurrency_group: None,
            previous_run: None,
            previous_good_run: None,
            previous_bad_run: None,
            respawn: true,
            pid: None,
            term_sent: false,
            kill_sent: false,
        }
    }

    pub fn new_triggered(
        job_name: JobName,
        schedule_time: DateTime<Utc>,
        trigger_data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Run {
            id: Uuid::new_v4().to_string(),
            job_name,
            trigger_type: TriggerType::File,
            trigger_data,
            run_data: serde_json::Map::new(),
            schedule_time,
            start_time: None,
            stop_time: None,
            exit_code: None,
            concurrency_group: None,
            previous_run: None,
            previous_good_run: None,
            previous_bad_run: None,
            respawn: false,
            pid: None,
            term_sent: false,
            kill_sent: false,
        }
    }
}
