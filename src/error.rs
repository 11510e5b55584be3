//! Crate-wide error types, composed per-subsystem in the teacher's style.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerdError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("exec error: {0}")]
    Exec(#[from] ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("job {job:?} references unknown concurrency group {group:?}")]
    UnknownGroup { job: String, group: String },
}

#[derive(Error, Debug)]
pub enum RecurrenceError {
    #[error("unparseable schedule expression {0:?}: {1}")]
    InvalidExpression(String, String),

    #[error("field {0} token {1:?} is malformed")]
    MalformedToken(usize, String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("run {0} not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("trigger file is not a mapping")]
    NotAMapping,

    #[error("trigger field `environment` is not a mapping")]
    EnvironmentNotAMapping,

    #[error("trigger field `schedule_time` is neither a number nor an ISO-8601 string")]
    InvalidScheduleTime,

    #[error("environment value for {0:?} is not coercible to a string")]
    UncoercibleEnvironmentValue(String),
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to create run directory {0:?}: {1}")]
    RunDirCreation(String, std::io::Error),

    #[error("failed to open output file {0:?}: {1}")]
    OutputFileOpen(String, std::io::Error),

    #[error("failed to spawn child: {0}")]
    Spawn(std::io::Error),
}
