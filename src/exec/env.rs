//! Deterministic environment assembly for a run's child process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::model::{Job, Run, RunSnapshot};
use crate::store::PreviousRuns;

fn coerce_value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn current_user_info() -> (String, PathBuf) {
    // SAFETY: getpwuid is not reentrant-safe across threads, but this is
    // called once during environment assembly on a single thread before
    // any fork, never from a signal handler.
    unsafe {
        let pw = libc::getpwuid(libc::getuid());
        if pw.is_null() {
            return (
                std::env::var("LOGNAME").unwrap_or_else(|_| "unknown".to_string()),
                std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/")),
            );
        }
        let name = std::ffi::CStr::from_ptr((*pw).pw_name)
            .to_string_lossy()
            .into_owned();
        let home = std::ffi::CStr::from_ptr((*pw).pw_dir)
            .to_string_lossy()
            .into_owned();
        (name, PathBuf::from(home))
    }
}

fn snapshot_vars(prefix: &str, snap: &RunSnapshot) -> Vec<(String, String)> {
    vec![
        (format!("{prefix}_RUN_ID"), snap.run_id.clone()),
        (format!("{prefix}_SCHEDULE_TIME"), snap.schedule_time.timestamp().to_string()),
        (format!("{prefix}_START_TIME"), snap.start_time.timestamp().to_string()),
        (format!("{prefix}_STOP_TIME"), snap.stop_time.timestamp().to_string()),
        (format!("{prefix}_EXIT_CODE"), snap.exit_code.to_string()),
    ]
}

/// Builds the environment map and resolves the working directory for a
/// run's child process. Order of assembly (later keys overwrite earlier,
/// matching insertion order into the map): minimal base, run context,
/// concurrency group, previous-run snapshots, Jenkins compatibility
/// variables, global then job then trigger environment, finally `PWD`.
pub fn build(
    config: &Config,
    job: &Job,
    run: &Run,
    previous: &PreviousRuns,
    run_dir: &Path,
) -> (HashMap<String, String>, PathBuf) {
    let mut env = HashMap::new();

    let (logname, home) = current_user_info();
    env.insert("LOGNAME".to_string(), logname);
    env.insert("HOME".to_string(), home.display().to_string());
    env.insert(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
    );
    env.insert("CI".to_string(), "true".to_string());
    env.insert("DSARI".to_string(), "true".to_string());

    let job_dir = config.data_dir.join("jobs").join(&job.name);
    let trigger_dir = crate::trigger::trigger_dir(&config.data_dir, &job.name);
    env.insert("DATA_DIR".to_string(), config.data_dir.display().to_string());
    env.insert("JOB_NAME".to_string(), job.name.clone());
    env.insert("JOB_DIR".to_string(), job_dir.display().to_string());
    env.insert("RUN_ID".to_string(), run.id.clone());
    env.insert("RUN_DIR".to_string(), run_dir.display().to_string());
    env.insert(
        "SCHEDULE_TIME".to_string(),
        run.schedule_time.timestamp().to_string(),
    );
    env.insert(
        "START_TIME".to_string(),
        run.start_time.unwrap_or(run.schedule_time).timestamp().to_string(),
    );
    env.insert(
        "TRIGGER_TYPE".to_string(),
        match run.trigger_type {
            crate::model::TriggerType::Schedule => "schedule".to_string(),
            crate::model::TriggerType::File => "file".to_string(),
        },
    );
    env.insert("TRIGGER_DIR".to_string(), trigger_dir.display().to_string());

    if let Some(group) = &run.concurrency_group {
        env.insert("CONCURRENCY_GROUP".to_string(), group.clone());
    }

    if let Some(snap) = &previous.previous {
        for (k, v) in snapshot_vars("PREVIOUS", snap) {
            env.insert(k, v);
        }
    }
    if let Some(snap) = &previous.previous_good {
        for (k, v) in snapshot_vars("PREVIOUS_GOOD", snap) {
            env.insert(k, v);
        }
    }
    if let Some(snap) = &previous.previous_bad {
        for (k, v) in snapshot_vars("PREVIOUS_BAD", snap) {
            env.insert(k, v);
        }
    }

    if job.jenkins_environment {
        env.insert("BUILD_NUMBER".to_string(), run.id.clone());
        env.insert("BUILD_ID".to_string(), run.id.clone());
        env.insert("BUILD_URL".to_string(), String::new());
        env.insert("NODE_NAME".to_string(), "master".to_string());
        env.insert("BUILD_TAG".to_string(), format!("dsari-{}-{}", job.name, run.id));
        env.insert("JENKINS_URL".to_string(), String::new());
        env.insert("EXECUTOR_NUMBER".to_string(), "0".to_string());
        env.insert("WORKSPACE".to_string(), run_dir.display().to_string());
    }

    for (k, v) in &config.environment {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in &job.environment {
        env.insert(k.clone(), v.clone());
    }
    if let Some(serde_json::Value::Object(trigger_env)) = run.trigger_data.get("environment") {
        for (k, v) in trigger_env {
            if let Some(s) = coerce_value_to_string(v) {
                env.insert(k.clone(), s);
            }
        }
    }

    let cwd = env
        .get("PWD")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .unwrap_or_else(|| run_dir.to_path_buf());
    env.insert("PWD".to_string(), cwd.display().to_string());

    (env, cwd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseDescriptor;
    use crate::store::PreviousRuns;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn base_config(data_dir: PathBuf) -> Config {
        Config {
            jobs: Map::new(),
            concurrency_groups: Map::new(),
            data_dir,
            shutdown_kill_runs: false,
            shutdown_kill_grace: None,
            environment: Map::new(),
            database: DatabaseDescriptor::default(),
        }
    }

    fn base_job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            command: vec!["true".to_string()],
            schedule: None,
            schedule_timezone: None,
            max_execution: None,
            max_execution_grace: std::time::Duration::from_secs(60),
            environment: Map::new(),
            render_reports: false,
            command_append_run: false,
            jenkins_environment: false,
            job_group: None,
            concurrent_runs: true,
            concurrency_groups: vec![],
        }
    }

    fn empty_previous() -> PreviousRuns {
        PreviousRuns {
            previous: None,
            previous_good: None,
            previous_bad: None,
        }
    }

    #[test]
    fn determinism_given_identical_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path().to_path_buf());
        let job = base_job("build");
        let mut run = Run::new_scheduled("build".to_string(), Utc::now());
        run.start_time = Some(Utc::now());
        let run_dir = dir.path().join("runs").join("build").join(&run.id);

        let (env_a, cwd_a) = build(&cfg, &job, &run, &empty_previous(), &run_dir);
        let (env_b, cwd_b) = build(&cfg, &job, &run, &empty_previous(), &run_dir);

        // Modulo inherited PATH, every other key must match byte-for-byte.
        for (k, v) in &env_a {
            if k == "PATH" {
                continue;
            }
            assert_eq!(env_b.get(k), Some(v));
        }
        assert_eq!(cwd_a, cwd_b);
    }

    #[test]
    fn job_environment_overrides_global() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path().to_path_buf());
        cfg.environment.insert("FOO".to_string(), "global".to_string());
        let mut job = base_job("build");
        job.environment.insert("FOO".to_string(), "job".to_string());
        let run = Run::new_scheduled("build".to_string(), Utc::now());
        let run_dir = dir.path().join("runs").join("build").join(&run.id);

        let (env, _) = build(&cfg, &job, &run, &empty_previous(), &run_dir);
        assert_eq!(env.get("FOO"), Some(&"job".to_string()));
    }

    #[test]
    fn trigger_environment_wins_over_job_environment() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path().to_path_buf());
        let mut job = base_job("build");
        job.environment.insert("FOO".to_string(), "job".to_string());
        let mut run = Run::new_scheduled("build".to_string(), Utc::now());
        let mut trigger_env = serde_json::Map::new();
        trigger_env.insert("FOO".to_string(), serde_json::json!("trigger"));
        run.trigger_data.insert("environment".to_string(), serde_json::Value::Object(trigger_env));
        let run_dir = dir.path().join("runs").join("build").join(&run.id);

        let (env, _) = build(&cfg, &job, &run, &empty_previous(), &run_dir);
        assert_eq!(env.get("FOO"), Some(&"trigger".to_string()));
    }

    #[test]
    fn jenkins_environment_emits_compat_vars() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path().to_path_buf());
        let mut job = base_job("build");
        job.jenkins_environment = true;
        let run = Run::new_scheduled("build".to_string(), Utc::now());
        let run_dir = dir.path().join("runs").join("build").join(&run.id);

        let (env, _) = build(&cfg, &job, &run, &empty_previous(), &run_dir);
        assert_eq!(env.get("NODE_NAME"), Some(&"master".to_string()));
        assert!(env.contains_key("BUILD_TAG"));
    }

    #[test]
    fn defaults_cwd_to_run_dir_without_pwd_override() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path().to_path_buf());
        let job = base_job("build");
        let run = Run::new_scheduled("build".to_string(), Utc::now());
        let run_dir = dir.path().join("runs").join("build").join(&run.id);
        std::fs::create_dir_all(&run_dir).unwrap();

        let (_, cwd) = build(&cfg, &job, &run, &empty_previous(), &run_dir);
        assert_eq!(cwd, run_dir);
    }
}
