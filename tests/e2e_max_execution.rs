//! End-to-end scenario 4: a job whose `max_execution` elapses gets
//! SIGTERM, and if it ignores that, SIGKILL after the grace period.
//! Final exit code must be `128 + SIGTERM` or `128 + SIGKILL`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use schedulerd::config::{Config, DatabaseDescriptor};
use schedulerd::model::Job;
use schedulerd::store::{SqliteStore, Store};
use schedulerd::Scheduler;
use tokio::sync::mpsc;

#[tokio::test]
async fn max_execution_kills_a_long_running_child() {
    let data_dir = tempfile::tempdir().unwrap();

    // Ignores SIGTERM so the SIGKILL escalation path is exercised too.
    let job = Job {
        name: "stubborn".to_string(),
        command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "trap '' TERM; sleep 30".to_string(),
        ],
        schedule: None,
        schedule_timezone: None,
        max_execution: Some(Duration::from_millis(300)),
        max_execution_grace: Duration::from_millis(300),
        environment: HashMap::new(),
        render_reports: false,
        command_append_run: false,
        jenkins_environment: false,
        job_group: None,
        concurrent_runs: true,
        concurrency_groups: vec![],
    };

    let trigger_dir = data_dir.path().join("trigger").join("stubborn");
    std::fs::create_dir_all(&trigger_dir).unwrap();
    std::fs::write(trigger_dir.join("trigger.json"), "{}").unwrap();

    let mut jobs = HashMap::new();
    jobs.insert("stubborn".to_string(), job);
    let config = Config {
        jobs,
        concurrency_groups: HashMap::new(),
        data_dir: data_dir.path().to_path_buf(),
        shutdown_kill_runs: false,
        shutdown_kill_grace: None,
        environment: HashMap::new(),
        database: DatabaseDescriptor::default(),
    };

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (_tx, rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(config, None, store.clone(), rx);
    scheduler.initialize().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), scheduler.run(true))
        .await
        .expect("scheduler should finish well within the process-group kill escalation window")
        .unwrap();

    let finished = store.get_runs(&Default::default()).await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].exit_code, 128 + libc::SIGKILL);
}
