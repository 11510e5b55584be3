//! Child Executor: forks a child for an admitted run, sanitizes its
//! environment, redirects I/O, and executes the command.
//!
//! Grounded in the teacher's `sandbox::native::NativeRunner` for the
//! overall shape, but the spawn primitive is `std::process::Command`
//! (never `tokio::process::Command`): the Design Notes on fork safety
//! forbid a high-level spawning convenience that may rely on helper
//! threads, since the child must not depend on anything but itself
//! between `fork` and `exec`.

mod env;

use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::config::Config;
use crate::error::ExecError;
use crate::model::{Job, Run};
use crate::store::{PreviousRuns, Store};

/// Every signal the daemon handles and therefore must reset to default
/// disposition in the child before `exec`, so the child's own signal
/// handling (if any) starts from a clean slate rather than inheriting
/// the daemon's.
const HANDLED_SIGNALS: [libc::c_int; 5] = [
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGUSR1,
];

pub fn run_dir(data_dir: &Path, job_name: &str, run_id: &str) -> PathBuf {
    data_dir.join("runs").join(job_name).join(run_id)
}

/// Spawns the child for an admitted, running-row-already-written `run`.
/// On success returns the live [`Child`] handle; the caller (Scheduler
/// Loop) owns reaping it via non-blocking `try_wait`.
pub fn spawn(
    config: &Config,
    job: &Job,
    run: &Run,
    previous: &PreviousRuns,
    store: &dyn Store,
) -> Result<Child, ExecError> {
    let dir = run_dir(&config.data_dir, &job.name, &run.id);
    std::fs::create_dir_all(&dir).map_err(|e| ExecError::RunDirCreation(dir.display().to_string(), e))?;

    let output_path = dir.join("output.txt");
    let stdout_file = open_output(&output_path)?;
    let stderr_file = stdout_file.try_clone().map_err(|e| ExecError::OutputFileOpen(output_path.display().to_string(), e))?;

    let (env_map, cwd) = env::build(config, job, run, previous, &dir);

    let mut argv = job.command.clone();
    if job.command_append_run {
        argv.push(job.name.clone());
        argv.push(run.id.clone());
    }
    let (program, args) = argv.split_first().expect("job.command is non-empty, validated at config load");

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(env_map)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(stdout_file)
        .stderr(stderr_file);

    // Release this process's handle to the store before the child takes
    // over; a no-op for the SQLite backend (modern SQLite opens its file
    // descriptor O_CLOEXEC already) but required by the Store contract
    // for back-ends that hold a long-lived socket.
    store.child_close_resources();

    // SAFETY: this closure runs in the forked child between fork() and
    // exec(), before any Rust runtime state (other than this thread) is
    // valid. It calls only async-signal-safe libc functions: signal(2)
    // to restore default dispositions, setsid(2) to leave the daemon's
    // process group, and close(2) on a bounded fd range to drop any
    // descriptor inherited from the parent beyond stdio.
    unsafe {
        command.pre_exec(|| {
            for sig in HANDLED_SIGNALS {
                libc::signal(sig, libc::SIG_DFL);
            }
            // Become our own process-group leader so a SIGINT delivered
            // to the daemon's process group does not propagate to
            // grandchildren. Fails harmlessly (EPERM) if we already are
            // one; that is not an error worth aborting the run over.
            let _ = libc::setsid();

            let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(3) as i32;
            for fd in 3..max_fd {
                libc::close(fd);
            }
            Ok(())
        });
    }

    debug!(job = %job.name, run = %run.id, argv = ?argv, "spawning child");
    command.spawn().map_err(ExecError::Spawn)
}

fn open_output(path: &Path) -> Result<File, ExecError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ExecError::OutputFileOpen(path.display().to_string(), e))
}

/// POSIX exit-code convention: a process terminated by signal `N` is
/// reported as `128 + N`; otherwise its own exit status.
pub fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseDescriptor;
    use crate::store::SqliteStore;
    use chrono::Utc;
    use std::collections::HashMap;

    fn test_config(data_dir: PathBuf) -> Config {
        Config {
            jobs: HashMap::new(),
            concurrency_groups: HashMap::new(),
            data_dir,
            shutdown_kill_runs: false,
            shutdown_kill_grace: None,
            environment: HashMap::new(),
            database: DatabaseDescriptor::default(),
        }
    }

    fn no_previous() -> PreviousRuns {
        PreviousRuns {
            previous: None,
            previous_good: None,
            previous_bad: None,
        }
    }

    #[test]
    fn spawns_and_reaps_a_trivial_command() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path().to_path_buf());
        let job = Job {
            name: "echo-test".to_string(),
            command: vec!["/bin/echo".to_string(), "hello".to_string()],
            schedule: None,
            schedule_timezone: None,
            max_execution: None,
            max_execution_grace: std::time::Duration::from_secs(60),
            environment: HashMap::new(),
            render_reports: false,
            command_append_run: false,
            jenkins_environment: false,
            job_group: None,
            concurrent_runs: true,
            concurrency_groups: vec![],
        };
        let mut run = Run::new_scheduled("echo-test".to_string(), Utc::now());
        run.start_time = Some(Utc::now());

        let store = SqliteStore::open_in_memory().unwrap();
        let mut child = spawn(&cfg, &job, &run, &no_previous(), &store).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(exit_code_from_status(status), 0);

        let output = std::fs::read_to_string(run_dir(&cfg.data_dir, &job.name, &run.id).join("output.txt")).unwrap();
        assert!(output.contains("hello"));
    }

    #[test]
    fn command_append_run_adds_two_argv_elements() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path().to_path_buf());
        let job = Job {
            name: "argv-test".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "echo \"$@\"".to_string(), "--".to_string()],
            schedule: None,
            schedule_timezone: None,
            max_execution: None,
            max_execution_grace: std::time::Duration::from_secs(60),
            environment: HashMap::new(),
            render_reports: false,
            command_append_run: true,
            jenkins_environment: false,
            job_group: None,
            concurrent_runs: true,
            concurrency_groups: vec![],
        };
        let run = Run::new_scheduled("argv-test".to_string(), Utc::now());
        let store = SqliteStore::open_in_memory().unwrap();
        let mut child = spawn(&cfg, &job, &run, &no_previous(), &store).unwrap();
        let status = child.wait().unwrap();
        assert!(status.success());

        let output = std::fs::read_to_string(run_dir(&cfg.data_dir, &job.name, &run.id).join("output.txt")).unwrap();
        assert!(output.contains(&job.name));
        assert!(output.contains(&run.id));
    }

    #[test]
    fn exit_code_reports_signal_as_128_plus_n() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path().to_path_buf());
        let job = Job {
            name: "kill-test".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "kill -TERM $$".to_string()],
            schedule: None,
            schedule_timezone: None,
            max_execution: None,
            max_execution_grace: std::time::Duration::from_secs(60),
            environment: HashMap::new(),
            render_reports: false,
            command_append_run: false,
            jenkins_environment: false,
            job_group: None,
            concurrent_runs: true,
            concurrency_groups: vec![],
        };
        let run = Run::new_scheduled("kill-test".to_string(), Utc::now());
        let store = SqliteStore::open_in_memory().unwrap();
        let mut child = spawn(&cfg, &job, &run, &no_previous(), &store).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(exit_code_from_status(status), 128 + libc::SIGTERM);
    }
}
