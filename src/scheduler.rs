//! Scheduler Loop: the heart of the daemon. Owns `scheduled_runs`,
//! `running_runs`, and `running_groups` exclusively; drives wake-ups,
//! reaps children, coordinates signal-driven reload/shutdown.
//!
//! Driven by `tokio::select!` over a fixed-interval ticker (created once,
//! outside the loop body — recreating it per-iteration would reset the
//! interval on every `select!` poll, the same pitfall the `oddjobs`
//! daemon example calls out), a command channel fed by [`crate::signals`],
//! and non-blocking reaping of live children.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::admission::{self, Admission, Deferral};
use crate::config::Config;
use crate::error::SchedulerdError;
use crate::exec;
use crate::model::{ConcurrencyGroup, GroupName, Job, JobName, Run};
use crate::recurrence;
use crate::signals::SchedulerCommand;
use crate::store::{FinishedRun, Store};
use crate::trigger;

/// Poll interval for the "sleep in small increments" idle phase and the
/// non-blocking child-reap loop; both are bounded by this, per §5's
/// "short sleeps (<=1s chunks) when idle, interruptible by any signal".
const TICK: StdDuration = StdDuration::from_millis(500);

struct RunningEntry {
    run: Run,
    child: Child,
}

/// Owns all mutable scheduler state. Constructed once per daemon
/// lifetime (or once per `--once` invocation); `run` drives it to
/// completion.
pub struct Scheduler {
    config: Config,
    config_path: Option<PathBuf>,
    store: Arc<dyn Store>,
    jobs: HashMap<JobName, Job>,
    groups: HashMap<GroupName, ConcurrencyGroup>,
    scheduled_runs: Vec<Run>,
    running: HashMap<String, RunningEntry>,
    running_groups: HashMap<GroupName, u32>,
    shutting_down: bool,
    shutdown_begin: Option<DateTime<Utc>>,
    command_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        store: Arc<dyn Store>,
        command_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    ) -> Self {
        let jobs = config.jobs.clone();
        let groups = config.concurrency_groups.clone();
        Scheduler {
            config,
            config_path,
            store,
            jobs,
            groups,
            scheduled_runs: Vec::new(),
            running: HashMap::new(),
            running_groups: HashMap::new(),
            shutting_down: false,
            shutdown_begin: None,
            command_rx,
        }
    }

    /// Startup sequence: clear the previous process's running rows (its
    /// owner is dead), then seed `scheduled_runs` from every job with a
    /// schedule.
    pub async fn initialize(&mut self) -> Result<(), SchedulerdError> {
        self.store.clear_running().await?;
        let now = Utc::now();
        for job in self.jobs.values() {
            if let Some(schedule) = &job.schedule {
                if let Some(next) = self.compute_next(schedule, &job.name, job.schedule_timezone.as_deref(), now)? {
                    self.scheduled_runs.push(Run::new_scheduled(job.name.clone(), next));
                }
            }
        }
        Ok(())
    }

    fn compute_next(
        &self,
        schedule: &str,
        name: &str,
        timezone: Option<&str>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerdError> {
        let tz: chrono_tz::Tz = timezone
            .unwrap_or("UTC")
            .parse()
            .unwrap_or(chrono_tz::UTC);
        match recurrence::next(schedule, name, &tz, after) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(job = name, error = %e, "schedule has no future occurrence or is invalid");
                Ok(None)
            }
        }
    }

    /// Runs the loop until shutdown completes. With `once = true`, performs
    /// iterations only until every currently-admissible/currently-running
    /// run has finished and no new work remains, then returns — used by
    /// `schedulerd --once` and by the end-to-end test scenarios.
    pub async fn run(&mut self, once: bool) -> Result<(), SchedulerdError> {
        loop {
            let iteration_start = Utc::now();
            let mut wakeups = vec![iteration_start + chrono::Duration::seconds(60)];

            if !self.shutting_down {
                self.intake_triggers();
            }

            self.admit_ready_runs(iteration_start, &mut wakeups);
            self.enforce_max_execution(iteration_start, &mut wakeups);

            if self.shutting_down {
                self.enforce_shutdown_escalation(iteration_start);
            }

            let next_wakeup = wakeups.into_iter().min().unwrap_or(iteration_start + chrono::Duration::seconds(60));

            if !self.running.is_empty() {
                self.wait_for_reap_or_wakeup(next_wakeup).await;
            } else if self.shutting_down {
                info!("all runs drained, shutting down");
                return Ok(());
            } else if once && self.scheduled_runs.is_empty() {
                return Ok(());
            } else {
                self.idle_sleep(next_wakeup).await;
            }

            self.drain_commands();
        }
    }

    fn intake_triggers(&mut self) {
        let job_names: Vec<JobName> = self.jobs.keys().cloned().collect();
        for name in job_names {
            match trigger::poll_job(&self.config.data_dir, &name) {
                Ok(Some(run)) => self.enqueue_triggered(run),
                Ok(None) => {}
                Err(e) => error!(job = %name, error = %e, "trigger intake IO error"),
            }
        }
    }

    fn enqueue_triggered(&mut self, run: Run) {
        let job = match self.jobs.get(&run.job_name) {
            Some(j) => j,
            None => {
                warn!(job = %run.job_name, "trigger fired for unknown job, dropping");
                return;
            }
        };
        if !job.concurrent_runs {
            if let Some(existing) = self
                .scheduled_runs
                .iter_mut()
                .find(|r| r.job_name == run.job_name && r.respawn)
            {
                let mut replacement = run;
                replacement.respawn = existing.respawn;
                *existing = replacement;
                return;
            }
        }
        self.scheduled_runs.push(run);
    }

    fn admit_ready_runs(&mut self, now: DateTime<Utc>, wakeups: &mut Vec<DateTime<Utc>>) {
        let mut indices: Vec<usize> = (0..self.scheduled_runs.len()).collect();
        indices.shuffle(&mut rand::thread_rng());

        let mut admitted_ids = Vec::new();
        for idx in indices {
            let run = &self.scheduled_runs[idx];
            let job = match self.jobs.get(&run.job_name) {
                Some(j) => j,
                None => continue,
            };
            let running_count = self
                .running
                .values()
                .filter(|e| e.run.job_name == run.job_name)
                .count() as u32;

            match admission::evaluate(run, job, now, &self.groups, &self.running_groups, running_count) {
                Admission::Admit { group } => admitted_ids.push((idx, group)),
                Admission::Defer(Deferral::NotYetDue) => {
                    wakeups.push(run.schedule_time);
                }
                Admission::Defer(Deferral::JobAlreadyRunning) | Admission::Defer(Deferral::NoGroupCapacity) => {
                    let backoff = admission::backoff_secs(run.schedule_time, now);
                    wakeups.push(now + chrono::Duration::milliseconds((backoff * 1000.0) as i64));
                }
            }
        }

        // Remove admitted runs highest-index-first so earlier indices stay valid.
        admitted_ids.sort_by(|a, b| b.0.cmp(&a.0));
        for (idx, group) in admitted_ids {
            let mut run = self.scheduled_runs.remove(idx);
            run.concurrency_group = group;
            self.start_run(run, now);
        }
    }

    fn start_run(&mut self, mut run: Run, now: DateTime<Utc>) {
        let job = match self.jobs.get(&run.job_name).cloned() {
            Some(j) => j,
            None => return,
        };
        run.start_time = Some(now);

        let previous = match futures_block_on_previous_runs(&self.store, &job.name) {
            Ok(p) => p,
            Err(e) => {
                error!(job = %job.name, error = %e, "store failure fetching previous runs, treating as fatal");
                return;
            }
        };
        run.previous_run = previous.previous.clone();
        run.previous_good_run = previous.previous_good.clone();
        run.previous_bad_run = previous.previous_bad.clone();

        if let Err(e) = futures_block_on_insert_running(&self.store, &run) {
            error!(job = %job.name, run = %run.id, error = %e, "failed to persist running row");
            return;
        }

        match exec::spawn(&self.config, &job, &run, &previous, self.store.as_ref()) {
            Ok(child) => {
                run.pid = Some(child.id() as i32);
                if let Some(group) = &run.concurrency_group {
                    *self.running_groups.entry(group.clone()).or_insert(0) += 1;
                }
                let respawn = run.respawn;
                if respawn {
                    if let Some(schedule) = &job.schedule {
                        if let Ok(Some(next)) =
                            self.compute_next(schedule, &job.name, job.schedule_timezone.as_deref(), now)
                        {
                            self.scheduled_runs.push(Run::new_scheduled(job.name.clone(), next));
                        }
                    }
                }
                self.running.insert(run.id.clone(), RunningEntry { run, child });
            }
            Err(e) => {
                error!(job = %job.name, run = %run.id, error = %e, "failed to spawn child");
            }
        }
    }

    fn enforce_max_execution(&mut self, now: DateTime<Utc>, wakeups: &mut Vec<DateTime<Utc>>) {
        for entry in self.running.values_mut() {
            let job = match self.jobs.get(&entry.run.job_name) {
                Some(j) => j,
                None => continue,
            };
            let Some(max_execution) = job.max_execution else {
                continue;
            };
            let start = entry.run.start_time.unwrap_or(now);
            let delta = now - start;
            let grace = chrono::Duration::from_std(job.max_execution_grace).unwrap_or_default();
            let max = chrono::Duration::from_std(max_execution).unwrap_or_default();

            if delta > max + grace && !entry.run.kill_sent {
                warn!(job = %job.name, run = %entry.run.id, "max_execution + grace exceeded, sending SIGKILL");
                send_signal(entry.run.pid, libc::SIGKILL);
                entry.run.kill_sent = true;
                wakeups.push(now + chrono::Duration::seconds(5));
            } else if delta > max && !entry.run.term_sent {
                warn!(job = %job.name, run = %entry.run.id, "max_execution exceeded, sending SIGTERM");
                send_signal(entry.run.pid, libc::SIGTERM);
                entry.run.term_sent = true;
                wakeups.push(now + grace);
            } else {
                wakeups.push(start + max);
            }
        }
    }

    fn enforce_shutdown_escalation(&mut self, now: DateTime<Utc>) {
        let begin = *self.shutdown_begin.get_or_insert(now);
        if self.config.shutdown_kill_runs {
            for entry in self.running.values_mut() {
                if !entry.run.term_sent {
                    send_signal(entry.run.pid, libc::SIGTERM);
                    entry.run.term_sent = true;
                }
            }
            if let Some(grace) = self.config.shutdown_kill_grace {
                let grace = chrono::Duration::from_std(grace).unwrap_or_default();
                if now >= begin + grace {
                    for entry in self.running.values_mut() {
                        if !entry.run.kill_sent {
                            send_signal(entry.run.pid, libc::SIGKILL);
                            entry.run.kill_sent = true;
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_reap_or_wakeup(&mut self, next_wakeup: DateTime<Utc>) {
        loop {
            self.reap_finished();
            if self.running.is_empty() {
                return;
            }
            if Utc::now() >= next_wakeup {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                Some(cmd) = self.command_rx.recv() => self.apply_command(cmd),
            }
            if Utc::now() >= next_wakeup {
                return;
            }
        }
    }

    async fn idle_sleep(&mut self, next_wakeup: DateTime<Utc>) {
        loop {
            let now = Utc::now();
            if now >= next_wakeup {
                return;
            }
            let remaining = (next_wakeup - now).to_std().unwrap_or(TICK).min(TICK);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                Some(cmd) = self.command_rx.recv() => {
                    self.apply_command(cmd);
                    return;
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.command_rx.try_recv() {
            self.apply_command(cmd);
        }
    }

    fn apply_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Shutdown => self.begin_shutdown(),
            SchedulerCommand::Reload => self.reload(),
            SchedulerCommand::Status => self.emit_status(),
            SchedulerCommand::Wake => {}
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("beginning shutdown");
        self.shutting_down = true;
        self.shutdown_begin = Some(Utc::now());
        self.scheduled_runs.clear();
        for entry in self.running.values_mut() {
            entry.run.respawn = false;
        }
    }

    fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            warn!("reload requested but no config path is known, ignoring");
            return;
        };
        let new_config = match Config::load(&path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to reload configuration, keeping existing jobs");
                return;
            }
        };
        info!("reloading configuration");
        self.jobs = new_config.jobs.clone();
        self.groups = new_config.concurrency_groups.clone();
        self.config = new_config;

        self.scheduled_runs.clear();
        let now = Utc::now();
        for job in self.jobs.values() {
            if let Some(schedule) = &job.schedule {
                if let Ok(Some(next)) = self.compute_next(schedule, &job.name, job.schedule_timezone.as_deref(), now) {
                    self.scheduled_runs.push(Run::new_scheduled(job.name.clone(), next));
                }
            }
        }

        for entry in self.running.values_mut() {
            match self.jobs.get(&entry.run.job_name) {
                Some(_job) => {}
                None => entry.run.respawn = false,
            }
        }
        self.running_groups.clear();
        for entry in self.running.values() {
            if let Some(group) = &entry.run.concurrency_group {
                *self.running_groups.entry(group.clone()).or_insert(0) += 1;
            }
        }
    }

    fn emit_status(&self) {
        let now = Utc::now();
        for entry in self.running.values() {
            let uptime = entry
                .run
                .start_time
                .map(|s| (now - s).num_seconds())
                .unwrap_or(0);
            info!(
                job = %entry.run.job_name,
                run = %entry.run.id,
                pid = ?entry.run.pid,
                uptime_secs = uptime,
                group = ?entry.run.concurrency_group,
                "status: running"
            );
        }
        for run in &self.scheduled_runs {
            let delta = (run.schedule_time - now).num_seconds();
            info!(job = %run.job_name, run = %run.id, fires_in_secs = delta, "status: scheduled");
        }
    }

    fn reap_finished(&mut self) {
        let mut finished_ids = Vec::new();
        for (id, entry) in self.running.iter_mut() {
            match entry.child.try_wait() {
                Ok(Some(_status)) => finished_ids.push(id.clone()),
                Ok(None) => {}
                Err(e) => {
                    error!(run = %id, error = %e, "error waiting on child");
                }
            }
        }

        for id in finished_ids {
            let Some(mut entry) = self.running.remove(&id) else { continue };
            let status = entry.child.try_wait().ok().flatten();
            let exit_code = status.map(exec::exit_code_from_status).unwrap_or(-1);
            entry.run.stop_time = Some(Utc::now());
            entry.run.exit_code = Some(exit_code);
            ingest_return_data(&self.config, &mut entry.run);

            let finished = FinishedRun::from_run(&entry.run);
            if let Err(e) = futures_block_on_insert_finished(&self.store, &finished) {
                error!(run = %id, error = %e, "store transient failure persisting finished run, treating as fatal");
            }

            if let Some(group) = &entry.run.concurrency_group {
                if let Some(count) = self.running_groups.get_mut(group) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }
}

fn send_signal(pid: Option<i32>, sig: libc::c_int) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) with a pid we observed as the live child of a
        // `std::process::Child` we still own; the signal values passed
        // in are always SIGTERM/SIGKILL.
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

fn ingest_return_data(config: &Config, run: &mut Run) {
    let path = exec::run_dir(&config.data_dir, &run.job_name, &run.id).join("return_data.json");
    if let Ok(text) = std::fs::read_to_string(&path) {
        if let Ok(serde_json::Value::Object(data)) = serde_json::from_str(&text) {
            run.run_data.insert("return_data".to_string(), serde_json::Value::Object(data));
        }
    }
}

// The Store trait is async (to keep the pluggable-backend contract
// uniform across SQL and future non-SQL back-ends) but the scheduler
// loop's hot path is otherwise synchronous per §5 ("Store queries are
// expected to be small and synchronous"); these helpers block on the
// current-thread runtime just long enough to await the query, never
// spawning a new task or leaving the single-threaded admission phase.
fn futures_block_on_previous_runs(
    store: &Arc<dyn Store>,
    job_name: &str,
) -> Result<crate::store::PreviousRuns, SchedulerdError> {
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(store.previous_runs(job_name))
    })
    .map_err(SchedulerdError::Store)
}

fn futures_block_on_insert_running(store: &Arc<dyn Store>, run: &Run) -> Result<(), SchedulerdError> {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(store.insert_running(run)))
        .map_err(SchedulerdError::Store)
}

fn futures_block_on_insert_finished(store: &Arc<dyn Store>, run: &FinishedRun) -> Result<(), SchedulerdError> {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(store.insert_finished(run)))
        .map_err(SchedulerdError::Store)
}
