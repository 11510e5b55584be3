//! Concurrency Admission: decides whether a ready run may start given
//! current per-group occupancy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::model::{ConcurrencyGroup, GroupName, Job, Run};

/// Why admission deferred a run, for the caller to compute the next
/// back-off wake-up from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    NotYetDue,
    JobAlreadyRunning,
    NoGroupCapacity,
}

pub enum Admission {
    Admit { group: Option<GroupName> },
    Defer(Deferral),
}

/// `running_groups`: current occupancy per concurrency group.
/// `job_running_count`: how many runs of this job are currently running.
pub fn evaluate(
    run: &Run,
    job: &Job,
    now: DateTime<Utc>,
    groups: &HashMap<GroupName, ConcurrencyGroup>,
    running_groups: &HashMap<GroupName, u32>,
    job_running_count: u32,
) -> Admission {
    if run.schedule_time > now {
        return Admission::Defer(Deferral::NotYetDue);
    }

    if !job.concurrent_runs && job_running_count > 0 {
        return Admission::Defer(Deferral::JobAlreadyRunning);
    }

    if job.concurrency_groups.is_empty() {
        return Admission::Admit { group: None };
    }

    let mut candidates: Vec<&GroupName> = job
        .concurrency_groups
        .iter()
        .filter(|name| {
            let max = groups.get(*name).map(|g| g.max).unwrap_or(1);
            let occupied = running_groups.get(*name).copied().unwrap_or(0);
            occupied < max
        })
        .collect();

    if candidates.is_empty() {
        return Admission::Defer(Deferral::NoGroupCapacity);
    }

    // Spread load fairly across groups sharing identical capacity.
    candidates.shuffle(&mut rand::thread_rng());
    Admission::Admit {
        group: Some(candidates[0].clone()),
    }
}

/// `backoff(a, b) = clamp(2^ln(b - a), 5s, 300s)` if `b > a`, else `5s`.
/// Natural logarithm, per the reference implementation (an Open Question
/// the distilled spec leaves unresolved; see DESIGN.md).
pub fn backoff_secs(schedule_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let delta = (now - schedule_time).num_milliseconds() as f64 / 1000.0;
    if delta <= 0.0 {
        return 5.0;
    }
    let raw = 2f64.powf(delta.ln());
    raw.clamp(5.0, 300.0)
}
