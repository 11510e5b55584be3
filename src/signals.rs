//! Signal Handler: a thin adapter translating OS signals into state
//! transitions on the scheduler. Per the Design Notes, the handler
//! itself holds no scheduler state — it only writes to a small command
//! channel and a shutdown `Notify`, consumed by the Scheduler Loop at
//! its next phase boundary.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

/// The five signals the daemon handles, mapped to effects per the
/// distilled spec's §4.7 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// INT or TERM: enter shutdown.
    Shutdown,
    /// HUP: reload config and reset jobs.
    Reload,
    /// QUIT: emit a status snapshot.
    Status,
    /// USR1: no-op; only wakes the loop from sleep.
    Wake,
}

/// Installs handlers for INT, TERM, HUP, QUIT, USR1 and forwards each as a
/// [`SchedulerCommand`] on `tx`. Sending on the channel is itself what
/// wakes the loop's `tokio::select!` promptly (`next_wakeup := now`, per
/// spec) — no separate notification primitive is needed. Runs until the
/// receiving end is dropped.
pub async fn install(tx: mpsc::UnboundedSender<SchedulerCommand>) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        let cmd = tokio::select! {
            _ = sigint.recv() => { info!("received SIGINT"); SchedulerCommand::Shutdown }
            _ = sigterm.recv() => { info!("received SIGTERM"); SchedulerCommand::Shutdown }
            _ = sighup.recv() => { info!("received SIGHUP"); SchedulerCommand::Reload }
            _ = sigquit.recv() => { info!("received SIGQUIT"); SchedulerCommand::Status }
            _ = sigusr1.recv() => { SchedulerCommand::Wake }
        };
        if tx.send(cmd).is_err() {
            break;
        }
    }
    Ok(())
}
