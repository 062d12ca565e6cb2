//! Idle reaper.
//!
//! Every tick, stops supervisors that are Ready, unborrowed, and idle past
//! their descriptor's timeout. Finished (Failed/Stopped) entries are dropped
//! from the gateway map on the same pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatcher::GatewayState;
use super::supervisor::State;

/// Run one sweep at `now`. Returns the ids that were stopped.
pub async fn sweep(state: &GatewayState, now: Instant) -> Vec<String> {
    let supervisors = state.snapshot();

    for supervisor in &supervisors {
        if matches!(supervisor.state(), State::Failed | State::Stopped) {
            state.remove_if_same(supervisor);
        }
    }

    let idle: Vec<_> = supervisors
        .iter()
        .filter(|s| s.try_begin_idle_stop(now))
        .collect();
    if idle.is_empty() {
        return Vec::new();
    }

    futures::future::join_all(idle.iter().map(|s| s.complete_stop())).await;

    idle.iter()
        .map(|supervisor| {
            state.remove_if_same(supervisor);
            tracing::info!(backend = %supervisor.id(), "stopped idle backend");
            supervisor.id().to_string()
        })
        .collect()
}

/// Owns the background reaper task. Dropping the handle stops it.
#[derive(Debug)]
pub struct ReaperHandle {
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for an in-progress sweep to be cancelled.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start sweeping `state` every `interval`. The first sweep runs one
/// interval after start.
pub fn spawn_reaper(state: Arc<GatewayState>, interval: Duration) -> ReaperHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let now = ticker.tick().await;
            let stopped = sweep(&state, now).await;
            if !stopped.is_empty() {
                tracing::debug!(stopped = ?stopped, live = state.len(), "reaper sweep");
            }
        }
    });
    ReaperHandle { task: Some(task) }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
