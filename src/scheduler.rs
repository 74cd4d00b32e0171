//! Interval runner.
//!
//! Runs one cycle at a time, then waits for the interval in short ticks so a
//! shutdown request is noticed promptly. On cancellation no new cycle
//! starts; a cycle already applying finishes its in-flight record
//! operations, and the state is saved once more before returning.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{CycleOutcome, Engine};
use crate::state::SyncState;

/// Periodic driver around an [`Engine`].
pub struct Scheduler<'a> {
    engine: &'a Engine,
    interval: Duration,
    tick: Duration,
}

impl<'a> Scheduler<'a> {
    pub fn new(engine: &'a Engine, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            tick: Duration::from_secs(1),
        }
    }

    /// Granularity of the interval wait.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until `cancel` fires. Returns the final state.
    pub async fn run(&self, cancel: CancellationToken) -> SyncState {
        let mut state = self.engine.load_state();
        let mut cycles = 0u64;

        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        while !cancel.is_cancelled() {
            cycles += 1;
            if let CycleOutcome::Aborted { phase, reason } = self.engine.run_cycle(&mut state, &cancel).await {
                info!(cycle = cycles, ?phase, reason = %reason, "cycle aborted, retrying next interval");
            }

            if !self.wait(&cancel).await {
                break;
            }
        }

        info!(cycles, "shutting down, saving final state");
        self.engine.persist(&state);
        state
    }

    /// Wait one interval. Returns `false` if cancelled first.
    async fn wait(&self, cancel: &CancellationToken) -> bool {
        let tick = self.tick.max(Duration::from_millis(1));
        let mut remaining = self.interval;
        while !remaining.is_zero() {
            let step = remaining.min(tick);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(step) => {}
            }
            remaining = remaining.saturating_sub(step);
        }
        !cancel.is_cancelled()
    }
}
