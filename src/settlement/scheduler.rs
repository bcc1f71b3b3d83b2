// Settlement scheduler - keeps rounds open and settles the ones that closed
//
// Every tick:
// - make sure the current window has a pending round per symbol
// - settle every round whose window plus grace has passed
//
// Ticks are independent. Several processes can run this loop against the same
// database; the store's guarded updates keep settlement exactly-once.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::engine::{SettlementEngine, SettlementSummary};
use crate::error::AppResult;
use crate::rounds::{Clock, RoundManager};

/// Settlement schedule configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Must be shorter than the round duration
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
        }
    }
}

pub struct SettlementScheduler {
    config: SchedulerConfig,
    rounds: Arc<RoundManager>,
    engine: Arc<SettlementEngine>,
    clock: Arc<dyn Clock>,
}

/// Running scheduler. Dropping it leaves the loop running; call `stop`.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for the in-flight tick to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("❌ Settlement scheduler task failed: {:?}", e);
        }
        info!("🛑 Settlement scheduler stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl SettlementScheduler {
    pub fn new(
        config: SchedulerConfig,
        rounds: Arc<RoundManager>,
        engine: Arc<SettlementEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            rounds,
            engine,
            clock,
        }
    }

    /// Start the settlement scheduler (runs in background)
    pub fn start(self) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "⏰ Settlement scheduler started (every {}ms, symbols: {})",
                self.config.tick_interval.as_millis(),
                self.rounds.symbols().join(",")
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_tick().await {
                            error!("❌ Settlement tick failed: {}", e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        SchedulerHandle { shutdown, task }
    }

    /// One pass: open current rounds, then settle the due ones
    pub async fn run_tick(&self) -> AppResult<SettlementSummary> {
        if let Err(e) = self.rounds.ensure_current_rounds().await {
            // Settlement of older rounds does not depend on the new ones
            error!("❌ Failed to open current rounds: {}", e);
        }

        let summary = self.engine.settle_due_rounds(self.clock.now()).await?;
        if summary.settled > 0 {
            debug!(
                settled = summary.settled,
                already_settled = summary.already_settled,
                failed = summary.failed,
                "Settlement tick"
            );
        }
        Ok(summary)
    }
}
