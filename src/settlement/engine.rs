use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{SettlementBroadcaster, SettlementEvent};
use super::outcome::PayoutPolicy;
use crate::error::{AppError, AppResult, TradeError};
use crate::ledger::models::{Round, RoundStatus};
use crate::ledger::store::LedgerStore;
use crate::oracle::{price_within, PriceOracle};
use crate::rounds::Clock;

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled(SettlementEvent),
    /// Another settler got there first, or the round was voided
    AlreadySettled,
    /// The window (plus grace) has not passed yet; nothing was touched
    NotDue,
}

/// Counts for one pass over the due rounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementSummary {
    pub settled: usize,
    pub already_settled: usize,
    pub not_due: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: PayoutPolicy,
    /// Delay after `end_time` before a round is considered due
    pub grace: ChronoDuration,
    pub oracle_timeout: Duration,
    /// How long a due round may stay unsettled before an operator alert
    pub stale_after: ChronoDuration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: PayoutPolicy::default(),
            grace: ChronoDuration::seconds(2),
            oracle_timeout: Duration::from_secs(3),
            stale_after: ChronoDuration::seconds(60),
        }
    }
}

/// Closes rounds: looks up the close price and resolves every pending trade
/// in one atomic unit. Safe to run from any number of processes.
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<SettlementBroadcaster>,
    settings: EngineSettings,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<SettlementBroadcaster>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            oracle,
            clock,
            broadcaster,
            settings,
        }
    }

    /// Settle every pending round whose window (plus grace) has passed. One
    /// failing round never blocks the others; it stays pending for the next pass.
    pub async fn settle_due_rounds(&self, now: DateTime<Utc>) -> AppResult<SettlementSummary> {
        let due = self.store.due_rounds(now - self.settings.grace).await?;
        let mut summary = SettlementSummary::default();

        if due.is_empty() {
            return Ok(summary);
        }
        debug!(count = due.len(), "Settling due rounds");

        for round in due {
            match self.settle_at(round.id, now).await {
                Ok(SettleOutcome::Settled(_)) => summary.settled += 1,
                Ok(SettleOutcome::AlreadySettled) => summary.already_settled += 1,
                Ok(SettleOutcome::NotDue) => summary.not_due += 1,
                Err(e) => {
                    summary.failed += 1;
                    self.report_failure(&round, now, &e);
                }
            }
        }

        if summary.failed > 0 {
            warn!(
                settled = summary.settled,
                failed = summary.failed,
                "⚠️ Settlement pass finished with failures"
            );
        }
        Ok(summary)
    }

    /// Settle a single round. Not pending, or not yet due, means nothing to do.
    pub async fn settle_one(&self, round_id: Uuid) -> AppResult<SettleOutcome> {
        self.settle_at(round_id, self.clock.now()).await
    }

    async fn settle_at(&self, round_id: Uuid, now: DateTime<Utc>) -> AppResult<SettleOutcome> {
        let round = self
            .store
            .get_round(round_id)
            .await?
            .ok_or(TradeError::RoundNotFound(round_id))?;
        if round.status != RoundStatus::Pending {
            return Ok(SettleOutcome::AlreadySettled);
        }
        if !round.is_due(now, self.settings.grace) {
            debug!(%round_id, end_time = %round.end_time, "Round not due yet");
            return Ok(SettleOutcome::NotDue);
        }

        let close_price = price_within(
            self.oracle.as_ref(),
            &round.symbol,
            round.end_time,
            self.settings.oracle_timeout,
        )
        .await?;

        let report = self
            .store
            .settle_round(round_id, close_price, self.clock.now(), &self.settings.policy)
            .await?;

        match report {
            Some(report) => {
                let event = SettlementEvent::from(&report);
                info!(
                    %round_id,
                    symbol = %round.symbol,
                    %close_price,
                    trades = event.outcomes.len(),
                    "✅ Round settled"
                );
                self.broadcaster.publish(event.clone());
                Ok(SettleOutcome::Settled(event))
            }
            None => {
                debug!(%round_id, "Round settled concurrently");
                Ok(SettleOutcome::AlreadySettled)
            }
        }
    }

    /// Close a round without a price and refund every pending stake.
    /// For rounds the oracle can never price.
    pub async fn void_round(&self, round_id: Uuid) -> AppResult<SettleOutcome> {
        let report = self
            .store
            .void_round(round_id, self.clock.now(), &self.settings.policy)
            .await?;

        match report {
            Some(report) => {
                let event = SettlementEvent::from(&report);
                warn!(
                    %round_id,
                    symbol = %report.round.symbol,
                    refunded = event.outcomes.len(),
                    "🛑 Round voided by operator"
                );
                self.broadcaster.publish(event.clone());
                Ok(SettleOutcome::Settled(event))
            }
            None => Ok(SettleOutcome::AlreadySettled),
        }
    }

    fn report_failure(&self, round: &Round, now: DateTime<Utc>, reason: &AppError) {
        let overdue = now - (round.end_time + self.settings.grace);
        if overdue > self.settings.stale_after || !reason.is_retryable() {
            error!(
                round_id = %round.id,
                symbol = %round.symbol,
                end_time = %round.end_time,
                overdue_secs = overdue.num_seconds(),
                "🚨 Round still unsettled: {}",
                reason
            );
        } else {
            warn!(
                round_id = %round.id,
                symbol = %round.symbol,
                "❌ Settlement failed, will retry: {}",
                reason
            );
        }
    }
}
