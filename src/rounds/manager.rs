use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::window::{Clock, RoundWindow};
use crate::error::AppResult;
use crate::ledger::models::Round;
use crate::ledger::store::LedgerStore;

/// Countdown payload for clients. `server_time` lets them correct their own
/// clock skew instead of trusting local time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRound {
    pub round_id: Uuid,
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub server_time: DateTime<Utc>,
    pub remaining_ms: i64,
}

/// Keeps one pending round per symbol for the window containing "now"
pub struct RoundManager {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    symbols: Vec<String>,
    round_duration_ms: i64,
}

impl RoundManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        symbols: Vec<String>,
        round_duration_ms: i64,
    ) -> Self {
        Self {
            store,
            clock,
            symbols,
            round_duration_ms,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn window_at(&self, now: DateTime<Utc>) -> RoundWindow {
        RoundWindow::containing(now, self.round_duration_ms)
    }

    /// Round for `symbol` containing the current instant, created if absent
    pub async fn ensure_current_round(&self, symbol: &str) -> AppResult<Round> {
        self.ensure_round_at(symbol, self.clock.now()).await
    }

    /// Round for `symbol` containing `now`, which must be the clock's current
    /// instant. Existing rounds are returned as stored; a concurrent creator
    /// winning the insert is not an error.
    async fn ensure_round_at(&self, symbol: &str, now: DateTime<Utc>) -> AppResult<Round> {
        let window = self.window_at(now);
        if let Some(round) = self.store.find_round(symbol, window).await? {
            return Ok(round);
        }

        debug!(symbol, start = %window.start, end = %window.end, "Creating round");
        self.store.insert_round_if_absent(symbol, window, now).await
    }

    /// `ensure_current_round` for every configured symbol
    pub async fn ensure_current_rounds(&self) -> AppResult<Vec<Round>> {
        let now = self.clock.now();
        let mut rounds = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            rounds.push(self.ensure_round_at(symbol, now).await?);
        }
        Ok(rounds)
    }

    /// Countdown view for the current instant. `None` until the scheduler has
    /// opened the round.
    pub async fn current_round(&self, symbol: &str) -> AppResult<Option<CurrentRound>> {
        self.current_round_at(symbol, self.clock.now()).await
    }

    /// Stored round containing `now`, with `now` reported as the server time.
    /// Never writes.
    pub async fn current_round_at(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<CurrentRound>> {
        let window = self.window_at(now);
        let round = self.store.find_round(symbol, window).await?;

        Ok(round.map(|round| CurrentRound {
            round_id: round.id,
            symbol: round.symbol.clone(),
            start_time: round.start_time,
            end_time: round.end_time,
            server_time: now,
            remaining_ms: round.window().remaining_ms(now),
        }))
    }
}
