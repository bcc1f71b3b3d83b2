use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::{AccountBalance, NewTrade, Round, Trade};
use crate::error::AppResult;
use crate::rounds::RoundWindow;
use crate::settlement::outcome::PayoutPolicy;

/// A round that was settled (or voided) together with the trades it resolved
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub round: Round,
    pub trades: Vec<Trade>,
}

/// Durable rounds, trades and balances.
///
/// Every method is one atomic unit. Balance mutations are relative increments
/// against the stored value, so concurrent placement, settlement, deposit and
/// withdrawal never lose an update.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== ROUNDS ==========

    /// Return the round for `(symbol, window)`, creating it as pending if it
    /// does not exist yet. Concurrent callers converge on the same row.
    async fn insert_round_if_absent(
        &self,
        symbol: &str,
        window: RoundWindow,
        now: DateTime<Utc>,
    ) -> AppResult<Round>;

    async fn get_round(&self, round_id: Uuid) -> AppResult<Option<Round>>;

    async fn find_round(&self, symbol: &str, window: RoundWindow) -> AppResult<Option<Round>>;

    /// Pending rounds whose window ended at or before `cutoff`, oldest first
    async fn due_rounds(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Round>>;

    // ========== TRADES ==========

    /// Reserve the stake and record a pending trade. Fails with
    /// `RoundNotFound`, `RoundClosed` or `InsufficientFunds` without mutating
    /// anything.
    async fn open_trade(&self, trade: NewTrade, now: DateTime<Utc>) -> AppResult<Trade>;

    async fn get_trade(&self, trade_id: Uuid) -> AppResult<Option<Trade>>;

    async fn round_trades(&self, round_id: Uuid) -> AppResult<Vec<Trade>>;

    // ========== SETTLEMENT ==========

    /// Mark the round settled at `close_price` and resolve all of its pending
    /// trades. Returns `None` when the round was no longer pending.
    async fn settle_round(
        &self,
        round_id: Uuid,
        close_price: Decimal,
        settled_at: DateTime<Utc>,
        policy: &PayoutPolicy,
    ) -> AppResult<Option<SettlementReport>>;

    /// Settle the round without a price, cancelling and refunding every
    /// pending trade. Returns `None` when the round was no longer pending.
    async fn void_round(
        &self,
        round_id: Uuid,
        voided_at: DateTime<Utc>,
        policy: &PayoutPolicy,
    ) -> AppResult<Option<SettlementReport>>;

    // ========== BALANCES ==========

    /// `available += amount`, creating the balance row on first use
    async fn credit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance>;

    /// `available -= amount` if `available >= amount`, else `InsufficientFunds`
    async fn debit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance>;

    async fn balance(&self, account_id: Uuid) -> AppResult<AccountBalance>;
}
