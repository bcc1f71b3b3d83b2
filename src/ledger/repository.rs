use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::{LedgerStore, SettlementReport};
use crate::error::{AppError, AppResult, LedgerError, TradeError};
use crate::rounds::RoundWindow;
use crate::settlement::outcome::{PayoutPolicy, TradeResolution};

const ROUND_COLUMNS: &str =
    "id, symbol, start_time, end_time, close_price, status, created_at, settled_at";

const TRADE_COLUMNS: &str = "id, account_id, round_id, symbol, direction, amount, entry_price, \
     status, payout, close_price, close_time, created_at";

const BALANCE_COLUMNS: &str = "account_id, available, at_risk, updated_at";

/// Ledger repository - THE source of truth for rounds, trades and balances
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn available_of(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> AppResult<Decimal> {
        let available: Option<Decimal> =
            sqlx::query_scalar("SELECT available FROM balances WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(available.unwrap_or(Decimal::ZERO))
    }

    /// Terminal status on the trade plus the matching balance increments.
    /// Both statements are guarded so a trade is never resolved twice.
    async fn apply_resolution(
        tx: &mut Transaction<'_, Postgres>,
        trade: &Trade,
        resolution: TradeResolution,
        close_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> AppResult<Trade> {
        let resolved = sqlx::query_as::<_, Trade>(&format!(
            r#"
            UPDATE trades
            SET status = $2, payout = $3, close_price = $4, close_time = $5
            WHERE id = $1 AND status = $6
            RETURNING {TRADE_COLUMNS}
            "#
        ))
        .bind(trade.id)
        .bind(resolution.status)
        .bind(resolution.payout)
        .bind(close_price)
        .bind(at)
        .bind(TradeStatus::Pending)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::Internal(format!("Trade {} is no longer pending", trade.id)))?;

        let result = sqlx::query(
            r#"
            UPDATE balances
            SET available = available + $2, at_risk = at_risk - $3, updated_at = $4
            WHERE account_id = $1
            "#,
        )
        .bind(trade.account_id)
        .bind(resolution.credit)
        .bind(resolution.release)
        .bind(at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(format!(
                "No balance row for account {} holding trade {}",
                trade.account_id, trade.id
            )));
        }

        Ok(resolved)
    }

    /// Status-guarded close of a round and all of its pending trades, in one
    /// transaction. A concurrent settler blocks on the round row and then sees
    /// it already settled.
    async fn finish_round<F>(
        &self,
        round_id: Uuid,
        close_price: Option<Decimal>,
        at: DateTime<Utc>,
        resolve: F,
    ) -> AppResult<Option<SettlementReport>>
    where
        F: Fn(&Trade) -> TradeResolution + Send + Sync,
    {
        let mut tx = self.pool.begin().await?;

        let round = sqlx::query_as::<_, Round>(&format!(
            r#"
            UPDATE rounds
            SET status = $2, close_price = $3, settled_at = $4
            WHERE id = $1 AND status = $5
            RETURNING {ROUND_COLUMNS}
            "#
        ))
        .bind(round_id)
        .bind(RoundStatus::Settled)
        .bind(close_price)
        .bind(at)
        .bind(RoundStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?;

        let round = match round {
            Some(round) => round,
            None => {
                tx.rollback().await?;
                return match self.get_round(round_id).await? {
                    Some(_) => {
                        debug!(%round_id, "Round already settled by another worker");
                        Ok(None)
                    }
                    None => Err(TradeError::RoundNotFound(round_id).into()),
                };
            }
        };

        let pending = sqlx::query_as::<_, Trade>(&format!(
            r#"
            SELECT {TRADE_COLUMNS}
            FROM trades
            WHERE round_id = $1 AND status = $2
            ORDER BY account_id, id
            FOR UPDATE
            "#
        ))
        .bind(round_id)
        .bind(TradeStatus::Pending)
        .fetch_all(&mut *tx)
        .await?;

        let mut trades = Vec::with_capacity(pending.len());
        for trade in &pending {
            let resolution = resolve(trade);
            trades.push(Self::apply_resolution(&mut tx, trade, resolution, close_price, at).await?);
        }

        tx.commit().await?;

        info!(
            %round_id,
            symbol = %round.symbol,
            trades = trades.len(),
            "Round closed"
        );

        Ok(Some(SettlementReport { round, trades }))
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== ROUND OPERATIONS ==========

    async fn insert_round_if_absent(
        &self,
        symbol: &str,
        window: RoundWindow,
        now: DateTime<Utc>,
    ) -> AppResult<Round> {
        let candidate = Round::new(symbol, window, now);

        let inserted = sqlx::query_as::<_, Round>(&format!(
            r#"
            INSERT INTO rounds (id, symbol, start_time, end_time, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (symbol, start_time, end_time) DO NOTHING
            RETURNING {ROUND_COLUMNS}
            "#
        ))
        .bind(candidate.id)
        .bind(&candidate.symbol)
        .bind(candidate.start_time)
        .bind(candidate.end_time)
        .bind(RoundStatus::Pending)
        .bind(candidate.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(round) = inserted {
            info!(
                round_id = %round.id,
                symbol = %round.symbol,
                start = %round.start_time,
                end = %round.end_time,
                "Round opened"
            );
            return Ok(round);
        }

        // Lost the race (or the round already existed): read the winner
        self.find_round(symbol, window).await?.ok_or_else(|| {
            AppError::Internal(format!(
                "Round {} [{}, {}) vanished after conflicting insert",
                symbol, window.start, window.end
            ))
        })
    }

    async fn get_round(&self, round_id: Uuid) -> AppResult<Option<Round>> {
        let round = sqlx::query_as::<_, Round>(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE id = $1"
        ))
        .bind(round_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(round)
    }

    async fn find_round(&self, symbol: &str, window: RoundWindow) -> AppResult<Option<Round>> {
        let round = sqlx::query_as::<_, Round>(&format!(
            r#"
            SELECT {ROUND_COLUMNS}
            FROM rounds
            WHERE symbol = $1 AND start_time = $2 AND end_time = $3
            "#
        ))
        .bind(symbol)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(round)
    }

    async fn due_rounds(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Round>> {
        let rounds = sqlx::query_as::<_, Round>(&format!(
            r#"
            SELECT {ROUND_COLUMNS}
            FROM rounds
            WHERE status = $1 AND end_time <= $2
            ORDER BY end_time, symbol
            "#
        ))
        .bind(RoundStatus::Pending)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rounds)
    }

    // ========== TRADE OPERATIONS ==========

    async fn open_trade(&self, new_trade: NewTrade, now: DateTime<Utc>) -> AppResult<Trade> {
        let mut tx = self.pool.begin().await?;

        // Shared lock: placement may run alongside other placements, but not
        // alongside the settlement that closes this round
        let round = sqlx::query_as::<_, Round>(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE id = $1 FOR SHARE"
        ))
        .bind(new_trade.round_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TradeError::RoundNotFound(new_trade.round_id))?;

        if !round.is_open_at(now) {
            tx.rollback().await?;
            return Err(round.rejection_at(now).into());
        }

        let reserved = sqlx::query(
            r#"
            UPDATE balances
            SET available = available - $2, at_risk = at_risk + $2, updated_at = $3
            WHERE account_id = $1 AND available >= $2
            "#,
        )
        .bind(new_trade.account_id)
        .bind(new_trade.amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            let available = Self::available_of(&mut tx, new_trade.account_id).await?;
            tx.rollback().await?;
            return Err(LedgerError::InsufficientFunds {
                account_id: new_trade.account_id,
                required: new_trade.amount,
                available,
            }
            .into());
        }

        let candidate = new_trade.into_trade(&round.symbol, now);
        let trade = sqlx::query_as::<_, Trade>(&format!(
            r#"
            INSERT INTO trades (id, account_id, round_id, symbol, direction, amount, entry_price, status, payout, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {TRADE_COLUMNS}
            "#
        ))
        .bind(candidate.id)
        .bind(candidate.account_id)
        .bind(candidate.round_id)
        .bind(&candidate.symbol)
        .bind(candidate.direction)
        .bind(candidate.amount)
        .bind(candidate.entry_price)
        .bind(candidate.status)
        .bind(candidate.payout)
        .bind(candidate.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(trade)
    }

    async fn get_trade(&self, trade_id: Uuid) -> AppResult<Option<Trade>> {
        let trade = sqlx::query_as::<_, Trade>(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE id = $1"
        ))
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(trade)
    }

    async fn round_trades(&self, round_id: Uuid) -> AppResult<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE round_id = $1 ORDER BY created_at, id"
        ))
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(trades)
    }

    // ========== SETTLEMENT OPERATIONS ==========

    async fn settle_round(
        &self,
        round_id: Uuid,
        close_price: Decimal,
        settled_at: DateTime<Utc>,
        policy: &PayoutPolicy,
    ) -> AppResult<Option<SettlementReport>> {
        let policy = *policy;
        self.finish_round(round_id, Some(close_price), settled_at, move |trade| {
            policy.resolve(trade, close_price)
        })
        .await
    }

    async fn void_round(
        &self,
        round_id: Uuid,
        voided_at: DateTime<Utc>,
        policy: &PayoutPolicy,
    ) -> AppResult<Option<SettlementReport>> {
        let policy = *policy;
        self.finish_round(round_id, None, voided_at, move |trade| policy.cancel(trade))
            .await
    }

    // ========== BALANCE OPERATIONS ==========

    async fn credit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance> {
        let balance = sqlx::query_as::<_, AccountBalance>(&format!(
            r#"
            INSERT INTO balances (account_id, available, at_risk, updated_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (account_id) DO UPDATE
            SET available = balances.available + EXCLUDED.available, updated_at = NOW()
            RETURNING {BALANCE_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }

    async fn debit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance> {
        let balance = sqlx::query_as::<_, AccountBalance>(&format!(
            r#"
            UPDATE balances
            SET available = available - $2, updated_at = NOW()
            WHERE account_id = $1 AND available >= $2
            RETURNING {BALANCE_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        match balance {
            Some(balance) => Ok(balance),
            None => Err(LedgerError::InsufficientFunds {
                account_id,
                required: amount,
                available: self.balance(account_id).await?.available,
            }
            .into()),
        }
    }

    async fn balance(&self, account_id: Uuid) -> AppResult<AccountBalance> {
        let balance = sqlx::query_as::<_, AccountBalance>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE account_id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.unwrap_or_else(|| AccountBalance::empty(account_id, Utc::now())))
    }
}
