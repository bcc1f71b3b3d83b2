use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::store::{LedgerStore, SettlementReport};
use crate::error::{AppResult, LedgerError, TradeError};
use crate::rounds::RoundWindow;
use crate::settlement::outcome::{PayoutPolicy, TradeResolution};

type RoundKey = (String, DateTime<Utc>, DateTime<Utc>);

#[derive(Default)]
struct LedgerState {
    rounds: HashMap<Uuid, Round>,
    round_index: HashMap<RoundKey, Uuid>,
    trades: HashMap<Uuid, Trade>,
    balances: HashMap<Uuid, AccountBalance>,
}

impl LedgerState {
    fn balance_mut(&mut self, account_id: Uuid, now: DateTime<Utc>) -> &mut AccountBalance {
        self.balances
            .entry(account_id)
            .or_insert_with(|| AccountBalance::empty(account_id, now))
    }

    /// Pending trades of a round in account order, the order balances are touched in
    fn pending_trade_ids(&self, round_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<(Uuid, Uuid)> = self
            .trades
            .values()
            .filter(|t| t.round_id == round_id && !t.status.is_terminal())
            .map(|t| (t.account_id, t.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Apply a resolution to one trade and its owner's balance
    fn apply(
        &mut self,
        trade_id: Uuid,
        resolution: TradeResolution,
        close_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Option<Trade> {
        let trade = self.trades.get_mut(&trade_id)?;
        trade.status = resolution.status;
        trade.payout = resolution.payout;
        trade.close_price = close_price;
        trade.close_time = Some(at);
        let resolved = trade.clone();

        let balance = self.balance_mut(resolved.account_id, at);
        balance.available += resolution.credit;
        balance.at_risk -= resolution.release;
        balance.updated_at = at;

        Some(resolved)
    }
}

/// In-process ledger. Each operation holds one lock for its whole atomic
/// unit, mirroring the transactional guarantees of the Postgres repository.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rounds, across all symbols
    pub fn round_count(&self) -> usize {
        self.state.lock().rounds.len()
    }

    fn finish_round(
        &self,
        round_id: Uuid,
        close_price: Option<Decimal>,
        at: DateTime<Utc>,
        resolve: impl Fn(&Trade) -> TradeResolution,
    ) -> AppResult<Option<SettlementReport>> {
        let mut state = self.state.lock();

        match state.rounds.get(&round_id) {
            None => return Err(TradeError::RoundNotFound(round_id).into()),
            Some(round) if round.status != RoundStatus::Pending => return Ok(None),
            Some(_) => {}
        }

        let mut resolved = Vec::new();
        for trade_id in state.pending_trade_ids(round_id) {
            let resolution = match state.trades.get(&trade_id) {
                Some(trade) => resolve(trade),
                None => continue,
            };
            if let Some(trade) = state.apply(trade_id, resolution, close_price, at) {
                resolved.push(trade);
            }
        }

        let round = match state.rounds.get_mut(&round_id) {
            Some(round) => round,
            None => return Err(TradeError::RoundNotFound(round_id).into()),
        };
        round.status = RoundStatus::Settled;
        round.close_price = close_price;
        round.settled_at = Some(at);

        Ok(Some(SettlementReport {
            round: round.clone(),
            trades: resolved,
        }))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn insert_round_if_absent(
        &self,
        symbol: &str,
        window: RoundWindow,
        now: DateTime<Utc>,
    ) -> AppResult<Round> {
        let mut state = self.state.lock();
        let key = (symbol.to_string(), window.start, window.end);

        if let Some(existing) = state.round_index.get(&key).and_then(|id| state.rounds.get(id)) {
            return Ok(existing.clone());
        }

        let round = Round::new(symbol, window, now);
        state.round_index.insert(key, round.id);
        state.rounds.insert(round.id, round.clone());
        Ok(round)
    }

    async fn get_round(&self, round_id: Uuid) -> AppResult<Option<Round>> {
        Ok(self.state.lock().rounds.get(&round_id).cloned())
    }

    async fn find_round(&self, symbol: &str, window: RoundWindow) -> AppResult<Option<Round>> {
        let state = self.state.lock();
        let key = (symbol.to_string(), window.start, window.end);
        Ok(state
            .round_index
            .get(&key)
            .and_then(|id| state.rounds.get(id))
            .cloned())
    }

    async fn due_rounds(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Round>> {
        let state = self.state.lock();
        let mut due: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.is_due(cutoff, chrono::Duration::zero()))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.symbol.cmp(&b.symbol)));
        Ok(due)
    }

    async fn open_trade(&self, new_trade: NewTrade, now: DateTime<Utc>) -> AppResult<Trade> {
        let mut state = self.state.lock();

        let round = state
            .rounds
            .get(&new_trade.round_id)
            .ok_or(TradeError::RoundNotFound(new_trade.round_id))?;
        if !round.is_open_at(now) {
            return Err(round.rejection_at(now).into());
        }
        let symbol = round.symbol.clone();

        let amount = new_trade.amount;
        let balance = state.balance_mut(new_trade.account_id, now);
        if !balance.has_available(amount) {
            return Err(LedgerError::InsufficientFunds {
                account_id: new_trade.account_id,
                required: amount,
                available: balance.available,
            }
            .into());
        }
        balance.available -= amount;
        balance.at_risk += amount;
        balance.updated_at = now;

        let trade = new_trade.into_trade(&symbol, now);
        state.trades.insert(trade.id, trade.clone());
        Ok(trade)
    }

    async fn get_trade(&self, trade_id: Uuid) -> AppResult<Option<Trade>> {
        Ok(self.state.lock().trades.get(&trade_id).cloned())
    }

    async fn round_trades(&self, round_id: Uuid) -> AppResult<Vec<Trade>> {
        let state = self.state.lock();
        let mut trades: Vec<Trade> = state
            .trades
            .values()
            .filter(|t| t.round_id == round_id)
            .cloned()
            .collect();
        trades.sort_by_key(|t| (t.created_at, t.id));
        Ok(trades)
    }

    async fn settle_round(
        &self,
        round_id: Uuid,
        close_price: Decimal,
        settled_at: DateTime<Utc>,
        policy: &PayoutPolicy,
    ) -> AppResult<Option<SettlementReport>> {
        self.finish_round(round_id, Some(close_price), settled_at, |trade| {
            policy.resolve(trade, close_price)
        })
    }

    async fn void_round(
        &self,
        round_id: Uuid,
        voided_at: DateTime<Utc>,
        policy: &PayoutPolicy,
    ) -> AppResult<Option<SettlementReport>> {
        self.finish_round(round_id, None, voided_at, |trade| policy.cancel(trade))
    }

    async fn credit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let balance = state.balance_mut(account_id, now);
        balance.available += amount;
        balance.updated_at = now;
        Ok(balance.clone())
    }

    async fn debit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let balance = state.balance_mut(account_id, now);
        if !balance.has_available(amount) {
            return Err(LedgerError::InsufficientFunds {
                account_id,
                required: amount,
                available: balance.available,
            }
            .into());
        }
        balance.available -= amount;
        balance.updated_at = now;
        Ok(balance.clone())
    }

    async fn balance(&self, account_id: Uuid) -> AppResult<AccountBalance> {
        let state = self.state.lock();
        Ok(state
            .balances
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| AccountBalance::empty(account_id, Utc::now())))
    }
}
