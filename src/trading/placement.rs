use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, TradeError};
use crate::ledger::models::{Direction, NewTrade, Trade};
use crate::ledger::store::LedgerStore;
use crate::oracle::{price_within, PriceOracle};
use crate::rounds::Clock;

/// Optional bounds on a single stake
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StakeLimits {
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

impl StakeLimits {
    pub fn check(&self, amount: Decimal) -> Result<(), TradeError> {
        if amount <= Decimal::ZERO {
            return Err(TradeError::InvalidAmount(format!(
                "stake must be positive, got {}",
                amount
            )));
        }
        if let Some(min) = self.min {
            if amount < min {
                return Err(TradeError::InvalidAmount(format!(
                    "stake {} below minimum {}",
                    amount, min
                )));
            }
        }
        if let Some(max) = self.max {
            if amount > max {
                return Err(TradeError::InvalidAmount(format!(
                    "stake {} above maximum {}",
                    amount, max
                )));
            }
        }
        Ok(())
    }
}

/// Accepts stakes against open rounds
pub struct TradePlacementService {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
    clock: Arc<dyn Clock>,
    limits: StakeLimits,
    oracle_timeout: Duration,
}

impl TradePlacementService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
        limits: StakeLimits,
        oracle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            clock,
            limits,
            oracle_timeout,
        }
    }

    /// Reserve `amount` from the account and record a pending trade on
    /// `round_id`. The caller supplies an already authenticated account.
    pub async fn place_trade(
        &self,
        account_id: Uuid,
        amount: Decimal,
        direction: Direction,
        round_id: Uuid,
    ) -> AppResult<Trade> {
        self.limits.check(amount)?;

        let round = self
            .store
            .get_round(round_id)
            .await?
            .ok_or(TradeError::RoundNotFound(round_id))?;

        // Cheap rejection before touching the oracle; the store re-checks
        // inside its atomic unit
        let now = self.clock.now();
        if !round.is_open_at(now) {
            let rejection = round.rejection_at(now);
            warn!(
                %account_id,
                %round_id,
                start = %round.start_time,
                end = %round.end_time,
                "Stake rejected: {}",
                rejection
            );
            return Err(rejection.into());
        }

        let entry_price =
            price_within(self.oracle.as_ref(), &round.symbol, now, self.oracle_timeout).await?;

        let new_trade = NewTrade {
            account_id,
            round_id,
            direction,
            amount,
            entry_price,
        };

        match self.store.open_trade(new_trade, self.clock.now()).await {
            Ok(trade) => {
                info!(
                    trade_id = %trade.id,
                    %account_id,
                    %round_id,
                    symbol = %trade.symbol,
                    %direction,
                    %amount,
                    %entry_price,
                    "Trade placed"
                );
                Ok(trade)
            }
            Err(e) => {
                if !matches!(e, AppError::Database(_)) {
                    warn!(%account_id, %round_id, %amount, "Trade rejected: {}", e);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, OracleError};
    use crate::ledger::models::TradeStatus;
    use crate::ledger::{InMemoryLedger, LedgerStore};
    use crate::rounds::{ManualClock, RoundWindow};
    use crate::testing::ScriptedOracle;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<InMemoryLedger>,
        oracle: Arc<ScriptedOracle>,
        clock: Arc<ManualClock>,
        service: TradePlacementService,
    }

    fn fixture(limits: StakeLimits) -> Fixture {
        let store = Arc::new(InMemoryLedger::new());
        let oracle = Arc::new(ScriptedOracle::fixed(dec!(100)));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 20).unwrap(),
        ));
        let service = TradePlacementService::new(
            store.clone(),
            oracle.clone(),
            clock.clone(),
            limits,
            Duration::from_secs(1),
        );
        Fixture {
            store,
            oracle,
            clock,
            service,
        }
    }

    async fn open_round(f: &Fixture) -> Uuid {
        let window = RoundWindow::containing(f.clock.now(), 60_000);
        f.store
            .insert_round_if_absent("BTC", window, f.clock.now())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_place_trade_reserves_stake_and_records_entry_price() {
        let f = fixture(StakeLimits::default());
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(1000)).await.unwrap();
        let round_id = open_round(&f).await;

        let trade = f
            .service
            .place_trade(account, dec!(250), Direction::Up, round_id)
            .await
            .unwrap();

        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.entry_price, dec!(100));
        assert_eq!(trade.round_id, round_id);

        let balance = f.store.balance(account).await.unwrap();
        assert_eq!(balance.available, dec!(750));
        assert_eq!(balance.at_risk, dec!(250));
        assert_eq!(balance.total(), dec!(1000));
    }

    #[tokio::test]
    async fn test_late_placement_is_rejected() {
        let f = fixture(StakeLimits::default());
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(1000)).await.unwrap();
        let round_id = open_round(&f).await;

        f.clock.advance(ChronoDuration::seconds(41));
        let err = f
            .service
            .place_trade(account, dec!(10), Direction::Down, round_id)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Trade(TradeError::RoundClosed { .. })));
        let balance = f.store.balance(account).await.unwrap();
        assert_eq!(balance.available, dec!(1000));
        assert_eq!(balance.at_risk, Decimal::ZERO);
        assert_eq!(f.oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_stake_on_future_round_is_rejected() {
        let f = fixture(StakeLimits::default());
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(1000)).await.unwrap();
        let future = RoundWindow::containing(f.clock.now() + ChronoDuration::minutes(10), 60_000);
        let round_id = f
            .store
            .insert_round_if_absent("BTC", future, f.clock.now())
            .await
            .unwrap()
            .id;

        let err = f
            .service
            .place_trade(account, dec!(10), Direction::Up, round_id)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Trade(TradeError::RoundNotOpen { .. })));
        let balance = f.store.balance(account).await.unwrap();
        assert_eq!(balance.available, dec!(1000));
        assert_eq!(balance.at_risk, Decimal::ZERO);
        assert!(f.store.round_trades(round_id).await.unwrap().is_empty());
        assert_eq!(f.oracle.calls(), 0);
    }

    /// Oracle that takes long enough for the window to close under it
    struct SlowOracle {
        clock: Arc<ManualClock>,
    }

    #[async_trait::async_trait]
    impl PriceOracle for SlowOracle {
        async fn get_price(
            &self,
            _symbol: &str,
            _at: chrono::DateTime<Utc>,
        ) -> Result<Decimal, OracleError> {
            self.clock.advance(ChronoDuration::seconds(1));
            Ok(dec!(100))
        }
    }

    #[tokio::test]
    async fn test_window_closing_during_price_lookup_is_rejected() {
        let f = fixture(StakeLimits::default());
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(1000)).await.unwrap();
        let round_id = open_round(&f).await;
        f.clock.advance(ChronoDuration::milliseconds(39_500));

        let service = TradePlacementService::new(
            f.store.clone(),
            Arc::new(SlowOracle {
                clock: f.clock.clone(),
            }),
            f.clock.clone(),
            StakeLimits::default(),
            Duration::from_secs(1),
        );
        let err = service
            .place_trade(account, dec!(10), Direction::Up, round_id)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Trade(TradeError::RoundClosed { .. })));
        let balance = f.store.balance(account).await.unwrap();
        assert_eq!(balance.available, dec!(1000));
        assert_eq!(balance.at_risk, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_insufficient_funds_is_rejected() {
        let f = fixture(StakeLimits::default());
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(99)).await.unwrap();
        let round_id = open_round(&f).await;

        let err = f
            .service
            .place_trade(account, dec!(100), Direction::Up, round_id)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Ledger(LedgerError::InsufficientFunds { .. })));
        let balance = f.store.balance(account).await.unwrap();
        assert_eq!(balance.available, dec!(99));
        assert_eq!(balance.at_risk, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_round_is_rejected() {
        let f = fixture(StakeLimits::default());
        let missing = Uuid::new_v4();
        let err = f
            .service
            .place_trade(Uuid::new_v4(), dec!(1), Direction::Up, missing)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Trade(TradeError::RoundNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_stake_limits() {
        let f = fixture(StakeLimits {
            min: Some(dec!(5)),
            max: Some(dec!(500)),
        });
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(1000)).await.unwrap();
        let round_id = open_round(&f).await;

        for amount in [Decimal::ZERO, dec!(-1), dec!(4.99), dec!(500.01)] {
            let err = f
                .service
                .place_trade(account, amount, Direction::Up, round_id)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Trade(TradeError::InvalidAmount(_))));
        }
        assert!(f
            .service
            .place_trade(account, dec!(500), Direction::Up, round_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_oracle_outage_rejects_without_mutation() {
        let f = fixture(StakeLimits::default());
        let account = Uuid::new_v4();
        f.store.credit(account, dec!(100)).await.unwrap();
        let round_id = open_round(&f).await;
        f.oracle.go_down();

        let err = f
            .service
            .place_trade(account, dec!(10), Direction::Up, round_id)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Oracle(OracleError::PriceUnavailable { .. })));
        assert_eq!(f.store.balance(account).await.unwrap().available, dec!(100));
        assert!(f.store.round_trades(round_id).await.unwrap().is_empty());
    }
}
