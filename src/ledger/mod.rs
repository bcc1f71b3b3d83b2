pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppResult, LedgerError};
use models::AccountBalance;

pub use memory::InMemoryLedger;
pub use repository::LedgerRepository;
pub use store::{LedgerStore, SettlementReport};

/// Entry point for the deposit/withdrawal flow. Uses the same guarded
/// increments as placement and settlement, never a read-modify-write.
pub struct BalanceLedger {
    store: Arc<dyn LedgerStore>,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn deposit(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance> {
        Self::ensure_positive(amount)?;
        let balance = self.store.credit(account_id, amount).await?;
        info!(%account_id, %amount, available = %balance.available, "Deposit credited");
        Ok(balance)
    }

    pub async fn withdraw(&self, account_id: Uuid, amount: Decimal) -> AppResult<AccountBalance> {
        Self::ensure_positive(amount)?;
        match self.store.debit(account_id, amount).await {
            Ok(balance) => {
                info!(%account_id, %amount, available = %balance.available, "Withdrawal debited");
                Ok(balance)
            }
            Err(e) => {
                warn!(%account_id, %amount, "Withdrawal rejected: {}", e);
                Err(e)
            }
        }
    }

    pub async fn balance(&self, account_id: Uuid) -> AppResult<AccountBalance> {
        self.store.balance(account_id).await
    }

    fn ensure_positive(amount: Decimal) -> AppResult<()> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveAmount(amount).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use rust_decimal_macros::dec;

    fn ledger() -> BalanceLedger {
        BalanceLedger::new(Arc::new(InMemoryLedger::new()))
    }

    #[tokio::test]
    async fn test_deposit_then_withdraw() {
        let ledger = ledger();
        let account = Uuid::new_v4();

        ledger.deposit(account, dec!(250)).await.unwrap();
        let balance = ledger.withdraw(account, dec!(100)).await.unwrap();

        assert_eq!(balance.available, dec!(150));
        assert_eq!(balance.at_risk, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amounts() {
        let ledger = ledger();
        let account = Uuid::new_v4();

        for amount in [Decimal::ZERO, dec!(-5)] {
            let err = ledger.deposit(account, amount).await.unwrap_err();
            assert!(matches!(err, AppError::Ledger(LedgerError::NonPositiveAmount(_))));
        }
        assert_eq!(ledger.balance(account).await.unwrap().available, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_overdraft_leaves_balance_untouched() {
        let ledger = ledger();
        let account = Uuid::new_v4();
        ledger.deposit(account, dec!(10)).await.unwrap();

        let err = ledger.withdraw(account, dec!(11)).await.unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::InsufficientFunds { .. })));
        assert_eq!(ledger.balance(account).await.unwrap().available, dec!(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deposits_are_not_lost() {
        let ledger = Arc::new(ledger());
        let account = Uuid::new_v4();

        let deposits = (0..100).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.deposit(account, dec!(1)).await })
        });
        for result in futures::future::join_all(deposits).await {
            result.unwrap().unwrap();
        }

        assert_eq!(ledger.balance(account).await.unwrap().available, dec!(100));
    }
}
