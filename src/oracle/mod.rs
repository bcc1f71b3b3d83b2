pub mod pyth;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::warn;

use crate::error::OracleError;

pub use pyth::PythOracle;

/// Reference price source. Entry and close prices must both come from here so
/// they are comparable.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Price of `symbol` at, or as near as the source allows to, `at`
    async fn get_price(&self, symbol: &str, at: DateTime<Utc>) -> Result<Decimal, OracleError>;
}

/// `get_price` bounded by `timeout`. Elapsed lookups become `OracleError::Timeout`.
pub async fn price_within(
    oracle: &dyn PriceOracle,
    symbol: &str,
    at: DateTime<Utc>,
    timeout: Duration,
) -> Result<Decimal, OracleError> {
    match tokio::time::timeout(timeout, oracle.get_price(symbol, at)).await {
        Ok(Ok(price)) if price > Decimal::ZERO => Ok(price),
        Ok(Ok(price)) => Err(OracleError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: format!("non-positive price {}", price),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(symbol, timeout_ms = timeout.as_millis() as u64, "Price lookup timed out");
            Err(OracleError::Timeout {
                symbol: symbol.to_string(),
                after_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOracle;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_price_within_passes_prices_through() {
        let oracle = ScriptedOracle::fixed(dec!(101.5));
        let price = price_within(&oracle, "BTC", Utc::now(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(price, dec!(101.5));
    }

    #[tokio::test]
    async fn test_price_within_times_out() {
        let oracle = ScriptedOracle::fixed(dec!(1)).with_delay(Duration::from_millis(200));
        let err = price_within(&oracle, "BTC", Utc::now(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OracleError::Timeout {
                symbol: "BTC".to_string(),
                after_ms: 20
            }
        );
    }

    #[tokio::test]
    async fn test_price_within_surfaces_outage_then_recovers() {
        let oracle = ScriptedOracle::unavailable();
        let err = price_within(&oracle, "SOL", Utc::now(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::PriceUnavailable { ref symbol, .. } if symbol == "SOL"));

        oracle.set_symbol_price("SOL", dec!(150));
        let price = price_within(&oracle, "SOL", Utc::now(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(price, dec!(150));
        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn test_price_within_rejects_non_positive_prices() {
        let oracle = ScriptedOracle::fixed(Decimal::ZERO);
        let err = price_within(&oracle, "ETH", Utc::now(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::PriceUnavailable { .. }));
    }
}
