//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::OracleError;
use crate::oracle::PriceOracle;

/// Oracle whose answers are set by the test
pub struct ScriptedOracle {
    default: Mutex<Option<Decimal>>,
    prices: Mutex<HashMap<String, Decimal>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn fixed(price: Decimal) -> Self {
        Self {
            default: Mutex::new(Some(price)),
            prices: Mutex::new(HashMap::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every lookup fails until a price is set
    pub fn unavailable() -> Self {
        Self {
            default: Mutex::new(None),
            ..Self::fixed(Decimal::ZERO)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_price(&self, price: Decimal) {
        *self.default.lock() = Some(price);
    }

    pub fn set_symbol_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().insert(symbol.to_string(), price);
    }

    pub fn go_down(&self) {
        *self.default.lock() = None;
        self.prices.lock().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for ScriptedOracle {
    async fn get_price(&self, symbol: &str, _at: DateTime<Utc>) -> Result<Decimal, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let by_symbol = self.prices.lock().get(symbol).copied();
        let price = by_symbol.or(*self.default.lock());
        price.ok_or_else(|| OracleError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: "scripted outage".to_string(),
        })
    }
}
