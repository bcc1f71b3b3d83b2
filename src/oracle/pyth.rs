use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PriceOracle;
use crate::error::OracleError;

/// Requests for instants closer to "now" than this use the latest-price endpoint
const LATEST_WINDOW_SECS: i64 = 2;

/// Latest prices are reused for this long
const CACHE_TTL_MS: i64 = 1000;

/// Pyth price feed identifiers (USD quoted), keyed by symbol
pub fn default_feed_ids() -> HashMap<String, String> {
    let mut ids = HashMap::new();
    ids.insert(
        "BTC".to_string(),
        "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43".to_string(),
    );
    ids.insert(
        "ETH".to_string(),
        "ff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace".to_string(),
    );
    ids.insert(
        "SOL".to_string(),
        "ef0d8b6fda2ceba41da15d4095d1da392a0d2f8ed0c6c7bc0f4cfac8c280b56d".to_string(),
    );
    ids
}

/// Response from the Hermes `updates/price` endpoints
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PythUpdateResponse {
    #[serde(default)]
    pub parsed: Vec<PythPriceFeed>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PythPriceFeed {
    pub id: String,
    pub price: PythPrice,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PythPrice {
    #[serde(rename = "price")]
    pub price: String,
    #[serde(rename = "conf")]
    pub confidence: String,
    #[serde(rename = "expo")]
    pub exponent: i32,
    #[serde(rename = "publish_time")]
    pub publish_time: i64,
}

impl PythPrice {
    /// Convert Pyth price to decimal (handle exponent)
    pub fn to_decimal(&self) -> Result<Decimal, rust_decimal::Error> {
        let price = Decimal::from_str(&self.price)?;
        Self::scale(price, self.exponent)
    }

    /// Confidence interval as percentage of the price
    pub fn confidence_pct(&self) -> Result<Decimal, rust_decimal::Error> {
        let conf = Decimal::from_str(&self.confidence)?;
        let price = Decimal::from_str(&self.price)?;
        if price.is_zero() {
            return Ok(Decimal::ZERO);
        }
        Ok((conf / price) * Decimal::from(100))
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.publish_time, 0).single()
    }

    /// Whether the publish time is within `max_age` of `at`, either side
    pub fn is_near(&self, at: DateTime<Utc>, max_age: Duration) -> bool {
        (self.publish_time - at.timestamp()).abs() <= max_age.num_seconds()
    }

    /// `value * 10^exponent`; fails instead of overflowing past `Decimal`'s range
    fn scale(value: Decimal, exponent: i32) -> Result<Decimal, rust_decimal::Error> {
        if exponent < 0 {
            let factor = Decimal::try_from_i128_with_scale(1, exponent.unsigned_abs())?;
            return value.checked_mul(factor).ok_or(rust_decimal::Error::Underflow);
        }

        let mut factor = Decimal::ONE;
        for _ in 0..exponent {
            factor = factor
                .checked_mul(Decimal::TEN)
                .ok_or(rust_decimal::Error::ExceedsMaximumPossibleValue)?;
        }
        value
            .checked_mul(factor)
            .ok_or(rust_decimal::Error::ExceedsMaximumPossibleValue)
    }
}

/// Pyth Hermes client. Latest prices are cached briefly; historical lookups
/// go through `updates/price/{publish_time}`.
pub struct PythOracle {
    client: Client,
    base_url: String,
    feed_ids: HashMap<String, String>,
    max_staleness: Duration,
    cache: Arc<RwLock<HashMap<String, (PythPrice, DateTime<Utc>)>>>,
}

impl PythOracle {
    pub fn new(network: &str, max_staleness: Duration) -> Self {
        let base_url = match network {
            "mainnet" => "https://hermes.pyth.network",
            _ => "https://hermes-beta.pyth.network",
        };

        Self::with_base_url(base_url, max_staleness)
    }

    pub fn with_base_url(base_url: &str, max_staleness: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            feed_ids: default_feed_ids(),
            max_staleness,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add or replace feed ids, e.g. from configuration
    pub fn with_feed_ids(mut self, feed_ids: HashMap<String, String>) -> Self {
        for (symbol, id) in feed_ids {
            self.feed_ids.insert(symbol.to_ascii_uppercase(), id);
        }
        self
    }

    pub fn feed_id(&self, symbol: &str) -> Option<&str> {
        self.feed_ids
            .get(&symbol.to_ascii_uppercase())
            .map(String::as_str)
    }

    fn cached(&self, feed_id: &str) -> Option<PythPrice> {
        let cache = self.cache.read();
        let (price, fetched_at) = cache.get(feed_id)?;
        let age = Utc::now().signed_duration_since(*fetched_at);
        if age.num_milliseconds() < CACHE_TTL_MS {
            debug!("✓ Cache hit for feed {} (age: {}ms)", feed_id, age.num_milliseconds());
            return Some(price.clone());
        }
        None
    }

    async fn fetch(&self, symbol: &str, url: &str) -> Result<PythPrice, OracleError> {
        let unavailable = |reason: String| OracleError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(format!("HTTP request error: {:?}", e)))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("Hermes returned {}", response.status())));
        }

        let body: PythUpdateResponse = response
            .json()
            .await
            .map_err(|e| unavailable(format!("Malformed Hermes response: {:?}", e)))?;

        Self::first_price(body).ok_or_else(|| unavailable("No price data in response".to_string()))
    }

    fn first_price(body: PythUpdateResponse) -> Option<PythPrice> {
        body.parsed.into_iter().next().map(|feed| feed.price)
    }

    async fn fetch_latest(&self, symbol: &str, feed_id: &str) -> Result<PythPrice, OracleError> {
        if let Some(price) = self.cached(feed_id) {
            return Ok(price);
        }

        let url = format!(
            "{}/v2/updates/price/latest?ids[]={}&parsed=true",
            self.base_url, feed_id
        );
        let price = self.fetch(symbol, &url).await?;

        self.cache
            .write()
            .insert(feed_id.to_string(), (price.clone(), Utc::now()));
        Ok(price)
    }

    async fn fetch_at(
        &self,
        symbol: &str,
        feed_id: &str,
        at: DateTime<Utc>,
    ) -> Result<PythPrice, OracleError> {
        let url = format!(
            "{}/v2/updates/price/{}?ids[]={}&parsed=true",
            self.base_url,
            at.timestamp(),
            feed_id
        );
        self.fetch(symbol, &url).await
    }
}

#[async_trait]
impl PriceOracle for PythOracle {
    async fn get_price(&self, symbol: &str, at: DateTime<Utc>) -> Result<Decimal, OracleError> {
        let feed_id = self
            .feed_id(symbol)
            .ok_or_else(|| OracleError::UnknownSymbol(symbol.to_string()))?
            .to_string();

        let now = Utc::now();
        let price = if (now - at).num_seconds().abs() <= LATEST_WINDOW_SECS {
            self.fetch_latest(symbol, &feed_id).await?
        } else {
            self.fetch_at(symbol, &feed_id, at).await?
        };

        if !price.is_near(at, self.max_staleness) {
            warn!(
                symbol,
                requested = %at,
                published = ?price.published_at(),
                "Stale Pyth price"
            );
            return Err(OracleError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: format!(
                    "published at {} but requested {}",
                    price.publish_time,
                    at.timestamp()
                ),
            });
        }

        let value = price.to_decimal().map_err(|e| OracleError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: format!("Unparseable price: {:?}", e),
        })?;

        info!(
            "✓ Fetched price: {} = {} (confidence: {}%)",
            symbol,
            value,
            price.confidence_pct().unwrap_or_default()
        );

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(value: &str, expo: i32, publish_time: i64) -> PythPrice {
        PythPrice {
            price: value.to_string(),
            confidence: "100".to_string(),
            exponent: expo,
            publish_time,
        }
    }

    #[test]
    fn test_price_exponent_handling() {
        assert_eq!(price("50000", -8, 0).to_decimal().unwrap(), dec!(0.0005));
        assert_eq!(
            price("6512345678901", -8, 0).to_decimal().unwrap(),
            dec!(65123.45678901)
        );
        assert_eq!(price("12", 2, 0).to_decimal().unwrap(), dec!(1200));
    }

    #[test]
    fn test_extreme_exponents_fail_cleanly() {
        assert_eq!(
            price("1", -19, 0).to_decimal().unwrap(),
            dec!(0.0000000000000000001)
        );
        assert_eq!(
            price("7", 20, 0).to_decimal().unwrap(),
            dec!(700000000000000000000)
        );

        assert!(price("1", -29, 0).to_decimal().is_err());
        assert!(price("1", 30, 0).to_decimal().is_err());
        assert!(price("1", i32::MIN, 0).to_decimal().is_err());
        assert!(price("1", i32::MAX, 0).to_decimal().is_err());
    }

    #[test]
    fn test_confidence_interval() {
        let p = PythPrice {
            price: "1000".to_string(),
            confidence: "10".to_string(),
            exponent: -2,
            publish_time: 1234567890,
        };
        assert_eq!(p.confidence_pct().unwrap(), dec!(1));
    }

    #[test]
    fn test_staleness_window() {
        let at = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        let max = Duration::seconds(5);

        assert!(price("1", 0, 1_700_000_058).is_near(at, max));
        assert!(price("1", 0, 1_700_000_065).is_near(at, max));
        assert!(!price("1", 0, 1_700_000_050).is_near(at, max));
    }

    #[test]
    fn test_parse_hermes_response() {
        let body = serde_json::json!({
            "binary": { "encoding": "hex", "data": [] },
            "parsed": [{
                "id": "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43",
                "price": { "price": "6512345678901", "conf": "2345678", "expo": -8, "publish_time": 1700000060 },
                "ema_price": { "price": "6500000000000", "conf": "2000000", "expo": -8, "publish_time": 1700000060 }
            }]
        });

        let response: PythUpdateResponse = serde_json::from_value(body).unwrap();
        let first = PythOracle::first_price(response).unwrap();
        assert_eq!(first.publish_time, 1_700_000_060);
        assert_eq!(first.to_decimal().unwrap(), dec!(65123.45678901));
    }

    #[test]
    fn test_empty_response_has_no_price() {
        let response: PythUpdateResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(PythOracle::first_price(response).is_none());
    }

    #[test]
    fn test_feed_id_lookup_is_case_insensitive() {
        let mut extra = HashMap::new();
        extra.insert("doge".to_string(), "dcef50dd".to_string());
        let oracle = PythOracle::new("mainnet", Duration::seconds(5)).with_feed_ids(extra);

        assert!(oracle.feed_id("btc").is_some());
        assert_eq!(oracle.feed_id("DOGE"), Some("dcef50dd"));
        assert!(oracle.feed_id("XYZ").is_none());
    }

    #[tokio::test]
    async fn test_unknown_symbol_fails_without_network() {
        let oracle = PythOracle::with_base_url("http://127.0.0.1:9", Duration::seconds(5));
        let err = oracle.get_price("NOPE", Utc::now()).await.unwrap_err();
        assert_eq!(err, OracleError::UnknownSymbol("NOPE".to_string()));
    }
}
