use chrono::Duration as ChronoDuration;
use config::{Config as ConfigBuilder, Environment, Map};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::settlement::{PayoutPolicy, TieRule};
use crate::trading::StakeLimits;

/// Where rounds, trades and balances live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Single-process, non-durable; local runs only
    Memory,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(AppError::Config(format!("Unknown store backend: {}", other))),
        }
    }
}

/// Values as read from the environment, before validation
#[derive(Debug, Deserialize, Clone)]
struct RawConfig {
    database_url: String,
    store: String,
    db_max_connections: u32,
    symbols: Vec<String>,
    round_duration_ms: i64,
    tick_interval_ms: u64,
    settle_grace_ms: i64,
    oracle_timeout_ms: u64,
    payout_ratio: String,
    tie_rule: String,
    min_stake: Option<String>,
    max_stake: Option<String>,
    stale_after_ticks: u32,
    pyth_network: String,
    pyth_base_url: Option<String>,
    /// `SYMBOL:feed_id` pairs
    #[serde(default)]
    pyth_feed_ids: Vec<String>,
    oracle_max_staleness_secs: i64,
}

#[derive(Debug, Clone)]
pub struct PythSettings {
    pub network: String,
    pub base_url: Option<String>,
    pub feed_ids: HashMap<String, String>,
    pub max_staleness: ChronoDuration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub store: StoreBackend,
    pub db_max_connections: u32,
    pub symbols: Vec<String>,
    pub round_duration_ms: i64,
    pub tick_interval: Duration,
    pub settle_grace: ChronoDuration,
    pub oracle_timeout: Duration,
    pub policy: PayoutPolicy,
    pub stake_limits: StakeLimits,
    pub stale_after_ticks: u32,
    pub pyth: PythSettings,
}

impl Config {
    /// Load `.env`, then `ENGINE_*` variables over the defaults. A plain
    /// `DATABASE_URL` wins over `ENGINE_DATABASE_URL`.
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();
        Self::load(None, std::env::var("DATABASE_URL").ok())
    }

    /// `vars` replaces the process environment when given
    fn load(vars: Option<Map<String, String>>, database_url: Option<String>) -> AppResult<Self> {
        let raw: RawConfig = ConfigBuilder::builder()
            .set_default("database_url", "postgresql://localhost/updown")?
            .set_default("store", "postgres")?
            .set_default("db_max_connections", 10)?
            .set_default("symbols", vec!["BTC"])?
            .set_default("round_duration_ms", 60_000)?
            .set_default("tick_interval_ms", 5_000)?
            .set_default("settle_grace_ms", 2_000)?
            .set_default("oracle_timeout_ms", 3_000)?
            .set_default("payout_ratio", "0.8")?
            .set_default("tie_rule", "house_wins")?
            .set_default("stale_after_ticks", 12)?
            .set_default("pyth_network", "mainnet")?
            .set_default("oracle_max_staleness_secs", 5)?
            .add_source(
                Environment::with_prefix("ENGINE")
                    .prefix_separator("_")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .with_list_parse_key("pyth_feed_ids")
                    .source(vars),
            )
            .set_override_option("database_url", database_url)?
            .build()?
            .try_deserialize()?;

        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> AppResult<Config> {
        let mut symbols: Vec<String> = Vec::new();
        for symbol in &self.symbols {
            let symbol = symbol.trim().to_ascii_uppercase();
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        if symbols.is_empty() {
            return Err(AppError::Config("At least one symbol is required".to_string()));
        }

        if self.round_duration_ms <= 0 {
            return Err(AppError::Config(format!(
                "round_duration_ms must be positive, got {}",
                self.round_duration_ms
            )));
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms as i64 >= self.round_duration_ms {
            return Err(AppError::Config(format!(
                "tick_interval_ms ({}) must be positive and shorter than the round ({})",
                self.tick_interval_ms, self.round_duration_ms
            )));
        }
        if self.settle_grace_ms < 0 {
            return Err(AppError::Config("settle_grace_ms cannot be negative".to_string()));
        }
        if self.oracle_timeout_ms == 0 {
            return Err(AppError::Config("oracle_timeout_ms must be positive".to_string()));
        }

        let payout_ratio = parse_decimal("payout_ratio", &self.payout_ratio)?;
        if payout_ratio <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "payout_ratio must be positive, got {}",
                payout_ratio
            )));
        }

        let stake_limits = StakeLimits {
            min: self
                .min_stake
                .as_deref()
                .map(|v| parse_decimal("min_stake", v))
                .transpose()?,
            max: self
                .max_stake
                .as_deref()
                .map(|v| parse_decimal("max_stake", v))
                .transpose()?,
        };
        if let (Some(min), Some(max)) = (stake_limits.min, stake_limits.max) {
            if min > max {
                return Err(AppError::Config(format!(
                    "min_stake {} exceeds max_stake {}",
                    min, max
                )));
            }
        }

        let mut feed_ids = HashMap::new();
        for pair in &self.pyth_feed_ids {
            match pair.split_once(':') {
                Some((symbol, id)) if !symbol.trim().is_empty() && !id.trim().is_empty() => {
                    feed_ids.insert(
                        symbol.trim().to_ascii_uppercase(),
                        id.trim().trim_start_matches("0x").to_string(),
                    );
                }
                _ => {
                    return Err(AppError::Config(format!(
                        "pyth_feed_ids entry must be SYMBOL:feed_id, got {}",
                        pair
                    )))
                }
            }
        }

        Ok(Config {
            database_url: self.database_url,
            store: self.store.parse()?,
            db_max_connections: self.db_max_connections.max(1),
            symbols,
            round_duration_ms: self.round_duration_ms,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            settle_grace: ChronoDuration::milliseconds(self.settle_grace_ms),
            oracle_timeout: Duration::from_millis(self.oracle_timeout_ms),
            policy: PayoutPolicy {
                payout_ratio,
                tie_rule: self.tie_rule.parse::<TieRule>()?,
            },
            stake_limits,
            stale_after_ticks: self.stale_after_ticks,
            pyth: PythSettings {
                network: self.pyth_network,
                base_url: self.pyth_base_url,
                feed_ids,
                max_staleness: ChronoDuration::seconds(self.oracle_max_staleness_secs),
            },
        })
    }
}

fn parse_decimal(key: &str, value: &str) -> AppResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| AppError::Config(format!("Invalid {} '{}': {}", key, value, e)))
}
