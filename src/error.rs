use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the settlement engine
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("Trade error: {0}")]
    Trade(#[from] TradeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trade placement errors, returned synchronously to the caller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    #[error("Round not found: {0}")]
    RoundNotFound(Uuid),

    #[error("Round {round_id} closed at {end_time}")]
    RoundClosed {
        round_id: Uuid,
        end_time: DateTime<Utc>,
    },

    #[error("Round {round_id} opens at {start_time}")]
    RoundNotOpen {
        round_id: Uuid,
        start_time: DateTime<Utc>,
    },

    #[error("Invalid stake amount: {0}")]
    InvalidAmount(String),

    #[error("Unknown direction: {0}")]
    InvalidDirection(String),
}

/// Balance ledger errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Insufficient funds for {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: Uuid,
        required: Decimal,
        available: Decimal,
    },

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
}

/// Price oracle errors. All of them leave a round pending for the next tick.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("Price lookup for {symbol} timed out after {after_ms}ms")]
    Timeout { symbol: String, after_ms: u64 },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl AppError {
    /// Whether the scheduler should simply try again on its next tick
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Oracle(_) | AppError::Database(_))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the engine
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_failures_are_retryable() {
        let err: AppError = OracleError::Timeout {
            symbol: "BTC".to_string(),
            after_ms: 2000,
        }
        .into();
        assert!(err.is_retryable());

        let err: AppError = TradeError::RoundNotFound(Uuid::nil()).into();
        assert!(!err.is_retryable());
    }
}
