use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult, TradeError};
use crate::rounds::RoundWindow;

/// Round status. `Settled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "round_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Pending,
    Settled,
}

/// The account's prediction for the round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "trade_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "up" | "call" | "higher" => Ok(Direction::Up),
            "down" | "put" | "lower" => Ok(Direction::Down),
            other => Err(TradeError::InvalidDirection(other.to_string()).into()),
        }
    }
}

/// Trade status. Every status except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "trade_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Won,
    Lost,
    Canceled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }
}

/// Round entity. `(symbol, start_time, end_time)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Round {
    pub id: Uuid,
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub close_price: Option<Decimal>,
    pub status: RoundStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn new(symbol: &str, window: RoundWindow, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            start_time: window.start,
            end_time: window.end,
            close_price: None,
            status: RoundStatus::Pending,
            created_at,
            settled_at: None,
        }
    }

    pub fn window(&self) -> RoundWindow {
        RoundWindow {
            start: self.start_time,
            end: self.end_time,
        }
    }

    /// Accepts stakes only while pending and inside `[start_time, end_time)`
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RoundStatus::Pending && self.window().contains(now)
    }

    /// Why a stake at `now` is refused; only meaningful when `!is_open_at(now)`
    pub fn rejection_at(&self, now: DateTime<Utc>) -> TradeError {
        if self.status == RoundStatus::Pending && now < self.start_time {
            TradeError::RoundNotOpen {
                round_id: self.id,
                start_time: self.start_time,
            }
        } else {
            TradeError::RoundClosed {
                round_id: self.id,
                end_time: self.end_time,
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.status == RoundStatus::Pending && self.end_time + grace <= now
    }
}

/// Trade entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub account_id: Uuid,
    pub round_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub status: TradeStatus,
    pub payout: Decimal,
    pub close_price: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A validated stake waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub account_id: Uuid,
    pub round_id: Uuid,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_price: Decimal,
}

impl NewTrade {
    pub fn into_trade(self, symbol: &str, created_at: DateTime<Utc>) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            round_id: self.round_id,
            symbol: symbol.to_string(),
            direction: self.direction,
            amount: self.amount,
            entry_price: self.entry_price,
            status: TradeStatus::Pending,
            payout: Decimal::ZERO,
            close_price: None,
            close_time: None,
            created_at,
        }
    }
}

/// Balance entity. `at_risk` is the sum of the account's pending stakes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AccountBalance {
    pub account_id: Uuid,
    pub available: Decimal,
    pub at_risk: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    pub fn empty(account_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            available: Decimal::ZERO,
            at_risk: Decimal::ZERO,
            updated_at: at,
        }
    }

    /// `available + at_risk`
    pub fn total(&self) -> Decimal {
        self.available + self.at_risk
    }

    pub fn has_available(&self, required: Decimal) -> bool {
        self.available >= required
    }
}
