// Outcome and payout rules applied to every pending trade of a closing round.
//
// Ties (close == entry) are a policy choice. The default hands the stake to
// the house for both directions; `Refund` cancels the trade instead.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::AppError;
use crate::ledger::models::{Direction, Trade, TradeStatus};

/// Decimal places kept on credited profit
const PAYOUT_SCALE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieRule {
    /// No movement loses for both directions
    HouseWins,
    /// No movement cancels the trade and returns the stake
    Refund,
}

impl FromStr for TieRule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "house_wins" | "house" | "lose" => Ok(TieRule::HouseWins),
            "refund" | "push" => Ok(TieRule::Refund),
            other => Err(AppError::Config(format!("Unknown tie rule: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayoutPolicy {
    /// Profit per unit staked on a winning trade, e.g. 0.8
    pub payout_ratio: Decimal,
    pub tie_rule: TieRule,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self {
            payout_ratio: dec!(0.8),
            tie_rule: TieRule::HouseWins,
        }
    }
}

/// Terminal status of one trade and its effect on the owner's balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeResolution {
    pub status: TradeStatus,
    /// Profit recorded on the trade
    pub payout: Decimal,
    /// Added to `available`
    pub credit: Decimal,
    /// Removed from `at_risk`; always the full stake
    pub release: Decimal,
}

impl PayoutPolicy {
    /// Resolve a pending trade against the round's close price
    pub fn resolve(&self, trade: &Trade, close_price: Decimal) -> TradeResolution {
        let status = if close_price > trade.entry_price {
            Self::winner_loser(trade.direction, Direction::Up)
        } else if close_price < trade.entry_price {
            Self::winner_loser(trade.direction, Direction::Down)
        } else {
            match self.tie_rule {
                TieRule::HouseWins => TradeStatus::Lost,
                TieRule::Refund => TradeStatus::Canceled,
            }
        };

        self.resolution_for(trade.amount, status)
    }

    /// Resolution for a trade voided by an operator
    pub fn cancel(&self, trade: &Trade) -> TradeResolution {
        self.resolution_for(trade.amount, TradeStatus::Canceled)
    }

    fn resolution_for(&self, amount: Decimal, status: TradeStatus) -> TradeResolution {
        match status {
            TradeStatus::Won => {
                let payout = (amount * self.payout_ratio)
                    .round_dp_with_strategy(PAYOUT_SCALE, RoundingStrategy::ToZero);
                TradeResolution {
                    status,
                    payout,
                    credit: amount + payout,
                    release: amount,
                }
            }
            TradeStatus::Canceled => TradeResolution {
                status,
                payout: Decimal::ZERO,
                credit: amount,
                release: amount,
            },
            TradeStatus::Lost | TradeStatus::Pending => TradeResolution {
                status: TradeStatus::Lost,
                payout: Decimal::ZERO,
                credit: Decimal::ZERO,
                release: amount,
            },
        }
    }

    fn winner_loser(direction: Direction, winning: Direction) -> TradeStatus {
        if direction == winning {
            TradeStatus::Won
        } else {
            TradeStatus::Lost
        }
    }
}
