use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::models::{Direction, TradeStatus};
use crate::ledger::SettlementReport;

/// Outcome of one trade, as relayed to connected clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcomeEvent {
    pub trade_id: Uuid,
    pub account_id: Uuid,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub status: TradeStatus,
    pub payout: Decimal,
}

/// Published once per round when it is settled or voided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub round_id: Uuid,
    pub symbol: String,
    /// `None` when the round was voided
    pub close_price: Option<Decimal>,
    pub settled_at: DateTime<Utc>,
    pub outcomes: Vec<TradeOutcomeEvent>,
}

impl From<&SettlementReport> for SettlementEvent {
    fn from(report: &SettlementReport) -> Self {
        Self {
            round_id: report.round.id,
            symbol: report.round.symbol.clone(),
            close_price: report.round.close_price,
            settled_at: report.round.settled_at.unwrap_or_else(Utc::now),
            outcomes: report
                .trades
                .iter()
                .map(|t| TradeOutcomeEvent {
                    trade_id: t.id,
                    account_id: t.account_id,
                    direction: t.direction,
                    amount: t.amount,
                    entry_price: t.entry_price,
                    status: t.status,
                    payout: t.payout,
                })
                .collect(),
        }
    }
}

/// Broadcast channel capacity
const BROADCAST_CAPACITY: usize = 1000;

/// Fan-out of settlement events to the real-time layer. Sending never blocks
/// settlement; slow receivers lag and drop old events.
pub struct SettlementBroadcaster {
    tx: broadcast::Sender<SettlementEvent>,
}

impl SettlementBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: SettlementEvent) {
        debug!(
            "📡 Broadcast settlement: {} {} ({} trades)",
            event.symbol,
            event.round_id,
            event.outcomes.len()
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SettlementBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event() -> SettlementEvent {
        SettlementEvent {
            round_id: Uuid::new_v4(),
            symbol: "BTC".to_string(),
            close_price: Some(dec!(110)),
            settled_at: Utc::now(),
            outcomes: vec![],
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = SettlementBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        let sent = event();
        broadcaster.publish(sent.clone());
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        SettlementBroadcaster::default().publish(event());
    }

    #[test]
    fn test_event_serializes_lowercase_statuses() {
        let mut e = event();
        e.outcomes.push(TradeOutcomeEvent {
            trade_id: Uuid::nil(),
            account_id: Uuid::nil(),
            direction: Direction::Up,
            amount: dec!(100000),
            entry_price: dec!(100),
            status: TradeStatus::Won,
            payout: dec!(80000),
        });

        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "won");
        assert_eq!(json["outcomes"][0]["direction"], "up");
    }
}
