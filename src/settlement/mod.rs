// Round settlement: outcome rules, the settling engine, its scheduler and the
// events it publishes.
pub mod engine;
pub mod events;
pub mod outcome;
pub mod scheduler;

pub use engine::{EngineSettings, SettleOutcome, SettlementEngine, SettlementSummary};
pub use events::{SettlementBroadcaster, SettlementEvent, TradeOutcomeEvent};
pub use outcome::{PayoutPolicy, TieRule};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SettlementScheduler};
