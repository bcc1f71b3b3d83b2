pub mod placement;

pub use placement::{StakeLimits, TradePlacementService};
