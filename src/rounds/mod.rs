// Round cadence: window arithmetic and the manager that keeps the current
// round of every symbol in storage.
pub mod manager;
pub mod window;

pub use manager::{CurrentRound, RoundManager};
pub use window::{Clock, ManualClock, RoundWindow, SystemClock};
