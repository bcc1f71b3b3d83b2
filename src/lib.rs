//! Up/down round settlement engine.
//!
//! Fixed-duration rounds per symbol, stakes reserved against a balance ledger,
//! and exactly-once settlement against an external price oracle.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod oracle;
pub mod rounds;
pub mod settlement;
pub mod trading;

#[cfg(test)]
mod testing;
