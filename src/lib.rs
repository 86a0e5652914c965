//! PairTX - Core Library
//! Execution core for pair strategies: positions, risk gate, bartering loop
//! and shared-memory market snapshots

// Public modules
pub mod bartering;
pub mod core;
pub mod executor;
pub mod ledger;
pub mod market_snapshot;
pub mod position_cache;
pub mod risk;
pub mod strategy_cache;

#[cfg(test)]
mod testing;

// Re-exports
pub use core::{Config, EngineContext, Error, Result};
pub use executor::{ExecutorCore, OrderOutcome};
