//! State store layer.
//!
//! A small hash/list key-value backend carries all persistence; the
//! per-strategy store and the global portfolio store are typed facades over
//! it. The portfolio store is the sole writer of global position, balance and
//! risk-metric records.

pub mod kv;
pub mod portfolio;
pub mod store;

pub use kv::{KvBackend, MemoryKv};
pub use portfolio::{DrawdownRecord, PnlRecord, PortfolioStore, Position};
pub use store::StrategyStateStore;
