//! Strategy plugins and the engine that hosts them.

pub mod delta_hedger;
pub mod engine;
pub mod grid;
pub mod plugin;
pub mod pq_vol_trader;

pub use delta_hedger::DeltaHedgerStrategy;
pub use engine::StrategyEngine;
pub use grid::GridStrategy;
pub use plugin::{
    EventInterests, InstrumentType, Strategy, StrategyCapability, StrategyContext, StrategyOutput,
};
pub use pq_vol_trader::PqVolTraderStrategy;
