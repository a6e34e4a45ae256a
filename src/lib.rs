//! Event-driven volatility trading core.
//!
//! Components communicate exclusively through a stream-based message bus
//! with consumer groups: market adapters publish ticks and volatility
//! surfaces, the strategy engine fans events out to plugin strategies, the
//! risk service gates every intent and owns the portfolio store, and the
//! option execution service turns approved intents into per-leg orders.

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod market_data;
pub mod net;
pub mod options;
pub mod risk;
pub mod state;
pub mod strategy;

pub use error::{Result, TradingError};
