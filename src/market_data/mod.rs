//! Market data: exchange client contract, tick polling adapter and the
//! options chain adapter that builds volatility surfaces.

pub mod adapter;
pub mod exchange;
pub mod options_adapter;

pub use adapter::MarketDataAdapter;
pub use exchange::{BalanceSnapshot, ExchangeClient, SimExchange, Ticker};
pub use options_adapter::OptionsChainAdapter;
