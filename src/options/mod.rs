//! Option contract identifiers and Black-Scholes pricing helpers, shared by
//! the options chain adapter, the option execution service and the risk
//! service's Greeks aggregation.

pub mod black_scholes;
pub mod contract;

pub use contract::{asset_base, format_option_symbol, OptionContractId};
