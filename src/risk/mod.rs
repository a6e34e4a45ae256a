//! Risk management: portfolio accounting from fills, pre-order vetoes,
//! Greeks aggregation, periodic checks and the macro-state broadcast.

pub mod regime;
pub mod service;

pub use regime::{classify_regime, fomo_score};
pub use service::{RiskCheck, RiskService};
