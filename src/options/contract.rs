use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::events::OptionKind;

/// Parsed option contract symbol: `{underlying}-{YYYYMMDD}-{strike}-{C|P}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionContractId {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: i64,
    pub kind: OptionKind,
}

impl OptionContractId {
    /// Parse a contract symbol; `None` for anything that is not an option.
    pub fn parse(symbol: &str) -> Option<Self> {
        let parts: Vec<&str> = symbol.split('-').collect();
        if parts.len() != 4 {
            return None;
        }
        let expiry = NaiveDate::parse_from_str(parts[1], "%Y%m%d").ok()?;
        let strike: i64 = parts[2].parse().ok()?;
        let kind = match parts[3] {
            "C" => OptionKind::Call,
            "P" => OptionKind::Put,
            _ => return None,
        };
        Some(Self {
            underlying: parts[0].to_string(),
            expiry,
            strike,
            kind,
        })
    }

    pub fn symbol(&self) -> String {
        let kind = match self.kind {
            OptionKind::Call => "C",
            OptionKind::Put => "P",
        };
        format!(
            "{}-{}-{}-{}",
            self.underlying,
            self.expiry.format("%Y%m%d"),
            self.strike,
            kind
        )
    }
}

/// Format a contract symbol from chain data: `BTC/USDT`, 2024-12-29, 40000,
/// call becomes `BTC-20241229-40000-C`.
pub fn format_option_symbol(
    underlying: &str,
    expiry: NaiveDate,
    strike: Decimal,
    kind: OptionKind,
) -> String {
    OptionContractId {
        underlying: asset_base(underlying).to_string(),
        expiry,
        strike: strike.trunc().to_i64().unwrap_or(0),
        kind,
    }
    .symbol()
}

/// Base asset of a pair symbol: `BTC/USDT` -> `BTC`.
pub fn asset_base(symbol: &str) -> &str {
    symbol.split('/').next().unwrap_or(symbol)
}
