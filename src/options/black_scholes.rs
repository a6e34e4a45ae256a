//! Black-Scholes pricing, implied volatility and greeks for European
//! options.
//!
//! Prices and vol are `f64`: the quantities feeding and leaving this module
//! are model values, not money amounts. Theta is quoted per calendar day,
//! vega and rho per 1% move.

use crate::events::{OptionGreeks, OptionKind};

const IV_INITIAL_GUESS: f64 = 0.5;
const IV_MAX_ITERATIONS: usize = 100;
const IV_TOLERANCE: f64 = 1e-5;
const IV_MIN: f64 = 0.01;
const IV_MAX: f64 = 5.0;
const VEGA_FLOOR: f64 = 1e-10;

/// Standard normal CDF (Abramowitz & Stegun 26.2.17).
fn norm_cdf(x: f64) -> f64 {
    if x >= 8.0 {
        return 1.0;
    }
    if x <= -8.0 {
        return 0.0;
    }

    let a1 = 0.254829592_f64;
    let a2 = -0.284496736_f64;
    let a3 = 1.421413741_f64;
    let a4 = -1.453152027_f64;
    let a5 = 1.061405429_f64;
    let p = 0.3275911_f64;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x_abs = x.abs();
    let t = 1.0 / (1.0 + p * x_abs);
    let y =
        1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x_abs * x_abs / 2.0).exp();

    0.5 * (1.0 + sign * y)
}

/// Standard normal PDF.
fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

fn d1_d2(spot: f64, strike: f64, time: f64, rate: f64, vol: f64) -> (f64, f64) {
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * time) / (vol * time.sqrt());
    (d1, d1 - vol * time.sqrt())
}

/// Theoretical European option price.
pub fn price(spot: f64, strike: f64, time: f64, rate: f64, vol: f64, kind: OptionKind) -> f64 {
    if time <= 0.0 {
        // Expired: intrinsic value only.
        return match kind {
            OptionKind::Call => (spot - strike).max(0.0),
            OptionKind::Put => (strike - spot).max(0.0),
        };
    }
    let (d1, d2) = d1_d2(spot, strike, time, rate, vol);
    let disc = (-rate * time).exp();
    match kind {
        OptionKind::Call => spot * norm_cdf(d1) - strike * disc * norm_cdf(d2),
        OptionKind::Put => strike * disc * norm_cdf(-d2) - spot * norm_cdf(-d1),
    }
}

/// Raw (unscaled) vega.
fn vega(spot: f64, strike: f64, time: f64, rate: f64, vol: f64) -> f64 {
    let (d1, _) = d1_d2(spot, strike, time, rate, vol);
    spot * norm_pdf(d1) * time.sqrt()
}

/// Invert a market price into implied volatility via Newton's method.
///
/// Sigma is clamped to [0.01, 5.0]; when vega collapses before convergence
/// the search falls back to bisection, which also absorbs targets outside
/// the attainable price range.
pub fn implied_volatility(
    option_price: f64,
    spot: f64,
    strike: f64,
    time: f64,
    rate: f64,
    kind: OptionKind,
) -> f64 {
    if time <= 0.0 || option_price <= 0.0 {
        return 0.0;
    }

    let mut sigma = IV_INITIAL_GUESS;
    for _ in 0..IV_MAX_ITERATIONS {
        let model = price(spot, strike, time, rate, sigma, kind);
        let diff = option_price - model;
        if diff.abs() < IV_TOLERANCE {
            return sigma;
        }
        let v = vega(spot, strike, time, rate, sigma);
        if v < VEGA_FLOOR {
            return bisect_iv(option_price, spot, strike, time, rate, kind);
        }
        sigma = (sigma + diff / v).clamp(IV_MIN, IV_MAX);
    }
    sigma
}

fn bisect_iv(
    option_price: f64,
    spot: f64,
    strike: f64,
    time: f64,
    rate: f64,
    kind: OptionKind,
) -> f64 {
    let mut lo = IV_MIN;
    let mut hi = IV_MAX;
    if option_price <= price(spot, strike, time, rate, lo, kind) {
        return lo;
    }
    if option_price >= price(spot, strike, time, rate, hi, kind) {
        return hi;
    }
    let mut mid = 0.5 * (lo + hi);
    for _ in 0..IV_MAX_ITERATIONS {
        mid = 0.5 * (lo + hi);
        let model = price(spot, strike, time, rate, mid, kind);
        if (model - option_price).abs() < IV_TOLERANCE {
            return mid;
        }
        if model < option_price {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    mid
}

/// Closed-form greeks. All zero at or past expiry.
pub fn greeks(
    spot: f64,
    strike: f64,
    time: f64,
    rate: f64,
    vol: f64,
    kind: OptionKind,
) -> OptionGreeks {
    if time <= 0.0 {
        return OptionGreeks::zero();
    }

    let (d1, d2) = d1_d2(spot, strike, time, rate, vol);
    let disc = (-rate * time).exp();

    let delta = match kind {
        OptionKind::Call => norm_cdf(d1),
        OptionKind::Put => -norm_cdf(-d1),
    };
    let gamma = norm_pdf(d1) / (spot * vol * time.sqrt());
    let vega_pct = spot * norm_pdf(d1) * time.sqrt() / 100.0;

    let theta_common = -spot * norm_pdf(d1) * vol / (2.0 * time.sqrt());
    let theta = match kind {
        OptionKind::Call => (theta_common - rate * strike * disc * norm_cdf(d2)) / 365.0,
        OptionKind::Put => (theta_common + rate * strike * disc * norm_cdf(-d2)) / 365.0,
    };

    let rho = match kind {
        OptionKind::Call => strike * time * disc * norm_cdf(d2) / 100.0,
        OptionKind::Put => -strike * time * disc * norm_cdf(-d2) / 100.0,
    };

    OptionGreeks {
        delta,
        gamma,
        theta,
        vega: vega_pct,
        rho,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_call_parity_holds() {
        let (spot, strike, time, rate, vol) = (40_000.0, 42_000.0, 0.25, 0.03, 0.6);
        let call = price(spot, strike, time, rate, vol, OptionKind::Call);
        let put = price(spot, strike, time, rate, vol, OptionKind::Put);
        let parity = spot - strike * (-rate * time).exp();
        assert!(
            (call - put - parity).abs() < 1e-6,
            "parity residual {}",
            call - put - parity
        );
    }

    #[test]
    fn implied_volatility_round_trips() {
        let (spot, strike, time, rate) = (40_000.0, 40_000.0, 0.25, 0.03);
        for true_vol in [0.1, 0.3, 0.6, 1.0, 1.5, 2.0] {
            for kind in [OptionKind::Call, OptionKind::Put] {
                let target = price(spot, strike, time, rate, true_vol, kind);
                let recovered = implied_volatility(target, spot, strike, time, rate, kind);
                assert!(
                    (recovered - true_vol).abs() < 1e-4,
                    "vol {true_vol} recovered as {recovered}"
                );
            }
        }
    }

    #[test]
    fn expired_option_has_zero_greeks_and_iv() {
        let g = greeks(40_000.0, 40_000.0, 0.0, 0.03, 0.6, OptionKind::Call);
        assert_eq!(g, OptionGreeks::zero());
        assert_eq!(
            implied_volatility(1_000.0, 40_000.0, 40_000.0, 0.0, 0.03, OptionKind::Call),
            0.0
        );
    }

    #[test]
    fn delta_bounds_by_kind() {
        let call = greeks(40_000.0, 40_000.0, 0.25, 0.03, 0.6, OptionKind::Call);
        let put = greeks(40_000.0, 40_000.0, 0.25, 0.03, 0.6, OptionKind::Put);
        assert!(call.delta > 0.0 && call.delta < 1.0);
        assert!(put.delta > -1.0 && put.delta < 0.0);
        assert!(call.gamma > 0.0);
        assert!((call.gamma - put.gamma).abs() < 1e-12);
        assert!(call.theta < 0.0);
        assert!(call.vega > 0.0);
    }

    #[test]
    fn unattainable_price_clamps_to_vol_bounds() {
        // A price above the spot can never be reached by a call.
        let iv = implied_volatility(45_000.0, 40_000.0, 40_000.0, 0.05, 0.03, OptionKind::Call);
        assert!(iv <= 5.0 && iv >= 0.01);
    }

    #[test]
    fn norm_cdf_sane() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert_eq!(norm_cdf(8.5), 1.0);
        assert_eq!(norm_cdf(-8.5), 0.0);
    }
}
