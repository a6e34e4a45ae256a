//! Macro regime classification over (realized volatility, sentiment).
//!
//! Stateless: every sample is classified independently.
//!
//! Volatility bands: low <= 0.4 < mid <= 0.8 < high.
//! Sentiment bands: very bearish <= -0.7 < bearish <= -0.3,
//! neutral in [-0.3, 0.3], 0.3 < bullish <= 0.7 < very bullish.

use crate::events::Regime;

const DEFAULT_VOL: f64 = 0.4;
const DEFAULT_SENTIMENT: f64 = 0.0;

/// Classify a (vol, sentiment) sample into a regime with a confidence score.
/// Missing inputs fall back to mid-band defaults.
pub fn classify_regime(realized_vol: Option<f64>, sentiment: Option<f64>) -> (Regime, f64) {
    let vol = realized_vol.unwrap_or(DEFAULT_VOL);
    let sent = sentiment.unwrap_or(DEFAULT_SENTIMENT);

    let high_vol = vol > 0.8;
    let mid_vol = vol > 0.4 && vol <= 0.8;
    let low_vol = vol <= 0.4;

    let very_bullish = sent > 0.7;
    let bullish = sent > 0.3 && sent <= 0.7;
    let neutral = (-0.3..=0.3).contains(&sent);
    let bearish = sent > -0.7 && sent <= -0.3;
    let very_bearish = sent <= -0.7;

    if high_vol && very_bearish {
        return (Regime::Panic, ((vol - 0.8) + sent.abs()).min(1.0));
    }
    if high_vol && very_bullish {
        return (Regime::HighVolBull, ((vol - 0.8) + sent).min(1.0));
    }
    if (low_vol || mid_vol) && bullish {
        return (Regime::Bull, (0.5 * vol + sent).min(1.0));
    }
    if (mid_vol || high_vol) && bearish {
        return (Regime::Bear, (vol + sent.abs()).min(1.0));
    }
    if low_vol && neutral {
        return (Regime::Chop, (0.2 + vol).min(1.0));
    }
    (Regime::Unknown, 0.1)
}

/// FOMO score: 0.6·sentiment + 0.4·realized vol, clipped to [0, 1].
/// `None` when either input is missing.
pub fn fomo_score(sentiment: Option<f64>, realized_vol: Option<f64>) -> Option<f64> {
    match (sentiment, realized_vol) {
        (Some(s), Some(v)) => Some((0.6 * s + 0.4 * v).clamp(0.0, 1.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_vol_very_bearish_is_panic() {
        let (regime, score) = classify_regime(Some(0.9), Some(-0.8));
        assert_eq!(regime, Regime::Panic);
        assert!((score - 0.9).abs() < 1e-9, "score {score}");
    }

    #[test]
    fn low_vol_neutral_is_chop() {
        let (regime, score) = classify_regime(Some(0.3), Some(0.0));
        assert_eq!(regime, Regime::Chop);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn high_vol_very_bullish_is_high_vol_bull() {
        let (regime, score) = classify_regime(Some(1.0), Some(0.9));
        assert_eq!(regime, Regime::HighVolBull);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mid_vol_bullish_is_bull() {
        let (regime, _) = classify_regime(Some(0.5), Some(0.5));
        assert_eq!(regime, Regime::Bull);
    }

    #[test]
    fn mid_vol_bearish_is_bear() {
        let (regime, score) = classify_regime(Some(0.6), Some(-0.5));
        assert_eq!(regime, Regime::Bear);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn defaults_classify_as_chop() {
        // vol defaults to 0.4 (low band), sentiment to neutral.
        let (regime, _) = classify_regime(None, None);
        assert_eq!(regime, Regime::Chop);
    }

    #[test]
    fn low_vol_very_bearish_is_unknown() {
        let (regime, score) = classify_regime(Some(0.1), Some(-0.9));
        assert_eq!(regime, Regime::Unknown);
        assert!((score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn fomo_clips_to_unit_interval() {
        assert_eq!(fomo_score(Some(2.0), Some(2.0)), Some(1.0));
        assert_eq!(fomo_score(Some(-2.0), Some(0.0)), Some(0.0));
        assert_eq!(fomo_score(None, Some(0.5)), None);
        let mid = fomo_score(Some(0.5), Some(0.5)).unwrap();
        assert!((mid - 0.5).abs() < 1e-9);
    }
}
