// =============================================================================
// Volume-Weighted Average Price over a candle window
// =============================================================================

use crate::types::Candle;

/// Volume-weighted average of the typical price `(H+L+C)/3` over `candles`.
///
/// When total volume is zero (dead market, synthetic data) the calculation
/// falls back to the arithmetic mean of the close prices. Returns `None` for
/// an empty window; callers treat that as "no price available".
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }

    let total_volume: f64 = candles.iter().map(|c| c.volume).sum();

    if total_volume > 0.0 {
        let weighted: f64 = candles
            .iter()
            .map(|c| c.typical_price() * c.volume)
            .sum();
        Some(weighted / total_volume)
    } else {
        let close_sum: f64 = candles.iter().map(|c| c.close).sum();
        Some(close_sum / candles.len() as f64)
    }
}
