// =============================================================================
// Exchange providers — candle sources behind the Exchange contract
// =============================================================================
//
// `memory` serves preloaded history (backtests, tests); `binance` fetches
// public klines over REST for live mode. Both share the anomaly filter
// below: a candle whose OHLC collapses far below the batch reference is a
// feed glitch, and the fetch that produced it is retried rather than traded.
// =============================================================================

pub mod binance;
pub mod memory;

use crate::types::Candle;

/// Reference price for anomaly detection: the median close when the batch is
/// large enough for one, otherwise the mean close.
fn reference_close(candles: &[Candle], min_candles_for_median: usize) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    if candles.len() >= min_candles_for_median {
        let mut closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        closes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = closes.len() / 2;
        if closes.len() % 2 == 0 {
            Some((closes[mid - 1] + closes[mid]) / 2.0)
        } else {
            Some(closes[mid])
        }
    } else {
        let sum: f64 = candles.iter().map(|c| c.close).sum();
        Some(sum / candles.len() as f64)
    }
}

/// Index of the first candle with any OHLC component below
/// `reference / threshold_factor`, if one exists.
pub fn find_price_anomaly(
    candles: &[Candle],
    threshold_factor: f64,
    min_candles_for_median: usize,
) -> Option<usize> {
    let reference = reference_close(candles, min_candles_for_median)?;
    if reference <= 0.0 {
        return None;
    }
    let floor = reference / threshold_factor;
    candles.iter().position(|c| {
        c.open < floor || c.high < floor || c.low < floor || c.close < floor
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn clean_batch_has_no_anomaly() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0 + i as f64)).collect();
        assert_eq!(find_price_anomaly(&candles, 50.0, 5), None);
    }

    #[test]
    fn collapsed_candle_is_flagged() {
        let mut candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0)).collect();
        // A low 100x below the median trips the 50x factor.
        candles[4].low = 1.0;
        assert_eq!(find_price_anomaly(&candles, 50.0, 5), Some(4));
    }

    #[test]
    fn small_batch_uses_mean_reference() {
        // Three candles (below the 5-candle median threshold): mean is 100,
        // floor is 2, the glitched candle sits below it.
        let mut candles: Vec<Candle> = (0..3).map(|i| candle(i, 100.0)).collect();
        candles[1].close = 1.5;
        candles[1].low = 1.5;
        // Mean shifts to ~67.2; floor ~1.34, so 1.5 survives.
        assert_eq!(find_price_anomaly(&candles, 50.0, 5), None);
        candles[1].low = 0.5;
        assert_eq!(find_price_anomaly(&candles, 50.0, 5), Some(1));
    }

    #[test]
    fn empty_batch_is_clean() {
        assert_eq!(find_price_anomaly(&[], 50.0, 5), None);
    }
}
