// =============================================================================
// In-memory exchange — preloaded candle history for backtests and tests
// =============================================================================
//
// The provider holds full candle series per (symbol, interval). Queries are
// bounded by the execution context's `when`, so an engine replaying frame N
// can never observe candles from frame N+1; only the explicitly
// forward-looking `get_next_candles` reaches into the future.
// =============================================================================

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::contracts::Exchange;
use crate::types::{Candle, ExecutionContext, Interval};
use crate::vwap::vwap;

/// Candle store keyed by (symbol, interval label).
pub struct MemoryExchange {
    avg_window: usize,
    series: RwLock<HashMap<(String, String), Vec<Candle>>>,
}

impl MemoryExchange {
    /// `avg_window` is the candle count behind `get_average_price`.
    pub fn new(avg_window: usize) -> Self {
        Self {
            avg_window: avg_window.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Load (or replace) the series for a symbol/interval. Candles are kept
    /// sorted by open time.
    pub fn load(&self, symbol: &str, interval: Interval, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        self.series
            .write()
            .insert((symbol.to_string(), interval.label().to_string()), candles);
    }

    fn window_until(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        until_ms: i64,
    ) -> Vec<Candle> {
        let series = self.series.read();
        let Some(candles) = series.get(&(symbol.to_string(), interval.label().to_string()))
        else {
            return Vec::new();
        };
        let upper = candles.partition_point(|c| c.timestamp <= until_ms);
        let lower = upper.saturating_sub(count);
        candles[lower..upper].to_vec()
    }
}

#[async_trait]
impl Exchange for MemoryExchange {
    async fn get_average_price(&self, symbol: &str, ctx: &ExecutionContext) -> Result<f64> {
        let window = self.window_until(symbol, Interval::OneMinute, self.avg_window, ctx.when);
        vwap(&window).ok_or_else(|| {
            anyhow!(
                "no candles loaded for {} at or before {}",
                symbol,
                ctx.when
            )
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Candle>> {
        Ok(self.window_until(symbol, interval, count, ctx.when))
    }

    async fn get_next_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        from_ts: i64,
    ) -> Result<Vec<Candle>> {
        let series = self.series.read();
        let Some(candles) = series.get(&(symbol.to_string(), interval.label().to_string()))
        else {
            return Ok(Vec::new());
        };
        let start = candles.partition_point(|c| c.timestamp < from_ts);
        let end = (start + count).min(candles.len());
        Ok(candles[start..end].to_vec())
    }

    fn format_price(&self, _symbol: &str, price: f64) -> String {
        format!("{price:.8}")
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }

    fn format_quantity(&self, _symbol: &str, quantity: f64) -> String {
        format!("{quantity:.8}")
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn minute_candles(count: usize, close: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                timestamp: i as i64 * MIN,
                open: close,
                high: close,
                low: close,
                close,
                volume: 5.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn average_price_is_bounded_by_when() {
        let ex = MemoryExchange::new(5);
        let mut candles = minute_candles(5, 100.0);
        candles.extend((5..10).map(|i| Candle {
            timestamp: i as i64 * MIN,
            open: 200.0,
            high: 200.0,
            low: 200.0,
            close: 200.0,
            volume: 5.0,
        }));
        ex.load("BTCUSDT", Interval::OneMinute, candles);

        // At minute 4 only the 100s are visible.
        let ctx = ExecutionContext::new("BTCUSDT", 4 * MIN, true);
        assert!((ex.get_average_price("BTCUSDT", &ctx).await.unwrap() - 100.0).abs() < 1e-9);

        // At minute 9 the window is entirely 200s.
        let ctx = ExecutionContext::new("BTCUSDT", 9 * MIN, true);
        assert!((ex.get_average_price("BTCUSDT", &ctx).await.unwrap() - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_series_is_an_error() {
        let ex = MemoryExchange::new(5);
        let ctx = ExecutionContext::new("NOPEUSDT", 0, true);
        assert!(ex.get_average_price("NOPEUSDT", &ctx).await.is_err());
    }

    #[tokio::test]
    async fn next_candles_read_forward() {
        let ex = MemoryExchange::new(5);
        ex.load("BTCUSDT", Interval::OneMinute, minute_candles(10, 100.0));

        let batch = ex
            .get_next_candles("BTCUSDT", Interval::OneMinute, 3, 4 * MIN)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].timestamp, 4 * MIN);
        assert_eq!(batch[2].timestamp, 6 * MIN);
    }

    #[tokio::test]
    async fn next_candles_clip_at_series_end() {
        let ex = MemoryExchange::new(5);
        ex.load("BTCUSDT", Interval::OneMinute, minute_candles(10, 100.0));

        let batch = ex
            .get_next_candles("BTCUSDT", Interval::OneMinute, 50, 8 * MIN)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn formatting_trims_trailing_zeros() {
        let ex = MemoryExchange::new(5);
        assert_eq!(ex.format_price("BTCUSDT", 100.5), "100.5");
        assert_eq!(ex.format_price("BTCUSDT", 100.0), "100");
        assert_eq!(ex.format_quantity("BTCUSDT", 0.12345678), "0.12345678");
    }
}
