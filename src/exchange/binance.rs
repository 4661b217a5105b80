// =============================================================================
// Binance REST exchange — public kline fetches for live mode
// =============================================================================
//
// Only unauthenticated market-data endpoints are used; the engine never
// places orders. Fetches run under the configured retry policy, and every
// batch passes the anomaly filter before it is trusted: a glitched candle
// counts as a failed attempt.
// =============================================================================

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::contracts::Exchange;
use crate::exchange::find_price_anomaly;
use crate::types::{Candle, ExecutionContext, Interval};
use crate::vwap::vwap;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Decimal places used when a symbol has no explicit precision entry.
const DEFAULT_PRECISION: usize = 8;

/// Binance market-data client implementing the [`Exchange`] contract.
pub struct BinanceExchange {
    base_url: String,
    client: reqwest::Client,
    config: EngineConfig,
    /// (price_decimals, quantity_decimals) per symbol.
    precision: RwLock<HashMap<String, (usize, usize)>>,
}

impl BinanceExchange {
    pub fn new(config: EngineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = DEFAULT_BASE_URL, "BinanceExchange initialised");

        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            config,
            precision: RwLock::new(HashMap::new()),
        }
    }

    /// Point the client at a different host (testnet, local fixture server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Register tick/step precision for a symbol.
    pub fn set_precision(&self, symbol: &str, price_decimals: usize, quantity_decimals: usize) {
        self.precision
            .write()
            .insert(symbol.to_string(), (price_decimals, quantity_decimals));
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval.label(),
            count
        );
        if let Some(start) = start_ms {
            url.push_str(&format!("&startTime={start}"));
        }
        if let Some(end) = end_ms {
            url.push_str(&format!("&endTime={end}"));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to read klines response body")?;

        if !status.is_success() {
            bail!("klines request returned {status}: {body}");
        }

        parse_klines(&body)
    }

    /// Fetch with the configured retry policy; an anomalous batch counts as
    /// a failed attempt.
    async fn fetch_klines_checked(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let attempts = self.config.get_candles_retry_count.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .fetch_klines(symbol, interval, count, start_ms, end_ms)
                .await
            {
                Ok(candles) => {
                    match find_price_anomaly(
                        &candles,
                        self.config.price_anomaly_threshold_factor,
                        self.config.min_candles_for_median,
                    ) {
                        None => return Ok(candles),
                        Some(index) => {
                            warn!(
                                symbol,
                                attempt,
                                index,
                                "anomalous candle in kline batch, retrying"
                            );
                            last_error = Some(anyhow!(
                                "candle {index} of the kline batch failed the anomaly filter"
                            ));
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol, attempt, error = %format!("{e:#}"), "kline fetch failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.get_candles_retry_delay_ms,
                ))
                .await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("kline fetch failed with no recorded error")))
        .with_context(|| format!("kline fetch for {symbol} exhausted {attempts} attempts"))
    }

    fn decimals_for(&self, symbol: &str) -> (usize, usize) {
        self.precision
            .read()
            .get(symbol)
            .copied()
            .unwrap_or((DEFAULT_PRECISION, DEFAULT_PRECISION))
    }
}

#[async_trait]
impl Exchange for BinanceExchange {
    async fn get_average_price(&self, symbol: &str, ctx: &ExecutionContext) -> Result<f64> {
        let candles = self
            .fetch_klines_checked(
                symbol,
                Interval::OneMinute,
                self.config.avg_price_candles_count,
                None,
                Some(ctx.when),
            )
            .await?;
        vwap(&candles).ok_or_else(|| anyhow!("no candles returned for {symbol}"))
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Candle>> {
        self.fetch_klines_checked(symbol, interval, count, None, Some(ctx.when))
            .await
    }

    async fn get_next_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        from_ts: i64,
    ) -> Result<Vec<Candle>> {
        self.fetch_klines_checked(symbol, interval, count, Some(from_ts), None)
            .await
    }

    fn format_price(&self, symbol: &str, price: f64) -> String {
        let (decimals, _) = self.decimals_for(symbol);
        format!("{price:.decimals$}")
    }

    fn format_quantity(&self, symbol: &str, quantity: f64) -> String {
        let (_, decimals) = self.decimals_for(symbol);
        format!("{quantity:.decimals$}")
    }
}

/// Parse the kline endpoint's array-of-arrays payload.
///
/// Each entry is `[openTime, "open", "high", "low", "close", "volume",
/// closeTime, ...]` with prices serialised as strings.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let rows = body
        .as_array()
        .context("klines payload is not a JSON array")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row.as_array().context("kline entry is not an array")?;
        if fields.len() < 6 {
            bail!("kline entry has {} fields, expected at least 6", fields.len());
        }

        candles.push(Candle {
            timestamp: fields[0]
                .as_i64()
                .context("kline open time is not an integer")?,
            open: parse_string_f64(&fields[1], "open")?,
            high: parse_string_f64(&fields[2], "high")?,
            low: parse_string_f64(&fields[3], "low")?,
            close: parse_string_f64(&fields[4], "close")?,
            volume: parse_string_f64(&fields[5], "volume")?,
        });
    }
    Ok(candles)
}

/// Binance sends numeric values as JSON strings inside kline rows.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_klines_ok() {
        let body = serde_json::json!([
            [1700000000000_i64, "37000.00", "37050.00", "36990.00", "37020.00", "123.456",
             1700000059999_i64, "4567890.12", 1500, "60.123", "2224455.66", "0"],
            [1700000060000_i64, "37020.00", "37080.00", "37010.00", "37070.00", "98.7",
             1700000119999_i64, "3660000.00", 1200, "48.2", "1786000.00", "0"]
        ]);

        let candles = parse_klines(&body).expect("should parse");
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 1_700_000_000_000);
        assert!((candles[0].close - 37_020.0).abs() < f64::EPSILON);
        assert!((candles[1].volume - 98.7).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_klines_rejects_short_rows() {
        let body = serde_json::json!([[1700000000000_i64, "1.0", "2.0"]]);
        assert!(parse_klines(&body).is_err());
    }

    #[test]
    fn parse_klines_rejects_non_array() {
        let body = serde_json::json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(parse_klines(&body).is_err());
    }

    #[test]
    fn parse_string_f64_accepts_both_encodings() {
        assert!((parse_string_f64(&serde_json::json!("1.5"), "x").unwrap() - 1.5).abs()
            < f64::EPSILON);
        assert!((parse_string_f64(&serde_json::json!(2.5), "x").unwrap() - 2.5).abs()
            < f64::EPSILON);
        assert!(parse_string_f64(&serde_json::json!(null), "x").is_err());
    }

    #[test]
    fn precision_formatting() {
        let ex = BinanceExchange::new(EngineConfig::default());
        ex.set_precision("BTCUSDT", 2, 5);
        assert_eq!(ex.format_price("BTCUSDT", 37020.125), "37020.12");
        assert_eq!(ex.format_quantity("BTCUSDT", 0.1234567), "0.12346");
        // Unknown symbols fall back to 8 decimals.
        assert_eq!(ex.format_price("ETHUSDT", 1.5), "1.50000000");
    }
}
