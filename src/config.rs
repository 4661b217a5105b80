// =============================================================================
// Engine Configuration — immutable tuning knobs with atomic save
// =============================================================================
//
// Every numeric guarantee the engine enforces (fee/slippage accounting,
// distance floors, lifetime caps, retry policy) is parameterised here. The
// struct is loaded once, validated once, and passed into the engine by value;
// nothing mutates it afterwards.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  Each field can also be
// overridden through a `CC_*` environment variable.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_avg_price_candles_count() -> usize {
    5
}

fn default_percent_fee() -> f64 {
    0.1
}

fn default_percent_slippage() -> f64 {
    0.1
}

fn default_min_take_profit_distance_percent() -> f64 {
    1.0
}

fn default_min_stop_loss_distance_percent() -> f64 {
    0.1
}

fn default_max_stop_loss_distance_percent() -> f64 {
    20.0
}

fn default_max_signal_lifetime_minutes() -> i64 {
    10_080
}

fn default_max_signal_generation_seconds() -> u64 {
    60
}

fn default_schedule_await_minutes() -> i64 {
    120
}

fn default_breakeven_threshold_percent() -> f64 {
    0.1
}

fn default_get_candles_retry_count() -> u32 {
    3
}

fn default_get_candles_retry_delay_ms() -> u64 {
    1_000
}

fn default_price_anomaly_threshold_factor() -> f64 {
    50.0
}

fn default_min_candles_for_median() -> usize {
    5
}

fn default_live_tick_period_ms() -> u64 {
    61_000
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for a pulsekit engine instance.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Pricing -------------------------------------------------------------

    /// Number of 1-minute candles the average-price (VWAP) window covers.
    #[serde(default = "default_avg_price_candles_count")]
    pub avg_price_candles_count: usize,

    /// Per-transaction fee percentage, applied at entry and again at exit.
    #[serde(default = "default_percent_fee")]
    pub percent_fee: f64,

    /// Per-transaction slippage percentage, applied at entry and again at exit.
    #[serde(default = "default_percent_slippage")]
    pub percent_slippage: f64,

    // --- Admission distances -------------------------------------------------

    /// Minimum |TP - open| / open distance (percent) for a signal to be
    /// admitted. Must at least cover the fee+slippage round trip.
    #[serde(default = "default_min_take_profit_distance_percent")]
    pub min_take_profit_distance_percent: f64,

    /// Minimum |SL - open| / open distance (percent).
    #[serde(default = "default_min_stop_loss_distance_percent")]
    pub min_stop_loss_distance_percent: f64,

    /// Maximum |SL - open| / open distance (percent).
    #[serde(default = "default_max_stop_loss_distance_percent")]
    pub max_stop_loss_distance_percent: f64,

    // --- Lifetimes -----------------------------------------------------------

    /// Upper bound on a signal's `minute_estimated_time`.
    #[serde(default = "default_max_signal_lifetime_minutes")]
    pub max_signal_lifetime_minutes: i64,

    /// Timeout enforced on the user signal-generator call.
    #[serde(default = "default_max_signal_generation_seconds")]
    pub max_signal_generation_seconds: u64,

    /// A scheduled signal expires this many minutes after admission if its
    /// entry price is never reached.
    #[serde(default = "default_schedule_await_minutes")]
    pub schedule_await_minutes: i64,

    /// Extra profit percentage (above the fee+slippage floor) required before
    /// the stop-loss may be promoted to breakeven.
    #[serde(default = "default_breakeven_threshold_percent")]
    pub breakeven_threshold_percent: f64,

    // --- Candle fetch policy -------------------------------------------------

    /// How many times a failed or anomalous candle fetch is retried.
    #[serde(default = "default_get_candles_retry_count")]
    pub get_candles_retry_count: u32,

    /// Delay between candle fetch retries.
    #[serde(default = "default_get_candles_retry_delay_ms")]
    pub get_candles_retry_delay_ms: u64,

    /// A candle is anomalous when any OHLC component falls below
    /// `reference / factor` (reference = batch median or mean close).
    #[serde(default = "default_price_anomaly_threshold_factor")]
    pub price_anomaly_threshold_factor: f64,

    /// Minimum batch size before the anomaly reference uses a median instead
    /// of a mean.
    #[serde(default = "default_min_candles_for_median")]
    pub min_candles_for_median: usize,

    // --- Live loop -----------------------------------------------------------

    /// Live orchestrator polling period.
    #[serde(default = "default_live_tick_period_ms")]
    pub live_tick_period_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            avg_price_candles_count: default_avg_price_candles_count(),
            percent_fee: default_percent_fee(),
            percent_slippage: default_percent_slippage(),
            min_take_profit_distance_percent: default_min_take_profit_distance_percent(),
            min_stop_loss_distance_percent: default_min_stop_loss_distance_percent(),
            max_stop_loss_distance_percent: default_max_stop_loss_distance_percent(),
            max_signal_lifetime_minutes: default_max_signal_lifetime_minutes(),
            max_signal_generation_seconds: default_max_signal_generation_seconds(),
            schedule_await_minutes: default_schedule_await_minutes(),
            breakeven_threshold_percent: default_breakeven_threshold_percent(),
            get_candles_retry_count: default_get_candles_retry_count(),
            get_candles_retry_delay_ms: default_get_candles_retry_delay_ms(),
            price_anomaly_threshold_factor: default_price_anomaly_threshold_factor(),
            min_candles_for_median: default_min_candles_for_median(),
            live_tick_period_ms: default_live_tick_period_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `CC_*` environment variable overrides on top of `self`.
    ///
    /// Unparseable values are logged and skipped rather than aborting startup.
    pub fn apply_env(mut self) -> Self {
        fn override_from_env<T: std::str::FromStr>(slot: &mut T, name: &str) {
            if let Ok(raw) = std::env::var(name) {
                match raw.parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
                }
            }
        }

        override_from_env(&mut self.avg_price_candles_count, "CC_AVG_PRICE_CANDLES_COUNT");
        override_from_env(&mut self.percent_fee, "CC_PERCENT_FEE");
        override_from_env(&mut self.percent_slippage, "CC_PERCENT_SLIPPAGE");
        override_from_env(
            &mut self.min_take_profit_distance_percent,
            "CC_MIN_TAKEPROFIT_DISTANCE_PERCENT",
        );
        override_from_env(
            &mut self.min_stop_loss_distance_percent,
            "CC_MIN_STOPLOSS_DISTANCE_PERCENT",
        );
        override_from_env(
            &mut self.max_stop_loss_distance_percent,
            "CC_MAX_STOPLOSS_DISTANCE_PERCENT",
        );
        override_from_env(
            &mut self.max_signal_lifetime_minutes,
            "CC_MAX_SIGNAL_LIFETIME_MINUTES",
        );
        override_from_env(
            &mut self.max_signal_generation_seconds,
            "CC_MAX_SIGNAL_GENERATION_SECONDS",
        );
        override_from_env(&mut self.schedule_await_minutes, "CC_SCHEDULE_AWAIT_MINUTES");
        override_from_env(&mut self.breakeven_threshold_percent, "CC_BREAKEVEN_THRESHOLD");
        override_from_env(&mut self.get_candles_retry_count, "CC_GET_CANDLES_RETRY_COUNT");
        override_from_env(
            &mut self.get_candles_retry_delay_ms,
            "CC_GET_CANDLES_RETRY_DELAY_MS",
        );
        override_from_env(
            &mut self.price_anomaly_threshold_factor,
            "CC_GET_CANDLES_PRICE_ANOMALY_THRESHOLD_FACTOR",
        );
        override_from_env(
            &mut self.min_candles_for_median,
            "CC_GET_CANDLES_MIN_CANDLES_FOR_MEDIAN",
        );
        override_from_env(&mut self.live_tick_period_ms, "CC_LIVE_TICK_PERIOD_MS");

        self
    }

    /// Validate cross-field consistency. Called once at engine construction;
    /// a failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.avg_price_candles_count == 0 {
            bail!("avg_price_candles_count must be positive");
        }
        if self.percent_fee < 0.0 || self.percent_slippage < 0.0 {
            bail!("fee and slippage percentages must be non-negative");
        }
        let round_trip = 2.0 * (self.percent_fee + self.percent_slippage);
        if self.min_take_profit_distance_percent < round_trip {
            bail!(
                "min_take_profit_distance_percent {:.4} does not cover the \
                 fee+slippage round trip {:.4}",
                self.min_take_profit_distance_percent,
                round_trip
            );
        }
        if self.min_stop_loss_distance_percent > self.max_stop_loss_distance_percent {
            bail!(
                "min_stop_loss_distance_percent {:.4} exceeds max {:.4}",
                self.min_stop_loss_distance_percent,
                self.max_stop_loss_distance_percent
            );
        }
        if self.max_signal_lifetime_minutes <= 0 || self.schedule_await_minutes <= 0 {
            bail!("signal lifetime and schedule await windows must be positive");
        }
        if self.max_signal_generation_seconds == 0 {
            bail!("max_signal_generation_seconds must be positive");
        }
        if self.live_tick_period_ms == 0 {
            bail!("live_tick_period_ms must be positive");
        }
        if self.price_anomaly_threshold_factor <= 1.0 {
            bail!("price_anomaly_threshold_factor must exceed 1.0");
        }
        Ok(())
    }

    /// Fee + slippage applied on one side of a round trip (percent).
    pub fn entry_cost_percent(&self) -> f64 {
        self.percent_fee + self.percent_slippage
    }

    /// The profit distance (percent of open) that covers fees and slippage on
    /// both legs of a round trip.
    pub fn round_trip_cost_percent(&self) -> f64 {
        2.0 * self.entry_cost_percent()
    }
}
