// =============================================================================
// Shared types used across the pulsekit execution engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a signal: long profits from rising prices, short from
/// falling prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// `true` for [`Side::Long`].
    pub fn is_long(self) -> bool {
        matches!(self, Side::Long)
    }

    /// +1.0 for long, -1.0 for short. Used to sign PnL percentages.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Signal-generation throttle interval. One `generate` call is admitted per
/// interval per (symbol, strategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl Interval {
    pub fn minutes(self) -> i64 {
        match self {
            Self::OneMinute => 1,
            Self::ThreeMinutes => 3,
            Self::FiveMinutes => 5,
            Self::FifteenMinutes => 15,
            Self::ThirtyMinutes => 30,
            Self::OneHour => 60,
        }
    }

    pub fn as_millis(self) -> i64 {
        self.minutes() * 60_000
    }

    /// Exchange-facing interval label ("1m", "5m", ...).
    pub fn label(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::OneMinute
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Why an opened signal terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TimeExpired,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TimeExpired => write!(f, "time_expired"),
        }
    }
}

/// Why a scheduled signal was cancelled before it could open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The entry price was never reached within the await window.
    Timeout,
    /// Price crossed the stop-loss level before reaching the entry.
    PriceReject,
    /// Explicit `cancel()` from strategy code.
    User,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::PriceReject => write!(f, "price_reject"),
            Self::User => write!(f, "user"),
        }
    }
}

/// A single OHLCV candle. Values are finite and positive; `low <= open,
/// close <= high`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, Unix milliseconds UTC.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Typical price `(H + L + C) / 3`, the basis of the VWAP window.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Temporal view propagated to every external capability invoked from inside
/// a tick. Collaborators must use `when` as their notion of "now" so that
/// backtest and live observations stay consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub symbol: String,
    /// Unix milliseconds, UTC. Frame timestamp in backtest, wall clock live.
    pub when: i64,
    pub backtest: bool,
}

impl ExecutionContext {
    pub fn new(symbol: impl Into<String>, when: i64, backtest: bool) -> Self {
        Self {
            symbol: symbol.into(),
            when,
            backtest,
        }
    }
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}{}",
            self.symbol,
            self.when,
            if self.backtest { " (backtest)" } else { "" }
        )
    }
}
