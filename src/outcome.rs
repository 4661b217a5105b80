// =============================================================================
// Tick results — the tagged outcome of every engine step
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::signal::SignalView;
use crate::types::{CancelReason, CloseReason};

/// Fields common to every tick outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickMeta {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    #[serde(default)]
    pub frame_name: String,
    /// VWAP observed by this tick (for `Opened`, the signal's open price).
    pub current_price: f64,
    pub backtest: bool,
}

/// Tagged outcome of one engine step.
///
/// `Idle`, `Scheduled`, `Opened`, and `Active` describe progress; `Closed`
/// and `Cancelled` are terminal for the signal they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickResult {
    Idle {
        #[serde(flatten)]
        meta: TickMeta,
    },
    Scheduled {
        #[serde(flatten)]
        meta: TickMeta,
        signal: SignalView,
    },
    Opened {
        #[serde(flatten)]
        meta: TickMeta,
        signal: SignalView,
    },
    Active {
        #[serde(flatten)]
        meta: TickMeta,
        signal: SignalView,
        percent_tp: f64,
        percent_sl: f64,
    },
    Closed {
        #[serde(flatten)]
        meta: TickMeta,
        signal: SignalView,
        close_reason: CloseReason,
        close_timestamp: i64,
        pnl_percent: f64,
    },
    Cancelled {
        #[serde(flatten)]
        meta: TickMeta,
        signal: SignalView,
        reason: CancelReason,
        close_timestamp: i64,
        #[serde(default)]
        cancel_id: Option<String>,
    },
}

impl TickResult {
    pub fn meta(&self) -> &TickMeta {
        match self {
            Self::Idle { meta }
            | Self::Scheduled { meta, .. }
            | Self::Opened { meta, .. }
            | Self::Active { meta, .. }
            | Self::Closed { meta, .. }
            | Self::Cancelled { meta, .. } => meta,
        }
    }

    /// Closed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Cancelled { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Scheduled { .. } => "scheduled",
            Self::Opened { .. } => "opened",
            Self::Active { .. } => "active",
            Self::Closed { .. } => "closed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn signal(&self) -> Option<&SignalView> {
        match self {
            Self::Idle { .. } => None,
            Self::Scheduled { signal, .. }
            | Self::Opened { signal, .. }
            | Self::Active { signal, .. }
            | Self::Closed { signal, .. }
            | Self::Cancelled { signal, .. } => Some(signal),
        }
    }
}
