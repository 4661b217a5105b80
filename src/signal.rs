// =============================================================================
// Signal model — strategy proposals and the canonical admitted record
// =============================================================================
//
// A strategy returns a `SignalRequest` (its proposal). At admission the
// engine freezes it into a `SignalRow`: identity fields filled in, the open
// price resolved (VWAP for immediate entries, the requested level for
// scheduled ones), and the lifecycle bookkeeping attached.
//
// Trailing overrides and the partial-close ledger live on the row but are
// internal: events expose a `SignalView` where the stop-loss / take-profit
// shown are the *effective* levels and the admission levels move to
// `original_*` fields.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

// ---------------------------------------------------------------------------
// Strategy proposal (DTO)
// ---------------------------------------------------------------------------

/// A prospective signal returned by a strategy's `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub side: Side,
    pub price_take_profit: f64,
    pub price_stop_loss: f64,
    /// Maximum minutes the position may stay open once entered.
    pub minute_estimated_time: i64,
    /// Entry level for a scheduled signal. Absent = enter immediately at the
    /// current average price.
    #[serde(default)]
    pub price_open: Option<f64>,
    /// Externally supplied identifier; the engine generates one if absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Partial-close ledger
// ---------------------------------------------------------------------------

/// Whether a partial close banked profit or realised loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialKind {
    Profit,
    Loss,
}

impl std::fmt::Display for PartialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Profit => write!(f, "profit"),
            Self::Loss => write!(f, "loss"),
        }
    }
}

/// One entry in the partial-close ledger: `percent` of the position closed
/// at `price`. The ledger is ordered by insertion; the percent sum never
/// exceeds 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialEntry {
    pub kind: PartialKind,
    pub percent: f64,
    pub price: f64,
}

// ---------------------------------------------------------------------------
// Canonical admitted record
// ---------------------------------------------------------------------------

/// The canonical record of an admitted signal, produced from a
/// [`SignalRequest`] at the moment of admission and carried through the
/// whole lifecycle (persistence included).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: String,
    pub symbol: String,
    pub exchange_name: String,
    pub strategy_name: String,
    /// Backtest frame schema name; empty in live mode.
    #[serde(default)]
    pub frame_name: String,

    pub side: Side,
    /// Always populated: the requested level for scheduled signals, the
    /// admission VWAP for immediate ones.
    pub price_open: f64,
    pub price_take_profit: f64,
    pub price_stop_loss: f64,
    pub minute_estimated_time: i64,
    #[serde(default)]
    pub note: Option<String>,

    /// When the signal was admitted (ms).
    pub scheduled_at: i64,
    /// When the signal was activated (ms). Equal to `scheduled_at` for
    /// immediate signals.
    pub pending_at: i64,
    /// Still awaiting its entry price.
    #[serde(default)]
    pub is_scheduled: bool,

    /// Ordered partial-close ledger. Internal; exposed through the view's
    /// aggregate only.
    #[serde(default)]
    pub partials: Vec<PartialEntry>,
    /// Trailing override of the stop-loss, when set.
    #[serde(default)]
    pub trailing_price_stop_loss: Option<f64>,
    /// Trailing override of the take-profit, when set.
    #[serde(default)]
    pub trailing_price_take_profit: Option<f64>,
}

impl SignalRow {
    /// Effective stop-loss: the trailing override when present, otherwise the
    /// admission level.
    pub fn effective_stop_loss(&self) -> f64 {
        self.trailing_price_stop_loss.unwrap_or(self.price_stop_loss)
    }

    /// Effective take-profit: the trailing override when present, otherwise
    /// the admission level.
    pub fn effective_take_profit(&self) -> f64 {
        self.trailing_price_take_profit
            .unwrap_or(self.price_take_profit)
    }

    /// Position lifetime in milliseconds.
    pub fn lifetime_ms(&self) -> i64 {
        self.minute_estimated_time * 60_000
    }

    /// Sum of ledger percents (0..=100).
    pub fn partial_percent_total(&self) -> f64 {
        self.partials.iter().map(|p| p.percent).sum()
    }

    /// Progress from the open price toward the effective take-profit,
    /// clamped to 0..=100.
    pub fn percent_to_take_profit(&self, price: f64) -> f64 {
        let tp = self.effective_take_profit();
        let span = tp - self.price_open;
        if span == 0.0 {
            return 0.0;
        }
        (((price - self.price_open) / span) * 100.0).clamp(0.0, 100.0)
    }

    /// Progress from the open price toward the effective stop-loss,
    /// clamped to 0..=100.
    pub fn percent_to_stop_loss(&self, price: f64) -> f64 {
        let sl = self.effective_stop_loss();
        let span = self.price_open - sl;
        if span == 0.0 {
            return 0.0;
        }
        (((self.price_open - price) / span) * 100.0).clamp(0.0, 100.0)
    }

    /// `true` when `price` sits strictly on the profitable side of the open.
    pub fn in_profit_zone(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price > self.price_open,
            Side::Short => price < self.price_open,
        }
    }

    /// `true` when `price` sits strictly on the losing side of the open.
    pub fn in_loss_zone(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price < self.price_open,
            Side::Short => price > self.price_open,
        }
    }

    /// Build the externally visible view of this row.
    pub fn view(&self) -> SignalView {
        SignalView {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            exchange_name: self.exchange_name.clone(),
            strategy_name: self.strategy_name.clone(),
            frame_name: self.frame_name.clone(),
            side: self.side,
            price_open: self.price_open,
            price_take_profit: self.effective_take_profit(),
            price_stop_loss: self.effective_stop_loss(),
            original_price_take_profit: self.price_take_profit,
            original_price_stop_loss: self.price_stop_loss,
            minute_estimated_time: self.minute_estimated_time,
            note: self.note.clone(),
            scheduled_at: self.scheduled_at,
            pending_at: self.pending_at,
            is_scheduled: self.is_scheduled,
            partials: self.partials.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Public view
// ---------------------------------------------------------------------------

/// Signal as exposed on every event: trailing internals are folded into the
/// effective stop-loss / take-profit, with the admission levels preserved in
/// the `original_*` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalView {
    pub id: String,
    pub symbol: String,
    pub exchange_name: String,
    pub strategy_name: String,
    #[serde(default)]
    pub frame_name: String,
    pub side: Side,
    pub price_open: f64,
    pub price_take_profit: f64,
    pub price_stop_loss: f64,
    pub original_price_take_profit: f64,
    pub original_price_stop_loss: f64,
    pub minute_estimated_time: i64,
    #[serde(default)]
    pub note: Option<String>,
    pub scheduled_at: i64,
    pub pending_at: i64,
    pub is_scheduled: bool,
    #[serde(default)]
    pub partials: Vec<PartialEntry>,
}
