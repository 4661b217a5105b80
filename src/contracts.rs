// =============================================================================
// External capability contracts — the seams the engine is wired through
// =============================================================================
//
// The engine owns no I/O of its own: candles, risk decisions, partial-close
// bookkeeping, breakeven decisions, and time all arrive through these traits.
// Concrete providers live in `exchange/` and `trackers.rs`; tests plug in
// in-memory doubles.
//
// Every async capability receives the tick's `ExecutionContext`, so
// collaborators observe the engine's notion of "now" (frame timestamp in
// backtest, wall clock live) rather than reading the system clock themselves.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;

use crate::signal::{SignalRequest, SignalRow, SignalView};
use crate::types::{Candle, CancelReason, CloseReason, ExecutionContext, Interval};

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Candle and price source.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// VWAP over the last N closed 1-minute candles ending at `ctx.when`.
    async fn get_average_price(&self, symbol: &str, ctx: &ExecutionContext) -> Result<f64>;

    /// The most recent `count` candles ending at `ctx.when`.
    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Candle>>;

    /// Forward-looking historical fetch: `count` candles starting at
    /// `from_ts`. Only meaningful for historical providers; live providers
    /// return an error.
    async fn get_next_candles(
        &self,
        symbol: &str,
        interval: Interval,
        count: usize,
        from_ts: i64,
    ) -> Result<Vec<Candle>>;

    /// Render a price with the symbol's tick precision.
    fn format_price(&self, symbol: &str, price: f64) -> String;

    /// Render a quantity with the symbol's step precision.
    fn format_quantity(&self, symbol: &str, quantity: f64) -> String;
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Everything a risk manager sees when gating a prospective signal.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub signal: SignalRow,
    pub current_price: f64,
    /// Open positions this engine instance currently monitors (0 or 1).
    pub position_count: usize,
    pub ctx: ExecutionContext,
}

/// Gatekeeper for signal admission and the open-position ledger.
#[async_trait]
pub trait RiskManager: Send + Sync {
    /// `Ok(true)` admits the signal, `Ok(false)` rejects it quietly (the
    /// risk manager is expected to emit its own audit trail).
    async fn check_signal(&self, check: &RiskCheck) -> Result<bool>;

    /// A signal was opened for `symbol`.
    async fn add_signal(&self, symbol: &str, ctx: &ExecutionContext) -> Result<()>;

    /// The open signal for `symbol` terminated.
    async fn remove_signal(&self, symbol: &str, ctx: &ExecutionContext) -> Result<()>;
}

/// Risk manager that admits everything. The default when no risk policy is
/// supplied.
#[derive(Debug, Default)]
pub struct NoRisk;

#[async_trait]
impl RiskManager for NoRisk {
    async fn check_signal(&self, _check: &RiskCheck) -> Result<bool> {
        Ok(true)
    }

    async fn add_signal(&self, _symbol: &str, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn remove_signal(&self, _symbol: &str, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Partial-close reporting
// ---------------------------------------------------------------------------

/// Records partial-close events for downstream reporting.
#[async_trait]
pub trait PartialTracker: Send + Sync {
    async fn profit(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        percent: f64,
        ctx: &ExecutionContext,
    ) -> Result<()>;

    async fn loss(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        percent: f64,
        ctx: &ExecutionContext,
    ) -> Result<()>;

    /// The signal terminated; drop any per-signal accumulation.
    async fn clear(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        ctx: &ExecutionContext,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Breakeven
// ---------------------------------------------------------------------------

/// Decides when an open signal's stop-loss should be promoted to its entry
/// price.
#[async_trait]
pub trait BreakevenTracker: Send + Sync {
    /// `Ok(true)` instructs the engine to promote the stop-loss to breakeven
    /// on this step. Implementations are expected to answer `true` at most
    /// once per signal.
    async fn check(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        ctx: &ExecutionContext,
    ) -> Result<bool>;

    /// The signal terminated; drop any per-signal state.
    async fn clear(&self, symbol: &str, signal: &SignalView, ctx: &ExecutionContext)
        -> Result<()>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source for the live orchestrator.
pub trait Clock: Send + Sync {
    /// Unix milliseconds, UTC.
    fn now_ms(&self) -> i64;
}

/// Real clock backed by chrono.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests and deterministic replays.
#[derive(Debug)]
pub struct FrozenClock {
    now: std::sync::atomic::AtomicI64,
}

impl FrozenClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now
            .fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn now_ms(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// In-flight signal operations available to strategy code from inside
/// lifecycle hooks. Implemented by the engine.
#[async_trait]
pub trait SignalOps: Send + Sync {
    /// Close `percent` of the open position at `current_price`, banking
    /// profit. Returns whether the ledger accepted the entry.
    async fn partial_profit(&self, percent: f64, current_price: f64) -> Result<bool>;

    /// Close `percent` of the open position at `current_price`, realising
    /// loss. Returns whether the ledger accepted the entry.
    async fn partial_loss(&self, percent: f64, current_price: f64) -> Result<bool>;

    /// Shift the effective stop-loss distance by `percent_shift` (percent of
    /// open; negative tightens). Returns whether the shift was applied.
    async fn trailing_stop(&self, percent_shift: f64, current_price: f64) -> Result<bool>;

    /// Shift the effective take-profit distance by `percent_shift` (percent
    /// of open; negative tightens). Returns whether the shift was applied.
    async fn trailing_take(&self, percent_shift: f64, current_price: f64) -> Result<bool>;

    /// Promote the effective stop-loss to the entry price once profit covers
    /// the fee+slippage round trip plus the configured margin. Returns
    /// whether the promotion happened on this call.
    async fn breakeven(&self, current_price: f64) -> Result<bool>;

    /// Stop admitting new signals; a waiting scheduled signal is dropped.
    async fn stop(&self) -> Result<()>;

    /// Cancel the waiting scheduled signal; the next tick delivers a single
    /// user-cancellation event.
    async fn cancel(&self, cancel_id: Option<String>) -> Result<()>;
}

/// The user-supplied signal generator plus optional lifecycle hooks.
///
/// Hook errors never corrupt the engine: they are routed to the error bus
/// and the tick continues.
#[async_trait]
pub trait SignalGenerator: Send + Sync {
    /// Propose a signal for `symbol` at `now_ms`, or `None` to sit out this
    /// interval. Bounded by `max_signal_generation_seconds`.
    async fn generate(&self, symbol: &str, now_ms: i64) -> Result<Option<SignalRequest>>;

    /// A scheduled signal was admitted and is waiting for its entry price.
    async fn on_schedule(
        &self,
        _signal: &SignalView,
        _price: f64,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    /// A signal was opened (immediately or by scheduled activation).
    async fn on_open(
        &self,
        _signal: &SignalView,
        _price: f64,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    /// An open signal is being monitored. `ops` exposes partial/trailing/
    /// breakeven/cancel/stop calls for this engine instance.
    async fn on_active(
        &self,
        _ops: &dyn SignalOps,
        _signal: &SignalView,
        _price: f64,
        _percent_tp: f64,
        _percent_sl: f64,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    /// A scheduled signal is still waiting (fired once per waiting tick).
    async fn on_ping(
        &self,
        _signal: &SignalView,
        _price: f64,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    /// An open signal closed.
    async fn on_close(
        &self,
        _signal: &SignalView,
        _reason: CloseReason,
        _pnl_percent: f64,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    /// A scheduled signal was cancelled.
    async fn on_cancel(
        &self,
        _signal: &SignalView,
        _reason: CancelReason,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_clock_advances() {
        let clock = FrozenClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[tokio::test]
    async fn no_risk_admits_everything() {
        let risk = NoRisk;
        let ctx = ExecutionContext::new("BTCUSDT", 1, false);
        risk.add_signal("BTCUSDT", &ctx).await.unwrap();
        risk.remove_signal("BTCUSDT", &ctx).await.unwrap();
    }
}
