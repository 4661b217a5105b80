// =============================================================================
// Strategy state — per-(symbol, strategy) lifecycle bookkeeping
// =============================================================================
//
// One container per engine instance. At most one of the pending and
// scheduled slots is occupied at any instant; the container's mutators keep
// that invariant by construction. A just-cancelled scheduled signal parks in
// the cancelled slot until the next tick delivers its single cancellation
// event.
//
// Thread-safety: all fields live behind one `parking_lot::Mutex`; every
// method takes the lock for a short, await-free critical section.
// =============================================================================

use parking_lot::Mutex;

use crate::signal::SignalRow;
use crate::types::CancelReason;

/// Direction lock for trailing adjustments: the first shift fixes whether
/// subsequent shifts may only tighten or only loosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailDirection {
    Tightening,
    Loosening,
}

/// A cancelled scheduled signal awaiting its delivery event.
#[derive(Debug, Clone)]
pub struct CancelledSignal {
    pub row: SignalRow,
    pub reason: CancelReason,
    pub cancel_id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: Option<SignalRow>,
    scheduled: Option<SignalRow>,
    cancelled: Option<CancelledSignal>,
    stopped: bool,
    last_signal_at: Option<i64>,
    trail_stop_direction: Option<TrailDirection>,
    trail_take_direction: Option<TrailDirection>,
}

/// Lifecycle state for one (symbol, strategy) pair.
#[derive(Debug, Default)]
pub struct StrategyState {
    inner: Mutex<Inner>,
}

impl StrategyState {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn pending(&self) -> Option<SignalRow> {
        self.inner.lock().pending.clone()
    }

    pub fn scheduled(&self) -> Option<SignalRow> {
        self.inner.lock().scheduled.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    pub fn has_scheduled(&self) -> bool {
        self.inner.lock().scheduled.is_some()
    }

    pub fn stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn last_signal_at(&self) -> Option<i64> {
        self.inner.lock().last_signal_at
    }

    pub fn trail_stop_direction(&self) -> Option<TrailDirection> {
        self.inner.lock().trail_stop_direction
    }

    pub fn trail_take_direction(&self) -> Option<TrailDirection> {
        self.inner.lock().trail_take_direction
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    pub fn set_last_signal_at(&self, now_ms: i64) {
        self.inner.lock().last_signal_at = Some(now_ms);
    }

    /// Install an opened signal. The scheduled slot must be empty by the time
    /// this is called (activation takes the scheduled row out first).
    pub fn put_pending(&self, row: SignalRow) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.scheduled.is_none(),
            "pending and scheduled must never coexist"
        );
        inner.pending = Some(row);
    }

    /// Install a waiting scheduled signal. The pending slot must be empty.
    pub fn put_scheduled(&self, row: SignalRow) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.pending.is_none(),
            "pending and scheduled must never coexist"
        );
        inner.scheduled = Some(row);
    }

    /// Remove and return the open signal, clearing its trailing locks.
    pub fn take_pending(&self) -> Option<SignalRow> {
        let mut inner = self.inner.lock();
        inner.trail_stop_direction = None;
        inner.trail_take_direction = None;
        inner.pending.take()
    }

    pub fn take_scheduled(&self) -> Option<SignalRow> {
        self.inner.lock().scheduled.take()
    }

    /// Apply `mutate` to the open signal in place; returns the updated row.
    pub fn update_pending(
        &self,
        mutate: impl FnOnce(&mut SignalRow),
    ) -> Option<SignalRow> {
        let mut inner = self.inner.lock();
        match inner.pending.as_mut() {
            Some(row) => {
                mutate(row);
                Some(row.clone())
            }
            None => None,
        }
    }

    /// Park a cancelled scheduled signal for delivery on the next tick.
    pub fn deposit_cancelled(
        &self,
        row: SignalRow,
        reason: CancelReason,
        cancel_id: Option<String>,
    ) {
        self.inner.lock().cancelled = Some(CancelledSignal {
            row,
            reason,
            cancel_id,
        });
    }

    /// Remove and return the parked cancellation, if any.
    pub fn take_cancelled(&self) -> Option<CancelledSignal> {
        self.inner.lock().cancelled.take()
    }

    /// Stop admission of new signals and drop a waiting scheduled signal,
    /// returning it so the caller can clear its persisted record.
    pub fn set_stopped(&self) -> Option<SignalRow> {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        inner.scheduled.take()
    }

    pub fn set_trail_stop_direction(&self, dir: TrailDirection) {
        self.inner.lock().trail_stop_direction = Some(dir);
    }

    pub fn set_trail_take_direction(&self, dir: TrailDirection) {
        self.inner.lock().trail_take_direction = Some(dir);
    }

    /// Last-resort recovery: wipe everything back to idle.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner {
            stopped: inner.stopped,
            ..Inner::default()
        };
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn row() -> SignalRow {
        SignalRow {
            id: "sig-1".into(),
            symbol: "BTCUSDT".into(),
            exchange_name: "binance".into(),
            strategy_name: "demo".into(),
            frame_name: String::new(),
            side: Side::Long,
            price_open: 100.0,
            price_take_profit: 110.0,
            price_stop_loss: 90.0,
            minute_estimated_time: 30,
            note: None,
            scheduled_at: 1,
            pending_at: 1,
            is_scheduled: false,
            partials: Vec::new(),
            trailing_price_stop_loss: None,
            trailing_price_take_profit: None,
        }
    }

    #[test]
    fn pending_and_scheduled_are_exclusive() {
        let state = StrategyState::new();
        state.put_scheduled(row());
        assert!(state.has_scheduled());
        assert!(!state.has_pending());

        // Activation: take scheduled, then install pending.
        let taken = state.take_scheduled().unwrap();
        state.put_pending(taken);
        assert!(state.has_pending());
        assert!(!state.has_scheduled());
    }

    #[test]
    fn take_pending_clears_trailing_locks() {
        let state = StrategyState::new();
        state.put_pending(row());
        state.set_trail_stop_direction(TrailDirection::Tightening);
        state.take_pending();
        assert!(state.trail_stop_direction().is_none());
    }

    #[test]
    fn stop_discards_scheduled() {
        let state = StrategyState::new();
        state.put_scheduled(row());
        let dropped = state.set_stopped();
        assert!(dropped.is_some());
        assert!(state.stopped());
        assert!(!state.has_scheduled());
    }

    #[test]
    fn cancelled_slot_is_one_shot() {
        let state = StrategyState::new();
        state.deposit_cancelled(row(), CancelReason::User, Some("c1".into()));
        let first = state.take_cancelled().unwrap();
        assert_eq!(first.reason, CancelReason::User);
        assert_eq!(first.cancel_id.as_deref(), Some("c1"));
        assert!(state.take_cancelled().is_none());
    }

    #[test]
    fn update_pending_applies_in_place() {
        let state = StrategyState::new();
        state.put_pending(row());
        let updated = state
            .update_pending(|r| r.trailing_price_stop_loss = Some(95.0))
            .unwrap();
        assert_eq!(updated.trailing_price_stop_loss, Some(95.0));
        assert_eq!(state.pending().unwrap().trailing_price_stop_loss, Some(95.0));
    }

    #[test]
    fn reset_preserves_stop_flag() {
        let state = StrategyState::new();
        state.put_pending(row());
        state.set_stopped();
        state.reset();
        assert!(state.stopped());
        assert!(!state.has_pending());
    }
}
