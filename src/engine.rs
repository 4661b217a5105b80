// =============================================================================
// Signal Engine — lifecycle state machine for one (symbol, strategy) pair
// =============================================================================
//
// Life-cycle:
//   Idle  ->  Opened (immediate admission)            -> Closed
//   Idle  ->  Scheduled -> Opened (entry price hit)   -> Closed
//   Idle  ->  Scheduled -> Cancelled (timeout / price reject / user)
//
// `tick(now)` advances the machine by one observation of the market; in live
// mode `now` is the wall clock, in backtest it is the frame timestamp.
// `backtest(candles)` fast-forwards an already admitted signal through a
// candle batch and returns a single terminal outcome plus the number of
// frames it consumed.
//
// The engine performs no I/O of its own: prices come from the Exchange
// capability, durability from the SignalStore (live mode only), and risk /
// partial / breakeven decisions from their respective collaborators. Errors
// raised by strategy hooks are absorbed into the error topic; they never
// corrupt engine state.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{ErrorEvent, EventBus};
use crate::config::EngineConfig;
use crate::contracts::{
    BreakevenTracker, Exchange, PartialTracker, RiskCheck, RiskManager, SignalGenerator,
    SignalOps,
};
use crate::outcome::{TickMeta, TickResult};
use crate::persistence::{SignalStore, StoreKey, StoreNamespace};
use crate::pnl::PnlCalculator;
use crate::signal::{PartialEntry, PartialKind, SignalRequest, SignalRow};
use crate::state::{StrategyState, TrailDirection};
use crate::types::{
    Candle, CancelReason, CloseReason, ExecutionContext, Interval, Side,
};
use crate::validate::validate_signal;

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Identity of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineProfile {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    /// Backtest frame schema name; empty in live mode.
    pub frame_name: String,
    /// Signal-generation throttle interval.
    pub interval: Interval,
    pub backtest: bool,
}

/// External capabilities the engine is wired through.
#[derive(Clone)]
pub struct EngineDeps {
    pub exchange: Arc<dyn Exchange>,
    pub risk: Arc<dyn RiskManager>,
    pub partial: Arc<dyn PartialTracker>,
    pub breakeven: Arc<dyn BreakevenTracker>,
    pub store: Arc<dyn SignalStore>,
    pub bus: Arc<EventBus>,
}

/// Outcome of a fast-forward replay: the terminal (or still-waiting) result
/// and how many frames past the warm-up buffer were consumed.
#[derive(Debug, Clone)]
pub struct FastForward {
    pub result: TickResult,
    pub frames_consumed: usize,
}

/// Lifecycle engine for one (symbol, strategy) pair.
pub struct SignalEngine {
    profile: EngineProfile,
    config: EngineConfig,
    pnl: PnlCalculator,
    state: StrategyState,
    generator: Arc<dyn SignalGenerator>,
    deps: EngineDeps,
    /// Timestamp of the step currently executing; aux ops stamp their
    /// context with it.
    last_tick_ms: AtomicI64,
}

impl SignalEngine {
    pub fn new(
        profile: EngineProfile,
        config: EngineConfig,
        generator: Arc<dyn SignalGenerator>,
        deps: EngineDeps,
    ) -> Result<Arc<Self>> {
        config.validate().context("engine config rejected")?;
        let pnl = PnlCalculator::new(config.percent_fee, config.percent_slippage);

        info!(
            symbol = %profile.symbol,
            strategy = %profile.strategy_name,
            exchange = %profile.exchange_name,
            interval = %profile.interval,
            backtest = profile.backtest,
            "signal engine created"
        );

        Ok(Arc::new(Self {
            profile,
            config,
            pnl,
            state: StrategyState::new(),
            generator,
            deps,
            last_tick_ms: AtomicI64::new(0),
        }))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn profile(&self) -> &EngineProfile {
        &self.profile
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn has_pending(&self) -> bool {
        self.state.has_pending()
    }

    pub fn has_scheduled(&self) -> bool {
        self.state.has_scheduled()
    }

    pub fn store_key(&self) -> StoreKey {
        StoreKey::new(
            self.profile.symbol.clone(),
            self.profile.strategy_name.clone(),
            self.profile.exchange_name.clone(),
        )
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.deps.bus
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.deps.exchange
    }

    /// Install previously persisted rows (live startup). When both slots are
    /// somehow occupied the pending row wins, matching the state invariant.
    pub fn adopt(&self, pending: Option<SignalRow>, scheduled: Option<SignalRow>) {
        if let Some(row) = pending {
            info!(symbol = %self.profile.symbol, id = %row.id, "restored open signal");
            self.state.put_pending(row);
            if scheduled.is_some() {
                warn!(
                    symbol = %self.profile.symbol,
                    "both pending and scheduled records found, dropping the scheduled one"
                );
            }
            return;
        }
        if let Some(row) = scheduled {
            info!(symbol = %self.profile.symbol, id = %row.id, "restored scheduled signal");
            self.state.put_scheduled(row);
        }
    }

    /// Load persisted pending/scheduled rows and announce them to the
    /// strategy (live startup). Backtest engines have nothing to restore.
    pub async fn restore_from_store(&self, now_ms: i64) -> Result<()> {
        if self.profile.backtest {
            return Ok(());
        }

        let key = self.store_key();
        let pending = self
            .deps
            .store
            .read(StoreNamespace::Pending, &key)
            .await
            .context("failed to read persisted pending signal")?;
        let scheduled = self
            .deps
            .store
            .read(StoreNamespace::Scheduled, &key)
            .await
            .context("failed to read persisted scheduled signal")?;

        if pending.is_none() && scheduled.is_none() {
            return Ok(());
        }

        self.adopt(pending, scheduled);

        let ctx = self.ctx(now_ms);
        let vwap = self
            .deps
            .exchange
            .get_average_price(&self.profile.symbol, &ctx)
            .await
            .context("average price unavailable during restore")?;

        if let Some(row) = self.state.pending() {
            let percent_tp = row.percent_to_take_profit(vwap);
            let percent_sl = row.percent_to_stop_loss(vwap);
            self.run_hook(now_ms, "on_active", async {
                self.generator
                    .on_active(self, &row.view(), vwap, percent_tp, percent_sl, &ctx)
                    .await
            })
            .await;
        } else if let Some(row) = self.state.scheduled() {
            self.run_hook(now_ms, "on_schedule", async {
                self.generator.on_schedule(&row.view(), vwap, &ctx).await
            })
            .await;
        }
        Ok(())
    }

    fn ctx(&self, when: i64) -> ExecutionContext {
        ExecutionContext::new(self.profile.symbol.clone(), when, self.profile.backtest)
    }

    fn meta(&self, current_price: f64) -> TickMeta {
        TickMeta {
            symbol: self.profile.symbol.clone(),
            strategy_name: self.profile.strategy_name.clone(),
            exchange_name: self.profile.exchange_name.clone(),
            frame_name: self.profile.frame_name.clone(),
            current_price,
            backtest: self.profile.backtest,
        }
    }

    fn fresh_id(&self, now_ms: i64) -> String {
        if self.profile.backtest {
            // Reproducible across runs with the same frames.
            format!(
                "{}-{}-{}",
                self.profile.symbol, self.profile.strategy_name, now_ms
            )
        } else {
            Uuid::new_v4().to_string()
        }
    }

    /// Route a recoverable fault to the error topic.
    fn report_error(&self, when: i64, message: impl std::fmt::Display) {
        let message = message.to_string();
        warn!(
            symbol = %self.profile.symbol,
            strategy = %self.profile.strategy_name,
            error = %message,
            "recoverable engine fault"
        );
        self.deps.bus.error.publish(&ErrorEvent {
            ctx: self.ctx(when),
            strategy_name: self.profile.strategy_name.clone(),
            message,
        });
    }

    // -------------------------------------------------------------------------
    // Persistence helpers (no-ops in backtest mode)
    // -------------------------------------------------------------------------

    async fn persist(&self, ns: StoreNamespace, row: Option<&SignalRow>) -> Result<()> {
        if self.profile.backtest {
            return Ok(());
        }
        self.deps
            .store
            .write(ns, &self.store_key(), row)
            .await
            .context("signal persistence failed")
    }

    // -------------------------------------------------------------------------
    // tick
    // -------------------------------------------------------------------------

    /// Advance the state machine by one observation at `now_ms`.
    ///
    /// Returns `Err` only for faults that invalidate the whole step (price
    /// fetch exhausted its retries, persistence refused a write); the
    /// orchestrator reports those and carries on. Everything else — bad
    /// signals, generator timeouts, risk rejections — resolves to a result.
    pub async fn tick(&self, now_ms: i64) -> Result<TickResult> {
        self.last_tick_ms.store(now_ms, Ordering::SeqCst);
        let ctx = self.ctx(now_ms);

        let vwap = self
            .deps
            .exchange
            .get_average_price(&self.profile.symbol, &ctx)
            .await
            .context("average price unavailable")?;

        // ── 1. Parked cancellation: deliver exactly once ─────────────────
        if let Some(cancelled) = self.state.take_cancelled() {
            return Ok(self
                .finish_cancel(cancelled.row, cancelled.reason, cancelled.cancel_id, vwap, now_ms)
                .await);
        }

        // ── 2. Stopped and nothing left to watch ─────────────────────────
        if self.state.stopped() && !self.state.has_pending() {
            return Ok(TickResult::Idle {
                meta: self.meta(vwap),
            });
        }

        // ── 3. Waiting scheduled signal ──────────────────────────────────
        if let Some(row) = self.state.scheduled() {
            return Ok(self.step_scheduled(row, vwap, now_ms).await);
        }

        // ── 4. Open signal under monitoring ──────────────────────────────
        if let Some(row) = self.state.pending() {
            return Ok(self.step_pending(row, vwap, now_ms).await);
        }

        // ── 5. Idle: maybe ask the strategy for a signal ─────────────────
        self.step_idle(vwap, now_ms).await
    }

    // -------------------------------------------------------------------------
    // tick: idle → admission
    // -------------------------------------------------------------------------

    async fn step_idle(&self, vwap: f64, now_ms: i64) -> Result<TickResult> {
        let idle = TickResult::Idle {
            meta: self.meta(vwap),
        };

        // Interval throttle: one generate call per interval.
        if let Some(last) = self.state.last_signal_at() {
            if now_ms - last < self.profile.interval.as_millis() {
                return Ok(idle);
            }
        }
        self.state.set_last_signal_at(now_ms);

        let request = match self.call_generator(now_ms).await {
            Some(request) => request,
            None => return Ok(idle),
        };

        // Freeze the proposal into a row.
        let entry_already_met = match (request.price_open, request.side) {
            (Some(price_open), Side::Long) => vwap <= price_open,
            (Some(price_open), Side::Short) => vwap >= price_open,
            (None, _) => false,
        };
        let is_scheduled = request.price_open.is_some() && !entry_already_met;
        let price_open = request.price_open.unwrap_or(vwap);

        let row = SignalRow {
            id: request
                .id
                .clone()
                .unwrap_or_else(|| self.fresh_id(now_ms)),
            symbol: self.profile.symbol.clone(),
            exchange_name: self.profile.exchange_name.clone(),
            strategy_name: self.profile.strategy_name.clone(),
            frame_name: self.profile.frame_name.clone(),
            side: request.side,
            price_open,
            price_take_profit: request.price_take_profit,
            price_stop_loss: request.price_stop_loss,
            minute_estimated_time: request.minute_estimated_time,
            note: request.note.clone(),
            scheduled_at: now_ms,
            pending_at: now_ms,
            is_scheduled,
            partials: Vec::new(),
            trailing_price_stop_loss: None,
            trailing_price_take_profit: None,
        };

        // Risk gate first, then the validator; both reject quietly.
        if !self.risk_admits(&row, vwap, now_ms).await {
            return Ok(idle);
        }

        if let Err(failure) = validate_signal(&row, vwap, is_scheduled, &self.config) {
            self.report_error(now_ms, failure);
            return Ok(idle);
        }

        if is_scheduled {
            self.state.put_scheduled(row.clone());
            if let Err(e) = self.persist(StoreNamespace::Scheduled, Some(&row)).await {
                self.state.take_scheduled();
                return Err(e);
            }

            self.run_hook(now_ms, "on_schedule", async {
                self.generator
                    .on_schedule(&row.view(), vwap, &self.ctx(now_ms))
                    .await
            })
            .await;

            info!(
                symbol = %self.profile.symbol,
                id = %row.id,
                side = %row.side,
                price_open = row.price_open,
                "signal scheduled"
            );
            return Ok(TickResult::Scheduled {
                meta: self.meta(vwap),
                signal: row.view(),
            });
        }

        self.open_signal(row, now_ms).await
    }

    /// Call the strategy's generator under the configured timeout; any
    /// failure resolves to `None`.
    async fn call_generator(&self, now_ms: i64) -> Option<SignalRequest> {
        let window = std::time::Duration::from_secs(self.config.max_signal_generation_seconds);
        let generated = tokio::time::timeout(
            window,
            self.generator.generate(&self.profile.symbol, now_ms),
        )
        .await;

        match generated {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                self.report_error(now_ms, format!("signal generator failed: {e:#}"));
                None
            }
            Err(_) => {
                self.report_error(
                    now_ms,
                    format!(
                        "signal generator exceeded {}s",
                        self.config.max_signal_generation_seconds
                    ),
                );
                None
            }
        }
    }

    async fn risk_admits(&self, row: &SignalRow, current_price: f64, now_ms: i64) -> bool {
        let check = RiskCheck {
            signal: row.clone(),
            current_price,
            position_count: usize::from(self.state.has_pending()),
            ctx: self.ctx(now_ms),
        };
        match self.deps.risk.check_signal(&check).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(symbol = %self.profile.symbol, id = %row.id, "signal rejected by risk");
                false
            }
            Err(e) => {
                self.report_error(now_ms, format!("risk check failed: {e:#}"));
                false
            }
        }
    }

    /// Install an opened row: state, persistence, risk ledger, hook, event.
    async fn open_signal(&self, mut row: SignalRow, now_ms: i64) -> Result<TickResult> {
        row.is_scheduled = false;
        self.state.put_pending(row.clone());

        if let Err(e) = self.persist(StoreNamespace::Pending, Some(&row)).await {
            // Not admitted: roll the slot back before surfacing the fault.
            self.state.take_pending();
            return Err(e);
        }

        if let Err(e) = self
            .deps
            .risk
            .add_signal(&self.profile.symbol, &self.ctx(now_ms))
            .await
        {
            self.report_error(now_ms, format!("risk add_signal failed: {e:#}"));
        }

        self.run_hook(now_ms, "on_open", async {
            self.generator
                .on_open(&row.view(), row.price_open, &self.ctx(now_ms))
                .await
        })
        .await;

        info!(
            symbol = %self.profile.symbol,
            id = %row.id,
            side = %row.side,
            price_open = row.price_open,
            take_profit = row.price_take_profit,
            stop_loss = row.price_stop_loss,
            "signal opened"
        );

        Ok(TickResult::Opened {
            meta: self.meta(row.price_open),
            signal: row.view(),
        })
    }

    // -------------------------------------------------------------------------
    // tick: scheduled monitoring
    // -------------------------------------------------------------------------

    async fn step_scheduled(&self, row: SignalRow, vwap: f64, now_ms: i64) -> TickResult {
        // Timeout has priority over price action.
        if now_ms - row.scheduled_at >= self.config.schedule_await_minutes * 60_000 {
            self.state.take_scheduled();
            return self
                .finish_cancel(row, CancelReason::Timeout, None, vwap, now_ms)
                .await;
        }

        let (reject, entry) = match row.side {
            Side::Long => (vwap <= row.price_stop_loss, vwap <= row.price_open),
            Side::Short => (vwap >= row.price_stop_loss, vwap >= row.price_open),
        };

        // A price that crosses both levels in one step cancels; it never
        // opens into an immediately-dead position.
        if reject {
            self.state.take_scheduled();
            return self
                .finish_cancel(row, CancelReason::PriceReject, None, vwap, now_ms)
                .await;
        }

        if entry {
            return self.activate_scheduled(row, vwap, now_ms).await;
        }

        self.run_hook(now_ms, "on_ping", async {
            self.generator
                .on_ping(&row.view(), vwap, &self.ctx(now_ms))
                .await
        })
        .await;

        TickResult::Active {
            meta: self.meta(vwap),
            signal: row.view(),
            percent_tp: 0.0,
            percent_sl: 0.0,
        }
    }

    /// Entry price reached: re-run the risk gate and convert to pending.
    async fn activate_scheduled(
        &self,
        mut row: SignalRow,
        vwap: f64,
        now_ms: i64,
    ) -> TickResult {
        self.state.take_scheduled();

        if !self.risk_admits(&row, vwap, now_ms).await {
            // Rejected at activation: the scheduled signal is gone for good.
            if let Err(e) = self.persist(StoreNamespace::Scheduled, None).await {
                self.report_error(now_ms, format!("{e:#}"));
            }
            return TickResult::Idle {
                meta: self.meta(vwap),
            };
        }

        row.pending_at = now_ms;
        match self.open_signal(row, now_ms).await {
            Ok(result) => {
                if let Err(e) = self.persist(StoreNamespace::Scheduled, None).await {
                    self.report_error(now_ms, format!("{e:#}"));
                }
                result
            }
            Err(e) => {
                self.report_error(now_ms, format!("activation failed: {e:#}"));
                TickResult::Idle {
                    meta: self.meta(vwap),
                }
            }
        }
    }

    /// Shared tail of every cancellation path: persistence, trackers, hook,
    /// event.
    async fn finish_cancel(
        &self,
        row: SignalRow,
        reason: CancelReason,
        cancel_id: Option<String>,
        current_price: f64,
        now_ms: i64,
    ) -> TickResult {
        if let Err(e) = self.persist(StoreNamespace::Scheduled, None).await {
            self.report_error(now_ms, format!("{e:#}"));
        }

        self.run_hook(now_ms, "on_cancel", async {
            self.generator
                .on_cancel(&row.view(), reason, &self.ctx(now_ms))
                .await
        })
        .await;

        info!(
            symbol = %self.profile.symbol,
            id = %row.id,
            reason = %reason,
            "scheduled signal cancelled"
        );

        TickResult::Cancelled {
            meta: self.meta(current_price),
            signal: row.view(),
            reason,
            close_timestamp: now_ms,
            cancel_id,
        }
    }

    // -------------------------------------------------------------------------
    // tick: pending monitoring
    // -------------------------------------------------------------------------

    async fn step_pending(&self, row: SignalRow, vwap: f64, now_ms: i64) -> TickResult {
        if let Some((reason, close_price)) = Self::terminal_condition(&row, vwap, now_ms) {
            return self.close_pending(reason, close_price, now_ms).await;
        }

        self.active_step(&row, vwap, now_ms).await;

        // Re-read: hooks may have trailed the levels or added partials.
        let row = self.state.pending().unwrap_or(row);
        TickResult::Active {
            meta: self.meta(vwap),
            signal: row.view(),
            percent_tp: row.percent_to_take_profit(vwap),
            percent_sl: row.percent_to_stop_loss(vwap),
        }
    }

    /// Terminal checks in priority order: expiry, take-profit, stop-loss.
    /// TP/SL closures settle at the exact effective level, expiry at VWAP.
    fn terminal_condition(
        row: &SignalRow,
        vwap: f64,
        now_ms: i64,
    ) -> Option<(CloseReason, f64)> {
        if now_ms - row.pending_at >= row.lifetime_ms() {
            return Some((CloseReason::TimeExpired, vwap));
        }

        let tp = row.effective_take_profit();
        let sl = row.effective_stop_loss();
        match row.side {
            Side::Long => {
                if vwap >= tp {
                    return Some((CloseReason::TakeProfit, tp));
                }
                if vwap <= sl {
                    return Some((CloseReason::StopLoss, sl));
                }
            }
            Side::Short => {
                if vwap <= tp {
                    return Some((CloseReason::TakeProfit, tp));
                }
                if vwap >= sl {
                    return Some((CloseReason::StopLoss, sl));
                }
            }
        }
        None
    }

    /// Breakeven check + strategy hook for one monitored step.
    async fn active_step(&self, row: &SignalRow, price: f64, now_ms: i64) {
        let ctx = self.ctx(now_ms);

        match self
            .deps
            .breakeven
            .check(&self.profile.symbol, &row.view(), price, &ctx)
            .await
        {
            Ok(true) => {
                if let Err(e) = self.breakeven(price).await {
                    self.report_error(now_ms, format!("breakeven promotion failed: {e:#}"));
                }
            }
            Ok(false) => {}
            Err(e) => self.report_error(now_ms, format!("breakeven check failed: {e:#}")),
        }

        let percent_tp = row.percent_to_take_profit(price);
        let percent_sl = row.percent_to_stop_loss(price);
        self.run_hook(now_ms, "on_active", async {
            self.generator
                .on_active(self, &row.view(), price, percent_tp, percent_sl, &ctx)
                .await
        })
        .await;
    }

    /// Shared tail of every close path: PnL, trackers, risk ledger,
    /// persistence, hook, event.
    async fn close_pending(
        &self,
        reason: CloseReason,
        close_price: f64,
        now_ms: i64,
    ) -> TickResult {
        let Some(row) = self.state.take_pending() else {
            // Should be impossible; reset to a survivable state.
            self.report_error(now_ms, "close requested with no open signal");
            self.state.reset();
            return TickResult::Idle {
                meta: self.meta(close_price),
            };
        };

        let ctx = self.ctx(now_ms);
        let pnl_percent = self.pnl.weighted_percent(&row, close_price);

        if let Err(e) = self
            .deps
            .partial
            .clear(&self.profile.symbol, &row.view(), close_price, &ctx)
            .await
        {
            self.report_error(now_ms, format!("partial clear failed: {e:#}"));
        }
        if let Err(e) = self
            .deps
            .breakeven
            .clear(&self.profile.symbol, &row.view(), &ctx)
            .await
        {
            self.report_error(now_ms, format!("breakeven clear failed: {e:#}"));
        }
        if let Err(e) = self.deps.risk.remove_signal(&self.profile.symbol, &ctx).await {
            self.report_error(now_ms, format!("risk remove_signal failed: {e:#}"));
        }
        if let Err(e) = self.persist(StoreNamespace::Pending, None).await {
            self.report_error(now_ms, format!("{e:#}"));
        }

        self.run_hook(now_ms, "on_close", async {
            self.generator
                .on_close(&row.view(), reason, pnl_percent, &ctx)
                .await
        })
        .await;

        info!(
            symbol = %self.profile.symbol,
            id = %row.id,
            reason = %reason,
            close_price,
            pnl_percent,
            "signal closed"
        );

        TickResult::Closed {
            meta: self.meta(close_price),
            signal: row.view(),
            close_reason: reason,
            close_timestamp: now_ms,
            pnl_percent,
        }
    }

    async fn run_hook(
        &self,
        now_ms: i64,
        name: &str,
        hook: impl std::future::Future<Output = Result<()>>,
    ) {
        if let Err(e) = hook.await {
            self.report_error(now_ms, format!("{name} hook failed: {e:#}"));
        }
    }

    // -------------------------------------------------------------------------
    // backtest — fast-forward replay of an admitted signal
    // -------------------------------------------------------------------------

    /// Replay an admitted scheduled or pending signal through `candles`
    /// (chronological, 1-minute). The first `N-1` candles only prime the
    /// VWAP window; monitoring starts at index `N-1`.
    ///
    /// Returns the terminal outcome, or a still-waiting `Active` result when
    /// the batch ends before a scheduled signal resolves.
    pub async fn backtest(&self, candles: &[Candle]) -> Result<FastForward> {
        let window = self.config.avg_price_candles_count;
        let warmup = window.saturating_sub(1);
        if candles.len() <= warmup {
            return Err(anyhow!(
                "candle batch of {} cannot cover the {}-candle warm-up",
                candles.len(),
                window
            ));
        }

        let mut frames_consumed = 0usize;

        for i in warmup..candles.len() {
            let candle = &candles[i];
            let now_ms = candle.timestamp;
            frames_consumed += 1;
            self.last_tick_ms.store(now_ms, Ordering::SeqCst);

            // ── Scheduled: wait for the entry price ──────────────────────
            if let Some(row) = self.state.scheduled() {
                if let Some(cancelled) = self.state.take_cancelled() {
                    self.state.take_scheduled();
                    let result = self
                        .finish_cancel(
                            cancelled.row,
                            cancelled.reason,
                            cancelled.cancel_id,
                            candle.close,
                            now_ms,
                        )
                        .await;
                    return Ok(FastForward {
                        result,
                        frames_consumed,
                    });
                }

                if now_ms - row.scheduled_at >= self.config.schedule_await_minutes * 60_000 {
                    self.state.take_scheduled();
                    let result = self
                        .finish_cancel(row, CancelReason::Timeout, None, candle.close, now_ms)
                        .await;
                    return Ok(FastForward {
                        result,
                        frames_consumed,
                    });
                }

                // Intra-candle extremes drive scheduled transitions; the
                // stop-loss side wins when one candle spans both levels.
                let (reject, entry) = match row.side {
                    Side::Long => (
                        candle.low <= row.price_stop_loss,
                        candle.low <= row.price_open,
                    ),
                    Side::Short => (
                        candle.high >= row.price_stop_loss,
                        candle.high >= row.price_open,
                    ),
                };

                if reject {
                    self.state.take_scheduled();
                    let result = self
                        .finish_cancel(
                            row,
                            CancelReason::PriceReject,
                            None,
                            candle.close,
                            now_ms,
                        )
                        .await;
                    return Ok(FastForward {
                        result,
                        frames_consumed,
                    });
                }

                if entry {
                    self.state.take_scheduled();
                    let mut row = row;
                    if !self.risk_admits(&row, candle.close, now_ms).await {
                        let result = TickResult::Idle {
                            meta: self.meta(candle.close),
                        };
                        return Ok(FastForward {
                            result,
                            frames_consumed,
                        });
                    }
                    // The triggering candle's open time is the activation
                    // moment in replay; live activation uses the wall clock.
                    row.pending_at = now_ms;
                    row.is_scheduled = false;
                    self.state.put_pending(row.clone());
                    if let Err(e) = self
                        .deps
                        .risk
                        .add_signal(&self.profile.symbol, &self.ctx(now_ms))
                        .await
                    {
                        self.report_error(now_ms, format!("risk add_signal failed: {e:#}"));
                    }
                    self.run_hook(now_ms, "on_open", async {
                        self.generator
                            .on_open(&row.view(), row.price_open, &self.ctx(now_ms))
                            .await
                    })
                    .await;
                }
                continue;
            }

            // ── Pending: monitor against the trailing VWAP window ────────
            if let Some(row) = self.state.pending() {
                let window_start = (i + 1).saturating_sub(window);
                let vwap = crate::vwap::vwap(&candles[window_start..=i])
                    .context("empty VWAP window in replay")?;

                if let Some((reason, close_price)) =
                    Self::terminal_condition(&row, vwap, now_ms)
                {
                    let result = self.close_pending(reason, close_price, now_ms).await;
                    return Ok(FastForward {
                        result,
                        frames_consumed,
                    });
                }

                self.active_step(&row, vwap, now_ms).await;
                continue;
            }

            // Neither slot occupied: the signal resolved out from under the
            // replay (user stop).
            let result = TickResult::Idle {
                meta: self.meta(candle.close),
            };
            return Ok(FastForward {
                result,
                frames_consumed,
            });
        }

        // Batch exhausted.
        let last = &candles[candles.len() - 1];
        if self.state.has_pending() {
            let window_start = candles.len().saturating_sub(window);
            let vwap = crate::vwap::vwap(&candles[window_start..])
                .context("empty VWAP window in replay")?;
            let result = self
                .close_pending(CloseReason::TimeExpired, vwap, last.timestamp)
                .await;
            return Ok(FastForward {
                result,
                frames_consumed,
            });
        }

        if let Some(row) = self.state.scheduled() {
            // Still waiting; the orchestrator may supply more candles later.
            let result = TickResult::Active {
                meta: self.meta(last.close),
                signal: row.view(),
                percent_tp: 0.0,
                percent_sl: 0.0,
            };
            return Ok(FastForward {
                result,
                frames_consumed,
            });
        }

        Ok(FastForward {
            result: TickResult::Idle {
                meta: self.meta(last.close),
            },
            frames_consumed,
        })
    }
}

// =============================================================================
// In-flight signal operations (the strategy-facing facade)
// =============================================================================

#[async_trait]
impl SignalOps for SignalEngine {
    async fn partial_profit(&self, percent: f64, current_price: f64) -> Result<bool> {
        self.apply_partial(PartialKind::Profit, percent, current_price)
            .await
    }

    async fn partial_loss(&self, percent: f64, current_price: f64) -> Result<bool> {
        self.apply_partial(PartialKind::Loss, percent, current_price)
            .await
    }

    async fn trailing_stop(&self, percent_shift: f64, current_price: f64) -> Result<bool> {
        self.apply_trailing(TrailTarget::StopLoss, percent_shift, current_price)
            .await
    }

    async fn trailing_take(&self, percent_shift: f64, current_price: f64) -> Result<bool> {
        self.apply_trailing(TrailTarget::TakeProfit, percent_shift, current_price)
            .await
    }

    async fn breakeven(&self, current_price: f64) -> Result<bool> {
        let Some(row) = self.state.pending() else {
            return Ok(false);
        };

        // Profit must cover both legs of fees+slippage plus the margin.
        let required =
            self.config.round_trip_cost_percent() + self.config.breakeven_threshold_percent;
        let profit_percent =
            row.side.sign() * (current_price - row.price_open) / row.price_open * 100.0;
        if profit_percent < required {
            return Ok(false);
        }

        // Already at or beyond breakeven for the current trailing state.
        if let Some(trailing) = row.trailing_price_stop_loss {
            let at_or_past = match row.side {
                Side::Long => trailing >= row.price_open,
                Side::Short => trailing <= row.price_open,
            };
            if at_or_past {
                return Ok(false);
            }
        }

        let updated = self
            .state
            .update_pending(|r| r.trailing_price_stop_loss = Some(r.price_open));
        if let Some(updated) = updated {
            self.persist(StoreNamespace::Pending, Some(&updated)).await?;
            info!(
                symbol = %self.profile.symbol,
                id = %updated.id,
                stop_loss = updated.price_open,
                "stop-loss promoted to breakeven"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn stop(&self) -> Result<()> {
        let dropped = self.state.set_stopped();
        info!(
            symbol = %self.profile.symbol,
            strategy = %self.profile.strategy_name,
            dropped_scheduled = dropped.is_some(),
            "engine stopped"
        );
        if dropped.is_some() {
            self.persist(StoreNamespace::Scheduled, None).await?;
        }
        Ok(())
    }

    async fn cancel(&self, cancel_id: Option<String>) -> Result<()> {
        if let Some(row) = self.state.take_scheduled() {
            debug!(symbol = %self.profile.symbol, id = %row.id, "scheduled signal cancel requested");
            self.state
                .deposit_cancelled(row, CancelReason::User, cancel_id);
        }
        Ok(())
    }
}

/// Which level a trailing shift adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrailTarget {
    StopLoss,
    TakeProfit,
}

impl SignalEngine {
    async fn apply_partial(
        &self,
        kind: PartialKind,
        percent: f64,
        current_price: f64,
    ) -> Result<bool> {
        if !(percent > 0.0 && percent <= 100.0) || !percent.is_finite() {
            return Ok(false);
        }
        let Some(row) = self.state.pending() else {
            return Ok(false);
        };

        let zone_ok = match kind {
            PartialKind::Profit => row.in_profit_zone(current_price),
            PartialKind::Loss => row.in_loss_zone(current_price),
        };
        if !zone_ok {
            return Ok(false);
        }
        if row.partial_percent_total() + percent > 100.0 {
            return Ok(false);
        }

        let updated = self.state.update_pending(|r| {
            r.partials.push(PartialEntry {
                kind,
                percent,
                price: current_price,
            })
        });
        let Some(updated) = updated else {
            return Ok(false);
        };
        self.persist(StoreNamespace::Pending, Some(&updated)).await?;

        let when = self.last_tick_ms.load(Ordering::SeqCst);
        let ctx = self.ctx(when);
        let tracked = match kind {
            PartialKind::Profit => {
                self.deps
                    .partial
                    .profit(
                        &self.profile.symbol,
                        &updated.view(),
                        current_price,
                        percent,
                        &ctx,
                    )
                    .await
            }
            PartialKind::Loss => {
                self.deps
                    .partial
                    .loss(
                        &self.profile.symbol,
                        &updated.view(),
                        current_price,
                        percent,
                        &ctx,
                    )
                    .await
            }
        };
        if let Err(e) = tracked {
            self.report_error(when, format!("partial tracker failed: {e:#}"));
        }

        info!(
            symbol = %self.profile.symbol,
            id = %updated.id,
            kind = %kind,
            percent,
            price = current_price,
            "partial close recorded"
        );
        Ok(true)
    }

    async fn apply_trailing(
        &self,
        target: TrailTarget,
        percent_shift: f64,
        current_price: f64,
    ) -> Result<bool> {
        if percent_shift == 0.0 || !percent_shift.is_finite() {
            return Ok(false);
        }
        let Some(row) = self.state.pending() else {
            return Ok(false);
        };

        // The first shift locks the direction; later shifts must keep it.
        let direction = if percent_shift < 0.0 {
            TrailDirection::Tightening
        } else {
            TrailDirection::Loosening
        };
        let locked = match target {
            TrailTarget::StopLoss => self.state.trail_stop_direction(),
            TrailTarget::TakeProfit => self.state.trail_take_direction(),
        };
        if let Some(locked) = locked {
            if locked != direction {
                debug!(
                    symbol = %self.profile.symbol,
                    id = %row.id,
                    "trailing shift ignored: direction lock"
                );
                return Ok(false);
            }
        }

        let new_level = match target {
            TrailTarget::StopLoss => {
                let current = row.effective_stop_loss();
                let distance = (row.price_open - current).abs() / row.price_open * 100.0
                    * if row.in_profit_zone(current) { -1.0 } else { 1.0 };
                let new_distance = distance + percent_shift;
                match row.side {
                    Side::Long => row.price_open * (1.0 - new_distance / 100.0),
                    Side::Short => row.price_open * (1.0 + new_distance / 100.0),
                }
            }
            TrailTarget::TakeProfit => {
                let current = row.effective_take_profit();
                let distance = (current - row.price_open).abs() / row.price_open * 100.0;
                let new_distance = (distance + percent_shift).max(0.0);
                match row.side {
                    Side::Long => row.price_open * (1.0 + new_distance / 100.0),
                    Side::Short => row.price_open * (1.0 - new_distance / 100.0),
                }
            }
        };

        // A level the market has already crossed would fire instantly; a
        // level crossing its counterpart would invert the band.
        let viable = match (target, row.side) {
            (TrailTarget::StopLoss, Side::Long) => {
                current_price > new_level && new_level < row.effective_take_profit()
            }
            (TrailTarget::StopLoss, Side::Short) => {
                current_price < new_level && new_level > row.effective_take_profit()
            }
            (TrailTarget::TakeProfit, Side::Long) => {
                current_price < new_level && new_level > row.effective_stop_loss()
            }
            (TrailTarget::TakeProfit, Side::Short) => {
                current_price > new_level && new_level < row.effective_stop_loss()
            }
        };
        if !viable {
            debug!(
                symbol = %self.profile.symbol,
                id = %row.id,
                new_level,
                "trailing shift ignored: level not viable"
            );
            return Ok(false);
        }

        let updated = self.state.update_pending(|r| match target {
            TrailTarget::StopLoss => r.trailing_price_stop_loss = Some(new_level),
            TrailTarget::TakeProfit => r.trailing_price_take_profit = Some(new_level),
        });
        let Some(updated) = updated else {
            return Ok(false);
        };
        match target {
            TrailTarget::StopLoss => self.state.set_trail_stop_direction(direction),
            TrailTarget::TakeProfit => self.state.set_trail_take_direction(direction),
        }
        self.persist(StoreNamespace::Pending, Some(&updated)).await?;

        info!(
            symbol = %self.profile.symbol,
            id = %updated.id,
            target = ?target,
            new_level,
            "trailing level adjusted"
        );
        Ok(true)
    }
}
