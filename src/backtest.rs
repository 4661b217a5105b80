// =============================================================================
// Backtest orchestrator — frame replay with fast-forward batching
// =============================================================================
//
// Drives one engine through a finite frame sequence. Ordinary frames cost a
// single `tick`; the moment a signal is admitted the orchestrator fetches a
// candle batch sized to guarantee a terminal outcome, hands it to the
// engine's fast-forward path, and skips the frames the replay consumed.
//
// Consumers pull terminal results one at a time (`next_result`), so a long
// backtest streams lazily; `run_to_end` drains the stream for callers that
// only want the final list. Per-frame faults are routed to the error topic
// and the iteration continues on the next frame.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bus::{CompletionEvent, ErrorEvent, ProgressEvent};
use crate::engine::SignalEngine;
use crate::outcome::TickResult;
use crate::timeframe::Timeframe;

/// Lazy backtest run over one (symbol, strategy) engine.
pub struct Backtester {
    engine: Arc<SignalEngine>,
    timeframe: Timeframe,
    frames: Vec<i64>,
    index: usize,
    finished: bool,
}

impl Backtester {
    pub fn new(engine: Arc<SignalEngine>, timeframe: Timeframe) -> Self {
        let frames = timeframe.frames();
        info!(
            symbol = %engine.profile().symbol,
            strategy = %engine.profile().strategy_name,
            frame = %timeframe.name,
            frames = frames.len(),
            "backtest prepared"
        );
        Self {
            engine,
            timeframe,
            frames,
            index: 0,
            finished: false,
        }
    }

    /// Frames processed so far.
    pub fn processed(&self) -> usize {
        self.index.min(self.frames.len())
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Advance until the next terminal (closed / cancelled) result, or
    /// `None` once the frame sequence is exhausted. The completion event
    /// fires exactly once, at exhaustion.
    pub async fn next_result(&mut self) -> Option<TickResult> {
        let total = self.frames.len();

        while self.index < total {
            let now = self.frames[self.index];
            self.publish_progress(total);

            let result = match self.engine.tick(now).await {
                Ok(result) => result,
                Err(e) => {
                    self.report_error(now, format!("tick failed: {e:#}"));
                    self.index += 1;
                    continue;
                }
            };
            self.engine.bus().signal.publish(&result);

            match &result {
                TickResult::Scheduled { signal, .. } => {
                    let extra_ms = self.engine.config().schedule_await_minutes * 60_000
                        + signal.minute_estimated_time * 60_000;
                    if let Some(result) = self.fast_forward(now, extra_ms).await {
                        return Some(result);
                    }
                }
                TickResult::Opened { signal, .. } => {
                    let extra_ms = signal.minute_estimated_time * 60_000;
                    if let Some(result) = self.fast_forward(now, extra_ms).await {
                        return Some(result);
                    }
                }
                _ => {
                    self.index += 1;
                    // A cancellation can surface straight from a tick (user
                    // cancel parked by a hook, scheduled timeout between
                    // batches); those are part of the terminal stream too.
                    if result.is_terminal() {
                        return Some(result);
                    }
                }
            }
        }

        if !self.finished {
            self.finished = true;
            self.engine.bus().completion.publish(&CompletionEvent {
                symbol: self.engine.profile().symbol.clone(),
                strategy_name: self.engine.profile().strategy_name.clone(),
                exchange_name: self.engine.profile().exchange_name.clone(),
                backtest: true,
            });
            info!(
                symbol = %self.engine.profile().symbol,
                strategy = %self.engine.profile().strategy_name,
                frames = total,
                "backtest complete"
            );
        }
        None
    }

    /// Fire-and-forget variant: drain the whole stream, returning every
    /// terminal result in order.
    pub async fn run_to_end(&mut self) -> Vec<TickResult> {
        let mut results = Vec::new();
        while let Some(result) = self.next_result().await {
            results.push(result);
        }
        results
    }

    /// Fetch a batch covering the VWAP warm-up plus `extra_ms` of monitoring
    /// and replay it. Returns a terminal result to yield, or `None` when the
    /// caller should keep iterating frames.
    async fn fast_forward(&mut self, now: i64, extra_ms: i64) -> Option<TickResult> {
        let step = self.timeframe.interval.as_millis();
        let window = self.engine.config().avg_price_candles_count;
        let warmup = window.saturating_sub(1);

        // Ceil so partial intervals still get a frame.
        let extra_frames = ((extra_ms + step - 1) / step).max(1) as usize;
        let count = warmup + extra_frames + 1;
        let start_ts = now - warmup as i64 * step;

        let candles = match self
            .engine
            .exchange()
            .get_next_candles(
                &self.engine.profile().symbol,
                self.timeframe.interval,
                count,
                start_ts,
            )
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                self.report_error(now, format!("candle batch fetch failed: {e:#}"));
                self.index += 1;
                return None;
            }
        };

        let forwarded = match self.engine.backtest(&candles).await {
            Ok(forwarded) => forwarded,
            Err(e) => {
                self.report_error(now, format!("fast-forward failed: {e:#}"));
                self.index += 1;
                return None;
            }
        };

        debug!(
            symbol = %self.engine.profile().symbol,
            from = now,
            frames_consumed = forwarded.frames_consumed,
            action = forwarded.result.action(),
            "fast-forward batch replayed"
        );

        self.index += forwarded.frames_consumed.max(1);
        self.engine.bus().signal.publish(&forwarded.result);

        if forwarded.result.is_terminal() {
            Some(forwarded.result)
        } else {
            // Scheduled signal still waiting; later frames keep watching it.
            None
        }
    }

    fn publish_progress(&self, total: usize) {
        self.engine.bus().progress.publish(&ProgressEvent {
            exchange_name: self.engine.profile().exchange_name.clone(),
            strategy_name: self.engine.profile().strategy_name.clone(),
            symbol: self.engine.profile().symbol.clone(),
            total_frames: total,
            processed_frames: self.index,
            progress: if total == 0 {
                1.0
            } else {
                self.index as f64 / total as f64
            },
        });
    }

    fn report_error(&self, when: i64, message: String) {
        warn!(
            symbol = %self.engine.profile().symbol,
            when,
            error = %message,
            "backtest frame skipped"
        );
        self.engine.bus().error.publish(&ErrorEvent {
            ctx: crate::types::ExecutionContext::new(
                self.engine.profile().symbol.clone(),
                when,
                true,
            ),
            strategy_name: self.engine.profile().strategy_name.clone(),
            message,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::EngineConfig;
    use crate::contracts::{NoRisk, SignalGenerator};
    use crate::engine::{EngineDeps, EngineProfile};
    use crate::exchange::memory::MemoryExchange;
    use crate::persistence::MemorySignalStore;
    use crate::signal::SignalRequest;
    use crate::trackers::{CostCoverBreakeven, MemoryPartialTracker};
    use crate::types::{Candle, CancelReason, CloseReason, Interval, Side};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const MIN: i64 = 60_000;

    #[derive(Default)]
    struct ScriptedGenerator {
        queue: Mutex<std::collections::VecDeque<SignalRequest>>,
    }

    impl ScriptedGenerator {
        fn with(requests: Vec<SignalRequest>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(requests.into()),
            })
        }
    }

    #[async_trait]
    impl SignalGenerator for ScriptedGenerator {
        async fn generate(&self, _symbol: &str, _now_ms: i64) -> Result<Option<SignalRequest>> {
            Ok(self.queue.lock().pop_front())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            percent_fee: 0.1,
            percent_slippage: 0.1,
            min_take_profit_distance_percent: 1.0,
            min_stop_loss_distance_percent: 0.1,
            breakeven_threshold_percent: 0.0,
            schedule_await_minutes: 10,
            ..EngineConfig::default()
        }
    }

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: i as i64 * MIN,
                open: close,
                high: close,
                low: close,
                close,
                volume: 10.0,
            })
            .collect()
    }

    fn build(
        requests: Vec<SignalRequest>,
        candles: Vec<Candle>,
        frames_end_min: i64,
    ) -> (Backtester, Arc<EventBus>) {
        let exchange = Arc::new(MemoryExchange::new(config().avg_price_candles_count));
        exchange.load("BTCUSDT", Interval::OneMinute, candles);
        let bus = Arc::new(EventBus::new());

        let engine = SignalEngine::new(
            EngineProfile {
                symbol: "BTCUSDT".into(),
                strategy_name: "demo".into(),
                exchange_name: "binance".into(),
                frame_name: "replay".into(),
                interval: Interval::OneMinute,
                backtest: true,
            },
            config(),
            ScriptedGenerator::with(requests),
            EngineDeps {
                exchange,
                risk: Arc::new(NoRisk),
                partial: Arc::new(MemoryPartialTracker::new()),
                breakeven: Arc::new(CostCoverBreakeven::new(config())),
                store: Arc::new(MemorySignalStore::new()),
                bus: bus.clone(),
            },
        )
        .unwrap();

        let timeframe = Timeframe::new("replay", 5 * MIN, frames_end_min * MIN, Interval::OneMinute);
        (Backtester::new(engine, timeframe), bus)
    }

    fn immediate_long() -> SignalRequest {
        SignalRequest {
            side: Side::Long,
            price_take_profit: 102.0,
            price_stop_loss: 99.0,
            minute_estimated_time: 10,
            price_open: None,
            id: None,
            note: None,
        }
    }

    #[tokio::test]
    async fn immediate_signal_streams_one_closed_result() {
        // Flat at 100 for warm-up + admission, then a march to the TP.
        let mut closes = vec![100.0; 8];
        closes.extend(vec![102.5; 20]);
        let (mut bt, bus) = build(vec![immediate_long()], candles_from_closes(&closes), 27);
        let mut progress = bus.progress.subscribe();
        let mut completion = bus.completion.subscribe();

        let first = bt.next_result().await.expect("one terminal result");
        match &first {
            TickResult::Closed { close_reason, .. } => {
                assert_eq!(*close_reason, CloseReason::TakeProfit)
            }
            other => panic!("expected Closed, got {}", other.action()),
        }

        assert!(bt.next_result().await.is_none());
        // Stream stays exhausted and completion fires once.
        assert!(bt.next_result().await.is_none());
        let event = completion.recv().await.unwrap();
        assert!(event.backtest);

        // Progress was emitted with sane bounds.
        let p = progress.recv().await.unwrap();
        assert_eq!(p.total_frames, bt.total_frames());
        assert!(p.progress >= 0.0 && p.progress <= 1.0);
    }

    #[tokio::test]
    async fn frame_skip_jumps_past_consumed_candles() {
        let mut closes = vec![100.0; 8];
        closes.extend(vec![102.5; 30]);
        let (mut bt, _bus) = build(vec![immediate_long()], candles_from_closes(&closes), 37);

        let _ = bt.next_result().await.expect("terminal result");
        // The replay consumed several frames beyond the admission tick.
        assert!(bt.processed() > 1, "processed {} frames", bt.processed());
        assert!(bt.next_result().await.is_none());
        assert_eq!(bt.processed(), bt.total_frames());
    }

    #[tokio::test]
    async fn scheduled_timeout_streams_cancellation() {
        // S2 shape: entry at 110 never reached, short side.
        let request = SignalRequest {
            side: Side::Short,
            price_open: Some(110.0),
            price_take_profit: 100.0,
            price_stop_loss: 115.0,
            minute_estimated_time: 5,
            id: None,
            note: None,
        };
        let closes = vec![105.0; 40];
        let (mut bt, _bus) = build(vec![request], candles_from_closes(&closes), 39);

        let result = bt.next_result().await.expect("cancellation");
        match result {
            TickResult::Cancelled { reason, close_timestamp, signal, .. } => {
                assert_eq!(reason, CancelReason::Timeout);
                // Admitted at frame 5, await window 10 minutes.
                assert_eq!(signal.scheduled_at, 5 * MIN);
                assert_eq!(close_timestamp, 15 * MIN);
            }
            other => panic!("expected Cancelled, got {}", other.action()),
        }
        assert!(bt.next_result().await.is_none());
    }

    #[tokio::test]
    async fn multiple_signals_stream_in_order() {
        // Two immediate signals; each expires flat, losing the round trip.
        let closes = vec![100.0; 60];
        let (mut bt, _bus) = build(
            vec![immediate_long(), immediate_long()],
            candles_from_closes(&closes),
            59,
        );

        let results = bt.run_to_end().await;
        assert_eq!(results.len(), 2);
        for result in &results {
            match result {
                TickResult::Closed { close_reason, .. } => {
                    assert_eq!(*close_reason, CloseReason::TimeExpired)
                }
                other => panic!("expected Closed, got {}", other.action()),
            }
        }
        // Chronological outcome stream.
        let t0 = match &results[0] {
            TickResult::Closed { close_timestamp, .. } => *close_timestamp,
            _ => unreachable!(),
        };
        let t1 = match &results[1] {
            TickResult::Closed { close_timestamp, .. } => *close_timestamp,
            _ => unreachable!(),
        };
        assert!(t1 > t0);
    }

    #[tokio::test]
    async fn determinism_across_runs() {
        // I5: identical inputs produce byte-identical terminal streams.
        let mut closes = vec![100.0; 8];
        closes.extend(vec![102.5; 30]);

        let (mut a, _) = build(vec![immediate_long()], candles_from_closes(&closes), 37);
        let (mut b, _) = build(vec![immediate_long()], candles_from_closes(&closes), 37);

        let ra = a.run_to_end().await;
        let rb = b.run_to_end().await;
        assert_eq!(
            serde_json::to_string(&ra).unwrap(),
            serde_json::to_string(&rb).unwrap()
        );
    }

    #[tokio::test]
    async fn empty_timeframe_completes_immediately() {
        let (mut bt, bus) = build(vec![], candles_from_closes(&[100.0; 10]), 4);
        // Frames start at minute 5 but end at minute 4: nothing to do.
        let mut completion = bus.completion.subscribe();
        assert_eq!(bt.total_frames(), 0);
        assert!(bt.next_result().await.is_none());
        assert!(completion.recv().await.is_some());
    }
}
