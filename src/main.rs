// =============================================================================
// pulsekit — demo live runner
// =============================================================================
//
// Wires the engine to the public Binance market-data API with a small
// momentum strategy and runs one live loop per configured symbol. Ctrl+C
// triggers the graceful drain: no new signals are admitted, open positions
// resolve naturally, then the runners exit.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pulsekit::exchange::binance::BinanceExchange;
use pulsekit::{
    Candle, CostCoverBreakeven, EngineConfig, EngineDeps, EngineProfile, EngineRegistry,
    EventBus, Exchange, ExecutionContext, FileSignalStore, Interval, LiveRunner,
    MemoryPartialTracker, PositionLimitRisk, SignalEngine, SignalGenerator, SignalRequest,
    Side, SystemClock, TickResult,
};

/// Maximum concurrently open signals across all symbols.
const MAX_OPEN_SIGNALS: usize = 3;

// ---------------------------------------------------------------------------
// Demo strategy
// ---------------------------------------------------------------------------

/// Naive momentum probe: go long when the recent half-hour drifts upward by
/// more than the fee round trip.
struct MomentumStrategy {
    exchange: Arc<BinanceExchange>,
}

#[async_trait]
impl SignalGenerator for MomentumStrategy {
    async fn generate(&self, symbol: &str, now_ms: i64) -> Result<Option<SignalRequest>> {
        let ctx = ExecutionContext::new(symbol, now_ms, false);
        let candles = self
            .exchange
            .get_candles(symbol, Interval::OneMinute, 30, &ctx)
            .await?;
        if candles.len() < 30 {
            return Ok(None);
        }

        let (older, recent) = candles.split_at(candles.len() / 2);
        let mean =
            |c: &[Candle]| c.iter().map(|x| x.close).sum::<f64>() / c.len() as f64;
        let drift_percent = (mean(recent) - mean(older)) / mean(older) * 100.0;
        if drift_percent < 0.4 {
            return Ok(None);
        }

        let price = recent.last().map(|c| c.close).unwrap_or_default();
        Ok(Some(SignalRequest {
            side: Side::Long,
            price_take_profit: price * 1.015,
            price_stop_loss: price * 0.99,
            minute_estimated_time: 60,
            price_open: None,
            id: None,
            note: Some(format!("momentum drift {drift_percent:.3}%")),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("pulsekit live runner starting");

    let config = EngineConfig::load("pulsekit.json")
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            EngineConfig::default()
        })
        .apply_env();
    config.validate()?;

    let mut symbols: Vec<String> = std::env::var("PULSEKIT_SYMBOLS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        symbols = vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()];
    }
    info!(symbols = ?symbols, "configured trading pairs");

    // ── 2. Shared collaborators ──────────────────────────────────────────
    let exchange = Arc::new(BinanceExchange::new(config.clone()));
    let bus = Arc::new(EventBus::new());
    let state_dir =
        std::env::var("PULSEKIT_STATE_DIR").unwrap_or_else(|_| "pulsekit-state".into());
    let store = Arc::new(FileSignalStore::new(state_dir));
    let risk = Arc::new(PositionLimitRisk::new(MAX_OPEN_SIGNALS));
    let partial = Arc::new(MemoryPartialTracker::new());
    let breakeven = Arc::new(CostCoverBreakeven::new(config.clone()));
    let clock = Arc::new(SystemClock);

    // ── 3. Terminal-result logging consumer ──────────────────────────────
    bus.signal.on(|result: TickResult| {
        if let TickResult::Closed {
            meta,
            signal,
            close_reason,
            pnl_percent,
            ..
        } = result
        {
            info!(
                symbol = %meta.symbol,
                id = %signal.id,
                reason = %close_reason,
                pnl_percent,
                "signal settled"
            );
        }
    });

    // ── 4. One engine + live runner per symbol ───────────────────────────
    let registry = EngineRegistry::new();
    let mut shutdown_handles = Vec::new();
    let mut runner_tasks = Vec::new();

    for symbol in &symbols {
        let engine = SignalEngine::new(
            EngineProfile {
                symbol: symbol.clone(),
                strategy_name: "momentum-demo".into(),
                exchange_name: "binance".into(),
                frame_name: String::new(),
                interval: Interval::OneMinute,
                backtest: false,
            },
            config.clone(),
            Arc::new(MomentumStrategy {
                exchange: exchange.clone(),
            }),
            EngineDeps {
                exchange: exchange.clone(),
                risk: risk.clone(),
                partial: partial.clone(),
                breakeven: breakeven.clone(),
                store: store.clone(),
                bus: bus.clone(),
            },
        )?;
        registry.register(engine.clone());

        let (runner, handle) = LiveRunner::new(engine, clock.clone());
        shutdown_handles.push(handle);

        let sym = symbol.clone();
        runner_tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                warn!(symbol = %sym, error = %format!("{e:#}"), "live runner exited with error");
            }
        }));
    }

    info!(count = registry.len(), "live runners started. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, draining open positions");
    for handle in &shutdown_handles {
        handle.shutdown();
    }
    for task in runner_tasks {
        let _ = task.await;
    }

    info!("pulsekit shut down complete");
    Ok(())
}
