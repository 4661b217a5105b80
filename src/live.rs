// =============================================================================
// Live orchestrator — wall-clock tick loop with graceful drain
// =============================================================================
//
// On start the runner reloads whatever the persistence layer holds for its
// (symbol, strategy, exchange) slot, then ticks the engine at the configured
// period forever. Shutdown is cooperative: the first observation of the
// shutdown flag stops signal admission, after which the loop keeps yielding
// until the open position resolves (or there is none), emits the completion
// event, and ends.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::bus::{CompletionEvent, ErrorEvent};
use crate::contracts::{Clock, SignalOps};
use crate::engine::SignalEngine;
use crate::outcome::TickResult;

/// Requests a graceful stop of one [`LiveRunner`]. Clone freely; the first
/// `shutdown` call wins and the rest are no-ops.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("live shutdown requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Live tick loop for one engine.
pub struct LiveRunner {
    engine: Arc<SignalEngine>,
    clock: Arc<dyn Clock>,
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    stop_sent: bool,
    first_tick: bool,
    finished: bool,
}

impl LiveRunner {
    pub fn new(engine: Arc<SignalEngine>, clock: Arc<dyn Clock>) -> (Self, ShutdownHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let handle = ShutdownHandle {
            flag: flag.clone(),
            notify: notify.clone(),
        };
        (
            Self {
                engine,
                clock,
                flag,
                notify,
                stop_sent: false,
                first_tick: true,
                finished: false,
            },
            handle,
        )
    }

    /// Reload persisted signals into the engine before the first tick.
    pub async fn restore(&self) -> Result<()> {
        self.engine.restore_from_store(self.clock.now_ms()).await
    }

    /// Yield the next tick result, sleeping the configured period between
    /// ticks. Returns `None` once the graceful drain has finished.
    pub async fn next_result(&mut self) -> Option<TickResult> {
        loop {
            if self.finished {
                return None;
            }

            if self.first_tick {
                self.first_tick = false;
            } else {
                self.pace().await;
            }

            if self.flag.load(Ordering::SeqCst) && !self.stop_sent {
                self.stop_sent = true;
                if let Err(e) = self.engine.stop().await {
                    self.report_error(format!("stop failed: {e:#}"));
                }
            }

            let now = self.clock.now_ms();
            let result = match self.engine.tick(now).await {
                Ok(result) => result,
                Err(e) => {
                    // This iteration is lost; the loop carries on.
                    self.report_error(format!("tick failed: {e:#}"));
                    continue;
                }
            };
            self.engine.bus().signal.publish(&result);

            if self.stop_sent {
                let drained = result.is_closed()
                    || (matches!(result, TickResult::Idle { .. }) && !self.engine.has_pending());
                if drained {
                    self.finished = true;
                    self.engine.bus().completion.publish(&CompletionEvent {
                        symbol: self.engine.profile().symbol.clone(),
                        strategy_name: self.engine.profile().strategy_name.clone(),
                        exchange_name: self.engine.profile().exchange_name.clone(),
                        backtest: false,
                    });
                    info!(
                        symbol = %self.engine.profile().symbol,
                        strategy = %self.engine.profile().strategy_name,
                        "live runner drained"
                    );
                }
            }

            return Some(result);
        }
    }

    /// Restore, then drain the loop internally until shutdown completes.
    pub async fn run(mut self) -> Result<()> {
        self.restore().await?;
        while self.next_result().await.is_some() {}
        Ok(())
    }

    /// Sleep one tick period; a shutdown request cuts the sleep short.
    async fn pace(&self) {
        let period =
            std::time::Duration::from_millis(self.engine.config().live_tick_period_ms);
        if self.flag.load(Ordering::SeqCst) {
            tokio::time::sleep(period).await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = self.notify.notified() => {}
        }
    }

    fn report_error(&self, message: String) {
        warn!(
            symbol = %self.engine.profile().symbol,
            strategy = %self.engine.profile().strategy_name,
            error = %message,
            "live iteration fault"
        );
        self.engine.bus().error.publish(&ErrorEvent {
            ctx: crate::types::ExecutionContext::new(
                self.engine.profile().symbol.clone(),
                self.clock.now_ms(),
                false,
            ),
            strategy_name: self.engine.profile().strategy_name.clone(),
            message,
        });
    }
}
