// =============================================================================
// pulsekit — deterministic strategy execution engine
// =============================================================================
//
// Drives user-supplied signal generators through two temporally distinct
// modes — historical replay and real-time operation — over one signal state
// machine with strict guarantees on pricing, timing, risk, and PnL
// accounting.
// =============================================================================

pub mod backtest;
pub mod bus;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod exchange;
pub mod live;
pub mod outcome;
pub mod persistence;
pub mod pnl;
pub mod registry;
pub mod signal;
pub mod state;
pub mod timeframe;
pub mod trackers;
pub mod types;
pub mod validate;
pub mod vwap;

pub use backtest::Backtester;
pub use bus::{CompletionEvent, ErrorEvent, EventBus, ProgressEvent};
pub use config::EngineConfig;
pub use contracts::{
    BreakevenTracker, Clock, Exchange, FrozenClock, NoRisk, PartialTracker, RiskCheck,
    RiskManager, SignalGenerator, SignalOps, SystemClock,
};
pub use engine::{EngineDeps, EngineProfile, FastForward, SignalEngine};
pub use live::{LiveRunner, ShutdownHandle};
pub use outcome::{TickMeta, TickResult};
pub use persistence::{
    FileSignalStore, MemorySignalStore, SignalStore, StoreKey, StoreNamespace,
};
pub use pnl::PnlCalculator;
pub use registry::EngineRegistry;
pub use signal::{PartialEntry, PartialKind, SignalRequest, SignalRow, SignalView};
pub use state::StrategyState;
pub use timeframe::Timeframe;
pub use trackers::{CostCoverBreakeven, MemoryPartialTracker, PositionLimitRisk};
pub use types::{Candle, CancelReason, CloseReason, ExecutionContext, Interval, Side};
pub use validate::{validate_signal, ValidationFailure};
pub use vwap::vwap;
