// =============================================================================
// Default collaborators — risk gate, partial-close recorder, breakeven policy
// =============================================================================
//
// These are the stock implementations of the capability seams. Deployments
// with richer requirements supply their own; the engine only sees the traits.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::contracts::{BreakevenTracker, PartialTracker, RiskCheck, RiskManager};
use crate::signal::{PartialKind, SignalView};
use crate::types::{ExecutionContext, Side};

// =============================================================================
// PositionLimitRisk
// =============================================================================

/// Risk gate that caps the number of concurrently open signals across all
/// symbols sharing this manager.
#[derive(Debug)]
pub struct PositionLimitRisk {
    max_positions: usize,
    open: RwLock<HashMap<String, usize>>,
}

impl PositionLimitRisk {
    pub fn new(max_positions: usize) -> Self {
        Self {
            max_positions,
            open: RwLock::new(HashMap::new()),
        }
    }

    fn total_open(&self) -> usize {
        self.open.read().values().sum()
    }
}

#[async_trait]
impl RiskManager for PositionLimitRisk {
    async fn check_signal(&self, check: &RiskCheck) -> Result<bool> {
        let open = self.total_open();
        if open >= self.max_positions {
            warn!(
                symbol = %check.signal.symbol,
                id = %check.signal.id,
                open,
                limit = self.max_positions,
                "signal refused: concurrent position limit reached"
            );
            return Ok(false);
        }
        debug!(
            symbol = %check.signal.symbol,
            id = %check.signal.id,
            open,
            limit = self.max_positions,
            "signal admitted by position limit gate"
        );
        Ok(true)
    }

    async fn add_signal(&self, symbol: &str, _ctx: &ExecutionContext) -> Result<()> {
        *self.open.write().entry(symbol.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn remove_signal(&self, symbol: &str, _ctx: &ExecutionContext) -> Result<()> {
        let mut open = self.open.write();
        match open.get_mut(symbol) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                open.remove(symbol);
            }
            None => warn!(symbol, "remove_signal for a symbol with no open positions"),
        }
        Ok(())
    }
}

// =============================================================================
// MemoryPartialTracker
// =============================================================================

/// One recorded partial-close event.
#[derive(Debug, Clone, Serialize)]
pub struct PartialCloseRecord {
    pub symbol: String,
    pub signal_id: String,
    pub kind: PartialKind,
    pub percent: f64,
    pub price: f64,
    pub when: i64,
    pub backtest: bool,
}

/// Maximum number of partial-close records retained.
const MAX_PARTIAL_RECORDS: usize = 500;

/// In-memory recorder of partial-close events, for reports and dashboards.
#[derive(Debug, Default)]
pub struct MemoryPartialTracker {
    records: RwLock<Vec<PartialCloseRecord>>,
}

impl MemoryPartialTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the retained records (oldest first).
    pub fn records(&self) -> Vec<PartialCloseRecord> {
        self.records.read().clone()
    }

    fn push(&self, record: PartialCloseRecord) {
        let mut records = self.records.write();
        records.push(record);
        while records.len() > MAX_PARTIAL_RECORDS {
            records.remove(0);
        }
    }
}

#[async_trait]
impl PartialTracker for MemoryPartialTracker {
    async fn profit(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        percent: f64,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        self.push(PartialCloseRecord {
            symbol: symbol.to_string(),
            signal_id: signal.id.clone(),
            kind: PartialKind::Profit,
            percent,
            price,
            when: ctx.when,
            backtest: ctx.backtest,
        });
        Ok(())
    }

    async fn loss(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        percent: f64,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        self.push(PartialCloseRecord {
            symbol: symbol.to_string(),
            signal_id: signal.id.clone(),
            kind: PartialKind::Loss,
            percent,
            price,
            when: ctx.when,
            backtest: ctx.backtest,
        });
        Ok(())
    }

    async fn clear(
        &self,
        symbol: &str,
        signal: &SignalView,
        _price: f64,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        debug!(symbol, id = %signal.id, "partial ledger settled");
        Ok(())
    }
}

// =============================================================================
// CostCoverBreakeven
// =============================================================================

/// Breakeven policy that answers `true` once per signal, as soon as the
/// profit distance covers the fee+slippage round trip plus the configured
/// margin.
#[derive(Debug)]
pub struct CostCoverBreakeven {
    required_percent: f64,
    promoted: Mutex<HashSet<String>>,
}

impl CostCoverBreakeven {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            required_percent: config.round_trip_cost_percent()
                + config.breakeven_threshold_percent,
            promoted: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl BreakevenTracker for CostCoverBreakeven {
    async fn check(
        &self,
        symbol: &str,
        signal: &SignalView,
        price: f64,
        _ctx: &ExecutionContext,
    ) -> Result<bool> {
        if self.promoted.lock().contains(&signal.id) {
            return Ok(false);
        }

        let profit_percent = match signal.side {
            Side::Long => (price - signal.price_open) / signal.price_open * 100.0,
            Side::Short => (signal.price_open - price) / signal.price_open * 100.0,
        };
        if profit_percent < self.required_percent {
            return Ok(false);
        }

        self.promoted.lock().insert(signal.id.clone());
        info!(
            symbol,
            id = %signal.id,
            profit_percent,
            required = self.required_percent,
            "breakeven threshold reached"
        );
        Ok(true)
    }

    async fn clear(
        &self,
        _symbol: &str,
        signal: &SignalView,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        self.promoted.lock().remove(&signal.id);
        Ok(())
    }
}
