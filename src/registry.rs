// =============================================================================
// Engine registry — explicit (symbol, strategy) → engine map
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::SignalEngine;

/// Owns the engines an orchestration layer is driving, keyed by the
/// normalized (symbol, strategy) tuple.
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<(String, String), Arc<SignalEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(symbol: &str, strategy: &str) -> (String, String) {
        (
            symbol.trim().to_uppercase(),
            strategy.trim().to_string(),
        )
    }

    /// Register an engine under its own profile. Replaces (and returns) any
    /// previous engine for the same pair.
    pub fn register(&self, engine: Arc<SignalEngine>) -> Option<Arc<SignalEngine>> {
        let key = Self::key(
            &engine.profile().symbol,
            &engine.profile().strategy_name,
        );
        self.engines.write().insert(key, engine)
    }

    pub fn get(&self, symbol: &str, strategy: &str) -> Option<Arc<SignalEngine>> {
        self.engines
            .read()
            .get(&Self::key(symbol, strategy))
            .cloned()
    }

    pub fn remove(&self, symbol: &str, strategy: &str) -> Option<Arc<SignalEngine>> {
        self.engines.write().remove(&Self::key(symbol, strategy))
    }

    pub fn len(&self) -> usize {
        self.engines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.read().is_empty()
    }

    /// Snapshot of every registered engine.
    pub fn all(&self) -> Vec<Arc<SignalEngine>> {
        self.engines.read().values().cloned().collect()
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
    use crate::types::Interval;
    use async_trait::async_trait;

    struct NullGenerator;

    #[async_trait]
    impl SignalGenerator for NullGenerator {
        async fn generate(
            &self,
            _symbol: &str,
            _now_ms: i64,
        ) -> anyhow::Result<Option<SignalRequest>> {
            Ok(None)
        }
    }

    fn engine(symbol: &str, strategy: &str) -> Arc<SignalEngine> {
        SignalEngine::new(
            EngineProfile {
                symbol: symbol.into(),
                strategy_name: strategy.into(),
                exchange_name: "binance".into(),
                frame_name: String::new(),
                interval: Interval::OneMinute,
                backtest: true,
            },
            EngineConfig::default(),
            Arc::new(NullGenerator),
            EngineDeps {
                exchange: Arc::new(MemoryExchange::new(5)),
                risk: Arc::new(NoRisk),
                partial: Arc::new(MemoryPartialTracker::new()),
                breakeven: Arc::new(CostCoverBreakeven::new(EngineConfig::default())),
                store: Arc::new(MemorySignalStore::new()),
                bus: Arc::new(EventBus::new()),
            },
        )
        .unwrap()
    }

    #[test]
    fn lookup_normalizes_symbol_case() {
        let registry = EngineRegistry::new();
        registry.register(engine("BTCUSDT", "demo"));

        assert!(registry.get("btcusdt", "demo").is_some());
        assert!(registry.get(" BTCUSDT ", "demo").is_some());
        assert!(registry.get("BTCUSDT", "other").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_replaces_previous_engine() {
        let registry = EngineRegistry::new();
        assert!(registry.register(engine("BTCUSDT", "demo")).is_none());
        assert!(registry.register(engine("BTCUSDT", "demo")).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove("BTCUSDT", "demo");
        assert!(registry.is_empty());
    }
}
