// =============================================================================
// Signal persistence — crash-safe pending/scheduled records for live mode
// =============================================================================
//
// Two logical namespaces per (symbol, strategy, exchange): `signal` holds the
// currently open row, `schedule` holds the waiting scheduled row. Writes are
// all-or-nothing (write to a `.tmp` sibling, then rename). Reads tolerate
// absent files, unparseable JSON, and rows persisted by a different
// exchange/strategy pairing; all three are treated as "no record".
//
// The engine consults the store in live mode only; backtest ticks never
// touch it.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::signal::SignalRow;

/// Which record of the pair is being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreNamespace {
    /// The currently open signal.
    Pending,
    /// The waiting scheduled signal.
    Scheduled,
}

impl StoreNamespace {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "signal",
            Self::Scheduled => "schedule",
        }
    }
}

/// Identifies one persisted slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
}

impl StoreKey {
    pub fn new(
        symbol: impl Into<String>,
        strategy_name: impl Into<String>,
        exchange_name: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            strategy_name: strategy_name.into(),
            exchange_name: exchange_name.into(),
        }
    }
}

/// Durable store for admitted signal rows.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Read the record, or `None` when absent / unreadable / foreign.
    async fn read(&self, ns: StoreNamespace, key: &StoreKey) -> Result<Option<SignalRow>>;

    /// Replace the record (`Some`) or clear it (`None`). Must be atomic.
    async fn write(
        &self,
        ns: StoreNamespace,
        key: &StoreKey,
        row: Option<&SignalRow>,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// JSON-file store under `base_dir/{signal,schedule}/`, one file per
/// (exchange, strategy, symbol) slot.
#[derive(Debug, Clone)]
pub struct FileSignalStore {
    base_dir: PathBuf,
}

impl FileSignalStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn sanitize(part: &str) -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn path_for(&self, ns: StoreNamespace, key: &StoreKey) -> PathBuf {
        let file = format!(
            "{}__{}__{}.json",
            Self::sanitize(&key.exchange_name),
            Self::sanitize(&key.strategy_name),
            Self::sanitize(&key.symbol)
        );
        self.base_dir.join(ns.dir_name()).join(file)
    }

    fn read_row(path: &Path, key: &StoreKey) -> Option<SignalRow> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read persisted signal");
                return None;
            }
        };

        let row: SignalRow = match serde_json::from_str(&content) {
            Ok(row) => row,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse persisted signal");
                return None;
            }
        };

        // A record written by a different exchange/strategy pairing is not
        // ours to resume.
        if row.exchange_name != key.exchange_name || row.strategy_name != key.strategy_name {
            warn!(
                path = %path.display(),
                record_exchange = %row.exchange_name,
                record_strategy = %row.strategy_name,
                expected_exchange = %key.exchange_name,
                expected_strategy = %key.strategy_name,
                "persisted signal belongs to a different context, treating as absent"
            );
            return None;
        }

        Some(row)
    }

    fn write_row(path: &Path, row: Option<&SignalRow>) -> Result<()> {
        match row {
            Some(row) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create store directory {}", parent.display())
                    })?;
                }

                let content = serde_json::to_string_pretty(row)
                    .context("failed to serialise signal row")?;

                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, &content)
                    .with_context(|| format!("failed to write tmp record {}", tmp.display()))?;
                std::fs::rename(&tmp, path)
                    .with_context(|| format!("failed to rename record into {}", path.display()))?;
                debug!(path = %path.display(), "signal record persisted (atomic)");
            }
            None => match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "signal record cleared"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to remove record {}", path.display())
                    })
                }
            },
        }
        Ok(())
    }
}

#[async_trait]
impl SignalStore for FileSignalStore {
    async fn read(&self, ns: StoreNamespace, key: &StoreKey) -> Result<Option<SignalRow>> {
        Ok(Self::read_row(&self.path_for(ns, key), key))
    }

    async fn write(
        &self,
        ns: StoreNamespace,
        key: &StoreKey,
        row: Option<&SignalRow>,
    ) -> Result<()> {
        Self::write_row(&self.path_for(ns, key), row)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemorySignalStore {
    records: Mutex<std::collections::HashMap<(StoreKey, &'static str), SignalRow>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn read(&self, ns: StoreNamespace, key: &StoreKey) -> Result<Option<SignalRow>> {
        let records = self.records.lock();
        let row = records.get(&(key.clone(), ns.dir_name()));
        Ok(row
            .filter(|r| r.exchange_name == key.exchange_name && r.strategy_name == key.strategy_name)
            .cloned())
    }

    async fn write(
        &self,
        ns: StoreNamespace,
        key: &StoreKey,
        row: Option<&SignalRow>,
    ) -> Result<()> {
        let mut records = self.records.lock();
        match row {
            Some(row) => {
                records.insert((key.clone(), ns.dir_name()), row.clone());
            }
            None => {
                records.remove(&(key.clone(), ns.dir_name()));
            }
        }
        Ok(())
    }
}
