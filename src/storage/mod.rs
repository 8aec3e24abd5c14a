//! Durable event store with idempotent writes, a progress cursor and
//! aggregate queries.
//!
//! Two interchangeable backends implement [`EventStore`]:
//! [`SqliteStore`] (embedded relational, indexed lookups and atomic upserts)
//! and [`JsonFileStore`] (two flat JSON files, rewritten and fsynced on every
//! mutation).

mod json_file;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{StorageBackend, StorageCfg};
use crate::types::{EventFilter, EventRecord, IndexerStats, StoredEvent};

pub use json_file::JsonFileStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("SQLite connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(String),
    #[error("value {0} exceeds the SQLite integer range")]
    OutOfRange(u64),
    #[error("storage lock poisoned")]
    LockPoisoned,
    #[error("storage task failed: {0}")]
    Task(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage contract shared by every backend.
///
/// All methods are synchronous; async callers go through [`run_blocking`].
/// Every mutating call is durable when it returns and is safe to invoke
/// concurrently from several threads.
pub trait EventStore: Send + Sync {
    /// Insert an event unless one with the same `(transaction_hash, log_index)`
    /// already exists. Returns `true` when a row was created; a duplicate is
    /// `Ok(false)`, never an error. The first write wins.
    fn save_event(&self, event: &EventRecord) -> StorageResult<bool>;

    /// Filtered events, newest first: `block_number` desc, then `log_index` desc.
    /// Pagination applies after filtering and sorting.
    fn get_events(&self, filter: &EventFilter) -> StorageResult<Vec<StoredEvent>>;

    /// Events of one transaction in emission order (`log_index` asc).
    fn get_events_by_transaction(&self, tx_hash: &str) -> StorageResult<Vec<StoredEvent>>;

    /// Events of one contract, newest first.
    fn get_events_by_contract(&self, contract_name: &str, limit: u64, offset: u64) -> StorageResult<Vec<StoredEvent>>;

    /// Exact aggregate counts plus the progress cursor (0 when unset).
    fn get_stats(&self) -> StorageResult<IndexerStats>;

    /// Advance the progress cursor. The stored value never decreases.
    fn save_last_block(&self, block_number: u64) -> StorageResult<()>;

    /// Highest block whose full log range is committed, `None` before the
    /// first checkpoint.
    fn get_last_block(&self) -> StorageResult<Option<u64>>;
}

pub type SharedStore = Arc<dyn EventStore>;

/// Run a storage call on the blocking thread pool.
pub async fn run_blocking<T, F>(store: &SharedStore, f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn EventStore) -> StorageResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

/// Open the configured backend.
pub fn open_store(cfg: &StorageCfg) -> StorageResult<SharedStore> {
    let path = Path::new(&cfg.path);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let store: SharedStore = match cfg.backend {
        StorageBackend::Sqlite => {
            info!("Using SQLite storage at {}", path.display());
            Arc::new(SqliteStore::open(path)?)
        }
        StorageBackend::Json => {
            let store = JsonFileStore::open(path)?;
            info!(
                "Using JSON file storage at {} / {}",
                store.events_path().display(),
                store.state_path().display()
            );
            Arc::new(store)
        }
    };

    Ok(store)
}

/// Convert a block number or index into SQLite's signed integer domain.
pub(crate) fn to_sql_int(value: u64) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::OutOfRange(value))
}
