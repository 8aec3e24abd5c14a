use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params, params_from_iter};
use tracing::info;

use super::{EventStore, StorageError, StorageResult, to_sql_int};
use crate::types::{EventFilter, EventRecord, IndexerStats, NamedCount, StoredEvent};

const LAST_BLOCK_KEY: &str = "last_block";

const EVENT_COLUMNS: &str = "id, contract_name, contract_address, event_name, block_number, block_hash, \
     transaction_hash, transaction_index, log_index, event_data, indexed_at";

/// Event store backed by SQLite.
///
/// On disk, reads go through a small r2d2 pool and writes through one
/// dedicated connection behind a mutex, so writes are serialized while WAL
/// mode lets readers proceed. In memory there is no pool and reads share the
/// writer. Deduplication is the `UNIQUE(transaction_hash, log_index)`
/// constraint combined with `INSERT OR IGNORE`.
pub struct SqliteStore {
    read_pool: Option<Pool<SqliteConnectionManager>>,
    writer: Mutex<Connection>,
}

enum ReadConn<'a> {
    Pooled(PooledConnection<SqliteConnectionManager>),
    Writer(MutexGuard<'a, Connection>),
}

impl Deref for ReadConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ReadConn::Pooled(conn) => &**conn,
            ReadConn::Writer(conn) => &**conn,
        }
    }
}

/// Standard PRAGMAs. `synchronous=FULL` makes every commit durable on return.
fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA busy_timeout=5000;",
    )
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref();
        let writer = Connection::open(db_path)?;
        configure_connection(&writer)?;
        init_schema(&writer)?;

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout=5000;"));
        let read_pool = Pool::builder().max_size(4).build(manager)?;

        info!("SQLite event store ready at {}", db_path.display());

        Ok(Self { read_pool: Some(read_pool), writer: Mutex::new(writer) })
    }

    /// A private in-memory database on a single connection.
    ///
    /// Shared-cache connections take table-level locks, and a write that
    /// meets an open read fails with `SQLITE_LOCKED` instead of waiting, so
    /// reads are served by the writer connection here.
    pub fn in_memory() -> StorageResult<Self> {
        let writer = Connection::open_in_memory()?;
        init_schema(&writer)?;

        Ok(Self { read_pool: None, writer: Mutex::new(writer) })
    }

    fn lock_writer(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn read_conn(&self) -> StorageResult<ReadConn<'_>> {
        match &self.read_pool {
            Some(pool) => Ok(ReadConn::Pooled(pool.get()?)),
            None => Ok(ReadConn::Writer(self.lock_writer()?)),
        }
    }

    fn query_events(&self, sql: &str, values: Vec<SqlValue>) -> StorageResult<Vec<StoredEvent>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_stored_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_by(&self, column: &str) -> StorageResult<Vec<NamedCount>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {column}, COUNT(*) FROM events GROUP BY {column} ORDER BY {column}"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(NamedCount { name: row.get(0)?, count: row.get::<_, i64>(1)? as u64 })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             contract_name TEXT NOT NULL,
             contract_address TEXT NOT NULL,
             event_name TEXT NOT NULL,
             block_number INTEGER NOT NULL,
             block_hash TEXT NOT NULL,
             transaction_hash TEXT NOT NULL,
             transaction_index INTEGER NOT NULL,
             log_index INTEGER NOT NULL,
             event_data TEXT NOT NULL,
             indexed_at INTEGER NOT NULL,
             UNIQUE(transaction_hash, log_index)
         );
         CREATE INDEX IF NOT EXISTS idx_events_contract_name ON events(contract_name);
         CREATE INDEX IF NOT EXISTS idx_events_event_name ON events(event_name);
         CREATE INDEX IF NOT EXISTS idx_events_block ON events(block_number, log_index);
         CREATE INDEX IF NOT EXISTS idx_events_tx ON events(transaction_hash);

         CREATE TABLE IF NOT EXISTS indexer_state (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )
}

fn row_to_stored_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    let event_data: String = row.get("event_data")?;
    let event_data = serde_json::from_str(&event_data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(StoredEvent {
        id: row.get::<_, i64>("id")? as u64,
        record: EventRecord {
            contract_name: row.get("contract_name")?,
            contract_address: row.get("contract_address")?,
            event_name: row.get("event_name")?,
            block_number: row.get::<_, i64>("block_number")? as u64,
            block_hash: row.get("block_hash")?,
            transaction_hash: row.get("transaction_hash")?,
            transaction_index: row.get::<_, i64>("transaction_index")? as u64,
            log_index: row.get::<_, i64>("log_index")? as u64,
            event_data,
            indexed_at: row.get("indexed_at")?,
        },
    })
}

impl EventStore for SqliteStore {
    fn save_event(&self, event: &EventRecord) -> StorageResult<bool> {
        let event_data = serde_json::to_string(&event.event_data)?;
        let block_number = to_sql_int(event.block_number)?;
        let transaction_index = to_sql_int(event.transaction_index)?;
        let log_index = to_sql_int(event.log_index)?;

        let conn = self.lock_writer()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (
                 contract_name, contract_address, event_name,
                 block_number, block_hash, transaction_hash,
                 transaction_index, log_index, event_data, indexed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.contract_name,
                event.contract_address,
                event.event_name,
                block_number,
                event.block_hash,
                event.transaction_hash,
                transaction_index,
                log_index,
                event_data,
                event.indexed_at,
            ],
        )?;

        Ok(inserted == 1)
    }

    fn get_events(&self, filter: &EventFilter) -> StorageResult<Vec<StoredEvent>> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(contract) = &filter.contract_name {
            sql.push_str(" AND contract_name = ?");
            values.push(SqlValue::Text(contract.clone()));
        }
        if let Some(event) = &filter.event_name {
            sql.push_str(" AND event_name = ?");
            values.push(SqlValue::Text(event.clone()));
        }
        if let Some(from) = filter.from_block {
            sql.push_str(" AND block_number >= ?");
            values.push(SqlValue::Integer(to_sql_int(from)?));
        }
        if let Some(to) = filter.to_block {
            sql.push_str(" AND block_number <= ?");
            values.push(SqlValue::Integer(to_sql_int(to)?));
        }

        sql.push_str(" ORDER BY block_number DESC, log_index DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(to_sql_int(filter.limit)?));
        values.push(SqlValue::Integer(to_sql_int(filter.offset)?));

        self.query_events(&sql, values)
    }

    fn get_events_by_transaction(&self, tx_hash: &str) -> StorageResult<Vec<StoredEvent>> {
        self.query_events(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE transaction_hash = ? ORDER BY log_index ASC"),
            vec![SqlValue::Text(tx_hash.to_string())],
        )
    }

    fn get_events_by_contract(&self, contract_name: &str, limit: u64, offset: u64) -> StorageResult<Vec<StoredEvent>> {
        self.query_events(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE contract_name = ? \
                 ORDER BY block_number DESC, log_index DESC LIMIT ? OFFSET ?"
            ),
            vec![
                SqlValue::Text(contract_name.to_string()),
                SqlValue::Integer(to_sql_int(limit)?),
                SqlValue::Integer(to_sql_int(offset)?),
            ],
        )
    }

    fn get_stats(&self) -> StorageResult<IndexerStats> {
        let total_events: i64 = self.read_conn()?.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

        Ok(IndexerStats {
            total_events: total_events as u64,
            events_by_contract: self.count_by("contract_name")?,
            events_by_type: self.count_by("event_name")?,
            last_processed_block: self.get_last_block()?.unwrap_or(0),
        })
    }

    fn save_last_block(&self, block_number: u64) -> StorageResult<()> {
        to_sql_int(block_number)?;
        let conn = self.lock_writer()?;
        conn.execute(
            "INSERT INTO indexer_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value
             WHERE CAST(excluded.value AS INTEGER) > CAST(indexer_state.value AS INTEGER)",
            params![LAST_BLOCK_KEY, block_number.to_string()],
        )?;
        Ok(())
    }

    fn get_last_block(&self) -> StorageResult<Option<u64>> {
        let value: Option<String> = self
            .read_conn()?
            .query_row("SELECT value FROM indexer_state WHERE key = ?1", [LAST_BLOCK_KEY], |row| row.get(0))
            .optional()?;

        value
            .map(|v| v.parse::<u64>().map_err(|_| StorageError::Corrupt(format!("invalid last_block value '{}'", v))))
            .transpose()
    }
}
