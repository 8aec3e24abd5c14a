use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{EventStore, StorageError, StorageResult};
use crate::types::{EventFilter, EventRecord, IndexerStats, NamedCount, StoredEvent};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_block: Option<u64>,
}

#[derive(Debug, Default)]
struct JsonState {
    events: Vec<StoredEvent>,
    keys: HashSet<(String, u64)>,
    last_id: u64,
    last_block: Option<u64>,
}

/// Event store kept in two flat JSON files next to the configured path:
/// `<stem>_events.json` (array of stored events) and `<stem>_state.json`
/// (`{"lastBlock": n}`).
///
/// The whole state lives in memory behind one mutex. Each mutation rewrites the
/// affected file through a temp file plus fsync plus rename, so a crash leaves
/// either the old or the new content on disk.
pub struct JsonFileStore {
    events_path: PathBuf,
    state_path: PathBuf,
    state: Mutex<JsonState>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let base = path.to_string_lossy();
        let base = base.strip_suffix(".db").unwrap_or(&base);
        let events_path = PathBuf::from(format!("{}_events.json", base));
        let state_path = PathBuf::from(format!("{}_state.json", base));

        let events: Vec<StoredEvent> = read_json(&events_path)?.unwrap_or_default();
        let state: StateFile = read_json(&state_path)?.unwrap_or_default();

        let keys = events
            .iter()
            .map(|e| owned_key(&e.record))
            .collect::<HashSet<_>>();
        if keys.len() != events.len() {
            return Err(StorageError::Corrupt(format!(
                "{} contains duplicate (transaction_hash, log_index) entries",
                events_path.display()
            )));
        }
        let last_id = events.iter().map(|e| e.id).max().unwrap_or(0);

        info!(
            "Loaded {} events from {} (last block: {:?})",
            events.len(),
            events_path.display(),
            state.last_block
        );

        Ok(Self {
            events_path,
            state_path,
            state: Mutex::new(JsonState { events, keys, last_id, last_block: state.last_block }),
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, JsonState>> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn sorted_newest_first<'a>(events: impl Iterator<Item = &'a StoredEvent>) -> Vec<StoredEvent> {
        let mut out: Vec<StoredEvent> = events.cloned().collect();
        out.sort_by(|a, b| {
            b.record
                .block_number
                .cmp(&a.record.block_number)
                .then(b.record.log_index.cmp(&a.record.log_index))
        });
        out
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt(format!("{}: {}", path.display(), e)))
}

/// Replace `path` atomically with the JSON encoding of `value`.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    // Persist the rename itself. Not every platform lets a directory be opened.
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }

    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

fn paginate(events: Vec<StoredEvent>, limit: u64, offset: u64) -> Vec<StoredEvent> {
    events
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}

fn owned_key(event: &EventRecord) -> (String, u64) {
    let (tx_hash, log_index) = event.dedup_key();
    (tx_hash.to_string(), log_index)
}

fn counts<'a>(names: impl Iterator<Item = &'a str>) -> Vec<NamedCount> {
    let mut map: BTreeMap<&str, u64> = BTreeMap::new();
    for name in names {
        *map.entry(name).or_default() += 1;
    }
    map.into_iter().map(|(name, count)| NamedCount { name: name.to_string(), count }).collect()
}

impl EventStore for JsonFileStore {
    fn save_event(&self, event: &EventRecord) -> StorageResult<bool> {
        let mut state = self.lock()?;
        let key = owned_key(event);
        if state.keys.contains(&key) {
            return Ok(false);
        }

        let id = state.last_id + 1;
        state.events.push(StoredEvent { id, record: event.clone() });

        if let Err(e) = write_json_atomic(&self.events_path, &state.events) {
            state.events.pop();
            return Err(e);
        }

        state.keys.insert(key);
        state.last_id = id;
        Ok(true)
    }

    fn get_events(&self, filter: &EventFilter) -> StorageResult<Vec<StoredEvent>> {
        let state = self.lock()?;
        let matching = Self::sorted_newest_first(state.events.iter().filter(|e| filter.matches(&e.record)));
        Ok(paginate(matching, filter.limit, filter.offset))
    }

    fn get_events_by_transaction(&self, tx_hash: &str) -> StorageResult<Vec<StoredEvent>> {
        let state = self.lock()?;
        let mut events: Vec<StoredEvent> =
            state.events.iter().filter(|e| e.record.transaction_hash == tx_hash).cloned().collect();
        events.sort_by_key(|e| e.record.log_index);
        Ok(events)
    }

    fn get_events_by_contract(&self, contract_name: &str, limit: u64, offset: u64) -> StorageResult<Vec<StoredEvent>> {
        let state = self.lock()?;
        let matching =
            Self::sorted_newest_first(state.events.iter().filter(|e| e.record.contract_name == contract_name));
        Ok(paginate(matching, limit, offset))
    }

    fn get_stats(&self) -> StorageResult<IndexerStats> {
        let state = self.lock()?;
        Ok(IndexerStats {
            total_events: state.events.len() as u64,
            events_by_contract: counts(state.events.iter().map(|e| e.record.contract_name.as_str())),
            events_by_type: counts(state.events.iter().map(|e| e.record.event_name.as_str())),
            last_processed_block: state.last_block.unwrap_or(0),
        })
    }

    fn save_last_block(&self, block_number: u64) -> StorageResult<()> {
        let mut state = self.lock()?;
        if state.last_block.is_some_and(|current| current >= block_number) {
            return Ok(());
        }

        write_json_atomic(&self.state_path, &StateFile { last_block: Some(block_number) })?;
        state.last_block = Some(block_number);
        Ok(())
    }

    fn get_last_block(&self) -> StorageResult<Option<u64>> {
        Ok(self.lock()?.last_block)
    }
}
