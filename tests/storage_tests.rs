//! Storage contract tests, run against both backends

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use events_indexer::config::{StorageBackend, StorageCfg};
    use events_indexer::storage::{EventStore, JsonFileStore, SqliteStore, open_store};
    use events_indexer::types::{EventFilter, EventRecord, NamedCount};
    use serde_json::{Map, json};
    use tempfile::TempDir;

    fn record(contract: &str, event: &str, block_number: u64, tx: &str, log_index: u64) -> EventRecord {
        let mut event_data = Map::new();
        event_data.insert("tokenId".to_string(), json!(format!("{}", block_number * 10 + log_index)));
        EventRecord {
            contract_name: contract.to_string(),
            contract_address: "0x1e3d7fd130aaadf17dfafa50370044813854bf53".to_string(),
            event_name: event.to_string(),
            block_number,
            block_hash: format!("0x{:064x}", block_number),
            transaction_hash: tx.to_string(),
            transaction_index: 0,
            log_index,
            event_data,
            indexed_at: 1_700_000_000_000,
        }
    }

    /// Every backend under test, kept alive together with its directory.
    fn backends() -> Vec<(&'static str, Arc<dyn EventStore>, TempDir)> {
        let sqlite_dir = tempfile::tempdir().unwrap();
        let sqlite = SqliteStore::open(sqlite_dir.path().join("indexer.db")).unwrap();

        let memory_dir = tempfile::tempdir().unwrap();
        let memory = SqliteStore::in_memory().unwrap();

        let json_dir = tempfile::tempdir().unwrap();
        let json = JsonFileStore::open(json_dir.path().join("indexer.db")).unwrap();

        vec![
            ("sqlite", Arc::new(sqlite), sqlite_dir),
            ("sqlite-memory", Arc::new(memory), memory_dir),
            ("json", Arc::new(json), json_dir),
        ]
    }

    #[test]
    fn test_duplicate_insert_is_silent_no_op() {
        for (name, store, _dir) in backends() {
            let first = record("nft", "Transfer", 10, "0xaaa", 0);
            let mut second = first.clone();
            second.event_data.insert("tokenId".to_string(), json!("999"));

            assert!(store.save_event(&first).unwrap(), "{name}");
            assert!(!store.save_event(&second).unwrap(), "{name}");

            let events = store.get_events(&EventFilter::default()).unwrap();
            assert_eq!(events.len(), 1, "{name}");
            assert_eq!(events[0].record.event_data["tokenId"], json!("100"), "{name}: first write wins");
            assert_eq!(store.get_stats().unwrap().total_events, 1, "{name}");
        }
    }

    #[test]
    fn test_same_tx_different_log_index_are_distinct() {
        for (name, store, _dir) in backends() {
            assert!(store.save_event(&record("nft", "Transfer", 10, "0xaaa", 0)).unwrap(), "{name}");
            assert!(store.save_event(&record("nft", "Transfer", 10, "0xaaa", 1)).unwrap(), "{name}");
            assert_eq!(store.get_stats().unwrap().total_events, 2, "{name}");
        }
    }

    #[test]
    fn test_newest_first_ordering() {
        for (name, store, _dir) in backends() {
            store.save_event(&record("nft", "Transfer", 9, "0x01", 5)).unwrap();
            store.save_event(&record("nft", "Transfer", 10, "0x02", 0)).unwrap();
            store.save_event(&record("nft", "Transfer", 10, "0x02", 1)).unwrap();

            let order: Vec<(u64, u64)> = store
                .get_events(&EventFilter::default())
                .unwrap()
                .iter()
                .map(|e| (e.record.block_number, e.record.log_index))
                .collect();
            assert_eq!(order, vec![(10, 1), (10, 0), (9, 5)], "{name}");

            let by_contract: Vec<(u64, u64)> = store
                .get_events_by_contract("nft", 100, 0)
                .unwrap()
                .iter()
                .map(|e| (e.record.block_number, e.record.log_index))
                .collect();
            assert_eq!(by_contract, vec![(10, 1), (10, 0), (9, 5)], "{name}");
        }
    }

    #[test]
    fn test_ids_are_assigned_in_insert_order() {
        for (name, store, _dir) in backends() {
            store.save_event(&record("nft", "Transfer", 5, "0x01", 0)).unwrap();
            store.save_event(&record("nft", "Transfer", 3, "0x02", 0)).unwrap();

            let events = store.get_events(&EventFilter::default()).unwrap();
            assert!(events[0].id < events[1].id, "{name}");
        }
    }

    #[test]
    fn test_filters_and_pagination() {
        for (name, store, _dir) in backends() {
            for block in 1..=10 {
                store.save_event(&record("nft", "Transfer", block, &format!("0x{block:02x}"), 0)).unwrap();
            }
            store.save_event(&record("gasless", "MessagePosted", 5, "0xff", 0)).unwrap();

            let filter = EventFilter {
                contract_name: Some("nft".to_string()),
                from_block: Some(3),
                to_block: Some(8),
                limit: 2,
                offset: 1,
                ..Default::default()
            };
            let blocks: Vec<u64> = store.get_events(&filter).unwrap().iter().map(|e| e.record.block_number).collect();
            assert_eq!(blocks, vec![7, 6], "{name}");

            let messages = EventFilter { event_name: Some("MessagePosted".to_string()), ..Default::default() };
            assert_eq!(store.get_events(&messages).unwrap().len(), 1, "{name}");

            let page: Vec<u64> = store
                .get_events_by_contract("nft", 3, 8)
                .unwrap()
                .iter()
                .map(|e| e.record.block_number)
                .collect();
            assert_eq!(page, vec![2, 1], "{name}");

            assert!(store.get_events_by_contract("unknown", 100, 0).unwrap().is_empty(), "{name}");
        }
    }

    #[test]
    fn test_events_by_transaction_in_emission_order() {
        for (name, store, _dir) in backends() {
            store.save_event(&record("nft", "Transfer", 10, "0xabc", 2)).unwrap();
            store.save_event(&record("gasless", "MessagePosted", 10, "0xabc", 0)).unwrap();
            store.save_event(&record("nft", "Transfer", 10, "0xabc", 1)).unwrap();
            store.save_event(&record("nft", "Transfer", 11, "0xdef", 0)).unwrap();

            let logs: Vec<u64> =
                store.get_events_by_transaction("0xabc").unwrap().iter().map(|e| e.record.log_index).collect();
            assert_eq!(logs, vec![0, 1, 2], "{name}");
            assert!(store.get_events_by_transaction("0x000").unwrap().is_empty(), "{name}");
        }
    }

    #[test]
    fn test_stats_are_exact() {
        for (name, store, _dir) in backends() {
            store.save_event(&record("nft", "Transfer", 1, "0x01", 0)).unwrap();
            store.save_event(&record("nft", "Transfer", 2, "0x02", 0)).unwrap();
            store.save_event(&record("nft", "Transfer", 3, "0x03", 0)).unwrap();
            store.save_event(&record("gasless", "MessagePosted", 3, "0x03", 1)).unwrap();
            store.save_event(&record("gasless", "MessagePosted", 4, "0x04", 0)).unwrap();
            store.save_last_block(4).unwrap();

            let stats = store.get_stats().unwrap();
            assert_eq!(stats.total_events, 5, "{name}");
            assert_eq!(
                stats.events_by_type,
                vec![
                    NamedCount { name: "MessagePosted".to_string(), count: 2 },
                    NamedCount { name: "Transfer".to_string(), count: 3 },
                ],
                "{name}"
            );
            assert_eq!(stats.events_by_contract.iter().map(|c| c.count).sum::<u64>(), 5, "{name}");
            assert_eq!(stats.last_processed_block, 4, "{name}");
        }
    }

    #[test]
    fn test_cursor_is_unset_then_monotonic() {
        for (name, store, _dir) in backends() {
            assert_eq!(store.get_last_block().unwrap(), None, "{name}");
            assert_eq!(store.get_stats().unwrap().last_processed_block, 0, "{name}");

            store.save_last_block(100).unwrap();
            store.save_last_block(90).unwrap();
            assert_eq!(store.get_last_block().unwrap(), Some(100), "{name}");

            store.save_last_block(150).unwrap();
            assert_eq!(store.get_last_block().unwrap(), Some(150), "{name}");
        }
    }

    #[test]
    fn test_concurrent_saves_of_same_key_create_one_row() {
        for (name, store, _dir) in backends() {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || store.save_event(&record("nft", "Transfer", 42, "0x42", 3)).unwrap())
                })
                .collect();

            let created = handles.into_iter().map(|h| h.join().unwrap()).filter(|inserted| *inserted).count();
            assert_eq!(created, 1, "{name}");
            assert_eq!(store.get_stats().unwrap().total_events, 1, "{name}");
        }
    }

    #[test]
    fn test_writes_succeed_while_reads_run() {
        for (name, store, _dir) in backends() {
            let writer = {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..200u64)
                        .filter(|i| store.save_event(&record("nft", "Transfer", *i, &format!("0x{i:04x}"), 0)).is_err())
                        .count()
                })
            };

            let mut read_errors = 0;
            while !writer.is_finished() {
                read_errors += store.get_events(&EventFilter::default()).is_err() as usize;
                read_errors += store.get_stats().is_err() as usize;
            }

            assert_eq!(writer.join().unwrap(), 0, "{name}: failed writes");
            assert_eq!(read_errors, 0, "{name}");
            assert_eq!(store.get_stats().unwrap().total_events, 200, "{name}");
        }
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        for backend in [StorageBackend::Sqlite, StorageBackend::Json] {
            let cfg = StorageCfg {
                backend,
                path: dir.path().join(format!("{:?}", backend).to_lowercase()).join("indexer.db").to_string_lossy().into_owned(),
            };

            {
                let store = open_store(&cfg).unwrap();
                store.save_event(&record("nft", "Transfer", 7, "0x07", 0)).unwrap();
                store.save_last_block(7).unwrap();
            }

            let store = open_store(&cfg).unwrap();
            assert_eq!(store.get_last_block().unwrap(), Some(7), "{backend:?}");
            assert!(!store.save_event(&record("nft", "Transfer", 7, "0x07", 0)).unwrap(), "{backend:?}");
            assert!(store.save_event(&record("nft", "Transfer", 8, "0x08", 0)).unwrap(), "{backend:?}");

            let events = store.get_events(&EventFilter::default()).unwrap();
            assert_eq!(events.len(), 2, "{backend:?}");
            assert!(events[0].id > events[1].id, "{backend:?}: ids keep growing after reopen");
        }
    }

    #[test]
    fn test_large_numbers_survive_storage() {
        for (name, store, _dir) in backends() {
            let mut event = record("nft", "Transfer", 1, "0x01", 0);
            event.event_data.insert("tokenId".to_string(), json!("18446744073709551617"));
            store.save_event(&event).unwrap();

            let stored = store.get_events(&EventFilter::default()).unwrap();
            assert_eq!(stored[0].record.event_data["tokenId"], json!("18446744073709551617"), "{name}");
        }
    }
}
