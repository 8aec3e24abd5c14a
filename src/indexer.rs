use std::sync::{Arc, Mutex, MutexGuard};

use alloy_json_abi::Event;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::abi::{ContractRegistry, ContractSchema};
use crate::chain::{self, ChainClient, ChainError, RawLog};
use crate::config::IndexingCfg;
use crate::storage::{SharedStore, StorageError, run_blocking};
use crate::types::EventRecord;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("block {0} not found while resolving a missing block hash")]
    BlockNotFound(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What happened to a single log handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Stored,
    Duplicate,
    /// Removed by a reorg, undecodable or lacking its position in the chain.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub from_block: u64,
    pub to_block: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub skipped: u64,
}

impl SweepReport {
    fn record(&mut self, outcome: LogOutcome) {
        match outcome {
            LogOutcome::Stored => self.stored += 1,
            LogOutcome::Duplicate => self.duplicates += 1,
            LogOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Nothing between the cursor and the confirmed head; no logs were queried.
    UpToDate,
    Indexed(SweepReport),
}

struct Engine<C> {
    chain: C,
    store: SharedStore,
    registry: ContractRegistry,
    cfg: IndexingCfg,
}

struct Lifecycle {
    state: IndexerState,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Indexing engine: one push listener per (contract, event) plus a periodic
/// historical sweep, both writing into the same store. The store's dedup key
/// is what makes the two feeds converge.
pub struct Indexer<C: ChainClient> {
    engine: Arc<Engine<C>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<C: ChainClient> Indexer<C> {
    pub fn new(chain: C, store: SharedStore, registry: ContractRegistry, cfg: IndexingCfg) -> Self {
        Self {
            engine: Arc::new(Engine { chain, store, registry, cfg }),
            lifecycle: Mutex::new(Lifecycle { state: IndexerState::Stopped, shutdown: None, tasks: Vec::new() }),
        }
    }

    pub fn state(&self) -> IndexerState {
        self.lock().state
    }

    pub fn store(&self) -> &SharedStore {
        &self.engine.store
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.engine.registry
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the push listeners and the sweep task. Returns `false` when the
    /// engine was not stopped, in which case nothing changes.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lock();
        if lifecycle.state != IndexerState::Stopped {
            info!("Indexer already {:?}, start ignored", lifecycle.state);
            return false;
        }
        lifecycle.state = IndexerState::Starting;

        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let mut tasks = Vec::new();

        for contract in self.engine.registry.contracts() {
            for event in &contract.events {
                let engine = Arc::clone(&self.engine);
                let contract = contract.clone();
                let event = event.clone();
                let shutdown = shutdown_receiver.clone();
                tasks.push(tokio::spawn(async move { engine.run_listener(contract, event, shutdown).await }));
            }
        }

        let engine = Arc::clone(&self.engine);
        tasks.push(tokio::spawn(async move { engine.run_sweeper(shutdown_receiver).await }));

        info!(
            "Indexer started: {} listeners, sweeping every {:?} with {} confirmations",
            tasks.len() - 1,
            self.engine.cfg.poll_interval(),
            self.engine.cfg.confirmations
        );

        lifecycle.shutdown = Some(shutdown_sender);
        lifecycle.tasks = tasks;
        lifecycle.state = IndexerState::Running;
        true
    }

    /// Signal every task to stop and detach from them. A sweep or save that is
    /// in flight runs to completion on its own; no further work is started.
    pub fn stop(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state == IndexerState::Stopped {
            return;
        }
        lifecycle.state = IndexerState::Stopping;

        if let Some(sender) = lifecycle.shutdown.take() {
            if sender.send(true).is_err() {
                debug!("All indexer tasks already exited");
            }
        }
        let detached = std::mem::take(&mut lifecycle.tasks).len();

        lifecycle.state = IndexerState::Stopped;
        info!("Indexer stopped ({} tasks signalled)", detached);
    }

    /// Run one historical sweep immediately.
    pub async fn sweep_once(&self) -> Result<SweepOutcome, IndexerError> {
        self.engine.sweep_once().await
    }

    /// Decode and store a single log of `contract`.
    pub async fn handle_log(&self, contract: &ContractSchema, log: RawLog) -> Result<LogOutcome, IndexerError> {
        self.engine.handle_log(contract, log).await
    }
}

impl<C: ChainClient> Drop for Indexer<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: ChainClient> Engine<C> {
    async fn run_listener(&self, contract: ContractSchema, event: Event, mut shutdown: watch::Receiver<bool>) {
        let delay = self.cfg.resubscribe_delay();

        while !*shutdown.borrow() {
            let subscription = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.chain.subscribe(contract.address, &event) => result,
            };

            match subscription {
                Ok(mut stream) => {
                    info!("Subscribed to {}.{} at {:#x}", contract.name, event.name, contract.address);
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => return,
                            next = stream.next() => match next {
                                Some(log) => match self.handle_log(&contract, log).await {
                                    Ok(outcome) => debug!("Push {}.{}: {:?}", contract.name, event.name, outcome),
                                    Err(e) => error!("Failed to handle pushed {}.{} log: {}", contract.name, event.name, e),
                                },
                                None => {
                                    warn!("Subscription to {}.{} ended", contract.name, event.name);
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => warn!("Failed to subscribe to {}.{}: {}", contract.name, event.name, e),
            }

            info!("Resubscribing to {}.{} in {:?}", contract.name, event.name, delay);
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        match self.seed_cursor().await {
            Ok(last) => info!("Resuming after block {}", last),
            Err(e) => warn!("Could not read stored progress: {}", e),
        }

        let mut ticker = tokio::time::interval(self.cfg.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(SweepOutcome::UpToDate) => debug!("Sweep: up to date"),
                    Ok(SweepOutcome::Indexed(_)) => {}
                    Err(e) => error!("Sweep failed, range will be retried: {}", e),
                },
            }
        }
        debug!("Sweep task exited");
    }

    /// Return the stored cursor, saving `start_block` first when none is stored.
    async fn seed_cursor(&self) -> Result<u64, IndexerError> {
        let start_block = self.cfg.start_block;
        let last = run_blocking(&self.store, move |s| match s.get_last_block()? {
            Some(last) => Ok(last),
            None => {
                s.save_last_block(start_block)?;
                info!("No stored progress, cursor seeded at block {}", start_block);
                Ok(start_block)
            }
        })
        .await?;
        Ok(last)
    }

    async fn sweep_once(&self) -> Result<SweepOutcome, IndexerError> {
        let current = self.chain.current_block_number().await?;
        let last = self.seed_cursor().await?;

        let Some(from_block) = last.checked_add(1) else {
            return Ok(SweepOutcome::UpToDate);
        };
        let Some(to_block) = current.checked_sub(self.cfg.confirmations) else {
            return Ok(SweepOutcome::UpToDate);
        };
        if from_block > to_block {
            return Ok(SweepOutcome::UpToDate);
        }

        let chunk_size = self.cfg.max_block_range.unwrap_or(u64::MAX).max(1);
        let mut report = SweepReport { from_block, to_block, ..Default::default() };
        let mut chunk_start = from_block;

        loop {
            let chunk_end = chunk_start.saturating_add(chunk_size - 1).min(to_block);

            for contract in self.registry.contracts() {
                for event in &contract.events {
                    let logs = self.chain.get_logs(contract.address, event, chunk_start, chunk_end).await?;
                    for log in logs {
                        report.record(self.handle_log(contract, log).await?);
                    }
                }
            }

            // Every log of [chunk_start, chunk_end] is committed at this point.
            run_blocking(&self.store, move |s| s.save_last_block(chunk_end)).await?;
            info!("Indexed blocks {}..={} (head {})", chunk_start, chunk_end, current);

            if chunk_end >= to_block {
                break;
            }
            chunk_start = chunk_end + 1;
        }

        info!(
            "Sweep {}..={} done: {} stored, {} duplicates, {} skipped",
            report.from_block, report.to_block, report.stored, report.duplicates, report.skipped
        );
        Ok(SweepOutcome::Indexed(report))
    }

    async fn handle_log(&self, contract: &ContractSchema, log: RawLog) -> Result<LogOutcome, IndexerError> {
        if log.removed {
            debug!("Ignoring removed log of {} in tx {:?}", contract.name, log.transaction_hash);
            return Ok(LogOutcome::Skipped);
        }

        let decoded = match chain::decode_log(&log, &contract.decoder) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Skipping undecodable {} log in tx {:?}: {}", contract.name, log.transaction_hash, e);
                return Ok(LogOutcome::Skipped);
            }
        };

        let (Some(block_number), Some(transaction_hash), Some(log_index)) =
            (log.block_number, log.transaction_hash, log.log_index)
        else {
            warn!("Skipping pending {}.{} log without chain position", contract.name, decoded.name);
            return Ok(LogOutcome::Skipped);
        };

        let block_hash = match log.block_hash {
            Some(hash) => hash,
            None => {
                self.chain
                    .get_block(block_number)
                    .await?
                    .ok_or(IndexerError::BlockNotFound(block_number))?
                    .hash
            }
        };

        let record = EventRecord {
            contract_name: contract.name.clone(),
            contract_address: contract.address_hex(),
            event_name: decoded.name.clone(),
            block_number,
            block_hash: format!("{:#x}", block_hash),
            transaction_hash: format!("{:#x}", transaction_hash),
            transaction_index: log.transaction_index.unwrap_or_default(),
            log_index,
            event_data: decoded.args(),
            indexed_at: chrono::Utc::now().timestamp_millis(),
        };

        let inserted = run_blocking(&self.store, {
            let record = record.clone();
            move |s| s.save_event(&record)
        })
        .await?;

        if inserted {
            debug!(
                "Stored {}.{} at block {} tx {} log {} ({})",
                record.contract_name,
                record.event_name,
                record.block_number,
                record.transaction_hash,
                record.log_index,
                decoded.format_params()
            );
            Ok(LogOutcome::Stored)
        } else {
            debug!("Duplicate {}.{} tx {} log {}", record.contract_name, record.event_name, record.transaction_hash, record.log_index);
            Ok(LogOutcome::Duplicate)
        }
    }
}
