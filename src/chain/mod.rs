//! Chain client contract used by the indexing engine.

mod rpc;

use std::future::Future;
use std::time::Duration;

use alloy_json_abi::Event;
use alloy_primitives::{Address, B256};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::event_decoder::{DecodeError, DecodedEvent, EventDecoder};

pub use rpc::{AlloyChainClient, RPCProvider};

/// A log as returned by `eth_getLogs` / `eth_subscribe`, with block and
/// transaction positions attached.
pub type RawLog = alloy::rpc::types::Log;

/// Push-delivered logs. The stream ends when the underlying subscription is
/// lost; the consumer decides whether to resubscribe.
pub type LogStream = BoxStream<'static, RawLog>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),
    #[error("chain id mismatch: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

pub trait ChainClient: Send + Sync + 'static {
    fn current_block_number(&self) -> impl Future<Output = ChainResult<u64>> + Send;

    /// Logs of `event` emitted by `address` in `[from_block, to_block]`.
    /// An inverted range yields an empty list.
    fn get_logs(
        &self,
        address: Address,
        event: &Event,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = ChainResult<Vec<RawLog>>> + Send;

    /// Live feed of new logs of `event` emitted by `address`. Delivery is
    /// at-least-once.
    fn subscribe(&self, address: Address, event: &Event) -> impl Future<Output = ChainResult<LogStream>> + Send;

    fn get_block(&self, number: u64) -> impl Future<Output = ChainResult<Option<BlockInfo>>> + Send;
}

/// Decode a raw log against a contract's event schema.
pub fn decode_log(log: &RawLog, decoder: &EventDecoder) -> ChainResult<DecodedEvent> {
    Ok(decoder.decode_log(&log.inner)?)
}
