use std::future::IntoFuture;
use std::str::FromStr;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::providers::fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::rpc::types::Filter;
use alloy_json_abi::Event;
use alloy_primitives::Address;
use futures_util::StreamExt;
use tracing::{info, warn};

use super::{BlockInfo, ChainClient, ChainError, ChainResult, LogStream, RawLog};
use crate::config::ChainCfg;

pub type RPCProvider = FillProvider<JoinFill<Identity, JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>>, RootProvider>;

/// Chain client over alloy providers. Queries go over HTTP; live logs use the
/// WebSocket provider when one is configured and fall back to HTTP filter
/// polling otherwise.
#[derive(Clone)]
pub struct AlloyChainClient {
    http_rpc_provider: RPCProvider,
    ws_rpc_provider: Option<RPCProvider>,
    request_timeout: Duration,
    poll_interval: Duration,
}

impl AlloyChainClient {
    /// Connect the providers and verify the chain id. A mismatching chain id
    /// is fatal; a failed chain id query only logs a warning.
    pub async fn connect(cfg: &ChainCfg, poll_interval: Duration) -> ChainResult<Self> {
        let http_rpc_url = reqwest::Url::from_str(&cfg.rpc_url)
            .map_err(|e| ChainError::Rpc(format!("invalid RPC URL '{}': {}", cfg.rpc_url, e)))?;
        let http_rpc_provider = ProviderBuilder::new().connect_http(http_rpc_url);

        let ws_rpc_provider = match &cfg.ws_rpc_url {
            Some(ws_rpc_url) => {
                let ws = WsConnect::new(ws_rpc_url.as_str());
                let provider = tokio::time::timeout(cfg.request_timeout(), ProviderBuilder::new().connect_ws(ws))
                    .await
                    .map_err(|_| ChainError::Timeout(cfg.request_timeout()))?
                    .map_err(|e| ChainError::Rpc(e.to_string()))?;
                Some(provider)
            }
            None => None,
        };
        info!(
            "Connecting to RPC endpoints: http: {}, ws: {}",
            cfg.rpc_url,
            cfg.ws_rpc_url.as_deref().unwrap_or("none (HTTP filter polling)")
        );

        let client = Self {
            http_rpc_provider,
            ws_rpc_provider,
            request_timeout: cfg.request_timeout(),
            poll_interval,
        };

        match client.with_timeout(client.http_rpc_provider.get_chain_id()).await {
            Ok(chain_id) if chain_id != cfg.chain_id => {
                return Err(ChainError::ChainIdMismatch { expected: cfg.chain_id, actual: chain_id });
            }
            Ok(chain_id) => info!("Chain ID: {}", chain_id),
            Err(e) => warn!("Could not verify chain ID (expected {}): {}", cfg.chain_id, e),
        }

        Ok(client)
    }

    async fn with_timeout<T, E, F>(&self, fut: F) -> ChainResult<T>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ChainError::Timeout(self.request_timeout))?
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

fn event_filter(address: Address, event: &Event) -> Filter {
    Filter::new().address(address).event_signature(event.selector())
}

impl ChainClient for AlloyChainClient {
    async fn current_block_number(&self) -> ChainResult<u64> {
        self.with_timeout(self.http_rpc_provider.get_block_number()).await
    }

    async fn get_logs(&self, address: Address, event: &Event, from_block: u64, to_block: u64) -> ChainResult<Vec<RawLog>> {
        if from_block > to_block {
            return Ok(Vec::new());
        }
        let filter = event_filter(address, event).from_block(from_block).to_block(to_block);
        self.with_timeout(self.http_rpc_provider.get_logs(&filter)).await
    }

    async fn subscribe(&self, address: Address, event: &Event) -> ChainResult<LogStream> {
        let filter = event_filter(address, event).from_block(BlockNumberOrTag::Latest);

        match &self.ws_rpc_provider {
            Some(ws) => {
                let sub = self.with_timeout(ws.subscribe_logs(&filter)).await?;
                Ok(sub.into_stream().boxed())
            }
            None => {
                let poller = self.with_timeout(self.http_rpc_provider.watch_logs(&filter)).await?;
                Ok(poller
                    .with_poll_interval(self.poll_interval)
                    .into_stream()
                    .flat_map(futures::stream::iter)
                    .boxed())
            }
        }
    }

    async fn get_block(&self, number: u64) -> ChainResult<Option<BlockInfo>> {
        let block = self
            .with_timeout(self.http_rpc_provider.get_block_by_number(BlockNumberOrTag::Number(number)))
            .await?;

        Ok(block.map(|b| BlockInfo {
            number: b.header.inner.number,
            hash: b.header.hash,
            timestamp: b.header.inner.timestamp,
        }))
    }
}
