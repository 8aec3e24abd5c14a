use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainCfg {
    pub rpc_url: String,
    pub ws_rpc_url: Option<String>, // push feed uses WS `eth_subscribe` when set, HTTP filter polling otherwise
    pub chain_id: u64,
    pub request_timeout_ms: u64,
}

impl Default for ChainCfg {
    fn default() -> Self {
        Self {
            rpc_url: "https://sepolia-rollup.arbitrum.io/rpc".to_string(),
            ws_rpc_url: None,
            chain_id: 421614, // Arbitrum Sepolia
            request_timeout_ms: 30_000,
        }
    }
}

impl ChainCfg {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IndexingCfg {
    pub start_block: u64,
    pub confirmations: u64,
    pub poll_interval_ms: u64,
    pub max_block_range: Option<u64>,
    pub resubscribe_delay_ms: u64,
}

impl Default for IndexingCfg {
    fn default() -> Self {
        Self {
            start_block: 0,
            confirmations: 1,
            poll_interval_ms: 5_000,
            max_block_range: None,
            resubscribe_delay_ms: 5_000,
        }
    }
}

impl IndexingCfg {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Json,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "json" => Ok(Self::Json),
            other => bail!("unknown storage backend '{}', expected 'sqlite' or 'json'", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageCfg {
    pub backend: StorageBackend,
    pub path: String,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self { backend: StorageBackend::Sqlite, path: "./data/indexer.db".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiCfg {
    pub host: String,
    pub port: u16,
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 3001 }
    }
}

impl ApiCfg {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractCfg {
    pub name: String,
    pub address: String,
    pub abi_path: Option<String>,
    /// Inline JSON ABI, takes precedence over `abi_path`.
    pub abi: Option<Value>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppCfg {
    pub name: Option<String>,
    pub chain: ChainCfg,
    pub indexing: IndexingCfg,
    pub storage: StorageCfg,
    pub api: ApiCfg,
    pub contracts: Vec<ContractCfg>,
}

impl AppCfg {
    /// Load the YAML file at `path`, then apply environment overrides.
    /// A missing file is only accepted when `required` is false.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))?
        } else if required {
            bail!("config file {} not found", path.display());
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn get_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "events-indexer".to_string())
    }

    /// Environment-style overrides. `lookup` resolves a variable name to its
    /// value; empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("RPC_URL") {
            self.chain.rpc_url = v;
        }
        if let Some(v) = var("WS_RPC_URL") {
            self.chain.ws_rpc_url = Some(v);
        }
        if let Some(v) = var("CHAIN_ID") {
            self.chain.chain_id = parse_var("CHAIN_ID", &v)?;
        }
        if let Some(v) = var("START_BLOCK") {
            self.indexing.start_block = parse_var("START_BLOCK", &v)?;
        }
        if let Some(v) = var("CONFIRMATIONS") {
            self.indexing.confirmations = parse_var("CONFIRMATIONS", &v)?;
        }
        if let Some(v) = var("POLL_INTERVAL") {
            self.indexing.poll_interval_ms = parse_var("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = var("MAX_BLOCK_RANGE") {
            self.indexing.max_block_range = Some(parse_var("MAX_BLOCK_RANGE", &v)?);
        }
        if let Some(v) = var("DATABASE_PATH") {
            self.storage.path = v;
        }
        if let Some(v) = var("STORAGE_BACKEND") {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = var("API_HOST") {
            self.api.host = v;
        }
        if let Some(v) = var("API_PORT") {
            self.api.port = parse_var("API_PORT", &v)?;
        }
        for contract in self.contracts.iter_mut() {
            let key = format!("{}_CONTRACT_ADDRESS", contract.name.to_uppercase().replace('-', "_"));
            if let Some(v) = var(&key) {
                contract.address = v;
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.contracts.is_empty() {
            bail!("no contracts configured, add at least one entry under `contracts`");
        }
        if self.indexing.poll_interval_ms == 0 {
            bail!("indexing.poll_interval_ms must be greater than zero");
        }
        if self.indexing.max_block_range == Some(0) {
            bail!("indexing.max_block_range must be greater than zero when set");
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("environment variable {}='{}' is not valid", key, value))
}
