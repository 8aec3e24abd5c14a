use std::collections::HashSet;
use std::fs;
use std::str::FromStr;

use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::Address;
use anyhow::{Context, anyhow, bail};
use serde_json::Value;
use tracing::info;

use crate::config::ContractCfg;
use crate::event_decoder::EventDecoder;

/// One configured contract: logical name, address and the events to index.
#[derive(Debug, Clone)]
pub struct ContractSchema {
    pub name: String,
    pub address: Address,
    pub events: Vec<Event>,
    pub decoder: EventDecoder,
}

impl ContractSchema {
    pub fn new(name: impl Into<String>, address: Address, abi: &JsonAbi) -> anyhow::Result<Self> {
        let name = name.into();
        let events: Vec<Event> = abi.events().filter(|e| !e.anonymous).cloned().collect();
        if events.is_empty() {
            bail!("ABI of contract '{}' declares no (non-anonymous) events", name);
        }
        let decoder = EventDecoder::new(events.iter().cloned());
        Ok(Self { name, address, events, decoder })
    }

    pub fn load(cfg: &ContractCfg) -> anyhow::Result<Self> {
        let address = Address::from_str(&cfg.address)
            .with_context(|| format!("invalid address '{}' for contract '{}'", cfg.address, cfg.name))?;

        let raw = match (&cfg.abi, &cfg.abi_path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => {
                let bytes = fs::read(path).with_context(|| format!("failed to read ABI file {}", path))?;
                serde_json::from_slice(&bytes).with_context(|| format!("ABI file {} is not valid JSON", path))?
            }
            (None, None) => bail!("contract '{}' has neither `abi` nor `abi_path`", cfg.name),
        };

        let abi = parse_abi(raw).with_context(|| format!("invalid ABI for contract '{}'", cfg.name))?;
        Self::new(&cfg.name, address, &abi)
    }

    /// Lowercase `0x`-prefixed address, the form stored with every event.
    pub fn address_hex(&self) -> String {
        format!("{:#x}", self.address)
    }
}

/// Parse a JSON ABI, accepting both a bare item array and a compiler
/// artifact with an `abi` field. Event entries without an explicit
/// `anonymous` flag are treated as non-anonymous.
pub fn parse_abi(raw: Value) -> anyhow::Result<JsonAbi> {
    let mut items = match raw {
        Value::Array(items) => items,
        Value::Object(mut artifact) => match artifact.remove("abi") {
            Some(Value::Array(items)) => items,
            _ => return Err(anyhow!("expected an ABI array or an object with an `abi` array")),
        },
        _ => return Err(anyhow!("expected an ABI array")),
    };

    for item in items.iter_mut() {
        if let Value::Object(obj) = item {
            if obj.get("type").and_then(Value::as_str) == Some("event") && !obj.contains_key("anonymous") {
                obj.insert("anonymous".to_string(), Value::Bool(false));
            }
        }
    }

    Ok(serde_json::from_value(Value::Array(items))?)
}

/// Static registry of configured contracts, read-only after startup.
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contracts: Vec<ContractSchema>,
}

impl ContractRegistry {
    pub fn new(contracts: Vec<ContractSchema>) -> anyhow::Result<Self> {
        if contracts.is_empty() {
            bail!("contract registry is empty, nothing to index");
        }
        let mut names = HashSet::new();
        for contract in &contracts {
            if !names.insert(contract.name.as_str()) {
                bail!("contract name '{}' is configured more than once", contract.name);
            }
        }
        Ok(Self { contracts })
    }

    pub fn load(cfgs: &[ContractCfg]) -> anyhow::Result<Self> {
        let contracts = cfgs.iter().map(ContractSchema::load).collect::<anyhow::Result<Vec<_>>>()?;
        for c in &contracts {
            info!(
                "Loaded contract {} at {:#x} ({} events: {})",
                c.name,
                c.address,
                c.events.len(),
                c.events.iter().map(|e| e.name.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        Self::new(contracts)
    }

    pub fn contracts(&self) -> &[ContractSchema] {
        &self.contracts
    }

    pub fn get(&self, name: &str) -> Option<&ContractSchema> {
        self.contracts.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.contracts.iter().map(|c| c.name.as_str()).collect()
    }
}
