use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_PAGE_LIMIT: u64 = 100;

/// Decoded event arguments, in declaration order.
pub type EventData = Map<String, Value>;

/// An event as produced by the indexer, before storage assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub contract_name: String,
    pub contract_address: String,
    pub event_name: String,
    #[serde(with = "safe_u64")]
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    #[serde(with = "safe_u64")]
    pub transaction_index: u64,
    #[serde(with = "safe_u64")]
    pub log_index: u64,
    pub event_data: EventData,
    /// Milliseconds since the unix epoch at which this node stored the event.
    pub indexed_at: i64,
}

impl EventRecord {
    /// `(transaction_hash, log_index)` identifies a log across redeliveries.
    pub fn dedup_key(&self) -> (&str, u64) {
        (self.transaction_hash.as_str(), self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(with = "safe_u64")]
    pub id: u64,
    #[serde(flatten)]
    pub record: EventRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub contract_name: Option<String>,
    pub event_name: Option<String>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub limit: u64,
    pub offset: u64,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            contract_name: None,
            event_name: None,
            from_block: None,
            to_block: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl EventFilter {
    pub fn matches(&self, record: &EventRecord) -> bool {
        self.contract_name.as_deref().is_none_or(|name| record.contract_name == name)
            && self.event_name.as_deref().is_none_or(|name| record.event_name == name)
            && self.from_block.is_none_or(|from| record.block_number >= from)
            && self.to_block.is_none_or(|to| record.block_number <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCount {
    pub name: String,
    #[serde(with = "safe_u64")]
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStats {
    #[serde(with = "safe_u64")]
    pub total_events: u64,
    pub events_by_contract: Vec<NamedCount>,
    pub events_by_type: Vec<NamedCount>,
    #[serde(with = "safe_u64")]
    pub last_processed_block: u64,
}

/// Serializes `u64` as a JSON number while it fits into an IEEE-754 double
/// without rounding, and as a decimal string above that. Deserializes both.
pub mod safe_u64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// 2^53 - 1
    pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        if *value <= MAX_SAFE_INTEGER {
            serializer.serialize_u64(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) => s.parse().map_err(D::Error::custom),
        }
    }
}
