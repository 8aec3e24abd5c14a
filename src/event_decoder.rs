use std::collections::HashMap;

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{Event, EventParam};
use alloy_primitives::{B256, Log};
use serde_json::Value;
use thiserror::Error;

use crate::types::EventData;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log has no topics, cannot match an event signature")]
    MissingSignature,
    #[error("unknown event signature {0:#x}")]
    UnknownSignature(B256),
    #[error("not enough topics for indexed parameter `{param}` of {event}")]
    MissingTopic { event: String, param: String },
    #[error("failed to resolve type of parameter `{param}` of {event}: {reason}")]
    ParamType { event: String, param: String, reason: String },
    #[error("failed to decode {event}: {reason}")]
    Abi { event: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct DecodedParam {
    pub name: String,
    pub param_type: String,
    pub value: DynSolValue,
}

#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub name: String,
    /// Parameters in declaration order.
    pub params: Vec<DecodedParam>,
}

impl DecodedEvent {
    /// Event arguments keyed by parameter name. Unnamed parameters are keyed
    /// by their position.
    pub fn args(&self) -> EventData {
        let mut args = EventData::new();
        for (position, param) in self.params.iter().enumerate() {
            let key = if param.name.is_empty() { position.to_string() } else { param.name.clone() };
            args.insert(key, value_to_json(&param.value));
        }
        args
    }

    pub fn format_params(&self) -> String {
        self.params
            .iter()
            .map(|p| format!("{}: {} = {}", p.name, p.param_type, format_value(&p.value)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Decodes raw logs against the non-anonymous events of one contract schema,
/// keyed by their topic-0 selector.
#[derive(Debug, Clone, Default)]
pub struct EventDecoder {
    events: HashMap<B256, Event>,
}

impl EventDecoder {
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        let events = events
            .into_iter()
            .filter(|event| !event.anonymous)
            .map(|event| (event.selector(), event))
            .collect();
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Decode a log entry into a [`DecodedEvent`].
    pub fn decode_log(&self, log: &Log) -> Result<DecodedEvent, DecodeError> {
        let signature = *log.topics().first().ok_or(DecodeError::MissingSignature)?;
        let event = self
            .events
            .get(&signature)
            .ok_or(DecodeError::UnknownSignature(signature))?;
        decode_log_with_event(log, event)
    }
}

/// Decode a log entry using a specific (non-anonymous) event definition.
pub fn decode_log_with_event(log: &Log, event: &Event) -> Result<DecodedEvent, DecodeError> {
    let mut topics = log.topics().iter().skip(1);
    let mut indexed_values = Vec::new();
    let mut body_params = Vec::new();

    for param in &event.inputs {
        if param.indexed {
            let topic = topics.next().ok_or_else(|| DecodeError::MissingTopic {
                event: event.name.clone(),
                param: param.name.clone(),
            })?;
            indexed_values.push(decode_indexed_param(event, param, *topic)?);
        } else {
            body_params.push(param);
        }
    }

    let mut body_values = decode_data_params(event, &body_params, &log.data.data)?.into_iter();
    let mut indexed_values = indexed_values.into_iter();

    // Restore declaration order: indexed and body parameters interleave.
    let mut params = Vec::with_capacity(event.inputs.len());
    for param in &event.inputs {
        let value = if param.indexed { indexed_values.next() } else { body_values.next() };
        let value = value.ok_or_else(|| DecodeError::Abi {
            event: event.name.clone(),
            reason: format!("missing value for parameter `{}`", param.name),
        })?;
        params.push(DecodedParam {
            name: param.name.clone(),
            param_type: param.ty.clone(),
            value,
        });
    }

    Ok(DecodedEvent { name: event.name.clone(), params })
}

fn resolve_type(event: &Event, param: &EventParam) -> Result<DynSolType, DecodeError> {
    param.resolve().map_err(|e| DecodeError::ParamType {
        event: event.name.clone(),
        param: param.name.clone(),
        reason: e.to_string(),
    })
}

/// Decode an indexed parameter from a topic
fn decode_indexed_param(event: &Event, param: &EventParam, topic: B256) -> Result<DynSolValue, DecodeError> {
    let sol_type = resolve_type(event, param)?;

    match &sol_type {
        // Reference types are stored as the keccak256 of their encoding, the
        // original value cannot be recovered from the topic.
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(topic, 32)),
        _ => sol_type.abi_decode(topic.as_slice()).map_err(|e| DecodeError::Abi {
            event: event.name.clone(),
            reason: format!("indexed parameter `{}`: {}", param.name, e),
        }),
    }
}

/// Decode non-indexed parameters from log data
fn decode_data_params(event: &Event, params: &[&EventParam], data: &[u8]) -> Result<Vec<DynSolValue>, DecodeError> {
    if params.is_empty() {
        return Ok(Vec::new());
    }

    let param_types = params
        .iter()
        .map(|p| resolve_type(event, p))
        .collect::<Result<Vec<_>, _>>()?;

    let decoded = DynSolType::Tuple(param_types)
        .abi_decode_params(data)
        .map_err(|e| DecodeError::Abi { event: event.name.clone(), reason: format!("log data: {}", e) })?;

    match decoded {
        DynSolValue::Tuple(values) => Ok(values),
        _ => Err(DecodeError::Abi {
            event: event.name.clone(),
            reason: "expected tuple from log data decoding".to_string(),
        }),
    }
}

/// Convert a decoded value to JSON. Integers become decimal strings so they
/// survive consumers that parse numbers as doubles; addresses are lowercase.
pub fn value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => Value::String(format!("0x{}", hex::encode(&word[..*size]))),
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::Address(addr) => Value::String(format!("{:#x}", addr)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) | DynSolValue::Tuple(values) => {
            Value::Array(values.iter().map(value_to_json).collect())
        }
        other => Value::String(format!("{:?}", other)),
    }
}

/// Format DynSolValue for human-readable display
fn format_value(value: &DynSolValue) -> String {
    match value {
        DynSolValue::Bool(b) => b.to_string(),
        DynSolValue::Int(i, _) => i.to_string(),
        DynSolValue::Uint(u, _) => u.to_string(),
        DynSolValue::FixedBytes(word, size) => format!("0x{}", hex::encode(&word[..*size])),
        DynSolValue::Bytes(bytes) => format!("0x{}", hex::encode(bytes)),
        DynSolValue::Address(addr) => format!("{:#x}", addr),
        DynSolValue::String(s) => format!("\"{}\"", s),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => {
            format!("[{}]", values.iter().map(format_value).collect::<Vec<_>>().join(", "))
        }
        DynSolValue::Tuple(values) => {
            format!("({})", values.iter().map(format_value).collect::<Vec<_>>().join(", "))
        }
        other => format!("{:?}", other),
    }
}
