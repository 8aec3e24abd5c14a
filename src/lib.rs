pub mod abi;
pub mod chain;
pub mod config;
pub mod event_decoder;
pub mod indexer;
pub mod storage;
pub mod types;
pub mod web_api;
