//! Mempool Collector Library
//!
//! Subscribes to pending transactions from full nodes and commercial mempool
//! feeds, deduplicates them, records every sighting to hour-bucketed CSV
//! files and fans first-seen transactions out to HTTP receivers and live
//! SSE subscribers.

pub mod alias;
pub mod codec;
pub mod config;
pub mod files;
pub mod logging;
pub mod metrics;
pub mod observation;
pub mod processor;
pub mod receivers;
pub mod server;
pub mod source;
pub mod sse;

// Re-export commonly used types
pub use codec::{decode_raw, encode_raw, DecodeError, RawTransaction};
pub use files::{FileError, FileManager};
pub use observation::Observation;
pub use processor::{Outcome, ProcessError, Processor};
pub use source::{Connector, Feed, SourceError, SourceKind, SourceSpec, TxStream};
pub use sse::SubscriberHub;
