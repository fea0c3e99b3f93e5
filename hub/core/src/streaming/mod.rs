//! Streaming Infrastructure
//!
//! Turns a backend's chunk stream into the events a client receives.
//!
//! # Architecture
//!
//! ```text
//! CompletionBackend ──chunks──▶ StreamAggregator ──flushes──▶ DeliverySink
//!                                 [buffer, count]
//! ```
//!
//! The aggregator trades latency for fewer transport messages. It is created
//! per call and never shared between calls or sessions.
//!
//! # Example
//!
//! ```
//! use hub_core::streaming::StreamAggregator;
//!
//! let mut aggregator = StreamAggregator::new(3);
//! let mut out: Vec<String> = ["a", "b", "c", "d", "e"]
//!     .into_iter()
//!     .filter_map(|chunk| aggregator.push(chunk))
//!     .collect();
//! out.extend(aggregator.finish());
//! assert_eq!(out, vec!["abcd", "e"]);
//! ```

mod aggregator;

pub use aggregator::{AggregatorStats, StreamAggregator};

// Re-export CompletionChunk from backend for convenience
pub use crate::backend::CompletionChunk;
