//! Exchange latency measurement primitives.
//!
//! This crate focuses on *round-trip latency* of exchange operations rather than
//! on trading. Timed orderbook fetches, order placements and cancellations are
//! issued against pluggable exchange capabilities over REST and WebSocket, and
//! the outcomes feed rolling per-(exchange, operation, transport) series that
//! compute mean, median, stddev, p95/p99 and failure rate for live display.

pub mod aggregator;
pub mod capability;
pub mod cleanup;
pub mod config;
pub mod display;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod pricing;
pub mod sampler;
pub mod types;

pub use crate::config::Config;
pub use crate::metrics::registry::SeriesRegistry;
pub use crate::sampler::{Sampler, SamplerReport};
