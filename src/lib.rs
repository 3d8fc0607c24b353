//! Real-time order-flow analytics engine for a single spot market.
//!
//! The crate wires a hot pipeline from raw exchange frames to coordinated
//! trading signals:
//!
//! - [`book`]: passive-liquidity order book with sequence-validated depth
//!   diffs, pruning, and health tracking.
//! - [`preprocessor`]: trade enrichment with passive context and
//!   multi-resolution zone snapshots.
//! - [`zones`]: long-horizon accumulation/distribution zone lifecycles.
//! - [`detectors`]: absorption, exhaustion, accumulation, distribution,
//!   and CVD divergence pattern detectors.
//! - [`anomaly`]: sliding-window market anomaly detection and health.
//! - [`coordinator`]: candidate gating, correlation, and confirmation.
//! - [`pipeline`]: the single-owner engine loop, bounded ingress queue,
//!   and replay driver.
//!
//! Prices and quantities are fixed-point scaled integers throughout
//! ([`fixed`]); decimal strings are converted exactly once at the wire
//! boundary ([`wire`]).

pub mod anomaly;
pub mod book;
pub mod config;
pub mod coordinator;
pub mod detectors;
pub mod error;
pub mod events;
pub mod fixed;
pub mod journal;
pub mod pipeline;
pub mod preprocessor;
pub mod wire;
pub mod zones;

pub use config::EngineConfig;
pub use error::EngineError;
pub use pipeline::{Engine, EngineStats, IngressQueue};
