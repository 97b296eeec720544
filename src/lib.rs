//! MCP Fallback - Multi-transport command delivery for agents
//!
//! Delivers command envelopes between agents over whichever transport is
//! currently healthy. Transports are tried in priority order (HTTP, shared
//! filesystem, in-process queue by default); a failed send triggers a single
//! retry after re-selecting the best healthy transport.
//!
//! # Architecture
//!
//! - **protocol**: Envelope, transports, dispatch, and the fallback manager
//! - **config**: YAML configuration and validation
//! - **metrics**: Prometheus counters for sends, receipts, errors, failovers
//! - **logging**: tracing subscriber setup

// Core modules
pub mod config;
pub mod error;
pub mod protocol;

// Ambient
pub mod logging;
pub mod metrics;

// Re-exports
pub use error::{FallbackError, Result};
