//! Configuration system
//!
//! Loads ~/.config/mcp-fallback/config.yaml with:
//! - Local participant id
//! - Retry policy and health monitor period
//! - Per-protocol enable flag, priority, and settings
//! - Static HTTP endpoint table

mod fallback_config;
pub mod validation;

pub use fallback_config::{
    FallbackConfig, FileProtocolConfig, HttpProtocolConfig, MemoryProtocolConfig,
    ProtocolsConfig, RetryConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
