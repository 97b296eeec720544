//! Transport abstraction
//!
//! Defines the trait for pluggable delivery backends plus the state every
//! backend shares: status, statistics, and the listener task handle.

use super::dispatch::{CommandDispatcher, CommandHandler};
use super::envelope::{option_unix_seconds, Envelope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Transport errors
///
/// Used inside transports; collapsed to `false` at the `Transport::send` boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Unavailable(_) => "unavailable",
            TransportError::Delivery(_) => "delivery",
            TransportError::Handler(_) => "handler",
            TransportError::Serialization(_) => "serialization",
            TransportError::Io(_) => "io",
            TransportError::Http(_) => "http",
        }
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport health state
///
/// Only `Active` transports are eligible for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TransportStatus {
    Active = 0,
    Degraded = 1,
    Failed = 2,
    Disabled = 3,
}

impl TransportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportStatus::Active => "active",
            TransportStatus::Degraded => "degraded",
            TransportStatus::Failed => "failed",
            TransportStatus::Disabled => "disabled",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportStatus::Active,
            1 => TransportStatus::Degraded,
            2 => TransportStatus::Failed,
            _ => TransportStatus::Disabled,
        }
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free status cell
///
/// Cloning yields a handle to the same cell, so a server task can report the
/// status of the transport that spawned it.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    /// New cell; transports start `Disabled` until initialized
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TransportStatus::Disabled as u8)))
    }

    pub fn get(&self) -> TransportStatus {
        TransportStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: TransportStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transport counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub commands_sent: u64,
    pub commands_received: u64,
    pub errors: u64,
    #[serde(with = "option_unix_seconds")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// A delivery mechanism for envelopes
///
/// Implementations use interior mutability so a single instance can be shared
/// (`Arc<dyn Transport>`) between the manager, its health monitor, and callers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocol name (e.g. `mcp_http`)
    fn name(&self) -> &str;

    /// One-time setup; idempotent. Sets `Failed` and returns false on error.
    async fn initialize(&self) -> bool;

    /// One delivery attempt through this transport only. Never retries.
    async fn send(&self, envelope: &Envelope) -> bool;

    /// Begin processing inbound envelopes
    async fn start_listening(&self);

    /// Stop processing inbound envelopes. Safe to call when not listening;
    /// no handler runs after this returns.
    async fn stop_listening(&self);

    /// Lightweight viability check. Must not send business commands.
    async fn health_check(&self) -> bool;

    /// The dispatcher receiving this transport's inbound envelopes
    fn dispatcher(&self) -> &CommandDispatcher;

    /// Current status
    fn status(&self) -> TransportStatus;

    /// Override the status (e.g. an operator disabling a transport)
    fn set_status(&self, status: TransportStatus);

    /// Snapshot of the counters
    fn stats(&self) -> TransportStats {
        self.dispatcher().stats()
    }

    /// Append a handler for `command_name`
    fn register_command_handler(&self, command_name: &str, handler: Arc<dyn CommandHandler>) {
        self.dispatcher().register(command_name, handler);
    }
}

/// Background listener loop with a cooperative stop signal
///
/// The loop receives a `watch::Receiver<bool>` that flips to `true` on stop.
/// Stopping waits for the loop to exit, so an in-flight dispatch completes.
pub(crate) struct ListenerTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ListenerTask {
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(stop_rx));
        Self { stop_tx, handle }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Listener task ended abnormally");
        }
    }
}

/// Resolves once `stop_rx` reads `true` (or its sender is gone)
pub(crate) async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_cell_shared() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), TransportStatus::Disabled);

        let other = cell.clone();
        other.set(TransportStatus::Active);
        assert_eq!(cell.get(), TransportStatus::Active);

        cell.set(TransportStatus::Degraded);
        assert_eq!(other.get(), TransportStatus::Degraded);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TransportStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert_eq!(TransportStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_stats_serialization() {
        let stats = TransportStats {
            commands_sent: 2,
            commands_received: 1,
            errors: 0,
            last_activity: None,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["commands_sent"], 2);
        assert_eq!(value["last_activity"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_listener_task_stops() {
        let task = ListenerTask::spawn(|mut stop_rx| async move {
            stopped(&mut stop_rx).await;
        });
        assert!(!task.is_finished());

        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("listener did not stop");
    }
}
