//! Fallback manager
//!
//! Owns a priority-ordered registry of transports and routes outbound envelopes
//! through the highest-priority healthy one. The active transport is re-selected
//! after `initialize`, periodically by a background health monitor, and right
//! after a failed send.
//!
//! # Lifecycle
//!
//! ```text
//! new() -> add_transport()* -> initialize() -> start() -> ... -> shutdown()
//! ```
//!
//! Ordinary delivery failures never escape as errors: `send_command` and
//! `send_fallback_command` report a boolean, with diagnostics in `get_status()`
//! and the logs.

use super::dispatch::CommandHandler;
use super::envelope::{Envelope, MessagePriority, Parameters};
use super::filesystem::FilesystemTransport;
use super::http::{EndpointTable, HttpTransport};
use super::memory::InMemoryTransport;
use super::retry::RetryPolicy;
use super::transport::{stopped, ListenerTask, Transport, TransportStats, TransportStatus};
use crate::config::{validate_config_result, FallbackConfig};
use crate::metrics;
use crate::{FallbackError, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default period of the health monitor
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Floor for the health monitor period
const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// A transport plus its place in the registry
struct Registered {
    transport: Arc<dyn Transport>,
    priority: i32,
    seq: usize,
}

/// Snapshot of one transport for `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportReport {
    pub name: String,
    pub priority: i32,
    pub status: TransportStatus,
    pub stats: TransportStats,
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackStatus {
    /// Name of the active transport, if any
    pub active_transport: Option<String>,

    /// Registered transports, highest priority first
    pub transports: Vec<TransportReport>,
}

/// Priority-ordered transport selection with single-retry failover
pub struct FallbackManager {
    registry: Vec<Registered>,
    active: RwLock<Option<usize>>,
    retry: RetryPolicy,
    health_check_interval: Duration,
    failure_cooldown: Duration,
    failures: Mutex<HashMap<usize, Instant>>,
    initialized: AtomicBool,
    monitor: tokio::sync::Mutex<Option<ListenerTask>>,
}

impl FallbackManager {
    /// Create an empty manager with default retry and health settings
    pub fn new() -> Self {
        Self {
            registry: Vec::new(),
            active: RwLock::new(None),
            retry: RetryPolicy::default(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            failure_cooldown: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the health monitor period
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Skip a transport for `cooldown` after it fails a send, unless it is the
    /// only healthy one. Zero disables the cooldown.
    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    /// Build a manager with the transports enabled in `config`
    ///
    /// Invalid configuration is the one error that aborts startup.
    pub fn from_config(config: &FallbackConfig) -> Result<Self> {
        validate_config_result(config)?;

        let mut manager = Self::new()
            .with_retry_policy(config.retry.policy())
            .with_health_check_interval(config.health_check_interval())
            .with_failure_cooldown(config.failure_cooldown());

        let protocols = &config.protocols;
        if protocols.memory.enabled {
            manager.add_transport(Arc::new(InMemoryTransport::new()), protocols.memory.priority)?;
        }
        if protocols.file.enabled {
            let transport = FilesystemTransport::new(&protocols.file.base_path)
                .with_poll_interval(protocols.file.poll_interval());
            manager.add_transport(Arc::new(transport), protocols.file.priority)?;
        }
        if protocols.http.enabled {
            let transport = HttpTransport::new(&protocols.http.host, protocols.http.port)
                .with_request_timeout(protocols.http.request_timeout())
                .with_endpoints(EndpointTable::from_map(protocols.http.endpoints.clone()));
            manager.add_transport(Arc::new(transport), protocols.http.priority)?;
        }

        if manager.registry.is_empty() {
            return Err(FallbackError::Config(
                "no protocols enabled in configuration".to_string(),
            ));
        }

        Ok(manager)
    }

    /// Register a transport
    ///
    /// Must be called before `initialize`. Transport names are unique.
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>, priority: i32) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(FallbackError::Config(format!(
                "cannot add transport {} after initialize",
                transport.name()
            )));
        }
        if self.transport(transport.name()).is_some() {
            return Err(FallbackError::Config(format!(
                "transport {} is already registered",
                transport.name()
            )));
        }

        debug!(transport = transport.name(), priority, "Registered transport");
        let seq = self.registry.len();
        self.registry.push(Registered {
            transport,
            priority,
            seq,
        });
        // Stable: equal priorities keep registration order
        self.registry.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(())
    }

    /// Look up a registered transport by name
    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.registry
            .iter()
            .find(|r| r.transport.name() == name)
            .map(|r| r.transport.clone())
    }

    /// Registered transport names, highest priority first
    pub fn transport_names(&self) -> Vec<&str> {
        self.registry.iter().map(|r| r.transport.name()).collect()
    }

    /// Register `handler` for `command_name` on every transport
    pub fn register_command_handler(&self, command_name: &str, handler: Arc<dyn CommandHandler>) {
        for registered in &self.registry {
            registered
                .transport
                .register_command_handler(command_name, handler.clone());
        }
    }

    /// Initialize and start listening on every transport, then select one
    ///
    /// Returns true if at least one transport initialized.
    pub async fn initialize(&self) -> bool {
        self.initialized.store(true, Ordering::Release);

        let mut initialized = 0;
        for registered in &self.registry {
            let transport = &registered.transport;
            if transport.initialize().await {
                transport.start_listening().await;
                initialized += 1;
            } else {
                error!(transport = transport.name(), "Transport failed to initialize");
            }
        }

        if initialized == 0 {
            error!("No transport could be initialized");
        } else {
            info!(
                initialized,
                registered = self.registry.len(),
                "Fallback manager initialized"
            );
        }

        self.select_active().await;
        initialized > 0
    }

    /// Start the background health monitor. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.health_check_interval.max(MIN_HEALTH_CHECK_INTERVAL);
        *monitor = Some(ListenerTask::spawn(move |mut stop_rx| async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; initialize() already selected
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop_rx) => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        let cycle = AssertUnwindSafe(manager.select_active()).catch_unwind();
                        if cycle.await.is_err() {
                            error!("Health check cycle panicked; continuing");
                        }
                    }
                }
            }
        }));
        info!(
            interval_secs = period.as_secs_f64(),
            "Health monitor started"
        );
    }

    /// Select the highest-priority healthy transport
    ///
    /// Returns the name of the new active transport, or None if every
    /// transport is unhealthy.
    pub async fn select_active(&self) -> Option<String> {
        self.select()
            .await
            .map(|(_, transport)| transport.name().to_string())
    }

    async fn select(&self) -> Option<(usize, Arc<dyn Transport>)> {
        let mut chosen = None;
        let mut cooling = None;

        for (index, registered) in self.registry.iter().enumerate() {
            if !registered.transport.health_check().await {
                continue;
            }
            if self.in_cooldown(registered.seq) {
                cooling.get_or_insert(index);
                continue;
            }
            chosen = Some(index);
            break;
        }

        let chosen = chosen.or(cooling);
        let previous = std::mem::replace(
            &mut *self.active.write().unwrap_or_else(PoisonError::into_inner),
            chosen,
        );

        let name = chosen.map(|index| self.registry[index].transport.name());
        if previous != chosen {
            match name {
                Some(name) => {
                    let from = previous.map(|index| self.registry[index].transport.name());
                    if from.is_some() {
                        metrics::record_failover();
                    }
                    info!(from = ?from, to = name, "Active transport changed");
                }
                None => warn!("All transports unhealthy; no active transport"),
            }
        }
        metrics::set_active_transport(self.transport_names(), name);

        chosen.map(|index| (index, self.registry[index].transport.clone()))
    }

    fn in_cooldown(&self, seq: usize) -> bool {
        if self.failure_cooldown.is_zero() {
            return false;
        }
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&seq)
            .is_some_and(|failed_at| failed_at.elapsed() < self.failure_cooldown)
    }

    fn note_failure(&self, index: usize) {
        if self.failure_cooldown.is_zero() {
            return;
        }
        let seq = self.registry[index].seq;
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, Instant::now());
    }

    async fn current(&self) -> Option<(usize, Arc<dyn Transport>)> {
        let active = *self.active.read().unwrap_or_else(PoisonError::into_inner);
        match active {
            Some(index) => Some((index, self.registry[index].transport.clone())),
            None => self.select().await,
        }
    }

    /// Build a fresh envelope and send it through the fallback chain
    pub async fn send_command(
        &self,
        sender_id: &str,
        recipient_id: &str,
        command_name: &str,
        parameters: Parameters,
        priority: MessagePriority,
    ) -> bool {
        let mut envelope = Envelope::new(sender_id, recipient_id, command_name, parameters)
            .with_priority(priority)
            .with_max_retries(self.retry.max_retries);
        self.send_fallback_command(&mut envelope).await
    }

    /// Send through the active transport, retrying once after reselection
    ///
    /// On failure with retries left, `retry_count` is incremented, the backoff
    /// elapses, a transport is re-selected, and exactly one more attempt is
    /// made. The result of that attempt is the result of the call.
    pub async fn send_fallback_command(&self, envelope: &mut Envelope) -> bool {
        let Some((index, transport)) = self.current().await else {
            warn!(
                message_id = %envelope.id,
                command = %envelope.command_name,
                "No transport available"
            );
            return false;
        };

        if transport.send(envelope).await {
            return true;
        }
        self.note_failure(index);

        if !self.retry.should_retry(envelope) {
            warn!(
                transport = transport.name(),
                message_id = %envelope.id,
                retry_count = envelope.retry_count,
                "Send failed; retries exhausted"
            );
            return false;
        }

        envelope.retry_count += 1;
        metrics::record_retry();
        warn!(
            transport = transport.name(),
            message_id = %envelope.id,
            retry_count = envelope.retry_count,
            "Send failed; retrying after reselection"
        );
        self.retry.wait().await;

        let Some((index, transport)) = self.select().await else {
            warn!(message_id = %envelope.id, "No transport available for retry");
            return false;
        };

        let delivered = transport.send(envelope).await;
        if delivered {
            debug!(
                transport = transport.name(),
                message_id = %envelope.id,
                "Retry succeeded"
            );
        } else {
            self.note_failure(index);
            error!(
                transport = transport.name(),
                message_id = %envelope.id,
                "Retry failed"
            );
        }
        delivered
    }

    /// Name of the active transport
    pub fn active_transport(&self) -> Option<String> {
        let active = *self.active.read().unwrap_or_else(PoisonError::into_inner);
        active.map(|index| self.registry[index].transport.name().to_string())
    }

    /// Read-only snapshot of the registry
    pub fn get_status(&self) -> FallbackStatus {
        FallbackStatus {
            active_transport: self.active_transport(),
            transports: self
                .registry
                .iter()
                .map(|r| TransportReport {
                    name: r.transport.name().to_string(),
                    priority: r.priority,
                    status: r.transport.status(),
                    stats: r.transport.stats(),
                })
                .collect(),
        }
    }

    /// Stop the health monitor, then every transport in registration order.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
            debug!("Health monitor stopped");
        }

        let mut in_registration_order: Vec<&Registered> = self.registry.iter().collect();
        in_registration_order.sort_by_key(|r| r.seq);

        for registered in in_registration_order {
            let transport = &registered.transport;
            let stop = AssertUnwindSafe(transport.stop_listening()).catch_unwind();
            if stop.await.is_err() {
                error!(transport = transport.name(), "Transport panicked while stopping");
            }
        }

        *self.active.write().unwrap_or_else(PoisonError::into_inner) = None;
        metrics::set_active_transport(self.transport_names(), None);
        info!("Fallback manager shut down");
    }
}

impl Default for FallbackManager {
    fn default() -> Self {
        Self::new()
    }
}
