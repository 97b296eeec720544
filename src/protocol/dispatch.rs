//! Command dispatch
//!
//! Routes received envelopes to the handlers registered for their command name
//! and owns the per-transport statistics.
//!
//! Handlers for one command run in registration order. A handler that returns an
//! error, panics, or exceeds the handler timeout is counted in `errors` and logged;
//! the remaining handlers and later envelopes are unaffected.

use super::envelope::{Envelope, Parameters};
use super::transport::TransportStats;
use crate::metrics;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default upper bound for a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one command's parameters
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, parameters: &Parameters) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`CommandHandler`]
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F, Fut>
where
    F: Fn(Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, parameters: &Parameters) -> anyhow::Result<()> {
        (self.f)(parameters.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
///
/// ```
/// use mcp_fallback::protocol::handler_fn;
///
/// let handler = handler_fn(|params| async move {
///     tracing::info!(?params, "echo");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

/// Result of dispatching one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// TTL elapsed; no handler ran
    Expired,
    /// Handlers ran; `failed` of them errored
    Dispatched { handlers: usize, failed: usize },
}

type HandlerTable = HashMap<String, Vec<Arc<dyn CommandHandler>>>;

/// Tagged dispatch table plus statistics for one transport
///
/// Only the owning transport writes the counters; callers read them through
/// `stats()`.
///
/// ```compile_fail
/// use mcp_fallback::protocol::CommandDispatcher;
///
/// let dispatcher = CommandDispatcher::new("mcp_memory");
/// dispatcher.record_sent();
/// ```
pub struct CommandDispatcher {
    transport: String,
    handlers: RwLock<HandlerTable>,
    stats: Mutex<TransportStats>,
    handler_timeout: Option<Duration>,
}

impl CommandDispatcher {
    /// Create a dispatcher for the named transport
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            handlers: RwLock::new(HashMap::new()),
            stats: Mutex::new(TransportStats::default()),
            handler_timeout: Some(DEFAULT_HANDLER_TIMEOUT),
        }
    }

    /// Override the per-handler timeout (`None` waits indefinitely)
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Transport name used in logs and metrics
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Append a handler for `command_name`
    pub fn register(&self, command_name: &str, handler: Arc<dyn CommandHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(command_name.to_string())
            .or_default()
            .push(handler);
        debug!(
            transport = %self.transport,
            command = command_name,
            "Registered command handler"
        );
    }

    /// Number of handlers registered for `command_name`
    pub fn handler_count(&self, command_name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command_name)
            .map_or(0, Vec::len)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> TransportStats {
        self.lock_stats().clone()
    }

    /// Record a successful send
    pub(crate) fn record_sent(&self) {
        let mut stats = self.lock_stats();
        stats.commands_sent += 1;
        stats.last_activity = Some(Utc::now());
        drop(stats);
        metrics::record_sent(&self.transport);
    }

    /// Record an error of the given kind
    pub(crate) fn record_error(&self, kind: &str) {
        self.lock_stats().errors += 1;
        metrics::record_error(&self.transport, kind);
    }

    /// Route an envelope to its handlers
    ///
    /// Never fails: handler errors are counted and logged, not propagated.
    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        if envelope.is_expired() {
            self.lock_stats().commands_received += 1;
            metrics::record_received(&self.transport);
            warn!(
                transport = %self.transport,
                message_id = %envelope.id,
                command = %envelope.command_name,
                "Dropping expired command"
            );
            return DispatchOutcome::Expired;
        }

        {
            let mut stats = self.lock_stats();
            stats.commands_received += 1;
            stats.last_activity = Some(Utc::now());
        }
        metrics::record_received(&self.transport);

        // Clone the list so no lock is held across handler awaits
        let handlers: Vec<Arc<dyn CommandHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.command_name)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                transport = %self.transport,
                message_id = %envelope.id,
                command = %envelope.command_name,
                "No handlers registered for command"
            );
        }

        let mut failed = 0;
        for handler in &handlers {
            if let Err(message) = self.invoke(handler.as_ref(), &envelope.parameters).await {
                failed += 1;
                self.record_error("handler");
                error!(
                    transport = %self.transport,
                    message_id = %envelope.id,
                    command = %envelope.command_name,
                    "Command handler error: {}",
                    message
                );
            }
        }

        debug!(
            transport = %self.transport,
            message_id = %envelope.id,
            command = %envelope.command_name,
            handlers = handlers.len(),
            failed,
            "Dispatched command"
        );

        DispatchOutcome::Dispatched {
            handlers: handlers.len(),
            failed,
        }
    }

    async fn invoke(
        &self,
        handler: &dyn CommandHandler,
        parameters: &Parameters,
    ) -> std::result::Result<(), String> {
        let call = AssertUnwindSafe(handler.handle(parameters)).catch_unwind();

        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(format!("handler timed out after {:?}", limit)),
            },
            None => call.await,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, TransportStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn CommandHandler> {
        handler_fn(move |_params| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    struct PanickingHandler;

    #[async_trait]
    impl CommandHandler for PanickingHandler {
        async fn handle(&self, _parameters: &Parameters) -> anyhow::Result<()> {
            panic!("handler exploded")
        }
    }

    fn envelope(command: &str) -> Envelope {
        Envelope::new("agent-a", "agent-b", command, Parameters::new())
    }

    #[tokio::test]
    async fn test_dispatch_invokes_all_handlers_in_order() {
        let dispatcher = CommandDispatcher::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            dispatcher.register(
                "ping",
                handler_fn(move |_params| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(i);
                        Ok(())
                    }
                }),
            );
        }

        let outcome = dispatcher.dispatch(&envelope("ping")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                handlers: 3,
                failed: 0
            }
        );
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        let stats = dispatcher.stats();
        assert_eq!(stats.commands_received, 1);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let dispatcher = CommandDispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            "ping",
            handler_fn(|_params| async { Err(anyhow::anyhow!("boom")) }),
        );
        dispatcher.register("ping", counting_handler(counter.clone()));

        let outcome = dispatcher.dispatch(&envelope("ping")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                handlers: 2,
                failed: 1
            }
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().errors, 1);

        // Later envelopes still dispatch
        dispatcher.dispatch(&envelope("ping")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let dispatcher = CommandDispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        dispatcher.register("ping", Arc::new(PanickingHandler));
        dispatcher.register("ping", counting_handler(counter.clone()));

        dispatcher.dispatch(&envelope("ping")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let dispatcher =
            CommandDispatcher::new("test").with_handler_timeout(Some(Duration::from_millis(20)));
        let counter = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            "ping",
            handler_fn(|_params| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        );
        dispatcher.register("ping", counting_handler(counter.clone()));

        dispatcher.dispatch(&envelope("ping")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_expired_envelope_not_dispatched() {
        let dispatcher = CommandDispatcher::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.register("ping", counting_handler(counter.clone()));

        let mut env = envelope("ping").with_ttl(Duration::from_millis(1));
        env.created_at -= chrono::Duration::milliseconds(50);

        let outcome = dispatcher.dispatch(&env).await;
        assert_eq!(outcome, DispatchOutcome::Expired);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let stats = dispatcher.stats();
        assert_eq!(stats.commands_received, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_unknown_command_counts_receipt() {
        let dispatcher = CommandDispatcher::new("test");

        let outcome = dispatcher.dispatch(&envelope("nobody-listens")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                handlers: 0,
                failed: 0
            }
        );
        assert_eq!(dispatcher.stats().commands_received, 1);
    }

    #[test]
    fn test_record_sent_and_error() {
        let dispatcher = CommandDispatcher::new("test");
        dispatcher.record_sent();
        dispatcher.record_error("delivery");

        let stats = dispatcher.stats();
        assert_eq!(stats.commands_sent, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(dispatcher.handler_count("ping"), 0);
    }
}
