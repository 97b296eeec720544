//! In-process transport
//!
//! Lowest-latency delivery between components of the same process, used as the
//! last-resort fallback. Sends push onto an unbounded FIFO queue; a single
//! listener task drains it through the dispatcher.

use super::dispatch::CommandDispatcher;
use super::envelope::Envelope;
use super::transport::{stopped, ListenerTask, StatusCell, Transport, TransportStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Protocol name reported by this transport
pub const MEMORY_PROTOCOL: &str = "mcp_memory";

/// In-process queue transport
pub struct InMemoryTransport {
    dispatcher: Arc<CommandDispatcher>,
    status: StatusCell,
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    listener: Mutex<Option<ListenerTask>>,
}

impl InMemoryTransport {
    /// Create a new in-process transport
    pub fn new() -> Self {
        Self::with_dispatcher(CommandDispatcher::new(MEMORY_PROTOCOL))
    }

    /// Create with a preconfigured dispatcher (e.g. a custom handler timeout)
    pub fn with_dispatcher(dispatcher: CommandDispatcher) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            dispatcher: Arc::new(dispatcher),
            status: StatusCell::new(),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            listener: Mutex::new(None),
        }
    }

    /// Whether the listener task is running
    pub async fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        MEMORY_PROTOCOL
    }

    async fn initialize(&self) -> bool {
        self.status.set(TransportStatus::Active);
        info!(transport = MEMORY_PROTOCOL, "Transport initialized");
        true
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        match self.sender.send(envelope.clone()) {
            Ok(()) => {
                self.dispatcher.record_sent();
                debug!(
                    transport = MEMORY_PROTOCOL,
                    message_id = %envelope.id,
                    command = %envelope.command_name,
                    "Command queued"
                );
                true
            }
            Err(e) => {
                self.dispatcher.record_error("delivery");
                error!(transport = MEMORY_PROTOCOL, error = %e, "Failed to queue command");
                false
            }
        }
    }

    async fn start_listening(&self) {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let receiver = self.receiver.clone();
        *listener = Some(ListenerTask::spawn(move |mut stop_rx| async move {
            let mut queue = receiver.lock().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop_rx) => break,
                    next = queue.recv() => match next {
                        Some(envelope) => {
                            dispatcher.dispatch(&envelope).await;
                        }
                        None => break,
                    },
                }
            }
        }));
        info!(transport = MEMORY_PROTOCOL, "Started listening");
    }

    async fn stop_listening(&self) {
        let task = self.listener.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
            info!(transport = MEMORY_PROTOCOL, "Stopped listening");
        }
    }

    async fn health_check(&self) -> bool {
        self.status.get() == TransportStatus::Active
    }

    fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    fn status(&self) -> TransportStatus {
        self.status.get()
    }

    fn set_status(&self, status: TransportStatus) {
        self.status.set(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{handler_fn, Parameters};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_health_follows_initialize() {
        let transport = InMemoryTransport::new();
        assert!(!transport.health_check().await);

        assert!(transport.initialize().await);
        assert!(transport.initialize().await);
        assert!(transport.health_check().await);

        transport.set_status(TransportStatus::Disabled);
        assert!(!transport.health_check().await);
    }

    #[tokio::test]
    async fn test_send_and_dispatch_fifo() {
        let transport = InMemoryTransport::new();
        transport.initialize().await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            let count = count.clone();
            transport.register_command_handler(
                "ping",
                handler_fn(move |params| {
                    let seen = seen.clone();
                    let count = count.clone();
                    async move {
                        seen.lock().unwrap().push(params["n"].as_i64().unwrap_or(-1));
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }
        transport.start_listening().await;

        for n in 0..5 {
            let mut params = Parameters::new();
            params.insert("n".to_string(), n.into());
            assert!(transport.send(&Envelope::new("a", "b", "ping", params)).await);
        }

        wait_for(&count, 5).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        let stats = transport.stats();
        assert_eq!(stats.commands_sent, 5);
        assert_eq!(stats.commands_received, 5);

        transport.stop_listening().await;
    }

    #[tokio::test]
    async fn test_stop_listening_is_idempotent() {
        let transport = InMemoryTransport::new();
        transport.initialize().await;

        // Stopping before starting is fine
        transport.stop_listening().await;

        transport.start_listening().await;
        assert!(transport.is_listening().await);

        transport.stop_listening().await;
        transport.stop_listening().await;
        assert!(!transport.is_listening().await);
    }

    #[tokio::test]
    async fn test_no_dispatch_after_stop() {
        let transport = InMemoryTransport::new();
        transport.initialize().await;

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            transport.register_command_handler(
                "ping",
                handler_fn(move |_params| {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        transport.start_listening().await;
        transport.stop_listening().await;

        // Queued while stopped: stays in the queue
        assert!(transport.send(&Envelope::new("a", "b", "ping", Parameters::new())).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Restarting drains it
        transport.start_listening().await;
        wait_for(&count, 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        transport.stop_listening().await;
    }
}
