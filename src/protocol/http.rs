//! HTTP transport
//!
//! Delivery across machines. `initialize` starts an axum server and builds a
//! long-lived reqwest client; `send` posts the envelope to the endpoint
//! registered for its recipient.
//!
//! # Routes
//!
//! - `POST /mcp/command` - Dispatch an envelope (`{"status":"ok"}` or 400 `{"error":...}`)
//! - `GET /mcp/health` - Transport status and statistics
//! - `GET /mcp/metrics` - Prometheus text exposition
//!
//! The endpoint table maps recipient ids to base URLs. It is a shared handle so a
//! discovery component can update it while sends are in flight.

use super::dispatch::CommandDispatcher;
use super::envelope::Envelope;
use super::transport::{Result, StatusCell, Transport, TransportError, TransportStats, TransportStatus};
use crate::metrics;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Protocol name reported by this transport
pub const HTTP_PROTOCOL: &str = "mcp_http";

/// Default bind host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default bind port
pub const DEFAULT_PORT: u16 = 8766;

/// Default timeout for outbound requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared recipient-id -> base-URL table
#[derive(Debug, Clone, Default)]
pub struct EndpointTable(Arc<RwLock<HashMap<String, String>>>);

impl EndpointTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from an existing map
    pub fn from_map(endpoints: HashMap<String, String>) -> Self {
        Self(Arc::new(RwLock::new(endpoints)))
    }

    /// Add or replace the endpoint for a recipient
    pub fn register(&self, recipient_id: impl Into<String>, base_url: impl Into<String>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient_id.into(), base_url.into());
    }

    /// Remove the endpoint for a recipient
    pub fn remove(&self, recipient_id: &str) -> Option<String> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(recipient_id)
    }

    /// Look up the endpoint for a recipient
    pub fn get(&self, recipient_id: &str) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(recipient_id)
            .cloned()
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared server state
struct HttpState {
    dispatcher: Arc<CommandDispatcher>,
    status: StatusCell,
    endpoints: EndpointTable,
}

/// Running server
struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// HTTP transport
pub struct HttpTransport {
    host: String,
    port: u16,
    request_timeout: Duration,
    state: Arc<HttpState>,
    client: RwLock<Option<reqwest::Client>>,
    server: Mutex<Option<ServerHandle>>,
}

impl HttpTransport {
    /// Create a transport that will listen on `host:port` (port 0 picks a free port)
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: Arc::new(HttpState {
                dispatcher: Arc::new(CommandDispatcher::new(HTTP_PROTOCOL)),
                status: StatusCell::new(),
                endpoints: EndpointTable::new(),
            }),
            client: RwLock::new(None),
            server: Mutex::new(None),
        }
    }

    /// Set the outbound request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Use an endpoint table shared with another component
    pub fn with_endpoints(self, endpoints: EndpointTable) -> Self {
        self.rebuild_state(|state| HttpState {
            dispatcher: state.dispatcher.clone(),
            status: state.status.clone(),
            endpoints,
        })
    }

    /// Replace the dispatcher (e.g. a custom handler timeout)
    pub fn with_dispatcher(self, dispatcher: CommandDispatcher) -> Self {
        self.rebuild_state(|state| HttpState {
            dispatcher: Arc::new(dispatcher),
            status: state.status.clone(),
            endpoints: state.endpoints.clone(),
        })
    }

    fn rebuild_state(mut self, f: impl FnOnce(&HttpState) -> HttpState) -> Self {
        self.state = Arc::new(f(&self.state));
        self
    }

    /// Handle to the endpoint table
    pub fn endpoints(&self) -> &EndpointTable {
        &self.state.endpoints
    }

    /// Route `recipient_id` to `base_url`
    pub fn register_endpoint(&self, recipient_id: impl Into<String>, base_url: impl Into<String>) {
        self.state.endpoints.register(recipient_id, base_url);
    }

    /// Forget the route for `recipient_id`
    pub fn remove_endpoint(&self, recipient_id: &str) -> Option<String> {
        self.state.endpoints.remove(recipient_id)
    }

    /// Address the server is bound to, once initialized
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// `http://host:port` of the running server
    pub async fn base_url(&self) -> Option<String> {
        self.local_addr().await.map(|addr| format!("http://{}", addr))
    }

    /// Build the router
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Unavailable("HTTP client not initialized".to_string()))
    }

    async fn post_envelope(&self, envelope: &Envelope) -> Result<()> {
        let endpoint = self.state.endpoints.get(&envelope.recipient_id).ok_or_else(|| {
            TransportError::Unavailable(format!(
                "no endpoint for recipient {}",
                envelope.recipient_id
            ))
        })?;
        let client = self.client()?;
        let url = format!("{}/mcp/command", endpoint.trim_end_matches('/'));

        let response = client.post(&url).json(envelope).send().await?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let error: ErrorResponse = response.json().await.unwrap_or(ErrorResponse {
                error: "Unknown error".to_string(),
            });
            return Err(TransportError::Delivery(format!(
                "{} returned {}: {}",
                url, status, error.error
            )));
        }

        Ok(())
    }
}

fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/mcp/command", post(handle_command))
        .route("/mcp/health", get(handle_health))
        .route("/mcp/metrics", get(handle_metrics))
        .with_state(state)
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        HTTP_PROTOCOL
    }

    async fn initialize(&self) -> bool {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return self.state.status.get() == TransportStatus::Active;
        }

        let client = match reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                self.state.status.set(TransportStatus::Failed);
                error!(transport = HTTP_PROTOCOL, error = %e, "Failed to build HTTP client");
                return false;
            }
        };

        let addr = format!("{}:{}", self.host, self.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.status.set(TransportStatus::Failed);
                error!(
                    transport = HTTP_PROTOCOL,
                    addr = %addr,
                    error = %e,
                    "Transport initialization failed"
                );
                return false;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                self.state.status.set(TransportStatus::Failed);
                error!(transport = HTTP_PROTOCOL, error = %e, "Failed to read bound address");
                return false;
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(self.state.clone());
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(transport = HTTP_PROTOCOL, error = %e, "HTTP server error");
            }
        });

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
        *server = Some(ServerHandle {
            shutdown,
            handle,
            local_addr,
        });
        self.state.status.set(TransportStatus::Active);
        info!(
            transport = HTTP_PROTOCOL,
            addr = %local_addr,
            "HTTP server listening"
        );
        true
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        match self.post_envelope(envelope).await {
            Ok(()) => {
                self.state.dispatcher.record_sent();
                debug!(
                    transport = HTTP_PROTOCOL,
                    message_id = %envelope.id,
                    recipient = %envelope.recipient_id,
                    "Command delivered"
                );
                true
            }
            Err(TransportError::Unavailable(reason)) => {
                metrics::record_error(HTTP_PROTOCOL, "unavailable");
                warn!(
                    transport = HTTP_PROTOCOL,
                    message_id = %envelope.id,
                    "Cannot send: {}",
                    reason
                );
                false
            }
            Err(e) => {
                self.state.dispatcher.record_error(e.kind());
                error!(
                    transport = HTTP_PROTOCOL,
                    message_id = %envelope.id,
                    recipient = %envelope.recipient_id,
                    error = %e,
                    "HTTP send failed"
                );
                false
            }
        }
    }

    async fn start_listening(&self) {
        // The server started by initialize() already accepts requests
    }

    async fn stop_listening(&self) {
        let server = self.server.lock().await.take();
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(server) = server {
            let _ = server.shutdown.send(());
            if let Err(e) = server.handle.await {
                error!(transport = HTTP_PROTOCOL, error = %e, "HTTP server task failed");
            }
            self.state.status.set(TransportStatus::Disabled);
            info!(transport = HTTP_PROTOCOL, "HTTP server stopped");
        }
    }

    async fn health_check(&self) -> bool {
        self.state.status.get() == TransportStatus::Active
    }

    fn dispatcher(&self) -> &CommandDispatcher {
        &self.state.dispatcher
    }

    fn status(&self) -> TransportStatus {
        self.state.status.get()
    }

    fn set_status(&self, status: TransportStatus) {
        self.state.status.set(status);
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: TransportStatus,
    pub protocol: String,
    pub stats: TransportStats,
    pub endpoints: usize,
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_command(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            state.dispatcher.record_error("serialization");
            warn!(transport = HTTP_PROTOCOL, error = %e, "Rejected malformed command");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    state.dispatcher.dispatch(&envelope).await;
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn handle_health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: state.status.get(),
        protocol: HTTP_PROTOCOL.to_string(),
        stats: state.dispatcher.stats(),
        endpoints: state.endpoints.len(),
    })
}

async fn handle_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{handler_fn, Parameters};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn counting(transport: &HttpTransport, command: &str) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        transport.register_command_handler(
            command,
            handler_fn(move |_params| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        counter
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_command_endpoint_dispatches() {
        let transport = HttpTransport::new(DEFAULT_HOST, 0);
        let counter = counting(&transport, "ping");
        let env = Envelope::new("agent-a", "agent-b", "ping", Parameters::new());

        let response = transport
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp/command")
                    .header("Content-Type", "application/json")
                    .body(Body::from(env.to_json().unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().commands_received, 1);
    }

    #[tokio::test]
    async fn test_command_endpoint_rejects_malformed_body() {
        let transport = HttpTransport::new(DEFAULT_HOST, 0);

        let response = transport
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp/command")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let transport = HttpTransport::new(DEFAULT_HOST, 0);
        transport.set_status(TransportStatus::Active);
        transport.register_endpoint("agent-b", "http://10.0.0.2:8766");

        let response = transport
            .router()
            .oneshot(
                Request::builder()
                    .uri("/mcp/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "active");
        assert_eq!(body["protocol"], "mcp_http");
        assert_eq!(body["stats"]["commands_sent"], 0);
        assert_eq!(body["endpoints"], 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let transport = HttpTransport::new(DEFAULT_HOST, 0);
        metrics::record_retry();

        let response = transport
            .router()
            .oneshot(
                Request::builder()
                    .uri("/mcp/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_send_without_endpoint_fails() {
        let transport = HttpTransport::new(DEFAULT_HOST, 0);
        assert!(transport.initialize().await);

        let env = Envelope::new("agent-a", "unknown-agent", "ping", Parameters::new());
        assert!(!transport.send(&env).await);
        assert_eq!(transport.stats().commands_sent, 0);
        assert_eq!(transport.stats().errors, 0);

        transport.stop_listening().await;
    }

    #[tokio::test]
    async fn test_loopback_send() {
        let sender = HttpTransport::new(DEFAULT_HOST, 0);
        let receiver = HttpTransport::new(DEFAULT_HOST, 0);
        assert!(sender.initialize().await);
        assert!(receiver.initialize().await);

        let counter = counting(&receiver, "ping");
        let base_url = receiver.base_url().await.unwrap();
        sender.register_endpoint("agent-b", base_url);

        let env = Envelope::new("agent-a", "agent-b", "ping", Parameters::new());
        assert!(sender.send(&env).await);

        // The server dispatches before answering
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(sender.stats().commands_sent, 1);
        assert_eq!(receiver.stats().commands_received, 1);

        sender.stop_listening().await;
        receiver.stop_listening().await;
    }

    #[tokio::test]
    async fn test_non_200_counts_as_failure() {
        let sender = HttpTransport::new(DEFAULT_HOST, 0);
        let receiver = HttpTransport::new(DEFAULT_HOST, 0);
        assert!(sender.initialize().await);
        assert!(receiver.initialize().await);

        let base_url = receiver.base_url().await.unwrap();
        sender.register_endpoint("agent-b", format!("{}/missing", base_url));

        let env = Envelope::new("agent-a", "agent-b", "ping", Parameters::new());
        assert!(!sender.send(&env).await);
        assert_eq!(sender.stats().errors, 1);

        sender.stop_listening().await;
        receiver.stop_listening().await;
    }

    #[tokio::test]
    async fn test_endpoint_table_shared() {
        let table = EndpointTable::new();
        let transport = HttpTransport::new(DEFAULT_HOST, 0).with_endpoints(table.clone());

        table.register("agent-b", "http://10.0.0.2:8766");
        assert_eq!(
            transport.endpoints().get("agent-b").as_deref(),
            Some("http://10.0.0.2:8766")
        );

        assert!(transport.remove_endpoint("agent-b").is_some());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_idempotent_and_stop_twice() {
        let transport = HttpTransport::new(DEFAULT_HOST, 0);
        assert!(transport.initialize().await);
        let addr = transport.local_addr().await;
        assert!(transport.initialize().await);
        assert_eq!(transport.local_addr().await, addr);
        assert!(transport.health_check().await);

        transport.stop_listening().await;
        transport.stop_listening().await;
        assert!(!transport.health_check().await);
        assert!(transport.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_sets_failed() {
        let first = HttpTransport::new(DEFAULT_HOST, 0);
        assert!(first.initialize().await);
        let port = first.local_addr().await.unwrap().port();

        let second = HttpTransport::new(DEFAULT_HOST, port);
        assert!(!second.initialize().await);
        assert_eq!(second.status(), TransportStatus::Failed);

        first.stop_listening().await;
    }
}
