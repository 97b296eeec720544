//! Fallback messaging protocol
//!
//! Delivers command envelopes between agents over whichever transport is
//! currently healthy, in priority order:
//!
//! - `mcp_http` - HTTP server/client, across machines
//! - `mcp_file` - shared inbox/outbox directories, across processes
//! - `mcp_memory` - in-process queue, last resort
//!
//! ```text
//! caller -> FallbackManager -> active Transport --send--> peer
//!                                    |
//!         inbound envelope ----> CommandDispatcher -> handlers
//! ```

mod dispatch;
mod envelope;
mod filesystem;
mod http;
mod manager;
mod memory;
mod retry;
mod transport;

pub use dispatch::{
    handler_fn, CommandDispatcher, CommandHandler, DispatchOutcome, DEFAULT_HANDLER_TIMEOUT,
};
pub use envelope::{Envelope, EnvelopeId, MessagePriority, Parameters, DEFAULT_MAX_RETRIES};
pub use filesystem::{
    FilesystemTransport, DEFAULT_BASE_PATH, DEFAULT_POLL_INTERVAL, DEFAULT_QUARANTINE_AFTER,
    FILE_PROTOCOL,
};
pub use http::{
    EndpointTable, ErrorResponse, HealthResponse, HttpTransport, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_REQUEST_TIMEOUT, HTTP_PROTOCOL,
};
pub use manager::{FallbackManager, FallbackStatus, TransportReport, DEFAULT_HEALTH_CHECK_INTERVAL};
pub use memory::{InMemoryTransport, MEMORY_PROTOCOL};
pub use retry::{RetryPolicy, DEFAULT_BACKOFF};
pub use transport::{TransportError, Transport, TransportStats, TransportStatus};
