//! Envelope message format
//!
//! The unit of transfer carried by every transport. On the wire (HTTP body, mailbox
//! file) an envelope is a flat JSON object:
//!
//! ```text
//! {
//!   "id": "...", "sender_id": "...", "recipient_id": "...", "command_name": "...",
//!   "parameters": {...}, "timestamp": 1712345678.25, "priority": 2,
//!   "correlation_id": null, "retry_count": 0, "max_retries": 3, "ttl": null
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;
use std::time::Duration;

/// Command parameters: an arbitrary JSON object
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Default number of delivery retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique envelope identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Create a fresh random identifier
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Advisory urgency of an envelope
///
/// Priority never changes delivery order within a transport.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl MessagePriority {
    /// Lowercase name used by the CLI and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Critical => "critical",
        }
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "1" => Ok(MessagePriority::Low),
            "normal" | "2" => Ok(MessagePriority::Normal),
            "high" | "3" => Ok(MessagePriority::High),
            "critical" | "4" => Ok(MessagePriority::Critical),
            other => Err(format!("invalid priority: {}", other)),
        }
    }
}

/// A command addressed from one participant to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique identifier, generated by the sender
    pub id: EnvelopeId,

    /// Sending participant
    pub sender_id: String,

    /// Receiving participant
    pub recipient_id: String,

    /// Remote operation to invoke
    pub command_name: String,

    /// Command payload
    #[serde(default)]
    pub parameters: Parameters,

    /// Creation time (unix seconds on the wire)
    #[serde(rename = "timestamp", with = "unix_seconds")]
    pub created_at: DateTime<Utc>,

    /// Advisory priority
    #[serde(default)]
    pub priority: MessagePriority,

    /// Links a response to its originating request
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Delivery attempts made after the first, maintained by the manager
    #[serde(default)]
    pub retry_count: u32,

    /// Upper bound for `retry_count`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum age before the envelope is dropped unprocessed
    #[serde(default, with = "option_duration_seconds")]
    pub ttl: Option<Duration>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Envelope {
    /// Create a new envelope with a fresh id and `created_at = now`
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        command_name: impl Into<String>,
        parameters: Parameters,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            command_name: command_name.into(),
            parameters,
            created_at: Utc::now(),
            priority: MessagePriority::Normal,
            correlation_id: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            ttl: None,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Link this envelope to a request
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set a time-to-live
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the retry bound
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Build a response envelope addressed back to this envelope's sender
    pub fn reply(&self, command_name: impl Into<String>, parameters: Parameters) -> Self {
        Envelope::new(
            self.recipient_id.clone(),
            self.sender_id.clone(),
            command_name,
            parameters,
        )
        .with_priority(self.priority)
        .with_correlation_id(self.id.as_str())
    }

    /// True if a TTL is set and has elapsed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock reading
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => {
                let age = now.signed_duration_since(self.created_at);
                // Negative ages (clock skew) are never expired
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            }
        }
    }

    /// Serialize to the JSON wire format
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse from the JSON wire format
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// Float unix seconds <-> `DateTime<Utc>`
pub(crate) mod unix_seconds {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn to_secs(dt: &DateTime<Utc>) -> f64 {
        dt.timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn from_secs(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
    }

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(to_secs(dt))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        from_secs(secs).ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}

/// Optional float unix seconds <-> `Option<DateTime<Utc>>`
pub(crate) mod option_unix_seconds {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match dt {
            Some(dt) => serializer.serialize_some(&super::unix_seconds::to_secs(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(deserializer)?;
        Ok(opt.and_then(super::unix_seconds::from_secs))
    }
}

/// Optional float seconds <-> `Option<Duration>`
mod option_duration_seconds {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(deserializer)?;
        match opt {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
