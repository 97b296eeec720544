//! Configuration validation
//!
//! Validates fallback configuration for correctness:
//! - Participant id is set
//! - Intervals are non-zero (port 0 binds an ephemeral port)
//! - Endpoint URLs are HTTP(S)
//! - At least one protocol is enabled

use super::fallback_config::FallbackConfig;
use crate::FallbackError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub context: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ctx) = self.context {
            write!(f, "[{}] {}: {}", ctx, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a fallback configuration
pub fn validate_config(config: &FallbackConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.participant_id.trim().is_empty() {
        errors.push(ValidationError::new(
            "participant_id",
            "Participant id cannot be empty",
        ));
    }

    if config.health_check_interval_secs == 0 {
        errors.push(ValidationError::new(
            "health_check_interval_secs",
            "Health check interval must be greater than zero",
        ));
    }

    let protocols = &config.protocols;
    if !protocols.memory.enabled && !protocols.file.enabled && !protocols.http.enabled {
        errors.push(ValidationError::new(
            "protocols",
            "At least one protocol must be enabled",
        ));
    }

    if protocols.file.enabled {
        if protocols.file.base_path.as_os_str().is_empty() {
            errors.push(
                ValidationError::new("base_path", "Base path cannot be empty")
                    .with_context("file"),
            );
        }
        if protocols.file.poll_interval_ms == 0 {
            errors.push(
                ValidationError::new("poll_interval_ms", "Poll interval must be greater than zero")
                    .with_context("file"),
            );
        }
    }

    if protocols.http.enabled {
        if protocols.http.host.trim().is_empty() {
            errors.push(ValidationError::new("host", "Host cannot be empty").with_context("http"));
        }
    }

    // Endpoints are checked even when HTTP is disabled so a later enable is safe
    let mut recipients: Vec<&String> = protocols.http.endpoints.keys().collect();
    recipients.sort();
    for recipient in recipients {
        let url = &protocols.http.endpoints[recipient];
        if !is_valid_endpoint_url(url) {
            errors.push(
                ValidationError::new(
                    format!("endpoints.{}", recipient),
                    format!("Invalid endpoint URL: {}", url),
                )
                .with_context("http"),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check if an endpoint URL is an HTTP(S) base URL
fn is_valid_endpoint_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));

    matches!(rest, Some(host) if !host.is_empty())
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &FallbackConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        FallbackError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = FallbackConfig::new();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_participant_id() {
        let mut config = FallbackConfig::new();
        config.participant_id = "  ".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "participant_id");
    }

    #[test]
    fn test_zero_intervals() {
        let mut config = FallbackConfig::new();
        config.health_check_interval_secs = 0;
        config.protocols.file.poll_interval_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["health_check_interval_secs", "poll_interval_ms"]);
    }

    #[test]
    fn test_ephemeral_port_is_valid() {
        let mut config = FallbackConfig::new();
        config.protocols.http.port = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_disabled_protocol_not_checked() {
        let mut config = FallbackConfig::new();
        config.protocols.http.enabled = false;
        config.protocols.http.host = String::new();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_base_path() {
        let mut config = FallbackConfig::new();
        config.protocols.file.base_path = std::path::PathBuf::new();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].context.as_deref(), Some("file"));
        assert_eq!(errors[0].field, "base_path");
    }

    #[test]
    fn test_invalid_endpoint_url() {
        let mut config = FallbackConfig::new();
        config
            .protocols
            .http
            .endpoints
            .insert("agent-b".to_string(), "ftp://10.0.0.2".to_string());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "[http] endpoints.agent-b: Invalid endpoint URL: ftp://10.0.0.2");
    }

    #[test]
    fn test_valid_endpoint_urls() {
        assert!(is_valid_endpoint_url("http://10.0.0.2:8766"));
        assert!(is_valid_endpoint_url("https://agents.example.com"));
        assert!(!is_valid_endpoint_url("http://"));
        assert!(!is_valid_endpoint_url("10.0.0.2:8766"));
    }

    #[test]
    fn test_no_protocols_enabled() {
        let mut config = FallbackConfig::new();
        config.protocols.memory.enabled = false;
        config.protocols.file.enabled = false;
        config.protocols.http.enabled = false;

        let result = validate_config_result(&config);
        assert!(matches!(result, Err(FallbackError::Config(_))));
    }
}
