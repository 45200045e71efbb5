//! Error types for chat-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persisted seen-state errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State file {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Failed to write state file {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a channel enumerator.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel list unavailable: {reason}")]
    ListUnavailable { reason: String },

    #[error("Channel {key} unavailable: {reason}")]
    Unavailable { key: String, reason: String },

    #[error("Invalid channel payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised by a delivery sink. Never fatal to a cycle.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Sink {sink} rejected {method}: {description}")]
    Rejected {
        sink: String,
        method: String,
        description: String,
    },

    #[error("Sink {sink} rate limited, retry after {retry_after:?}")]
    RateLimited {
        sink: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error talking to {sink}: {reason}")]
    Network { sink: String, reason: String },

    #[error("Invalid delivery unit: {0}")]
    InvalidUnit(String),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Channel fetch failed: {0}")]
    ChannelFetch(#[from] ChannelError),

    #[error("Delivery failed after {sent} of {total} units: {source}")]
    PartialDelivery {
        sent: usize,
        total: usize,
        #[source]
        source: DeliveryError,
    },

    #[error("State persistence failed: {0}")]
    Persist(#[from] StoreError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn subsystem_errors_convert_to_top_level() {
        let err: Error = ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()).into();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required environment variable: TELEGRAM_BOT_TOKEN"
        );

        let err: Error = PipelineError::from(ChannelError::ListUnavailable {
            reason: "503".into(),
        })
        .into();
        assert!(matches!(err, Error::Pipeline(PipelineError::ChannelFetch(_))));
    }

    #[test]
    fn partial_delivery_keeps_sink_error_as_source() {
        let err = PipelineError::PartialDelivery {
            sent: 1,
            total: 3,
            source: DeliveryError::InvalidUnit("empty text unit".into()),
        };
        assert!(err.to_string().starts_with("Delivery failed after 1 of 3 units"));
        let source = err.source().unwrap();
        assert!(source.to_string().contains("empty text unit"));
    }
}
