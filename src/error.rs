//! Error types for the device transport engine
//!
//! Binding-level failures are `TransportError`; every variant classifies itself so the queue
//! engine can pick a per-message status and the connection state machine can pick a status
//! change reason. `DeviceError` is what the public facade surfaces.

use crate::status::{ConnectionStatusReason, IotHubStatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a protocol binding or one of its links
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    Connection { message: String, retryable: bool },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Service returned {status}: {message}")]
    Service {
        status: IotHubStatusCode,
        message: String,
    },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Security error: {0}")]
    Security(String),

    /// A token that cannot be renewed automatically is past its expiry
    #[error("SAS token expired: {0}")]
    TokenExpired(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transport is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    /// Create a connection error that the state machine may retry
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a connection error that must not be retried
    pub fn fatal_connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn service<S: Into<String>>(status: IotHubStatusCode, message: S) -> Self {
        Self::Service {
            status,
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported(message.into())
    }

    /// Whether another attempt of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::ConnectionLost(_)
            | TransportError::Unauthorized(_)
            | TransportError::Timeout(_)
            | TransportError::Io(_) => true,
            TransportError::Service { status, .. } => status.is_retryable(),
            TransportError::Protocol(_)
            | TransportError::Unsupported(_)
            | TransportError::Security(_)
            | TransportError::TokenExpired(_)
            | TransportError::Closed
            | TransportError::Serialization(_) => false,
        }
    }

    /// Status delivered to the callback of a message whose send failed with this error
    pub fn status_code(&self) -> IotHubStatusCode {
        match self {
            TransportError::Connection { .. }
            | TransportError::ConnectionLost(_)
            | TransportError::Io(_) => IotHubStatusCode::IoError,
            TransportError::Unauthorized(_)
            | TransportError::Security(_)
            | TransportError::TokenExpired(_) => IotHubStatusCode::Unauthorized,
            TransportError::Service { status, .. } => *status,
            TransportError::Protocol(_)
            | TransportError::Unsupported(_)
            | TransportError::Serialization(_) => IotHubStatusCode::BadFormat,
            TransportError::Timeout(_) => IotHubStatusCode::DeviceOperationTimedOut,
            TransportError::Closed => IotHubStatusCode::MessageCancelledOnClose,
        }
    }

    /// Status the retry policy judges a failed connection attempt by
    ///
    /// A rejected token is retried like a generic failure; the next attempt signs a fresh one.
    pub fn open_retry_status(&self) -> IotHubStatusCode {
        match self {
            TransportError::Unauthorized(_) => IotHubStatusCode::Error,
            other => other.status_code(),
        }
    }

    /// Reason reported to the connection status callback when this error drops the connection
    pub fn connection_reason(&self) -> ConnectionStatusReason {
        match self {
            TransportError::TokenExpired(_) => ConnectionStatusReason::ExpiredSasToken,
            TransportError::Unauthorized(_) | TransportError::Security(_) => {
                ConnectionStatusReason::BadCredential
            }
            TransportError::Protocol(_)
            | TransportError::Serialization(_)
            | TransportError::Unsupported(_)
            | TransportError::Closed => ConnectionStatusReason::CommunicationError,
            other if other.is_retryable() => ConnectionStatusReason::NoNetwork,
            _ => ConnectionStatusReason::CommunicationError,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// Rejected message construction or property mutation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Property name is empty or not 7-bit ASCII: {0:?}")]
    InvalidPropertyName(String),

    #[error("Property value for {name:?} is not 7-bit ASCII")]
    InvalidPropertyValue { name: String },

    #[error("Property name {0:?} is reserved")]
    ReservedPropertyName(String),
}

/// Registration failures of the multiplexing layer
#[derive(Debug, Error)]
pub enum MultiplexingError {
    #[error("Multiplexing is only supported over AMQPS and AMQPS_WS, not {0}")]
    UnsupportedProtocol(String),

    #[error("Device {device_id} uses {actual}, multiplexed connection uses {expected}")]
    ProtocolMismatch {
        device_id: String,
        expected: String,
        actual: String,
    },

    #[error("Device {device_id} must authenticate with a symmetric key SAS token")]
    UnsupportedAuthentication { device_id: String },

    #[error("Device {device_id} targets host {actual}, multiplexed connection targets {expected}")]
    HostnameMismatch {
        device_id: String,
        expected: String,
        actual: String,
    },

    #[error("Multiplexed {protocol} connection cannot exceed {max} devices")]
    DeviceLimitExceeded { protocol: String, max: usize },

    #[error("Device {device_id} is already open on its own connection")]
    AlreadyOpen { device_id: String },

    #[error("Device {device_id} is not registered on this connection")]
    NotRegistered { device_id: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Error surfaced by the device facade (`DeviceIo`, `MultiplexingClient`)
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("Multiplexing error: {0}")]
    Multiplexing(#[from] MultiplexingError),

    #[error("Device client is closed")]
    Closed,

    #[error("Retry policy gave up after {attempts} attempts: {source}")]
    RetryExpired {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Operation timed out after {elapsed:?}: {source}")]
    OperationTimeout {
        elapsed: Duration,
        #[source]
        source: TransportError,
    },

    #[error("Security error: {0}")]
    Security(String),
}

impl DeviceError {
    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::Security(message.into())
    }

    /// Whether the error ended the connection for good
    pub fn is_fatal_for_connection(&self) -> bool {
        match self {
            DeviceError::RetryExpired { .. }
            | DeviceError::OperationTimeout { .. }
            | DeviceError::Security(_) => true,
            DeviceError::Transport(e) => !e.is_retryable(),
            _ => false,
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(sharedaccesskey|sig|password|token|secret|key)\s*[=:]\s*[^&;\s]+").ok()
});

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Redact SAS signatures and keys, then cap the length for logs and status callbacks
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = match SECRET_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(message, "${1}=***").to_string(),
        None => message.to_string(),
    };

    if sanitized.len() > MAX_LOGGED_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for binding operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for facade operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::connection("refused").is_retryable());
        assert!(!TransportError::fatal_connection("bad host").is_retryable());
        assert!(TransportError::ConnectionLost("reset".into()).is_retryable());
        assert!(!TransportError::protocol("no rid").is_retryable());
        assert!(!TransportError::Closed.is_retryable());
        assert!(
            TransportError::service(IotHubStatusCode::Throttled, "slow down").is_retryable()
        );
        assert!(!TransportError::service(IotHubStatusCode::NotFound, "gone").is_retryable());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            TransportError::Io("broken pipe".into()).status_code(),
            IotHubStatusCode::IoError
        );
        assert_eq!(
            TransportError::Closed.status_code(),
            IotHubStatusCode::MessageCancelledOnClose
        );
        assert_eq!(
            TransportError::service(IotHubStatusCode::ServerBusy, "busy").status_code(),
            IotHubStatusCode::ServerBusy
        );
        assert_eq!(
            TransportError::Timeout("ack".into()).status_code(),
            IotHubStatusCode::DeviceOperationTimedOut
        );
    }

    #[test]
    fn test_rejected_token_is_retried_on_open_but_final_for_a_message() {
        let error = TransportError::Unauthorized("401".into());

        assert!(error.open_retry_status().is_retryable());
        assert!(!error.status_code().is_retryable());
        assert_eq!(
            TransportError::Security("bad key".into()).open_retry_status(),
            IotHubStatusCode::Unauthorized
        );
    }

    #[test]
    fn test_connection_reason_mapping() {
        assert_eq!(
            TransportError::connection("dns").connection_reason(),
            ConnectionStatusReason::NoNetwork
        );
        assert_eq!(
            TransportError::Unauthorized("401".into()).connection_reason(),
            ConnectionStatusReason::BadCredential
        );
        assert_eq!(
            TransportError::protocol("bad topic").connection_reason(),
            ConnectionStatusReason::CommunicationError
        );
        assert_eq!(
            TransportError::fatal_connection("tls").connection_reason(),
            ConnectionStatusReason::CommunicationError
        );
        assert_eq!(
            TransportError::TokenExpired("dev1".into()).connection_reason(),
            ConnectionStatusReason::ExpiredSasToken
        );
    }

    #[test]
    fn test_sanitize_redacts_sas_signature() {
        let message = "open failed with SharedAccessSignature sr=hub%2Fdevices%2Fd1&sig=AbC%2B123%3D&se=1700000000";
        let sanitized = sanitize_error_message(message);

        assert!(!sanitized.contains("AbC%2B123"));
        assert!(sanitized.contains("sig=***"));
        assert!(sanitized.contains("se=1700000000"));
    }

    #[test]
    fn test_sanitize_redacts_shared_access_key() {
        let message = "HostName=hub;DeviceId=d1;SharedAccessKey=c2VjcmV0a2V5";
        let sanitized = sanitize_error_message(message);

        assert!(!sanitized.contains("c2VjcmV0a2V5"));
        assert!(sanitized.contains("SharedAccessKey=***"));
        assert!(sanitized.contains("DeviceId=d1"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let message = "x".repeat(500);
        let sanitized = sanitize_error_message(&message);
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }

    #[test]
    fn test_device_error_fatality() {
        let expired = DeviceError::RetryExpired {
            attempts: 3,
            source: TransportError::connection("refused"),
        };
        assert!(expired.is_fatal_for_connection());
        assert!(!DeviceError::Transport(TransportError::connection("refused"))
            .is_fatal_for_connection());
        assert!(expired.to_string().contains("3 attempts"));
    }
}
