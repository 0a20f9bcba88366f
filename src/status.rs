//! Status codes surfaced to message callbacks and connection status values
//!
//! `IotHubStatusCode` is what every completed operation reports. `ConnectionStatus` and
//! `ConnectionStatusReason` are what the connection-status callback receives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a single enqueued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IotHubStatusCode {
    Ok,
    BadFormat,
    Unauthorized,
    QuotaExceeded,
    NotFound,
    PreconditionFailed,
    RequestEntityTooLarge,
    Throttled,
    InternalServerError,
    ServerBusy,
    Error,
    MessageExpired,
    MessageCancelledOnClose,
    IoError,
    DeviceOperationTimedOut,
}

impl IotHubStatusCode {
    /// Map an HTTP-style service status (also used in MQTT/AMQP response topics)
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200..=299 => IotHubStatusCode::Ok,
            400 => IotHubStatusCode::BadFormat,
            401 => IotHubStatusCode::Unauthorized,
            403 => IotHubStatusCode::QuotaExceeded,
            404 => IotHubStatusCode::NotFound,
            412 => IotHubStatusCode::PreconditionFailed,
            413 => IotHubStatusCode::RequestEntityTooLarge,
            429 => IotHubStatusCode::Throttled,
            500 => IotHubStatusCode::InternalServerError,
            503 => IotHubStatusCode::ServerBusy,
            _ => IotHubStatusCode::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, IotHubStatusCode::Ok)
    }

    /// Whether a failure with this status may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IotHubStatusCode::Throttled
                | IotHubStatusCode::InternalServerError
                | IotHubStatusCode::ServerBusy
                | IotHubStatusCode::Error
                | IotHubStatusCode::IoError
                | IotHubStatusCode::DeviceOperationTimedOut
        )
    }
}

impl fmt::Display for IotHubStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IotHubStatusCode::Ok => "OK",
            IotHubStatusCode::BadFormat => "BAD_FORMAT",
            IotHubStatusCode::Unauthorized => "UNAUTHORIZED",
            IotHubStatusCode::QuotaExceeded => "QUOTA_EXCEEDED",
            IotHubStatusCode::NotFound => "NOT_FOUND",
            IotHubStatusCode::PreconditionFailed => "PRECONDITION_FAILED",
            IotHubStatusCode::RequestEntityTooLarge => "REQUEST_ENTITY_TOO_LARGE",
            IotHubStatusCode::Throttled => "THROTTLED",
            IotHubStatusCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            IotHubStatusCode::ServerBusy => "SERVER_BUSY",
            IotHubStatusCode::Error => "ERROR",
            IotHubStatusCode::MessageExpired => "MESSAGE_EXPIRED",
            IotHubStatusCode::MessageCancelledOnClose => "MESSAGE_CANCELLED_ONCLOSE",
            IotHubStatusCode::IoError => "IO_ERROR",
            IotHubStatusCode::DeviceOperationTimedOut => "DEVICE_OPERATION_TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// Logical connection status owned by the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    DisconnectedRetrying,
    Disconnected,
}

/// Why the connection status last changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatusReason {
    ExpiredSasToken,
    BadCredential,
    RetryExpired,
    NoNetwork,
    CommunicationError,
    ConnectionOk,
}
