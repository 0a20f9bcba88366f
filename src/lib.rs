//! IoT Hub device transport
//!
//! Device-side connection engine for an IoT Hub: queued telemetry with per-message
//! completion, twin and direct-method correlation, cloud-to-device delivery, reconnect
//! with retry policies and SAS token renewal.
//!
//! # Overview
//!
//! - [`DeviceIo`] owns one connection. A Send task drains the outbound queue into the
//!   protocol binding and a Receive task polls for inbound messages, acknowledgements and
//!   connection loss.
//! - [`MultiplexingClient`] shares one AMQP connection between many device identities.
//! - [`transport`] holds the protocol bindings (MQTT, AMQP, HTTPS) behind the
//!   [`ProtocolBinding`] trait.
//!
//! # Quick Start
//!
//! ```no_run
//! use iothub_device::{ClientOptions, Credential, DeviceIdentity, DeviceIo, Message, Protocol};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = DeviceIdentity::new("myhub.azure-devices.net", "thermostat-1");
//! let credential = Credential::SymmetricKey("c2VjcmV0LWtleQ==".to_string());
//!
//! let io = DeviceIo::connect(Protocol::Mqtt, identity, credential, ClientOptions::default())?;
//! io.open(true).await?;
//!
//! let status = io.send_async(Message::new(r#"{"temperature":21.5}"#))?.await;
//! println!("telemetry completed with {status}");
//!
//! io.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod device_io;
pub mod engine;
pub mod error;
pub mod message;
pub mod multiplexing;
pub mod observability;
pub mod retry;
pub mod status;
pub mod testing;
pub mod transport;

pub use auth::{Credential, DeviceIdentity, SasTokenProvider, TokenSigner};
pub use config::{ClientConfig, ConfigError};
pub use device_io::{ClientOptions, DeviceIo};
pub use engine::{ConnectionStatusCallback, ConnectionStatusChange, SendTicket};
pub use error::{
    DeviceError, DeviceResult, MessageError, MultiplexingError, TransportError, TransportResult,
};
pub use message::{DeviceOperation, Message, MessageKind};
pub use multiplexing::{ConnectionRegistry, DeviceClientConfig, MultiplexingClient};
pub use retry::{ExponentialBackoffWithJitter, NoRetry, RetryDecision, RetryPolicy};
pub use status::{ConnectionStatus, ConnectionStatusReason, IotHubStatusCode};
pub use transport::{Protocol, ProtocolBinding, Subscription};
