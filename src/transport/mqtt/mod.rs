//! MQTT binding for IoT Hub
//!
//! Pure functions are kept apart from I/O so the mapping can be tested without a broker:
//!
//! - [`topics`] - topic construction and parsing
//! - [`connection`] - connect credentials and rumqttc options
//! - [`message_handler`] - routing of rumqttc events
//! - [`binding`] - the `ProtocolBinding` implementation over any [`MqttLink`]
//! - [`client`] - the rumqttc-backed [`MqttLink`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_device::auth::DeviceIdentity;
//! use iothub_device::transport::mqtt::{MqttBinding, RumqttcLink};
//! use iothub_device::transport::{Protocol, ProtocolBinding, SessionCredentials};
//!
//! # tokio_test::block_on(async {
//! let mut binding = MqttBinding::new(RumqttcLink::new(), "hub.azure-devices.net", Protocol::Mqtt);
//! let session = SessionCredentials::new(
//!     DeviceIdentity::new("hub.azure-devices.net", "dev1"),
//!     Some("SharedAccessSignature sr=...".to_string()),
//! );
//! binding.open(&[session]).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod binding;
pub mod client;
pub mod connection;
pub mod message_handler;
pub mod topics;

pub use binding::MqttBinding;
pub use client::RumqttcLink;
pub use connection::{configure_mqtt_options, LinkState, MqttConnectSettings, API_VERSION};
pub use message_handler::{EventRoute, MessageHandler};
pub use topics::{InboundTopic, TopicBuilder};

use crate::error::TransportResult;
use crate::transport::DeliveryTag;
use bytes::Bytes;

/// Network capability the MQTT binding needs from a client library
///
/// Publishes and subscriptions use QoS 1. A publish resolves to a tag that shows up in
/// `drain_acks` once the broker has acknowledged it.
#[async_trait::async_trait]
pub trait MqttLink: Send {
    async fn connect(&mut self, settings: &MqttConnectSettings) -> TransportResult<()>;

    async fn disconnect(&mut self) -> TransportResult<()>;

    async fn publish(&mut self, topic: &str, payload: Bytes) -> TransportResult<DeliveryTag>;

    async fn subscribe(&mut self, topic: &str) -> TransportResult<()>;

    /// Next received publish as `(topic, payload)`
    fn poll_inbound(&mut self) -> Option<(String, Bytes)>;

    fn drain_acks(&mut self) -> Vec<DeliveryTag>;

    fn take_connection_loss(&mut self) -> Option<crate::error::TransportError>;
}
