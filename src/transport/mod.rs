//! Protocol bindings between the transport engine and the hub
//!
//! A binding turns `Message`s into protocol frames and back. The engine never sees topics,
//! links or HTTP requests; it sees `SendOutcome`s, acknowledgements and inbound messages.

use crate::auth::{DeviceIdentity, RenewalMode};
use crate::error::{TransportError, TransportResult};
use crate::message::Message;
use crate::status::IotHubStatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod amqp;
pub mod correlation;
pub mod https;
pub mod mqtt;

pub use correlation::{CorrelationTable, PendingKind, PendingOperation};

/// Wire protocol a logical client connects with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Mqtt,
    MqttWs,
    Amqps,
    AmqpsWs,
    Https,
}

impl Protocol {
    pub fn is_amqp(&self) -> bool {
        matches!(self, Protocol::Amqps | Protocol::AmqpsWs)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::MqttWs | Protocol::AmqpsWs)
    }

    /// AMQP renews tokens on the live connection; everything else reconnects
    pub fn renewal_mode(&self) -> RenewalMode {
        if self.is_amqp() {
            RenewalMode::Proactive
        } else {
            RenewalMode::Reactive
        }
    }

    /// Inclusive ceiling of device identities sharing one connection
    pub fn max_multiplexed_devices(&self) -> Option<usize> {
        match self {
            Protocol::Amqps => Some(1000),
            Protocol::AmqpsWs => Some(500),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Mqtt => "MQTT",
            Protocol::MqttWs => "MQTT_WS",
            Protocol::Amqps => "AMQPS",
            Protocol::AmqpsWs => "AMQPS_WS",
            Protocol::Https => "HTTPS",
        };
        f.write_str(name)
    }
}

/// Opaque handle for a send that completes when the hub acknowledges it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of handing one message to a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The exchange finished synchronously (HTTPS)
    Completed(IotHubStatusCode),
    /// Completion arrives later through `drain_acknowledgements`
    AwaitingAck(DeliveryTag),
}

/// Identity plus the token to present for one device session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub identity: DeviceIdentity,
    pub sas_token: Option<String>,
}

impl SessionCredentials {
    pub fn new(identity: DeviceIdentity, sas_token: Option<String>) -> Self {
        Self {
            identity,
            sas_token,
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("identity", &self.identity)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Inbound traffic a client can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Cloud-to-device messages, or module inputs for module identities
    CloudToDevice,
    /// Desired property notifications and twin responses
    DesiredProperties,
    Methods,
}

/// One protocol mapping
///
/// All methods are called with the binding locked by the caller, so implementations need no
/// internal synchronization for their own state.
#[async_trait::async_trait]
pub trait ProtocolBinding: Send {
    fn protocol(&self) -> Protocol;

    /// Open the connection and one session per identity
    async fn open(&mut self, sessions: &[SessionCredentials]) -> TransportResult<()>;

    /// Close everything; closing a closed binding succeeds
    async fn close(&mut self) -> TransportResult<()>;

    async fn send(&mut self, message: &Message) -> TransportResult<SendOutcome>;

    /// Send several messages as one request with a single shared outcome
    async fn send_batch(&mut self, _messages: &[Message]) -> TransportResult<IotHubStatusCode> {
        Err(TransportError::unsupported(format!(
            "{} does not support batch sends",
            self.protocol()
        )))
    }

    /// Non-blocking poll for the next inbound message
    async fn receive(&mut self) -> TransportResult<Option<Message>>;

    async fn subscribe(&mut self, subscription: Subscription) -> TransportResult<()>;

    /// Completions for sends that returned `SendOutcome::AwaitingAck`
    fn drain_acknowledgements(&mut self) -> Vec<(DeliveryTag, IotHubStatusCode)> {
        Vec::new()
    }

    /// Error that dropped the connection since the last call, if any
    fn take_connection_loss(&mut self) -> Option<TransportError> {
        None
    }

    fn is_open(&self) -> bool;

    /// Forget request/response correlations older than `max_age`; returns how many were dropped
    fn prune_pending(&mut self, _max_age: std::time::Duration) -> usize {
        0
    }

    async fn renew_token(&mut self, _session: &SessionCredentials) -> TransportResult<()> {
        Err(TransportError::unsupported(format!(
            "{} renews tokens by reconnecting",
            self.protocol()
        )))
    }

    /// Attach one more device session to an open multiplexed connection
    async fn open_session(&mut self, _session: &SessionCredentials) -> TransportResult<()> {
        Err(TransportError::unsupported(format!(
            "{} does not support multiplexing",
            self.protocol()
        )))
    }

    async fn close_session(&mut self, _session_key: &str) -> TransportResult<()> {
        Err(TransportError::unsupported(format!(
            "{} does not support multiplexing",
            self.protocol()
        )))
    }
}

/// MQTT binding over the rumqttc link
pub type DefaultMqttBinding = mqtt::MqttBinding<mqtt::RumqttcLink>;

/// HTTPS binding over the reqwest link
pub type DefaultHttpsBinding = https::HttpsBinding<https::ReqwestHttpsLink>;

/// Binding backed by the bundled network stack for `protocol`
///
/// AMQP needs an externally supplied `AmqpLink`; use `AmqpBinding::new` for it.
pub fn default_binding(
    protocol: Protocol,
    hostname: &str,
) -> TransportResult<Box<dyn ProtocolBinding>> {
    match protocol {
        Protocol::Mqtt | Protocol::MqttWs => Ok(Box::new(mqtt::MqttBinding::new(
            mqtt::RumqttcLink::new(),
            hostname,
            protocol,
        ))),
        Protocol::Https => Ok(Box::new(https::HttpsBinding::new(
            https::ReqwestHttpsLink::new(hostname)?,
        ))),
        Protocol::Amqps | Protocol::AmqpsWs => Err(TransportError::unsupported(format!(
            "{protocol} requires an AMQP link implementation"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_properties() {
        assert!(Protocol::Amqps.is_amqp());
        assert!(Protocol::AmqpsWs.is_websocket());
        assert!(!Protocol::Mqtt.is_websocket());
        assert_eq!(Protocol::Amqps.renewal_mode(), RenewalMode::Proactive);
        assert_eq!(Protocol::Mqtt.renewal_mode(), RenewalMode::Reactive);
        assert_eq!(Protocol::Amqps.max_multiplexed_devices(), Some(1000));
        assert_eq!(Protocol::AmqpsWs.max_multiplexed_devices(), Some(500));
        assert_eq!(Protocol::Https.max_multiplexed_devices(), None);
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::AmqpsWs.to_string(), "AMQPS_WS");
        let parsed: Protocol = serde_json::from_str("\"mqtt_ws\"").unwrap();
        assert_eq!(parsed, Protocol::MqttWs);
    }

    #[test]
    fn test_session_credentials_debug_masks_token() {
        let session = SessionCredentials::new(
            DeviceIdentity::new("hub", "dev"),
            Some("SharedAccessSignature sig=secret".to_string()),
        );
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_default_binding_rejects_amqp() {
        assert!(matches!(
            default_binding(Protocol::Amqps, "hub"),
            Err(TransportError::Unsupported(_))
        ));
        let binding = default_binding(Protocol::Mqtt, "hub").unwrap();
        assert_eq!(binding.protocol(), Protocol::Mqtt);
        assert!(!binding.is_open());
    }
}
