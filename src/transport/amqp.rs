//! AMQP binding for IoT Hub
//!
//! One connection carries one session per device identity. Each session has a telemetry
//! sender plus receiver links attached on demand for cloud-to-device messages, methods and
//! twin traffic. Tokens go to the CBS node, so a renewed token replaces the old one without
//! dropping the connection.
//!
//! The AMQP client itself sits behind [`AmqpLink`].

use crate::auth::DeviceIdentity;
use crate::error::{TransportError, TransportResult};
use crate::message::{DeviceOperation, Message};
use crate::status::IotHubStatusCode;
use crate::transport::{
    CorrelationTable, DeliveryTag, PendingKind, Protocol, ProtocolBinding, SendOutcome,
    SessionCredentials, Subscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const METHOD_NAME_PROPERTY: &str = "IoThub-methodname";
pub const METHOD_STATUS_PROPERTY: &str = "IoThub-status";
pub const OPERATION_ANNOTATION: &str = "operation";
pub const RESOURCE_ANNOTATION: &str = "resource";
pub const STATUS_ANNOTATION: &str = "status";
pub const VERSION_ANNOTATION: &str = "version";
pub const INPUT_NAME_ANNOTATION: &str = "x-opt-input-name";
pub const OUTPUT_NAME_ANNOTATION: &str = "x-opt-output-name";

const REPORTED_PROPERTIES_RESOURCE: &str = "/properties/reported";

/// Links attached inside one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmqpLinkKind {
    Telemetry,
    CloudToDevice,
    Methods,
    Twin,
}

/// The parts of an AMQP message the hub mapping uses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpFrame {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub body: Bytes,
    pub application_properties: Vec<(String, String)>,
    pub annotations: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl AmqpFrame {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        lookup(&self.annotations, key)
    }

    pub fn application_property(&self, key: &str) -> Option<&str> {
        lookup(&self.application_properties, key)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// A frame received on one of a session's links
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub session_key: String,
    pub link: AmqpLinkKind,
    pub frame: AmqpFrame,
}

/// Network capability the AMQP binding needs from a client library
#[async_trait]
pub trait AmqpLink: Send {
    async fn connect(&mut self, hostname: &str, websocket: bool) -> TransportResult<()>;

    async fn disconnect(&mut self) -> TransportResult<()>;

    /// Put a token on the CBS node for `audience`
    async fn put_token(&mut self, audience: &str, token: &str) -> TransportResult<()>;

    /// Begin a session for the identity and attach its telemetry sender
    async fn open_session(&mut self, identity: &DeviceIdentity) -> TransportResult<()>;

    async fn close_session(&mut self, session_key: &str) -> TransportResult<()>;

    async fn attach(&mut self, session_key: &str, link: AmqpLinkKind) -> TransportResult<()>;

    async fn send(
        &mut self,
        session_key: &str,
        link: AmqpLinkKind,
        frame: AmqpFrame,
    ) -> TransportResult<DeliveryTag>;

    fn poll_received(&mut self) -> Option<ReceivedFrame>;

    /// Settled outbound deliveries and the outcome the hub gave them
    fn drain_dispositions(&mut self) -> Vec<(DeliveryTag, IotHubStatusCode)>;

    fn take_connection_loss(&mut self) -> Option<TransportError>;
}

pub struct AmqpBinding<L: AmqpLink> {
    link: L,
    hostname: String,
    protocol: Protocol,
    sessions: Vec<SessionCredentials>,
    attached: Vec<AmqpLinkKind>,
    correlation: CorrelationTable,
    connected: bool,
}

impl<L: AmqpLink> AmqpBinding<L> {
    pub fn new(link: L, hostname: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            link,
            hostname: hostname.into(),
            protocol,
            sessions: Vec::new(),
            attached: Vec::new(),
            correlation: CorrelationTable::new(),
            connected: false,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_operations(&self) -> usize {
        self.correlation.len()
    }

    fn session(&self, session_key: &str) -> Option<&SessionCredentials> {
        self.sessions
            .iter()
            .find(|session| session.identity.session_key() == session_key)
    }

    /// Session a message is sent on: its own device/module, or the only session
    fn route(&self, message: &Message) -> TransportResult<String> {
        match message.device_id() {
            Some(device_id) => {
                let key = match message.module_id() {
                    Some(module_id) => format!("{device_id}/{module_id}"),
                    None => device_id.to_string(),
                };
                self.session(&key)
                    .map(|_| key.clone())
                    .ok_or_else(|| TransportError::protocol(format!("No open session for {key}")))
            }
            None => match self.sessions.as_slice() {
                [only] => Ok(only.identity.session_key()),
                _ => Err(TransportError::protocol(
                    "Message needs a device id on a multiplexed connection",
                )),
            },
        }
    }

    async fn start_session(&mut self, session: &SessionCredentials) -> TransportResult<()> {
        if !session.identity.hostname.eq_ignore_ascii_case(&self.hostname) {
            return Err(TransportError::fatal_connection(format!(
                "Session hostname {} does not match connection hostname {}",
                session.identity.hostname, self.hostname
            )));
        }
        if let Some(token) = &session.sas_token {
            self.link
                .put_token(&session.identity.resource_uri(), token)
                .await?;
        }
        self.link.open_session(&session.identity).await?;
        let session_key = session.identity.session_key();
        for link in self.attached.clone() {
            self.link.attach(&session_key, link).await?;
        }
        debug!(session = %session_key, "AMQP session started");
        Ok(())
    }

    async fn ensure_attached(&mut self, link: AmqpLinkKind) -> TransportResult<()> {
        if self.attached.contains(&link) {
            return Ok(());
        }
        let keys: Vec<String> = self
            .sessions
            .iter()
            .map(|session| session.identity.session_key())
            .collect();
        for key in &keys {
            self.link.attach(key, link).await?;
        }
        self.attached.push(link);
        Ok(())
    }

    async fn send_request(
        &mut self,
        session_key: &str,
        request_id: &str,
        kind: PendingKind,
        frame: AmqpFrame,
    ) -> TransportResult<DeliveryTag> {
        self.ensure_attached(AmqpLinkKind::Twin).await?;
        let key = correlation_key(session_key, request_id);
        self.correlation.insert(key.clone(), kind)?;
        match self.link.send(session_key, AmqpLinkKind::Twin, frame).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                self.correlation.take(&key);
                Err(e)
            }
        }
    }

    fn inbound_message(&mut self, received: ReceivedFrame) -> TransportResult<Option<Message>> {
        let Some(identity) = self
            .session(&received.session_key)
            .map(|session| session.identity.clone())
        else {
            warn!(session = %received.session_key, "Dropping frame for a closed session");
            return Ok(None);
        };
        let frame = received.frame;

        let mut message = match received.link {
            AmqpLinkKind::CloudToDevice | AmqpLinkKind::Telemetry => {
                let mut message = Message::inbound(frame.body.clone(), DeviceOperation::Telemetry);
                if let Some(input_name) = frame.annotation(INPUT_NAME_ANNOTATION) {
                    message.set_input_name(input_name);
                }
                for (name, value) in &frame.application_properties {
                    message.set_inbound_property(name.clone(), value.clone());
                }
                apply_system_properties(&mut message, &frame);
                message
            }
            AmqpLinkKind::Methods => {
                let method_name = frame
                    .application_property(METHOD_NAME_PROPERTY)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| TransportError::protocol("Method request has no method name"))?
                    .to_string();
                let request_id = frame
                    .correlation_id
                    .clone()
                    .filter(|rid| !rid.is_empty())
                    .ok_or_else(|| TransportError::protocol("Method request has no request id"))?;
                self.correlation.insert(
                    correlation_key(&received.session_key, &request_id),
                    PendingKind::MethodResponse,
                )?;

                let mut message =
                    Message::inbound(frame.body.clone(), DeviceOperation::MethodReceiveRequest);
                message.set_method_name(method_name);
                message.set_correlation_id(request_id.clone());
                message.set_request_id(request_id);
                message
            }
            AmqpLinkKind::Twin => match frame.correlation_id.clone() {
                None => {
                    let mut message =
                        Message::inbound(frame.body.clone(), DeviceOperation::TwinDesiredPatch);
                    if let Some(version) = parse_version(&frame)? {
                        message.set_version(version);
                    }
                    message
                }
                Some(request_id) => {
                    let key = correlation_key(&received.session_key, &request_id);
                    let Some(pending) = self.correlation.take_twin_response(&key) else {
                        warn!(request_id = %request_id, "Dropping twin response with no pending twin request");
                        return Ok(None);
                    };
                    let operation = if pending.kind == PendingKind::GetTwin {
                        DeviceOperation::TwinGetResponse
                    } else {
                        DeviceOperation::TwinUpdateReportedResponse
                    };
                    let status = frame
                        .annotation(STATUS_ANNOTATION)
                        .ok_or_else(|| TransportError::protocol("Twin response has no status"))?
                        .parse::<u16>()
                        .map_err(|_| TransportError::protocol("Status could not be parsed"))?;

                    let mut message = Message::inbound(frame.body.clone(), operation);
                    message.set_correlation_id(request_id.clone());
                    message.set_request_id(request_id);
                    message.set_status(status);
                    if let Some(version) = parse_version(&frame)? {
                        message.set_version(version);
                    }
                    message
                }
            },
        };

        message = message.with_device_id(identity.device_id.clone());
        if let Some(module_id) = identity.module_id {
            message = message.with_module_id(module_id);
        }
        Ok(Some(message))
    }
}

fn correlation_key(session_key: &str, request_id: &str) -> String {
    format!("{session_key}|{request_id}")
}

fn parse_version(frame: &AmqpFrame) -> TransportResult<Option<u64>> {
    frame
        .annotation(VERSION_ANNOTATION)
        .map(|version| {
            version
                .parse::<u64>()
                .map_err(|_| TransportError::protocol(format!("Twin version is not numeric: {version}")))
        })
        .transpose()
}

fn apply_system_properties(message: &mut Message, frame: &AmqpFrame) {
    if let Some(message_id) = &frame.message_id {
        message.set_message_id(message_id.clone());
    }
    if let Some(correlation_id) = &frame.correlation_id {
        message.set_correlation_id(correlation_id.clone());
    }
    if let Some(content_type) = &frame.content_type {
        message.set_content_type(content_type.clone());
    }
    if let Some(content_encoding) = &frame.content_encoding {
        message.set_content_encoding(content_encoding.clone());
    }
    if let Some(expiry) = frame.expiry {
        message.set_expiry(expiry);
    }
}

/// Frame for an outbound telemetry message
pub fn telemetry_frame(message: &Message) -> AmqpFrame {
    let mut annotations = Vec::new();
    if let Some(output_name) = message.output_name() {
        annotations.push((OUTPUT_NAME_ANNOTATION.to_string(), output_name.to_string()));
    }
    AmqpFrame {
        message_id: Some(message.message_id().to_string()),
        correlation_id: Some(message.correlation_id().to_string()),
        body: message.body().clone(),
        application_properties: message.properties().to_vec(),
        annotations,
        content_type: message.content_type().map(str::to_string),
        content_encoding: message.content_encoding().map(str::to_string),
        expiry: message.expiry(),
    }
}

fn twin_frame(message: &Message, request_id: &str) -> AmqpFrame {
    let mut annotations = Vec::new();
    match message.operation() {
        DeviceOperation::TwinUpdateReportedRequest => {
            annotations.push((OPERATION_ANNOTATION.to_string(), "PATCH".to_string()));
            annotations.push((
                RESOURCE_ANNOTATION.to_string(),
                REPORTED_PROPERTIES_RESOURCE.to_string(),
            ));
            if let Some(version) = message.version() {
                annotations.push((VERSION_ANNOTATION.to_string(), version.to_string()));
            }
        }
        _ => annotations.push((OPERATION_ANNOTATION.to_string(), "GET".to_string())),
    }
    AmqpFrame {
        message_id: Some(message.message_id().to_string()),
        correlation_id: Some(request_id.to_string()),
        body: message.body().clone(),
        annotations,
        ..AmqpFrame::default()
    }
}

#[async_trait]
impl<L: AmqpLink> ProtocolBinding for AmqpBinding<L> {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn open(&mut self, sessions: &[SessionCredentials]) -> TransportResult<()> {
        if sessions.is_empty() {
            return Err(TransportError::fatal_connection(
                "AMQP connection needs at least one device session",
            ));
        }
        if let Some(max) = self.protocol.max_multiplexed_devices() {
            if sessions.len() > max {
                return Err(TransportError::fatal_connection(format!(
                    "{} sessions exceed the {} ceiling of {max}",
                    sessions.len(),
                    self.protocol
                )));
            }
        }

        self.link
            .connect(&self.hostname, self.protocol.is_websocket())
            .await?;
        self.connected = true;
        self.sessions.clear();

        for session in sessions {
            if let Err(e) = self.start_session(session).await {
                self.connected = false;
                let _ = self.link.disconnect().await;
                return Err(e);
            }
            self.sessions.push(session.clone());
        }

        info!(
            host = %self.hostname,
            protocol = %self.protocol,
            sessions = self.sessions.len(),
            "AMQP binding open"
        );
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.sessions.clear();
        self.correlation.clear();
        self.link.disconnect().await
    }

    async fn send(&mut self, message: &Message) -> TransportResult<SendOutcome> {
        if !self.connected {
            return Err(TransportError::ConnectionLost(
                "AMQP binding is not open".to_string(),
            ));
        }
        let session_key = self.route(message)?;

        let tag = match message.operation() {
            DeviceOperation::Telemetry => {
                self.link
                    .send(&session_key, AmqpLinkKind::Telemetry, telemetry_frame(message))
                    .await?
            }
            operation @ (DeviceOperation::TwinGetRequest
            | DeviceOperation::TwinUpdateReportedRequest) => {
                let request_id = message
                    .request_id()
                    .ok_or_else(|| TransportError::protocol("Twin request has no request id"))?
                    .to_string();
                let kind = if operation == DeviceOperation::TwinGetRequest {
                    PendingKind::GetTwin
                } else {
                    PendingKind::PatchReported
                };
                let frame = twin_frame(message, &request_id);
                self.send_request(&session_key, &request_id, kind, frame)
                    .await?
            }
            DeviceOperation::MethodSendResponse => {
                let request_id = message
                    .request_id()
                    .ok_or_else(|| TransportError::protocol("Method response has no request id"))?;
                let key = correlation_key(&session_key, request_id);
                let pending = self
                    .correlation
                    .take_expecting(&key, PendingKind::MethodResponse)
                    .ok_or_else(|| {
                        TransportError::protocol(format!(
                            "Sending a response for the method that was never invoked (rid {request_id})"
                        ))
                    })?;
                let frame = AmqpFrame {
                    correlation_id: Some(request_id.to_string()),
                    body: message.body().clone(),
                    application_properties: vec![(
                        METHOD_STATUS_PROPERTY.to_string(),
                        message.status().unwrap_or(200).to_string(),
                    )],
                    ..AmqpFrame::default()
                };
                match self
                    .link
                    .send(&session_key, AmqpLinkKind::Methods, frame)
                    .await
                {
                    Ok(tag) => tag,
                    Err(e) => {
                        let _ = self.correlation.insert_at(key, pending.kind, pending.created_at);
                        return Err(e);
                    }
                }
            }
            inbound_only => {
                return Err(TransportError::protocol(format!(
                    "{inbound_only:?} cannot be sent by a device"
                )))
            }
        };

        debug!(session = %session_key, message_id = %message.message_id(), tag = %tag, "AMQP delivery awaiting disposition");
        Ok(SendOutcome::AwaitingAck(tag))
    }

    async fn receive(&mut self) -> TransportResult<Option<Message>> {
        while let Some(received) = self.link.poll_received() {
            if let Some(message) = self.inbound_message(received)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn subscribe(&mut self, subscription: Subscription) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::ConnectionLost(
                "AMQP binding is not open".to_string(),
            ));
        }
        let link = match subscription {
            Subscription::CloudToDevice => AmqpLinkKind::CloudToDevice,
            Subscription::DesiredProperties => AmqpLinkKind::Twin,
            Subscription::Methods => AmqpLinkKind::Methods,
        };
        self.ensure_attached(link).await
    }

    fn drain_acknowledgements(&mut self) -> Vec<(DeliveryTag, IotHubStatusCode)> {
        self.link.drain_dispositions()
    }

    fn take_connection_loss(&mut self) -> Option<TransportError> {
        let loss = self.link.take_connection_loss();
        if loss.is_some() {
            self.connected = false;
        }
        loss
    }

    fn is_open(&self) -> bool {
        self.connected
    }

    fn prune_pending(&mut self, max_age: Duration) -> usize {
        self.correlation.prune_older_than(max_age, Instant::now())
    }

    async fn renew_token(&mut self, session: &SessionCredentials) -> TransportResult<()> {
        let token = session
            .sas_token
            .as_deref()
            .ok_or_else(|| TransportError::Security("No token to put".to_string()))?;
        self.link
            .put_token(&session.identity.resource_uri(), token)
            .await?;

        let key = session.identity.session_key();
        if let Some(existing) = self
            .sessions
            .iter_mut()
            .find(|existing| existing.identity.session_key() == key)
        {
            existing.sas_token = session.sas_token.clone();
        }
        info!(session = %key, "AMQP token renewed on live connection");
        Ok(())
    }

    async fn open_session(&mut self, session: &SessionCredentials) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::ConnectionLost(
                "AMQP binding is not open".to_string(),
            ));
        }
        let key = session.identity.session_key();
        if self.session(&key).is_some() {
            return Ok(());
        }
        if let Some(max) = self.protocol.max_multiplexed_devices() {
            if self.sessions.len() >= max {
                return Err(TransportError::fatal_connection(format!(
                    "{} connection already carries {max} sessions",
                    self.protocol
                )));
            }
        }
        self.start_session(session).await?;
        self.sessions.push(session.clone());
        Ok(())
    }

    async fn close_session(&mut self, session_key: &str) -> TransportResult<()> {
        let Some(index) = self
            .sessions
            .iter()
            .position(|session| session.identity.session_key() == session_key)
        else {
            return Ok(());
        };
        if self.connected {
            self.link.close_session(session_key).await?;
        }
        self.sessions.remove(index);
        debug!(session = %session_key, "AMQP session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAmqpLink;

    const HOST: &str = "hub.azure-devices.net";

    fn session(device_id: &str) -> SessionCredentials {
        SessionCredentials::new(
            DeviceIdentity::new(HOST, device_id),
            Some(format!("SharedAccessSignature sr={device_id}&sig=s&se=1")),
        )
    }

    async fn open_binding(devices: &[&str]) -> (AmqpBinding<MockAmqpLink>, MockAmqpLink) {
        let link = MockAmqpLink::new();
        let mut binding = AmqpBinding::new(link.clone(), HOST, Protocol::Amqps);
        let sessions: Vec<_> = devices.iter().map(|d| session(d)).collect();
        binding.open(&sessions).await.unwrap();
        (binding, link)
    }

    #[tokio::test]
    async fn test_open_puts_token_per_session() {
        let (binding, link) = open_binding(&["a", "b"]).await;

        assert_eq!(binding.session_count(), 2);
        let tokens = link.tokens();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].0, "hub.azure-devices.net/devices/a");
        assert_eq!(link.open_sessions(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_telemetry_routed_by_device_id() {
        let (mut binding, link) = open_binding(&["a", "b"]).await;
        let message = Message::new("t")
            .with_device_id("b")
            .with_property("k1", "v1")
            .unwrap();

        binding.send(&message).await.unwrap();

        let sent = link.sent();
        assert_eq!(sent[0].0, "b");
        assert_eq!(sent[0].1, AmqpLinkKind::Telemetry);
        assert_eq!(sent[0].2.application_property("k1"), Some("v1"));
    }

    #[tokio::test]
    async fn test_unaddressed_message_on_multiplexed_connection_is_error() {
        let (mut binding, _link) = open_binding(&["a", "b"]).await;
        let result = binding.send(&Message::new("t")).await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_twin_patch_annotations_and_response() {
        // Arrange
        let (mut binding, link) = open_binding(&["a"]).await;
        let patch = Message::twin_reported_patch("{}", Some(3));
        let rid = patch.request_id().unwrap().to_string();

        // Act
        binding.send(&patch).await.unwrap();
        link.push_received(ReceivedFrame {
            session_key: "a".to_string(),
            link: AmqpLinkKind::Twin,
            frame: AmqpFrame {
                correlation_id: Some(rid.clone()),
                annotations: vec![
                    ("status".to_string(), "204".to_string()),
                    ("version".to_string(), "4".to_string()),
                ],
                ..AmqpFrame::default()
            },
        });
        let response = binding.receive().await.unwrap().unwrap();

        // Assert
        let frame = &link.sent()[0].2;
        assert_eq!(frame.annotation("operation"), Some("PATCH"));
        assert_eq!(frame.annotation("resource"), Some("/properties/reported"));
        assert_eq!(frame.annotation("version"), Some("3"));
        assert_eq!(response.operation(), DeviceOperation::TwinUpdateReportedResponse);
        assert_eq!(response.status(), Some(204));
        assert_eq!(response.version(), Some(4));
        assert_eq!(response.device_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_twin_frame_without_correlation_is_desired_patch() {
        let (mut binding, link) = open_binding(&["a"]).await;
        link.push_received(ReceivedFrame {
            session_key: "a".to_string(),
            link: AmqpLinkKind::Twin,
            frame: AmqpFrame {
                body: Bytes::from_static(b"{\"desired\":1}"),
                annotations: vec![("version".to_string(), "9".to_string())],
                ..AmqpFrame::default()
            },
        });

        let message = binding.receive().await.unwrap().unwrap();
        assert_eq!(message.operation(), DeviceOperation::TwinDesiredPatch);
        assert_eq!(message.version(), Some(9));
    }

    #[tokio::test]
    async fn test_method_request_and_response() {
        let (mut binding, link) = open_binding(&["a"]).await;
        binding.subscribe(Subscription::Methods).await.unwrap();
        link.push_received(ReceivedFrame {
            session_key: "a".to_string(),
            link: AmqpLinkKind::Methods,
            frame: AmqpFrame {
                correlation_id: Some("r1".to_string()),
                application_properties: vec![(
                    METHOD_NAME_PROPERTY.to_string(),
                    "reboot".to_string(),
                )],
                ..AmqpFrame::default()
            },
        });

        let request = binding.receive().await.unwrap().unwrap();
        binding
            .send(&Message::method_response("r1", 200, "{}"))
            .await
            .unwrap();

        assert_eq!(request.method_name(), Some("reboot"));
        let (_, link_kind, frame) = link.sent().remove(0);
        assert_eq!(link_kind, AmqpLinkKind::Methods);
        assert_eq!(frame.correlation_id.as_deref(), Some("r1"));
        assert_eq!(frame.application_property(METHOD_STATUS_PROPERTY), Some("200"));
    }

    #[tokio::test]
    async fn test_twin_response_cannot_consume_pending_method() {
        let (mut binding, link) = open_binding(&["a"]).await;
        binding.subscribe(Subscription::Methods).await.unwrap();
        link.push_received(ReceivedFrame {
            session_key: "a".to_string(),
            link: AmqpLinkKind::Methods,
            frame: AmqpFrame {
                correlation_id: Some("r7".to_string()),
                application_properties: vec![(
                    METHOD_NAME_PROPERTY.to_string(),
                    "reboot".to_string(),
                )],
                ..AmqpFrame::default()
            },
        });
        binding.receive().await.unwrap().unwrap();

        link.push_received(ReceivedFrame {
            session_key: "a".to_string(),
            link: AmqpLinkKind::Twin,
            frame: AmqpFrame {
                correlation_id: Some("r7".to_string()),
                annotations: vec![("status".to_string(), "200".to_string())],
                ..AmqpFrame::default()
            },
        });

        assert!(binding.receive().await.unwrap().is_none());
        assert!(binding
            .send(&Message::method_response("r7", 200, "{}"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unrecorded_method_response_is_protocol_error() {
        let (mut binding, _link) = open_binding(&["a"]).await;
        let result = binding.send(&Message::method_response("nope", 200, "{}")).await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_renew_token_without_reconnect() {
        let (mut binding, link) = open_binding(&["a"]).await;
        let mut renewed = session("a");
        renewed.sas_token = Some("SharedAccessSignature sr=a&sig=new&se=2".to_string());

        binding.renew_token(&renewed).await.unwrap();

        assert_eq!(link.connect_count(), 1);
        assert_eq!(link.tokens().len(), 2);
        assert!(binding.is_open());
    }

    #[tokio::test]
    async fn test_sessions_attach_and_detach() {
        // Arrange
        let (mut binding, link) = open_binding(&["a"]).await;
        binding.subscribe(Subscription::CloudToDevice).await.unwrap();

        // Act
        binding.open_session(&session("b")).await.unwrap();
        binding.close_session("a").await.unwrap();

        // Assert
        assert_eq!(binding.session_count(), 1);
        assert!(binding.is_open());
        assert!(link
            .attachments()
            .contains(&("b".to_string(), AmqpLinkKind::CloudToDevice)));
        assert_eq!(link.closed_sessions(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_hostname_mismatch_fails_open() {
        let mut binding = AmqpBinding::new(MockAmqpLink::new(), HOST, Protocol::Amqps);
        let foreign = SessionCredentials::new(DeviceIdentity::new("other.net", "a"), None);

        let result = binding.open(&[foreign]).await;

        assert!(result.is_err());
        assert!(!binding.is_open());
    }
}
