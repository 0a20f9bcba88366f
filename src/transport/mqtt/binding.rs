//! `ProtocolBinding` over an MQTT link
//!
//! Twin and method traffic is request/response over plain topics. Every request id the device
//! sends (twin GET/PATCH) or receives (method POST) is recorded in a `CorrelationTable` and
//! consumed by exactly one response.

use super::topics::{
    self, InboundTopic, TopicBuilder, METHODS_SUBSCRIPTION, TWIN_DESIRED_SUBSCRIPTION,
    TWIN_RESPONSE_SUBSCRIPTION,
};
use super::{MqttConnectSettings, MqttLink};
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
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct MqttBinding<L: MqttLink> {
    link: L,
    hostname: String,
    protocol: Protocol,
    identity: Option<DeviceIdentity>,
    correlation: CorrelationTable,
    subscriptions: Vec<String>,
    open: bool,
}

impl<L: MqttLink> MqttBinding<L> {
    pub fn new(link: L, hostname: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            link,
            hostname: hostname.into(),
            protocol,
            identity: None,
            correlation: CorrelationTable::new(),
            subscriptions: Vec::new(),
            open: false,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn pending_operations(&self) -> usize {
        self.correlation.len()
    }

    fn identity(&self) -> TransportResult<&DeviceIdentity> {
        match (&self.identity, self.open) {
            (Some(identity), true) => Ok(identity),
            _ => Err(TransportError::ConnectionLost(
                "MQTT binding is not open".to_string(),
            )),
        }
    }

    async fn ensure_subscribed(&mut self, topic: &str) -> TransportResult<()> {
        if self.subscriptions.iter().any(|existing| existing == topic) {
            return Ok(());
        }
        self.link.subscribe(topic).await?;
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    /// Publish a request whose response must be correlated; the entry is rolled back on failure
    async fn publish_request(
        &mut self,
        topic: String,
        request_id: &str,
        kind: PendingKind,
        payload: Bytes,
    ) -> TransportResult<DeliveryTag> {
        self.ensure_subscribed(TWIN_RESPONSE_SUBSCRIPTION).await?;
        self.correlation.insert(request_id, kind)?;
        match self.link.publish(&topic, payload).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                self.correlation.take(request_id);
                Err(e)
            }
        }
    }

    async fn send_method_response(&mut self, message: &Message) -> TransportResult<DeliveryTag> {
        let request_id = message
            .request_id()
            .ok_or_else(|| TransportError::protocol("Method response has no request id"))?
            .to_string();
        let status = message.status().unwrap_or(200);

        let pending = self
            .correlation
            .take_expecting(&request_id, PendingKind::MethodResponse)
            .ok_or_else(|| {
                TransportError::protocol(format!(
                    "Sending a response for the method that was never invoked (rid {request_id})"
                ))
            })?;

        let topic = TopicBuilder::method_response_topic(status, &request_id);
        match self.link.publish(&topic, message.body().clone()).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                // Still answerable after a reconnect
                let _ = self
                    .correlation
                    .insert_at(request_id, pending.kind, pending.created_at);
                Err(e)
            }
        }
    }

    /// Turn one received publish into a message; `Ok(None)` means the publish was dropped
    fn inbound_message(&mut self, topic: &str, payload: Bytes) -> TransportResult<Option<Message>> {
        match topics::classify(topic)? {
            InboundTopic::TwinResponse {
                status,
                request_id,
                version,
            } => {
                let Some(pending) = self.correlation.take_twin_response(&request_id) else {
                    warn!(request_id = %request_id, status, "Dropping twin response with no pending twin request");
                    return Ok(None);
                };
                let operation = if pending.kind == PendingKind::GetTwin {
                    DeviceOperation::TwinGetResponse
                } else {
                    DeviceOperation::TwinUpdateReportedResponse
                };
                let mut message = Message::inbound(payload, operation);
                message.set_correlation_id(request_id.clone());
                message.set_request_id(request_id);
                message.set_status(status);
                if let Some(version) = version {
                    message.set_version(version);
                }
                Ok(Some(message))
            }
            InboundTopic::TwinDesiredPatch { version } => {
                let mut message = Message::inbound(payload, DeviceOperation::TwinDesiredPatch);
                if let Some(version) = version {
                    message.set_version(version);
                }
                Ok(Some(message))
            }
            InboundTopic::MethodRequest {
                method_name,
                request_id,
            } => {
                self.correlation
                    .insert(request_id.clone(), PendingKind::MethodResponse)?;
                let mut message = Message::inbound(payload, DeviceOperation::MethodReceiveRequest);
                message.set_method_name(method_name);
                message.set_correlation_id(request_id.clone());
                message.set_request_id(request_id);
                Ok(Some(message))
            }
            telemetry @ InboundTopic::Telemetry { .. } => {
                Ok(topics::telemetry_message(telemetry, payload))
            }
        }
    }
}

#[async_trait]
impl<L: MqttLink> ProtocolBinding for MqttBinding<L> {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn open(&mut self, sessions: &[SessionCredentials]) -> TransportResult<()> {
        let [session] = sessions else {
            return Err(TransportError::unsupported(format!(
                "{} carries exactly one device session, got {}",
                self.protocol,
                sessions.len()
            )));
        };
        if !session.identity.hostname.eq_ignore_ascii_case(&self.hostname) {
            return Err(TransportError::fatal_connection(format!(
                "Session hostname {} does not match binding hostname {}",
                session.identity.hostname, self.hostname
            )));
        }

        let settings =
            MqttConnectSettings::for_identity(&session.identity, self.protocol, session.sas_token.clone());
        self.link.connect(&settings).await?;
        self.identity = Some(session.identity.clone());
        self.open = true;

        // Subscriptions survive reconnects
        for topic in self.subscriptions.clone() {
            if let Err(e) = self.link.subscribe(&topic).await {
                self.open = false;
                return Err(e);
            }
        }

        info!(client_id = %settings.client_id, protocol = %self.protocol, "MQTT binding open");
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.correlation.clear();
        self.link.disconnect().await
    }

    async fn send(&mut self, message: &Message) -> TransportResult<SendOutcome> {
        let identity = self.identity()?.clone();

        let tag = match message.operation() {
            DeviceOperation::Telemetry => {
                let topic = TopicBuilder::telemetry_topic(&identity, message);
                self.link.publish(&topic, message.body().clone()).await?
            }
            DeviceOperation::TwinGetRequest => {
                let request_id = request_id_of(message)?;
                self.publish_request(
                    TopicBuilder::twin_get_topic(&request_id),
                    &request_id,
                    PendingKind::GetTwin,
                    Bytes::new(),
                )
                .await?
            }
            DeviceOperation::TwinUpdateReportedRequest => {
                let request_id = request_id_of(message)?;
                self.publish_request(
                    TopicBuilder::twin_patch_reported_topic(&request_id, message.version()),
                    &request_id,
                    PendingKind::PatchReported,
                    message.body().clone(),
                )
                .await?
            }
            DeviceOperation::MethodSendResponse => self.send_method_response(message).await?,
            inbound_only => {
                return Err(TransportError::protocol(format!(
                    "{inbound_only:?} cannot be sent by a device"
                )))
            }
        };

        debug!(message_id = %message.message_id(), tag = %tag, "MQTT publish awaiting PubAck");
        Ok(SendOutcome::AwaitingAck(tag))
    }

    async fn receive(&mut self) -> TransportResult<Option<Message>> {
        while let Some((topic, payload)) = self.link.poll_inbound() {
            if let Some(message) = self.inbound_message(&topic, payload)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn subscribe(&mut self, subscription: Subscription) -> TransportResult<()> {
        let identity = self.identity()?.clone();
        match subscription {
            Subscription::CloudToDevice => {
                self.ensure_subscribed(&TopicBuilder::cloud_to_device_subscription(&identity))
                    .await
            }
            Subscription::DesiredProperties => {
                self.ensure_subscribed(TWIN_DESIRED_SUBSCRIPTION).await?;
                self.ensure_subscribed(TWIN_RESPONSE_SUBSCRIPTION).await
            }
            Subscription::Methods => self.ensure_subscribed(METHODS_SUBSCRIPTION).await,
        }
    }

    fn drain_acknowledgements(&mut self) -> Vec<(DeliveryTag, IotHubStatusCode)> {
        self.link
            .drain_acks()
            .into_iter()
            .map(|tag| (tag, IotHubStatusCode::Ok))
            .collect()
    }

    fn take_connection_loss(&mut self) -> Option<TransportError> {
        let loss = self.link.take_connection_loss();
        if loss.is_some() {
            self.open = false;
        }
        loss
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn prune_pending(&mut self, max_age: Duration) -> usize {
        self.correlation.prune_older_than(max_age, Instant::now())
    }
}

fn request_id_of(message: &Message) -> TransportResult<String> {
    message
        .request_id()
        .map(str::to_string)
        .ok_or_else(|| TransportError::protocol("Twin request has no request id"))
}
