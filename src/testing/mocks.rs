//! Mock links and bindings for testing
//!
//! Every mock is a cheap `Clone` over shared state, so a test can hand one copy to the code
//! under test and keep another to script failures and inspect what was sent.

use crate::auth::DeviceIdentity;
use crate::error::{TransportError, TransportResult};
use crate::message::Message;
use crate::status::IotHubStatusCode;
use crate::transport::amqp::{AmqpFrame, AmqpLink, AmqpLinkKind, ReceivedFrame};
use crate::transport::mqtt::{MqttConnectSettings, MqttLink};
use crate::transport::{
    DeliveryTag, Protocol, ProtocolBinding, SendOutcome, SessionCredentials, Subscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct MqttLinkState {
    connected: bool,
    connects: Vec<MqttConnectSettings>,
    disconnects: usize,
    published: Vec<(String, Bytes)>,
    subscriptions: Vec<String>,
    inbound: VecDeque<(String, Bytes)>,
    next_tag: u64,
    unacked: Vec<DeliveryTag>,
    acks: Vec<DeliveryTag>,
    publish_failure: Option<TransportError>,
    connect_failures: VecDeque<TransportError>,
    connection_loss: Option<TransportError>,
}

/// In-memory `MqttLink` that records connects, publishes and subscriptions
#[derive(Debug, Clone, Default)]
pub struct MockMqttLink {
    state: Arc<Mutex<MqttLinkState>>,
}

impl MockMqttLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> Vec<MqttConnectSettings> {
        lock(&self.state).connects.clone()
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        lock(&self.state).published.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn push_inbound(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        lock(&self.state)
            .inbound
            .push_back((topic.into(), payload.into()));
    }

    /// Every publish from now on fails with `error`
    pub fn fail_publishes(&self, error: TransportError) {
        lock(&self.state).publish_failure = Some(error);
    }

    /// The next connect attempts fail with these errors, in order
    pub fn fail_connects(&self, errors: Vec<TransportError>) {
        lock(&self.state).connect_failures.extend(errors);
    }

    pub fn drop_connection(&self, error: TransportError) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.connection_loss = Some(error);
    }

    /// Acknowledge every publish the broker has not acknowledged yet
    pub fn ack_all(&self) {
        let mut state = lock(&self.state);
        let unacked = std::mem::take(&mut state.unacked);
        state.acks.extend(unacked);
    }
}

#[async_trait]
impl MqttLink for MockMqttLink {
    async fn connect(&mut self, settings: &MqttConnectSettings) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.connects.push(settings.clone());
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        state.connected = true;
        state.connection_loss = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> TransportResult<DeliveryTag> {
        let mut state = lock(&self.state);
        if let Some(error) = state.publish_failure.clone() {
            return Err(error);
        }
        if !state.connected {
            return Err(TransportError::ConnectionLost("link is not connected".into()));
        }
        state.published.push((topic.to_string(), payload));
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        state.unacked.push(tag);
        Ok(tag)
    }

    async fn subscribe(&mut self, topic: &str) -> TransportResult<()> {
        lock(&self.state).subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<(String, Bytes)> {
        lock(&self.state).inbound.pop_front()
    }

    fn drain_acks(&mut self) -> Vec<DeliveryTag> {
        std::mem::take(&mut lock(&self.state).acks)
    }

    fn take_connection_loss(&mut self) -> Option<TransportError> {
        lock(&self.state).connection_loss.take()
    }
}

#[derive(Debug, Default)]
struct AmqpLinkState {
    connects: usize,
    disconnects: usize,
    tokens: Vec<(String, String)>,
    open_sessions: Vec<String>,
    closed_sessions: Vec<String>,
    attachments: Vec<(String, AmqpLinkKind)>,
    sent: Vec<(String, AmqpLinkKind, AmqpFrame)>,
    received: VecDeque<ReceivedFrame>,
    next_tag: u64,
    unsettled: Vec<DeliveryTag>,
    dispositions: Vec<(DeliveryTag, IotHubStatusCode)>,
    put_token_failure: Option<TransportError>,
    connection_loss: Option<TransportError>,
}

/// In-memory `AmqpLink` that records CBS tokens, sessions, attachments and frames
#[derive(Debug, Clone, Default)]
pub struct MockAmqpLink {
    state: Arc<Mutex<AmqpLinkState>>,
}

impl MockAmqpLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// `(audience, token)` pairs in the order they were put
    pub fn tokens(&self) -> Vec<(String, String)> {
        lock(&self.state).tokens.clone()
    }

    pub fn open_sessions(&self) -> Vec<String> {
        lock(&self.state).open_sessions.clone()
    }

    pub fn closed_sessions(&self) -> Vec<String> {
        lock(&self.state).closed_sessions.clone()
    }

    pub fn attachments(&self) -> Vec<(String, AmqpLinkKind)> {
        lock(&self.state).attachments.clone()
    }

    pub fn sent(&self) -> Vec<(String, AmqpLinkKind, AmqpFrame)> {
        lock(&self.state).sent.clone()
    }

    pub fn push_received(&self, frame: ReceivedFrame) {
        lock(&self.state).received.push_back(frame);
    }

    /// Settle every outstanding delivery with `status`
    pub fn settle_all(&self, status: IotHubStatusCode) {
        let mut state = lock(&self.state);
        let unsettled = std::mem::take(&mut state.unsettled);
        state
            .dispositions
            .extend(unsettled.into_iter().map(|tag| (tag, status)));
    }

    pub fn fail_put_token(&self, error: TransportError) {
        lock(&self.state).put_token_failure = Some(error);
    }

    pub fn drop_connection(&self, error: TransportError) {
        lock(&self.state).connection_loss = Some(error);
    }
}

#[async_trait]
impl AmqpLink for MockAmqpLink {
    async fn connect(&mut self, _hostname: &str, _websocket: bool) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.connects += 1;
        state.connection_loss = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        lock(&self.state).disconnects += 1;
        Ok(())
    }

    async fn put_token(&mut self, audience: &str, token: &str) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if let Some(error) = state.put_token_failure.clone() {
            return Err(error);
        }
        state.tokens.push((audience.to_string(), token.to_string()));
        Ok(())
    }

    async fn open_session(&mut self, identity: &DeviceIdentity) -> TransportResult<()> {
        lock(&self.state).open_sessions.push(identity.session_key());
        Ok(())
    }

    async fn close_session(&mut self, session_key: &str) -> TransportResult<()> {
        lock(&self.state).closed_sessions.push(session_key.to_string());
        Ok(())
    }

    async fn attach(&mut self, session_key: &str, link: AmqpLinkKind) -> TransportResult<()> {
        lock(&self.state)
            .attachments
            .push((session_key.to_string(), link));
        Ok(())
    }

    async fn send(
        &mut self,
        session_key: &str,
        link: AmqpLinkKind,
        frame: AmqpFrame,
    ) -> TransportResult<DeliveryTag> {
        let mut state = lock(&self.state);
        state.sent.push((session_key.to_string(), link, frame));
        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        state.unsettled.push(tag);
        Ok(tag)
    }

    fn poll_received(&mut self) -> Option<ReceivedFrame> {
        lock(&self.state).received.pop_front()
    }

    fn drain_dispositions(&mut self) -> Vec<(DeliveryTag, IotHubStatusCode)> {
        std::mem::take(&mut lock(&self.state).dispositions)
    }

    fn take_connection_loss(&mut self) -> Option<TransportError> {
        lock(&self.state).connection_loss.take()
    }
}

/// How `MockBinding::send` completes a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendMode {
    /// `SendOutcome::Completed(Ok)`, like an HTTPS round trip
    #[default]
    Complete,
    /// `AwaitingAck`, acknowledged with OK on the next drain
    AutoAck,
    /// `AwaitingAck`, acknowledged only by `ack_pending`
    ManualAck,
}

#[derive(Debug, Default)]
struct BindingState {
    open: bool,
    send_mode: SendMode,
    send_delay: Option<Duration>,
    proactive_renewal: bool,
    open_calls: Vec<Vec<SessionCredentials>>,
    close_count: usize,
    open_failures: VecDeque<TransportError>,
    send_failures: HashMap<String, VecDeque<TransportError>>,
    batch_failures: VecDeque<TransportError>,
    sent: Vec<Message>,
    batches: Vec<Vec<Message>>,
    subscriptions: Vec<Subscription>,
    inbound: VecDeque<Message>,
    receive_failures: VecDeque<TransportError>,
    next_tag: u64,
    pending: Vec<DeliveryTag>,
    acks: Vec<(DeliveryTag, IotHubStatusCode)>,
    connection_loss: Option<TransportError>,
    renewals: Vec<SessionCredentials>,
    opened_sessions: Vec<String>,
    closed_sessions: Vec<String>,
    session_failures: HashMap<String, TransportError>,
}

/// Scriptable `ProtocolBinding` for engine and facade tests
#[derive(Debug, Clone)]
pub struct MockBinding {
    protocol: Protocol,
    state: Arc<Mutex<BindingState>>,
}

impl MockBinding {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: Arc::new(Mutex::new(BindingState::default())),
        }
    }

    /// A binding that is already open, for tests that skip the open handshake
    pub fn opened(protocol: Protocol) -> Self {
        let binding = Self::new(protocol);
        lock(&binding.state).open = true;
        binding
    }

    pub fn with_send_mode(self, mode: SendMode) -> Self {
        lock(&self.state).send_mode = mode;
        self
    }

    /// Every send sleeps this long before it reaches the wire
    pub fn with_send_delay(self, delay: Duration) -> Self {
        lock(&self.state).send_delay = Some(delay);
        self
    }

    /// Accept `renew_token` instead of failing it
    pub fn with_proactive_renewal(self) -> Self {
        lock(&self.state).proactive_renewal = true;
        self
    }

    /// The next sends of `message_id` fail with these errors, in order; attempts are still recorded
    pub fn fail_sends_for(&self, message_id: impl Into<String>, errors: Vec<TransportError>) {
        lock(&self.state)
            .send_failures
            .entry(message_id.into())
            .or_default()
            .extend(errors);
    }

    pub fn fail_batches(&self, errors: Vec<TransportError>) {
        lock(&self.state).batch_failures.extend(errors);
    }

    pub fn fail_opens_with(&self, errors: Vec<TransportError>) {
        lock(&self.state).open_failures.extend(errors);
    }

    /// The next `open_session` for `session_key` fails with `error`
    pub fn fail_session_open_for(&self, session_key: impl Into<String>, error: TransportError) {
        lock(&self.state)
            .session_failures
            .insert(session_key.into(), error);
    }

    pub fn fail_receives_with(&self, errors: Vec<TransportError>) {
        lock(&self.state).receive_failures.extend(errors);
    }

    /// Every send attempt, failed ones included
    pub fn sent_messages(&self) -> Vec<Message> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_message_ids(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .map(|m| m.message_id().to_string())
            .collect()
    }

    pub fn batches(&self) -> Vec<Vec<Message>> {
        lock(&self.state).batches.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).open_calls.len()
    }

    /// Sessions passed to each `open` call
    pub fn open_calls(&self) -> Vec<Vec<SessionCredentials>> {
        lock(&self.state).open_calls.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    pub fn renewals(&self) -> Vec<SessionCredentials> {
        lock(&self.state).renewals.clone()
    }

    pub fn opened_sessions(&self) -> Vec<String> {
        lock(&self.state).opened_sessions.clone()
    }

    pub fn closed_sessions(&self) -> Vec<String> {
        lock(&self.state).closed_sessions.clone()
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Acknowledge every outstanding send with `status`
    pub fn ack_pending(&self, status: IotHubStatusCode) {
        let mut state = lock(&self.state);
        let pending = std::mem::take(&mut state.pending);
        state
            .acks
            .extend(pending.into_iter().map(|tag| (tag, status)));
    }

    pub fn push_inbound(&self, message: Message) {
        lock(&self.state).inbound.push_back(message);
    }

    /// Simulate the network dropping; the next `take_connection_loss` reports `error`
    pub fn drop_connection(&self, error: TransportError) {
        let mut state = lock(&self.state);
        state.open = false;
        state.connection_loss = Some(error);
    }
}

#[async_trait]
impl ProtocolBinding for MockBinding {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn open(&mut self, sessions: &[SessionCredentials]) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.open_calls.push(sessions.to_vec());
        if let Some(error) = state.open_failures.pop_front() {
            return Err(error);
        }
        state.open = true;
        state.connection_loss = None;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if state.open {
            state.close_count += 1;
        }
        state.open = false;
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> TransportResult<SendOutcome> {
        let delay = lock(&self.state).send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        if !state.open {
            return Err(TransportError::ConnectionLost("binding is not open".into()));
        }
        state.sent.push(message.clone());
        let failure = state
            .send_failures
            .get_mut(message.message_id())
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        match state.send_mode {
            SendMode::Complete => Ok(SendOutcome::Completed(IotHubStatusCode::Ok)),
            SendMode::AutoAck | SendMode::ManualAck => {
                state.next_tag += 1;
                let tag = DeliveryTag(state.next_tag);
                if state.send_mode == SendMode::AutoAck {
                    state.acks.push((tag, IotHubStatusCode::Ok));
                } else {
                    state.pending.push(tag);
                }
                Ok(SendOutcome::AwaitingAck(tag))
            }
        }
    }

    async fn send_batch(&mut self, messages: &[Message]) -> TransportResult<IotHubStatusCode> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(TransportError::ConnectionLost("binding is not open".into()));
        }
        state.batches.push(messages.to_vec());
        match state.batch_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(IotHubStatusCode::Ok),
        }
    }

    async fn receive(&mut self) -> TransportResult<Option<Message>> {
        let mut state = lock(&self.state);
        if let Some(error) = state.receive_failures.pop_front() {
            return Err(error);
        }
        if !state.open {
            return Ok(None);
        }
        Ok(state.inbound.pop_front())
    }

    async fn subscribe(&mut self, subscription: Subscription) -> TransportResult<()> {
        lock(&self.state).subscriptions.push(subscription);
        Ok(())
    }

    fn drain_acknowledgements(&mut self) -> Vec<(DeliveryTag, IotHubStatusCode)> {
        std::mem::take(&mut lock(&self.state).acks)
    }

    fn take_connection_loss(&mut self) -> Option<TransportError> {
        lock(&self.state).connection_loss.take()
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    async fn renew_token(&mut self, session: &SessionCredentials) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if !state.proactive_renewal {
            return Err(TransportError::unsupported("mock renews by reconnecting"));
        }
        state.renewals.push(session.clone());
        Ok(())
    }

    async fn open_session(&mut self, session: &SessionCredentials) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if !self.protocol.is_amqp() {
            return Err(TransportError::unsupported("mock multiplexes over AMQP only"));
        }
        let session_key = session.identity.session_key();
        if let Some(error) = state.session_failures.remove(&session_key) {
            return Err(error);
        }
        state.opened_sessions.push(session_key);
        Ok(())
    }

    async fn close_session(&mut self, session_key: &str) -> TransportResult<()> {
        lock(&self.state)
            .closed_sessions
            .push(session_key.to_string());
        Ok(())
    }
}
