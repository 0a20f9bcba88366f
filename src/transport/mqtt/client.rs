//! Impure I/O for the MQTT link
//!
//! Owns the rumqttc client and its event loop task. The task records acknowledgements, inbound
//! publishes and connection loss in shared state that the binding drains from the engine's
//! Send and Receive tasks. Reconnecting is the connection state machine's job, so the task
//! stops at the first connection error instead of redialling.

use super::connection::{configure_mqtt_options, LinkState, MqttConnectSettings};
use super::message_handler::{EventRoute, MessageHandler};
use super::MqttLink;
use crate::error::{TransportError, TransportResult};
use crate::transport::DeliveryTag;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// State shared between the link and its event loop task
#[derive(Debug, Default)]
struct LinkShared {
    /// Tags of publishes handed to rumqttc that have no packet id yet, in send order
    pending_tags: VecDeque<DeliveryTag>,
    in_flight: HashMap<u16, DeliveryTag>,
    acks: Vec<DeliveryTag>,
    inbound: VecDeque<(String, Bytes)>,
    connection_loss: Option<TransportError>,
}

fn lock(shared: &StdMutex<LinkShared>) -> MutexGuard<'_, LinkShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// rumqttc-backed MQTT link
pub struct RumqttcLink {
    client: Option<AsyncClient>,
    shared: Arc<StdMutex<LinkShared>>,
    event_loop_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    next_tag: u64,
    connack_timeout: Duration,
}

impl RumqttcLink {
    pub fn new() -> Self {
        Self {
            client: None,
            shared: Arc::new(StdMutex::new(LinkShared::default())),
            event_loop_handle: None,
            shutdown_tx: None,
            next_tag: 0,
            connack_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connack_timeout(mut self, timeout: Duration) -> Self {
        self.connack_timeout = timeout;
        self
    }

    /// Create link state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (watch::Sender<LinkState>, watch::Receiver<LinkState>),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        (watch::channel(LinkState::Connecting), watch::channel(false))
    }

    /// Wait for ConnAck (or a refusal) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> TransportResult<()> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::connection("Link state channel closed"));
                }
                let state = state_rx.borrow().clone();
                match state {
                    LinkState::Connected => return Ok(()),
                    LinkState::Failed(error) => return Err(error),
                    LinkState::Connecting => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Drive the rumqttc event loop until shutdown or the first connection error
    async fn run_event_loop(
        mut event_loop: EventLoop,
        shared: Arc<StdMutex<LinkShared>>,
        state_tx: watch::Sender<LinkState>,
        mut shutdown_rx: watch::Receiver<bool>,
        client_id: String,
    ) {
        info!(client_id = %client_id, "Starting MQTT event loop");
        let mut connected = false;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(route, &shared, &state_tx, &mut connected) {
                                break;
                            }
                        }
                        Err(e) => {
                            let failure = MessageHandler::connection_error(&e);
                            error!(client_id = %client_id, error = %e, "MQTT event loop error");
                            if connected {
                                lock(&shared).connection_loss = Some(failure.clone());
                            }
                            let _ = state_tx.send(LinkState::Failed(failure));
                            break;
                        }
                    }
                }
            }
        }
        info!(client_id = %client_id, "MQTT event loop stopped");
    }

    /// Apply one routed event; returns false when the loop must stop
    fn process_event_route(
        route: EventRoute,
        shared: &StdMutex<LinkShared>,
        state_tx: &watch::Sender<LinkState>,
        connected: &mut bool,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *connected = true;
                let _ = state_tx.send(LinkState::Connected);
                true
            }
            EventRoute::ConnectionRefused(error) => {
                warn!(error = %error, "MQTT connection refused");
                let _ = state_tx.send(LinkState::Failed(error));
                false
            }
            EventRoute::PublishSent { packet_id } => {
                let mut state = lock(shared);
                if let Some(tag) = state.pending_tags.pop_front() {
                    state.in_flight.insert(packet_id, tag);
                }
                true
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                let mut state = lock(shared);
                match state.in_flight.remove(&packet_id) {
                    Some(tag) => state.acks.push(tag),
                    None => debug!(packet_id, "PubAck for unknown packet id"),
                }
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");
                lock(shared).inbound.push_back((topic, payload));
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                accepted,
            } => {
                if accepted {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                } else {
                    warn!(packet_id, "Subscription rejected by hub");
                }
                true
            }
            EventRoute::Disconnected => {
                let error = TransportError::ConnectionLost("Hub sent DISCONNECT".to_string());
                lock(shared).connection_loss = Some(error.clone());
                let _ = state_tx.send(LinkState::Failed(error));
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn stop_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        if let Some(mut handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    handle.abort();
                    let _ = handle.await;
                }
                _ => {}
            }
        }
    }
}

impl Default for RumqttcLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqttLink for RumqttcLink {
    async fn connect(&mut self, settings: &MqttConnectSettings) -> TransportResult<()> {
        if self.client.is_some() {
            self.disconnect().await?;
        }

        let mqtt_options = configure_mqtt_options(settings)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        *lock(&self.shared) = LinkShared::default();
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = Self::setup_connection_channels();

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.shared.clone(),
            state_tx,
            shutdown_rx,
            settings.client_id.clone(),
        ));

        self.client = Some(client);
        self.event_loop_handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, self.connack_timeout).await
        {
            self.stop_event_loop().await;
            self.client = None;
            return Err(e);
        }

        info!(client_id = %settings.client_id, "MQTT link connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        if let Some(client) = self.client.take() {
            // Best effort; the event loop may already be gone
            if let Err(e) = client.disconnect().await {
                debug!("MQTT disconnect request not delivered: {}", e);
            }
        }
        self.stop_event_loop().await;
        info!("MQTT link disconnected");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> TransportResult<DeliveryTag> {
        let client = self.client.as_ref().ok_or(TransportError::ConnectionLost(
            "MQTT link is not connected".to_string(),
        ))?;

        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        // Registered before the request is queued so the PublishSent event always finds it
        lock(&self.shared).pending_tags.push_back(tag);

        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
        {
            let mut state = lock(&self.shared);
            state.pending_tags.retain(|pending| *pending != tag);
            return Err(TransportError::ConnectionLost(format!("Publish failed: {e}")));
        }

        debug!(target: "mqtt_transport", topic = %topic, tag = %tag, "Queued MQTT publish");
        Ok(tag)
    }

    async fn subscribe(&mut self, topic: &str) -> TransportResult<()> {
        let client = self.client.as_ref().ok_or(TransportError::ConnectionLost(
            "MQTT link is not connected".to_string(),
        ))?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("Subscribe failed: {e}")))?;
        debug!(target: "mqtt_transport", topic = %topic, "Subscribed");
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<(String, Bytes)> {
        lock(&self.shared).inbound.pop_front()
    }

    fn drain_acks(&mut self) -> Vec<DeliveryTag> {
        std::mem::take(&mut lock(&self.shared).acks)
    }

    fn take_connection_loss(&mut self) -> Option<TransportError> {
        lock(&self.shared).connection_loss.take()
    }
}

impl Drop for RumqttcLink {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            RumqttcLink::setup_connection_channels();

        assert!(matches!(*state_rx.borrow(), LinkState::Connecting));
        assert!(!*shutdown_rx.borrow());

        state_tx.send(LinkState::Connected).unwrap();
        shutdown_tx.send(true).unwrap();
        assert!(matches!(*state_rx.borrow(), LinkState::Connected));
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(LinkState::Connected);
        });

        let result =
            RumqttcLink::wait_for_connection_confirmation(state_rx, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_refused() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        state_tx
            .send(LinkState::Failed(TransportError::Unauthorized("401".into())))
            .unwrap();

        let result =
            RumqttcLink::wait_for_connection_confirmation(state_rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_state_tx, state_rx) = watch::channel(LinkState::Connecting);

        let result =
            RumqttcLink::wait_for_connection_confirmation(state_rx, Duration::from_millis(20))
                .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[test]
    fn test_publish_lifecycle_maps_packet_ids_to_tags() {
        let shared = StdMutex::new(LinkShared::default());
        let (state_tx, _state_rx) = watch::channel(LinkState::Connecting);
        let mut connected = false;

        lock(&shared).pending_tags.push_back(DeliveryTag(1));
        lock(&shared).pending_tags.push_back(DeliveryTag(2));

        for route in [
            EventRoute::ConnectionAcknowledged,
            EventRoute::PublishSent { packet_id: 10 },
            EventRoute::PublishSent { packet_id: 11 },
            EventRoute::PublishAcknowledged { packet_id: 11 },
        ] {
            assert!(RumqttcLink::process_event_route(
                route,
                &shared,
                &state_tx,
                &mut connected
            ));
        }

        assert!(connected);
        let state = lock(&shared);
        assert_eq!(state.acks, vec![DeliveryTag(2)]);
        assert_eq!(state.in_flight.get(&10), Some(&DeliveryTag(1)));
    }

    #[test]
    fn test_broker_disconnect_records_connection_loss() {
        let shared = StdMutex::new(LinkShared::default());
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);
        let mut connected = true;

        let keep_running = RumqttcLink::process_event_route(
            EventRoute::Disconnected,
            &shared,
            &state_tx,
            &mut connected,
        );

        assert!(!keep_running);
        assert!(lock(&shared).connection_loss.is_some());
        assert!(matches!(*state_rx.borrow(), LinkState::Failed(_)));
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails() {
        let mut link = RumqttcLink::new();
        let result = link.publish("topic", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TransportError::ConnectionLost(_))));
        assert!(link.drain_acks().is_empty());
        assert!(link.poll_inbound().is_none());
    }
}
