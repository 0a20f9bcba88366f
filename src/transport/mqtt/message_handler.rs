//! Pure routing of rumqttc events for the MQTT link
//!
//! The event loop task asks this module what an event means and only then touches shared
//! state, so the mapping can be tested without a broker.

use crate::error::TransportError;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the handler that owns it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(Self::refusal_error(code)),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    accepted: suback
                        .return_codes
                        .iter()
                        .all(|code| !matches!(code, SubscribeReasonCode::Failure)),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify a refused ConnAck
    pub fn refusal_error(code: ConnectReturnCode) -> TransportError {
        match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                TransportError::Unauthorized(format!("Connection refused: {code:?}"))
            }
            ConnectReturnCode::ServiceUnavailable => {
                TransportError::connection(format!("Connection refused: {code:?}"))
            }
            other => TransportError::fatal_connection(format!("Connection refused: {other:?}")),
        }
    }

    /// Classify an event loop failure
    pub fn connection_error(error: &ConnectionError) -> TransportError {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::refusal_error(*code),
            ConnectionError::Io(e) => TransportError::Io(e.to_string()),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                TransportError::Timeout(error.to_string())
            }
            ConnectionError::RequestsDone => TransportError::Closed,
            other => TransportError::ConnectionLost(other.to_string()),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    ConnectionRefused(TransportError),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// A queued publish left with this packet id
    PublishSent { packet_id: u16 },
    PublishAcknowledged { packet_id: u16 },
    SubscriptionConfirmed { packet_id: u16, accepted: bool },
    /// Broker disconnected us
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, PubAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionRefused(TransportError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_route_publish_lifecycle() {
        let sent = Event::Outgoing(Outgoing::Publish(7));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&sent),
            EventRoute::PublishSent { packet_id: 7 }
        ));

        let acked = Event::Incoming(Packet::PubAck(PubAck::new(7)));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&acked),
            EventRoute::PublishAcknowledged { packet_id: 7 }
        ));
    }

    #[test]
    fn test_route_inbound_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "devices/dev1/messages/devicebound/%24.mid=m1",
            QoS::AtLeastOnce,
            "payload",
        )));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived { topic, payload } => {
                assert_eq!(topic, "devices/dev1/messages/devicebound/%24.mid=m1");
                assert_eq!(payload.as_ref(), b"payload");
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_suback_failure() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            3,
            vec![SubscribeReasonCode::Failure],
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionConfirmed {
                packet_id: 3,
                accepted: false
            }
        ));
    }

    #[test]
    fn test_route_disconnect_and_ping() {
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        ));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        ));
    }

    #[test]
    fn test_refusal_classification() {
        assert!(matches!(
            MessageHandler::refusal_error(ConnectReturnCode::BadUserNamePassword),
            TransportError::Unauthorized(_)
        ));
        assert!(MessageHandler::refusal_error(ConnectReturnCode::ServiceUnavailable).is_retryable());
        assert!(!MessageHandler::refusal_error(ConnectReturnCode::BadClientId).is_retryable());
    }
}
