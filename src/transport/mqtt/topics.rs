//! Pure topic construction and parsing for the IoT Hub MQTT mapping
//!
//! Outbound telemetry carries its system and user properties in the topic itself, as
//! form-url-encoded `key=value` pairs joined by `&`. Twin and method traffic carries the request
//! id (`$rid`), status and twin version in the topic.

use crate::auth::DeviceIdentity;
use crate::error::{TransportError, TransportResult};
use crate::message::{DeviceOperation, Message};
use url::form_urlencoded;

pub const MESSAGE_ID_KEY: &str = "$.mid";
pub const CORRELATION_ID_KEY: &str = "$.cid";
pub const CONTENT_TYPE_KEY: &str = "$.ct";
pub const CONTENT_ENCODING_KEY: &str = "$.ce";
pub const OUTPUT_NAME_KEY: &str = "$.on";
pub const TO_KEY: &str = "$.to";
pub const USER_ID_KEY: &str = "$.uid";
pub const EXPIRY_KEY: &str = "$.exp";
pub const ACK_KEY: &str = "iothub-ack";

pub const METHODS_SUBSCRIPTION: &str = "$iothub/methods/POST/#";
pub const TWIN_DESIRED_SUBSCRIPTION: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const TWIN_RESPONSE_SUBSCRIPTION: &str = "$iothub/twin/res/#";

const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";
const DEVICES_PREFIX: &str = "devices/";
const REQUEST_ID_KEY: &str = "$rid";
const VERSION_KEY: &str = "$version";

/// Topic construction for every publish and subscription the binding makes
pub struct TopicBuilder;

impl TopicBuilder {
    /// `devices/{d}/messages/events/` or `devices/{d}/modules/{m}/messages/events/`
    pub fn events_base(identity: &DeviceIdentity) -> String {
        match &identity.module_id {
            Some(module_id) => format!(
                "devices/{}/modules/{}/messages/events/",
                identity.device_id, module_id
            ),
            None => format!("devices/{}/messages/events/", identity.device_id),
        }
    }

    /// Telemetry publish topic with the message properties appended
    pub fn telemetry_topic(identity: &DeviceIdentity, message: &Message) -> String {
        let mut topic = Self::events_base(identity);
        topic.push_str(&encode_properties(message));
        topic
    }

    /// Cloud-to-device messages for devices, input messages for modules
    pub fn cloud_to_device_subscription(identity: &DeviceIdentity) -> String {
        match &identity.module_id {
            Some(module_id) => format!("devices/{}/modules/{}/inputs/#", identity.device_id, module_id),
            None => format!("devices/{}/messages/devicebound/#", identity.device_id),
        }
    }

    pub fn twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    pub fn twin_patch_reported_topic(request_id: &str, version: Option<u64>) -> String {
        match version {
            Some(version) => format!(
                "$iothub/twin/PATCH/properties/reported/?$rid={request_id}&$version={version}"
            ),
            None => format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}"),
        }
    }

    pub fn method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }
}

/// Form encoding with spaces as `%20`; the hub does not read `+` as a space
fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// System properties first, then user properties in insertion order
pub fn encode_properties(message: &Message) -> String {
    let mut pairs: Vec<(&str, &str)> = vec![
        (MESSAGE_ID_KEY, message.message_id()),
        (CORRELATION_ID_KEY, message.correlation_id()),
    ];
    if let Some(content_type) = message.content_type() {
        pairs.push((CONTENT_TYPE_KEY, content_type));
    }
    if let Some(content_encoding) = message.content_encoding() {
        pairs.push((CONTENT_ENCODING_KEY, content_encoding));
    }
    if let Some(output_name) = message.output_name() {
        pairs.push((OUTPUT_NAME_KEY, output_name));
    }
    pairs.extend(
        message
            .properties()
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );

    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Split a property string into decoded pairs; every non-empty segment needs a `=`
pub fn parse_properties(encoded: &str) -> TransportResult<Vec<(String, String)>> {
    let encoded = encoded.strip_prefix('?').unwrap_or(encoded);
    let mut pairs = Vec::new();
    for segment in encoded.split('&').filter(|segment| !segment.is_empty()) {
        if !segment.contains('=') {
            return Err(TransportError::protocol(format!(
                "Unexpected property string format: {segment:?}"
            )));
        }
        if let Some((key, value)) = form_urlencoded::parse(segment.as_bytes()).next() {
            pairs.push((key.into_owned(), value.into_owned()));
        }
    }
    Ok(pairs)
}

/// Map decoded topic properties onto an inbound message
pub fn apply_inbound_properties(message: &mut Message, properties: Vec<(String, String)>) {
    for (key, value) in properties {
        match key.as_str() {
            MESSAGE_ID_KEY => message.set_message_id(value),
            CORRELATION_ID_KEY => message.set_correlation_id(value),
            CONTENT_TYPE_KEY => message.set_content_type(value),
            CONTENT_ENCODING_KEY => message.set_content_encoding(value),
            TO_KEY | USER_ID_KEY | EXPIRY_KEY | ACK_KEY | OUTPUT_NAME_KEY => {}
            _ => message.set_inbound_property(key, value),
        }
    }
}

/// Every topic the hub may publish to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    TwinResponse {
        status: u16,
        request_id: String,
        version: Option<u64>,
    },
    TwinDesiredPatch {
        version: Option<u64>,
    },
    MethodRequest {
        method_name: String,
        request_id: String,
    },
    Telemetry {
        device_id: String,
        module_id: Option<String>,
        input_name: Option<String>,
        properties: Vec<(String, String)>,
    },
}

fn query_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

fn parse_version(pairs: &[(String, String)]) -> TransportResult<Option<u64>> {
    query_value(pairs, VERSION_KEY)
        .map(|version| {
            version
                .parse::<u64>()
                .map_err(|_| TransportError::protocol(format!("Twin version is not numeric: {version}")))
        })
        .transpose()
}

fn query_of(rest: &str) -> &str {
    rest.split_once('?').map(|(_, query)| query).unwrap_or("")
}

/// Match an inbound topic against exactly one known prefix
pub fn classify(topic: &str) -> TransportResult<InboundTopic> {
    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        return parse_twin_response(rest);
    }
    if let Some(rest) = topic.strip_prefix(TWIN_DESIRED_PREFIX) {
        let pairs = parse_properties(query_of(rest))?;
        return Ok(InboundTopic::TwinDesiredPatch {
            version: parse_version(&pairs)?,
        });
    }
    if let Some(rest) = topic.strip_prefix(METHOD_REQUEST_PREFIX) {
        return parse_method_request(rest);
    }
    if let Some(rest) = topic.strip_prefix(DEVICES_PREFIX) {
        return parse_device_topic(rest);
    }
    Err(TransportError::protocol(format!("Unrecognised topic: {topic}")))
}

fn parse_twin_response(rest: &str) -> TransportResult<InboundTopic> {
    let status_segment = rest.split('/').next().unwrap_or("");
    if status_segment.is_empty() {
        return Err(TransportError::protocol("Twin response has no status"));
    }
    if status_segment.len() != 3 || !status_segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransportError::protocol(format!(
            "Status could not be parsed: {status_segment:?}"
        )));
    }
    let status = status_segment
        .parse::<u16>()
        .map_err(|_| TransportError::protocol("Status could not be parsed"))?;

    let pairs = parse_properties(query_of(rest))?;
    let request_id = query_value(&pairs, REQUEST_ID_KEY)
        .filter(|rid| !rid.is_empty())
        .ok_or_else(|| TransportError::protocol("Twin response has no request id"))?
        .to_string();

    Ok(InboundTopic::TwinResponse {
        status,
        request_id,
        version: parse_version(&pairs)?,
    })
}

fn parse_method_request(rest: &str) -> TransportResult<InboundTopic> {
    let method_name = rest.split('/').next().unwrap_or("");
    if method_name.is_empty() || method_name.starts_with('?') {
        return Err(TransportError::protocol("Method request has no method name"));
    }

    let pairs = parse_properties(query_of(rest))?;
    let request_id = query_value(&pairs, REQUEST_ID_KEY)
        .filter(|rid| !rid.is_empty())
        .ok_or_else(|| TransportError::protocol("Method request has no request id"))?
        .to_string();

    Ok(InboundTopic::MethodRequest {
        method_name: method_name.to_string(),
        request_id,
    })
}

fn parse_device_topic(rest: &str) -> TransportResult<InboundTopic> {
    let mut segments = rest.splitn(2, '/');
    let device_id = segments.next().unwrap_or("");
    let remainder = segments.next().unwrap_or("");
    if device_id.is_empty() {
        return Err(TransportError::protocol("Device topic has no device id"));
    }

    if let Some(props) = remainder.strip_prefix("messages/devicebound/") {
        return Ok(InboundTopic::Telemetry {
            device_id: device_id.to_string(),
            module_id: None,
            input_name: None,
            properties: parse_properties(props)?,
        });
    }

    if let Some(module_rest) = remainder.strip_prefix("modules/") {
        let mut parts = module_rest.splitn(4, '/');
        let module_id = parts.next().unwrap_or("");
        let marker = parts.next().unwrap_or("");
        let input_name = parts.next().unwrap_or("");
        let props = parts.next().unwrap_or("");
        if !module_id.is_empty() && marker == "inputs" && !input_name.is_empty() {
            return Ok(InboundTopic::Telemetry {
                device_id: device_id.to_string(),
                module_id: Some(module_id.to_string()),
                input_name: Some(input_name.to_string()),
                properties: parse_properties(props)?,
            });
        }
    }

    Err(TransportError::protocol(format!(
        "Unrecognised device topic: devices/{rest}"
    )))
}

/// Build the inbound message for a telemetry topic
pub fn telemetry_message(topic: InboundTopic, payload: bytes::Bytes) -> Option<Message> {
    match topic {
        InboundTopic::Telemetry {
            device_id,
            module_id,
            input_name,
            properties,
        } => {
            let mut message = Message::inbound(payload, DeviceOperation::Telemetry)
                .with_device_id(device_id);
            if let Some(module_id) = module_id {
                message = message.with_module_id(module_id);
            }
            if let Some(input_name) = input_name {
                message.set_input_name(input_name);
            }
            apply_inbound_properties(&mut message, properties);
            Some(message)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new("hub.azure-devices.net", "dev1")
    }

    #[test]
    fn test_telemetry_topic_layout() {
        let message = Message::new("x")
            .with_message_id("m1")
            .with_correlation_id("c1")
            .with_property("k1", "v1")
            .unwrap();

        assert_eq!(
            TopicBuilder::telemetry_topic(&device(), &message),
            "devices/dev1/messages/events/%24.mid=m1&%24.cid=c1&k1=v1"
        );
    }

    #[test]
    fn test_space_in_property_is_percent_encoded() {
        let message = Message::new("x")
            .with_message_id("m1")
            .with_correlation_id("c1")
            .with_property("k", "a b+c")
            .unwrap();

        let topic = TopicBuilder::telemetry_topic(&device(), &message);

        assert_eq!(
            topic,
            "devices/dev1/messages/events/%24.mid=m1&%24.cid=c1&k=a%20b%2Bc"
        );
        let inbound_topic = topic.replace("/messages/events/", "/messages/devicebound/");
        let parsed = classify(&inbound_topic).unwrap();
        let inbound = telemetry_message(parsed, bytes::Bytes::new()).unwrap();
        assert_eq!(inbound.property("k"), Some("a b+c"));
    }

    #[test]
    fn test_module_topics() {
        let module = device().with_module("filter");
        let message = Message::new("x")
            .with_message_id("m1")
            .with_correlation_id("c1")
            .with_output_name("out1");

        assert_eq!(
            TopicBuilder::telemetry_topic(&module, &message),
            "devices/dev1/modules/filter/messages/events/%24.mid=m1&%24.cid=c1&%24.on=out1"
        );
        assert_eq!(
            TopicBuilder::cloud_to_device_subscription(&module),
            "devices/dev1/modules/filter/inputs/#"
        );
        assert_eq!(
            TopicBuilder::cloud_to_device_subscription(&device()),
            "devices/dev1/messages/devicebound/#"
        );
    }

    #[test]
    fn test_twin_and_method_topics() {
        assert_eq!(TopicBuilder::twin_get_topic("7"), "$iothub/twin/GET/?$rid=7");
        assert_eq!(
            TopicBuilder::twin_patch_reported_topic("8", Some(3)),
            "$iothub/twin/PATCH/properties/reported/?$rid=8&$version=3"
        );
        assert_eq!(
            TopicBuilder::twin_patch_reported_topic("8", None),
            "$iothub/twin/PATCH/properties/reported/?$rid=8"
        );
        assert_eq!(
            TopicBuilder::method_response_topic(200, "9"),
            "$iothub/methods/res/200/?$rid=9"
        );
    }

    #[test]
    fn test_round_trip_properties_and_ids() {
        let outbound = Message::new("payload")
            .with_message_id("m1")
            .with_correlation_id("c1")
            .with_property("k1", "v1")
            .unwrap();
        let topic = TopicBuilder::telemetry_topic(&device(), &outbound);
        let suffix = topic.strip_prefix("devices/dev1/messages/events/").unwrap();

        let inbound_topic = format!("devices/dev1/messages/devicebound/{suffix}");
        let parsed = classify(&inbound_topic).unwrap();
        let inbound = telemetry_message(parsed, bytes::Bytes::from_static(b"payload")).unwrap();

        assert_eq!(inbound.message_id(), "m1");
        assert_eq!(inbound.correlation_id(), "c1");
        assert_eq!(inbound.properties(), outbound.properties());
        assert_eq!(inbound.device_id(), Some("dev1"));
    }

    #[test]
    fn test_hub_set_properties_ignored() {
        let parsed = classify(
            "devices/dev1/messages/devicebound/%24.to=%2Fdevices%2Fdev1%2Fmessages%2Fdevicebound&%24.uid=svc&iothub-ack=full&%24.ct=application%2Fjson&color=red",
        )
        .unwrap();
        let message = telemetry_message(parsed, bytes::Bytes::new()).unwrap();

        assert_eq!(message.content_type(), Some("application/json"));
        assert_eq!(message.property("color"), Some("red"));
        assert_eq!(message.properties().len(), 1);
    }

    #[test]
    fn test_module_input_topic() {
        let parsed = classify("devices/dev1/modules/filter/inputs/input1/%24.mid=m2").unwrap();
        let message = telemetry_message(parsed, bytes::Bytes::new()).unwrap();

        assert_eq!(message.input_name(), Some("input1"));
        assert_eq!(message.module_id(), Some("filter"));
        assert_eq!(message.message_id(), "m2");
    }

    #[test]
    fn test_property_segment_without_equals_is_error() {
        assert!(matches!(
            parse_properties("a=1&broken&b=2"),
            Err(TransportError::Protocol(_))
        ));
        assert!(parse_properties("").unwrap().is_empty());
    }

    #[test]
    fn test_twin_response_parsing() {
        assert_eq!(
            classify("$iothub/twin/res/200/?$rid=5&$version=12").unwrap(),
            InboundTopic::TwinResponse {
                status: 200,
                request_id: "5".to_string(),
                version: Some(12),
            }
        );
        assert_eq!(
            classify("$iothub/twin/res/204/?$rid=6").unwrap(),
            InboundTopic::TwinResponse {
                status: 204,
                request_id: "6".to_string(),
                version: None,
            }
        );
    }

    #[test]
    fn test_malformed_twin_responses_are_errors() {
        for topic in [
            "$iothub/twin/res//?$rid=5",
            "$iothub/twin/res/20x/?$rid=5",
            "$iothub/twin/res/2000/?$rid=5",
            "$iothub/twin/res/200/?$version=3",
        ] {
            assert!(
                matches!(classify(topic), Err(TransportError::Protocol(_))),
                "{topic} should be rejected"
            );
        }
    }

    #[test]
    fn test_desired_patch_parsing() {
        assert_eq!(
            classify("$iothub/twin/PATCH/properties/desired/?$version=42").unwrap(),
            InboundTopic::TwinDesiredPatch { version: Some(42) }
        );
    }

    #[test]
    fn test_method_request_parsing() {
        assert_eq!(
            classify("$iothub/methods/POST/reboot/?$rid=17").unwrap(),
            InboundTopic::MethodRequest {
                method_name: "reboot".to_string(),
                request_id: "17".to_string(),
            }
        );
        assert!(classify("$iothub/methods/POST/?$rid=17").is_err());
        assert!(classify("$iothub/methods/POST/reboot/").is_err());
    }

    #[test]
    fn test_unknown_topics_are_errors() {
        for topic in ["$iothub/unknown", "other/topic", "devices//messages/devicebound/"] {
            assert!(classify(topic).is_err(), "{topic} should be rejected");
        }
    }

    proptest! {
        #[test]
        fn prop_user_properties_survive_encoding(
            entries in proptest::collection::vec(("[a-z][a-z0-9]{0,8}", "[ -~]{0,16}"), 0..6)
        ) {
            let mut message = Message::new("x");
            for (name, value) in &entries {
                let _ = message.set_property(name.clone(), value.clone());
            }
            let decoded = parse_properties(&encode_properties(&message)).unwrap();
            let user: Vec<_> = decoded.into_iter().skip(2).collect();
            prop_assert_eq!(user.as_slice(), message.properties());
        }
    }
}
