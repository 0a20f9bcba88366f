//! The message envelope exchanged with the hub
//!
//! A single `Message` value carries telemetry, twin and method traffic. What kind of traffic it
//! is comes from `kind` plus `operation`, not from a type hierarchy.

use crate::error::MessageError;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property names owned by the hub or by the protocol mappings; users cannot set them
pub const RESERVED_PROPERTY_NAMES: &[&str] = &[
    "message-id",
    "correlation-id",
    "content-type",
    "content-encoding",
    "to",
    "user-id",
    "absolute-expiry-time",
    "creation-time",
    "iothub-ack",
    "iothub-enqueuedtime",
    "iothub-messagelocktoken",
    "iothub-sequencenumber",
    "iothub-deliverycount",
    "iothub-connection-device-id",
    "iothub-connection-module-id",
    "iothub-connection-auth-method",
    "iothub-connection-auth-generation-id",
    "iothub-creation-time-utc",
    "iothub-app-",
    "$.mid",
    "$.cid",
    "$.to",
    "$.uid",
    "$.exp",
    "$.ct",
    "$.ce",
    "$.on",
];

/// Traffic family a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Telemetry,
    Twin,
    Methods,
    Unknown,
}

/// What a twin or method message does on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOperation {
    /// Plain device-to-cloud or cloud-to-device message
    Telemetry,
    TwinGetRequest,
    TwinGetResponse,
    TwinUpdateReportedRequest,
    TwinUpdateReportedResponse,
    /// Unsolicited desired-property notification
    TwinDesiredPatch,
    MethodReceiveRequest,
    MethodSendResponse,
}

impl DeviceOperation {
    pub fn kind(&self) -> MessageKind {
        match self {
            DeviceOperation::Telemetry => MessageKind::Telemetry,
            DeviceOperation::TwinGetRequest
            | DeviceOperation::TwinGetResponse
            | DeviceOperation::TwinUpdateReportedRequest
            | DeviceOperation::TwinUpdateReportedResponse
            | DeviceOperation::TwinDesiredPatch => MessageKind::Twin,
            DeviceOperation::MethodReceiveRequest | DeviceOperation::MethodSendResponse => {
                MessageKind::Methods
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_id: String,
    correlation_id: String,
    body: Bytes,
    properties: Vec<(String, String)>,
    kind: MessageKind,
    operation: DeviceOperation,
    device_id: Option<String>,
    module_id: Option<String>,
    input_name: Option<String>,
    output_name: Option<String>,
    expiry: Option<DateTime<Utc>>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    request_id: Option<String>,
    status: Option<u16>,
    method_name: Option<String>,
    version: Option<u64>,
}

impl Message {
    /// Telemetry message with fresh message and correlation ids
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self::with_operation(body, DeviceOperation::Telemetry)
    }

    fn with_operation(body: impl Into<Bytes>, operation: DeviceOperation) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            body: body.into(),
            properties: Vec::new(),
            kind: operation.kind(),
            operation,
            device_id: None,
            module_id: None,
            input_name: None,
            output_name: None,
            expiry: None,
            content_type: None,
            content_encoding: None,
            request_id: None,
            status: None,
            method_name: None,
            version: None,
        }
    }

    /// Request for the full twin document
    pub fn twin_get() -> Self {
        let mut message = Self::with_operation(Bytes::new(), DeviceOperation::TwinGetRequest);
        message.request_id = Some(Uuid::new_v4().to_string());
        message
    }

    /// Reported-properties patch; `version` is only sent when present
    pub fn twin_reported_patch(body: impl Into<Bytes>, version: Option<u64>) -> Self {
        let mut message = Self::with_operation(body, DeviceOperation::TwinUpdateReportedRequest);
        message.request_id = Some(Uuid::new_v4().to_string());
        message.version = version;
        message
    }

    /// Answer to a direct method request previously received with `request_id`
    pub fn method_response(request_id: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
        let mut message = Self::with_operation(body, DeviceOperation::MethodSendResponse);
        message.request_id = Some(request_id.into());
        message.status = Some(status);
        message
    }

    /// Inbound message built by a binding; property checks do not apply to hub-set values
    pub(crate) fn inbound(body: impl Into<Bytes>, operation: DeviceOperation) -> Self {
        Self::with_operation(body, operation)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn operation(&self) -> DeviceOperation {
        self.operation
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    pub fn input_name(&self) -> Option<&str> {
        self.input_name.as_deref()
    }

    pub fn output_name(&self) -> Option<&str> {
        self.output_name.as_deref()
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Service status of a twin response, or the status of a method response
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    /// Twin document version carried by patches and responses
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Expire the message `ttl` from now
    pub fn with_ttl(self, ttl: std::time::Duration) -> Self {
        let expiry = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_expiry(expiry)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    /// Route the message to a module output
    pub fn with_output_name(mut self, output_name: impl Into<String>) -> Self {
        self.output_name = Some(output_name.into());
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub(crate) fn set_input_name(&mut self, input_name: impl Into<String>) {
        self.input_name = Some(input_name.into());
    }

    pub(crate) fn set_request_id(&mut self, request_id: impl Into<String>) {
        self.request_id = Some(request_id.into());
    }

    pub(crate) fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub(crate) fn set_method_name(&mut self, method_name: impl Into<String>) {
        self.method_name = Some(method_name.into());
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    pub(crate) fn set_message_id(&mut self, message_id: impl Into<String>) {
        self.message_id = message_id.into();
    }

    pub(crate) fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
        self.correlation_id = correlation_id.into();
    }

    pub(crate) fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub(crate) fn set_content_encoding(&mut self, content_encoding: impl Into<String>) {
        self.content_encoding = Some(content_encoding.into());
    }

    pub(crate) fn set_expiry(&mut self, expiry: DateTime<Utc>) {
        self.expiry = Some(expiry);
    }

    /// Set or replace a user property
    ///
    /// Names are matched case-insensitively; the first insertion position is kept.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MessageError> {
        let name = name.into();
        let value = value.into();
        validate_property(&name, &value)?;
        self.upsert_property(name, value);
        Ok(())
    }

    /// Builder form of [`Message::set_property`]
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, MessageError> {
        self.set_property(name, value)?;
        Ok(self)
    }

    /// Property set by the hub on an inbound message; no reserved-name check
    pub(crate) fn set_inbound_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.upsert_property(name.into(), value.into());
    }

    fn upsert_property(&mut self, name: String, value: String) {
        match self
            .properties
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.properties.push((name, value)),
        }
    }

    /// Case-insensitive property lookup
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// User properties in insertion order
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|expiry| now >= expiry).unwrap_or(false)
    }
}

/// Reject empty, non-ASCII and reserved names plus non-ASCII values
pub fn validate_property(name: &str, value: &str) -> Result<(), MessageError> {
    if name.is_empty() || !is_seven_bit_ascii(name) {
        return Err(MessageError::InvalidPropertyName(name.to_string()));
    }
    if is_reserved_property_name(name) {
        return Err(MessageError::ReservedPropertyName(name.to_string()));
    }
    if !is_seven_bit_ascii(value) {
        return Err(MessageError::InvalidPropertyValue {
            name: name.to_string(),
        });
    }
    Ok(())
}

pub fn is_reserved_property_name(name: &str) -> bool {
    RESERVED_PROPERTY_NAMES.iter().any(|reserved| {
        if reserved.ends_with('-') {
            name.get(..reserved.len())
                .map(|prefix| prefix.eq_ignore_ascii_case(reserved))
                .unwrap_or(false)
        } else {
            reserved.eq_ignore_ascii_case(name)
        }
    })
}

fn is_seven_bit_ascii(text: &str) -> bool {
    text.bytes().all(|b| b.is_ascii() && !b.is_ascii_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_message_defaults() {
        let message = Message::new("hello");

        assert_eq!(message.body().as_ref(), b"hello");
        assert_eq!(message.kind(), MessageKind::Telemetry);
        assert!(!message.message_id().is_empty());
        assert!(!message.correlation_id().is_empty());
        assert_ne!(message.message_id(), message.correlation_id());
        assert!(message.expiry().is_none());
        assert!(!message.is_expired());
    }

    #[test]
    fn test_property_lookup_is_case_insensitive_and_ordered() {
        let mut message = Message::new("x");
        message.set_property("Zeta", "1").unwrap();
        message.set_property("alpha", "2").unwrap();
        message.set_property("ZETA", "3").unwrap();

        assert_eq!(message.property("zeta"), Some("3"));
        assert_eq!(message.property("ALPHA"), Some("2"));
        assert_eq!(
            message.properties(),
            &[
                ("Zeta".to_string(), "3".to_string()),
                ("alpha".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_reserved_property_names_rejected() {
        let mut message = Message::new("x");

        for name in ["message-id", "Correlation-ID", "$.mid", "iothub-app-temp", "iothub-ack"] {
            assert_eq!(
                message.set_property(name, "v"),
                Err(MessageError::ReservedPropertyName(name.to_string())),
                "{name} should be reserved"
            );
        }
        assert!(message.properties().is_empty());
    }

    #[test]
    fn test_non_ascii_rejected() {
        let mut message = Message::new("x");

        assert!(matches!(
            message.set_property("température", "1"),
            Err(MessageError::InvalidPropertyName(_))
        ));
        assert!(matches!(
            message.set_property("temp", "25°"),
            Err(MessageError::InvalidPropertyValue { .. })
        ));
        assert!(matches!(
            message.set_property("", "v"),
            Err(MessageError::InvalidPropertyName(_))
        ));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let message = Message::new("x").with_expiry(now);

        assert!(message.is_expired_at(now));
        assert!(!message.is_expired_at(now - ChronoDuration::milliseconds(1)));
    }

    #[test]
    fn test_ttl_sets_future_expiry() {
        let message = Message::new("x").with_ttl(std::time::Duration::from_secs(60));
        assert!(!message.is_expired());
        assert!(message.expiry().unwrap() > Utc::now());
    }

    #[test]
    fn test_twin_and_method_constructors() {
        let get = Message::twin_get();
        assert_eq!(get.kind(), MessageKind::Twin);
        assert_eq!(get.operation(), DeviceOperation::TwinGetRequest);
        assert!(get.request_id().is_some());
        assert!(get.body().is_empty());

        let patch = Message::twin_reported_patch(r#"{"temp":21}"#, Some(4));
        assert_eq!(patch.operation(), DeviceOperation::TwinUpdateReportedRequest);
        assert_eq!(patch.version(), Some(4));

        let response = Message::method_response("rid-7", 200, "{}");
        assert_eq!(response.kind(), MessageKind::Methods);
        assert_eq!(response.request_id(), Some("rid-7"));
        assert_eq!(response.status(), Some(200));
    }

    proptest! {
        #[test]
        fn prop_ascii_properties_accepted(
            name in "[a-zA-Z][a-zA-Z0-9_]{0,15}",
            value in "[ -~]{0,32}",
        ) {
            prop_assume!(!is_reserved_property_name(&name));
            let mut message = Message::new("x");
            prop_assert!(message.set_property(name.clone(), value.clone()).is_ok());
            prop_assert_eq!(message.property(&name.to_uppercase()), Some(value.as_str()));
        }
    }
}
