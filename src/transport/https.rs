//! HTTPS binding for IoT Hub
//!
//! Every operation is one request/response exchange, so sends complete synchronously and
//! there is no connection to lose. Cloud-to-device messages are polled and then completed
//! with a DELETE on their etag.

use crate::auth::DeviceIdentity;
use crate::error::{TransportError, TransportResult};
use crate::message::{DeviceOperation, Message};
use crate::status::IotHubStatusCode;
use crate::transport::mqtt::API_VERSION;
use crate::transport::{Protocol, ProtocolBinding, SendOutcome, SessionCredentials, Subscription};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.iothub.json";
pub const APP_PROPERTY_PREFIX: &str = "iothub-app-";
const MESSAGE_ID_HEADER: &str = "iothub-messageid";
const CORRELATION_ID_HEADER: &str = "iothub-correlationid";
const TO_HEADER: &str = "iothub-to";
const CONTENT_TYPE_HEADER: &str = "content-type";
const CONTENT_ENCODING_HEADER: &str = "content-encoding";
const ETAG_HEADER: &str = "etag";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsMethod {
    Get,
    Post,
    Delete,
}

/// One request against the hub; `path` includes the query string
#[derive(Debug, Clone, PartialEq)]
pub struct HttpsRequest {
    pub method: HttpsMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpsResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpsResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Network capability the HTTPS binding needs from a client library
#[async_trait]
pub trait HttpsLink: Send + Sync {
    async fn execute(&self, request: HttpsRequest) -> TransportResult<HttpsResponse>;
}

/// reqwest-backed HTTPS link
pub struct ReqwestHttpsLink {
    client: Client,
    base_url: Url,
}

impl ReqwestHttpsLink {
    pub fn new(hostname: &str) -> TransportResult<Self> {
        Self::with_base_url(&format!("https://{hostname}"))
    }

    /// Point the link at an arbitrary origin
    pub fn with_base_url(base_url: &str) -> TransportResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::fatal_connection(format!("Invalid hub URL {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::fatal_connection(e.to_string()))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl HttpsLink for ReqwestHttpsLink {
    async fn execute(&self, request: HttpsRequest) -> TransportResult<HttpsResponse> {
        let url = self
            .base_url
            .join(&request.path)
            .map_err(|e| TransportError::protocol(format!("Invalid request path: {e}")))?;
        let method = match request.method {
            HttpsMethod::Get => reqwest::Method::GET,
            HttpsMethod::Post => reqwest::Method::POST,
            HttpsMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    TransportError::protocol(format!("Request could not be built: {e}"))
                } else if e.is_timeout() {
                    TransportError::Timeout(format!("HTTPS request timed out: {e}"))
                } else {
                    warn!(
                        "HTTPS request failed (is_connect: {}, is_request: {})",
                        e.is_connect(),
                        e.is_request()
                    );
                    TransportError::connection(format!("HTTPS request failed: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("Response body lost: {e}")))?;

        Ok(HttpsResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    body: String,
    #[serde(rename = "base64Encoded")]
    base64_encoded: bool,
    properties: serde_json::Map<String, serde_json::Value>,
}

fn device_path(identity: &DeviceIdentity) -> String {
    match &identity.module_id {
        Some(module_id) => format!("/devices/{}/modules/{}", identity.device_id, module_id),
        None => format!("/devices/{}", identity.device_id),
    }
}

/// Property headers carried by a single telemetry request
fn message_headers(message: &Message) -> Vec<(String, String)> {
    let mut headers = vec![
        (MESSAGE_ID_HEADER.to_string(), message.message_id().to_string()),
        (
            CORRELATION_ID_HEADER.to_string(),
            message.correlation_id().to_string(),
        ),
    ];
    if let Some(content_type) = message.content_type() {
        headers.push((CONTENT_TYPE_HEADER.to_string(), content_type.to_string()));
    }
    if let Some(content_encoding) = message.content_encoding() {
        headers.push((
            CONTENT_ENCODING_HEADER.to_string(),
            content_encoding.to_string(),
        ));
    }
    headers.extend(
        message
            .properties()
            .iter()
            .map(|(name, value)| (format!("{APP_PROPERTY_PREFIX}{name}"), value.clone())),
    );
    headers
}

/// Serialized batch body: one entry per message with its body base64 encoded
pub fn batch_body(messages: &[Message]) -> TransportResult<Bytes> {
    let entries: Vec<BatchEntry> = messages
        .iter()
        .map(|message| {
            let properties = message_headers(message)
                .into_iter()
                .filter(|(name, _)| name != CONTENT_TYPE_HEADER && name != CONTENT_ENCODING_HEADER)
                .map(|(name, value)| (name, serde_json::Value::String(value)))
                .collect();
            BatchEntry {
                body: BASE64.encode(message.body()),
                base64_encoded: true,
                properties,
            }
        })
        .collect();
    Ok(Bytes::from(serde_json::to_vec(&entries)?))
}

fn check_status(response: &HttpsResponse, action: &str) -> TransportResult<IotHubStatusCode> {
    let status = IotHubStatusCode::from_http_status(response.status);
    if status.is_success() {
        Ok(status)
    } else {
        let detail = String::from_utf8_lossy(&response.body);
        Err(TransportError::service(
            status,
            format!("{action} returned HTTP {}: {detail}", response.status),
        ))
    }
}

pub struct HttpsBinding<L: HttpsLink> {
    link: L,
    session: Option<SessionCredentials>,
    receive_enabled: bool,
}

impl<L: HttpsLink> HttpsBinding<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            session: None,
            receive_enabled: false,
        }
    }

    fn session(&self) -> TransportResult<&SessionCredentials> {
        self.session
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionLost("HTTPS binding is not open".to_string()))
    }

    fn request(
        &self,
        method: HttpsMethod,
        path: String,
        mut headers: Vec<(String, String)>,
        body: Bytes,
    ) -> TransportResult<HttpsRequest> {
        let session = self.session()?;
        if let Some(token) = &session.sas_token {
            headers.push(("authorization".to_string(), token.clone()));
        }
        Ok(HttpsRequest {
            method,
            path: format!("{path}?api-version={API_VERSION}"),
            headers,
            body,
        })
    }

    fn events_path(&self) -> TransportResult<String> {
        Ok(format!(
            "{}/messages/events",
            device_path(&self.session()?.identity)
        ))
    }

    fn inbound_message(response: &HttpsResponse, identity: &DeviceIdentity) -> Message {
        let mut message = Message::inbound(response.body.clone(), DeviceOperation::Telemetry)
            .with_device_id(identity.device_id.clone());
        if let Some(module_id) = &identity.module_id {
            message = message.with_module_id(module_id.clone());
        }
        for (name, value) in &response.headers {
            let lower = name.to_ascii_lowercase();
            if lower == MESSAGE_ID_HEADER {
                message.set_message_id(value.clone());
            } else if lower == CORRELATION_ID_HEADER {
                message.set_correlation_id(value.clone());
            } else if lower == CONTENT_TYPE_HEADER {
                message.set_content_type(value.clone());
            } else if lower == CONTENT_ENCODING_HEADER {
                message.set_content_encoding(value.clone());
            } else if let Some(property) = lower.strip_prefix(APP_PROPERTY_PREFIX) {
                message.set_inbound_property(property.to_string(), value.clone());
            }
        }
        message
    }
}

#[async_trait]
impl<L: HttpsLink> ProtocolBinding for HttpsBinding<L> {
    fn protocol(&self) -> Protocol {
        Protocol::Https
    }

    /// No connection is made; the session is kept for the requests that follow
    async fn open(&mut self, sessions: &[SessionCredentials]) -> TransportResult<()> {
        let [session] = sessions else {
            return Err(TransportError::unsupported(format!(
                "HTTPS carries exactly one device session, got {}",
                sessions.len()
            )));
        };
        self.session = Some(session.clone());
        info!(device = %session.identity, "HTTPS binding ready");
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.session = None;
        self.receive_enabled = false;
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> TransportResult<SendOutcome> {
        if message.operation() != DeviceOperation::Telemetry {
            return Err(TransportError::unsupported(format!(
                "{:?} is not available over HTTPS",
                message.operation()
            )));
        }

        let path = self.events_path()?;
        let mut headers = message_headers(message);
        headers.push((TO_HEADER.to_string(), path.clone()));
        let request = self.request(HttpsMethod::Post, path, headers, message.body().clone())?;

        let response = self.link.execute(request).await?;
        let status = check_status(&response, "Telemetry POST")?;
        debug!(message_id = %message.message_id(), http_status = response.status, "HTTPS telemetry sent");
        Ok(SendOutcome::Completed(status))
    }

    async fn send_batch(&mut self, messages: &[Message]) -> TransportResult<IotHubStatusCode> {
        if let Some(other) = messages
            .iter()
            .find(|message| message.operation() != DeviceOperation::Telemetry)
        {
            return Err(TransportError::unsupported(format!(
                "{:?} cannot be batched",
                other.operation()
            )));
        }

        let path = self.events_path()?;
        let headers = vec![
            (CONTENT_TYPE_HEADER.to_string(), BATCH_CONTENT_TYPE.to_string()),
            (TO_HEADER.to_string(), path.clone()),
        ];
        let request = self.request(HttpsMethod::Post, path, headers, batch_body(messages)?)?;

        let response = self.link.execute(request).await?;
        let status = check_status(&response, "Batch POST")?;
        debug!(count = messages.len(), "HTTPS batch sent");
        Ok(status)
    }

    async fn receive(&mut self) -> TransportResult<Option<Message>> {
        if !self.receive_enabled {
            return Ok(None);
        }
        let identity = self.session()?.identity.clone();
        let bound_path = format!("{}/messages/deviceBound", device_path(&identity));

        let request = self.request(HttpsMethod::Get, bound_path.clone(), Vec::new(), Bytes::new())?;
        let response = self.link.execute(request).await?;
        if response.status == 204 {
            return Ok(None);
        }
        check_status(&response, "Cloud-to-device GET")?;

        let etag = response
            .header(ETAG_HEADER)
            .map(|etag| etag.trim_matches('"').to_string())
            .filter(|etag| !etag.is_empty())
            .ok_or_else(|| TransportError::protocol("Cloud-to-device message has no etag"))?;
        let message = Self::inbound_message(&response, &identity);

        let complete = self.request(
            HttpsMethod::Delete,
            format!("{bound_path}/{etag}"),
            Vec::new(),
            Bytes::new(),
        )?;
        let completion = self.link.execute(complete).await?;
        check_status(&completion, "Cloud-to-device completion")?;

        debug!(message_id = %message.message_id(), "HTTPS cloud-to-device message completed");
        Ok(Some(message))
    }

    async fn subscribe(&mut self, subscription: Subscription) -> TransportResult<()> {
        match subscription {
            Subscription::CloudToDevice => {
                self.session()?;
                self.receive_enabled = true;
                Ok(())
            }
            other => Err(TransportError::unsupported(format!(
                "{other:?} is not available over HTTPS"
            ))),
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}
