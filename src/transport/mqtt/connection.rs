//! Pure connection configuration for the MQTT link
//!
//! Builds the IoT Hub connect credentials and the rumqttc options, and tracks the link state
//! reported by the event loop task.

use crate::auth::DeviceIdentity;
use crate::error::{TransportError, TransportResult};
use crate::transport::Protocol;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use url::Url;

/// Service API version announced in the MQTT username
pub const API_VERSION: &str = "2020-09-30";

const MQTT_TLS_PORT: u16 = 8883;
const MQTT_WS_PORT: u16 = 443;
const WEBSOCKET_PATH: &str = "/$iothub/websocket";

/// State of one link connection as seen by the event loop task
#[derive(Debug, Clone)]
pub enum LinkState {
    /// Waiting for ConnAck
    Connecting,
    Connected,
    /// Connection refused or dropped
    Failed(TransportError),
}

/// Everything needed to open one MQTT connection to the hub
#[derive(Clone, PartialEq, Eq)]
pub struct MqttConnectSettings {
    pub hostname: String,
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
    pub websocket: bool,
    pub keep_alive: Duration,
}

impl std::fmt::Debug for MqttConnectSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnectSettings")
            .field("hostname", &self.hostname)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("websocket", &self.websocket)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl MqttConnectSettings {
    /// Client id `{deviceId}[/{moduleId}]`, username `{host}/{clientId}/?api-version=...`
    pub fn for_identity(
        identity: &DeviceIdentity,
        protocol: Protocol,
        sas_token: Option<String>,
    ) -> Self {
        let client_id = identity.session_key();
        Self {
            hostname: identity.hostname.clone(),
            username: format!(
                "{}/{}/?api-version={API_VERSION}",
                identity.hostname, client_id
            ),
            client_id,
            password: sas_token,
            websocket: protocol == Protocol::MqttWs,
            keep_alive: Duration::from_secs(230),
        }
    }

    pub fn port(&self) -> u16 {
        if self.websocket {
            MQTT_WS_PORT
        } else {
            MQTT_TLS_PORT
        }
    }
}

fn validate_hostname(hostname: &str) -> TransportResult<String> {
    Url::parse(&format!("mqtts://{hostname}"))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .filter(|host| !host.is_empty() && host.eq_ignore_ascii_case(hostname))
        .ok_or_else(|| TransportError::fatal_connection(format!("Invalid hub hostname: {hostname:?}")))
}

/// Translate connect settings into rumqttc options
pub fn configure_mqtt_options(settings: &MqttConnectSettings) -> TransportResult<MqttOptions> {
    let host = validate_hostname(&settings.hostname)?;

    let mut mqtt_options = if settings.websocket {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            format!("wss://{host}:{MQTT_WS_PORT}{WEBSOCKET_PATH}"),
            MQTT_WS_PORT,
        );
        options.set_transport(RumqttcTransport::wss_with_default_config());
        options
    } else {
        let mut options = MqttOptions::new(settings.client_id.clone(), host, MQTT_TLS_PORT);
        options.set_transport(RumqttcTransport::tls_with_default_config());
        options
    };

    mqtt_options.set_credentials(
        settings.username.clone(),
        settings.password.clone().unwrap_or_default(),
    );
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_session(false);

    // Hub messages are capped at 256KB
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    Ok(mqtt_options)
}
