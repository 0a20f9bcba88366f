//! Client configuration loaded from TOML
//!
//! Secrets never live in the file: the shared access key and user-supplied SAS tokens are read
//! from the environment variables the file names.

use crate::auth::{Credential, DeviceIdentity, SasTokenProvider};
use crate::device_io::ClientOptions;
use crate::error::{TransportError, TransportResult};
use crate::retry::ExponentialBackoffWithJitter;
use crate::transport::Protocol;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Which device (or module) this client is
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Hub host name, e.g. `my-hub.azure-devices.net`
    pub hostname: String,
    pub device_id: String,
    pub module_id: Option<String>,
    /// Environment variable holding the base64 shared access key
    pub shared_access_key_env: Option<String>,
    /// Environment variable holding a complete SAS token; the client never renews it
    pub sas_token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub receive_interval_ms: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_renewal_threshold_percent")]
    pub renewal_threshold_percent: u8,
    #[serde(default)]
    pub https_batch: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            send_interval_ms: default_interval_ms(),
            receive_interval_ms: default_interval_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            token_ttl_secs: default_token_ttl_secs(),
            renewal_threshold_percent: default_renewal_threshold_percent(),
            https_batch: false,
        }
    }
}

fn default_protocol() -> Protocol {
    Protocol::Mqtt
}

fn default_interval_ms() -> u64 {
    10
}

fn default_operation_timeout_secs() -> u64 {
    240
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_renewal_threshold_percent() -> u8 {
    85
}

/// Exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Unlimited when absent
    pub max_retries: Option<u32>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter_ms() -> u64 {
    100
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

static DEVICE_ID_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-.%_*+?!(),:=@$']{1,128}$").ok());

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.device_id)?;
        if let Some(module_id) = &self.device.module_id {
            validate_device_id(module_id)?;
        }

        if self.device.hostname.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.hostname must not be empty".to_string(),
            ));
        }
        if self.device.shared_access_key_env.is_some() && self.device.sas_token_env.is_some() {
            return Err(ConfigError::InvalidConfig(
                "Set either device.shared_access_key_env or device.sas_token_env, not both"
                    .to_string(),
            ));
        }

        let transport = &self.transport;
        if !(1..=99).contains(&transport.renewal_threshold_percent) {
            return Err(ConfigError::InvalidConfig(format!(
                "transport.renewal_threshold_percent must be within 1..=99, got {}",
                transport.renewal_threshold_percent
            )));
        }
        if transport.send_interval_ms == 0 || transport.receive_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport intervals must be greater than zero".to_string(),
            ));
        }
        if transport.operation_timeout_secs == 0 || transport.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport timeouts must be greater than zero".to_string(),
            ));
        }
        if transport.https_batch && transport.protocol != Protocol::Https {
            return Err(ConfigError::InvalidConfig(format!(
                "transport.https_batch requires the https protocol, not {}",
                transport.protocol
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    pub fn identity(&self) -> DeviceIdentity {
        let identity = DeviceIdentity::new(&self.device.hostname, &self.device.device_id);
        match &self.device.module_id {
            Some(module_id) => identity.with_module(module_id),
            None => identity,
        }
    }

    /// Credential named by the device section; X.509 when neither variable is configured
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        if let Some(key_env) = &self.device.shared_access_key_env {
            return Ok(Credential::SymmetricKey(Self::get_env_var_required(key_env)?));
        }
        if let Some(token_env) = &self.device.sas_token_env {
            // Fail at load time rather than at the first open
            Self::get_env_var_required(token_env)?;
            return Ok(Credential::Provided(Arc::new(EnvSasTokenProvider {
                env_var: token_env.clone(),
            })));
        }
        Ok(Credential::X509)
    }

    pub fn client_options(&self) -> ClientOptions {
        let transport = &self.transport;
        ClientOptions {
            send_interval: Duration::from_millis(transport.send_interval_ms),
            receive_interval: Duration::from_millis(transport.receive_interval_ms),
            operation_timeout: Duration::from_secs(transport.operation_timeout_secs),
            https_batch: transport.https_batch,
            token_ttl: Duration::from_secs(transport.token_ttl_secs),
            renewal_threshold_percent: transport.renewal_threshold_percent,
        }
    }

    pub fn retry_policy(&self) -> ExponentialBackoffWithJitter {
        ExponentialBackoffWithJitter::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            Duration::from_millis(self.retry.jitter_ms),
        )
    }
}

/// Reads a finished SAS token from an environment variable on every open
#[derive(Debug, Clone)]
pub struct EnvSasTokenProvider {
    env_var: String,
}

impl SasTokenProvider for EnvSasTokenProvider {
    fn sas_token(&self) -> TransportResult<String> {
        std::env::var(&self.env_var).map_err(|_| {
            TransportError::Security(format!(
                "SAS token variable {} is not set",
                self.env_var
            ))
        })
    }
}

/// Device and module ids: up to 128 characters from the hub's allowed set
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid = DEVICE_ID_PATTERN
        .as_ref()
        .map(|pattern| pattern.is_match(device_id))
        .unwrap_or(false);

    if !valid {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must be 1-128 characters of [A-Za-z0-9-.%_*+?!(),:=@$']"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
hostname = "hub.azure-devices.net"
device_id = "dev1"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ClientConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.transport.protocol, Protocol::Mqtt);
        assert_eq!(config.transport.send_interval_ms, 10);
        assert_eq!(config.transport.operation_timeout_secs, 240);
        assert_eq!(config.transport.renewal_threshold_percent, 85);
        assert_eq!(config.retry.max_retries, None);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.client_options(), ClientOptions::default());
        assert_eq!(config.retry_policy(), ExponentialBackoffWithJitter::default());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
hostname = "hub.azure-devices.net"
device_id = "dev1"
module_id = "filter"
shared_access_key_env = "IOTHUB_DEVICE_KEY"

[transport]
protocol = "https"
receive_interval_ms = 25000
https_batch = true

[retry]
max_retries = 5
base_delay_ms = 50
"#;

        let config = ClientConfig::from_toml(toml_content).unwrap();
        let identity = config.identity();

        assert_eq!(identity.session_key(), "dev1/filter");
        assert_eq!(config.transport.protocol, Protocol::Https);
        assert!(config.client_options().https_batch);
        assert_eq!(
            config.client_options().receive_interval,
            Duration::from_millis(25000)
        );
        assert_eq!(config.retry_policy().max_retries, Some(5));
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("valid-device_1.test:2@x").is_ok());
        assert!(matches!(
            validate_device_id("bad/device"),
            Err(ConfigError::InvalidDeviceId(_))
        ));
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let toml_content = format!("{MINIMAL}\n[transport]\nrenewal_threshold_percent = 100\n");
        assert!(matches!(
            ClientConfig::from_toml(&toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_batch_requires_https() {
        let toml_content = format!("{MINIMAL}\n[transport]\nhttps_batch = true\n");
        assert!(ClientConfig::from_toml(&toml_content).is_err());
    }

    #[test]
    fn test_missing_key_variable() {
        let toml_content = r#"
[device]
hostname = "hub.azure-devices.net"
device_id = "dev1"
shared_access_key_env = "IOTHUB_TEST_KEY_THAT_IS_NEVER_SET"
"#;
        let config = ClientConfig::from_toml(toml_content).unwrap();

        assert!(matches!(
            config.credential(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "IOTHUB_TEST_KEY_THAT_IS_NEVER_SET"
        ));
    }

    #[test]
    fn test_no_secret_means_x509() {
        let config = ClientConfig::from_toml(MINIMAL).unwrap();
        assert!(matches!(config.credential(), Ok(Credential::X509)));
    }

    #[test]
    fn test_both_secrets_rejected() {
        let toml_content = r#"
[device]
hostname = "hub.azure-devices.net"
device_id = "dev1"
shared_access_key_env = "A"
sas_token_env = "B"
"#;
        assert!(ClientConfig::from_toml(toml_content).is_err());
    }
}
