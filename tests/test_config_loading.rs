//! Configuration loading and validation tests
//!
//! Tests cover what a user observes when loading a device file: defaults, derived client
//! options and the errors for malformed or incomplete files.

use iothub_device::config::{ClientConfig, ConfigError};
use iothub_device::{Credential, Protocol};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
hostname = "my-hub.azure-devices.net"
device_id = "thermostat-1"
shared_access_key_env = "IOTHUB_DEVICE_KEY"

[transport]
protocol = "mqtt_ws"
send_interval_ms = 20
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.hostname, "my-hub.azure-devices.net");
    assert_eq!(config.device.device_id, "thermostat-1");
    assert_eq!(config.transport.protocol, Protocol::MqttWs);
    assert_eq!(config.client_options().send_interval, Duration::from_millis(20));
    assert_eq!(
        config.identity().resource_uri(),
        "my-hub.azure-devices.net/devices/thermostat-1"
    );
}

#[test]
fn test_module_identity_from_file() {
    let temp_file = write_config(
        r#"
[device]
hostname = "my-hub.azure-devices.net"
device_id = "edge-1"
module_id = "filter"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(
        config.identity().resource_uri(),
        "my-hub.azure-devices.net/devices/edge-1/modules/filter"
    );
    assert!(matches!(config.credential(), Ok(Credential::X509)));
}

#[test]
fn test_config_file_not_found() {
    let result = ClientConfig::load_from_file(std::path::Path::new("/nonexistent/device.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_invalid_toml_syntax() {
    let temp_file = write_config("[device\nhostname = ");

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_missing_device_section() {
    let temp_file = write_config("[transport]\nprotocol = \"mqtt\"\n");

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unknown_protocol_rejected() {
    let temp_file = write_config(
        r#"
[device]
hostname = "my-hub.azure-devices.net"
device_id = "d1"

[transport]
protocol = "carrier_pigeon"
"#,
    );

    assert!(ClientConfig::load_from_file(temp_file.path()).is_err());
}

#[test]
fn test_invalid_device_id_rejected_on_load() {
    let temp_file = write_config(
        r#"
[device]
hostname = "my-hub.azure-devices.net"
device_id = "has spaces"
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
}

#[test]
fn test_empty_hostname_rejected() {
    let temp_file = write_config(
        r#"
[device]
hostname = "  "
device_id = "d1"
"#,
    );

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[device]
hostname = "my-hub.azure-devices.net"
device_id = "d1"
sas_token_env = "IOTHUB_SAS_TOKEN"

[retry]
max_retries = 3
"#,
    );
    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = ClientConfig::from_toml(&rendered).unwrap();

    assert_eq!(reparsed, config);
    assert!(rendered.contains("IOTHUB_SAS_TOKEN"));
}
