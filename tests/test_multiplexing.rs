//! Multiplexed AMQP connections carrying several device sessions

use iothub_device::testing::{MockAmqpLink, MockBinding};
use iothub_device::transport::amqp::{AmqpBinding, AmqpLinkKind};
use iothub_device::{
    ClientOptions, ConnectionRegistry, Credential, DeviceClientConfig, DeviceError,
    DeviceIdentity, DeviceIo, IotHubStatusCode, Message, MultiplexingClient, MultiplexingError,
    Protocol,
};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const HOST: &str = "hub.azure-devices.net";
const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

fn fast_options() -> ClientOptions {
    ClientOptions {
        send_interval: Duration::from_millis(1),
        receive_interval: Duration::from_millis(1),
        operation_timeout: Duration::from_secs(5),
        ..ClientOptions::default()
    }
}

fn device(device_id: &str, protocol: Protocol) -> DeviceClientConfig {
    DeviceClientConfig::new(
        DeviceIdentity::new(HOST, device_id),
        Credential::SymmetricKey(KEY.to_string()),
        protocol,
    )
}

fn devices(count: usize, protocol: Protocol) -> Vec<DeviceClientConfig> {
    (0..count)
        .map(|i| device(&format!("sensor-{i}"), protocol))
        .collect()
}

fn amqp_client(protocol: Protocol, registry: ConnectionRegistry) -> (MultiplexingClient, MockAmqpLink) {
    let link = MockAmqpLink::new();
    let binding = AmqpBinding::new(link.clone(), HOST, protocol);
    let client = MultiplexingClient::new(HOST, Box::new(binding), fast_options(), registry).unwrap();
    (client, link)
}

#[tokio::test]
async fn test_sessions_share_one_connection() {
    // Arrange
    let (client, link) = amqp_client(Protocol::Amqps, ConnectionRegistry::new());
    client.register(devices(3, Protocol::Amqps)).await.unwrap();

    // Act
    client.open(true).await.unwrap();
    let ticket = client
        .send_async("sensor-1", Message::new("{\"t\":20}"))
        .unwrap();
    timeout(Duration::from_secs(3), async {
        while link.sent().is_empty() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    link.settle_all(IotHubStatusCode::Ok);

    // Assert
    assert_eq!(
        timeout(Duration::from_secs(3), ticket).await.unwrap(),
        IotHubStatusCode::Ok
    );
    assert_eq!(link.connect_count(), 1);
    assert_eq!(link.tokens().len(), 3);
    assert_eq!(link.open_sessions().len(), 3);
    let sent = link.sent();
    assert_eq!(sent[0].0, "sensor-1");
    assert_eq!(sent[0].1, AmqpLinkKind::Telemetry);

    client.close().await.unwrap();
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_amqps_rejects_the_1001st_device() {
    let (client, _link) = amqp_client(Protocol::Amqps, ConnectionRegistry::new());

    let result = client.register(devices(1001, Protocol::Amqps)).await;

    assert!(matches!(
        result,
        Err(DeviceError::Multiplexing(MultiplexingError::DeviceLimitExceeded { max: 1000, .. }))
    ));
    assert_eq!(client.registered_device_count(), 0);
}

#[tokio::test]
async fn test_amqps_ws_allows_500_devices() {
    let (client, _link) = amqp_client(Protocol::AmqpsWs, ConnectionRegistry::new());

    client.register(devices(500, Protocol::AmqpsWs)).await.unwrap();
    let extra = client
        .register(vec![device("one-too-many", Protocol::AmqpsWs)])
        .await;

    assert_eq!(client.registered_device_count(), 500);
    assert!(matches!(
        extra,
        Err(DeviceError::Multiplexing(MultiplexingError::DeviceLimitExceeded { max: 500, .. }))
    ));
}

#[tokio::test]
async fn test_device_connected_alone_cannot_join_multiplexed_connection() {
    // Arrange
    let registry = ConnectionRegistry::new();
    let single = DeviceIo::new(
        Box::new(MockBinding::new(Protocol::Mqtt)),
        DeviceIdentity::new(HOST, "sensor-0"),
        Credential::SymmetricKey(KEY.to_string()),
        fast_options(),
    )
    .with_registry(registry.clone());
    single.open(false).await.unwrap();
    let (client, _link) = amqp_client(Protocol::Amqps, registry.clone());

    // Act
    let result = client.register(devices(2, Protocol::Amqps)).await;

    // Assert
    assert!(matches!(
        result,
        Err(DeviceError::Multiplexing(MultiplexingError::AlreadyOpen { .. }))
    ));
    assert!(!client.is_device_registered("sensor-1"));

    single.close().await.unwrap();
    client.register(devices(2, Protocol::Amqps)).await.unwrap();
    assert_eq!(client.registered_device_count(), 2);
}

#[tokio::test]
async fn test_unregister_releases_identity() {
    let registry = ConnectionRegistry::new();
    let (client, _link) = amqp_client(Protocol::Amqps, registry.clone());
    let configs = devices(2, Protocol::Amqps);
    client.register(configs.clone()).await.unwrap();
    assert!(registry.is_open(&DeviceIdentity::new(HOST, "sensor-0")));

    client.unregister(&configs[..1]).await.unwrap();

    assert!(!registry.is_open(&DeviceIdentity::new(HOST, "sensor-0")));
    assert!(registry.is_open(&DeviceIdentity::new(HOST, "sensor-1")));
    assert_eq!(client.registered_device_count(), 1);
}
