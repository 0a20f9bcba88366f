//! MQTT topic mapping exercised through the full connection stack

use iothub_device::testing::MockMqttLink;
use iothub_device::transport::mqtt::MqttBinding;
use iothub_device::{
    ClientOptions, Credential, DeviceIdentity, DeviceIo, DeviceOperation, IotHubStatusCode,
    Message, Protocol, Subscription,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const HOST: &str = "hub.azure-devices.net";
const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

fn mqtt_device(link: &MockMqttLink, identity: DeviceIdentity) -> DeviceIo {
    DeviceIo::new(
        Box::new(MqttBinding::new(link.clone(), HOST, Protocol::Mqtt)),
        identity,
        Credential::SymmetricKey(KEY.to_string()),
        ClientOptions {
            send_interval: Duration::from_millis(1),
            receive_interval: Duration::from_millis(1),
            ..ClientOptions::default()
        },
    )
}

async fn wait_for_publishes(link: &MockMqttLink, count: usize) {
    timeout(Duration::from_secs(3), async {
        while link.published().len() < count {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("publish not observed");
}

#[tokio::test]
async fn test_telemetry_properties_travel_in_topic() {
    // Arrange
    let link = MockMqttLink::new();
    let io = mqtt_device(&link, DeviceIdentity::new(HOST, "dev1"));
    io.open(true).await.unwrap();
    let message = Message::new("{\"t\":1}")
        .with_message_id("m1")
        .with_correlation_id("c1")
        .with_property("k1", "v1")
        .unwrap();

    // Act
    let ticket = io.send_async(message).unwrap();
    wait_for_publishes(&link, 1).await;
    link.ack_all();

    // Assert
    assert_eq!(
        timeout(Duration::from_secs(3), ticket).await.unwrap(),
        IotHubStatusCode::Ok
    );
    let (topic, payload) = link.published()[0].clone();
    assert_eq!(topic, "devices/dev1/messages/events/%24.mid=m1&%24.cid=c1&k1=v1");
    assert_eq!(&payload[..], b"{\"t\":1}");
    io.close().await.unwrap();
}

#[tokio::test]
async fn test_cloud_to_device_message_keeps_ids_and_properties() {
    // Arrange
    let link = MockMqttLink::new();
    let io = mqtt_device(&link, DeviceIdentity::new(HOST, "dev1"));
    let (tx, mut rx) = mpsc::channel(4);
    io.set_inbound_sender(tx);
    io.open(true).await.unwrap();
    io.subscribe(Subscription::CloudToDevice).await.unwrap();

    // Act
    link.push_inbound(
        "devices/dev1/messages/devicebound/%24.mid=m9&%24.cid=c9&k1=v1",
        "command",
    );
    let received = timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert!(link
        .subscriptions()
        .contains(&"devices/dev1/messages/devicebound/#".to_string()));
    assert_eq!(received.message_id(), "m9");
    assert_eq!(received.correlation_id(), "c9");
    assert_eq!(received.property("k1"), Some("v1"));
    io.close().await.unwrap();
}

#[tokio::test]
async fn test_method_request_answered_on_response_topic() {
    let link = MockMqttLink::new();
    let io = mqtt_device(&link, DeviceIdentity::new(HOST, "dev1"));
    let (tx, mut rx) = mpsc::channel(4);
    io.set_inbound_sender(tx);
    io.open(true).await.unwrap();
    io.subscribe(Subscription::Methods).await.unwrap();

    link.push_inbound("$iothub/methods/POST/reboot/?$rid=5", "{}");
    let request = timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.operation(), DeviceOperation::MethodReceiveRequest);
    assert_eq!(request.method_name(), Some("reboot"));

    let response = Message::method_response(request.request_id().unwrap(), 200, "{\"ok\":true}");
    let ticket = io.send_async(response).unwrap();
    wait_for_publishes(&link, 1).await;
    link.ack_all();

    assert_eq!(
        timeout(Duration::from_secs(3), ticket).await.unwrap(),
        IotHubStatusCode::Ok
    );
    let published = link.published();
    assert_eq!(published.last().unwrap().0, "$iothub/methods/res/200/?$rid=5");
    io.close().await.unwrap();
}

#[tokio::test]
async fn test_module_output_topic() {
    let link = MockMqttLink::new();
    let io = mqtt_device(&link, DeviceIdentity::new(HOST, "edge").with_module("filter"));
    io.open(true).await.unwrap();

    let message = Message::new("x")
        .with_message_id("m1")
        .with_correlation_id("c1")
        .with_output_name("alerts");
    let _ticket = io.send_async(message).unwrap();
    wait_for_publishes(&link, 1).await;

    assert_eq!(
        link.published()[0].0,
        "devices/edge/modules/filter/messages/events/%24.mid=m1&%24.cid=c1&%24.on=alerts"
    );
    assert_eq!(link.connects()[0].client_id, "edge/filter");
    io.close().await.unwrap();
}
