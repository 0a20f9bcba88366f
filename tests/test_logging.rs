//! Logging setup as seen by an embedding application

use iothub_device::observability::{init_logging, parse_level, LogFormat};
use iothub_device::{connection_span, transport_span};
use tracing::Level;

#[test]
fn test_init_logging_twice_does_not_panic() {
    init_logging(Level::DEBUG, LogFormat::Compact, true);
    init_logging(Level::INFO, LogFormat::Json, false);

    let span = connection_span!(operation = "open", with_retry = true);
    let _guard = span.enter();
    let drain = transport_span!(protocol = "MQTT", waiting = 3usize);
    drain.in_scope(|| tracing::info!("drain complete"));
}

#[test]
fn test_environment_style_values() {
    assert_eq!(parse_level(" warn "), Level::WARN);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
}
