//! Test doubles for links and bindings
//!
//! Lets the queue engine, the bindings and the facade be exercised without a hub.

pub mod mocks;

pub use mocks::{MockAmqpLink, MockBinding, MockMqttLink, SendMode};
