//! Many device identities over one AMQP connection
//!
//! `MultiplexingClient` validates registrations as a batch, attaches one session per device to
//! a shared `DeviceIo`, and serializes register/unregister/open/close under one operation lock.
//! `ConnectionRegistry` records which identities are open anywhere in the process so a device
//! cannot be open on its own connection and on a multiplexed one at the same time.

use crate::auth::{Credential, DeviceIdentity, SasTokenLifecycle};
use crate::device_io::{ClientOptions, DeviceIo};
use crate::engine::queue::SendTicket;
use crate::engine::state::ConnectionStatusCallback;
use crate::error::{DeviceResult, MultiplexingError};
use crate::message::Message;
use crate::retry::RetryPolicy;
use crate::status::{ConnectionStatus, ConnectionStatusReason};
use crate::transport::{Protocol, ProtocolBinding, Subscription};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn registry_key(identity: &DeviceIdentity) -> String {
    format!(
        "{}@{}",
        identity.session_key(),
        identity.hostname.to_ascii_lowercase()
    )
}

/// Identities currently open on some connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    open: Arc<StdMutex<HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `identity` open; `None` if it already is
    pub fn claim(&self, identity: &DeviceIdentity) -> Option<ConnectionClaim> {
        let key = registry_key(identity);
        if !lock(&self.open).insert(key.clone()) {
            return None;
        }
        Some(ConnectionClaim {
            registry: self.clone(),
            key,
        })
    }

    pub fn is_open(&self, identity: &DeviceIdentity) -> bool {
        lock(&self.open).contains(&registry_key(identity))
    }
}

/// Releases its identity when dropped
#[derive(Debug)]
pub struct ConnectionClaim {
    registry: ConnectionRegistry,
    key: String,
}

impl Drop for ConnectionClaim {
    fn drop(&mut self) {
        lock(&self.registry.open).remove(&self.key);
    }
}

/// One device to put on the shared connection
#[derive(Debug, Clone)]
pub struct DeviceClientConfig {
    pub identity: DeviceIdentity,
    pub credential: Credential,
    pub protocol: Protocol,
}

impl DeviceClientConfig {
    pub fn new(identity: DeviceIdentity, credential: Credential, protocol: Protocol) -> Self {
        Self {
            identity,
            credential,
            protocol,
        }
    }
}

#[derive(Debug)]
struct Registration {
    identity: DeviceIdentity,
    _claim: ConnectionClaim,
}

pub struct MultiplexingClient {
    hostname: String,
    protocol: Protocol,
    options: ClientOptions,
    io: DeviceIo,
    registry: ConnectionRegistry,
    devices: StdMutex<HashMap<String, Registration>>,
    operation_lock: Mutex<()>,
}

impl std::fmt::Debug for MultiplexingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexingClient")
            .field("hostname", &self.hostname)
            .field("protocol", &self.protocol)
            .field("devices", &self.registered_device_count())
            .finish()
    }
}

impl MultiplexingClient {
    /// Shared connection to `hostname` over `binding`, which must be AMQP
    pub fn new(
        hostname: impl Into<String>,
        binding: Box<dyn ProtocolBinding>,
        options: ClientOptions,
        registry: ConnectionRegistry,
    ) -> Result<Self, MultiplexingError> {
        let protocol = binding.protocol();
        if !protocol.is_amqp() {
            return Err(MultiplexingError::UnsupportedProtocol(protocol.to_string()));
        }

        Ok(Self {
            hostname: hostname.into(),
            protocol,
            io: DeviceIo::without_sessions(binding, options.clone()),
            options,
            registry,
            devices: StdMutex::new(HashMap::new()),
            operation_lock: Mutex::new(()),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Register a batch of devices; nothing is registered unless the whole batch succeeds
    ///
    /// Devices that are already registered are skipped. On a live connection a session that
    /// fails to attach detaches the sessions this batch already added.
    pub async fn register(&self, configs: Vec<DeviceClientConfig>) -> DeviceResult<()> {
        let _op = self.operation_lock.lock().await;

        let additions = self.validate(configs)?;
        let count = additions.len();

        let mut added: Vec<(DeviceIdentity, ConnectionClaim)> = Vec::with_capacity(count);
        for (config, claim) in additions {
            let lifecycle = SasTokenLifecycle::new(
                config.identity.clone(),
                config.credential,
                self.options.token_ttl,
                self.options.renewal_threshold_percent,
                self.protocol.renewal_mode(),
            );
            if let Err(e) = self.io.add_session(lifecycle).await {
                warn!(
                    device = %config.identity,
                    attached = added.len(),
                    error = %e,
                    "Session attach failed, rolling back registration batch"
                );
                self.roll_back(added).await;
                return Err(e);
            }
            debug!(device = %config.identity, "Device registered");
            added.push((config.identity, claim));
        }

        {
            let mut devices = lock(&self.devices);
            for (identity, claim) in added {
                devices.insert(
                    identity.session_key(),
                    Registration {
                        identity,
                        _claim: claim,
                    },
                );
            }
        }

        info!(
            added = count,
            total = self.registered_device_count(),
            protocol = %self.protocol,
            "Multiplexed registration complete"
        );
        Ok(())
    }

    /// Detach sessions of a failed batch; each claim is released as it drops
    async fn roll_back(&self, added: Vec<(DeviceIdentity, ConnectionClaim)>) {
        for (identity, _claim) in added {
            if let Err(e) = self.io.remove_session(&identity).await {
                warn!(device = %identity, error = %e, "Could not detach session during rollback");
            }
        }
    }

    fn validate(
        &self,
        configs: Vec<DeviceClientConfig>,
    ) -> Result<Vec<(DeviceClientConfig, ConnectionClaim)>, MultiplexingError> {
        let devices = lock(&self.devices);
        let mut batch_keys = HashSet::new();
        let mut accepted = Vec::new();

        for config in configs {
            let device_id = config.identity.session_key();
            if config.protocol != self.protocol {
                return Err(MultiplexingError::ProtocolMismatch {
                    device_id,
                    expected: self.protocol.to_string(),
                    actual: config.protocol.to_string(),
                });
            }
            if !config.credential.is_symmetric_key() {
                return Err(MultiplexingError::UnsupportedAuthentication { device_id });
            }
            if !config.identity.hostname.eq_ignore_ascii_case(&self.hostname) {
                return Err(MultiplexingError::HostnameMismatch {
                    device_id,
                    expected: self.hostname.clone(),
                    actual: config.identity.hostname.clone(),
                });
            }
            if devices.contains_key(&device_id) || !batch_keys.insert(device_id) {
                continue;
            }
            accepted.push(config);
        }

        if let Some(max) = self.protocol.max_multiplexed_devices() {
            if devices.len() + accepted.len() > max {
                return Err(MultiplexingError::DeviceLimitExceeded {
                    protocol: self.protocol.to_string(),
                    max,
                });
            }
        }

        // Claims taken so far are released if a later one fails
        accepted
            .into_iter()
            .map(|config| match self.registry.claim(&config.identity) {
                Some(claim) => Ok((config, claim)),
                None => Err(MultiplexingError::AlreadyOpen {
                    device_id: config.identity.session_key(),
                }),
            })
            .collect()
    }

    /// Close the sessions of these devices; the shared connection stays up
    pub async fn unregister(&self, configs: &[DeviceClientConfig]) -> DeviceResult<()> {
        let _op = self.operation_lock.lock().await;

        for config in configs {
            let removed = lock(&self.devices).remove(&config.identity.session_key());
            if let Some(registration) = removed {
                self.io.remove_session(&registration.identity).await?;
                debug!(device = %registration.identity, "Device unregistered");
            }
        }
        Ok(())
    }

    pub async fn open(&self, with_retry: bool) -> DeviceResult<()> {
        let _op = self.operation_lock.lock().await;
        self.io.open(with_retry).await
    }

    /// Close every session and the shared connection; registrations are kept for a reopen
    pub async fn close(&self) -> DeviceResult<()> {
        let _op = self.operation_lock.lock().await;
        self.io.close().await
    }

    /// Queue a message on behalf of a registered device
    pub fn send_async(&self, device_id: &str, message: Message) -> DeviceResult<SendTicket> {
        let identity = lock(&self.devices)
            .get(device_id)
            .map(|registration| registration.identity.clone())
            .ok_or_else(|| MultiplexingError::NotRegistered {
                device_id: device_id.to_string(),
            })?;

        let mut message = message.with_device_id(identity.device_id);
        if let Some(module_id) = identity.module_id {
            message = message.with_module_id(module_id);
        }
        self.io.send_async(message)
    }

    pub async fn subscribe(&self, subscription: Subscription) -> DeviceResult<()> {
        self.io.subscribe(subscription).await
    }

    pub fn set_inbound_sender(&self, sender: mpsc::Sender<Message>) {
        self.io.set_inbound_sender(sender);
    }

    pub fn is_device_registered(&self, device_id: &str) -> bool {
        lock(&self.devices).contains_key(device_id)
    }

    pub fn registered_device_count(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_open(&self) -> bool {
        self.io.is_open()
    }

    pub fn is_empty(&self) -> bool {
        self.io.is_empty()
    }

    pub fn connection_status(&self) -> (ConnectionStatus, ConnectionStatusReason) {
        self.io.connection_status()
    }

    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        self.io.set_retry_policy(policy);
    }

    pub fn register_connection_status_callback(&self, callback: ConnectionStatusCallback) {
        self.io.register_connection_status_callback(callback);
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.io.session_count()
    }
}
