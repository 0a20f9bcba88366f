//! Per-connection orchestrator
//!
//! `DeviceIo` owns one binding, one queue engine and one connection state machine, and runs
//! two periodic tasks over them:
//!
//! - **Send** drains the waiting queue into the binding and runs completion callbacks.
//! - **Receive** recovers lost connections, maintains SAS tokens, applies acknowledgements,
//!   forwards inbound messages and times out stale operations.
//!
//! A task never overlaps with itself; Send and Receive run concurrently and meet only at the
//! binding lock and the queue engine. `open`, `close` and session changes are serialized by a
//! separate operation lock.

use crate::auth::{Credential, DeviceIdentity, RenewalMode, SasTokenLifecycle};
use crate::engine::queue::{Completion, MessageQueueEngine, PacketPayload, SendTicket};
use crate::engine::state::{
    interruptible_sleep, read_policy, ConnectionStateMachine, ConnectionStatusCallback,
    EstablishOptions, SharedRetryPolicy,
};
use crate::error::{sanitize_error_message, DeviceError, DeviceResult, MultiplexingError, TransportError};
use crate::message::Message;
use crate::multiplexing::{ConnectionClaim, ConnectionRegistry};
use crate::retry::{ExponentialBackoffWithJitter, RetryPolicy};
use crate::status::{ConnectionStatus, ConnectionStatusReason, IotHubStatusCode};
use crate::transport::{
    default_binding, Protocol, ProtocolBinding, SessionCredentials, Subscription,
};
use crate::transport_span;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_INBOUND_PER_CYCLE: usize = 64;

/// Scheduling and token settings of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub send_interval: Duration,
    pub receive_interval: Duration,
    /// Budget for reconnect sequences and for waiting on acknowledgements
    pub operation_timeout: Duration,
    /// Coalesce queued telemetry into HTTPS batch requests
    pub https_batch: bool,
    pub token_ttl: Duration,
    pub renewal_threshold_percent: u8,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(10),
            receive_interval: Duration::from_millis(10),
            operation_timeout: Duration::from_secs(240),
            https_batch: false,
            token_ttl: Duration::from_secs(3600),
            renewal_threshold_percent: 85,
        }
    }
}

struct DeviceIoInner {
    protocol: Protocol,
    options: ClientOptions,
    binding: Mutex<Box<dyn ProtocolBinding>>,
    queue: MessageQueueEngine,
    state: ConnectionStateMachine,
    tokens: StdMutex<Vec<SasTokenLifecycle>>,
    retry_policy: SharedRetryPolicy,
    send_interval_ms: AtomicU64,
    receive_interval_ms: AtomicU64,
    subscriptions: StdMutex<Vec<Subscription>>,
    inbound_tx: StdMutex<Option<mpsc::Sender<Message>>>,
    pending_loss: StdMutex<Option<TransportError>>,
}

/// Handles owned by the operation lock
#[derive(Default)]
struct Lifecycle {
    opened: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    claims: Vec<ConnectionClaim>,
}

/// One logical connection: queues, reconnects and the Send/Receive tasks
pub struct DeviceIo {
    inner: Arc<DeviceIoInner>,
    lifecycle: Mutex<Lifecycle>,
    registry: Option<ConnectionRegistry>,
}

impl std::fmt::Debug for DeviceIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIo")
            .field("protocol", &self.inner.protocol)
            .field("status", &self.inner.state.status())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128).max(1) as u64
}

/// Status delivered to queued packets when the connection is given up for good
fn fatal_status(error: &DeviceError) -> IotHubStatusCode {
    match error {
        DeviceError::Transport(source) | DeviceError::RetryExpired { source, .. } => {
            source.status_code()
        }
        DeviceError::OperationTimeout { .. } => IotHubStatusCode::DeviceOperationTimedOut,
        _ => IotHubStatusCode::MessageCancelledOnClose,
    }
}

impl DeviceIo {
    /// Connection for one device or module identity
    pub fn new(
        binding: Box<dyn ProtocolBinding>,
        identity: DeviceIdentity,
        credential: Credential,
        options: ClientOptions,
    ) -> Self {
        let lifecycle = SasTokenLifecycle::new(
            identity,
            credential,
            options.token_ttl,
            options.renewal_threshold_percent,
            binding.protocol().renewal_mode(),
        );
        Self::with_tokens(binding, vec![lifecycle], options)
    }

    /// Connection over the bundled network stack for `protocol`
    pub fn connect(
        protocol: Protocol,
        identity: DeviceIdentity,
        credential: Credential,
        options: ClientOptions,
    ) -> DeviceResult<Self> {
        let binding = default_binding(protocol, &identity.hostname)?;
        Ok(Self::new(binding, identity, credential, options))
    }

    /// Connection that starts without sessions; they are added with `add_session`
    pub(crate) fn without_sessions(binding: Box<dyn ProtocolBinding>, options: ClientOptions) -> Self {
        Self::with_tokens(binding, Vec::new(), options)
    }

    fn with_tokens(
        binding: Box<dyn ProtocolBinding>,
        tokens: Vec<SasTokenLifecycle>,
        options: ClientOptions,
    ) -> Self {
        let protocol = binding.protocol();
        let policy: Arc<dyn RetryPolicy> = Arc::new(ExponentialBackoffWithJitter::default());
        Self {
            inner: Arc::new(DeviceIoInner {
                protocol,
                send_interval_ms: AtomicU64::new(millis(options.send_interval)),
                receive_interval_ms: AtomicU64::new(millis(options.receive_interval)),
                options,
                binding: Mutex::new(binding),
                queue: MessageQueueEngine::new(),
                state: ConnectionStateMachine::new(),
                tokens: StdMutex::new(tokens),
                retry_policy: RwLock::new(policy),
                subscriptions: StdMutex::new(Vec::new()),
                inbound_tx: StdMutex::new(None),
                pending_loss: StdMutex::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            registry: None,
        }
    }

    /// Claim every identity in `registry` while open, so no other connection opens it
    pub fn with_registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Open the binding and start the Send and Receive tasks
    ///
    /// With `with_retry` false the first failure is final. Opening an open connection is a
    /// no-op.
    pub async fn open(&self, with_retry: bool) -> DeviceResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.opened {
            if self.inner.state.status() != ConnectionStatus::Disconnected {
                debug!("Connection already open");
                return Ok(());
            }
            // The Receive task gave up after a fatal error; start over
            self.stop_tasks(&mut lifecycle).await;
            self.inner.binding.lock().await.close().await.ok();
            lifecycle.claims.clear();
            lifecycle.opened = false;
        }

        let claims = self.claim_identities()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = &*self.inner;
        let options = EstablishOptions {
            with_retry,
            operation_timeout: inner.options.operation_timeout,
        };

        inner
            .state
            .establish(options, &inner.retry_policy, &mut shutdown_rx, move || {
                inner.try_open_once()
            })
            .await?;

        inner.queue.set_open(true);
        lifecycle.tasks = vec![
            tokio::spawn(run_send_task(self.inner.clone(), shutdown_tx.subscribe())),
            tokio::spawn(run_receive_task(self.inner.clone(), shutdown_tx.subscribe())),
        ];
        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.claims = claims;
        lifecycle.opened = true;

        info!(protocol = %inner.protocol, "Device connection open");
        Ok(())
    }

    /// Stop the tasks, cancel queued packets and close the binding
    ///
    /// Every callback for a packet enqueued before the call has run when it returns. Closing a
    /// closed connection performs no I/O.
    pub async fn close(&self) -> DeviceResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.opened {
            debug!("Connection already closed");
            return Ok(());
        }

        self.stop_tasks(&mut lifecycle).await;
        let inner = &*self.inner;
        inner.queue.set_open(false);

        {
            let mut binding = inner.binding.lock().await;
            inner.queue.apply_acks(binding.drain_acknowledgements());
            let cancelled = inner.queue.cancel_all(IotHubStatusCode::MessageCancelledOnClose);
            inner.queue.drain_and_invoke_callbacks();
            if cancelled > 0 {
                info!(cancelled, "Cancelled queued packets on close");
            }
            if let Err(e) = binding.close().await {
                warn!(error = %sanitize_error_message(&e.to_string()), "Binding close failed");
            }
        }

        lock(&inner.pending_loss).take();
        lifecycle.claims.clear();
        lifecycle.opened = false;
        inner.state.transition(
            ConnectionStatus::Disconnected,
            ConnectionStatusReason::ConnectionOk,
            None,
        );
        info!(protocol = %inner.protocol, "Device connection closed");
        Ok(())
    }

    async fn stop_tasks(&self, lifecycle: &mut Lifecycle) {
        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        for handle in lifecycle.tasks.drain(..) {
            join_task(handle).await;
        }
    }

    fn claim_identities(&self) -> DeviceResult<Vec<ConnectionClaim>> {
        let Some(registry) = &self.registry else {
            return Ok(Vec::new());
        };
        lock(&self.inner.tokens)
            .iter()
            .map(|lifecycle| {
                registry.claim(lifecycle.identity()).ok_or_else(|| {
                    DeviceError::Multiplexing(MultiplexingError::AlreadyOpen {
                        device_id: lifecycle.identity().session_key(),
                    })
                })
            })
            .collect()
    }

    /// Queue a message; the ticket resolves with its final status
    pub fn send_async(&self, message: Message) -> DeviceResult<SendTicket> {
        let (completion, ticket) = Completion::ticket();
        self.inner
            .queue
            .enqueue(PacketPayload::Single(message), completion)?;
        Ok(ticket)
    }

    /// Queue a message and run `callback` once with its final status
    pub fn send_with_callback<F>(&self, message: Message, callback: F) -> DeviceResult<()>
    where
        F: FnOnce(IotHubStatusCode) + Send + 'static,
    {
        self.inner
            .queue
            .enqueue(PacketPayload::Single(message), Completion::Callback(Box::new(callback)))?;
        Ok(())
    }

    /// Queue messages sent as one HTTPS request with one shared status
    pub fn send_batch_async(&self, messages: Vec<Message>) -> DeviceResult<SendTicket> {
        if self.inner.protocol != Protocol::Https {
            return Err(TransportError::unsupported(format!(
                "{} does not support batch sends",
                self.inner.protocol
            ))
            .into());
        }
        let (completion, ticket) = Completion::ticket();
        self.inner
            .queue
            .enqueue(PacketPayload::Batch(messages), completion)?;
        Ok(ticket)
    }

    /// Ask for inbound traffic; remembered and restored after every reconnect
    pub async fn subscribe(&self, subscription: Subscription) -> DeviceResult<()> {
        {
            let mut subscriptions = lock(&self.inner.subscriptions);
            if subscriptions.contains(&subscription) {
                return Ok(());
            }
            subscriptions.push(subscription);
        }

        let mut binding = self.inner.binding.lock().await;
        if binding.is_open() {
            binding.subscribe(subscription).await?;
        }
        Ok(())
    }

    /// Where inbound messages go; without a sender they are logged and dropped
    pub fn set_inbound_sender(&self, sender: mpsc::Sender<Message>) {
        *lock(&self.inner.inbound_tx) = Some(sender);
    }

    /// True when nothing is waiting, in flight or awaiting its callback
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.inner.queue.is_open() && self.inner.state.status() != ConnectionStatus::Disconnected
    }

    pub fn connection_status(&self) -> (ConnectionStatus, ConnectionStatusReason) {
        (self.inner.state.status(), self.inner.state.reason())
    }

    pub fn set_send_interval(&self, interval: Duration) {
        self.inner
            .send_interval_ms
            .store(millis(interval), Ordering::Relaxed);
    }

    pub fn set_receive_interval(&self, interval: Duration) {
        self.inner
            .receive_interval_ms
            .store(millis(interval), Ordering::Relaxed);
    }

    pub fn register_connection_status_callback(&self, callback: ConnectionStatusCallback) {
        self.inner.state.register_callback(callback);
    }

    /// Applies to decisions taken after the call
    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        *self
            .inner
            .retry_policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }

    pub(crate) fn session_count(&self) -> usize {
        lock(&self.inner.tokens).len()
    }

    /// Add a device session; attached right away when the connection is up
    pub(crate) async fn add_session(&self, lifecycle: SasTokenLifecycle) -> DeviceResult<()> {
        let guard = self.lifecycle.lock().await;
        let identity = lifecycle.identity().clone();
        lock(&self.inner.tokens).push(lifecycle);

        if !guard.opened || self.inner.state.status() != ConnectionStatus::Connected {
            return Ok(());
        }

        let session = {
            let mut tokens = lock(&self.inner.tokens);
            let now = Utc::now();
            match tokens.iter_mut().find(|l| *l.identity() == identity) {
                Some(lifecycle) => SessionCredentials::new(identity.clone(), lifecycle.prepare_for_open(now)?),
                None => return Ok(()),
            }
        };

        let result = self.inner.binding.lock().await.open_session(&session).await;
        if let Err(e) = result {
            lock(&self.inner.tokens).retain(|l| *l.identity() != identity);
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop a device session without touching the shared connection
    pub(crate) async fn remove_session(&self, identity: &DeviceIdentity) -> DeviceResult<()> {
        let guard = self.lifecycle.lock().await;
        let removed = {
            let mut tokens = lock(&self.inner.tokens);
            let before = tokens.len();
            tokens.retain(|l| l.identity() != identity);
            before != tokens.len()
        };

        if removed && guard.opened {
            let mut binding = self.inner.binding.lock().await;
            if binding.is_open() {
                binding.close_session(&identity.session_key()).await?;
            }
        }
        Ok(())
    }
}

impl Drop for DeviceIo {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        for handle in lifecycle.tasks.drain(..) {
            handle.abort();
        }
    }
}

async fn join_task(mut handle: JoinHandle<()>) {
    match tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if !e.is_cancelled() => error!("Transport task ended abnormally: {}", e),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!("Transport task did not stop in time, aborting");
            handle.abort();
            // The task releases the binding lock only once its future is dropped
            let _ = handle.await;
        }
    }
}

async fn run_send_task(inner: Arc<DeviceIoInner>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!("Send task started");
    loop {
        let interval = Duration::from_millis(inner.send_interval_ms.load(Ordering::Relaxed));
        if interruptible_sleep(&mut shutdown_rx, interval).await {
            break;
        }
        inner.send_cycle().await;
    }
    debug!("Send task stopped");
}

async fn run_receive_task(inner: Arc<DeviceIoInner>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!("Receive task started");
    loop {
        let interval = Duration::from_millis(inner.receive_interval_ms.load(Ordering::Relaxed));
        if interruptible_sleep(&mut shutdown_rx, interval).await {
            break;
        }
        if !inner.receive_cycle(&mut shutdown_rx).await {
            break;
        }
    }
    debug!("Receive task stopped");
}

/// Token work the Receive task has to do this cycle
enum TokenAction {
    None,
    Renew(Vec<SessionCredentials>),
    Reconnect(TransportError),
    GiveUp(TransportError),
}

impl DeviceIoInner {
    /// One open attempt: fresh tokens, a clean binding, restored subscriptions
    async fn try_open_once(&self) -> Result<(), TransportError> {
        let sessions = self.prepare_sessions()?;
        let subscriptions = lock(&self.subscriptions).clone();

        let mut binding = self.binding.lock().await;
        if binding.is_open() {
            binding.close().await.ok();
        }
        binding.open(&sessions).await?;
        for subscription in subscriptions {
            binding.subscribe(subscription).await?;
        }
        Ok(())
    }

    fn prepare_sessions(&self) -> Result<Vec<SessionCredentials>, TransportError> {
        let now = Utc::now();
        lock(&self.tokens)
            .iter_mut()
            .map(|lifecycle| {
                let token = lifecycle.prepare_for_open(now)?;
                Ok(SessionCredentials::new(lifecycle.identity().clone(), token))
            })
            .collect()
    }

    fn any_token_expired(&self) -> bool {
        let now = Utc::now();
        lock(&self.tokens).iter().any(|l| l.has_expired(now))
    }

    async fn send_cycle(&self) {
        if self.state.status() != ConnectionStatus::Connected || self.any_token_expired() {
            return;
        }

        let policy = read_policy(&self.retry_policy);
        let report = {
            let mut binding = self.binding.lock().await;
            self.queue
                .drain_and_send(binding.as_mut(), policy.as_ref(), self.options.https_batch)
                .instrument(transport_span!(protocol = %self.protocol))
                .await
        };

        if report.sent > 0 || report.requeued > 0 {
            debug!(
                sent = report.sent,
                requeued = report.requeued,
                completed = report.completed,
                "Send drain finished"
            );
        }
        if let Some(error) = report.connection_error {
            lock(&self.pending_loss).get_or_insert(error);
        }
        self.queue.drain_and_invoke_callbacks();
    }

    /// Returns false once the connection is given up for good
    async fn receive_cycle(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let loss = {
            let mut binding = self.binding.lock().await;
            binding.take_connection_loss()
        }
        .or_else(|| lock(&self.pending_loss).take());

        if let Some(cause) = loss {
            let reason = cause.connection_reason();
            if !self.reconnect(cause, reason, shutdown_rx).await {
                return false;
            }
        }

        if self.state.status() != ConnectionStatus::Connected {
            return true;
        }

        match self.token_action() {
            TokenAction::None => {}
            TokenAction::Renew(sessions) => {
                let mut binding = self.binding.lock().await;
                for session in &sessions {
                    if let Err(e) = binding.renew_token(session).await {
                        warn!(
                            device = %session.identity,
                            error = %sanitize_error_message(&e.to_string()),
                            "Proactive token renewal failed"
                        );
                        lock(&self.pending_loss).get_or_insert(e);
                        break;
                    }
                }
            }
            TokenAction::Reconnect(cause) => {
                if !self
                    .reconnect(cause, ConnectionStatusReason::ExpiredSasToken, shutdown_rx)
                    .await
                {
                    return false;
                }
            }
            TokenAction::GiveUp(cause) => {
                self.give_up_on_expired_token(cause).await;
                return false;
            }
        }

        let inbound = {
            let mut binding = self.binding.lock().await;
            self.queue.apply_acks(binding.drain_acknowledgements());

            let mut inbound = Vec::new();
            while inbound.len() < MAX_INBOUND_PER_CYCLE {
                match binding.receive().await {
                    Ok(Some(message)) => inbound.push(message),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %sanitize_error_message(&e.to_string()), "Dropped malformed inbound frame");
                        break;
                    }
                }
            }

            let pruned = binding.prune_pending(self.options.operation_timeout);
            if pruned > 0 {
                warn!(pruned, "Dropped request correlations that never got a response");
            }
            inbound
        };

        self.deliver_inbound(inbound).await;

        let timed_out = self
            .queue
            .expire_in_flight(self.options.operation_timeout, Instant::now());
        if timed_out > 0 {
            warn!(timed_out, "Packets timed out waiting for acknowledgement");
        }
        self.queue.drain_and_invoke_callbacks();
        true
    }

    async fn deliver_inbound(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let sender = lock(&self.inbound_tx).clone();
        let Some(sender) = sender else {
            debug!(count = messages.len(), "No inbound receiver registered, dropping messages");
            return;
        };
        for message in messages {
            debug!(operation = ?message.operation(), message_id = %message.message_id(), "Inbound message");
            if sender.send(message).await.is_err() {
                debug!("Inbound receiver dropped");
                break;
            }
        }
    }

    /// Proactive tokens are replaced on the live connection; reactive ones force a reconnect
    /// once expired
    fn token_action(&self) -> TokenAction {
        let now = Utc::now();
        let mut tokens = lock(&self.tokens);

        if let Some(expired) = tokens
            .iter()
            .find(|l| l.has_expired(now) && !l.can_auto_renew())
        {
            return TokenAction::GiveUp(TransportError::TokenExpired(format!(
                "SAS token for {} expired and cannot be renewed",
                expired.identity()
            )));
        }

        let mut renewed = Vec::new();
        for lifecycle in tokens.iter_mut().filter(|l| {
            l.renewal_mode() == RenewalMode::Proactive && l.is_renewal_necessary(now)
        }) {
            let identity = lifecycle.identity().clone();
            match lifecycle.renew(now) {
                Ok(token) => renewed.push(SessionCredentials::new(
                    identity,
                    Some(token.as_str().to_string()),
                )),
                Err(e) => return TokenAction::Reconnect(e),
            }
        }
        if !renewed.is_empty() {
            return TokenAction::Renew(renewed);
        }

        match tokens
            .iter()
            .find(|l| l.renewal_mode() == RenewalMode::Reactive && l.has_expired(now))
        {
            Some(expired) => TokenAction::Reconnect(TransportError::TokenExpired(format!(
                "SAS token for {} expired",
                expired.identity()
            ))),
            None => TokenAction::None,
        }
    }

    /// Re-establish after a drop; false when the connection is gone for good
    async fn reconnect(
        &self,
        cause: TransportError,
        reason: ConnectionStatusReason,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let requeued = self.queue.requeue_in_flight();
        warn!(
            error = %sanitize_error_message(&cause.to_string()),
            requeued,
            "Connection lost, reconnecting"
        );
        self.state
            .transition(ConnectionStatus::DisconnectedRetrying, reason, Some(&cause));

        let options = EstablishOptions {
            with_retry: true,
            operation_timeout: self.options.operation_timeout,
        };
        match self
            .state
            .establish(options, &self.retry_policy, shutdown_rx, move || self.try_open_once())
            .await
        {
            Ok(()) => {
                info!("Reconnected");
                true
            }
            Err(DeviceError::Closed) => false,
            Err(e) => {
                error!(error = %sanitize_error_message(&e.to_string()), "Reconnect failed for good");
                self.abandon(fatal_status(&e)).await;
                false
            }
        }
    }

    async fn give_up_on_expired_token(&self, cause: TransportError) {
        error!(error = %cause, "Connection closed: SAS token expired");
        self.abandon(IotHubStatusCode::Unauthorized).await;
        self.state.transition(
            ConnectionStatus::Disconnected,
            ConnectionStatusReason::ExpiredSasToken,
            Some(&cause),
        );
    }

    /// Complete every queued packet with `status` and refuse new ones
    async fn abandon(&self, status: IotHubStatusCode) {
        self.queue.set_open(false);
        self.queue.cancel_all(status);
        self.queue.drain_and_invoke_callbacks();
        let mut binding = self.binding.lock().await;
        if let Err(e) = binding.close().await {
            debug!(error = %e, "Binding close after fatal error failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoRetry;
    use crate::testing::{MockBinding, SendMode};

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

    fn device_io(binding: &MockBinding) -> DeviceIo {
        DeviceIo::new(
            Box::new(binding.clone()),
            DeviceIdentity::new(HOST, "dev1"),
            Credential::SymmetricKey(KEY.to_string()),
            fast_options(),
        )
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.send_interval, Duration::from_millis(10));
        assert_eq!(options.receive_interval, Duration::from_millis(10));
        assert_eq!(options.operation_timeout, Duration::from_secs(240));
        assert_eq!(options.renewal_threshold_percent, 85);
        assert!(!options.https_batch);
    }

    #[tokio::test]
    async fn test_open_passes_fresh_token() {
        let binding = MockBinding::new(Protocol::Mqtt);
        let io = device_io(&binding);

        io.open(false).await.unwrap();

        let calls = binding.open_calls();
        assert_eq!(calls.len(), 1);
        let token = calls[0][0].sas_token.as_deref().unwrap();
        assert!(token.starts_with("SharedAccessSignature sr="));
        assert!(io.is_open());
        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_open_is_closed_error() {
        let io = device_io(&MockBinding::new(Protocol::Mqtt));
        assert!(matches!(
            io.send_async(Message::new("x")),
            Err(DeviceError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_completes_with_ok() {
        let binding = MockBinding::new(Protocol::Mqtt).with_send_mode(SendMode::AutoAck);
        let io = device_io(&binding);
        io.open(false).await.unwrap();

        let ticket = io.send_async(Message::new("hello")).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), ticket).await.unwrap();

        assert_eq!(status, IotHubStatusCode::Ok);
        assert_eq!(binding.sent_messages().len(), 1);
        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_unacknowledged_packets() {
        // Arrange
        let binding = MockBinding::new(Protocol::Mqtt).with_send_mode(SendMode::ManualAck);
        let io = device_io(&binding);
        io.open(false).await.unwrap();
        let ticket = io.send_async(Message::new("pending")).unwrap();
        while binding.pending_acks() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Act
        io.close().await.unwrap();

        // Assert
        assert_eq!(ticket.await, IotHubStatusCode::MessageCancelledOnClose);
        assert!(io.is_empty());
        assert_eq!(
            io.connection_status(),
            (ConnectionStatus::Disconnected, ConnectionStatusReason::ConnectionOk)
        );
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let binding = MockBinding::new(Protocol::Mqtt);
        let io = device_io(&binding);
        io.open(false).await.unwrap();

        io.close().await.unwrap();
        io.close().await.unwrap();

        assert_eq!(binding.close_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_requires_https() {
        let binding = MockBinding::new(Protocol::Mqtt);
        let io = device_io(&binding);
        io.open(false).await.unwrap();

        let result = io.send_batch_async(vec![Message::new("a")]);

        assert!(matches!(
            result,
            Err(DeviceError::Transport(TransportError::Unsupported(_)))
        ));
        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_without_retry_fails_fast() {
        let binding = MockBinding::new(Protocol::Mqtt);
        binding.fail_opens_with(vec![TransportError::connection("refused")]);
        let io = device_io(&binding);
        io.set_retry_policy(Arc::new(NoRetry));

        let result = io.open(true).await;

        assert!(result.unwrap_err().is_fatal_for_connection());
        assert_eq!(io.connection_status().0, ConnectionStatus::Disconnected);
        assert!(!io.is_open());
    }

    #[tokio::test]
    async fn test_registry_blocks_second_connection() {
        let registry = ConnectionRegistry::new();
        let first = device_io(&MockBinding::new(Protocol::Mqtt)).with_registry(registry.clone());
        let second = device_io(&MockBinding::new(Protocol::Mqtt)).with_registry(registry.clone());

        first.open(false).await.unwrap();
        let result = second.open(false).await;

        assert!(matches!(
            result,
            Err(DeviceError::Multiplexing(MultiplexingError::AlreadyOpen { .. }))
        ));
        first.close().await.unwrap();
        second.open(false).await.unwrap();
        second.close().await.unwrap();
    }
}
