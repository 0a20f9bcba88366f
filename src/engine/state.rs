//! Connection status tracking and the reconnect loop
//!
//! The state machine owns the current `ConnectionStatus`, reports every change to the
//! registered callback, and drives open attempts through the retry policy until the
//! connection is up, the policy gives up, the operation timeout runs out, or shutdown is
//! signalled.

use crate::connection_span;
use crate::error::{sanitize_error_message, DeviceError, DeviceResult, TransportError};
use crate::retry::RetryPolicy;
use crate::status::{ConnectionStatus, ConnectionStatusReason};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// What the connection status callback receives
#[derive(Debug, Clone)]
pub struct ConnectionStatusChange {
    pub status: ConnectionStatus,
    pub reason: ConnectionStatusReason,
    pub cause: Option<TransportError>,
}

pub type ConnectionStatusCallback = Arc<dyn Fn(&ConnectionStatusChange) + Send + Sync>;

/// Retry policy slot that can be swapped while a connection is live
pub type SharedRetryPolicy = RwLock<Arc<dyn RetryPolicy>>;

/// How an open is driven
#[derive(Debug, Clone, Copy)]
pub struct EstablishOptions {
    pub with_retry: bool,
    /// Budget for the whole attempt sequence, measured from the first attempt
    pub operation_timeout: Duration,
}

struct StateInner {
    status: ConnectionStatus,
    reason: ConnectionStatusReason,
    callback: Option<ConnectionStatusCallback>,
}

pub struct ConnectionStateMachine {
    inner: StdMutex<StateInner>,
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectionStateMachine")
            .field("status", &inner.status)
            .field("reason", &inner.reason)
            .field("callback", &inner.callback.is_some())
            .finish()
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `duration` unless shutdown is signalled first; returns true when interrupted
pub async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(StateInner {
                status: ConnectionStatus::Disconnected,
                reason: ConnectionStatusReason::ConnectionOk,
                callback: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn reason(&self) -> ConnectionStatusReason {
        self.lock().reason
    }

    pub fn register_callback(&self, callback: ConnectionStatusCallback) {
        self.lock().callback = Some(callback);
    }

    /// Move to `status`; the callback fires once per actual change and its panics stay here
    pub fn transition(
        &self,
        status: ConnectionStatus,
        reason: ConnectionStatusReason,
        cause: Option<&TransportError>,
    ) -> bool {
        let callback = {
            let mut inner = self.lock();
            if inner.status == status && inner.reason == reason {
                return false;
            }
            inner.status = status;
            inner.reason = reason;
            inner.callback.clone()
        };

        info!(
            status = ?status,
            reason = ?reason,
            cause = cause.map(|e| sanitize_error_message(&e.to_string())).unwrap_or_default(),
            "Connection status changed"
        );

        if let Some(callback) = callback {
            let change = ConnectionStatusChange {
                status,
                reason,
                cause: cause.cloned(),
            };
            if catch_unwind(AssertUnwindSafe(|| callback(&change))).is_err() {
                warn!("Connection status callback panicked");
            }
        }
        true
    }

    /// Run `attempt` until it succeeds or the retry rules end the sequence
    ///
    /// Ends in CONNECTED on success and DISCONNECTED on any fatal outcome.
    pub async fn establish<F, Fut>(
        &self,
        options: EstablishOptions,
        policy: &SharedRetryPolicy,
        shutdown_rx: &mut watch::Receiver<bool>,
        mut attempt: F,
    ) -> DeviceResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let span = connection_span!(operation = "establish", with_retry = options.with_retry);
        async move {
            let started = Instant::now();
            let mut retries: u32 = 0;

            loop {
                if *shutdown_rx.borrow() {
                    return Err(DeviceError::Closed);
                }

                let remaining = options.operation_timeout.saturating_sub(started.elapsed());
                let outcome = match tokio::time::timeout(remaining, attempt()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let source = TransportError::Timeout(format!(
                            "Open did not finish within {:?}",
                            options.operation_timeout
                        ));
                        return Err(self.give_up_on_timeout(started, source));
                    }
                };

                let error = match outcome {
                    Ok(()) => {
                        self.transition(
                            ConnectionStatus::Connected,
                            ConnectionStatusReason::ConnectionOk,
                            None,
                        );
                        return Ok(());
                    }
                    Err(error) => error,
                };

                if !options.with_retry || !error.is_retryable() {
                    error!(error = %sanitize_error_message(&error.to_string()), "Open failed with a fatal error");
                    self.transition(
                        ConnectionStatus::Disconnected,
                        error.connection_reason(),
                        Some(&error),
                    );
                    return Err(DeviceError::Transport(error));
                }

                let decision = read_policy(policy).decide(retries, error.open_retry_status());
                if !decision.should_retry {
                    error!(attempts = retries + 1, "Retry policy gave up on open");
                    self.transition(
                        ConnectionStatus::Disconnected,
                        ConnectionStatusReason::RetryExpired,
                        Some(&error),
                    );
                    return Err(DeviceError::RetryExpired {
                        attempts: retries + 1,
                        source: error,
                    });
                }

                if started.elapsed() + decision.wait >= options.operation_timeout {
                    return Err(self.give_up_on_timeout(started, error));
                }

                self.transition(
                    ConnectionStatus::DisconnectedRetrying,
                    error.connection_reason(),
                    Some(&error),
                );
                retries += 1;
                warn!(
                    retry = retries,
                    wait_ms = decision.wait.as_millis() as u64,
                    error = %sanitize_error_message(&error.to_string()),
                    "Open failed, retrying"
                );

                if interruptible_sleep(shutdown_rx, decision.wait).await {
                    info!("Reconnect cancelled by shutdown");
                    return Err(DeviceError::Closed);
                }
            }
        }
        .instrument(span)
        .await
    }

    fn give_up_on_timeout(&self, started: Instant, source: TransportError) -> DeviceError {
        error!(elapsed_ms = started.elapsed().as_millis() as u64, "Operation timeout exceeded while opening");
        self.transition(
            ConnectionStatus::Disconnected,
            ConnectionStatusReason::RetryExpired,
            Some(&source),
        );
        DeviceError::OperationTimeout {
            elapsed: started.elapsed(),
            source,
        }
    }
}

/// Current policy; a poisoned slot still holds a usable policy
pub fn read_policy(policy: &SharedRetryPolicy) -> Arc<dyn RetryPolicy> {
    policy
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}
