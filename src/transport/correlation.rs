//! Request-id bookkeeping for request/response operations
//!
//! Every twin request and every received method request leaves one entry here. The matching
//! response consumes it exactly once.

use crate::error::{TransportError, TransportResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// What response an entry is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// Twin GET sent, response expected on the twin response channel
    GetTwin,
    /// Reported-properties PATCH sent, response expected on the twin response channel
    PatchReported,
    /// Method request received, the device still owes a response
    MethodResponse,
}

impl PendingKind {
    /// Answered on the twin response channel
    pub fn is_twin(&self) -> bool {
        matches!(self, PendingKind::GetTwin | PendingKind::PatchReported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: PendingKind,
    pub created_at: Instant,
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingOperation>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outstanding operation; request ids must be unique while pending
    pub fn insert(&mut self, request_id: impl Into<String>, kind: PendingKind) -> TransportResult<()> {
        self.insert_at(request_id, kind, Instant::now())
    }

    pub fn insert_at(
        &mut self,
        request_id: impl Into<String>,
        kind: PendingKind,
        created_at: Instant,
    ) -> TransportResult<()> {
        let request_id = request_id.into();
        if self.pending.contains_key(&request_id) {
            return Err(TransportError::protocol(format!(
                "Request id {request_id} is already pending"
            )));
        }
        self.pending
            .insert(request_id, PendingOperation { kind, created_at });
        Ok(())
    }

    /// Consume the entry for `request_id`, if any
    pub fn take(&mut self, request_id: &str) -> Option<PendingOperation> {
        self.pending.remove(request_id)
    }

    /// Consume the entry only if it is of `kind`; a mismatch leaves it in place
    pub fn take_expecting(
        &mut self,
        request_id: &str,
        kind: PendingKind,
    ) -> Option<PendingOperation> {
        match self.pending.get(request_id) {
            Some(pending) if pending.kind == kind => self.pending.remove(request_id),
            _ => None,
        }
    }

    /// Consume the entry only if it waits for a twin response; method entries stay
    pub fn take_twin_response(&mut self, request_id: &str) -> Option<PendingOperation> {
        match self.pending.get(request_id) {
            Some(pending) if pending.kind.is_twin() => self.pending.remove(request_id),
            _ => None,
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop entries older than `max_age`; returns how many were removed
    pub fn prune_older_than(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|request_id, pending| {
            let keep = now.saturating_duration_since(pending.created_at) < max_age;
            if !keep {
                debug!(request_id = %request_id, kind = ?pending.kind, "Pruning stale pending operation");
            }
            keep
        });
        before - self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
