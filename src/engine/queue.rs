//! Outbound message queues
//!
//! A packet moves WAITING -> IN_FLIGHT -> callback queue, or back to WAITING after a
//! retryable failure. The queue lock is only ever held for pushes and pops; every binding call
//! happens with the lock released so `enqueue` never waits behind a drain.

use crate::error::{DeviceError, DeviceResult, TransportError};
use crate::message::Message;
use crate::retry::RetryPolicy;
use crate::status::IotHubStatusCode;
use crate::transport::{DeliveryTag, ProtocolBinding, SendOutcome};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Callback run once with the final status of a send
pub type CompletionCallback = Box<dyn FnOnce(IotHubStatusCode) + Send + 'static>;

/// Where the final status of a packet goes
pub enum Completion {
    Ticket(oneshot::Sender<IotHubStatusCode>),
    Callback(CompletionCallback),
}

impl Completion {
    /// Completion backed by a oneshot channel plus the ticket that observes it
    pub fn ticket() -> (Self, SendTicket) {
        let (tx, rx) = oneshot::channel();
        (Completion::Ticket(tx), SendTicket { receiver: rx })
    }

    fn complete(self, status: IotHubStatusCode) {
        match self {
            Completion::Ticket(sender) => {
                // The caller may have dropped the ticket
                let _ = sender.send(status);
            }
            Completion::Callback(callback) => callback(status),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Ticket(_) => f.write_str("Completion::Ticket"),
            Completion::Callback(_) => f.write_str("Completion::Callback"),
        }
    }
}

/// Resolves to the final status of one enqueued send (or one batch)
#[derive(Debug)]
pub struct SendTicket {
    receiver: oneshot::Receiver<IotHubStatusCode>,
}

impl Future for SendTicket {
    type Output = IotHubStatusCode;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(IotHubStatusCode::MessageCancelledOnClose))
    }
}

/// What one packet carries to the binding
#[derive(Debug, Clone)]
pub enum PacketPayload {
    Single(Message),
    /// Sent as one request, completed with one status
    Batch(Vec<Message>),
}

impl PacketPayload {
    /// A batch counts as expired once any message in it is
    fn is_expired(&self) -> bool {
        match self {
            PacketPayload::Single(message) => message.is_expired(),
            PacketPayload::Batch(messages) => messages.iter().any(Message::is_expired),
        }
    }

    fn coalescable(&self) -> Option<&Message> {
        match self {
            PacketPayload::Single(message)
                if message.operation() == crate::message::DeviceOperation::Telemetry =>
            {
                Some(message)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct OutboundPacket {
    id: u64,
    payload: PacketPayload,
    completion: Completion,
    retry_count: u32,
    not_before: Option<Instant>,
    sent_at: Option<Instant>,
}

impl OutboundPacket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn payload(&self) -> &PacketPayload {
        &self.payload
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |not_before| now >= not_before)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    open: bool,
    next_id: u64,
    waiting: VecDeque<OutboundPacket>,
    /// Handed to the binding by a running drain, keyed by packet id
    sending: BTreeMap<u64, OutboundPacket>,
    in_flight: HashMap<DeliveryTag, OutboundPacket>,
    callbacks: VecDeque<(Completion, IotHubStatusCode)>,
}

/// Counters from one Send drain
#[derive(Debug, Default)]
pub struct DrainReport {
    pub sent: usize,
    pub requeued: usize,
    pub completed: usize,
    /// Set when the binding lost its connection mid-drain; unsent packets stay queued
    pub connection_error: Option<TransportError>,
}

/// Waiting, in-flight and callback queues of one connection
#[derive(Debug, Default)]
pub struct MessageQueueEngine {
    state: StdMutex<QueueState>,
}

fn is_connection_failure(error: &TransportError, binding_open: bool) -> bool {
    !binding_open || matches!(error, TransportError::ConnectionLost(_) | TransportError::Closed)
}

impl MessageQueueEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept or refuse new packets
    pub fn set_open(&self, open: bool) {
        self.lock().open = open;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Append a packet to the waiting queue
    pub fn enqueue(&self, payload: PacketPayload, completion: Completion) -> DeviceResult<u64> {
        let mut state = self.lock();
        if !state.open {
            return Err(DeviceError::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.waiting.push_back(OutboundPacket {
            id,
            payload,
            completion,
            retry_count: 0,
            not_before: None,
            sent_at: None,
        });
        debug!(packet = id, waiting = state.waiting.len(), "Packet enqueued");
        Ok(id)
    }

    /// Pop every ready waiting packet once and hand it to the binding
    ///
    /// With `coalesce` set, plain telemetry packets are sent together through `send_batch` and
    /// share its outcome. Packets stay owned by the engine while the binding works on them, so
    /// `cancel_all` still reaches them if the drain is abandoned.
    pub async fn drain_and_send(
        &self,
        binding: &mut dyn ProtocolBinding,
        policy: &dyn RetryPolicy,
        coalesce: bool,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        let (expired, mut sendable) = self.claim_ready(Instant::now());
        for packet in expired {
            debug!(packet = packet.id, "Message expired before send");
            self.complete(packet, IotHubStatusCode::MessageExpired);
            report.completed += 1;
        }
        if sendable.is_empty() {
            return report;
        }

        if coalesce {
            let (batchable, rest): (Vec<_>, Vec<_>) = sendable
                .into_iter()
                .partition(|(_, payload)| payload.coalescable().is_some());
            if !batchable.is_empty() {
                if let Some(mut unsent) = self
                    .send_coalesced(binding, policy, batchable, &mut report)
                    .await
                {
                    unsent.extend(rest.iter().map(|(id, _)| *id));
                    unsent.sort_unstable();
                    self.requeue_front(unsent);
                    return report;
                }
            }
            sendable = rest;
        }

        let mut pending = sendable.into_iter();
        while let Some((id, payload)) = pending.next() {
            if let Some(unsent) = self.send_one(binding, policy, id, &payload, &mut report).await {
                self.requeue_front(
                    std::iter::once(unsent)
                        .chain(pending.by_ref().map(|(id, _)| id))
                        .collect(),
                );
                break;
            }
        }

        report
    }

    /// Move ready packets into the sending set and return what to put on the wire
    ///
    /// Expired packets come back separately for completion.
    fn claim_ready(&self, now: Instant) -> (Vec<OutboundPacket>, Vec<(u64, PacketPayload)>) {
        let mut state = self.lock();
        let (ready, deferred): (VecDeque<_>, VecDeque<_>) =
            state.waiting.drain(..).partition(|packet| packet.is_ready(now));
        state.waiting = deferred;

        let mut expired = Vec::new();
        let mut sendable = Vec::with_capacity(ready.len());
        for packet in ready {
            if packet.payload.is_expired() {
                expired.push(packet);
            } else {
                sendable.push((packet.id, packet.payload.clone()));
                state.sending.insert(packet.id, packet);
            }
        }
        (expired, sendable)
    }

    /// `None` once the packet was cancelled while its send was running
    fn take_sending(&self, id: u64) -> Option<OutboundPacket> {
        self.lock().sending.remove(&id)
    }

    fn mark_in_flight(&self, id: u64, tag: DeliveryTag) {
        let mut state = self.lock();
        if let Some(mut packet) = state.sending.remove(&id) {
            packet.sent_at = Some(Instant::now());
            state.in_flight.insert(tag, packet);
        }
    }

    /// Returns the packet id when the connection dropped before it could be sent
    async fn send_one(
        &self,
        binding: &mut dyn ProtocolBinding,
        policy: &dyn RetryPolicy,
        id: u64,
        payload: &PacketPayload,
        report: &mut DrainReport,
    ) -> Option<u64> {
        let result = match payload {
            PacketPayload::Single(message) => binding.send(message).await,
            PacketPayload::Batch(messages) => binding
                .send_batch(messages)
                .await
                .map(SendOutcome::Completed),
        };

        match result {
            Ok(SendOutcome::Completed(status)) => {
                report.sent += 1;
                if let Some(packet) = self.take_sending(id) {
                    self.complete(packet, status);
                    report.completed += 1;
                }
            }
            Ok(SendOutcome::AwaitingAck(tag)) => {
                report.sent += 1;
                self.mark_in_flight(id, tag);
            }
            Err(error) if is_connection_failure(&error, binding.is_open()) => {
                warn!(packet = id, error = %error, "Send interrupted by connection loss");
                report.requeued += 1;
                report.connection_error = Some(error);
                return Some(id);
            }
            Err(error) => {
                if let Some(packet) = self.take_sending(id) {
                    self.handle_failure(packet, &error, policy, report);
                }
            }
        }
        None
    }

    /// Returns the packet ids when the connection dropped before the batch could be sent
    async fn send_coalesced(
        &self,
        binding: &mut dyn ProtocolBinding,
        policy: &dyn RetryPolicy,
        packets: Vec<(u64, PacketPayload)>,
        report: &mut DrainReport,
    ) -> Option<Vec<u64>> {
        let messages: Vec<Message> = packets
            .iter()
            .filter_map(|(_, payload)| payload.coalescable().cloned())
            .collect();
        let ids: Vec<u64> = packets.iter().map(|(id, _)| *id).collect();

        match binding.send_batch(&messages).await {
            Ok(status) => {
                report.sent += ids.len();
                for packet in ids.into_iter().filter_map(|id| self.take_sending(id)) {
                    self.complete(packet, status);
                    report.completed += 1;
                }
            }
            Err(error) if is_connection_failure(&error, binding.is_open()) => {
                report.requeued += ids.len();
                report.connection_error = Some(error);
                return Some(ids);
            }
            Err(error) => {
                for packet in ids.into_iter().filter_map(|id| self.take_sending(id)) {
                    self.handle_failure(packet, &error, policy, report);
                }
            }
        }
        None
    }

    /// Retry at the tail after the policy's wait, or complete with the error's status
    fn handle_failure(
        &self,
        mut packet: OutboundPacket,
        error: &TransportError,
        policy: &dyn RetryPolicy,
        report: &mut DrainReport,
    ) {
        let status = error.status_code();
        let decision = policy.decide(packet.retry_count, status);

        if error.is_retryable() && decision.should_retry {
            packet.retry_count += 1;
            packet.not_before = Some(Instant::now() + decision.wait);
            debug!(
                packet = packet.id,
                retry = packet.retry_count,
                wait_ms = decision.wait.as_millis() as u64,
                status = %status,
                "Send failed, will retry"
            );
            self.lock().waiting.push_back(packet);
            report.requeued += 1;
        } else {
            warn!(packet = packet.id, status = %status, error = %error, "Send failed permanently");
            self.complete(packet, status);
            report.completed += 1;
        }
    }

    /// Move sending packets back to the head of the waiting queue in the given order
    fn requeue_front(&self, ids: Vec<u64>) {
        let mut state = self.lock();
        for id in ids.into_iter().rev() {
            if let Some(packet) = state.sending.remove(&id) {
                state.waiting.push_front(packet);
            }
        }
    }

    fn complete(&self, packet: OutboundPacket, status: IotHubStatusCode) {
        self.lock().callbacks.push_back((packet.completion, status));
    }

    /// Move acknowledged in-flight packets to the callback queue
    pub fn apply_acks(&self, acks: Vec<(DeliveryTag, IotHubStatusCode)>) -> usize {
        if acks.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        let mut applied = 0;
        for (tag, status) in acks {
            match state.in_flight.remove(&tag) {
                Some(packet) => {
                    state.callbacks.push_back((packet.completion, status));
                    applied += 1;
                }
                None => debug!(tag = %tag, "Acknowledgement for unknown delivery"),
            }
        }
        applied
    }

    /// Invoke every queued completion once; a panicking callback only loses itself
    pub fn drain_and_invoke_callbacks(&self) -> usize {
        let entries: Vec<_> = self.lock().callbacks.drain(..).collect();
        let count = entries.len();
        for (completion, status) in entries {
            if catch_unwind(AssertUnwindSafe(|| completion.complete(status))).is_err() {
                warn!(status = %status, "Message callback panicked; continuing with the next one");
            }
        }
        count
    }

    /// Put in-flight packets back at the head of the waiting queue, oldest first
    pub fn requeue_in_flight(&self) -> usize {
        let mut state = self.lock();
        let mut packets: Vec<OutboundPacket> = state.in_flight.drain().map(|(_, p)| p).collect();
        packets.sort_by_key(|packet| packet.id);
        let count = packets.len();
        for mut packet in packets.into_iter().rev() {
            packet.sent_at = None;
            state.waiting.push_front(packet);
        }
        if count > 0 {
            debug!(count, "Requeued in-flight packets");
        }
        count
    }

    /// Complete in-flight packets that waited longer than `timeout` for an acknowledgement
    pub fn expire_in_flight(&self, timeout: Duration, now: Instant) -> usize {
        let mut state = self.lock();
        let stale: Vec<DeliveryTag> = state
            .in_flight
            .iter()
            .filter(|(_, packet)| {
                packet
                    .sent_at
                    .is_some_and(|sent_at| now.saturating_duration_since(sent_at) >= timeout)
            })
            .map(|(tag, _)| *tag)
            .collect();
        for tag in &stale {
            if let Some(packet) = state.in_flight.remove(tag) {
                state
                    .callbacks
                    .push_back((packet.completion, IotHubStatusCode::DeviceOperationTimedOut));
            }
        }
        stale.len()
    }

    /// Complete every waiting packet with `status`
    pub fn fail_waiting(&self, status: IotHubStatusCode) -> usize {
        let mut state = self.lock();
        let packets: Vec<_> = state.waiting.drain(..).collect();
        let count = packets.len();
        state
            .callbacks
            .extend(packets.into_iter().map(|packet| (packet.completion, status)));
        count
    }

    /// Complete every waiting, sending and in-flight packet with `status`
    pub fn cancel_all(&self, status: IotHubStatusCode) -> usize {
        let mut state = self.lock();
        let mut packets: Vec<OutboundPacket> = state.in_flight.drain().map(|(_, p)| p).collect();
        packets.extend(std::mem::take(&mut state.sending).into_values());
        packets.extend(state.waiting.drain(..));
        packets.sort_by_key(|packet| packet.id);
        let count = packets.len();
        state
            .callbacks
            .extend(packets.into_iter().map(|packet| (packet.completion, status)));
        count
    }

    /// True iff nothing is waiting, being sent, in flight, or awaiting its callback
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.waiting.is_empty()
            && state.sending.is_empty()
            && state.in_flight.is_empty()
            && state.callbacks.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }
}
