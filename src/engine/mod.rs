//! Transport engine internals
//!
//! - [`queue`] - outbound packets, in-flight tracking and completion callbacks
//! - [`state`] - connection status and the reconnect loop

pub mod queue;
pub mod state;

pub use queue::{
    Completion, CompletionCallback, DrainReport, MessageQueueEngine, PacketPayload, SendTicket,
};
pub use state::{
    interruptible_sleep, ConnectionStateMachine, ConnectionStatusCallback, ConnectionStatusChange,
    EstablishOptions, SharedRetryPolicy,
};
