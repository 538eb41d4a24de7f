//! Driver debug messages.
//!
//! Messages the driver reports while a frame is being captured are stored in
//! `DebugMessages` chunks right after the call that provoked them. On replay
//! they are attached to that call's event, and handed to the caller's
//! `DebugSink` when the event is replayed visibly.

use crate::call::EventId;
use crate::serialize::serialized_struct;

serialized_struct! {
    pub struct DebugMessage {
        pub source: u32,
        pub ty: u32,
        pub id: u32,
        pub severity: u32,
        pub message: String,
    }

    /// Payload of a `DebugMessages` chunk.
    pub struct DebugMessageBatch {
        pub event_id: EventId,
        pub messages: Vec<DebugMessage>,
    }
}

/// Receives recorded debug messages during replay.
pub trait DebugSink {
    fn on_debug_messages(&mut self, event: EventId, messages: &[DebugMessage]);
}

impl<F> DebugSink for F
where
    F: FnMut(EventId, &[DebugMessage]),
{
    fn on_debug_messages(&mut self, event: EventId, messages: &[DebugMessage]) {
        self(event, messages)
    }
}
