// Instrumentation events
//
// Structured records produced by trap handlers and the exception analyzer and
// handed to an external event-delivery component through `EventSink`.

use crate::types::*;
use serde::{Deserialize, Serialize};

/// Event kinds an agent can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventType {
    SingleStep = 0,
    Breakpoint = 1,
    FramePop = 2,
    Exception = 3,
    ExceptionCatch = 4,
    MethodExit = 5,
    FieldAccess = 6,
    FieldModification = 7,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::SingleStep,
        EventType::Breakpoint,
        EventType::FramePop,
        EventType::Exception,
        EventType::ExceptionCatch,
        EventType::MethodExit,
        EventType::FieldAccess,
        EventType::FieldModification,
    ];

    /// Bit used in an enabled-event mask
    pub fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SingleStep {
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Exception {
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    /// Raised by instrumented handler entry, see `ExceptionAnalyzer::catch_hook`
    ExceptionCatch {
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
    },
    FramePop {
        thread: ThreadId,
        method: MethodId,
        popped_by_exception: bool,
    },
    MethodExit {
        thread: ThreadId,
        method: MethodId,
        popped_by_exception: bool,
    },
    FieldAccess {
        thread: ThreadId,
        location: Location,
        field: FieldKey,
        object: ObjectId,
    },
    FieldModification {
        thread: ThreadId,
        location: Location,
        field: FieldKey,
        object: ObjectId,
    },
}

impl Event {
    pub fn kind(&self) -> EventType {
        match self {
            Event::SingleStep { .. } => EventType::SingleStep,
            Event::Breakpoint { .. } => EventType::Breakpoint,
            Event::Exception { .. } => EventType::Exception,
            Event::ExceptionCatch { .. } => EventType::ExceptionCatch,
            Event::FramePop { .. } => EventType::FramePop,
            Event::MethodExit { .. } => EventType::MethodExit,
            Event::FieldAccess { .. } => EventType::FieldAccess,
            Event::FieldModification { .. } => EventType::FieldModification,
        }
    }

    pub fn thread(&self) -> ThreadId {
        match self {
            Event::SingleStep { thread, .. }
            | Event::Breakpoint { thread, .. }
            | Event::Exception { thread, .. }
            | Event::ExceptionCatch { thread, .. }
            | Event::FramePop { thread, .. }
            | Event::MethodExit { thread, .. }
            | Event::FieldAccess { thread, .. }
            | Event::FieldModification { thread, .. } => *thread,
        }
    }
}

/// Receiver side of event delivery.
///
/// Implementations filter by per-agent subscription and invoke agent
/// callbacks. `deliver` is called on the trapping thread and must not block on
/// anything the trapping thread might hold.
pub trait EventSink: Send + Sync {
    /// Whether any agent wants `kind` events for `thread`
    fn wants(&self, kind: EventType, thread: ThreadId) -> bool;

    fn deliver(&self, event: Event);
}

/// Deliver `event` if its kind is wanted for its thread
pub(crate) fn post(sink: &dyn EventSink, event: Event) {
    if sink.wants(event.kind(), event.thread()) {
        sink.deliver(event);
    }
}
