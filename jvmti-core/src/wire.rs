// Event packet wire format
//
// Batches of events are framed as JDWP composite event commands so an
// out-of-process debugger front end can consume them.
//
// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - always 0x00, events are commands
// command set (1 byte) - 64 (Event)
// command (1 byte) - 100 (Composite)
// suspend policy (1 byte)
// event count (4 bytes)
// events (variable)
//
// Each event is: kind (1 byte), request id (4 bytes), thread (8 bytes), then a
// kind-specific payload. All multi-byte values are big-endian.

use crate::events::Event;
use crate::reader::{read_bool, read_i32, read_location, read_u32, read_u64, read_u8};
use crate::types::{FieldKey, Location};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

pub const HEADER_SIZE: usize = 11;
pub const EVENT_COMMAND_SET: u8 = 64;
pub const COMPOSITE_COMMAND: u8 = 100;

/// Upper bound accepted when decoding (10MB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Request id carried by events not tied to a particular request
pub const NO_REQUEST: i32 = 0;

/// JDWP event kind codes
pub mod event_kinds {
    pub const SINGLE_STEP: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const FRAME_POP: u8 = 3;
    pub const EXCEPTION: u8 = 4;
    pub const FIELD_ACCESS: u8 = 20;
    pub const FIELD_MODIFICATION: u8 = 21;
    pub const EXCEPTION_CATCH: u8 = 30;
    pub const METHOD_EXIT: u8 = 41;
}

/// JDWP suspend policies
pub mod suspend_policy {
    pub const NONE: u8 = 0;
    pub const EVENT_THREAD: u8 = 1;
    pub const ALL: u8 = 2;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Not enough data for {0}")]
    Truncated(&'static str),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Unsupported event kind: {0}")]
    UnknownKind(u8),
}

/// A decoded composite event command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPacket {
    pub id: u32,
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

pub fn event_kind(event: &Event) -> u8 {
    match event {
        Event::SingleStep { .. } => event_kinds::SINGLE_STEP,
        Event::Breakpoint { .. } => event_kinds::BREAKPOINT,
        Event::FramePop { .. } => event_kinds::FRAME_POP,
        Event::Exception { .. } => event_kinds::EXCEPTION,
        Event::ExceptionCatch { .. } => event_kinds::EXCEPTION_CATCH,
        Event::FieldAccess { .. } => event_kinds::FIELD_ACCESS,
        Event::FieldModification { .. } => event_kinds::FIELD_MODIFICATION,
        Event::MethodExit { .. } => event_kinds::METHOD_EXIT,
    }
}

fn put_location(buf: &mut BytesMut, location: &Location) {
    buf.put_u64(location.method as u64);
    buf.put_u64(location.index as u64);
}

fn put_event(buf: &mut BytesMut, event: &Event) {
    buf.put_u8(event_kind(event));
    buf.put_i32(NO_REQUEST);
    buf.put_u64(event.thread());

    match event {
        Event::SingleStep { location, .. } | Event::Breakpoint { location, .. } => {
            put_location(buf, location);
        }
        Event::Exception {
            location,
            exception,
            catch_location,
            ..
        } => {
            put_location(buf, location);
            buf.put_u64(*exception);
            match catch_location {
                Some(catch) => {
                    buf.put_u8(1);
                    put_location(buf, catch);
                }
                None => buf.put_u8(0),
            }
        }
        Event::ExceptionCatch {
            location,
            exception,
            ..
        } => {
            put_location(buf, location);
            buf.put_u64(*exception);
        }
        Event::FramePop {
            method,
            popped_by_exception,
            ..
        }
        | Event::MethodExit {
            method,
            popped_by_exception,
            ..
        } => {
            buf.put_u64(*method as u64);
            buf.put_u8(*popped_by_exception as u8);
        }
        Event::FieldAccess {
            location,
            field,
            object,
            ..
        }
        | Event::FieldModification {
            location,
            field,
            object,
            ..
        } => {
            put_location(buf, location);
            buf.put_u64(field.class);
            buf.put_u64(field.field);
            buf.put_u64(*object);
        }
    }
}

/// Encode `events` as one composite event command
pub fn encode_event_packet(id: u32, suspend_policy: u8, events: &[Event]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 5 + events.len() * 40);

    buf.put_u32(0); // length, patched below
    buf.put_u32(id);
    buf.put_u8(0x00); // command flag
    buf.put_u8(EVENT_COMMAND_SET);
    buf.put_u8(COMPOSITE_COMMAND);

    buf.put_u8(suspend_policy);
    buf.put_i32(events.len() as i32);
    for event in events {
        put_event(&mut buf, event);
    }

    let length = buf.len() as u32;
    buf[0..4].copy_from_slice(&length.to_be_bytes());
    buf.freeze()
}

/// Decode a full packet, header included
pub fn decode_event_packet(data: &[u8]) -> Result<EventPacket, DecodeError> {
    let mut buf = data;
    if buf.remaining() < HEADER_SIZE {
        return Err(DecodeError::Truncated("packet header"));
    }

    let length = read_u32(&mut buf)? as usize;
    let id = read_u32(&mut buf)?;
    let flags = read_u8(&mut buf)?;
    let command_set = read_u8(&mut buf)?;
    let command = read_u8(&mut buf)?;

    if length != data.len() {
        return Err(DecodeError::Malformed(format!(
            "length field {} does not match packet size {}",
            length,
            data.len()
        )));
    }
    if length > MAX_PACKET_SIZE {
        return Err(DecodeError::Malformed(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }
    if flags != 0 || command_set != EVENT_COMMAND_SET || command != COMPOSITE_COMMAND {
        return Err(DecodeError::Malformed(format!(
            "not a composite event command: flags={:#x} set={} command={}",
            flags, command_set, command
        )));
    }

    let suspend_policy = read_u8(&mut buf)?;
    let count = read_i32(&mut buf)?;
    if count < 0 {
        return Err(DecodeError::Malformed(format!("negative event count {}", count)));
    }

    // Each event takes at least 13 bytes, so a bogus count cannot over-allocate
    let mut events = Vec::with_capacity((count as usize).min(buf.remaining() / 13));
    for _ in 0..count {
        events.push(read_event(&mut buf)?);
    }

    if buf.has_remaining() {
        warn!("{} trailing bytes after event packet {}", buf.remaining(), id);
    }

    Ok(EventPacket {
        id,
        suspend_policy,
        events,
    })
}

fn read_event(buf: &mut &[u8]) -> Result<Event, DecodeError> {
    let kind = read_u8(buf)?;
    let _request_id = read_i32(buf)?;
    let thread = read_u64(buf)?;

    let event = match kind {
        event_kinds::SINGLE_STEP => Event::SingleStep {
            thread,
            location: read_location(buf)?,
        },
        event_kinds::BREAKPOINT => Event::Breakpoint {
            thread,
            location: read_location(buf)?,
        },
        event_kinds::EXCEPTION => {
            let location = read_location(buf)?;
            let exception = read_u64(buf)?;
            let catch_location = if read_bool(buf)? {
                Some(read_location(buf)?)
            } else {
                None
            };
            Event::Exception {
                thread,
                location,
                exception,
                catch_location,
            }
        }
        event_kinds::EXCEPTION_CATCH => Event::ExceptionCatch {
            thread,
            location: read_location(buf)?,
            exception: read_u64(buf)?,
        },
        event_kinds::FRAME_POP | event_kinds::METHOD_EXIT => {
            let method = read_u64(buf)?;
            let method = u32::try_from(method)
                .map_err(|_| DecodeError::Malformed(format!("method id {:#x} out of range", method)))?;
            let popped_by_exception = read_bool(buf)?;
            if kind == event_kinds::FRAME_POP {
                Event::FramePop {
                    thread,
                    method,
                    popped_by_exception,
                }
            } else {
                Event::MethodExit {
                    thread,
                    method,
                    popped_by_exception,
                }
            }
        }
        event_kinds::FIELD_ACCESS | event_kinds::FIELD_MODIFICATION => {
            let location = read_location(buf)?;
            let field = FieldKey {
                class: read_u64(buf)?,
                field: read_u64(buf)?,
            };
            let object = read_u64(buf)?;
            if kind == event_kinds::FIELD_ACCESS {
                Event::FieldAccess {
                    thread,
                    location,
                    field,
                    object,
                }
            } else {
                Event::FieldModification {
                    thread,
                    location,
                    field,
                    object,
                }
            }
        }
        // Payload size unknown, so the rest of the packet is unreadable
        _ => return Err(DecodeError::UnknownKind(kind)),
    };
    Ok(event)
}
