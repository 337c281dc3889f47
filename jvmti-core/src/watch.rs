// Field watches
//
// Access and modification watches keyed by (class, field). Compiled field
// accessors consult `is_watched` before calling the trap entry points.

use crate::error::{JvmtiError, JvmtiResult};
use crate::events::{post, Event, EventSink};
use crate::thread;
use crate::types::*;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Access,
    Modification,
}

impl WatchKind {
    fn bit(self) -> u8 {
        match self {
            WatchKind::Access => 0b01,
            WatchKind::Modification => 0b10,
        }
    }
}

pub struct FieldWatches {
    // Bitset of WatchKind per field, absent when no watch is set
    watches: RwLock<FxHashMap<FieldKey, u8>>,
    sink: Arc<dyn EventSink>,
}

impl FieldWatches {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            watches: RwLock::new(FxHashMap::default()),
            sink,
        }
    }

    pub fn set(&self, field: FieldKey, kind: WatchKind) -> JvmtiResult<()> {
        let mut watches = self.watches.write();
        let state = watches.entry(field).or_insert(0);
        if *state & kind.bit() != 0 {
            return Err(JvmtiError::Duplicate);
        }
        *state |= kind.bit();
        debug!("Set {:?} watch on {:?}", kind, field);
        Ok(())
    }

    pub fn clear(&self, field: FieldKey, kind: WatchKind) -> JvmtiResult<()> {
        let mut watches = self.watches.write();
        let Some(state) = watches.get_mut(&field) else {
            return Err(JvmtiError::NotFound);
        };
        if *state & kind.bit() == 0 {
            return Err(JvmtiError::NotFound);
        }
        *state &= !kind.bit();
        if *state == 0 {
            watches.remove(&field);
        }
        debug!("Cleared {:?} watch on {:?}", kind, field);
        Ok(())
    }

    pub fn is_watched(&self, field: FieldKey, kind: WatchKind) -> bool {
        self.watches
            .read()
            .get(&field)
            .is_some_and(|state| state & kind.bit() != 0)
    }

    pub fn watched(&self, kind: WatchKind) -> Vec<FieldKey> {
        self.watches
            .read()
            .iter()
            .filter(|(_, state)| *state & kind.bit() != 0)
            .map(|(field, _)| *field)
            .collect()
    }

    /// Trap entry for a read of a watched field
    pub fn on_access(&self, location: Location, field: FieldKey, object: ObjectId) {
        if let Some(thread) = self.trapping_thread(field, WatchKind::Access) {
            post(
                self.sink.as_ref(),
                Event::FieldAccess {
                    thread,
                    location,
                    field,
                    object,
                },
            );
        }
    }

    /// Trap entry for a write of a watched field
    pub fn on_modification(&self, location: Location, field: FieldKey, object: ObjectId) {
        if let Some(thread) = self.trapping_thread(field, WatchKind::Modification) {
            post(
                self.sink.as_ref(),
                Event::FieldModification {
                    thread,
                    location,
                    field,
                    object,
                },
            );
        }
    }

    fn trapping_thread(&self, field: FieldKey, kind: WatchKind) -> Option<ThreadId> {
        let thread = thread::current();
        if thread.in_agent_callback() || !self.is_watched(field, kind) {
            return None;
        }
        Some(thread.id())
    }
}
