// Agent local storage
//
// Per-environment slots for agent data: one per live thread plus one for the
// environment itself.

use crate::error::{JvmtiError, JvmtiResult};
use crate::thread::AgentThread;
use crate::types::{Opaque, ThreadId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

struct ThreadSlot {
    thread: Weak<AgentThread>,
    value: Opaque,
}

impl ThreadSlot {
    fn is_live(&self) -> bool {
        self.thread.upgrade().is_some_and(|t| t.is_alive())
    }
}

#[derive(Default)]
pub struct ThreadLocalStorage {
    slots: RwLock<FxHashMap<ThreadId, ThreadSlot>>,
}

impl ThreadLocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` for `thread`; `None` clears the slot
    pub fn set(&self, thread: &Arc<AgentThread>, value: Option<Opaque>) -> JvmtiResult<()> {
        if !thread.is_alive() {
            return Err(JvmtiError::ThreadNotAlive);
        }

        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live());
        if slots.len() != before {
            trace!("Dropped storage for {} exited threads", before - slots.len());
        }

        match value {
            Some(value) => {
                slots.insert(
                    thread.id(),
                    ThreadSlot {
                        thread: Arc::downgrade(thread),
                        value,
                    },
                );
            }
            None => {
                slots.remove(&thread.id());
            }
        }
        Ok(())
    }

    pub fn get(&self, thread: &Arc<AgentThread>) -> JvmtiResult<Option<Opaque>> {
        if !thread.is_alive() {
            return Err(JvmtiError::ThreadNotAlive);
        }
        Ok(self
            .slots
            .read()
            .get(&thread.id())
            .map(|slot| Arc::clone(&slot.value)))
    }

    /// Threads currently holding a value
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|slot| slot.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct EnvironmentStorage {
    value: RwLock<Option<Opaque>>,
}

impl EnvironmentStorage {
    pub fn get(&self) -> Option<Opaque> {
        self.value.read().clone()
    }

    pub fn set(&self, value: Option<Opaque>) {
        *self.value.write() = value;
    }
}
