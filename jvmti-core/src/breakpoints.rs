// Breakpoint registry
//
// Active breakpoints live in a flat table of packed IDs, scanned linearly. A
// per-method cache answers "does this method have breakpoints" in O(1) for the
// code generator and materializes each method's sorted list on demand.
//
// Clearing a breakpoint does not recompile code that already contains the
// trap. Stale traps are filtered by re-checking the live table in `event`.

use crate::error::{JvmtiError, JvmtiResult};
use crate::events::{post, Event, EventSink};
use crate::runtime::CodeManager;
use crate::thread;
use crate::types::{CodeIndex, Location, MethodId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Bits identifying a (method, location) pair
pub const ID_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
/// Trap compiled for single-stepping
pub const SINGLE_STEP: u64 = 1 << 63;
/// Trap compiled for single-stepping at a location that also had a breakpoint
pub const SINGLE_STEP_AND_BREAK: u64 = 1 << 62;

const MAX_LOCATION: CodeIndex = 0xFFFF;

// Empty table slot. Never equal to a masked ID.
const UNSET: u64 = u64::MAX;

/// Packed `(location << 32) | method` trap identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointId(u64);

impl BreakpointId {
    pub fn new(method: MethodId, location: CodeIndex) -> JvmtiResult<Self> {
        if location > MAX_LOCATION {
            return Err(JvmtiError::InvalidLocation(location));
        }
        Ok(Self(((location as u64) << 32) | method as u64))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn method(self) -> MethodId {
        self.0 as u32
    }

    pub const fn location(self) -> CodeIndex {
        ((self.0 & ID_MASK) >> 32) as u32
    }

    /// The ID with the single-step bits stripped
    pub const fn key(self) -> Self {
        Self(self.0 & ID_MASK)
    }

    pub const fn is_single_step(self) -> bool {
        self.0 & (SINGLE_STEP | SINGLE_STEP_AND_BREAK) != 0
    }

    pub const fn also_breaks(self) -> bool {
        self.0 & SINGLE_STEP_AND_BREAK != 0
    }

    /// Encoding the code generator plants for a single-step trap
    pub const fn stepping(self, also_break: bool) -> Self {
        let flag = if also_break { SINGLE_STEP_AND_BREAK } else { SINGLE_STEP };
        Self((self.0 & ID_MASK) | flag)
    }

    pub fn as_location(self) -> Location {
        Location::new(self.method(), self.location())
    }
}

impl fmt::Debug for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BreakpointId({:#018x})", self.0)
    }
}

/// Growable array of active IDs with `UNSET` in empty slots
struct BreakpointTable {
    slots: Vec<u64>,
    live: usize,
}

impl BreakpointTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![UNSET; capacity.max(1)],
            live: 0,
        }
    }

    fn find(&self, key: u64) -> Option<usize> {
        self.slots.iter().position(|&slot| slot == key)
    }

    /// Returns false if `key` is already present
    fn insert(&mut self, key: u64) -> bool {
        let mut free = None;
        for (i, &slot) in self.slots.iter().enumerate() {
            if slot == key {
                return false;
            }
            if slot == UNSET && free.is_none() {
                free = Some(i);
            }
        }

        let index = match free {
            Some(i) => i,
            None => {
                let old = self.slots.len();
                self.slots.resize(old * 2, UNSET);
                debug!("Breakpoint table grown from {} to {} slots", old, old * 2);
                old
            }
        };

        self.slots[index] = key;
        self.live += 1;
        true
    }

    fn remove(&mut self, key: u64) -> bool {
        match self.find(key) {
            Some(i) => {
                self.slots[i] = UNSET;
                self.live -= 1;
                true
            }
            None => false,
        }
    }

    fn ids(&self) -> impl Iterator<Item = BreakpointId> + '_ {
        self.slots
            .iter()
            .filter(|&&slot| slot != UNSET)
            .map(|&slot| BreakpointId(slot))
    }

    fn has_method(&self, method: MethodId) -> bool {
        self.ids().any(|id| id.method() == method)
    }
}

/// Per-method cache entry. Absence means the method has no breakpoints.
enum MethodBreakpoints {
    /// Has breakpoints, list not yet materialized
    Pending,
    Sorted(Arc<[BreakpointId]>),
}

pub struct BreakpointRegistry {
    table: RwLock<BreakpointTable>,
    methods: RwLock<FxHashMap<MethodId, MethodBreakpoints>>,
    code: Arc<dyn CodeManager>,
    sink: Arc<dyn EventSink>,
}

impl BreakpointRegistry {
    pub fn new(capacity: usize, code: Arc<dyn CodeManager>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            table: RwLock::new(BreakpointTable::with_capacity(capacity)),
            methods: RwLock::new(FxHashMap::default()),
            code,
            sink,
        }
    }

    /// Set a breakpoint and invalidate the method's compiled code so the trap
    /// gets planted.
    pub fn set(&self, method: MethodId, location: CodeIndex) -> JvmtiResult<BreakpointId> {
        let id = BreakpointId::new(method, location)?;
        {
            let mut table = self.table.write();
            if !table.insert(id.raw()) {
                return Err(JvmtiError::Duplicate);
            }
            // Drops any materialized list
            self.methods
                .write()
                .insert(method, MethodBreakpoints::Pending);
        }

        debug!("Set breakpoint {}", id.as_location());
        self.code.invalidate(method);
        Ok(id)
    }

    pub fn clear(&self, method: MethodId, location: CodeIndex) -> JvmtiResult<()> {
        let id = BreakpointId::new(method, location)?;
        let mut table = self.table.write();
        if !table.remove(id.raw()) {
            return Err(JvmtiError::NotFound);
        }

        let mut methods = self.methods.write();
        if table.has_method(method) {
            methods.insert(method, MethodBreakpoints::Pending);
        } else {
            methods.remove(&method);
        }

        debug!("Cleared breakpoint {}", id.as_location());
        Ok(())
    }

    /// O(1) check used when deciding whether to emit traps. Never
    /// materializes the method's list.
    pub fn has_breakpoints(&self, method: MethodId) -> bool {
        self.methods.read().contains_key(&method)
    }

    /// Breakpoints in `method`, sorted by location
    pub fn breakpoints(&self, method: MethodId) -> Arc<[BreakpointId]> {
        if let Some(MethodBreakpoints::Sorted(list)) = self.methods.read().get(&method) {
            return Arc::clone(list);
        }

        let table = self.table.read();
        let mut methods = self.methods.write();
        match methods.get(&method) {
            None => Arc::from([]),
            Some(MethodBreakpoints::Sorted(list)) => Arc::clone(list),
            Some(MethodBreakpoints::Pending) => {
                let mut ids: Vec<BreakpointId> =
                    table.ids().filter(|id| id.method() == method).collect();
                ids.sort_unstable();
                let list: Arc<[BreakpointId]> = ids.into();
                methods.insert(method, MethodBreakpoints::Sorted(Arc::clone(&list)));
                list
            }
        }
    }

    /// Every live breakpoint, in table order
    pub fn all(&self) -> Vec<BreakpointId> {
        self.table.read().ids().collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trap entry point for instrumented code.
    ///
    /// `encoded` is the ID planted at compile time, possibly carrying the
    /// single-step bits. The single-step event precedes the breakpoint event
    /// at the same location.
    pub fn event(&self, encoded: u64) {
        let thread = thread::current();
        if thread.in_agent_callback() {
            trace!("Ignoring trap {:#x} inside agent callback", encoded);
            return;
        }

        let id = BreakpointId::from_raw(encoded);
        let location = id.as_location();

        if id.is_single_step() {
            post(
                self.sink.as_ref(),
                Event::SingleStep {
                    thread: thread.id(),
                    location,
                },
            );
            if !id.also_breaks() {
                return;
            }
        }

        // The breakpoint may have been cleared since the trap was compiled
        let live = self.table.read().find(id.key().raw()).is_some();
        if live {
            post(
                self.sink.as_ref(),
                Event::Breakpoint {
                    thread: thread.id(),
                    location,
                },
            );
        } else {
            trace!("Stale breakpoint trap at {}", location);
        }
    }
}
