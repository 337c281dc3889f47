// Raw monitors
//
// Agent-visible mutual exclusion with wait/notify, independent of the
// language's built-in locking. The runtime may suspend any thread at any
// point, including inside native code holding an OS mutex, so ownership and
// queueing are decided only under the monitor's in-process spinlock. The OS
// mutex/condvar pairs are used purely to block and wake. Every wake is a
// broadcast and each woken thread re-checks its own condition.

use crate::error::{fatal, JvmtiError, JvmtiResult};
use crate::spin::SpinLock;
use crate::thread::{self, AgentThread};
use crate::types::ThreadId;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const MONITOR_MAGIC: u32 = 0x5241_574D;

/// Map an agent timeout in milliseconds to a wait bound. Zero and negative
/// values mean wait until notified.
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    if millis <= 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    }
}

/// Snapshot of a monitor's ownership and queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorUsage {
    pub owner: Option<ThreadId>,
    /// Times the owner has entered (0 when free)
    pub entry_count: u32,
    /// Threads blocked to enter
    pub waiters: Vec<ThreadId>,
    /// Threads blocked in wait
    pub notify_waiters: Vec<ThreadId>,
}

struct MonitorState {
    owner: Option<ThreadId>,
    // Entries beyond the first
    recursion: u32,
    entry_set: VecDeque<Arc<AgentThread>>,
    wait_set: VecDeque<Arc<AgentThread>>,
    capacity: usize,
}

impl MonitorState {
    fn enqueue_entry(&mut self, thread: &Arc<AgentThread>, name: &str) {
        if self.entry_set.len() >= self.capacity {
            fatal(&format!("entry set of raw monitor '{}' overflowed", name));
        }
        self.entry_set.push_back(Arc::clone(thread));
    }

    fn enqueue_wait(&mut self, thread: &Arc<AgentThread>, name: &str) {
        if self.wait_set.len() >= self.capacity {
            fatal(&format!("wait set of raw monitor '{}' overflowed", name));
        }
        self.wait_set.push_back(Arc::clone(thread));
    }

    /// Give up ownership, handing it to the oldest entry waiter.
    ///
    /// Returns true if a waiter now owns the monitor and must be woken.
    fn release(&mut self) -> bool {
        self.recursion = 0;
        match self.entry_set.pop_front() {
            Some(next) => {
                self.owner = Some(next.id());
                true
            }
            None => {
                self.owner = None;
                false
            }
        }
    }
}

pub struct RawMonitor {
    name: String,
    magic: AtomicU32,
    state: SpinLock<MonitorState>,
    entry_lock: Mutex<()>,
    entry_cond: Condvar,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
}

impl RawMonitor {
    /// Create a monitor whose entry and wait queues each hold at most
    /// `capacity` threads.
    pub fn new(name: impl Into<String>, capacity: usize) -> JvmtiResult<Self> {
        let mut entry_set = VecDeque::new();
        let mut wait_set = VecDeque::new();
        entry_set
            .try_reserve_exact(capacity)
            .map_err(|_| JvmtiError::OutOfMemory)?;
        wait_set
            .try_reserve_exact(capacity)
            .map_err(|_| JvmtiError::OutOfMemory)?;

        Ok(Self {
            name: name.into(),
            magic: AtomicU32::new(MONITOR_MAGIC),
            state: SpinLock::new(MonitorState {
                owner: None,
                recursion: 0,
                entry_set,
                wait_set,
                capacity,
            }),
            entry_lock: Mutex::new(()),
            entry_cond: Condvar::new(),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MONITOR_MAGIC
    }

    pub fn enter(&self) {
        let me = thread::current();
        {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(me.id());
                    state.recursion = 0;
                    return;
                }
                Some(owner) if owner == me.id() => {
                    state.recursion += 1;
                    return;
                }
                Some(_) => state.enqueue_entry(&me, &self.name),
            }
        }
        self.block_until_owner(me.id());
    }

    pub fn exit(&self) -> JvmtiResult<()> {
        let me = thread::current_id();
        let handed_off = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(JvmtiError::NotOwner);
            }
            if state.recursion > 0 {
                state.recursion -= 1;
                return Ok(());
            }
            state.release()
        };

        if handed_off {
            self.wake_entrants();
        }
        Ok(())
    }

    /// Release the monitor, block until notified or until `timeout` passes,
    /// then re-acquire it with the previous entry count.
    pub fn wait(&self, timeout: Option<Duration>) -> JvmtiResult<()> {
        let me = thread::current();
        let (saved, handed_off) = {
            let mut state = self.state.lock();
            if state.owner != Some(me.id()) {
                return Err(JvmtiError::NotOwner);
            }
            state.enqueue_wait(&me, &self.name);
            me.notified.store(false, Ordering::Release);
            let saved = state.recursion;
            (saved, state.release())
        };

        if handed_off {
            self.wake_entrants();
        }

        self.block_until_notified(&me, timeout);

        {
            // Still queued if we timed out
            let mut state = self.state.lock();
            if let Some(pos) = state.wait_set.iter().position(|t| t.id() == me.id()) {
                state.wait_set.remove(pos);
            }
        }

        self.reacquire(&me, saved);
        Ok(())
    }

    pub fn notify(&self) -> JvmtiResult<()> {
        let me = thread::current_id();
        {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(JvmtiError::NotOwner);
            }
            match state.wait_set.pop_front() {
                Some(waiter) => waiter.notified.store(true, Ordering::Release),
                None => return Ok(()),
            }
        }

        self.wake_waiters();
        Ok(())
    }

    pub fn notify_all(&self) -> JvmtiResult<()> {
        let me = thread::current_id();
        {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(JvmtiError::NotOwner);
            }
            if state.wait_set.is_empty() {
                return Ok(());
            }
            for waiter in state.wait_set.drain(..) {
                waiter.notified.store(true, Ordering::Release);
            }
        }

        self.wake_waiters();
        Ok(())
    }

    pub fn usage(&self) -> MonitorUsage {
        // Allocate before taking the spinlock
        let capacity = self.state.lock().capacity;
        let mut waiters = Vec::with_capacity(capacity);
        let mut notify_waiters = Vec::with_capacity(capacity);

        let state = self.state.lock();
        waiters.extend(state.entry_set.iter().map(|t| t.id()));
        notify_waiters.extend(state.wait_set.iter().map(|t| t.id()));

        MonitorUsage {
            owner: state.owner,
            entry_count: if state.owner.is_some() {
                state.recursion + 1
            } else {
                0
            },
            waiters,
            notify_waiters,
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    fn is_owned_by(&self, id: ThreadId) -> bool {
        self.state.lock().owner == Some(id)
    }

    fn block_until_owner(&self, id: ThreadId) {
        // Ownership is handed over before the broadcast, under the spinlock,
        // and re-checked here with the entry mutex held so no wake is lost.
        let mut guard = self.entry_lock.lock();
        while !self.is_owned_by(id) {
            self.entry_cond.wait(&mut guard);
        }
    }

    fn block_until_notified(&self, me: &AgentThread, timeout: Option<Duration>) {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut guard = self.wait_lock.lock();
        while !me.notified.load(Ordering::Acquire) {
            match deadline {
                None => self.wait_cond.wait(&mut guard),
                Some(deadline) => {
                    if self.wait_cond.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
    }

    fn reacquire(&self, me: &Arc<AgentThread>, recursion: u32) {
        {
            let mut state = self.state.lock();
            if state.owner.is_none() {
                state.owner = Some(me.id());
                state.recursion = recursion;
                return;
            }
            state.enqueue_entry(me, &self.name);
        }
        self.block_until_owner(me.id());
        self.state.lock().recursion = recursion;
    }

    fn wake_entrants(&self) {
        let _guard = self.entry_lock.lock();
        self.entry_cond.notify_all();
    }

    fn wake_waiters(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cond.notify_all();
    }

    /// Release the caller's ownership ahead of destruction. Fails if another
    /// thread owns the monitor.
    fn release_for_destroy(&self) -> JvmtiResult<()> {
        let me = thread::current_id();
        let handed_off = {
            let mut state = self.state.lock();
            match state.owner {
                None => false,
                Some(owner) if owner == me => state.release(),
                Some(_) => return Err(JvmtiError::NotOwner),
            }
        };
        if handed_off {
            self.wake_entrants();
        }
        Ok(())
    }
}

impl fmt::Debug for RawMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMonitor")
            .field("name", &self.name)
            .field("owner", &self.owner())
            .finish()
    }
}

/// Opaque handle: `(generation << 32) | slot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawMonitorId(u64);

impl RawMonitorId {
    fn new(slot: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

struct Slot {
    generation: u32,
    monitor: Option<Arc<RawMonitor>>,
}

struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
}

/// Arena of raw monitors addressed by validated handles
pub struct MonitorTable {
    slots: RwLock<Slots>,
    max_monitors: usize,
    wait_set_capacity: usize,
}

impl MonitorTable {
    pub fn new(max_monitors: usize, wait_set_capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
            max_monitors,
            wait_set_capacity,
        }
    }

    pub fn create(&self, name: &str) -> JvmtiResult<RawMonitorId> {
        let monitor = Arc::new(RawMonitor::new(name, self.wait_set_capacity)?);

        let mut slots = self.slots.write();
        let index = match slots.free.pop() {
            Some(index) => index as usize,
            None => {
                if slots.entries.len() >= self.max_monitors {
                    return Err(JvmtiError::OutOfMemory);
                }
                slots
                    .entries
                    .try_reserve(1)
                    .map_err(|_| JvmtiError::OutOfMemory)?;
                slots.entries.push(Slot {
                    generation: 0,
                    monitor: None,
                });
                slots.entries.len() - 1
            }
        };

        let slot = &mut slots.entries[index];
        // Generation 0 is never handed out
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.monitor = Some(monitor);

        let id = RawMonitorId::new(index as u32, slot.generation);
        debug!("Created raw monitor '{}' as {:#x}", name, id.raw());
        Ok(id)
    }

    pub fn destroy(&self, id: RawMonitorId) -> JvmtiResult<()> {
        let monitor = self.lookup(id)?;
        monitor.release_for_destroy()?;

        let mut slots = self.slots.write();
        let slot = slots
            .entries
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation() && slot.monitor.is_some())
            .ok_or(JvmtiError::InvalidMonitor)?;
        slot.monitor = None;
        slots.free.push(id.slot() as u32);

        monitor.magic.store(0, Ordering::Release);
        debug!("Destroyed raw monitor '{}'", monitor.name());
        Ok(())
    }

    /// Resolve a handle, checking slot, generation and magic
    pub fn lookup(&self, id: RawMonitorId) -> JvmtiResult<Arc<RawMonitor>> {
        let slots = self.slots.read();
        slots
            .entries
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.monitor.as_ref())
            .filter(|monitor| monitor.is_valid())
            .map(Arc::clone)
            .ok_or(JvmtiError::InvalidMonitor)
    }

    pub fn enter(&self, id: RawMonitorId) -> JvmtiResult<()> {
        self.lookup(id)?.enter();
        Ok(())
    }

    pub fn exit(&self, id: RawMonitorId) -> JvmtiResult<()> {
        self.lookup(id)?.exit()
    }

    /// `millis <= 0` waits until notified
    pub fn wait(&self, id: RawMonitorId, millis: i64) -> JvmtiResult<()> {
        self.lookup(id)?.wait(timeout_from_millis(millis))
    }

    pub fn notify(&self, id: RawMonitorId) -> JvmtiResult<()> {
        self.lookup(id)?.notify()
    }

    pub fn notify_all(&self, id: RawMonitorId) -> JvmtiResult<()> {
        self.lookup(id)?.notify_all()
    }

    pub fn usage(&self, id: RawMonitorId) -> JvmtiResult<MonitorUsage> {
        Ok(self.lookup(id)?.usage())
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.read();
        slots.entries.len() - slots.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread as os;

    fn monitor() -> Arc<RawMonitor> {
        Arc::new(RawMonitor::new("test", 16).unwrap())
    }

    // Spin until `check` holds, failing after a few seconds
    fn eventually(check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            os::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_entry_set_overflow_aborts() {
        crate::error::testing::assert_aborts("monitor::tests::test_entry_set_overflow_aborts", || {
            let monitor = Arc::new(RawMonitor::new("tiny", 1).unwrap());
            monitor.enter();

            let first = Arc::clone(&monitor);
            os::spawn(move || first.enter());
            eventually(|| monitor.usage().waiters.len() == 1);

            let second = Arc::clone(&monitor);
            let _ = os::spawn(move || second.enter()).join();
        });
    }

    #[test]
    fn test_wait_set_overflow_aborts() {
        crate::error::testing::assert_aborts("monitor::tests::test_wait_set_overflow_aborts", || {
            let monitor = Arc::new(RawMonitor::new("tiny", 1).unwrap());

            let waiter = Arc::clone(&monitor);
            os::spawn(move || {
                waiter.enter();
                let _ = waiter.wait(None);
            });
            eventually(|| monitor.usage().notify_waiters.len() == 1);

            monitor.enter();
            let _ = monitor.wait(None);
        });
    }

    #[test]
    fn test_recursive_enter_exit() {
        let monitor = monitor();
        monitor.enter();
        monitor.enter();
        monitor.enter();
        assert_eq!(monitor.usage().entry_count, 3);

        monitor.exit().unwrap();
        monitor.exit().unwrap();
        assert_eq!(monitor.owner(), Some(thread::current_id()));

        monitor.exit().unwrap();
        assert_eq!(monitor.owner(), None);
        assert_eq!(monitor.exit(), Err(JvmtiError::NotOwner));
    }

    #[test]
    fn test_non_owner_operations() {
        let monitor = monitor();
        monitor.enter();

        let other = Arc::clone(&monitor);
        let results = os::spawn(move || {
            (
                other.exit(),
                other.notify(),
                other.notify_all(),
                other.wait(Some(Duration::from_millis(1))),
            )
        })
        .join()
        .unwrap();

        assert_eq!(results.0, Err(JvmtiError::NotOwner));
        assert_eq!(results.1, Err(JvmtiError::NotOwner));
        assert_eq!(results.2, Err(JvmtiError::NotOwner));
        assert_eq!(results.3, Err(JvmtiError::NotOwner));
        monitor.exit().unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let monitor = monitor();
        let inside = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                let inside = Arc::clone(&inside);
                let counter = Arc::clone(&counter);
                os::spawn(move || {
                    for _ in 0..500 {
                        monitor.enter();
                        monitor.enter();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        // Deliberately non-atomic increment
                        let n = counter.load(Ordering::Relaxed);
                        counter.store(n + 1, Ordering::Relaxed);
                        monitor.exit().unwrap();
                        // Still held after the inner exit
                        assert_eq!(monitor.owner(), Some(thread::current_id()));
                        inside.store(false, Ordering::SeqCst);
                        monitor.exit().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8 * 500);
        assert_eq!(monitor.owner(), None);
    }

    #[test]
    fn test_wait_released_only_by_notify() {
        let monitor = monitor();
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            let woke = Arc::clone(&woke);
            os::spawn(move || {
                monitor.enter();
                monitor.enter();
                monitor.wait(None).unwrap();
                woke.store(true, Ordering::SeqCst);
                let usage = monitor.usage();
                monitor.exit().unwrap();
                monitor.exit().unwrap();
                usage
            })
        };

        eventually(|| monitor.usage().notify_waiters.len() == 1);
        monitor.enter();
        os::sleep(Duration::from_millis(20));
        assert!(!woke.load(Ordering::SeqCst));

        monitor.notify().unwrap();
        // The waiter cannot re-acquire until we exit
        os::sleep(Duration::from_millis(20));
        assert!(!woke.load(Ordering::SeqCst));
        monitor.exit().unwrap();

        let usage = waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
        assert_eq!(usage.entry_count, 2);
        assert!(usage.notify_waiters.is_empty());
        assert_eq!(monitor.owner(), None);
    }

    #[test]
    fn test_notify_all_releases_every_waiter() {
        let monitor = monitor();
        let woke = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                let woke = Arc::clone(&woke);
                os::spawn(move || {
                    monitor.enter();
                    monitor.wait(None).unwrap();
                    woke.fetch_add(1, Ordering::SeqCst);
                    monitor.exit().unwrap();
                })
            })
            .collect();

        eventually(|| monitor.usage().notify_waiters.len() == 3);
        monitor.enter();
        monitor.notify_all().unwrap();
        assert!(monitor.usage().notify_waiters.is_empty());
        monitor.exit().unwrap();

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_notify_wakes_one() {
        let monitor = monitor();
        let woke = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                let woke = Arc::clone(&woke);
                os::spawn(move || {
                    monitor.enter();
                    monitor.wait(None).unwrap();
                    woke.fetch_add(1, Ordering::SeqCst);
                    monitor.exit().unwrap();
                })
            })
            .collect();

        eventually(|| monitor.usage().notify_waiters.len() == 2);
        monitor.enter();
        monitor.notify().unwrap();
        monitor.exit().unwrap();

        eventually(|| woke.load(Ordering::SeqCst) == 1);
        os::sleep(Duration::from_millis(20));
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.usage().notify_waiters.len(), 1);

        monitor.enter();
        monitor.notify().unwrap();
        monitor.exit().unwrap();

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_timeout_reacquires() {
        let monitor = monitor();
        monitor.enter();
        monitor.enter();

        let start = Instant::now();
        monitor.wait(Some(Duration::from_millis(30))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));

        let usage = monitor.usage();
        assert_eq!(usage.owner, Some(thread::current_id()));
        assert_eq!(usage.entry_count, 2);
        assert!(usage.notify_waiters.is_empty());

        monitor.exit().unwrap();
        monitor.exit().unwrap();
    }

    #[test]
    fn test_timeout_mapping() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(-1), None);
        assert_eq!(timeout_from_millis(25), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_table_handles() {
        let table = MonitorTable::new(8, 4);
        let id = table.create("a").unwrap();
        assert_eq!(table.len(), 1);

        table.enter(id).unwrap();
        assert_eq!(table.usage(id).unwrap().entry_count, 1);
        table.exit(id).unwrap();

        table.destroy(id).unwrap();
        assert_eq!(table.enter(id), Err(JvmtiError::InvalidMonitor));
        assert_eq!(table.destroy(id), Err(JvmtiError::InvalidMonitor));
        assert_eq!(table.notify(RawMonitorId::from_raw(0)), Err(JvmtiError::InvalidMonitor));
        assert_eq!(table.exit(RawMonitorId::from_raw(u64::MAX)), Err(JvmtiError::InvalidMonitor));

        // Slot reuse bumps the generation
        let reused = table.create("b").unwrap();
        assert_ne!(reused, id);
        assert_eq!(table.lookup(id).unwrap_err(), JvmtiError::InvalidMonitor);
        assert_eq!(table.lookup(reused).unwrap().name(), "b");
    }

    #[test]
    fn test_destroy_owned_monitor() {
        let table = Arc::new(MonitorTable::new(8, 4));
        let id = table.create("owned").unwrap();
        table.enter(id).unwrap();
        table.enter(id).unwrap();

        let other = Arc::clone(&table);
        let result = os::spawn(move || other.destroy(id)).join().unwrap();
        assert_eq!(result, Err(JvmtiError::NotOwner));

        let monitor = table.lookup(id).unwrap();
        table.destroy(id).unwrap();
        assert!(!monitor.is_valid());
        assert_eq!(monitor.owner(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_monitor_limit() {
        let table = MonitorTable::new(2, 4);
        table.create("a").unwrap();
        table.create("b").unwrap();
        assert_eq!(table.create("c"), Err(JvmtiError::OutOfMemory));
    }
}
