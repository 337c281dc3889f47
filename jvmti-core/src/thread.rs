// Agent-visible thread identity
//
// Every OS thread that touches the core gets a process-unique token and a
// shared record. Raw monitors queue these records, local storage checks their
// liveness, and trap handlers use the callback depth to avoid recursing
// through instrumented agent code.

use crate::types::ThreadId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Shared per-thread record
pub struct AgentThread {
    id: ThreadId,
    name: Option<String>,
    alive: AtomicBool,
    // Set by notify/notifyAll while this thread sits in a monitor's wait-set
    pub(crate) notified: AtomicBool,
    // Only written by the owning thread
    callback_depth: AtomicU32,
}

impl AgentThread {
    fn new() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name: std::thread::current().name().map(str::to_string),
            alive: AtomicBool::new(true),
            notified: AtomicBool::new(false),
            callback_depth: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// False once the OS thread has exited
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn in_agent_callback(&self) -> bool {
        self.callback_depth.load(Ordering::Relaxed) > 0
    }
}

impl fmt::Debug for AgentThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct CurrentThread(Arc<AgentThread>);

impl Drop for CurrentThread {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
    }
}

thread_local! {
    static CURRENT: CurrentThread = CurrentThread(Arc::new(AgentThread::new()));
}

/// Record for the calling thread
pub fn current() -> Arc<AgentThread> {
    CURRENT.with(|t| Arc::clone(&t.0))
}

pub fn current_id() -> ThreadId {
    CURRENT.with(|t| t.0.id)
}

/// Whether the calling thread is inside agent callback handling
pub fn in_agent_callback() -> bool {
    CURRENT
        .try_with(|t| t.0.in_agent_callback())
        .unwrap_or(false)
}

/// Marks the calling thread as running agent callback code until dropped.
///
/// Event dispatchers hold one of these while invoking agent callbacks so that
/// traps hit by the agent's own code are not reported back to it.
pub struct CallbackScope {
    // Tied to the thread that entered it
    _not_send: std::marker::PhantomData<*const ()>,
}

impl CallbackScope {
    pub fn enter() -> Self {
        CURRENT.with(|t| t.0.callback_depth.fetch_add(1, Ordering::Relaxed));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        let _ = CURRENT.try_with(|t| t.0.callback_depth.fetch_sub(1, Ordering::Relaxed));
    }
}
