// Core type definitions
//
// Handles and locations shared by the breakpoint, watch, exception and event
// modules. Method IDs are owned by the runtime's method table; the core only
// carries them around.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// Method IDs fit in the low 32 bits of a breakpoint ID
pub type MethodId = u32;

// Bytecode index within a method
pub type CodeIndex = u32;

// Agent-visible thread token, see `thread::AgentThread`
pub type ThreadId = u64;

pub type ObjectId = u64;
pub type ClassId = u64;
pub type FieldId = u64;

/// Opaque agent-supplied data (object tags, local storage)
pub type Opaque = Arc<dyn Any + Send + Sync>;

/// A code position: method plus bytecode index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub method: MethodId,
    pub index: CodeIndex,
}

impl Location {
    pub fn new(method: MethodId, index: CodeIndex) -> Self {
        Self { method, index }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method={:#x}@{}", self.method, self.index)
    }
}

/// Which loader a frame's code came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeOrigin {
    /// Runtime startup and boot class path code
    Bootstrap,
    /// Anything loaded on behalf of the application, libraries included
    Application,
}

/// A (class, field) pair identifying a watched field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub class: ClassId,
    pub field: FieldId,
}
