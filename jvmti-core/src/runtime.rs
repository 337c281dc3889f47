// Seams into the runtime
//
// The code-generation/deoptimization subsystem lives outside the core. The
// breakpoint registry and the exception analyzer call into it through
// `CodeManager`.

use crate::types::MethodId;
use serde::{Deserialize, Serialize};

/// Instrumentation a method's compiled code may need to carry beyond its
/// breakpoint traps, which `invalidate` covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrumentation {
    ExceptionCatch,
}

pub trait CodeManager: Send + Sync {
    /// Drop cached compiled code for `method` so the next invocation is
    /// recompiled (or deoptimized) with the current trap set.
    fn invalidate(&self, method: MethodId);

    /// Make sure `method`'s compiled code carries `kind`.
    ///
    /// Returns true if recompilation was triggered.
    fn ensure_instrumented(&self, method: MethodId, kind: Instrumentation) -> bool;
}

/// A `CodeManager` for runtimes that interpret everything
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreted;

impl CodeManager for Interpreted {
    fn invalidate(&self, _method: MethodId) {}

    fn ensure_instrumented(&self, _method: MethodId, _kind: Instrumentation) -> bool {
        false
    }
}
