// Error kinds surfaced at the agent boundary
//
// Every core operation returns one of a fixed set of error kinds rather than a
// raw status code. Each kind carries its JVMTI numeric code so a dispatch layer
// can translate uniformly.

use thiserror::Error;
use tracing::error;

pub type JvmtiResult<T> = Result<T, JvmtiError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JvmtiError {
    #[error("already set")]
    Duplicate,

    #[error("not set")]
    NotFound,

    #[error("current thread does not own the monitor")]
    NotOwner,

    #[error("invalid raw monitor handle")]
    InvalidMonitor,

    #[error("thread is not alive")]
    ThreadNotAlive,

    #[error("out of memory")]
    OutOfMemory,

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("invalid location {0}")]
    InvalidLocation(u32),
}

impl JvmtiError {
    /// JVMTI error code for this kind
    pub fn code(&self) -> u16 {
        match self {
            JvmtiError::ThreadNotAlive => 15,
            JvmtiError::InvalidLocation(_) => 24,
            JvmtiError::Duplicate => 40,
            JvmtiError::NotFound => 41,
            JvmtiError::InvalidMonitor => 50,
            JvmtiError::NotOwner => 51,
            JvmtiError::NotAvailable(_) => 98,
            JvmtiError::IllegalArgument(_) => 103,
            JvmtiError::OutOfMemory => 110,
        }
    }

    /// Symbolic JVMTI name, e.g. `NOT_MONITOR_OWNER`
    pub fn name(&self) -> &'static str {
        code_name(self.code())
    }

    /// Recover an error kind from its code. Detail strings are lost.
    pub fn from_code(code: u16) -> Option<Self> {
        let err = match code {
            15 => JvmtiError::ThreadNotAlive,
            24 => JvmtiError::InvalidLocation(0),
            40 => JvmtiError::Duplicate,
            41 => JvmtiError::NotFound,
            50 => JvmtiError::InvalidMonitor,
            51 => JvmtiError::NotOwner,
            98 => JvmtiError::NotAvailable(String::new()),
            103 => JvmtiError::IllegalArgument(String::new()),
            110 => JvmtiError::OutOfMemory,
            _ => return None,
        };
        Some(err)
    }
}

pub fn code_name(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        15 => "THREAD_NOT_ALIVE",
        24 => "INVALID_LOCATION",
        40 => "DUPLICATE",
        41 => "NOT_FOUND",
        50 => "INVALID_MONITOR",
        51 => "NOT_MONITOR_OWNER",
        98 => "NOT_AVAILABLE",
        103 => "ILLEGAL_ARGUMENT",
        110 => "OUT_OF_MEMORY",
        _ => "UNKNOWN_ERROR",
    }
}

/// Abort on a broken internal invariant.
///
/// Used where continuing would corrupt shared state: re-entrant exception
/// analysis and overflow of a monitor's bounded wait-sets.
#[cold]
pub fn fatal(msg: &str) -> ! {
    error!("fatal instrumentation error: {}", msg);
    eprintln!("fatal instrumentation error: {}", msg);
    std::process::abort()
}
