// JVMTI instrumentation core
//
// The in-process half of an agent interface for a managed runtime:
// - Breakpoint and single-step trap registry
// - Raw monitors that survive external thread suspension
// - Identity-based weak object tagging
// - Exception stack analysis and event synthesis
// - Field watches, agent local storage and event forwarding

pub mod breakpoints;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod events;
pub mod exception;
pub mod monitor;
pub mod reader;
pub mod runtime;
mod spin;
pub mod storage;
pub mod tags;
pub mod thread;
pub mod types;
pub mod watch;
pub mod wire;

pub use breakpoints::{BreakpointId, BreakpointRegistry};
pub use config::{ConfigError, InstrumentationConfig};
pub use dispatch::{event_channel, ChannelSink, EventReceiver};
pub use env::JvmtiEnv;
pub use error::{JvmtiError, JvmtiResult};
pub use events::{Event, EventSink, EventType};
pub use exception::{Disposition, ExceptionAnalyzer, ExceptionReport};
pub use monitor::{MonitorTable, RawMonitor, RawMonitorId};
pub use tags::{HeapFilter, Tag, TagStore};
