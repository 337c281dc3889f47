// Agent environment
//
// One instance of every instrumentation component, sized from an
// `InstrumentationConfig` and wired to a shared event sink and code manager.

use crate::breakpoints::BreakpointRegistry;
use crate::config::{ConfigError, InstrumentationConfig};
use crate::events::EventSink;
use crate::exception::{ClassHierarchy, ExceptionAnalyzer, FrameClassifier};
use crate::monitor::MonitorTable;
use crate::runtime::CodeManager;
use crate::storage::{EnvironmentStorage, ThreadLocalStorage};
use crate::tags::TagStore;
use crate::watch::FieldWatches;
use std::sync::Arc;
use tracing::info;

pub struct JvmtiEnv<O> {
    config: InstrumentationConfig,
    breakpoints: BreakpointRegistry,
    watches: FieldWatches,
    monitors: MonitorTable,
    tags: TagStore<O>,
    exceptions: ExceptionAnalyzer,
    thread_storage: ThreadLocalStorage,
    env_storage: EnvironmentStorage,
}

impl<O> JvmtiEnv<O> {
    pub fn new(
        config: InstrumentationConfig,
        sink: Arc<dyn EventSink>,
        code: Arc<dyn CodeManager>,
        hierarchy: Arc<dyn ClassHierarchy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let env = Self {
            breakpoints: BreakpointRegistry::new(
                config.breakpoint_table_capacity,
                Arc::clone(&code),
                Arc::clone(&sink),
            ),
            watches: FieldWatches::new(Arc::clone(&sink)),
            monitors: MonitorTable::new(config.max_raw_monitors, config.monitor_wait_set_capacity),
            tags: TagStore::new(config.tag_table_capacity, config.tag_load_factor),
            exceptions: ExceptionAnalyzer::new(
                FrameClassifier::new(config.throw_scaffolding.iter().copied()),
                hierarchy,
                code,
                sink,
            ),
            thread_storage: ThreadLocalStorage::new(),
            env_storage: EnvironmentStorage::default(),
            config,
        };

        info!(
            "Created JVMTI environment (breakpoint slots={}, max monitors={}, tag slots={})",
            env.config.breakpoint_table_capacity,
            env.config.max_raw_monitors,
            env.config.tag_table_capacity
        );
        Ok(env)
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    pub fn watches(&self) -> &FieldWatches {
        &self.watches
    }

    pub fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    pub fn tags(&self) -> &TagStore<O> {
        &self.tags
    }

    pub fn exceptions(&self) -> &ExceptionAnalyzer {
        &self.exceptions
    }

    pub fn thread_storage(&self) -> &ThreadLocalStorage {
        &self.thread_storage
    }

    pub fn environment_storage(&self) -> &EnvironmentStorage {
        &self.env_storage
    }
}
