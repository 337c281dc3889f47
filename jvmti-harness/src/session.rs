// Harness session state
//
// One agent environment plus the simulated runtime it is wired to: a heap of
// objects the harness owns, a code manager that records recompilation
// requests, and a class hierarchy built up from exception.raise calls.

use jvmti_core::exception::{ClassHierarchy, FrameInfo, HandlerEntry, StackWalker};
use jvmti_core::runtime::{CodeManager, Instrumentation};
use jvmti_core::types::{ClassId, CodeIndex, CodeOrigin, MethodId, ObjectId};
use jvmti_core::{event_channel, ChannelSink, EventReceiver, InstrumentationConfig, JvmtiEnv};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct HeapObject {
    pub id: ObjectId,
    pub class: ClassId,
}

#[derive(Debug, Default)]
pub struct RecordingCode {
    invalidated: Mutex<Vec<MethodId>>,
    instrumented: Mutex<Vec<(MethodId, Instrumentation)>>,
}

impl RecordingCode {
    pub fn invalidated(&self) -> Vec<MethodId> {
        self.invalidated.lock().clone()
    }

    pub fn instrumented(&self) -> Vec<(MethodId, Instrumentation)> {
        self.instrumented.lock().clone()
    }
}

impl CodeManager for RecordingCode {
    fn invalidate(&self, method: MethodId) {
        debug!("Invalidating compiled code for method {:#x}", method);
        self.invalidated.lock().push(method);
    }

    fn ensure_instrumented(&self, method: MethodId, kind: Instrumentation) -> bool {
        let mut instrumented = self.instrumented.lock();
        if instrumented.contains(&(method, kind)) {
            return false;
        }
        instrumented.push((method, kind));
        true
    }
}

/// Single-inheritance hierarchy as a subclass -> superclass map
#[derive(Debug, Default)]
pub struct DeclaredHierarchy {
    superclasses: RwLock<HashMap<ClassId, ClassId>>,
}

impl DeclaredHierarchy {
    pub fn declare(&self, class: ClassId, superclass: ClassId) {
        self.superclasses.write().insert(class, superclass);
    }
}

impl ClassHierarchy for DeclaredHierarchy {
    fn is_assignable(&self, class: ClassId, target: ClassId) -> bool {
        let superclasses = self.superclasses.read();
        let mut current = class;
        // Bounded by the map size so a cyclic declaration cannot loop forever
        for _ in 0..=superclasses.len() {
            if current == target {
                return true;
            }
            match superclasses.get(&current) {
                Some(superclass) => current = *superclass,
                None => return false,
            }
        }
        false
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameSpec {
    pub method: MethodId,
    pub index: CodeIndex,
    pub origin: CodeOrigin,
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

/// A stack supplied by the client, innermost frame first
pub struct ScriptedStack<'a>(pub &'a [FrameSpec]);

impl StackWalker for ScriptedStack<'_> {
    fn walk(&self, visit: &mut dyn FnMut(&FrameInfo<'_>) -> ControlFlow<()>) {
        for frame in self.0 {
            let info = FrameInfo {
                method: frame.method,
                index: frame.index,
                origin: frame.origin,
                handlers: &frame.handlers,
            };
            if visit(&info).is_break() {
                return;
            }
        }
    }
}

pub struct HarnessSession {
    pub env: JvmtiEnv<HeapObject>,
    pub sink: Arc<ChannelSink>,
    pub receiver: EventReceiver,
    pub code: Arc<RecordingCode>,
    pub hierarchy: Arc<DeclaredHierarchy>,
    objects: HashMap<ObjectId, Arc<HeapObject>>,
    next_object: ObjectId,
    next_packet: u32,
}

impl HarnessSession {
    pub fn new(config: InstrumentationConfig) -> anyhow::Result<Self> {
        let (sink, receiver) = event_channel(config.event_queue_capacity);
        let sink = Arc::new(sink);
        let code = Arc::new(RecordingCode::default());
        let hierarchy = Arc::new(DeclaredHierarchy::default());

        let env = JvmtiEnv::new(config, sink.clone(), code.clone(), hierarchy.clone())?;

        Ok(Self {
            env,
            sink,
            receiver,
            code,
            hierarchy,
            objects: HashMap::new(),
            next_object: 1,
            next_packet: 1,
        })
    }

    pub fn allocate(&mut self, class: ClassId) -> Arc<HeapObject> {
        let id = self.next_object;
        self.next_object += 1;
        let object = Arc::new(HeapObject { id, class });
        self.objects.insert(id, Arc::clone(&object));
        object
    }

    pub fn object(&self, id: ObjectId) -> Option<&Arc<HeapObject>> {
        self.objects.get(&id)
    }

    pub fn release(&mut self, id: ObjectId) -> bool {
        self.objects.remove(&id).is_some()
    }

    pub fn next_packet_id(&mut self) -> u32 {
        let id = self.next_packet;
        self.next_packet = self.next_packet.wrapping_add(1);
        id
    }
}
