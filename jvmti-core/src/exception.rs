// Exception event analysis
//
// Runs on the throwing thread for every raised exception. One walk of the
// stack finds the throwing frame (skipping the runtime's own throw machinery)
// and the nearest frame with a matching source-level handler, then decides
// whether the exception is visible to application code and delivers the
// resulting events.

use crate::error::fatal;
use crate::events::{post, Event, EventSink, EventType};
use crate::runtime::{CodeManager, Instrumentation};
use crate::thread;
use crate::types::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, trace};

/// One row of a method's exception handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerEntry {
    /// First covered index
    pub start: CodeIndex,
    /// One past the last covered index
    pub end: CodeIndex,
    pub handler: CodeIndex,
    /// `None` catches everything
    pub catch_class: Option<ClassId>,
    /// Source line of the handler. Handlers the compiler inserts on its own
    /// behalf (monitor unlock on unwind and the like) have none.
    pub source_line: Option<u32>,
}

impl HandlerEntry {
    pub fn covers(&self, index: CodeIndex) -> bool {
        self.start <= index && index < self.end
    }

    pub fn is_synthetic(&self) -> bool {
        self.source_line.is_none()
    }
}

/// A frame as seen by the analyzer
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo<'a> {
    pub method: MethodId,
    /// Current index in the frame (the call site for non-innermost frames)
    pub index: CodeIndex,
    pub origin: CodeOrigin,
    pub handlers: &'a [HandlerEntry],
}

impl FrameInfo<'_> {
    pub fn location(&self) -> Location {
        Location::new(self.method, self.index)
    }
}

/// Walks the current thread's stack from the trap point outward
pub trait StackWalker {
    fn walk(&self, visit: &mut dyn FnMut(&FrameInfo<'_>) -> ControlFlow<()>);
}

pub trait ClassHierarchy: Send + Sync {
    /// Whether instances of `class` can be caught by a handler for `target`
    fn is_assignable(&self, class: ClassId, target: ClassId) -> bool;
}

/// Recognizes frames belonging to the runtime's throw implementation
#[derive(Debug, Clone, Default)]
pub struct FrameClassifier {
    scaffolding: FxHashSet<MethodId>,
}

impl FrameClassifier {
    pub fn new(scaffolding: impl IntoIterator<Item = MethodId>) -> Self {
        Self {
            scaffolding: scaffolding.into_iter().collect(),
        }
    }

    pub fn is_scaffolding(&self, frame: &FrameInfo<'_>) -> bool {
        self.scaffolding.contains(&frame.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Handled by a handler reached through application code
    Caught,
    /// No handler, or the only handler is in bootstrap code
    UncaughtByApplication,
    /// Thrown and handled without any application frame involved
    Suppressed,
}

/// Outcome of analyzing one raised exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionReport {
    pub throw_at: Location,
    /// Handler location, if any frame catches
    pub catch_at: Option<Location>,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Copy)]
struct FrameMark {
    location: Location,
    depth: usize,
    origin: CodeOrigin,
}

/// Per-thread analysis state, reused across throws
#[derive(Default)]
struct Scratch {
    throw: Option<FrameMark>,
    catch: Option<FrameMark>,
    application_seen: bool,
}

thread_local! {
    static ANALYZING: Cell<bool> = const { Cell::new(false) };
    static SCRATCH: RefCell<Scratch> = RefCell::new(Scratch::default());
}

/// Marks the calling thread as analyzing until dropped
pub(crate) struct AnalysisGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl AnalysisGuard {
    /// `None` if this thread is already analyzing
    pub(crate) fn enter() -> Option<Self> {
        if ANALYZING.with(|analyzing| analyzing.replace(true)) {
            return None;
        }
        SCRATCH.with(|scratch| *scratch.borrow_mut() = Scratch::default());
        Some(Self {
            _not_send: std::marker::PhantomData,
        })
    }
}

impl Drop for AnalysisGuard {
    fn drop(&mut self) {
        let _ = ANALYZING.try_with(|analyzing| analyzing.set(false));
    }
}

const INTERESTED: [EventType; 4] = [
    EventType::Exception,
    EventType::ExceptionCatch,
    EventType::MethodExit,
    EventType::FramePop,
];

pub struct ExceptionAnalyzer {
    classifier: FrameClassifier,
    hierarchy: Arc<dyn ClassHierarchy>,
    code: Arc<dyn CodeManager>,
    sink: Arc<dyn EventSink>,
}

impl ExceptionAnalyzer {
    pub fn new(
        classifier: FrameClassifier,
        hierarchy: Arc<dyn ClassHierarchy>,
        code: Arc<dyn CodeManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            classifier,
            hierarchy,
            code,
            sink,
        }
    }

    /// Throw hook. Analyzes `exception` (an instance of `class`) against the
    /// stack `walker` exposes and delivers the resulting events.
    ///
    /// Returns `None` when nobody is listening or the stack holds nothing but
    /// throw machinery.
    pub fn raise(
        &self,
        walker: &dyn StackWalker,
        exception: ObjectId,
        class: ClassId,
    ) -> Option<ExceptionReport> {
        let thread = thread::current_id();
        if !INTERESTED.iter().any(|kind| self.sink.wants(*kind, thread)) {
            return None;
        }

        let Some(_guard) = AnalysisGuard::enter() else {
            fatal("exception raised while analyzing an exception");
        };

        self.scan(walker, class);
        let (throw, catch, application_seen) = SCRATCH.with(|scratch| {
            let scratch = scratch.borrow();
            (scratch.throw, scratch.catch, scratch.application_seen)
        });

        let Some(throw) = throw else {
            trace!("No throwing frame found for exception {:#x}", exception);
            return None;
        };

        let disposition = if !application_seen {
            Disposition::Suppressed
        } else {
            match catch {
                Some(catch) if catch.origin == CodeOrigin::Application => Disposition::Caught,
                _ => Disposition::UncaughtByApplication,
            }
        };

        let report = ExceptionReport {
            throw_at: throw.location,
            catch_at: catch.map(|c| c.location),
            disposition,
        };
        debug!(
            "Exception {:#x} thrown at {}: {:?}",
            exception, throw.location, disposition
        );

        if disposition != Disposition::Suppressed {
            self.deliver(thread, exception, throw, catch, disposition);
        }
        Some(report)
    }

    /// Handler-entry hook planted by `Instrumentation::ExceptionCatch`
    pub fn catch_hook(&self, location: Location, exception: ObjectId) {
        let thread = thread::current();
        if thread.in_agent_callback() {
            return;
        }
        post(
            self.sink.as_ref(),
            Event::ExceptionCatch {
                thread: thread.id(),
                location,
                exception,
            },
        );
    }

    /// Fill this thread's scratch state from one stack walk
    fn scan(&self, walker: &dyn StackWalker, class: ClassId) {
        let mut depth = 0usize;
        walker.walk(&mut |frame: &FrameInfo<'_>| {
            let here = depth;
            depth += 1;

            // No scratch borrow may be held across classifier or hierarchy calls
            let throw_pending = SCRATCH.with(|scratch| scratch.borrow().throw.is_none());
            if throw_pending && self.classifier.is_scaffolding(frame) {
                return ControlFlow::Continue(());
            }
            let handler = self.matching_handler(frame, class);

            SCRATCH.with(|scratch| {
                let mut scratch = scratch.borrow_mut();
                if scratch.throw.is_none() {
                    scratch.throw = Some(FrameMark {
                        location: frame.location(),
                        depth: here,
                        origin: frame.origin,
                    });
                }

                if frame.origin == CodeOrigin::Application {
                    scratch.application_seen = true;
                }

                match handler {
                    Some(handler) => {
                        scratch.catch = Some(FrameMark {
                            location: Location::new(frame.method, handler.handler),
                            depth: here,
                            origin: frame.origin,
                        });
                        ControlFlow::Break(())
                    }
                    None => ControlFlow::Continue(()),
                }
            })
        });
    }

    fn matching_handler<'a>(&self, frame: &FrameInfo<'a>, class: ClassId) -> Option<&'a HandlerEntry> {
        frame.handlers.iter().find(|handler| {
            !handler.is_synthetic()
                && handler.covers(frame.index)
                && handler
                    .catch_class
                    .map_or(true, |target| self.hierarchy.is_assignable(class, target))
        })
    }

    fn deliver(
        &self,
        thread: ThreadId,
        exception: ObjectId,
        throw: FrameMark,
        catch: Option<FrameMark>,
        disposition: Disposition,
    ) {
        let caught = match catch {
            Some(catch) if disposition == Disposition::Caught => Some(catch),
            _ => None,
        };

        post(
            self.sink.as_ref(),
            Event::Exception {
                thread,
                location: throw.location,
                exception,
                catch_location: caught.map(|c| c.location),
            },
        );

        let Some(catch) = caught else {
            return;
        };

        if catch.depth != throw.depth {
            let method = throw.location.method;
            post(
                self.sink.as_ref(),
                Event::FramePop {
                    thread,
                    method,
                    popped_by_exception: true,
                },
            );
            post(
                self.sink.as_ref(),
                Event::MethodExit {
                    thread,
                    method,
                    popped_by_exception: true,
                },
            );
        }

        if self.sink.wants(EventType::ExceptionCatch, thread)
            && self
                .code
                .ensure_instrumented(catch.location.method, Instrumentation::ExceptionCatch)
        {
            debug!(
                "Recompiling method {:#x} for exception-catch events",
                catch.location.method
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::tests::RecordingCode;
    use crate::events::testing::RecordingSink;

    const SCAFFOLD: MethodId = 0x100;
    const RUNTIME_EXCEPTION: ClassId = 1;
    const IO_EXCEPTION: ClassId = 2;
    const THROWABLE: ClassId = 3;

    struct Frame {
        method: MethodId,
        index: CodeIndex,
        origin: CodeOrigin,
        handlers: Vec<HandlerEntry>,
    }

    fn frame(method: MethodId, index: CodeIndex, origin: CodeOrigin) -> Frame {
        Frame {
            method,
            index,
            origin,
            handlers: Vec::new(),
        }
    }

    impl Frame {
        fn catching(mut self, class: Option<ClassId>, handler: CodeIndex) -> Self {
            self.handlers.push(HandlerEntry {
                start: 0,
                end: 100,
                handler,
                catch_class: class,
                source_line: Some(42),
            });
            self
        }

        fn synthetic(mut self, handler: CodeIndex) -> Self {
            self.handlers.push(HandlerEntry {
                start: 0,
                end: 100,
                handler,
                catch_class: None,
                source_line: None,
            });
            self
        }
    }

    // Innermost frame first
    struct Stack(Vec<Frame>);

    impl StackWalker for Stack {
        fn walk(&self, visit: &mut dyn FnMut(&FrameInfo<'_>) -> ControlFlow<()>) {
            for frame in &self.0 {
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

    struct Unwalkable;

    impl StackWalker for Unwalkable {
        fn walk(&self, _visit: &mut dyn FnMut(&FrameInfo<'_>) -> ControlFlow<()>) {
            panic!("stack walked with no listeners");
        }
    }

    struct Hierarchy;

    impl ClassHierarchy for Hierarchy {
        fn is_assignable(&self, class: ClassId, target: ClassId) -> bool {
            class == target || target == THROWABLE
        }
    }

    fn analyzer() -> (ExceptionAnalyzer, Arc<RecordingCode>, Arc<RecordingSink>) {
        let code = Arc::new(RecordingCode::default());
        let sink = Arc::new(RecordingSink::default());
        let analyzer = ExceptionAnalyzer::new(
            FrameClassifier::new([SCAFFOLD]),
            Arc::new(Hierarchy),
            code.clone(),
            sink.clone(),
        );
        (analyzer, code, sink)
    }

    use CodeOrigin::{Application, Bootstrap};

    #[test]
    fn test_caught_in_caller() {
        let (analyzer, code, sink) = analyzer();
        let stack = Stack(vec![
            frame(SCAFFOLD, 3, Bootstrap),
            frame(0x20, 7, Application),
            frame(0x10, 12, Application).catching(Some(RUNTIME_EXCEPTION), 50),
        ]);

        let report = analyzer.raise(&stack, 0xE1, RUNTIME_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::Caught);
        assert_eq!(report.throw_at, Location::new(0x20, 7));
        assert_eq!(report.catch_at, Some(Location::new(0x10, 50)));

        let thread = thread::current_id();
        assert_eq!(
            sink.take(),
            vec![
                Event::Exception {
                    thread,
                    location: Location::new(0x20, 7),
                    exception: 0xE1,
                    catch_location: Some(Location::new(0x10, 50)),
                },
                Event::FramePop {
                    thread,
                    method: 0x20,
                    popped_by_exception: true,
                },
                Event::MethodExit {
                    thread,
                    method: 0x20,
                    popped_by_exception: true,
                },
            ]
        );
        assert_eq!(
            *code.instrumented.lock(),
            vec![(0x10, Instrumentation::ExceptionCatch)]
        );
    }

    #[test]
    fn test_caught_in_throwing_frame() {
        let (analyzer, _code, sink) = analyzer();
        let stack = Stack(vec![
            frame(0x20, 7, Application).catching(None, 30),
            frame(0x10, 12, Application),
        ]);

        let report = analyzer.raise(&stack, 1, IO_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::Caught);
        assert_eq!(report.catch_at, Some(Location::new(0x20, 30)));

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventType::Exception);
    }

    #[test]
    fn test_no_handler_is_uncaught() {
        let (analyzer, code, sink) = analyzer();
        let stack = Stack(vec![
            frame(0x20, 7, Application),
            frame(0x10, 12, Application),
            frame(0x1, 0, Bootstrap),
        ]);

        let report = analyzer.raise(&stack, 1, RUNTIME_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::UncaughtByApplication);
        assert_eq!(report.catch_at, None);

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Event::Exception {
                catch_location: None,
                ..
            }
        ));
        assert!(code.instrumented.lock().is_empty());
    }

    #[test]
    fn test_bootstrap_catch_is_uncaught() {
        let (analyzer, _code, sink) = analyzer();
        let stack = Stack(vec![
            frame(0x20, 7, Application),
            frame(0x1, 4, Bootstrap).catching(Some(THROWABLE), 9),
        ]);

        let report = analyzer.raise(&stack, 1, IO_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::UncaughtByApplication);
        assert_eq!(report.catch_at, Some(Location::new(0x1, 9)));
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn test_bootstrap_only_is_suppressed() {
        let (analyzer, code, sink) = analyzer();
        let stack = Stack(vec![
            frame(SCAFFOLD, 3, Bootstrap),
            frame(0x2, 5, Bootstrap),
            frame(0x1, 4, Bootstrap).catching(None, 9),
            frame(0x10, 1, Application),
        ]);

        let report = analyzer.raise(&stack, 1, IO_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::Suppressed);
        assert_eq!(report.throw_at, Location::new(0x2, 5));
        assert!(sink.take().is_empty());
        assert!(code.instrumented.lock().is_empty());
    }

    #[test]
    fn test_synthetic_and_mismatched_handlers_skipped() {
        let (analyzer, _code, _sink) = analyzer();
        let stack = Stack(vec![
            frame(0x20, 7, Application).synthetic(60),
            frame(0x18, 2, Application).catching(Some(IO_EXCEPTION), 20),
            frame(0x10, 12, Application).catching(Some(THROWABLE), 50),
        ]);

        let report = analyzer.raise(&stack, 1, RUNTIME_EXCEPTION).unwrap();
        assert_eq!(report.catch_at, Some(Location::new(0x10, 50)));
    }

    #[test]
    fn test_handler_range_respected() {
        let (analyzer, _code, _sink) = analyzer();
        let mut outside = frame(0x20, 150, Application);
        outside.handlers.push(HandlerEntry {
            start: 0,
            end: 100,
            handler: 110,
            catch_class: None,
            source_line: Some(8),
        });
        let stack = Stack(vec![outside]);

        let report = analyzer.raise(&stack, 1, IO_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::UncaughtByApplication);
    }

    #[test]
    fn test_only_scaffolding_yields_nothing() {
        let (analyzer, _code, sink) = analyzer();
        let stack = Stack(vec![frame(SCAFFOLD, 0, Bootstrap)]);
        assert_eq!(analyzer.raise(&stack, 1, IO_EXCEPTION), None);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_no_listeners_skips_walk() {
        let (analyzer, _code, sink) = analyzer();
        for kind in INTERESTED {
            sink.disable(kind);
        }
        assert_eq!(analyzer.raise(&Unwalkable, 1, IO_EXCEPTION), None);
    }

    #[test]
    fn test_catch_instrumentation_needs_listener() {
        let (analyzer, code, sink) = analyzer();
        sink.disable(EventType::ExceptionCatch);
        let stack = Stack(vec![
            frame(0x20, 7, Application),
            frame(0x10, 12, Application).catching(None, 50),
        ]);

        analyzer.raise(&stack, 1, IO_EXCEPTION).unwrap();
        assert!(code.instrumented.lock().is_empty());
    }

    #[test]
    fn test_catch_hook() {
        let (analyzer, _code, sink) = analyzer();
        analyzer.catch_hook(Location::new(0x10, 50), 0xE1);
        {
            let _scope = crate::thread::CallbackScope::enter();
            analyzer.catch_hook(Location::new(0x10, 50), 0xE2);
        }
        assert_eq!(
            sink.take(),
            vec![Event::ExceptionCatch {
                thread: thread::current_id(),
                location: Location::new(0x10, 50),
                exception: 0xE1,
            }]
        );
    }

    #[test]
    fn test_analysis_guard_rejects_reentry() {
        let outer = AnalysisGuard::enter().unwrap();
        assert!(AnalysisGuard::enter().is_none());
        drop(outer);
        assert!(AnalysisGuard::enter().is_some());
    }

    // Hierarchy that tries to start a nested analysis from inside the walk
    #[derive(Default)]
    struct NestingHierarchy {
        calls: std::sync::atomic::AtomicUsize,
        rejected: std::sync::atomic::AtomicUsize,
    }

    impl ClassHierarchy for NestingHierarchy {
        fn is_assignable(&self, class: ClassId, target: ClassId) -> bool {
            use std::sync::atomic::Ordering;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if AnalysisGuard::enter().is_none() {
                self.rejected.fetch_add(1, Ordering::SeqCst);
            }
            class == target
        }
    }

    #[test]
    fn test_hierarchy_callback_sees_analysis_in_progress() {
        use std::sync::atomic::Ordering;
        let hierarchy = Arc::new(NestingHierarchy::default());
        let analyzer = ExceptionAnalyzer::new(
            FrameClassifier::default(),
            hierarchy.clone(),
            Arc::new(RecordingCode::default()),
            Arc::new(RecordingSink::default()),
        );
        let stack = Stack(vec![frame(0x10, 4, Application).catching(Some(IO_EXCEPTION), 20)]);

        let report = analyzer.raise(&stack, 1, IO_EXCEPTION).unwrap();
        assert_eq!(report.disposition, Disposition::Caught);
        assert_eq!(report.catch_at, Some(Location::new(0x10, 20)));
        assert_eq!(hierarchy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hierarchy.rejected.load(Ordering::SeqCst), 1);

        // Guard released once the outer analysis finishes
        assert!(AnalysisGuard::enter().is_some());
    }

    // Raises again on the same thread while the outer stack is being walked
    struct RaisingStack<'a> {
        analyzer: &'a ExceptionAnalyzer,
        inner: Stack,
    }

    impl StackWalker for RaisingStack<'_> {
        fn walk(&self, _visit: &mut dyn FnMut(&FrameInfo<'_>) -> ControlFlow<()>) {
            self.analyzer.raise(&self.inner, 2, IO_EXCEPTION);
        }
    }

    #[test]
    fn test_reentrant_raise_aborts() {
        crate::error::testing::assert_aborts("exception::tests::test_reentrant_raise_aborts", || {
            let (analyzer, _code, _sink) = analyzer();
            let stack = RaisingStack {
                analyzer: &analyzer,
                inner: Stack(vec![frame(0x10, 1, Application)]),
            };
            analyzer.raise(&stack, 1, IO_EXCEPTION);
        });
    }

    #[test]
    fn test_scratch_reset_between_throws() {
        let (analyzer, _code, _sink) = analyzer();
        let caught = Stack(vec![frame(0x10, 1, Application).catching(None, 5)]);
        let uncaught = Stack(vec![frame(0x11, 1, Application)]);

        assert!(analyzer.raise(&caught, 1, IO_EXCEPTION).unwrap().catch_at.is_some());
        assert!(analyzer.raise(&uncaught, 2, IO_EXCEPTION).unwrap().catch_at.is_none());
    }
}
