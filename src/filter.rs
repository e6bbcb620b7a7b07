//! Event dispatch for frame events
//!
//! [`EventFilter`] is the callback surface the host calls on every
//! call/line/return/exception of every thread. It decides whether a frame is
//! code of interest, remembers which frames are active, and forwards events
//! for active frames to the [`CallTreeBuilder`].
//!
//! One mutex guards the file cache, the active set and the builder call
//! together. Frame data (arguments, locals, capture expressions) is read
//! before the lock is taken; log messages are written after it is released.
//!
//! No entry point ever returns an error or panics into the host: builder
//! failures and panics are logged, counted and the event is dropped.

use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;

use crate::call_tree::{CallDecision, CallSite, CallTreeBuilder, Notice, NoticeLevel};
use crate::config::TraceConfig;
use crate::document::TraceDocument;
use crate::error::BuilderError;
use crate::frame::{EventKind, EventPayload, ExceptionInfo, FrameId, FrameInfo, FrameView, ThreadKey};
use crate::index::IndexBuilder;
use crate::matcher::PatternMatcher;
use crate::render::LineCapture;

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside an entry point until dropped
struct ReentryGuard;

impl ReentryGuard {
    /// `None` if this thread is already dispatching
    fn enter() -> Option<Self> {
        IN_DISPATCH.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(false));
    }
}

/// Correlation record for one active frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub frame: FrameId,
    pub thread: ThreadKey,
    /// `false` for frames tracked without a node
    pub recorded: bool,
}

type FrameKey = (ThreadKey, FrameId);

fn frame_key(frame: &dyn FrameView) -> FrameKey {
    (frame.thread(), frame.id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
struct DispatchState {
    phase: Phase,
    /// File name → include decision
    file_cache: FnvHashMap<String, bool>,
    active: FnvHashMap<FrameKey, FrameContext>,
    builder: CallTreeBuilder,
}

impl DispatchState {
    fn is_active(&self, key: &FrameKey) -> bool {
        self.phase == Phase::Running && self.active.contains_key(key)
    }
}

/// Thread-safe dispatcher for one trace session
#[derive(Debug)]
pub struct EventFilter {
    config: TraceConfig,
    matcher: PatternMatcher,
    state: Mutex<DispatchState>,
    errors: AtomicU64,
}

impl EventFilter {
    /// Create an idle filter; events are ignored until [`EventFilter::start`]
    pub fn new(config: TraceConfig) -> Self {
        let matcher = PatternMatcher::new(&config);
        let builder = CallTreeBuilder::new(config.clone());
        Self {
            config,
            matcher,
            state: Mutex::new(DispatchState {
                phase: Phase::Idle,
                file_cache: FnvHashMap::default(),
                active: FnvHashMap::default(),
                builder,
            }),
            errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Begin accepting events. Returns `false` if the filter was already
    /// started or has been stopped.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return false;
        }
        state.phase = Phase::Running;
        drop(state);
        tracing::debug!(
            "Trace session started ({} include patterns, deferred: {})",
            self.config.include.len(),
            self.config.start_trigger.is_some()
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().phase == Phase::Running
    }

    /// Stop capture and return the finalized, size-annotated document.
    ///
    /// Open calls are closed as "not returned". Only the first call returns a
    /// document; later calls return `None`.
    pub fn stop(&self) -> Option<TraceDocument> {
        let mut state = self.state.lock();
        if state.phase == Phase::Stopped {
            return None;
        }
        state.phase = Phase::Stopped;
        state.active.clear();
        let mut document = state.builder.finish();
        let notices = state.builder.drain_notices();
        drop(state);

        emit(notices);
        document.error_count = self.error_count();
        IndexBuilder::annotate(&mut document);
        tracing::debug!(
            "Trace session stopped: {} root calls, {} entries, {} dropped events",
            document.calls.len(),
            document.total_entries(),
            document.error_count
        );
        Some(document)
    }

    /// Events dropped because processing them failed
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Frames currently receiving LINE/EXCEPTION forwarding
    pub fn active_frames(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Whether `frame` is in the active set
    pub fn is_active(&self, frame: &dyn FrameView) -> bool {
        self.state.lock().is_active(&frame_key(frame))
    }

    /// CALL: decide whether the frame is code of interest and open it.
    /// Returns whether the frame should keep receiving events.
    pub fn on_call(&self, frame: &dyn FrameView) -> bool {
        self.guarded(EventKind::Call, frame, || self.handle_call(frame))
            .unwrap_or(false)
    }

    /// LINE: forwarded only for active frames
    pub fn on_line(&self, frame: &dyn FrameView) {
        self.guarded(EventKind::Line, frame, || {
            let key = frame_key(frame);
            if !self.state.lock().is_active(&key) {
                return;
            }
            let info = FrameInfo::of(frame);
            let capture = LineCapture::collect(frame, &self.config);
            self.forward(EventKind::Line, frame, |state| {
                if !state.active.contains_key(&key) {
                    return Ok(());
                }
                state.builder.handle_line(&info, capture)
            });
        });
    }

    /// RETURN: closes the frame's call and drops its context. `value` is
    /// `None` when the frame exited by unwinding.
    pub fn on_return(&self, frame: &dyn FrameView, value: Option<String>) {
        self.guarded(EventKind::Return, frame, || {
            let key = frame_key(frame);
            if !self.state.lock().is_active(&key) {
                return;
            }
            let info = FrameInfo::of(frame);
            self.forward(EventKind::Return, frame, |state| {
                if state.active.remove(&key).is_none() {
                    return Ok(());
                }
                state.builder.handle_return(&info, value)
            });
        });
    }

    /// EXCEPTION: an exception was raised in an active frame
    pub fn on_exception(&self, frame: &dyn FrameView, exception: ExceptionInfo) {
        self.guarded(EventKind::Exception, frame, || {
            let key = frame_key(frame);
            if !self.state.lock().is_active(&key) {
                return;
            }
            let info = FrameInfo::of(frame);
            self.forward(EventKind::Exception, frame, |state| {
                if !state.active.contains_key(&key) {
                    return Ok(());
                }
                state.builder.handle_exception_raised(&info, exception)
            });
        });
    }

    /// Exception caught in `frame`. Pops the thread's chain only when the
    /// frame is active; an empty chain is left alone.
    pub fn on_exception_handled(&self, frame: &dyn FrameView) {
        self.guarded(EventKind::ExceptionHandled, frame, || {
            let key = frame_key(frame);
            if !self.state.lock().is_active(&key) {
                return;
            }
            let info = FrameInfo::of(frame);
            self.forward(EventKind::ExceptionHandled, frame, |state| {
                if state.active.contains_key(&key) {
                    state.builder.handle_exception_handled(&info);
                }
                Ok(())
            });
        });
    }

    /// Route one `(kind, frame, payload)` event. Returns whether the frame
    /// is active after the event.
    ///
    /// A RETURN without a return payload is treated as unwinding; an
    /// EXCEPTION without exception details is recorded with an unknown type.
    pub fn dispatch(&self, kind: EventKind, frame: &dyn FrameView, payload: EventPayload) -> bool {
        match kind {
            EventKind::Call => return self.on_call(frame),
            EventKind::Line => self.on_line(frame),
            EventKind::Return => {
                let value = match payload {
                    EventPayload::Return(value) => value,
                    _ => None,
                };
                self.on_return(frame, value);
            }
            EventKind::Exception => {
                let exception = match payload {
                    EventPayload::Exception(info) => info,
                    _ => ExceptionInfo::new("<unknown>", ""),
                };
                self.on_exception(frame, exception);
            }
            EventKind::ExceptionHandled => self.on_exception_handled(frame),
        }
        self.is_active(frame)
    }

    fn handle_call(&self, frame: &dyn FrameView) -> bool {
        let file = frame.file();
        let cached = {
            let state = self.state.lock();
            if state.phase != Phase::Running {
                return false;
            }
            state.file_cache.get(file).copied()
        };

        let accepted = match cached {
            Some(accepted) => accepted,
            None => self.resolve_file(file),
        };
        if !accepted {
            return false;
        }

        let site = CallSite::capture(frame, &self.config);
        let key = frame_key(frame);
        self.forward(EventKind::Call, frame, |state| {
            let decision = state.builder.handle_call(site)?;
            if decision.is_active() {
                state.active.insert(
                    key,
                    FrameContext {
                        frame: key.1,
                        thread: key.0,
                        recorded: decision == CallDecision::Recorded,
                    },
                );
            }
            Ok(decision.is_active())
        })
        .unwrap_or(false)
    }

    /// Match a file not yet in the cache and remember the decision.
    /// Failures count as "no match" and, being cached, are logged once.
    fn resolve_file(&self, file: &str) -> bool {
        let (accepted, failure) = match self.matcher.try_matches(file) {
            Ok(accepted) => (accepted, None),
            Err(e) => (false, Some(e)),
        };
        self.state.lock().file_cache.insert(file.to_string(), accepted);

        if let Some(e) = failure {
            tracing::debug!("Treating file as not matched: {}", e);
        }
        accepted
    }

    /// Apply one update to the shared state under the lock, then log what it
    /// produced. `None` if the session is not running or the update failed.
    fn forward<R>(
        &self,
        kind: EventKind,
        frame: &dyn FrameView,
        update: impl FnOnce(&mut DispatchState) -> Result<R, BuilderError>,
    ) -> Option<R> {
        let (result, notices) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Running {
                return None;
            }
            let result = update(&mut *state);
            (result, state.builder.drain_notices())
        };

        emit(notices);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Dropped {} event at {}:{} in {}: {}",
                    kind,
                    frame.file(),
                    frame.line(),
                    frame.function_name(),
                    e
                );
                None
            }
        }
    }

    /// Reentrancy and panic boundary around every entry point
    fn guarded<R>(&self, kind: EventKind, frame: &dyn FrameView, body: impl FnOnce() -> R) -> Option<R> {
        let _guard = ReentryGuard::enter()?;
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => Some(value),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "Trace dispatch panicked on {} event at {}:{}: {}",
                    kind,
                    frame.file(),
                    frame.line(),
                    message
                );
                None
            }
        }
    }
}

fn emit(notices: Vec<Notice>) {
    for notice in notices {
        match notice.level {
            NoticeLevel::Debug => tracing::debug!("{}", notice.message),
            NoticeLevel::Warn => tracing::warn!("{}", notice.message),
        }
    }
}
