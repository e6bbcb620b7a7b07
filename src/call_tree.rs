//! Call-tree reconstruction
//!
//! [`CallTreeBuilder`] consumes the events the filter forwards and assembles
//! the [`TraceDocument`]. All open-call state is keyed by thread: each thread
//! has its own stack of open calls and its own [`ExceptionChain`].
//!
//! Stack entries come in two flavors. A recorded entry owns the `CallNode`
//! being built. A placeholder stands for a frame the filter tracks but the
//! tree does not show: frames entered before deferred activation, and frames
//! nested deeper than `max_call_depth`. Placeholders keep call/return pairing
//! and depth numbering intact. Closed nodes attach to the nearest recorded
//! ancestor, or to the document root.
//!
//! Nothing here logs. Messages meant for the log are queued as notices and
//! drained by the filter after it releases its lock.

use fnv::FnvHashMap;

use crate::config::TraceConfig;
use crate::document::{CallNode, CallResult, ExceptionRecord, LineEvent, TraceDocument, TraceEntry};
use crate::error::BuilderError;
use crate::frame::{ExceptionInfo, FrameId, FrameInfo, FrameView, ThreadKey};
use crate::render::{capture_arguments, diff_snapshot, truncate_value, LineCapture, VariableSnapshot};

/// What the filter should do with a frame after its CALL event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    /// A node was opened; keep forwarding the frame's events
    Recorded,
    /// Tracked without a node (before activation, or too deep)
    Placeholder,
    /// Excluded function: the frame is inactive
    Skipped,
}

impl CallDecision {
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

/// Everything `handle_call` needs, captured before the dispatch lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub frame: FrameInfo,
    pub display_file: String,
    pub arguments: VariableSnapshot,
}

impl CallSite {
    pub fn capture(frame: &dyn FrameView, config: &TraceConfig) -> Self {
        Self {
            display_file: config.display_path(frame.file()),
            arguments: capture_arguments(frame),
            frame: FrameInfo::of(frame),
        }
    }
}

/// Severity of a queued log message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Debug,
    Warn,
}

/// Log message produced while the lock was held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainLink {
    type_name: String,
    depth: usize,
}

/// Per-thread stack of exceptions currently propagating
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionChain {
    links: Vec<ChainLink>,
}

impl ExceptionChain {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn push(&mut self, link: ChainLink) -> usize {
        self.links.push(link);
        self.links.len() - 1
    }

    /// Pop the innermost exception; empty chain is a no-op
    pub fn pop(&mut self) -> Option<String> {
        self.links.pop().map(|link| link.type_name)
    }

    /// Type names from outermost to innermost
    pub fn type_names(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.type_name.as_str()).collect()
    }

    /// Drop links recorded at `depth` or deeper
    fn resolve_from(&mut self, depth: usize) {
        self.links.retain(|l| l.depth < depth);
    }
}

#[derive(Debug)]
struct OpenCall {
    frame: FrameId,
    /// `None` for placeholders
    node: Option<CallNode>,
    snapshot: VariableSnapshot,
}

#[derive(Debug, Default)]
struct ThreadState {
    stack: Vec<OpenCall>,
    chain: ExceptionChain,
    /// Host depth of the bottom stack entry
    base_depth: usize,
    calibrated: bool,
    depth_warned: bool,
}

impl ThreadState {
    fn depth_of(&self, index: usize) -> usize {
        self.base_depth + index
    }

    fn next_depth(&self) -> usize {
        self.depth_of(self.stack.len())
    }

    fn position(&self, frame: FrameId) -> Option<usize> {
        self.stack.iter().rposition(|c| c.frame == frame)
    }

    /// Align depth numbering with the host's depth for a frame that is about
    /// to sit at stack index `index`
    fn calibrate(&mut self, host_depth: usize, index: usize) {
        self.base_depth = host_depth.saturating_sub(index);
        self.calibrated = true;
    }
}

/// Builds the call tree from forwarded events
#[derive(Debug)]
pub struct CallTreeBuilder {
    config: TraceConfig,
    document: TraceDocument,
    threads: FnvHashMap<ThreadKey, ThreadState>,
    activated: bool,
    finalized: bool,
    notices: Vec<Notice>,
}

impl CallTreeBuilder {
    pub fn new(config: TraceConfig) -> Self {
        let activated = config.start_trigger.is_none();
        Self {
            config,
            document: TraceDocument::new(),
            threads: FnvHashMap::default(),
            activated,
            finalized: false,
            notices: Vec::new(),
        }
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Whether capture is on (always, unless a start trigger is still pending)
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn document(&self) -> &TraceDocument {
        &self.document
    }

    /// Open calls on one thread
    pub fn open_calls(&self, thread: ThreadKey) -> usize {
        self.threads.get(&thread).map_or(0, |s| s.stack.len())
    }

    /// In-flight exceptions on one thread
    pub fn exception_chain(&self, thread: ThreadKey) -> Option<&ExceptionChain> {
        self.threads.get(&thread).map(|s| &s.chain)
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notice(&mut self, level: NoticeLevel, message: String) {
        self.notices.push(Notice { level, message });
    }

    fn ensure_open(&self) -> Result<(), BuilderError> {
        if self.finalized {
            Err(BuilderError::Finalized)
        } else {
            Ok(())
        }
    }

    fn trigger_hit(&self, file: &str, line: u32) -> bool {
        self.config
            .start_trigger
            .as_ref()
            .is_some_and(|t| t.matches(file, line))
    }

    /// Open a call for an accepted CALL event
    pub fn handle_call(&mut self, site: CallSite) -> Result<CallDecision, BuilderError> {
        self.ensure_open()?;
        let frame = &site.frame;

        if self.config.is_excluded_function(&frame.function) {
            return Ok(CallDecision::Skipped);
        }

        let trigger_hit = !self.activated && self.trigger_hit(&frame.file, frame.line);
        let deferred = self.config.start_trigger.is_some();
        let max_depth = self.config.max_call_depth;
        let state = self.threads.entry(frame.thread).or_default();

        if !self.activated && !trigger_hit {
            state.stack.push(OpenCall {
                frame: frame.id,
                node: None,
                snapshot: VariableSnapshot::new(),
            });
            return Ok(CallDecision::Placeholder);
        }

        if deferred && !state.calibrated {
            let index = state.stack.len();
            state.calibrate(frame.depth, index);
        }

        let depth = state.next_depth();
        // Anything raised at this depth or deeper was caught somewhere
        state.chain.resolve_from(depth);

        if depth >= max_depth {
            let first = !state.depth_warned;
            state.depth_warned = true;
            state.stack.push(OpenCall {
                frame: frame.id,
                node: None,
                snapshot: VariableSnapshot::new(),
            });
            if first {
                self.notice(
                    NoticeLevel::Warn,
                    format!(
                        "Max call depth {} reached on thread {}; deeper calls are not recorded ({}:{})",
                        max_depth, frame.thread, frame.file, frame.line
                    ),
                );
            }
            return Ok(CallDecision::Placeholder);
        }

        let CallSite {
            frame,
            display_file,
            arguments,
        } = site;
        let node = CallNode {
            function: frame.function,
            qualified_name: frame.qualified_name,
            file: frame.file,
            display_file,
            line: frame.line,
            thread: frame.thread,
            frame: frame.id,
            depth,
            arguments,
            children: Vec::new(),
            result: CallResult::NotReturned,
            subtree_size: 0,
        };
        let (location, thread) = (format!("{}:{}", node.file, node.line), node.thread);
        state.stack.push(OpenCall {
            frame: node.frame,
            node: Some(node),
            snapshot: VariableSnapshot::new(),
        });

        if trigger_hit {
            self.activate(thread, location);
        }
        Ok(CallDecision::Recorded)
    }

    fn activate(&mut self, thread: ThreadKey, location: String) {
        self.activated = true;
        self.notice(
            NoticeLevel::Debug,
            format!("Deferred capture activated at {} on thread {}", location, thread),
        );
    }

    /// Record an executed line for an active frame
    pub fn handle_line(&mut self, frame: &FrameInfo, capture: LineCapture) -> Result<(), BuilderError> {
        self.ensure_open()?;

        if !self.activated {
            // The triggering frame stays a placeholder. Depth numbering is
            // aligned by the first recorded call, which may sit below
            // filtered frames.
            if self.trigger_hit(&frame.file, frame.line) {
                self.activate(frame.thread, format!("{}:{}", frame.file, frame.line));
            }
            return Ok(());
        }

        let state = self
            .threads
            .get_mut(&frame.thread)
            .ok_or(BuilderError::NoOpenCall {
                frame: frame.id.0,
                thread: frame.thread.0,
            })?;
        let index = state.position(frame.id).ok_or(BuilderError::NoOpenCall {
            frame: frame.id.0,
            thread: frame.thread.0,
        })?;
        close_missed(state, &mut self.document, index);

        if !self.config.allows_line(&frame.file, frame.line) {
            return Ok(());
        }
        let open = &mut state.stack[index];
        let Some(node) = open.node.as_mut() else {
            return Ok(());
        };

        let variables = match capture {
            LineCapture::Nothing => VariableSnapshot::new(),
            LineCapture::Locals(current) => {
                let changed = diff_snapshot(&open.snapshot, &current);
                open.snapshot = current;
                changed
            }
            LineCapture::Expressions(values) => values,
        };

        node.children.push(TraceEntry::Line(LineEvent {
            file: frame.file.clone(),
            line: frame.line,
            variables,
        }));
        Ok(())
    }

    /// Close the frame's call. `value` is `None` when the frame unwound.
    ///
    /// A RETURN for a frame with no open entry is ignored.
    pub fn handle_return(&mut self, frame: &FrameInfo, value: Option<String>) -> Result<(), BuilderError> {
        self.ensure_open()?;

        let Some(state) = self.threads.get_mut(&frame.thread) else {
            return Ok(());
        };
        let Some(index) = state.position(frame.id) else {
            return Ok(());
        };

        close_missed(state, &mut self.document, index);

        let depth = state.depth_of(index);
        let Some(open) = state.stack.pop() else {
            return Ok(());
        };

        let result = match value {
            Some(v) => {
                state.chain.resolve_from(depth);
                CallResult::Returned {
                    value: truncate_value(&v),
                }
            }
            None => CallResult::Unwound,
        };
        close_into(&mut state.stack, &mut self.document, open, result);
        Ok(())
    }

    /// Push a raised (or re-raised) exception onto the thread's chain and
    /// record it under the frame's call
    pub fn handle_exception_raised(
        &mut self,
        frame: &FrameInfo,
        exception: ExceptionInfo,
    ) -> Result<(), BuilderError> {
        self.ensure_open()?;

        let state = self
            .threads
            .get_mut(&frame.thread)
            .ok_or(BuilderError::NoOpenCall {
                frame: frame.id.0,
                thread: frame.thread.0,
            })?;
        let index = state.position(frame.id).ok_or(BuilderError::NoOpenCall {
            frame: frame.id.0,
            thread: frame.thread.0,
        })?;
        close_missed(state, &mut self.document, index);

        let depth = state.depth_of(index);
        let chain_position = state.chain.push(ChainLink {
            type_name: exception.type_name.clone(),
            depth,
        });

        if let Some(node) = state.stack[index].node.as_mut() {
            node.children.push(TraceEntry::Exception(ExceptionRecord {
                type_name: exception.type_name,
                message: truncate_value(&exception.message),
                function: frame.function.clone(),
                file: frame.file.clone(),
                line: frame.line,
                frame: frame.id,
                thread: frame.thread,
                chain_position,
                traceback: exception.traceback,
            }));
        }
        Ok(())
    }

    /// The in-flight exception was caught. Popping an empty chain is a no-op.
    pub fn handle_exception_handled(&mut self, frame: &FrameInfo) {
        if let Some(state) = self.threads.get_mut(&frame.thread) {
            state.chain.pop();
        }
    }

    /// Close every open call as "not returned" and hand out the document
    pub fn finish(&mut self) -> TraceDocument {
        if !self.finalized {
            let mut threads: Vec<_> = self.threads.drain().collect();
            threads.sort_by_key(|(thread, _)| *thread);
            for (_, mut state) in threads {
                while let Some(open) = state.stack.pop() {
                    close_into(&mut state.stack, &mut self.document, open, CallResult::NotReturned);
                }
            }
            self.document.finalize();
            self.finalized = true;
        }
        std::mem::take(&mut self.document)
    }
}

/// Close the entries above `index`: the frame at `index` is running again,
/// so they missed their RETURN
fn close_missed(state: &mut ThreadState, document: &mut TraceDocument, index: usize) {
    while state.stack.len() > index + 1 {
        if let Some(open) = state.stack.pop() {
            close_into(&mut state.stack, document, open, CallResult::NotReturned);
        }
    }
}

/// Attach a closed entry to the nearest recorded ancestor or the root list
fn close_into(stack: &mut [OpenCall], document: &mut TraceDocument, open: OpenCall, result: CallResult) {
    let Some(mut node) = open.node else {
        return;
    };
    node.result = result;
    match stack.iter_mut().rev().find_map(|c| c.node.as_mut()) {
        Some(parent) => parent.children.push(TraceEntry::Call(node)),
        None => document.calls.push(node),
    }
}
