//! The trace document: an ordered tree of calls, lines and exceptions
//!
//! Populated by [`crate::call_tree::CallTreeBuilder`] during capture, frozen
//! when the session stops, read-only afterwards.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::{FrameId, ThreadKey};
use crate::render::VariableSnapshot;

/// Microseconds since the Unix epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// How a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallResult {
    Returned { value: String },
    /// Exited by an exception propagating out of the frame
    Unwound,
    /// Still running when the session stopped
    NotReturned,
}

impl CallResult {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::NotReturned)
    }
}

/// One accepted call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallNode {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified_name: Option<String>,
    pub file: String,
    pub display_file: String,
    pub line: u32,
    pub thread: ThreadKey,
    pub frame: FrameId,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "VariableSnapshot::is_empty")]
    pub arguments: VariableSnapshot,
    pub children: Vec<TraceEntry>,
    pub result: CallResult,
    /// Entries in this subtree including the node itself (set by the index builder)
    #[serde(default)]
    pub subtree_size: usize,
}

impl CallNode {
    /// Name used for lookups: the qualified name when the host provides one
    pub fn display_name(&self) -> &str {
        self.qualified_name.as_deref().unwrap_or(&self.function)
    }

    pub fn line_events(&self) -> impl Iterator<Item = &LineEvent> {
        self.children.iter().filter_map(|c| match c {
            TraceEntry::Line(line) => Some(line),
            _ => None,
        })
    }

    pub fn child_calls(&self) -> impl Iterator<Item = &CallNode> {
        self.children.iter().filter_map(|c| match c {
            TraceEntry::Call(call) => Some(call),
            _ => None,
        })
    }

    pub fn exceptions(&self) -> impl Iterator<Item = &ExceptionRecord> {
        self.children.iter().filter_map(|c| match c {
            TraceEntry::Exception(exc) => Some(exc),
            _ => None,
        })
    }
}

/// One executed source line inside a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEvent {
    pub file: String,
    pub line: u32,
    /// Changed locals since the previous line of the same call, or the
    /// configured capture expressions
    #[serde(default)]
    pub variables: VariableSnapshot,
}

/// One exception occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub type_name: String,
    pub message: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub frame: FrameId,
    pub thread: ThreadKey,
    /// Position in the thread's exception chain when raised (0 = outermost)
    pub chain_position: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
}

/// A child of a call node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEntry {
    Call(CallNode),
    Line(LineEvent),
    Exception(ExceptionRecord),
}

impl TraceEntry {
    pub fn file(&self) -> &str {
        match self {
            Self::Call(call) => &call.file,
            Self::Line(line) => &line.file,
            Self::Exception(exc) => &exc.file,
        }
    }

    /// Entries in this subtree, the entry itself included
    pub fn size(&self) -> usize {
        match self {
            Self::Call(call) => call.subtree_size.max(1),
            _ => 1,
        }
    }
}

/// Child-index path from the root list to an entry
pub type NodePath = Vec<usize>;

/// Borrowed view of any entry, root calls included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRef<'a> {
    Call(&'a CallNode),
    Line(&'a LineEvent),
    Exception(&'a ExceptionRecord),
}

impl<'a> From<&'a TraceEntry> for EntryRef<'a> {
    fn from(entry: &'a TraceEntry) -> Self {
        match entry {
            TraceEntry::Call(call) => Self::Call(call),
            TraceEntry::Line(line) => Self::Line(line),
            TraceEntry::Exception(exc) => Self::Exception(exc),
        }
    }
}

/// Call-only projection of the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkeletonNode<'a> {
    pub function: &'a str,
    pub file: &'a str,
    pub line: u32,
    pub depth: usize,
    pub result: &'a CallResult,
    pub children: Vec<SkeletonNode<'a>>,
}

impl<'a> SkeletonNode<'a> {
    fn of(call: &'a CallNode) -> Self {
        Self {
            function: call.display_name(),
            file: &call.display_file,
            line: call.line,
            depth: call.depth,
            result: &call.result,
            children: call.child_calls().map(SkeletonNode::of).collect(),
        }
    }
}

/// Root container of one capture session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceDocument {
    pub calls: Vec<CallNode>,
    pub started_at_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_us: Option<u64>,
    /// Events dropped because the builder failed on them
    pub error_count: u64,
}

impl Default for TraceDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceDocument {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            started_at_us: now_us(),
            ended_at_us: None,
            error_count: 0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at_us.is_some()
    }

    pub fn finalize(&mut self) {
        if self.ended_at_us.is_none() {
            self.ended_at_us = Some(now_us().max(self.started_at_us));
        }
    }

    /// Entry at `path`, or `None` if the path leads nowhere
    pub fn resolve(&self, path: &[usize]) -> Option<EntryRef<'_>> {
        let (first, rest) = path.split_first()?;
        let mut current = EntryRef::Call(self.calls.get(*first)?);
        for index in rest {
            current = match current {
                EntryRef::Call(call) => EntryRef::from(call.children.get(*index)?),
                _ => return None,
            };
        }
        Some(current)
    }

    /// Call node at `path`
    pub fn call_at(&self, path: &[usize]) -> Option<&CallNode> {
        match self.resolve(path)? {
            EntryRef::Call(call) => Some(call),
            _ => None,
        }
    }

    /// Call-only view, computed from the tree on every call
    pub fn skeleton(&self) -> Vec<SkeletonNode<'_>> {
        self.calls.iter().map(SkeletonNode::of).collect()
    }

    /// All entries (calls, lines, exceptions) in the document
    pub fn total_entries(&self) -> usize {
        fn count(call: &CallNode) -> usize {
            1 + call
                .children
                .iter()
                .map(|c| match c {
                    TraceEntry::Call(child) => count(child),
                    _ => 1,
                })
                .sum::<usize>()
        }
        self.calls.iter().map(count).sum()
    }
}
