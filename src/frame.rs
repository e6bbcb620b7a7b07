//! Host-runtime event contract
//!
//! The host delivers, per thread, `(event_kind, frame, payload)` tuples. The
//! frame is seen through [`FrameView`], a small read-only interface any
//! runtime can implement; [`FrameRecord`] is an owned implementation used by
//! the replay host and by tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of one frame for the duration of one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the host thread that produced an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(pub u64);

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a raw frame event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Call,
    Line,
    Return,
    /// An exception was raised (or re-raised) in the frame
    Exception,
    /// A `try` block in the frame caught the in-flight exception
    ExceptionHandled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Call => "call",
            Self::Line => "line",
            Self::Return => "return",
            Self::Exception => "exception",
            Self::ExceptionHandled => "exception_handled",
        };
        f.write_str(name)
    }
}

/// Exception details carried by an EXCEPTION event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    /// Rendered traceback entries, innermost last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum EventPayload {
    #[default]
    None,
    /// Rendered return value; `None` when the frame exited by unwinding
    Return(Option<String>),
    Exception(ExceptionInfo),
}

/// Read-only view of a host frame
///
/// Values are rendered by the host; the engine only truncates them.
pub trait FrameView {
    fn id(&self) -> FrameId;
    fn thread(&self) -> ThreadKey;
    fn function_name(&self) -> &str;
    fn qualified_name(&self) -> Option<&str> {
        None
    }
    fn file(&self) -> &str;
    /// Line currently executing (the definition line on CALL)
    fn line(&self) -> u32;
    /// Host call depth on this thread, 0 for the outermost frame
    fn depth(&self) -> usize;
    fn arguments(&self) -> Vec<(String, String)> {
        Vec::new()
    }
    fn locals(&self) -> Vec<(String, String)> {
        Vec::new()
    }
    /// Evaluate a capture expression in this frame's scope
    fn evaluate(&self, expression: &str) -> Result<String, String>;
}

/// Cheap owned copy of the frame fields the call tree needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub thread: ThreadKey,
    pub function: String,
    pub qualified_name: Option<String>,
    pub file: String,
    pub line: u32,
    pub depth: usize,
}

impl FrameInfo {
    pub fn of(frame: &dyn FrameView) -> Self {
        Self {
            id: frame.id(),
            thread: frame.thread(),
            function: frame.function_name().to_string(),
            qualified_name: frame.qualified_name().map(str::to_string),
            file: frame.file().to_string(),
            line: frame.line(),
            depth: frame.depth(),
        }
    }
}

/// Owned frame description, as stored in recorded event streams
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameRecord {
    pub id: FrameId,
    #[serde(default)]
    pub thread: ThreadKey,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified_name: Option<String>,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locals: BTreeMap<String, String>,
    /// Precomputed results for capture expressions that are not plain locals
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expressions: BTreeMap<String, String>,
}

impl FrameRecord {
    pub fn new(id: u64, function: &str, file: &str, line: u32) -> Self {
        Self {
            id: FrameId(id),
            function: function.to_string(),
            file: file.to_string(),
            line,
            ..Self::default()
        }
    }

    pub fn on_thread(mut self, thread: u64) -> Self {
        self.thread = ThreadKey(thread);
        self
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn with_local(mut self, name: &str, value: &str) -> Self {
        self.locals.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_locals(mut self, locals: &[(&str, &str)]) -> Self {
        self.locals = locals
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn with_argument(mut self, name: &str, value: &str) -> Self {
        self.arguments.push((name.to_string(), value.to_string()));
        self
    }
}

impl FrameView for FrameRecord {
    fn id(&self) -> FrameId {
        self.id
    }

    fn thread(&self) -> ThreadKey {
        self.thread
    }

    fn function_name(&self) -> &str {
        &self.function
    }

    fn qualified_name(&self) -> Option<&str> {
        self.qualified_name.as_deref()
    }

    fn file(&self) -> &str {
        &self.file
    }

    fn line(&self) -> u32 {
        self.line
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn arguments(&self) -> Vec<(String, String)> {
        self.arguments.clone()
    }

    fn locals(&self) -> Vec<(String, String)> {
        self.locals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn evaluate(&self, expression: &str) -> Result<String, String> {
        self.locals
            .get(expression)
            .or_else(|| self.expressions.get(expression))
            .cloned()
            .ok_or_else(|| format!("name '{}' is not defined", expression))
    }
}
