//! Variable snapshots and value truncation
//!
//! Snapshots are collected from the host frame before the dispatch lock is
//! taken, so the string work here never runs inside the critical section.

use std::collections::BTreeMap;

use crate::config::TraceConfig;
use crate::frame::FrameView;

/// Longest rendered value kept verbatim
pub const MAX_VALUE_LENGTH: usize = 256;

/// Variable name → rendered value
pub type VariableSnapshot = BTreeMap<String, String>;

/// Shorten a rendered value to at most [`MAX_VALUE_LENGTH`] characters.
///
/// Quoted or plain strings keep their head and tail with an "omitted" note;
/// anything else is cut and suffixed with `...`.
pub fn truncate_value(value: &str) -> String {
    let len = value.chars().count();
    if len <= MAX_VALUE_LENGTH {
        return value.to_string();
    }

    if looks_like_text(value) {
        let half = MAX_VALUE_LENGTH / 2;
        let head: String = value.chars().take(half).collect();
        let tail: String = value.chars().skip(len - half).collect();
        let omitted = len - 2 * half;
        return format!(
            "{}...{} (total length: {}, omitted: {})",
            head, tail, len, omitted
        );
    }

    let head: String = value.chars().take(MAX_VALUE_LENGTH).collect();
    format!("{}...", head)
}

fn looks_like_text(value: &str) -> bool {
    let quoted = |q: char| value.starts_with(q) && value.ends_with(q);
    let structured = value.starts_with(['[', '{', '(', '<']);
    quoted('\'') || quoted('"') || !structured
}

/// `self`, `cls` and name-mangled privates are never recorded
pub fn is_hidden_variable(name: &str) -> bool {
    name == "self" || name == "cls" || (name.starts_with("__") && !name.ends_with("__"))
}

/// Rendered call arguments, minus hidden names
pub fn capture_arguments(frame: &dyn FrameView) -> VariableSnapshot {
    frame
        .arguments()
        .into_iter()
        .filter(|(name, _)| !is_hidden_variable(name))
        .map(|(name, value)| (name, truncate_value(&value)))
        .collect()
}

/// What a LINE event carries into the call tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCapture {
    /// Variable tracing disabled, or line filtered out
    Nothing,
    /// Current locals; the builder diffs them against the previous line
    Locals(VariableSnapshot),
    /// Explicit capture expressions, recorded unfiltered
    Expressions(VariableSnapshot),
}

impl LineCapture {
    /// Collect the data a LINE event needs from the host frame
    pub fn collect(frame: &dyn FrameView, config: &TraceConfig) -> Self {
        if !config.allows_line(frame.file(), frame.line()) {
            return Self::Nothing;
        }

        if !config.capture_expressions.is_empty() {
            let values = config
                .capture_expressions
                .iter()
                .map(|expr| {
                    let rendered = match frame.evaluate(expr) {
                        Ok(value) => truncate_value(&value),
                        Err(reason) => format!("<evaluation error: {}>", reason),
                    };
                    (expr.clone(), rendered)
                })
                .collect();
            return Self::Expressions(values);
        }

        if config.enable_var_trace {
            let locals = frame
                .locals()
                .into_iter()
                .filter(|(name, _)| !is_hidden_variable(name))
                .map(|(name, value)| (name, truncate_value(&value)))
                .collect();
            return Self::Locals(locals);
        }

        Self::Nothing
    }
}

/// Entries of `current` that are new or changed relative to `previous`
pub fn diff_snapshot(previous: &VariableSnapshot, current: &VariableSnapshot) -> VariableSnapshot {
    current
        .iter()
        .filter(|(name, value)| previous.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
