//! JSON export of a finished trace
//!
//! The report bundles the frozen document, its search index and summary
//! statistics for an external renderer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::document::{CallNode, TraceDocument, TraceEntry};
use crate::index::SearchIndex;

/// Summary statistics for the trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonSummary {
    pub total_calls: u64,
    pub total_lines: u64,
    pub total_exceptions: u64,
    /// Deepest recorded call depth
    pub max_depth: usize,
    /// Distinct threads with at least one recorded call
    pub threads: usize,
    /// Events dropped during capture
    pub errors: u64,
    /// Session duration in microseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<u64>,
}

impl JsonSummary {
    pub fn of(document: &TraceDocument) -> Self {
        let mut summary = Self {
            errors: document.error_count,
            duration_us: document
                .ended_at_us
                .map(|end| end.saturating_sub(document.started_at_us)),
            ..Self::default()
        };
        let mut threads = BTreeSet::new();
        for call in &document.calls {
            summary.visit(call, &mut threads);
        }
        summary.threads = threads.len();
        summary
    }

    fn visit(&mut self, call: &CallNode, threads: &mut BTreeSet<u64>) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(call.depth);
        threads.insert(call.thread.0);
        for child in &call.children {
            match child {
                TraceEntry::Call(node) => self.visit(node, threads),
                TraceEntry::Line(_) => self.total_lines += 1,
                TraceEntry::Exception(_) => self.total_exceptions += 1,
            }
        }
    }
}

/// Root JSON output structure
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    pub summary: JsonSummary,
    pub trace: TraceDocument,
    pub index: SearchIndex,
}

impl TraceReport {
    pub fn new(document: TraceDocument, index: SearchIndex) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "calltrace-json-v1".to_string(),
            summary: JsonSummary::of(&document),
            trace: document,
            index,
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serialize only the call skeleton (no line events)
    pub fn skeleton_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.trace.skeleton())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::{call, line};
    use crate::document::{ExceptionRecord, TraceEntry};
    use crate::frame::{FrameId, ThreadKey};
    use crate::index::IndexBuilder;

    fn report() -> TraceReport {
        let exc = TraceEntry::Exception(ExceptionRecord {
            type_name: "ValueError".to_string(),
            message: "bad".to_string(),
            function: "g".to_string(),
            file: "a.py".to_string(),
            line: 7,
            frame: FrameId(2),
            thread: ThreadKey(0),
            chain_position: 0,
            traceback: Vec::new(),
        });
        let g = call("g", "a.py", 1, vec![line("a.py", 6), exc]);
        let mut other = call("worker", "b.py", 0, vec![]);
        other.thread = ThreadKey(5);

        let mut doc = TraceDocument::new();
        doc.calls.push(call("f", "a.py", 0, vec![line("a.py", 2), TraceEntry::Call(g)]));
        doc.calls.push(other);
        doc.error_count = 2;
        doc.finalize();
        IndexBuilder::annotate(&mut doc);
        let index = IndexBuilder::build(&doc);
        TraceReport::new(doc, index)
    }

    #[test]
    fn test_summary() {
        let summary = report().summary;
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_lines, 2);
        assert_eq!(summary.total_exceptions, 1);
        assert_eq!(summary.max_depth, 1);
        assert_eq!(summary.threads, 2);
        assert_eq!(summary.errors, 2);
        assert!(summary.duration_us.is_some());
    }

    #[test]
    fn test_json_serialization() {
        let json = report().to_json().unwrap();
        assert!(json.contains("\"format\": \"calltrace-json-v1\""));
        assert!(json.contains("\"type_name\": \"ValueError\""));
        assert!(json.contains("\"functions\""));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["trace"]["calls"][0]["subtree_size"], 5);
        assert_eq!(value["index"]["functions"]["g"][0], serde_json::json!([0, 1]));
    }

    #[test]
    fn test_skeleton_json_has_no_lines() {
        let json = report().skeleton_json().unwrap();
        assert!(!json.contains("\"line_events\""));
        assert!(!json.contains("\"kind\": \"line\""));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["children"][0]["function"], "g");
    }

    #[test]
    fn test_empty_summary() {
        let summary = JsonSummary::of(&TraceDocument::new());
        assert_eq!(summary, JsonSummary::default());
    }
}
