//! Replay host for recorded event streams
//!
//! A recording is JSON Lines: one [`RecordedEvent`] per line, in delivery
//! order. Blank lines and lines starting with `#` are skipped.
//!
//! ```text
//! {"event":"call","frame":{"id":1,"function":"f","file":"/app/a.py","line":1}}
//! {"event":"line","frame":{"id":1,"function":"f","file":"/app/a.py","line":2,"locals":{"x":"1"}}}
//! {"event":"return","frame":{"id":1,"function":"f","file":"/app/a.py","line":3},"payload":{"type":"return","value":"None"}}
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::Arc;

use crate::config::TraceConfig;
use crate::filter::EventFilter;
use crate::frame::{EventKind, EventPayload, FrameRecord};
use crate::json_output::TraceReport;
use crate::session;

/// One recorded `(kind, frame, payload)` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event: EventKind,
    pub frame: FrameRecord,
    #[serde(default)]
    pub payload: EventPayload,
}

impl RecordedEvent {
    pub fn new(event: EventKind, frame: FrameRecord) -> Self {
        Self {
            event,
            frame,
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Counters for one replay run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    /// Events read from the recording
    pub events: u64,
    /// CALL events whose frame became active
    pub accepted_calls: u64,
    /// CALL events whose frame was filtered out
    pub rejected_calls: u64,
}

/// Feed every event of `reader` through `filter`
pub fn replay<R: BufRead>(reader: R, filter: &EventFilter) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read event line {}", n + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let event: RecordedEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("Invalid event on line {}", n + 1))?;
        stats.events += 1;

        let active = filter.dispatch(event.event, &event.frame, event.payload);
        if event.event == EventKind::Call {
            if active {
                stats.accepted_calls += 1;
            } else {
                stats.rejected_calls += 1;
            }
        }
    }
    Ok(stats)
}

/// Replay a recording through a process-wide session and build the report
pub fn replay_session<R: BufRead>(config: TraceConfig, reader: R) -> Result<(TraceReport, ReplayStats)> {
    let handle = session::start(config);
    let outcome = replay(reader, handle.filter());
    let document = session::stop(&handle).context("Trace session was stopped by another caller")?;
    let stats = outcome?;

    let index = handle
        .index()
        .context("Trace session has no search index")?;
    tracing::debug!(
        "Replayed {} events ({} calls accepted, {} rejected)",
        stats.events,
        stats.accepted_calls,
        stats.rejected_calls
    );

    let document = Arc::unwrap_or_clone(document);
    Ok((TraceReport::new(document, (*index).clone()), stats))
}
