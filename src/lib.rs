//! Calltrace - execution-trace capture engine
//!
//! This library filters a host runtime's frame events (call, line, return,
//! exception) down to the code of interest and assembles them into a
//! queryable call-tree document, with a derived search index for
//! interactive exploration.

pub mod call_tree;
pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod frame;
pub mod index;
pub mod json_output;
pub mod matcher;
pub mod render;
pub mod replay;
pub mod session;

pub use config::TraceConfig;
pub use document::TraceDocument;
pub use filter::EventFilter;
pub use frame::{EventKind, EventPayload, ExceptionInfo, FrameRecord, FrameView};
pub use index::{IndexBuilder, SearchIndex};
pub use session::{dispatch, start, stop, SessionHandle};
