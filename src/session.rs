//! Process-wide session control
//!
//! At most one session is installed at a time. [`start`] installs a fresh
//! [`EventFilter`] (stopping and replacing any running session), [`dispatch`]
//! routes host events to whichever session is installed, and [`stop`]
//! finalizes a session's document and search index.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::TraceConfig;
use crate::document::TraceDocument;
use crate::filter::EventFilter;
use crate::frame::{EventKind, EventPayload, FrameView};
use crate::index::{IndexBuilder, SearchIndex};

static CURRENT: Mutex<Option<Arc<Session>>> = parking_lot::const_mutex(None);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Frozen {
    document: Arc<TraceDocument>,
    index: Arc<SearchIndex>,
}

#[derive(Debug)]
struct Session {
    id: u64,
    filter: EventFilter,
    frozen: Mutex<Option<Frozen>>,
}

impl Session {
    /// Stop the filter and freeze its output. `None` if already frozen.
    fn finish(&self) -> Option<Arc<TraceDocument>> {
        let mut frozen = self.frozen.lock();
        if frozen.is_some() {
            return None;
        }
        let document = Arc::new(self.filter.stop()?);
        let index = Arc::new(IndexBuilder::build(&document));
        *frozen = Some(Frozen {
            document: Arc::clone(&document),
            index,
        });
        Some(document)
    }
}

/// Handle to one trace session; cheap to clone
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.session.id
    }

    /// The session's dispatcher, for hosts that deliver events directly
    pub fn filter(&self) -> &EventFilter {
        &self.session.filter
    }

    pub fn is_running(&self) -> bool {
        self.session.filter.is_running()
    }

    /// Frozen document, once the session has stopped
    pub fn document(&self) -> Option<Arc<TraceDocument>> {
        self.session
            .frozen
            .lock()
            .as_ref()
            .map(|f| Arc::clone(&f.document))
    }

    /// Search index over the frozen document
    pub fn index(&self) -> Option<Arc<SearchIndex>> {
        self.session
            .frozen
            .lock()
            .as_ref()
            .map(|f| Arc::clone(&f.index))
    }
}

/// Start a session and install it process-wide.
///
/// A session that is still installed is stopped first; its handle keeps its
/// frozen document.
pub fn start(config: TraceConfig) -> SessionHandle {
    let session = Arc::new(Session {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        filter: EventFilter::new(config),
        frozen: Mutex::new(None),
    });
    session.filter.start();

    let previous = CURRENT.lock().replace(Arc::clone(&session));
    if let Some(previous) = previous {
        tracing::debug!("Replacing trace session {} with {}", previous.id, session.id);
        previous.finish();
    }

    SessionHandle { session }
}

/// Stop `handle`'s session. Returns the finalized document the first time;
/// later calls are no-ops returning `None`.
pub fn stop(handle: &SessionHandle) -> Option<Arc<TraceDocument>> {
    {
        let mut current = CURRENT.lock();
        if current
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, &handle.session))
        {
            *current = None;
        }
    }
    handle.session.finish()
}

/// Installed session, if any
pub fn current() -> Option<SessionHandle> {
    CURRENT
        .lock()
        .as_ref()
        .map(|session| SessionHandle {
            session: Arc::clone(session),
        })
}

/// Route one host event to the installed session. Returns whether the frame
/// is active afterwards (`false` when no session is installed).
pub fn dispatch(kind: EventKind, frame: &dyn FrameView, payload: EventPayload) -> bool {
    let session = match CURRENT.lock().as_ref() {
        Some(session) => Arc::clone(session),
        None => return false,
    };
    session.filter.dispatch(kind, frame, payload)
}
