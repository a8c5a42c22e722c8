//! Per-kind dispatch of records drained from a buffer.
use std::{collections::HashMap, fmt, sync::Arc};

use tracing::trace;

use super::{Kind, RecordRef, Records};
use crate::error::TraceError;

/// Type of callback function handling records of one kind.
pub type HandlerFn<S> = dyn Fn(&RecordRef<'_>, &mut S) + Send + Sync;

/// Maps record kinds to handlers. Records of kinds without a handler, including kind
/// tags this crate does not know, go to the unknown handler.
pub struct DispatchTable<S> {
    handlers: HashMap<Kind, Arc<HandlerFn<S>>>,
    unknown: Arc<HandlerFn<S>>,
}

/// Outcome of draining one record range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records passed to a kind handler.
    pub dispatched: usize,
    /// Records passed to the unknown handler.
    pub unknown: usize,
    /// Set when the range ended on a corrupt record.
    pub error: Option<TraceError>,
}

impl<S: 'static> DispatchTable<S> {
    /// An empty table whose unknown handler only logs.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            unknown: Arc::new(|record: &RecordRef<'_>, _: &mut S| {
                trace!(
                    "unhandled record of kind {} at offset {}",
                    record.kind_tag(),
                    record.offset()
                );
            }),
        }
    }

    /// Handle records of `kind` with `handler`, replacing any previous handler.
    pub fn with_handler<F>(mut self, kind: Kind, handler: F) -> Self
    where
        F: Fn(&RecordRef<'_>, &mut S) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Handle records of every kind in `kinds` with one shared handler.
    pub fn with_kinds<F>(mut self, kinds: impl IntoIterator<Item = Kind>, handler: F) -> Self
    where
        F: Fn(&RecordRef<'_>, &mut S) + Send + Sync + 'static,
    {
        let handler: Arc<HandlerFn<S>> = Arc::new(handler);
        for kind in kinds {
            self.handlers.insert(kind, Arc::clone(&handler));
        }
        self
    }

    pub fn with_unknown_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RecordRef<'_>, &mut S) + Send + Sync + 'static,
    {
        self.unknown = Arc::new(handler);
        self
    }

    /// Dispatch one record. Returns true if a kind handler took it.
    pub fn dispatch(&self, record: &RecordRef<'_>, state: &mut S) -> bool {
        match record.kind().and_then(|kind| self.handlers.get(&kind)) {
            Some(handler) => {
                handler(record, state);
                true
            }
            None => {
                (self.unknown)(record, state);
                false
            }
        }
    }

    /// Dispatch every record of a byte range in stream order.
    pub fn drain(&self, bytes: &[u8], state: &mut S) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let mut records = Records::new(bytes);
        for record in records.by_ref() {
            if self.dispatch(&record, state) {
                summary.dispatched += 1;
            } else {
                summary.unknown += 1;
            }
        }
        summary.error = records.into_error();
        trace!(
            "drained {} records, {} unknown",
            summary.dispatched, summary.unknown
        );
        summary
    }
}

impl<S: 'static> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
