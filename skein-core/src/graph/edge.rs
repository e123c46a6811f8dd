//! Source edges.
//!
//! An edge records that a consumer read a source during its most recent
//! evaluation, together with the source's version stamp at that moment.
//! The stamp is what lets a consumer that was only maybe-invalidated decide,
//! at flush time, whether anything it read actually changed.

use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use super::ConsumerKey;
use crate::error::ReactiveError;

/// What a notification says about the source that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceChange {
    /// The source's value really changed (a signal write, or a computed
    /// value that re-evaluated to something unequal).
    Definite,
    /// A computed source left its clean state but has not re-evaluated yet.
    /// Its value may turn out to be unchanged.
    Maybe,
}

/// A readable node in the graph: a signal or a computed value.
pub(crate) trait SourceNode: Send + Sync {
    /// Drop the edge from this source to `consumer`.
    fn unsubscribe(&self, consumer: ConsumerKey);

    /// Monotonic version stamp, bumped only when the value really changes.
    fn version(&self) -> u64;

    /// Bring the source up to date. A no-op for signals; a computed value
    /// re-evaluates if it is not clean.
    fn settle(&self) -> Result<(), ReactiveError>;
}

/// One recorded read.
#[derive(Clone)]
pub(crate) struct SourceEdge {
    pub(crate) source: Weak<dyn SourceNode>,
    /// The source's version when the read happened.
    pub(crate) seen_version: u64,
}

/// Ordered edge list rebuilt on every evaluation. Fan-in is usually small.
pub(crate) type SourceList = SmallVec<[SourceEdge; 4]>;

/// Append a read to `list` unless the same source was already recorded.
pub(crate) fn record_edge(list: &mut SourceList, source: &Arc<dyn SourceNode>, seen_version: u64) {
    let duplicate = list
        .iter()
        .any(|edge| edge.source.upgrade().is_some_and(|live| Arc::ptr_eq(&live, source)));
    if duplicate {
        return;
    }
    list.push(SourceEdge {
        source: Arc::downgrade(source),
        seen_version,
    });
}

/// Unsubscribe `consumer` from every source in `previous` that was not read
/// again in `current`.
pub(crate) fn prune_stale(previous: &SourceList, current: &SourceList, consumer: ConsumerKey) {
    for edge in previous {
        let retained = current
            .iter()
            .any(|cur| Weak::ptr_eq(&cur.source, &edge.source));
        if retained {
            continue;
        }
        if let Some(source) = edge.source.upgrade() {
            source.unsubscribe(consumer);
        }
    }
}

/// Did any recorded source actually change since the edges were built?
///
/// Settles each source first, so computed sources in their maybe-stale state
/// re-evaluate before their versions are compared. A source that fails to
/// settle counts as changed: the consumer reruns and surfaces the failure
/// through its own read.
pub(crate) fn any_source_changed(edges: &SourceList) -> bool {
    for edge in edges {
        let Some(source) = edge.source.upgrade() else {
            // A dropped source can no longer change.
            continue;
        };
        if source.settle().is_err() {
            return true;
        }
        if source.version() != edge.seen_version {
            return true;
        }
    }
    false
}
