//! Dependency graph bookkeeping.
//!
//! The graph is a DAG where sources (signals, computed values) point at the
//! consumers that read them, and consumers keep weak back-references to the
//! sources they read on their most recent run. Both directions are rebuilt
//! continuously:
//!
//! - A consumer's source list is rebuilt from scratch on every evaluation,
//!   so conditional reads drop stale edges instead of accumulating them.
//! - A source's consumer set holds registry keys, not owning handles. When
//!   a consumer is disposed its registry slot is freed, and the stale keys
//!   left behind in consumer sets are pruned the next time the source
//!   notifies.
//!
//! This key-based indirection is what stands in for the weak-reference sets
//! a garbage-collected implementation would use.

mod edge;
mod registry;

pub(crate) use edge::{any_source_changed, prune_stale, record_edge};
pub(crate) use edge::{SourceChange, SourceList, SourceNode};
pub(crate) use registry::{ConsumerKey, ConsumerNode, ConsumerRegistry};
