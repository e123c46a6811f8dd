//! Signal implementation.
//!
//! A Signal is the writable leaf of the graph: a value, a monotonic version
//! stamp, and an ordered set of consumer keys.
//!
//! # How signals work
//!
//! 1. When a signal is read while a consumer is evaluating, the signal
//!    registers that consumer and the read is recorded as an edge carrying
//!    the signal's current version.
//!
//! 2. A write first runs the signal's equality check. An equal write is a
//!    complete no-op: no version bump, no notification. This is what stops
//!    value-preserving writes from rippling through the graph.
//!
//!    An unequal write stores the value, bumps the version, and notifies
//!    every live consumer of a definite change.
//!
//! 3. Consumers never run inside the write; they only become pending with
//!    the scheduler and run during the next flush.
//!
//! # Equality
//!
//! [`Signal::new`] compares with `PartialEq`. Types without a usable
//! `PartialEq` (or that need coarser comparison) can supply their own
//! predicate through [`Signal::with_equality`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};

use super::runtime::{Runtime, RuntimeInner};
use crate::error::ReactiveError;
use crate::graph::{ConsumerKey, SourceChange, SourceNode};

pub(crate) struct SignalState<T> {
    rt: Arc<RuntimeInner>,
    value: RwLock<T>,
    version: AtomicU64,
    equal: Box<dyn Fn(&T, &T) -> bool + Send + Sync>,
    consumers: Mutex<IndexSet<ConsumerKey>>,
}

impl<T: Clone + Send + Sync + 'static> SourceNode for SignalState<T> {
    fn unsubscribe(&self, consumer: ConsumerKey) {
        self.consumers.lock().swap_remove(&consumer);
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn settle(&self) -> Result<(), ReactiveError> {
        // A signal is always current.
        Ok(())
    }
}

/// A writable reactive value.
///
/// Clones share state: writing through one handle is visible through all.
pub struct Signal<T: Clone + Send + Sync + 'static> {
    state: Arc<SignalState<T>>,
}

impl<T: Clone + Send + Sync + PartialEq + 'static> Signal<T> {
    /// Create a signal comparing writes with `PartialEq`.
    pub fn new(rt: &Runtime, value: T) -> Self {
        Self::with_equality(rt, value, |a, b| a == b)
    }
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    /// Create a signal with a custom equality predicate.
    ///
    /// Writes judged equal to the current value are dropped without
    /// notifying anyone.
    pub fn with_equality(
        rt: &Runtime,
        value: T,
        equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(SignalState {
                rt: Arc::clone(&rt.inner),
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                equal: Box::new(equal),
                consumers: Mutex::new(IndexSet::new()),
            }),
        }
    }

    /// Read the current value.
    ///
    /// If a consumer is evaluating, it becomes a dependent of this signal.
    pub fn get(&self) -> T {
        let source: Arc<dyn SourceNode> = self.state.clone();
        if let Some(consumer) = self
            .state
            .rt
            .tracker
            .record_read(&source, self.state.version())
        {
            self.state.consumers.lock().insert(consumer);
        }
        self.state.value.read().clone()
    }

    /// Read the current value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.state.value.read().clone()
    }

    /// Write a new value and notify dependents if it differs from the
    /// current one.
    ///
    /// Fails with [`ReactiveError::WriteDuringComputation`] inside a
    /// computed evaluation and [`ReactiveError::WriteDuringEffect`] inside
    /// an effect without write access; a rejected write changes nothing.
    pub fn set(&self, value: T) -> Result<(), ReactiveError> {
        self.state.rt.tracker.write_guard()?;

        {
            let current = self.state.value.read();
            if (self.state.equal)(&current, &value) {
                return Ok(());
            }
        }

        *self.state.value.write() = value;
        let version = self.state.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(version, "signal write");

        self.state
            .rt
            .dispatch(&self.state.consumers, SourceChange::Definite);
        Ok(())
    }

    /// Compute the next value from the current one.
    ///
    /// The read of the current value is untracked; only the write has
    /// reactive consequences.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<(), ReactiveError> {
        let next = {
            let current = self.state.value.read();
            f(&current)
        };
        self.set(next)
    }

    /// Number of consumers currently subscribed. Stale keys that have not
    /// been pruned yet are counted.
    pub fn consumer_count(&self) -> usize {
        self.state.consumers.lock().len()
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.version()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("value", &self.get_untracked())
            .field("version", &self.state.version())
            .field("consumer_count", &self.consumer_count())
            .finish()
    }
}
