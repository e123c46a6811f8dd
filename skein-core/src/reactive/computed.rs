//! Computed value implementation.
//!
//! A Computed is a derived value that caches its result and re-evaluates
//! only when something it read may have changed, and only when someone
//! actually reads it.
//!
//! # The Clean / Check / Dirty state machine
//!
//! Invalidation is pushed, evaluation is pulled, and the two phases meet in
//! a three-state machine per node:
//!
//! - `Clean`: the cache is trustworthy.
//! - `Dirty`: a source definitely changed; the next read re-evaluates.
//! - `Check`: a computed source was invalidated but has not re-evaluated,
//!   so this node's inputs may or may not have changed. The next read
//!   re-evaluates to find out.
//!
//! When a node leaves `Clean` it tells its own consumers "maybe changed"
//! without evaluating anything. When a read finally forces re-evaluation
//! and the result is equal to the cache, the node goes back to `Clean` and
//! its consumers hear nothing further: the wave stops there. Only an
//! unequal result bumps the version and notifies dependents as a definite
//! change. Boolean dirty flags cannot express the difference between these
//! two outcomes; the intermediate `Check` state is what keeps equal
//! re-evaluations from rippling outward.
//!
//! # Evaluation discipline
//!
//! The evaluation closure must be synchronous and pure: no signal writes
//! (rejected with [`ReactiveError::WriteDuringComputation`]) and no
//! long-running work (that belongs in a [`Resource`](super::Resource) or an
//! effect). Reading itself, directly or transitively, fails with
//! [`ReactiveError::CyclicComputation`] instead of recursing.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};

use super::context::FrameKind;
use super::runtime::{Runtime, RuntimeInner};
use crate::error::ReactiveError;
use crate::graph::{
    prune_stale, ConsumerKey, ConsumerNode, SourceChange, SourceList, SourceNode,
};

/// Re-evaluation state of a computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The cached value is up to date.
    Clean,
    /// A computed source was invalidated; the cache must be verified by
    /// re-evaluation before it can be trusted.
    Check,
    /// A source definitely changed; the cache is stale.
    Dirty,
}

pub(crate) struct ComputedState<T> {
    rt: Arc<RuntimeInner>,
    key: ConsumerKey,
    compute: Box<dyn Fn() -> Result<T, ReactiveError> + Send + Sync>,
    equal: Box<dyn Fn(&T, &T) -> bool + Send + Sync>,
    value: RwLock<Option<T>>,
    version: AtomicU64,
    state: Mutex<NodeState>,
    sources: Mutex<SourceList>,
    consumers: Mutex<IndexSet<ConsumerKey>>,
}

impl<T: Clone + Send + Sync + 'static> ComputedState<T> {
    /// Return the cached value, re-evaluating first if the node is not
    /// clean.
    fn ensure_current(&self) -> Result<T, ReactiveError> {
        if *self.state.lock() == NodeState::Clean {
            if let Some(value) = self.value.read().clone() {
                return Ok(value);
            }
        }
        self.recompute()
    }

    fn recompute(&self) -> Result<T, ReactiveError> {
        if self.rt.tracker.on_stack(self.key) {
            return Err(ReactiveError::CyclicComputation);
        }

        let previous_sources = std::mem::take(&mut *self.sources.lock());
        let (outcome, new_sources) =
            self.rt
                .tracker
                .tracked(Some(self.key), FrameKind::Computed, || (self.compute)());

        match outcome {
            Ok(new_value) => {
                prune_stale(&previous_sources, &new_sources, self.key);
                *self.sources.lock() = new_sources;

                let changed = {
                    let current = self.value.read();
                    match current.as_ref() {
                        Some(old) => !(self.equal)(old, &new_value),
                        None => true,
                    }
                };
                *self.value.write() = Some(new_value.clone());
                *self.state.lock() = NodeState::Clean;

                if changed {
                    self.version.fetch_add(1, Ordering::AcqRel);
                    self.rt.dispatch(&self.consumers, SourceChange::Definite);
                }
                Ok(new_value)
            }
            Err(err) => {
                // Roll back to the pre-evaluation edges so a failed run
                // leaves the graph as it found it; the next read retries.
                prune_stale(&new_sources, &previous_sources, self.key);
                *self.sources.lock() = previous_sources;
                *self.state.lock() = NodeState::Dirty;
                Err(err)
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ConsumerNode for ComputedState<T> {
    fn source_changed(&self, change: SourceChange) {
        let was_clean = {
            let mut state = self.state.lock();
            let was_clean = *state == NodeState::Clean;
            match change {
                SourceChange::Definite => *state = NodeState::Dirty,
                SourceChange::Maybe => {
                    if *state == NodeState::Clean {
                        *state = NodeState::Check;
                    }
                }
            }
            was_clean
        };

        // Dependents were already told "maybe" when this node first left
        // Clean; repeating it would do no new work anyway.
        if was_clean {
            self.rt.dispatch(&self.consumers, SourceChange::Maybe);
        }
    }

    fn run_pending(&self) {
        // Computed values are pulled by readers, never scheduled.
    }
}

impl<T: Clone + Send + Sync + 'static> SourceNode for ComputedState<T> {
    fn unsubscribe(&self, consumer: ConsumerKey) {
        self.consumers.lock().swap_remove(&consumer);
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn settle(&self) -> Result<(), ReactiveError> {
        self.ensure_current().map(|_| ())
    }
}

/// A lazily memoized derived value.
///
/// Clones share state: the evaluation runs at most once however many
/// handles read it.
pub struct Computed<T: Clone + Send + Sync + 'static> {
    state: Arc<ComputedState<T>>,
}

impl<T: Clone + Send + Sync + PartialEq + 'static> Computed<T> {
    /// Create a computed value comparing results with `PartialEq`.
    ///
    /// The computation does not run here; it runs on first read.
    pub fn new(
        rt: &Runtime,
        compute: impl Fn() -> Result<T, ReactiveError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_equality(rt, compute, |a, b| a == b)
    }
}

impl<T: Clone + Send + Sync + 'static> Computed<T> {
    /// Create a computed value with a custom result-equality predicate.
    pub fn with_equality(
        rt: &Runtime,
        compute: impl Fn() -> Result<T, ReactiveError> + Send + Sync + 'static,
        equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::clone(&rt.inner);
        let state = Arc::new_cyclic(|weak: &Weak<ComputedState<T>>| {
            let key = inner
                .registry
                .register(weak.clone() as Weak<dyn ConsumerNode>);
            ComputedState {
                rt: Arc::clone(&inner),
                key,
                compute: Box::new(compute),
                equal: Box::new(equal),
                value: RwLock::new(None),
                version: AtomicU64::new(0),
                state: Mutex::new(NodeState::Dirty),
                sources: Mutex::new(SourceList::new()),
                consumers: Mutex::new(IndexSet::new()),
            }
        });
        Self { state }
    }

    /// Read the value, re-evaluating if necessary.
    ///
    /// Registers this node as a dependency of whatever consumer is
    /// evaluating, exactly like a signal read.
    pub fn get(&self) -> Result<T, ReactiveError> {
        let value = self.state.ensure_current()?;
        let source: Arc<dyn SourceNode> = self.state.clone();
        if let Some(consumer) = self
            .state
            .rt
            .tracker
            .record_read(&source, self.state.version.load(Ordering::Acquire))
        {
            self.state.consumers.lock().insert(consumer);
        }
        Ok(value)
    }

    /// Current re-evaluation state.
    pub fn state(&self) -> NodeState {
        *self.state.state.lock()
    }

    /// Has the computation produced a value yet?
    pub fn has_value(&self) -> bool {
        self.state.value.read().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("state", &self.state())
            .field("value", &*self.state.value.read())
            .finish()
    }
}
