//! Effect implementation.
//!
//! An Effect is a consumer run for its side effects: it returns no value
//! and caches nothing. It runs once at creation to seed its dependency set,
//! and after that only during a flush, never synchronously inside a write.
//!
//! # Reruns and cleanup
//!
//! A run may return a cleanup closure. The cleanup is invoked immediately
//! before the next rerun and once more at disposal, which is where event
//! listeners, timers, and similar registrations get torn down.
//!
//! # Writes
//!
//! By default an effect may not write signals; [`Effect::with_writes`]
//! opts in. Writes made during a flush feed the same flush's next
//! iteration, bounded by the runtime's iteration cap.
//!
//! # Failures
//!
//! A run that returns `Err` is reported to the runtime's error handler and
//! the flush moves on to the next consumer; one failing effect cannot stall
//! the rest of the graph.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::context::FrameKind;
use super::runtime::{Runtime, RuntimeInner};
use super::scheduler::Pending;
use crate::error::ReactiveError;
use crate::graph::{
    any_source_changed, prune_stale, ConsumerKey, ConsumerNode, SourceChange, SourceList,
};

/// Teardown closure returned by an effect run.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// What an effect run produces: an optional cleanup, or a reported error.
pub type EffectResult = Result<Option<Cleanup>, ReactiveError>;

pub(crate) struct EffectState {
    rt: Arc<RuntimeInner>,
    key: ConsumerKey,
    run: Box<dyn Fn() -> EffectResult + Send + Sync>,
    allow_writes: bool,
    sources: Mutex<SourceList>,
    cleanup: Mutex<Option<Cleanup>>,
    pending: Mutex<Pending>,
    disposed: AtomicBool,
    run_count: AtomicUsize,
}

impl EffectState {
    /// Run the effect under tracking, rebuilding its dependency set.
    fn execute(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }

        let previous_sources = std::mem::take(&mut *self.sources.lock());
        let (outcome, new_sources) = self.rt.tracker.tracked(
            Some(self.key),
            FrameKind::Effect {
                allow_writes: self.allow_writes,
            },
            || (self.run)(),
        );

        prune_stale(&previous_sources, &new_sources, self.key);
        *self.sources.lock() = new_sources;
        self.run_count.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(cleanup) => *self.cleanup.lock() = cleanup,
            Err(err) => self.rt.report_error(&err),
        }
    }

    /// Drop pending state the run itself produced.
    ///
    /// Settling a source during a run notifies this consumer again, but the
    /// fresh edges already carry the settled versions, so that notification
    /// is stale on arrival. A write the run made to one of its own sources
    /// survives this check: the edge predates the write, the versions
    /// differ, and the effect stays pending for the next iteration.
    fn reconcile_pending(&self) {
        if *self.pending.lock() == Pending::Idle {
            return;
        }
        let edges = self.sources.lock().clone();
        if !any_source_changed(&edges) {
            *self.pending.lock() = Pending::Idle;
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        let sources = std::mem::take(&mut *self.sources.lock());
        for edge in &sources {
            if let Some(source) = edge.source.upgrade() {
                source.unsubscribe(self.key);
            }
        }
        // Freeing the slot invalidates the key, so a notification already
        // queued under it resolves to nothing.
        self.rt.registry.unregister(self.key);
        *self.pending.lock() = Pending::Idle;
    }
}

impl ConsumerNode for EffectState {
    fn source_changed(&self, change: SourceChange) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut pending = self.pending.lock();
            *pending = pending.raise(match change {
                SourceChange::Definite => Pending::Run,
                SourceChange::Maybe => Pending::Verify,
            });
        }
        self.rt.scheduler.enqueue_effect(self.key);
    }

    fn run_pending(&self) {
        let pending = std::mem::replace(&mut *self.pending.lock(), Pending::Idle);
        let ran = match pending {
            Pending::Idle => false,
            Pending::Run => {
                self.execute();
                true
            }
            Pending::Verify => {
                let edges = self.sources.lock().clone();
                if any_source_changed(&edges) {
                    self.execute();
                    true
                } else {
                    false
                }
            }
        };
        if ran {
            self.reconcile_pending();
        }
    }
}

/// A side-effecting consumer.
///
/// Dropping the handle disposes the effect.
pub struct Effect {
    state: Arc<EffectState>,
}

impl Effect {
    /// Create an effect and run it once to establish its dependencies.
    ///
    /// Signal writes from inside the run are rejected; see
    /// [`Effect::with_writes`].
    pub fn new(rt: &Runtime, run: impl Fn() -> EffectResult + Send + Sync + 'static) -> Self {
        Self::create(rt, Box::new(run), false)
    }

    /// Create an effect that is allowed to write signals from its run.
    pub fn with_writes(
        rt: &Runtime,
        run: impl Fn() -> EffectResult + Send + Sync + 'static,
    ) -> Self {
        Self::create(rt, Box::new(run), true)
    }

    fn create(
        rt: &Runtime,
        run: Box<dyn Fn() -> EffectResult + Send + Sync>,
        allow_writes: bool,
    ) -> Self {
        let inner = Arc::clone(&rt.inner);
        let state = Arc::new_cyclic(|weak: &Weak<EffectState>| {
            let key = inner
                .registry
                .register(weak.clone() as Weak<dyn ConsumerNode>);
            EffectState {
                rt: Arc::clone(&inner),
                key,
                run,
                allow_writes,
                sources: Mutex::new(SourceList::new()),
                cleanup: Mutex::new(None),
                pending: Mutex::new(Pending::Idle),
                disposed: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
            }
        });
        state.execute();
        Self { state }
    }

    /// Tear the effect down: run the latest cleanup, sever all edges, and
    /// make sure no future notification can reach it. Idempotent.
    pub fn dispose(&self) {
        self.state.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// How many times the run closure has executed.
    pub fn run_count(&self) -> usize {
        self.state.run_count.load(Ordering::SeqCst)
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.state.dispose();
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Computed, Signal};
    use std::sync::atomic::AtomicI32;

    #[test]
    fn runs_once_on_creation() {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 0);
        let seen = Arc::new(AtomicI32::new(-1));

        let effect = Effect::new(&rt, {
            let sig = sig.clone();
            let seen = seen.clone();
            move || {
                seen.store(sig.get(), Ordering::SeqCst);
                Ok(None)
            }
        });

        assert_eq!(effect.run_count(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reruns_on_flush_not_on_write() {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 0);
        let seen = Arc::new(AtomicI32::new(-1));

        let effect = Effect::new(&rt, {
            let sig = sig.clone();
            let seen = seen.clone();
            move || {
                seen.store(sig.get(), Ordering::SeqCst);
                Ok(None)
            }
        });

        sig.set(42).unwrap();
        // Nothing ran yet: the write only made the effect pending.
        assert_eq!(effect.run_count(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        rt.flush_sync().unwrap();
        assert_eq!(effect.run_count(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 0);
        let cleanups = Arc::new(AtomicI32::new(0));

        let effect = Effect::new(&rt, {
            let sig = sig.clone();
            let cleanups = cleanups.clone();
            move || {
                let _ = sig.get();
                let cleanups = cleanups.clone();
                Ok(Some(Box::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }) as Cleanup))
            }
        });

        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        sig.set(1).unwrap();
        rt.flush_sync().unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        effect.dispose();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);

        // Disposal is final: nothing reruns, nothing cleans up twice.
        effect.dispose();
        sig.set(2).unwrap();
        rt.flush_sync().unwrap();
        assert_eq!(effect.run_count(), 2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_upstream_reevaluation_skips_the_rerun() {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 10);

        let predicate = Computed::new(&rt, {
            let sig = sig.clone();
            move || Ok(sig.get() > 5)
        });

        let effect = Effect::new(&rt, {
            let predicate = predicate.clone();
            move || {
                let _ = predicate.get()?;
                Ok(None)
            }
        });
        assert_eq!(effect.run_count(), 1);

        // The predicate stays true, so the effect verifies and skips.
        sig.set(20).unwrap();
        rt.flush_sync().unwrap();
        assert_eq!(effect.run_count(), 1);

        // Now the predicate flips, and the rerun happens.
        sig.set(0).unwrap();
        rt.flush_sync().unwrap();
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn writes_require_opt_in() {
        let rt = Runtime::new();
        let trigger = Signal::new(&rt, 0);
        let target = Signal::new(&rt, 0);
        let errors = Arc::new(AtomicI32::new(0));
        let errors_clone = errors.clone();
        rt.set_error_handler(move |err| {
            assert_eq!(*err, ReactiveError::WriteDuringEffect);
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _effect = Effect::new(&rt, {
            let trigger = trigger.clone();
            let target = target.clone();
            move || {
                let v = trigger.get();
                target.set(v)?;
                Ok(None)
            }
        });

        // The seed run already tried to write.
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(target.get_untracked(), 0);
    }

    #[test]
    fn opted_in_writes_cascade_within_one_flush() {
        let rt = Runtime::new();
        let source = Signal::new(&rt, 1);
        let mirror = Signal::new(&rt, 0);
        let seen = Arc::new(AtomicI32::new(-1));

        let _writer = Effect::with_writes(&rt, {
            let source = source.clone();
            let mirror = mirror.clone();
            move || {
                mirror.set(source.get())?;
                Ok(None)
            }
        });
        let _reader = Effect::new(&rt, {
            let mirror = mirror.clone();
            let seen = seen.clone();
            move || {
                seen.store(mirror.get(), Ordering::SeqCst);
                Ok(None)
            }
        });

        // Creation order ran writer first, then reader saw the mirror.
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        source.set(5).unwrap();
        rt.flush_sync().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failing_effect_does_not_stop_its_siblings() {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 0);
        let errors = Arc::new(AtomicI32::new(0));
        let errors_clone = errors.clone();
        rt.set_error_handler(move |_err| {
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });

        let failing = Effect::new(&rt, {
            let sig = sig.clone();
            move || {
                let _ = sig.get();
                Err(ReactiveError::CyclicComputation)
            }
        });
        let healthy = Effect::new(&rt, {
            let sig = sig.clone();
            move || {
                let _ = sig.get();
                Ok(None)
            }
        });

        assert_eq!(errors.load(Ordering::SeqCst), 1);

        sig.set(1).unwrap();
        rt.flush_sync().unwrap();

        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(failing.run_count(), 2);
        assert_eq!(healthy.run_count(), 2);
    }

    #[test]
    fn effects_run_in_creation_order() {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let _early = {
            // Created first, so it runs first during the flush regardless
            // of how the signal's consumer set happens to be ordered.
            let sig = sig.clone();
            let order = order.clone();
            Effect::new(&rt, move || {
                let _ = sig.get();
                order.lock().push("a");
                Ok(None)
            })
        };
        let _late = {
            let sig = sig.clone();
            let order = order.clone();
            Effect::new(&rt, move || {
                let _ = sig.get();
                order.lock().push("b");
                Ok(None)
            })
        };
        order.lock().clear();

        sig.set(1).unwrap();
        rt.flush_sync().unwrap();
        assert_eq!(order.lock().as_slice(), &["a", "b"]);
    }
}
