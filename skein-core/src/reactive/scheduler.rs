//! Flush scheduling.
//!
//! Writes never rerun consumers directly. They mark consumers pending here,
//! and the first notification of a turn fires the flush notifier exactly
//! once; everything else in the same turn coalesces into that one pending
//! flush. The flush itself drains views first, then effects in creation
//! order, and keeps draining while writing effects add new work, up to a
//! configurable iteration cap.
//!
//! # Pending levels
//!
//! A consumer can be pending at two levels. `Run` means a source definitely
//! changed and the consumer must rerun. `Verify` means a computed source
//! was invalidated but has not re-evaluated; at flush time the consumer
//! settles its sources and compares version stamps, and if nothing really
//! changed the rerun is skipped. This is what keeps an equal re-evaluation
//! from rippling outward.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};

use super::runtime::RuntimeInner;
use crate::error::ReactiveError;
use crate::graph::ConsumerKey;

/// Default bound on flush iterations before giving up on settling.
pub(crate) const DEFAULT_ITERATION_LIMIT: usize = 100;

/// How urgently a consumer needs attention during the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    Idle,
    /// Sources may have changed; check version stamps before rerunning.
    Verify,
    /// A source definitely changed; rerun unconditionally.
    Run,
}

impl Pending {
    /// Combine notification levels. `Run` is never downgraded.
    pub(crate) fn raise(self, other: Pending) -> Pending {
        match (self, other) {
            (Pending::Run, _) | (_, Pending::Run) => Pending::Run,
            (Pending::Verify, _) | (_, Pending::Verify) => Pending::Verify,
            _ => Pending::Idle,
        }
    }
}

struct Queues {
    /// A flush has been requested but has not started.
    scheduled: bool,
    /// A flush is running right now; notifications add work to the current
    /// flush instead of requesting another.
    flushing: bool,
    dirty_views: IndexSet<ConsumerKey>,
    pending_effects: IndexSet<ConsumerKey>,
}

/// Coalescing flush state, one per runtime.
pub(crate) struct Scheduler {
    queues: Mutex<Queues>,
    notifier: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
    iteration_limit: AtomicUsize,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                scheduled: false,
                flushing: false,
                dirty_views: IndexSet::new(),
                pending_effects: IndexSet::new(),
            }),
            notifier: RwLock::new(None),
            iteration_limit: AtomicUsize::new(DEFAULT_ITERATION_LIMIT),
        }
    }

    pub(crate) fn set_notifier(&self, notifier: Option<Arc<dyn Fn() + Send + Sync>>) {
        *self.notifier.write() = notifier;
    }

    pub(crate) fn set_iteration_limit(&self, limit: usize) {
        self.iteration_limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub(crate) fn enqueue_view(&self, key: ConsumerKey) {
        let fire = {
            let mut q = self.queues.lock();
            q.dirty_views.insert(key);
            Self::should_fire(&mut q)
        };
        if fire {
            self.fire_notifier();
        }
    }

    pub(crate) fn enqueue_effect(&self, key: ConsumerKey) {
        let fire = {
            let mut q = self.queues.lock();
            q.pending_effects.insert(key);
            Self::should_fire(&mut q)
        };
        if fire {
            self.fire_notifier();
        }
    }

    fn should_fire(q: &mut Queues) -> bool {
        if q.scheduled || q.flushing {
            return false;
        }
        q.scheduled = true;
        true
    }

    fn fire_notifier(&self) {
        let notifier = self.notifier.read().clone();
        if let Some(notifier) = notifier {
            notifier();
        }
    }

    /// Is a flush requested but not yet run? Lets tests observe coalescing.
    pub(crate) fn is_scheduled(&self) -> bool {
        self.queues.lock().scheduled
    }

    /// Drain the queues: views, then effects, looping while new work
    /// appears.
    ///
    /// Re-entrant calls (an effect calling back into a flush) are no-ops.
    pub(crate) fn flush(&self, rt: &RuntimeInner) -> Result<(), ReactiveError> {
        {
            let mut q = self.queues.lock();
            if q.flushing {
                return Ok(());
            }
            q.flushing = true;
            q.scheduled = false;
        }

        let limit = self.iteration_limit.load(Ordering::Relaxed);
        let mut iterations = 0usize;
        let result = loop {
            let views: Vec<ConsumerKey> = {
                let mut q = self.queues.lock();
                q.dirty_views.drain(..).collect()
            };
            for key in views {
                if let Some(node) = rt.registry.resolve(key) {
                    node.run_pending();
                }
            }

            let mut effects: Vec<ConsumerKey> = {
                let mut q = self.queues.lock();
                q.pending_effects.drain(..).collect()
            };
            effects.sort_by_key(|key| rt.registry.seq(*key).unwrap_or(u64::MAX));
            for key in effects {
                if let Some(node) = rt.registry.resolve(key) {
                    node.run_pending();
                }
            }

            let settled = {
                let q = self.queues.lock();
                q.dirty_views.is_empty() && q.pending_effects.is_empty()
            };
            if settled {
                break Ok(());
            }

            iterations += 1;
            if iterations >= limit {
                let mut q = self.queues.lock();
                let dropped = q.dirty_views.len() + q.pending_effects.len();
                q.dirty_views.clear();
                q.pending_effects.clear();
                tracing::debug!(limit, dropped, "flush abandoned: queues kept refilling");
                break Err(ReactiveError::FlushIterationLimit { limit });
            }
        };

        self.queues.lock().flushing = false;
        result
    }
}
