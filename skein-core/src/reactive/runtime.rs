//! Reactive runtime.
//!
//! A [`Runtime`] is one independent reactive graph: its consumer registry,
//! its evaluation-tracking stack, its flush scheduler, and its error
//! handler. Signals and consumers created against one runtime never
//! interact with another, which keeps graphs testable in isolation and
//! lets an application run several side by side.
//!
//! # How updates move
//!
//! 1. A signal write (or a computed value that re-evaluated to something
//!    new) dispatches a change notification to its consumers.
//! 2. Computed consumers only flip their dirty state and pass a weaker
//!    "maybe changed" notification along; nothing re-evaluates yet.
//! 3. Effects and views mark themselves pending with the scheduler. The
//!    first notification of the turn fires the flush notifier once.
//! 4. The flush (deferred via [`Runtime::spawn_flush_driver`], or explicit
//!    via [`Runtime::flush_sync`]) reruns what is pending; computed values
//!    re-evaluate lazily when something finally reads them.
//!
//! # Threading
//!
//! The engine's interior state is lock-protected, but the execution model
//! is single-threaded and cooperative: all graph work is expected to happen
//! on one reactive thread (in practice, a current-thread Tokio runtime).
//! Background work hands its results back by writing signals from its
//! completion task, as [`Resource`](super::Resource) does.

use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use super::context::{FrameKind, Tracker};
use super::scheduler::Scheduler;
use crate::error::ReactiveError;
use crate::graph::{ConsumerKey, ConsumerRegistry, SourceChange};

pub(crate) struct RuntimeInner {
    pub(crate) registry: ConsumerRegistry,
    pub(crate) tracker: Tracker,
    pub(crate) scheduler: Scheduler,
    error_handler: RwLock<Arc<dyn Fn(&ReactiveError) + Send + Sync>>,
}

impl RuntimeInner {
    /// Deliver `change` to every live consumer in `consumers`, pruning keys
    /// whose consumers are gone.
    ///
    /// The key list is copied out first so no lock is held while consumer
    /// code runs.
    pub(crate) fn dispatch(&self, consumers: &Mutex<IndexSet<ConsumerKey>>, change: SourceChange) {
        let keys: SmallVec<[ConsumerKey; 8]> = consumers.lock().iter().copied().collect();
        let mut dead: SmallVec<[ConsumerKey; 4]> = SmallVec::new();
        for key in keys {
            match self.registry.resolve(key) {
                Some(node) => node.source_changed(change),
                None => dead.push(key),
            }
        }
        if !dead.is_empty() {
            let mut set = consumers.lock();
            for key in dead {
                set.swap_remove(&key);
            }
        }
    }

    /// Hand an effect or view failure to the configured handler.
    pub(crate) fn report_error(&self, err: &ReactiveError) {
        let handler = self.error_handler.read().clone();
        handler(err);
    }
}

/// Handle to an independent reactive graph.
///
/// Cheap to clone; all clones address the same graph.
///
/// # Example
///
/// ```rust,ignore
/// use skein_core::reactive::{Computed, Effect, Runtime, Signal};
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
/// let doubled = Computed::new(&rt, {
///     let count = count.clone();
///     move || Ok(count.get() * 2)
/// });
///
/// let _logger = Effect::new(&rt, {
///     let doubled = doubled.clone();
///     move || {
///         println!("doubled = {}", doubled.get()?);
///         Ok(None)
///     }
/// });
///
/// count.set(5)?;
/// rt.flush_sync()?; // the effect reruns here, printing "doubled = 10"
/// ```
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                registry: ConsumerRegistry::new(),
                tracker: Tracker::new(),
                scheduler: Scheduler::new(),
                error_handler: RwLock::new(Arc::new(|err| {
                    tracing::error!(error = %err, "consumer failed during flush");
                })),
            }),
        }
    }

    /// Run the pending flush now instead of waiting for the deferred one.
    ///
    /// Used by synchronous test harnesses and measurement code that needs
    /// consumers up to date before the turn ends. If a flush is already in
    /// progress this is a no-op.
    pub fn flush_sync(&self) -> Result<(), ReactiveError> {
        self.inner.scheduler.flush(&self.inner)
    }

    /// Is a deferred flush currently scheduled?
    pub fn has_pending_flush(&self) -> bool {
        self.inner.scheduler.is_scheduled()
    }

    /// Run `f` with dependency tracking suspended.
    ///
    /// Reads inside `f` register no edges. Write restrictions still apply:
    /// a computed evaluation cannot smuggle a write through `untracked`.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner
            .tracker
            .tracked(None, FrameKind::Untracked, f)
            .0
    }

    /// Install the callback fired when a turn first schedules a flush.
    ///
    /// The callback must arrange for [`flush_sync`](Self::flush_sync) to run
    /// soon, on the reactive thread. [`spawn_flush_driver`](Self::spawn_flush_driver)
    /// installs a Tokio-backed one; replacing it detaches the old driver.
    pub fn set_flush_notifier(&self, notifier: impl Fn() + Send + Sync + 'static) {
        self.inner.scheduler.set_notifier(Some(Arc::new(notifier)));
    }

    /// Cap on flush iterations before a write feedback loop is abandoned
    /// with [`ReactiveError::FlushIterationLimit`]. Defaults to 100.
    pub fn set_flush_iteration_limit(&self, limit: usize) {
        self.inner.scheduler.set_iteration_limit(limit);
    }

    /// Replace the handler that receives effect and view failures during a
    /// flush. The default logs through `tracing`.
    pub fn set_error_handler(&self, handler: impl Fn(&ReactiveError) + Send + Sync + 'static) {
        *self.inner.error_handler.write() = Arc::new(handler);
    }

    /// Spawn the Tokio task that runs deferred flushes.
    ///
    /// Installs a flush notifier wired to a [`tokio::sync::Notify`] and
    /// spawns a task that flushes once per notification, so every batch of
    /// writes in one synchronous turn is processed in a single flush at the
    /// next yield point. The task stops doing work once the runtime is
    /// dropped; abort the returned handle to shut it down promptly.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime context.
    pub fn spawn_flush_driver(&self) -> tokio::task::JoinHandle<()> {
        let notify = Arc::new(tokio::sync::Notify::new());
        {
            let notify = notify.clone();
            self.set_flush_notifier(move || notify.notify_one());
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                notify.notified().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(err) = inner.scheduler.flush(&inner) {
                    tracing::error!(error = %err, "deferred flush failed");
                }
            }
        })
    }
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pending_flush", &self.has_pending_flush())
            .finish()
    }
}
