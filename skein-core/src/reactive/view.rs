//! View consumers.
//!
//! A view is a render unit owned by an external renderer; the engine knows
//! nothing about what rendering means. It stores only the view's dependency
//! edges, its dirty state, and the render closure, and guarantees that dirty
//! views refresh before any effect runs in the same flush.
//!
//! Like every consumer, a view's dependency set is rebuilt on each render
//! pass from whatever the render closure actually read.

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

pub(crate) struct ViewState {
    rt: Arc<RuntimeInner>,
    key: ConsumerKey,
    render: Box<dyn Fn() -> Result<(), ReactiveError> + Send + Sync>,
    sources: Mutex<SourceList>,
    pending: Mutex<Pending>,
    disposed: AtomicBool,
    render_count: AtomicUsize,
}

impl ViewState {
    fn refresh(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let previous_sources = std::mem::take(&mut *self.sources.lock());
        let (outcome, new_sources) =
            self.rt
                .tracker
                .tracked(Some(self.key), FrameKind::View, || (self.render)());

        prune_stale(&previous_sources, &new_sources, self.key);
        *self.sources.lock() = new_sources;
        self.render_count.fetch_add(1, Ordering::SeqCst);

        if let Err(err) = outcome {
            self.rt.report_error(&err);
        }
    }

    /// Drop pending state the render itself produced by settling its own
    /// sources; the fresh edges already carry the settled versions. See the
    /// matching logic on effects.
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
        let sources = std::mem::take(&mut *self.sources.lock());
        for edge in &sources {
            if let Some(source) = edge.source.upgrade() {
                source.unsubscribe(self.key);
            }
        }
        self.rt.registry.unregister(self.key);
        *self.pending.lock() = Pending::Idle;
    }
}

impl ConsumerNode for ViewState {
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
        self.rt.scheduler.enqueue_view(self.key);
    }

    fn run_pending(&self) {
        let pending = std::mem::replace(&mut *self.pending.lock(), Pending::Idle);
        let ran = match pending {
            Pending::Idle => false,
            Pending::Run => {
                self.refresh();
                true
            }
            Pending::Verify => {
                let edges = self.sources.lock().clone();
                if any_source_changed(&edges) {
                    self.refresh();
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

/// Handle to a registered render unit.
///
/// Dropping the handle disposes the view.
pub struct ViewHandle {
    state: Arc<ViewState>,
}

impl ViewHandle {
    /// Register a render unit and render it once to seed its dependencies.
    ///
    /// Render failures are reported to the runtime's error handler, not
    /// returned.
    pub fn register(
        rt: &Runtime,
        render: impl Fn() -> Result<(), ReactiveError> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::clone(&rt.inner);
        let state = Arc::new_cyclic(|weak: &Weak<ViewState>| {
            let key = inner
                .registry
                .register(weak.clone() as Weak<dyn ConsumerNode>);
            ViewState {
                rt: Arc::clone(&inner),
                key,
                render: Box::new(render),
                sources: Mutex::new(SourceList::new()),
                pending: Mutex::new(Pending::Idle),
                disposed: AtomicBool::new(false),
                render_count: AtomicUsize::new(0),
            }
        });
        state.refresh();
        Self { state }
    }

    /// Queue a refresh with the next flush even if no source changed.
    pub fn mark_dirty(&self) {
        if self.state.disposed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut pending = self.state.pending.lock();
            *pending = pending.raise(Pending::Run);
        }
        self.state.rt.scheduler.enqueue_view(self.state.key);
    }

    /// Refresh right now, bypassing the deferred flush.
    ///
    /// For callers that need the rendered state observable synchronously,
    /// e.g. measurement immediately after a write. The view is taken off
    /// the pending queue implicitly: its dirty state is consumed here, so
    /// the next flush skips it.
    pub fn force_refresh(&self) {
        {
            let mut pending = self.state.pending.lock();
            *pending = Pending::Idle;
        }
        self.state.refresh();
        self.state.reconcile_pending();
    }

    /// Unregister the view and sever its edges. Idempotent.
    pub fn dispose(&self) {
        self.state.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// How many times the render closure has executed.
    pub fn render_count(&self) -> usize {
        self.state.render_count.load(Ordering::SeqCst)
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        self.state.dispose();
    }
}

impl std::fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("render_count", &self.render_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
