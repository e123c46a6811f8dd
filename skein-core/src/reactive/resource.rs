//! Async resources.
//!
//! A Resource ties an async loader to a reactive request. The request
//! function is tracked like any other computation: whenever a signal it
//! reads changes, the request is re-evaluated, and if its value differs
//! from the current one a new load starts. Status, value, and error are
//! plain signals, so views and effects consume load state the same way
//! they consume everything else.
//!
//! # Cancellation
//!
//! Each load start increments a generation counter. A completion carries
//! the generation it was started under, and one that arrives after its
//! generation was superseded is discarded outright: a stale load can never
//! write `value`, `error`, or `status`. Aborting the in-flight Tokio task
//! (which drops the loader future) is layered on top as a best-effort
//! optimization; correctness never depends on the abort landing.
//!
//! # Failures
//!
//! A loader failure is reactive state, not an exception: it lands in the
//! `error` signal with `status` set to [`LoadStatus::Error`], and a later
//! [`Resource::reload`] retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use super::effect::Effect;
use super::runtime::Runtime;
use super::signal::Signal;
use crate::error::ReactiveError;

/// Where a resource is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// No request to load (the request function produced `None`).
    Idle,
    /// The first load for a request is in flight.
    Loading,
    /// A load is in flight but a previous value is still available.
    Reloading,
    /// The most recent load succeeded.
    Resolved,
    /// The most recent load failed; see the `error` signal.
    Error,
}

/// Cloneable, type-erased loader failure.
pub type LoadError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// What a loader produces.
pub type LoadResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// The future a loader returns. Build one with
/// `futures_util::FutureExt::boxed`.
pub type LoadFuture<T> = BoxFuture<'static, LoadResult<T>>;

struct ResourceShared<Req, T>
where
    Req: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    request: Signal<Option<Req>>,
    status: Signal<LoadStatus>,
    value: Signal<Option<T>>,
    error: Signal<Option<LoadError>>,
    /// Bumped at every load start; stale completions compare unequal.
    generation: AtomicU64,
    in_flight: Mutex<Option<tokio::task::JoinHandle<()>>>,
    loader: Box<dyn Fn(Req) -> LoadFuture<T> + Send + Sync>,
    io: tokio::runtime::Handle,
}

impl<Req, T> ResourceShared<Req, T>
where
    Req: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn start_load(this: &Arc<Self>, request: Option<Req>) -> Result<(), ReactiveError> {
        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(task) = this.in_flight.lock().take() {
            task.abort();
        }

        let Some(request) = request else {
            this.status.set(LoadStatus::Idle)?;
            return Ok(());
        };

        let next_status = if this.value.get_untracked().is_some() {
            LoadStatus::Reloading
        } else {
            LoadStatus::Loading
        };
        this.status.set(next_status)?;
        tracing::debug!(generation, "resource load started");

        let future = (this.loader)(request);
        let shared = Arc::clone(this);
        let task = this.io.spawn(async move {
            let outcome = future.await;
            if let Err(err) = shared.apply_completion(generation, outcome) {
                tracing::error!(error = %err, "resource completion could not be applied");
            }
        });
        *this.in_flight.lock() = Some(task);
        Ok(())
    }

    fn apply_completion(&self, generation: u64, outcome: LoadResult<T>) -> Result<(), ReactiveError> {
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "discarding superseded load completion");
            return Ok(());
        }
        match outcome {
            Ok(value) => {
                self.value.set(Some(value))?;
                self.error.set(None)?;
                self.status.set(LoadStatus::Resolved)?;
            }
            Err(err) => {
                self.error.set(Some(Arc::from(err)))?;
                self.status.set(LoadStatus::Error)?;
            }
        }
        Ok(())
    }
}

impl<Req, T> Drop for ResourceShared<Req, T>
where
    Req: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.lock().take() {
            task.abort();
        }
    }
}

/// An async value keyed by a reactive request.
pub struct Resource<Req, T>
where
    Req: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    shared: Arc<ResourceShared<Req, T>>,
    /// The tracked request evaluation. Dropping it stops the resource from
    /// reacting to further request changes.
    _driver: Effect,
}

impl<Req, T> Resource<Req, T>
where
    Req: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a resource.
    ///
    /// `request` is evaluated immediately, under tracking, and re-evaluated
    /// whenever its sources change. A changed request value (by
    /// `PartialEq`) supersedes any in-flight load and starts a new one;
    /// `None` parks the resource at [`LoadStatus::Idle`] without loading.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime context: loads are spawned
    /// on the runtime that created the resource.
    pub fn new(
        rt: &Runtime,
        request: impl Fn() -> Result<Option<Req>, ReactiveError> + Send + Sync + 'static,
        loader: impl Fn(Req) -> LoadFuture<T> + Send + Sync + 'static,
    ) -> Self {
        let shared = Arc::new(ResourceShared {
            request: Signal::new(rt, None),
            status: Signal::new(rt, LoadStatus::Idle),
            value: Signal::new(rt, None),
            error: Signal::with_equality(rt, None, |a: &Option<LoadError>, b: &Option<LoadError>| {
                match (a, b) {
                    (None, None) => true,
                    (Some(x), Some(y)) => Arc::ptr_eq(x, y),
                    _ => false,
                }
            }),
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            loader: Box::new(loader),
            io: tokio::runtime::Handle::current(),
        });

        let driver = Effect::with_writes(rt, {
            let shared = Arc::clone(&shared);
            move || {
                let next = request()?;
                if next != shared.request.get_untracked() {
                    shared.request.set(next.clone())?;
                    ResourceShared::start_load(&shared, next)?;
                }
                Ok(None)
            }
        });

        Self {
            shared,
            _driver: driver,
        }
    }

    /// Load lifecycle state, as a signal.
    pub fn status(&self) -> Signal<LoadStatus> {
        self.shared.status.clone()
    }

    /// The most recently loaded value, as a signal. Survives reloads and
    /// later failures until a newer load succeeds.
    pub fn value(&self) -> Signal<Option<T>> {
        self.shared.value.clone()
    }

    /// The most recent loader failure, as a signal. Cleared by the next
    /// successful load.
    pub fn error(&self) -> Signal<Option<LoadError>> {
        self.shared.error.clone()
    }

    /// Start a fresh load for the current request even though it has not
    /// changed. A no-op when the current request is `None`.
    pub fn reload(&self) -> Result<(), ReactiveError> {
        let request = self.shared.request.get_untracked();
        if request.is_none() {
            return Ok(());
        }
        ResourceShared::start_load(&self.shared, request)
    }
}

impl<Req, T> Drop for Resource<Req, T>
where
    Req: Clone + PartialEq + Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Supersede whatever is in flight so a completion racing this drop
        // is discarded, then abort it.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.shared.in_flight.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    async fn settle() {
        // Give spawned load tasks a chance to run; paused test time
        // auto-advances past the sleep.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn none_request_stays_idle() {
        let rt = Runtime::new();
        let loads = Arc::new(AtomicI32::new(0));
        let loads_clone = loads.clone();

        let resource: Resource<i32, String> = Resource::new(
            &rt,
            || Ok(None),
            move |_req| {
                loads_clone.fetch_add(1, Ordering::SeqCst);
                async move { Ok(String::new()) }.boxed()
            },
        );

        settle().await;
        assert_eq!(resource.status().get_untracked(), LoadStatus::Idle);
        assert_eq!(resource.value().get_untracked(), None);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_load_resolves() {
        let rt = Runtime::new();
        let resource = Resource::new(
            &rt,
            || Ok(Some(7)),
            |req: i32| async move { Ok(req * 2) }.boxed(),
        );

        assert_eq!(resource.status().get_untracked(), LoadStatus::Loading);

        settle().await;
        assert_eq!(resource.status().get_untracked(), LoadStatus::Resolved);
        assert_eq!(resource.value().get_untracked(), Some(14));
        assert!(resource.error().get_untracked().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_surfaces_through_the_error_signal() {
        let rt = Runtime::new();
        let resource: Resource<i32, i32> = Resource::new(
            &rt,
            || Ok(Some(1)),
            |_req| async move { Err("backend unavailable".into()) }.boxed(),
        );

        settle().await;
        assert_eq!(resource.status().get_untracked(), LoadStatus::Error);
        assert_eq!(resource.value().get_untracked(), None);
        let err = resource.error().get_untracked().unwrap();
        assert_eq!(err.to_string(), "backend unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn request_change_supersedes_in_flight_load() {
        let rt = Runtime::new();
        let request = Signal::new(&rt, 1_u64);

        let resource = Resource::new(
            &rt,
            {
                let request = request.clone();
                move || Ok(Some(request.get()))
            },
            |req: u64| {
                async move {
                    // The first request is slow, the second fast; the slow
                    // completion must not clobber the fast one.
                    let delay = if req == 1 { 50 } else { 10 };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(format!("result-{req}"))
                }
                .boxed()
            },
        );

        request.set(2).unwrap();
        rt.flush_sync().unwrap();

        settle().await;
        assert_eq!(resource.value().get_untracked(), Some("result-2".to_string()));
        assert_eq!(resource.status().get_untracked(), LoadStatus::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_request_does_not_reload() {
        let rt = Runtime::new();
        let request = Signal::new(&rt, 5_i32);
        let unrelated = Signal::new(&rt, 0_i32);
        let loads = Arc::new(AtomicI32::new(0));

        let _resource = Resource::new(
            &rt,
            {
                let request = request.clone();
                let unrelated = unrelated.clone();
                move || {
                    let _ = unrelated.get();
                    Ok(Some(request.get()))
                }
            },
            {
                let loads = loads.clone();
                move |req: i32| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(req) }.boxed()
                }
            },
        );

        settle().await;
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // The request function reruns but produces the same request value.
        unrelated.set(1).unwrap();
        rt.flush_sync().unwrap();
        settle().await;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_bypasses_request_equality() {
        let rt = Runtime::new();
        let loads = Arc::new(AtomicI32::new(0));

        let resource = Resource::new(
            &rt,
            || Ok(Some(3)),
            {
                let loads = loads.clone();
                move |req: i32| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(req) }.boxed()
                }
            },
        );

        settle().await;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(resource.status().get_untracked(), LoadStatus::Resolved);

        resource.reload().unwrap();
        // A value already exists, so this pass reports as a reload.
        assert_eq!(resource.status().get_untracked(), LoadStatus::Reloading);

        settle().await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(resource.status().get_untracked(), LoadStatus::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn request_becoming_none_parks_the_resource() {
        let rt = Runtime::new();
        let request = Signal::new(&rt, Some(1_i32));

        let resource = Resource::new(
            &rt,
            {
                let request = request.clone();
                move || Ok(request.get())
            },
            |req: i32| async move { Ok(req) }.boxed(),
        );

        settle().await;
        assert_eq!(resource.status().get_untracked(), LoadStatus::Resolved);

        request.set(None).unwrap();
        rt.flush_sync().unwrap();
        settle().await;

        assert_eq!(resource.status().get_untracked(), LoadStatus::Idle);
        // The last value is kept for consumers that want to show stale data.
        assert_eq!(resource.value().get_untracked(), Some(1));
    }
}
