//! Reactive primitives.
//!
//! This module implements the user-facing reactive system: signals,
//! computed values, effects, views, and async resources, coordinated by a
//! per-instance [`Runtime`].
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. Reading one inside a
//! tracked evaluation registers the reader as a dependent; writing one
//! invalidates dependents, but only when the new value is really different.
//!
//! ## Computed values
//!
//! A [`Computed`] derives a value from other signals and computed values,
//! caches it, and re-evaluates lazily: invalidation is pushed through the
//! graph as cheap state flips, and the actual work happens when something
//! reads the node again.
//!
//! ## Effects and views
//!
//! An [`Effect`] synchronizes reactive state with the outside world; a
//! view (registered through [`ViewHandle`]) is the render-unit flavor of
//! the same idea, owned by an external renderer. Neither ever runs inside
//! a write: they become pending and run during the next flush, views
//! first, then effects in creation order.
//!
//! ## Resources
//!
//! A [`Resource`] runs an async loader whenever its reactive request
//! changes, with stale-load cancellation by generation, and exposes the
//! load state as signals.
//!
//! # Batching
//!
//! However many writes happen in one synchronous turn, the turn gets
//! exactly one flush. Consumers reading several related values therefore
//! see either all-old or all-new state, never a mix.

mod computed;
mod context;
mod effect;
mod resource;
mod runtime;
mod scheduler;
mod signal;
mod view;

pub use computed::{Computed, NodeState};
pub use effect::{Cleanup, Effect, EffectResult};
pub use resource::{LoadError, LoadFuture, LoadResult, LoadStatus, Resource};
pub use runtime::Runtime;
pub use signal::Signal;
pub use view::ViewHandle;
