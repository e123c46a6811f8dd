//! Skein Core
//!
//! A fine-grained reactive dependency graph with a coalescing
//! change-detection scheduler. It provides:
//!
//! - Reactive primitives (signals, computed values, effects, views)
//! - Automatic, dynamic dependency tracking
//! - Two-phase invalidation that avoids both missed updates and redundant
//!   recomputation
//! - Batched, deferred flushing of consumers
//! - Async resources with stale-load cancellation
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: the public primitives and the runtime that coordinates them
//! - `graph`: internal dependency bookkeeping (consumer registry, edges)
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_core::reactive::{Computed, Effect, Runtime, Signal};
//!
//! let rt = Runtime::new();
//!
//! let count = Signal::new(&rt, 0);
//! let doubled = Computed::new(&rt, {
//!     let count = count.clone();
//!     move || Ok(count.get() * 2)
//! });
//!
//! let _effect = Effect::new(&rt, {
//!     let count = count.clone();
//!     let doubled = doubled.clone();
//!     move || {
//!         println!("count: {}, doubled: {}", count.get(), doubled.get()?);
//!         Ok(None)
//!     }
//! });
//!
//! count.set(5)?;
//! rt.flush_sync()?; // prints "count: 5, doubled: 10"
//! ```

mod graph;

pub mod error;
pub mod reactive;

pub use error::ReactiveError;
pub use reactive::{
    Cleanup, Computed, Effect, EffectResult, LoadError, LoadFuture, LoadResult, LoadStatus,
    NodeState, Resource, Runtime, Signal, ViewHandle,
};
