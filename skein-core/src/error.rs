//! Error types for the reactive engine.
//!
//! Structural errors indicate a programming defect in how the graph is being
//! used and are returned synchronously from the operation that triggered
//! them. They are never raised for ordinary runtime conditions: a failed
//! resource load, for example, is reactive state (see
//! [`Resource`](crate::reactive::Resource)), not an error of this taxonomy.

use thiserror::Error;

/// Errors surfaced by signal writes, computed reads, and flushes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A signal was written while a computed value was being evaluated.
    ///
    /// Computed evaluations must be pure; a write from inside one would make
    /// the result depend on evaluation order. The rejected write leaves the
    /// signal untouched.
    #[error("signal written during a computed evaluation")]
    WriteDuringComputation,

    /// A signal was written from an effect that was not created with write
    /// access.
    ///
    /// Effects opt into writing with [`Effect::with_writes`](crate::reactive::Effect::with_writes).
    #[error("signal written from an effect without write access")]
    WriteDuringEffect,

    /// A computed value's evaluation read itself, directly or through other
    /// computed values.
    #[error("computed evaluation depends on itself")]
    CyclicComputation,

    /// A flush kept finding new work for more than the configured number of
    /// iterations.
    ///
    /// This happens when writing effects feed each other in a loop. The
    /// flush abandons its queues so the runtime remains usable.
    #[error("flush did not settle within {limit} iterations")]
    FlushIterationLimit {
        /// The iteration cap that was exceeded.
        limit: usize,
    },
}
