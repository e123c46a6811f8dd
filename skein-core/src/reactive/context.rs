//! Evaluation tracking.
//!
//! While a consumer evaluates (a computed re-evaluating, an effect or view
//! running), a frame for it sits on the runtime's tracking stack. Reads of
//! signals and computed values consult the innermost frame to register
//! edges, which is how dependencies are discovered without any declaration
//! by the caller.
//!
//! The stack is owned by the [`Runtime`](super::Runtime) rather than being
//! process-global, so independent graphs never observe each other and a
//! runtime can be exercised in isolation in tests. Nesting works the way
//! evaluation nests: a computed read inside an effect run pushes a second
//! frame, and reads inside it attribute to the computed, not the effect.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ReactiveError;
use crate::graph::{record_edge, ConsumerKey, SourceList, SourceNode};

/// What kind of consumer the frame belongs to. Decides write permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Computed,
    Effect { allow_writes: bool },
    View,
    /// Pushed by [`Runtime::untracked`](super::Runtime::untracked): reads
    /// under it register no edges.
    Untracked,
}

pub(crate) struct TrackFrame {
    consumer: Option<ConsumerKey>,
    kind: FrameKind,
    sources: SourceList,
}

/// The per-runtime stack of evaluation frames.
pub(crate) struct Tracker {
    stack: Mutex<Vec<TrackFrame>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` under a new frame and return its result together with the
    /// edges recorded while it ran.
    ///
    /// The frame is popped even if `f` panics, so the stack cannot be left
    /// unbalanced; the recorded edges are simply lost in that case.
    pub(crate) fn tracked<R>(
        &self,
        consumer: Option<ConsumerKey>,
        kind: FrameKind,
        f: impl FnOnce() -> R,
    ) -> (R, SourceList) {
        struct PopGuard<'a> {
            stack: &'a Mutex<Vec<TrackFrame>>,
        }

        impl Drop for PopGuard<'_> {
            fn drop(&mut self) {
                self.stack.lock().pop();
            }
        }

        self.stack.lock().push(TrackFrame {
            consumer,
            kind,
            sources: SourceList::new(),
        });
        let guard = PopGuard { stack: &self.stack };

        let out = f();

        let sources = {
            let mut stack = self.stack.lock();
            stack
                .last_mut()
                .map(|frame| std::mem::take(&mut frame.sources))
                .unwrap_or_default()
        };
        drop(guard);
        (out, sources)
    }

    /// Register a read of `source` with the innermost frame.
    ///
    /// Returns the consumer key the source should subscribe, or `None` when
    /// nothing is tracking (no frame, or an untracked frame).
    pub(crate) fn record_read(
        &self,
        source: &Arc<dyn SourceNode>,
        seen_version: u64,
    ) -> Option<ConsumerKey> {
        let mut stack = self.stack.lock();
        let frame = stack.last_mut()?;
        if frame.kind == FrameKind::Untracked {
            return None;
        }
        record_edge(&mut frame.sources, source, seen_version);
        frame.consumer
    }

    /// Is `key` currently evaluating? Used for cycle detection.
    pub(crate) fn on_stack(&self, key: ConsumerKey) -> bool {
        self.stack
            .lock()
            .iter()
            .any(|frame| frame.consumer == Some(key))
    }

    /// Check whether a write is permitted in the current evaluation context.
    ///
    /// Untracked frames are skipped: wrapping a write in
    /// [`Runtime::untracked`](super::Runtime::untracked) disables dependency
    /// tracking, not write protection.
    pub(crate) fn write_guard(&self) -> Result<(), ReactiveError> {
        let stack = self.stack.lock();
        for frame in stack.iter().rev() {
            match frame.kind {
                FrameKind::Untracked => continue,
                FrameKind::Computed => return Err(ReactiveError::WriteDuringComputation),
                FrameKind::Effect { allow_writes: false } => {
                    return Err(ReactiveError::WriteDuringEffect)
                }
                FrameKind::Effect { allow_writes: true } | FrameKind::View => return Ok(()),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.stack.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ConsumerNode, ConsumerRegistry, SourceChange};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Weak;

    struct Noop;

    impl ConsumerNode for Noop {
        fn source_changed(&self, _change: SourceChange) {}
        fn run_pending(&self) {}
    }

    struct FakeSource {
        version: AtomicU64,
    }

    impl SourceNode for FakeSource {
        fn unsubscribe(&self, _consumer: ConsumerKey) {}

        fn version(&self) -> u64 {
            self.version.load(Ordering::SeqCst)
        }

        fn settle(&self) -> Result<(), ReactiveError> {
            Ok(())
        }
    }

    fn key() -> ConsumerKey {
        thread_local! {
            static REGISTRY: ConsumerRegistry = ConsumerRegistry::new();
        }
        REGISTRY.with(|registry| {
            let node = Arc::new(Noop);
            registry.register(Arc::downgrade(&node) as Weak<dyn ConsumerNode>)
        })
    }

    fn source() -> Arc<dyn SourceNode> {
        Arc::new(FakeSource {
            version: AtomicU64::new(0),
        })
    }

    #[test]
    fn reads_attribute_to_the_innermost_frame() {
        let tracker = Tracker::new();
        let outer = key();
        let inner = key();
        let src = source();

        let ((), outer_sources) = tracker.tracked(Some(outer), FrameKind::View, || {
            let ((), inner_sources) = tracker.tracked(Some(inner), FrameKind::Computed, || {
                assert_eq!(tracker.record_read(&src, 0), Some(inner));
            });
            assert_eq!(inner_sources.len(), 1);
        });
        assert!(outer_sources.is_empty());
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn untracked_frames_register_nothing() {
        let tracker = Tracker::new();
        let src = source();

        let ((), sources) = tracker.tracked(None, FrameKind::Untracked, || {
            assert_eq!(tracker.record_read(&src, 0), None);
        });
        assert!(sources.is_empty());
    }

    #[test]
    fn reads_outside_any_frame_register_nothing() {
        let tracker = Tracker::new();
        let src = source();
        assert_eq!(tracker.record_read(&src, 0), None);
    }

    #[test]
    fn on_stack_finds_nested_consumers() {
        let tracker = Tracker::new();
        let outer = key();
        let inner = key();

        tracker.tracked(Some(outer), FrameKind::Effect { allow_writes: false }, || {
            tracker.tracked(Some(inner), FrameKind::Computed, || {
                assert!(tracker.on_stack(outer));
                assert!(tracker.on_stack(inner));
            });
            assert!(!tracker.on_stack(inner));
        });
    }

    #[test]
    fn write_guard_rejects_computed_and_readonly_effect_frames() {
        let tracker = Tracker::new();

        assert_eq!(tracker.write_guard(), Ok(()));

        tracker.tracked(Some(key()), FrameKind::Computed, || {
            assert_eq!(
                tracker.write_guard(),
                Err(ReactiveError::WriteDuringComputation)
            );
        });

        tracker.tracked(Some(key()), FrameKind::Effect { allow_writes: false }, || {
            assert_eq!(tracker.write_guard(), Err(ReactiveError::WriteDuringEffect));
        });

        tracker.tracked(Some(key()), FrameKind::Effect { allow_writes: true }, || {
            assert_eq!(tracker.write_guard(), Ok(()));
        });
    }

    #[test]
    fn write_guard_sees_through_untracked_frames() {
        let tracker = Tracker::new();

        tracker.tracked(Some(key()), FrameKind::Computed, || {
            tracker.tracked(None, FrameKind::Untracked, || {
                assert_eq!(
                    tracker.write_guard(),
                    Err(ReactiveError::WriteDuringComputation)
                );
            });
        });
    }
}
