//! Consumer registry.
//!
//! Every consumer (computed, effect, view) registers here at creation and
//! receives a [`ConsumerKey`]: a generation-checked index into a slot arena.
//! Sources store these keys instead of owning handles, so a source never
//! keeps a consumer alive. Disposal frees the slot, which invalidates the
//! key's generation; any key still sitting in a source's consumer set then
//! fails to resolve and is pruned lazily.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};

use super::SourceChange;

new_key_type! {
    /// Generation-checked handle to a registered consumer.
    pub(crate) struct ConsumerKey;
}

/// A registered consumer of reactive sources.
///
/// Implemented by computed values, effects, and views. The registry stores
/// these as weak trait objects; a consumer that has been dropped simply
/// stops resolving.
pub(crate) trait ConsumerNode: Send + Sync {
    /// React to a change in one of this consumer's sources.
    fn source_changed(&self, change: SourceChange);

    /// Run this consumer's flush-phase work, if any is pending.
    ///
    /// Computed values have none: they are pulled lazily by their readers.
    fn run_pending(&self);
}

struct Slot {
    node: Weak<dyn ConsumerNode>,
    /// Creation sequence number. Effects run in this order during a flush.
    seq: u64,
}

/// Arena of live consumers.
pub(crate) struct ConsumerRegistry {
    slots: RwLock<SlotMap<ConsumerKey, Slot>>,
    next_seq: AtomicU64,
}

impl ConsumerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(SlotMap::with_key()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a consumer and hand back its key.
    pub(crate) fn register(&self, node: Weak<dyn ConsumerNode>) -> ConsumerKey {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.slots.write().insert(Slot { node, seq })
    }

    /// Free a consumer's slot. Its key, wherever it is still stored, will no
    /// longer resolve.
    pub(crate) fn unregister(&self, key: ConsumerKey) {
        self.slots.write().remove(key);
    }

    /// Resolve a key to a live consumer.
    ///
    /// A slot whose weak reference is dead is removed on the way through, so
    /// dropped-but-never-disposed consumers are reclaimed as a side effect
    /// of notification traffic.
    pub(crate) fn resolve(&self, key: ConsumerKey) -> Option<Arc<dyn ConsumerNode>> {
        let upgraded = {
            let slots = self.slots.read();
            match slots.get(key) {
                Some(slot) => slot.node.upgrade(),
                None => return None,
            }
        };
        match upgraded {
            Some(node) => Some(node),
            None => {
                self.slots.write().remove(key);
                None
            }
        }
    }

    /// Creation sequence number for a live key.
    pub(crate) fn seq(&self, key: ConsumerKey) -> Option<u64> {
        self.slots.read().get(key).map(|slot| slot.seq)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }
}
