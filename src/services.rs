//! Per-card UI state, queried by card id and injected into the render context.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

/// Narration collaborator. Speech itself lives outside the engine; the
/// engine only needs to stop whatever is tied to a card it navigated away from.
pub trait Narrator: Send + Sync {
    fn stop(&self, card_id: &str);
}

#[derive(Debug, Default)]
pub struct SilentNarrator;

impl Narrator for SilentNarrator {
    fn stop(&self, _card_id: &str) {}
}

/// A set of card ids with toggle semantics.
#[derive(Debug, Default)]
pub struct CardFlags {
    ids: RwLock<HashSet<String>>,
}

impl CardFlags {
    pub fn contains(&self, card_id: &str) -> bool {
        self.ids.read().contains(card_id)
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self, card_id: &str) -> bool {
        let mut ids = self.ids.write();
        if ids.remove(card_id) {
            false
        } else {
            ids.insert(card_id.to_string());
            true
        }
    }

    pub fn clear(&self) {
        self.ids.write().clear();
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CardServices {
    pub saved: CardFlags,
    pub expanded: CardFlags,
    pub narrator: Arc<dyn Narrator>,
}

impl CardServices {
    pub fn new(narrator: Arc<dyn Narrator>) -> Self {
        Self {
            saved: CardFlags::default(),
            expanded: CardFlags::default(),
            narrator,
        }
    }

    pub fn view(&self, card_id: &str) -> CardView {
        CardView {
            saved: self.saved.contains(card_id),
            expanded: self.expanded.contains(card_id),
        }
    }
}

impl Default for CardServices {
    fn default() -> Self {
        Self::new(Arc::new(SilentNarrator))
    }
}

/// Snapshot of per-card state for rendering one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardView {
    pub saved: bool,
    pub expanded: bool,
}
