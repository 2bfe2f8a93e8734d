//! Three-slot virtualization over an unbounded card sequence.
//!
//! The viewport scrolls over exactly three slots (previous, current, next)
//! laid out at offsets `0`, `extent` and `2 * extent`. The committed logical
//! index always sits in the middle slot. When a gesture settles on a
//! neighbouring slot the index moves by one and the offset jumps back to the
//! middle in the same call, so the surface never renders the new index at the
//! old offset.
//!
//! Settling has two triggers, the surface's own scroll-end signal and a
//! debounce timer driven by [`Virtualizer::tick`]. Both go through one
//! handler that only acts while the state is [`ScrollState::Dragging`], so a
//! gesture produces at most one decision no matter how many triggers fire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::card::Card;
use crate::services::Narrator;

pub trait FeedSource: Send + Sync {
    fn len(&self) -> usize;
    fn card(&self, index: usize) -> Option<Card>;
    fn maybe_prefetch(&self, index: usize);
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualizerConfig {
    /// Height of one slot in surface units.
    pub slot_extent: f32,
    /// Movement below this distance from center never changes direction.
    pub dead_zone: f32,
    /// How close to a slot position counts as "on" that slot when settling.
    pub settle_epsilon: f32,
    /// Fraction of a slot past which a released gesture snaps forward.
    pub snap_threshold: f32,
    pub settle_debounce: Duration,
    /// Upper bound on waiting for the surface to acknowledge a reset.
    pub reset_timeout: Duration,
}

impl Default for VirtualizerConfig {
    fn default() -> Self {
        Self {
            slot_extent: 100.0,
            dead_zone: 10.0,
            settle_epsilon: 2.0,
            snap_threshold: 0.3,
            settle_debounce: Duration::from_millis(160),
            reset_timeout: Duration::from_millis(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    TowardNext,
    TowardPrevious,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollState {
    Steady {
        index: usize,
    },
    Dragging {
        index: usize,
        progress: f32,
        direction: Direction,
    },
    /// Offset was written back to center; surface echoes are suppressed
    /// until it acknowledges or the reset times out.
    Resetting {
        target: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Input {
    /// Relative scroll, positive toward the next card.
    Wheel(f32),
    PointerDown(f32),
    PointerMove(f32),
    PointerUp,
    /// Absolute offset reported by the surface.
    Scrolled(f32),
    /// Native "scroll finished" signal.
    ScrollEnd,
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    ScrollTo(f32),
    IndexChanged { from: usize, to: usize },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlotWindow {
    pub prev: Option<Card>,
    pub current: Option<Card>,
    pub next: Option<Card>,
}

#[derive(Debug, Clone, Copy)]
struct PointerAnchor {
    start_y: f32,
    start_offset: f32,
}

pub struct Virtualizer {
    config: VirtualizerConfig,
    feed: Arc<dyn FeedSource>,
    narrator: Arc<dyn Narrator>,
    state: ScrollState,
    offset: f32,
    pointer: Option<PointerAnchor>,
    last_activity: Option<Instant>,
    reset_since: Option<Instant>,
    effects: Vec<Effect>,
}

impl Virtualizer {
    pub fn new(
        config: VirtualizerConfig,
        feed: Arc<dyn FeedSource>,
        narrator: Arc<dyn Narrator>,
    ) -> Self {
        let offset = config.slot_extent;
        Self {
            config,
            feed,
            narrator,
            state: ScrollState::Steady { index: 0 },
            offset,
            pointer: None,
            last_activity: None,
            reset_since: None,
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> ScrollState {
        self.state
    }

    pub fn index(&self) -> usize {
        match self.state {
            ScrollState::Steady { index } | ScrollState::Dragging { index, .. } => index,
            ScrollState::Resetting { target } => target,
        }
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn centered(&self) -> f32 {
        self.config.slot_extent
    }

    pub fn progress(&self) -> f32 {
        match self.state {
            ScrollState::Dragging { progress, .. } => progress,
            _ => 0.0,
        }
    }

    pub fn direction(&self) -> Direction {
        match self.state {
            ScrollState::Dragging { direction, .. } => direction,
            _ => Direction::None,
        }
    }

    /// The index the current gesture is heading toward, if it exists yet.
    pub fn predicted_index(&self) -> Option<usize> {
        let index = self.index();
        match self.direction() {
            Direction::TowardNext if index + 1 < self.feed.len() => Some(index + 1),
            Direction::TowardPrevious if index > 0 => Some(index - 1),
            _ => None,
        }
    }

    pub fn slots(&self) -> SlotWindow {
        let index = self.index();
        SlotWindow {
            prev: index.checked_sub(1).and_then(|i| self.feed.card(i)),
            current: self.feed.card(index),
            next: self.feed.card(index + 1),
        }
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn handle(&mut self, input: Input, now: Instant) {
        if let ScrollState::Resetting { .. } = self.state {
            if let Input::Scrolled(offset) = input {
                if self.near(offset, self.centered()) {
                    self.finish_reset();
                }
            }
            return;
        }

        match input {
            Input::Wheel(delta) => {
                if self.pointer.is_none() {
                    self.move_to(self.offset + delta, now);
                }
            }
            Input::PointerDown(y) => {
                self.pointer = Some(PointerAnchor {
                    start_y: y,
                    start_offset: self.offset,
                });
                self.last_activity = Some(now);
            }
            Input::PointerMove(y) => {
                if let Some(anchor) = self.pointer {
                    self.move_to(anchor.start_offset - (y - anchor.start_y), now);
                }
            }
            Input::PointerUp => {
                if self.pointer.take().is_some() {
                    self.snap();
                    self.settle(now);
                }
            }
            Input::Scrolled(offset) => self.move_to(offset, now),
            Input::ScrollEnd => self.settle(now),
            Input::Next => self.navigate(self.centered() * 2.0, now),
            Input::Previous => self.navigate(0.0, now),
        }
    }

    /// Drives the debounce settle fallback and reset timeout. Call every frame.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            ScrollState::Resetting { .. } => {
                let expired = self
                    .reset_since
                    .map(|since| now.saturating_duration_since(since) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if expired {
                    self.finish_reset();
                }
            }
            ScrollState::Dragging { .. } if self.pointer.is_none() => {
                let quiet = self
                    .last_activity
                    .map(|last| now.saturating_duration_since(last) >= self.config.settle_debounce)
                    .unwrap_or(true);
                if quiet {
                    self.snap();
                    self.settle(now);
                }
            }
            _ => {}
        }
    }

    /// Surface acknowledged the centered offset written by a commit.
    pub fn finish_reset(&mut self) {
        if let ScrollState::Resetting { target } = self.state {
            self.state = ScrollState::Steady { index: target };
            self.reset_since = None;
        }
    }

    /// Return to the first card, e.g. after the sequence was discarded.
    pub fn reset(&mut self) {
        self.state = ScrollState::Steady { index: 0 };
        self.offset = self.centered();
        self.pointer = None;
        self.last_activity = None;
        self.reset_since = None;
        self.effects.push(Effect::ScrollTo(self.offset));
    }

    fn near(&self, offset: f32, position: f32) -> bool {
        (offset - position).abs() <= self.config.settle_epsilon
    }

    fn move_to(&mut self, offset: f32, now: Instant) {
        let extent = self.config.slot_extent;
        self.offset = offset.clamp(0.0, extent * 2.0);
        let distance = self.offset - extent;
        let progress = (distance.abs() / extent).clamp(0.0, 1.0);
        let direction = if distance > self.config.dead_zone {
            Direction::TowardNext
        } else if distance < -self.config.dead_zone {
            Direction::TowardPrevious
        } else {
            self.direction()
        };
        self.state = ScrollState::Dragging {
            index: self.index(),
            progress,
            direction,
        };
        self.last_activity = Some(now);
    }

    fn navigate(&mut self, position: f32, now: Instant) {
        if self.pointer.is_some() {
            return;
        }
        self.move_to(position, now);
        self.settle(now);
    }

    /// Emulates scroll-snap for gestures the surface does not snap itself.
    fn snap(&mut self) {
        let ScrollState::Dragging {
            progress,
            direction,
            ..
        } = self.state
        else {
            return;
        };
        let extent = self.config.slot_extent;
        self.offset = if progress >= self.config.snap_threshold {
            match direction {
                Direction::TowardNext => extent * 2.0,
                Direction::TowardPrevious => 0.0,
                Direction::None => extent,
            }
        } else {
            extent
        };
    }

    fn settle(&mut self, now: Instant) {
        let ScrollState::Dragging { index, .. } = self.state else {
            return;
        };
        let extent = self.config.slot_extent;
        let len = self.feed.len();

        if self.near(self.offset, extent * 2.0) {
            if index + 1 < len {
                self.commit(index, index + 1, now);
            } else {
                // pushing past the loaded end asks for more
                self.feed.maybe_prefetch(index);
                self.snap_back(index, now);
            }
        } else if self.near(self.offset, 0.0) {
            if index > 0 {
                self.commit(index, index - 1, now);
            } else {
                self.snap_back(index, now);
            }
        } else {
            if !self.near(self.offset, extent) {
                debug!(offset = self.offset, index, "settled between slots");
            }
            self.state = ScrollState::Steady { index };
        }
    }

    fn commit(&mut self, from: usize, to: usize, now: Instant) {
        if let Some(card) = self.feed.card(from) {
            self.narrator.stop(&card.id);
        }
        self.offset = self.centered();
        self.state = ScrollState::Resetting { target: to };
        self.reset_since = Some(now);
        self.effects.push(Effect::ScrollTo(self.offset));
        self.effects.push(Effect::IndexChanged { from, to });
        info!(from, to, "index committed");
        self.feed.maybe_prefetch(to);
    }

    fn snap_back(&mut self, index: usize, now: Instant) {
        self.offset = self.centered();
        self.state = ScrollState::Resetting { target: index };
        self.reset_since = Some(now);
        self.effects.push(Effect::ScrollTo(self.offset));
        debug!(index, "rubber-band at sequence bound");
    }
}
