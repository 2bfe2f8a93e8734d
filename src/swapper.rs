//! Two-buffer asset swapping with crossfade.
//!
//! A [`MediaSlotSwapper`] owns two physical buffers. One is active (shown
//! for the current card); the other is idle, preloading the predicted next
//! asset, or holding a stale asset. An inactive buffer is only promoted when
//! its load completed, or when its URL is in the [`LoadedAssets`] memo.
//!
//! The memo exists because a media element reusing an already-cached URL as
//! its source may never report load completion again. Trusting "this URL
//! finished loading earlier in the session" avoids waiting forever on such a
//! buffer and keeps back-navigation from flashing a blank frame.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

/// Progress below which the incoming buffer stays fully transparent.
pub const FADE_IN_START: f32 = 0.2;

pub trait Asset: Clone + PartialEq + fmt::Debug {
    fn url(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    A,
    B,
}

impl BufferId {
    pub fn other(self) -> Self {
        match self {
            BufferId::A => BufferId::B,
            BufferId::B => BufferId::A,
        }
    }

    fn index(self) -> usize {
        match self {
            BufferId::A => 0,
            BufferId::B => 1,
        }
    }
}

/// The render targets a swapper drives. `load` must eventually be answered
/// with [`MediaSlotSwapper::on_loaded`] or [`MediaSlotSwapper::on_error`].
pub trait MediaSurface<A: Asset> {
    fn load(&mut self, buffer: BufferId, asset: &A);
}

/// Append-only set of URLs that completed loading at least once.
#[derive(Debug, Default)]
pub struct LoadedAssets {
    urls: RwLock<HashSet<String>>,
}

static GLOBAL_LOADED: Lazy<Arc<LoadedAssets>> = Lazy::new(|| Arc::new(LoadedAssets::default()));

impl LoadedAssets {
    /// The process-wide memo shared by every swapper built with [`MediaSlotSwapper::new`].
    pub fn global() -> Arc<LoadedAssets> {
        GLOBAL_LOADED.clone()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.read().contains(url)
    }

    pub fn insert(&self, url: &str) {
        if !self.contains(url) {
            self.urls.write().insert(url.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.urls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetBuffer<A> {
    pub asset: Option<A>,
    pub loaded: bool,
}

impl<A> Default for AssetBuffer<A> {
    fn default() -> Self {
        Self {
            asset: None,
            loaded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossfade {
    pub a: f32,
    pub b: f32,
}

impl Crossfade {
    pub fn get(&self, buffer: BufferId) -> f32 {
        match buffer {
            BufferId::A => self.a,
            BufferId::B => self.b,
        }
    }
}

pub struct MediaSlotSwapper<A: Asset> {
    buffers: [AssetBuffer<A>; 2],
    active: BufferId,
    pending_swap: bool,
    memo: Arc<LoadedAssets>,
}

impl<A: Asset> fmt::Debug for MediaSlotSwapper<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSlotSwapper")
            .field("buffers", &self.buffers)
            .field("active", &self.active)
            .field("pending_swap", &self.pending_swap)
            .finish()
    }
}

impl<A: Asset> Default for MediaSlotSwapper<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Asset> MediaSlotSwapper<A> {
    pub fn new() -> Self {
        Self::with_memo(LoadedAssets::global())
    }

    pub fn with_memo(memo: Arc<LoadedAssets>) -> Self {
        Self {
            buffers: [AssetBuffer::default(), AssetBuffer::default()],
            active: BufferId::A,
            pending_swap: false,
            memo,
        }
    }

    pub fn active(&self) -> BufferId {
        self.active
    }

    pub fn active_asset(&self) -> Option<&A> {
        self.buffer(self.active).asset.as_ref()
    }

    pub fn buffer(&self, id: BufferId) -> &AssetBuffer<A> {
        &self.buffers[id.index()]
    }

    pub fn pending_swap(&self) -> bool {
        self.pending_swap
    }

    fn buffer_mut(&mut self, id: BufferId) -> &mut AssetBuffer<A> {
        &mut self.buffers[id.index()]
    }

    fn is_ready(&self, id: BufferId) -> bool {
        let buffer = self.buffer(id);
        buffer.loaded
            || buffer
                .asset
                .as_ref()
                .map(|asset| self.memo.contains(asset.url()))
                .unwrap_or(false)
    }

    fn swap(&mut self) {
        let incoming = self.active.other();
        if !self.is_ready(incoming) {
            return;
        }
        self.active = incoming;
        self.pending_swap = false;
        debug!(buffer = ?incoming, asset = ?self.active_asset(), "media swap");
    }

    fn assign(&mut self, id: BufferId, asset: &A, surface: &mut impl MediaSurface<A>) {
        *self.buffer_mut(id) = AssetBuffer {
            asset: Some(asset.clone()),
            loaded: false,
        };
        surface.load(id, asset);
    }

    /// Show `target` for the current card.
    pub fn set_target(&mut self, target: &A, surface: &mut impl MediaSurface<A>) {
        if self.active_asset() == Some(target) {
            self.pending_swap = false;
            return;
        }
        let inactive = self.active.other();
        if self.buffer(inactive).asset.as_ref() != Some(target) {
            self.assign(inactive, target, surface);
        }
        self.pending_swap = true;
        if self.is_ready(inactive) {
            self.swap();
        }
    }

    /// Warm the inactive buffer with the asset the next card will need.
    /// Never displaces a pending swap target.
    pub fn preload(&mut self, predicted: &A, surface: &mut impl MediaSurface<A>) {
        if self.pending_swap {
            return;
        }
        let inactive = self.active.other();
        if self.active_asset() == Some(predicted)
            || self.buffer(inactive).asset.as_ref() == Some(predicted)
        {
            return;
        }
        self.assign(inactive, predicted, surface);
    }

    /// Load completion for `buffer`. Events for an asset the buffer no longer
    /// holds are ignored.
    pub fn on_loaded(&mut self, buffer: BufferId, url: &str) {
        let matches = self
            .buffer(buffer)
            .asset
            .as_ref()
            .map(|asset| asset.url() == url)
            .unwrap_or(false);
        if !matches {
            return;
        }
        self.buffer_mut(buffer).loaded = true;
        self.memo.insert(url);
        if self.pending_swap && buffer == self.active.other() {
            self.swap();
        }
    }

    /// Load failure for `buffer`. A failed incoming asset abandons the pending
    /// swap so the current asset keeps showing.
    pub fn on_error(&mut self, buffer: BufferId, url: &str) {
        let matches = self
            .buffer(buffer)
            .asset
            .as_ref()
            .map(|asset| asset.url() == url)
            .unwrap_or(false);
        if !matches || buffer == self.active {
            return;
        }
        *self.buffer_mut(buffer) = AssetBuffer::default();
        self.pending_swap = false;
    }

    /// Opacities for both buffers at scroll `progress`.
    pub fn crossfade(&self, progress: f32) -> Crossfade {
        let progress = progress.clamp(0.0, 1.0);
        let active = if self.active_asset().is_some() {
            1.0 - progress
        } else {
            0.0
        };
        let incoming_id = self.active.other();
        let incoming = if !self.is_ready(incoming_id) || progress <= FADE_IN_START {
            0.0
        } else {
            ((progress - FADE_IN_START) / (1.0 - FADE_IN_START)).clamp(0.0, 1.0)
        };
        match self.active {
            BufferId::A => Crossfade {
                a: active,
                b: incoming,
            },
            BufferId::B => Crossfade {
                a: incoming,
                b: active,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Img(String);

    impl Asset for Img {
        fn url(&self) -> &str {
            &self.0
        }
    }

    #[derive(Default)]
    struct Recorder {
        loads: Vec<(BufferId, String)>,
    }

    impl MediaSurface<Img> for Recorder {
        fn load(&mut self, buffer: BufferId, asset: &Img) {
            self.loads.push((buffer, asset.0.clone()));
        }
    }

    fn img(url: &str) -> Img {
        Img(url.to_string())
    }

    fn fresh() -> MediaSlotSwapper<Img> {
        MediaSlotSwapper::with_memo(Arc::new(LoadedAssets::default()))
    }

    #[test]
    fn first_target_swaps_after_load() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();

        swapper.set_target(&img("one"), &mut surface);
        assert_eq!(surface.loads, vec![(BufferId::B, "one".to_string())]);
        assert!(swapper.pending_swap());
        assert_eq!(swapper.active_asset(), None);

        swapper.on_loaded(BufferId::B, "one");
        assert_eq!(swapper.active(), BufferId::B);
        assert_eq!(swapper.active_asset(), Some(&img("one")));
        assert!(!swapper.pending_swap());
    }

    #[test]
    fn same_target_twice_issues_one_load() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();

        swapper.set_target(&img("one"), &mut surface);
        swapper.on_loaded(BufferId::B, "one");
        swapper.set_target(&img("one"), &mut surface);
        swapper.set_target(&img("one"), &mut surface);
        assert_eq!(surface.loads.len(), 1);
    }

    #[test]
    fn preloaded_asset_swaps_immediately() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();
        swapper.set_target(&img("one"), &mut surface);
        swapper.on_loaded(BufferId::B, "one");

        swapper.preload(&img("two"), &mut surface);
        assert_eq!(swapper.active_asset(), Some(&img("one")));
        swapper.on_loaded(BufferId::A, "two");
        assert_eq!(swapper.active_asset(), Some(&img("one")));

        swapper.set_target(&img("two"), &mut surface);
        assert_eq!(swapper.active(), BufferId::A);
        assert_eq!(surface.loads.len(), 2);
    }

    #[test]
    fn unloaded_preload_defers_swap_until_load() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();
        swapper.set_target(&img("one"), &mut surface);
        swapper.on_loaded(BufferId::B, "one");
        swapper.preload(&img("two"), &mut surface);

        swapper.set_target(&img("two"), &mut surface);
        assert!(swapper.pending_swap());
        assert_eq!(swapper.active_asset(), Some(&img("one")));
        assert_eq!(swapper.crossfade(0.9).a, 0.0);

        swapper.on_loaded(BufferId::A, "two");
        assert_eq!(swapper.active_asset(), Some(&img("two")));
    }

    #[test]
    fn memoized_url_skips_load_wait() {
        let memo = Arc::new(LoadedAssets::default());
        memo.insert("cached");
        let mut swapper = MediaSlotSwapper::with_memo(memo);
        let mut surface = Recorder::default();

        swapper.set_target(&img("cached"), &mut surface);
        assert_eq!(swapper.active_asset(), Some(&img("cached")));
        assert!(!swapper.buffer(swapper.active()).loaded);
        assert_eq!(surface.loads.len(), 1);
    }

    #[test]
    fn loads_populate_shared_memo() {
        let memo = Arc::new(LoadedAssets::default());
        let mut first = MediaSlotSwapper::with_memo(memo.clone());
        let mut second = MediaSlotSwapper::with_memo(memo.clone());
        let mut surface = Recorder::default();

        first.set_target(&img("shared"), &mut surface);
        first.on_loaded(BufferId::B, "shared");
        assert!(memo.contains("shared"));

        second.set_target(&img("shared"), &mut surface);
        assert_eq!(second.active_asset(), Some(&img("shared")));
    }

    #[test]
    fn stale_load_events_are_ignored() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();
        swapper.set_target(&img("one"), &mut surface);
        swapper.set_target(&img("two"), &mut surface);

        swapper.on_loaded(BufferId::B, "one");
        assert_eq!(swapper.active_asset(), None);
        swapper.on_loaded(BufferId::B, "two");
        assert_eq!(swapper.active_asset(), Some(&img("two")));
    }

    #[test]
    fn inactive_never_visible_before_ready() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();
        swapper.set_target(&img("one"), &mut surface);
        swapper.on_loaded(BufferId::B, "one");
        swapper.preload(&img("two"), &mut surface);

        for step in 0..=10 {
            let fade = swapper.crossfade(step as f32 / 10.0);
            assert_eq!(fade.get(BufferId::A), 0.0);
        }
        swapper.on_loaded(BufferId::A, "two");
        assert_eq!(swapper.crossfade(0.2).a, 0.0);
        assert!((swapper.crossfade(0.6).a - 0.5).abs() < 1e-6);
        assert_eq!(swapper.crossfade(1.0).a, 1.0);
        assert!((swapper.crossfade(0.25).b - 0.75).abs() < 1e-6);
    }

    #[test]
    fn failed_incoming_keeps_current() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();
        swapper.set_target(&img("one"), &mut surface);
        swapper.on_loaded(BufferId::B, "one");
        swapper.set_target(&img("broken"), &mut surface);

        swapper.on_error(BufferId::A, "broken");
        assert!(!swapper.pending_swap());
        assert_eq!(swapper.active_asset(), Some(&img("one")));
        assert_eq!(swapper.buffer(BufferId::A).asset, None);
    }

    #[test]
    fn preload_does_not_clobber_pending_target() {
        let mut swapper = fresh();
        let mut surface = Recorder::default();
        swapper.set_target(&img("one"), &mut surface);
        swapper.preload(&img("two"), &mut surface);
        assert_eq!(surface.loads.len(), 1);
        assert_eq!(swapper.buffer(BufferId::B).asset, Some(img("one")));
    }
}
