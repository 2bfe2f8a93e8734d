//! Append-only, deduplicated card sequence that grows itself in the background.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::card::Card;
use crate::error::FetchError;
use crate::net::CancelToken;
use crate::source::ContentSource;
use crate::virtualizer::FeedSource;

/// Persistence collaborator. Size cap and expiry are its own business.
pub trait CardCache: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<Card>>;
    fn persist(&self, cards: &[Card]) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoCache;

impl CardCache for NoCache {
    fn load(&self) -> anyhow::Result<Vec<Card>> {
        Ok(Vec::new())
    }

    fn persist(&self, _cards: &[Card]) -> anyhow::Result<()> {
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub batch_size: usize,
    pub prefetch_threshold: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            prefetch_threshold: 3,
        }
    }
}

/// What subscribers see after every change.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    /// Increases with every change; lets listeners drop out-of-order deliveries.
    pub version: u64,
    pub cards: Arc<Vec<Card>>,
    pub is_loading: bool,
    pub error: Option<FetchError>,
    pub topic: Option<String>,
}

impl FeedSnapshot {
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn is_offline(&self) -> bool {
        self.error.as_ref().map(FetchError::is_offline).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&FeedSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchReason {
    Initial,
    Prefetch,
    Topic,
}

struct State {
    version: u64,
    cards: Arc<Vec<Card>>,
    seen: HashSet<String>,
    is_loading: bool,
    error: Option<FetchError>,
    topic: Option<String>,
    /// Bumped by refresh so results of a discarded generation are dropped.
    generation: u64,
    topic_fetch_pending: bool,
    cancel: CancelToken,
}

impl State {
    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            version: self.version,
            cards: self.cards.clone(),
            is_loading: self.is_loading,
            error: self.error.clone(),
            topic: self.topic.clone(),
        }
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Appends unseen cards, returning the ones that were new.
    fn append(&mut self, batch: Vec<Card>) -> Vec<Card> {
        let fresh: Vec<Card> = batch
            .into_iter()
            .filter(|card| self.seen.insert(card.id.clone()))
            .collect();
        if !fresh.is_empty() {
            Arc::make_mut(&mut self.cards).extend(fresh.iter().cloned());
        }
        fresh
    }
}

struct Inner {
    source: Arc<dyn ContentSource>,
    cache: Arc<dyn CardCache>,
    options: QueueOptions,
    state: Mutex<State>,
    idle: Condvar,
    /// Orders cache writes against the clear done by refresh.
    cache_lock: Mutex<()>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

#[derive(Clone)]
pub struct FeedQueue {
    inner: Arc<Inner>,
}

impl FeedQueue {
    /// Seeds the sequence from `cache`; a failing cache starts empty.
    pub fn new(
        source: Arc<dyn ContentSource>,
        cache: Arc<dyn CardCache>,
        options: QueueOptions,
    ) -> Self {
        let cached = cache.load().unwrap_or_else(|err| {
            debug!(error = %err, "card cache unreadable, starting empty");
            Vec::new()
        });
        let mut state = State {
            version: 0,
            cards: Arc::new(Vec::new()),
            seen: HashSet::new(),
            is_loading: false,
            error: None,
            topic: None,
            generation: 0,
            topic_fetch_pending: false,
            cancel: CancelToken::new(),
        };
        let restored = state.append(cached).len();
        if restored > 0 {
            info!(cards = restored, "restored cached cards");
        }

        Self {
            inner: Arc::new(Inner {
                source,
                cache,
                options: QueueOptions {
                    batch_size: options.batch_size.max(1),
                    ..options
                },
                state: Mutex::new(state),
                idle: Condvar::new(),
                cache_lock: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> QueueOptions {
        self.inner.options
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().is_loading
    }

    pub fn topic(&self) -> Option<String> {
        self.inner.state.lock().topic.clone()
    }

    /// Registers `listener` and immediately replays the current state to it.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&FeedSnapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        let listener: Listener = Arc::new(listener);
        self.inner.listeners.lock().push((id, listener.clone()));
        listener(&self.snapshot());
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .listeners
            .lock()
            .retain(|(listener_id, _)| *listener_id != id.0);
    }

    /// Fetches the first batch when the sequence is empty.
    pub fn initialize(&self) -> bool {
        if !self.inner.state.lock().cards.is_empty() {
            return false;
        }
        self.begin_fetch(FetchReason::Initial)
    }

    /// Starts a background fetch when few cards remain past `index`. Does
    /// nothing while a fetch is in flight, so it is safe to call on every move.
    pub fn maybe_prefetch(&self, index: usize) -> bool {
        let remaining = {
            let state = self.inner.state.lock();
            state.cards.len().saturating_sub(index + 1)
        };
        if remaining > self.inner.options.prefetch_threshold {
            return false;
        }
        self.begin_fetch(FetchReason::Prefetch)
    }

    /// Scopes future fetches to cards related to `anchor_title` and fetches once.
    pub fn enable_topic(&self, anchor_title: &str) {
        {
            let mut state = self.inner.state.lock();
            state.topic = Some(anchor_title.to_string());
            state.touch();
        }
        info!(anchor = anchor_title, "topic mode on");
        self.notify();
        self.begin_fetch(FetchReason::Topic);
    }

    pub fn disable_topic(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.topic.take().is_none() {
                return;
            }
            state.topic_fetch_pending = false;
            state.touch();
        }
        info!("topic mode off");
        self.notify();
    }

    /// Discards the whole sequence, its dedup history, the topic filter and
    /// the cache, then fetches a new first batch.
    pub fn refresh(&self) {
        {
            let mut state = self.inner.state.lock();
            state.cancel.cancel();
            state.cancel = CancelToken::new();
            state.generation += 1;
            state.cards = Arc::new(Vec::new());
            state.seen.clear();
            state.topic = None;
            state.topic_fetch_pending = false;
            state.error = None;
            state.is_loading = false;
            state.touch();
        }
        self.inner.idle.notify_all();
        {
            let _cache = self.inner.cache_lock.lock();
            if let Err(err) = self.inner.cache.clear() {
                warn!(error = %err, "card cache clear failed");
            }
        }
        info!("feed refreshed");
        self.notify();
        self.initialize();
    }

    /// Blocks until no fetch is in flight or `timeout` passes. Returns `true` when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.is_loading {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.is_loading;
            }
        }
        true
    }

    fn begin_fetch(&self, reason: FetchReason) -> bool {
        let (generation, topic, cancel) = {
            let mut state = self.inner.state.lock();
            if state.is_loading {
                if reason == FetchReason::Topic {
                    state.topic_fetch_pending = true;
                }
                return false;
            }
            state.is_loading = true;
            state.error = None;
            state.touch();
            (state.generation, state.topic.clone(), state.cancel.clone())
        };
        debug!(?reason, ?topic, generation, "fetch started");
        self.notify();

        let queue = self.clone();
        let spawned = thread::Builder::new()
            .name("feed-fetch".into())
            .spawn(move || {
                let result = queue.run_fetch(topic.as_deref(), &cancel);
                queue.complete(generation, result);
            });
        if let Err(err) = spawned {
            self.complete(
                generation,
                Err(FetchError::Transient {
                    status: None,
                    message: format!("spawn fetch worker: {err}"),
                }),
            );
        }
        true
    }

    fn run_fetch(&self, topic: Option<&str>, cancel: &CancelToken) -> Result<Vec<Card>, FetchError> {
        let batch_size = self.inner.options.batch_size;
        match topic {
            Some(anchor) => {
                let related = self.inner.source.fetch_by_topic(anchor, cancel)?;
                let unseen: Vec<Card> = {
                    let state = self.inner.state.lock();
                    related
                        .into_iter()
                        .filter(|card| !state.seen.contains(&card.id))
                        .collect()
                };
                if unseen.is_empty() {
                    // the anchor's related set is used up; keep the feed growing
                    debug!(anchor, "no unseen related cards, falling back to random");
                    self.inner.source.fetch_random(batch_size, cancel)
                } else {
                    Ok(unseen)
                }
            }
            None => self.inner.source.fetch_random(batch_size, cancel),
        }
    }

    fn complete(&self, generation: u64, result: Result<Vec<Card>, FetchError>) {
        let fresh = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                debug!(generation, "dropping results of discarded feed");
                return;
            }
            match result {
                Ok(batch) => {
                    let received = batch.len();
                    let fresh = state.append(batch);
                    info!(
                        received,
                        appended = fresh.len(),
                        total = state.cards.len(),
                        "feed grew"
                    );
                    fresh
                }
                Err(err) => {
                    warn!(error = %err, "feed fetch failed");
                    state.error = Some(err);
                    Vec::new()
                }
            }
        };

        // Persist before going idle so a waiter observes a written cache.
        if !fresh.is_empty() {
            let _cache = self.inner.cache_lock.lock();
            if self.inner.state.lock().generation == generation {
                if let Err(err) = self.inner.cache.persist(&fresh) {
                    warn!(error = %err, "card cache write failed");
                }
            }
        }

        let refetch = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.is_loading = false;
            state.touch();
            std::mem::take(&mut state.topic_fetch_pending)
        };
        self.inner.idle.notify_all();
        self.notify();

        if refetch {
            self.begin_fetch(FetchReason::Topic);
        }
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

impl FeedSource for FeedQueue {
    fn len(&self) -> usize {
        self.inner.state.lock().cards.len()
    }

    fn card(&self, index: usize) -> Option<Card> {
        self.inner.state.lock().cards.get(index).cloned()
    }

    fn maybe_prefetch(&self, index: usize) {
        FeedQueue::maybe_prefetch(self, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockContentSource;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn card(id: &str) -> Card {
        Card {
            id: id.to_string(),
            title: id.to_uppercase(),
            body: String::new(),
            link: format!("https://example.org/{id}"),
            thumbnail: None,
            attribution: None,
            fetched_at: Utc::now(),
        }
    }

    fn cards(ids: &[&str]) -> Vec<Card> {
        ids.iter().map(|id| card(id)).collect()
    }

    /// Hands out queued results, optionally holding every call until released.
    #[derive(Default)]
    struct ScriptedSource {
        random: Mutex<VecDeque<Result<Vec<Card>, FetchError>>>,
        topic: Mutex<VecDeque<Result<Vec<Card>, FetchError>>>,
        held: Mutex<bool>,
        released: Condvar,
        random_calls: AtomicUsize,
        topic_calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn random(self, result: Result<Vec<Card>, FetchError>) -> Self {
            self.random.lock().push_back(result);
            self
        }

        fn topic(self, result: Result<Vec<Card>, FetchError>) -> Self {
            self.topic.lock().push_back(result);
            self
        }

        fn hold(self) -> Self {
            *self.held.lock() = true;
            self
        }

        fn release(&self) {
            *self.held.lock() = false;
            self.released.notify_all();
        }

        fn gate(&self, cancel: &CancelToken) -> Result<(), FetchError> {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            Ok(())
        }
    }

    impl ContentSource for ScriptedSource {
        fn fetch_random(&self, _count: usize, cancel: &CancelToken) -> Result<Vec<Card>, FetchError> {
            self.random_calls.fetch_add(1, Ordering::SeqCst);
            self.gate(cancel)?;
            self.random.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn fetch_by_topic(&self, _anchor: &str, cancel: &CancelToken) -> Result<Vec<Card>, FetchError> {
            self.topic_calls.fetch_add(1, Ordering::SeqCst);
            self.gate(cancel)?;
            self.topic.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct RecordingCache {
        stored: Mutex<Vec<Card>>,
        clears: AtomicUsize,
    }

    impl CardCache for RecordingCache {
        fn load(&self) -> anyhow::Result<Vec<Card>> {
            Ok(self.stored.lock().clone())
        }

        fn persist(&self, cards: &[Card]) -> anyhow::Result<()> {
            self.stored.lock().extend(cards.iter().cloned());
            Ok(())
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.stored.lock().clear();
            Ok(())
        }
    }

    fn queue_with(source: Arc<ScriptedSource>, cache: Arc<RecordingCache>) -> FeedQueue {
        FeedQueue::new(source, cache, QueueOptions::default())
    }

    fn ids(queue: &FeedQueue) -> Vec<String> {
        queue.snapshot().cards.iter().map(|c| c.id.clone()).collect()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn overlapping_batches_are_deduplicated() {
        let source = Arc::new(
            ScriptedSource::default()
                .random(Ok(cards(&["a", "b", "c"])))
                .random(Ok(cards(&["b", "c", "d"]))),
        );
        let cache = Arc::new(RecordingCache::default());
        let queue = queue_with(source, cache.clone());

        queue.initialize();
        assert!(queue.wait_idle(WAIT));
        queue.maybe_prefetch(2);
        assert!(queue.wait_idle(WAIT));

        assert_eq!(ids(&queue), vec!["a", "b", "c", "d"]);
        assert_eq!(cache.stored.lock().len(), 4);
    }

    #[test]
    fn only_one_fetch_in_flight() {
        let source = Arc::new(ScriptedSource::default().random(Ok(cards(&["a"]))).hold());
        let queue = queue_with(source.clone(), Arc::new(RecordingCache::default()));

        assert!(queue.initialize());
        assert!(queue.is_loading());
        assert!(!queue.initialize());
        assert!(!queue.maybe_prefetch(0));
        assert!(!queue.wait_idle(Duration::from_millis(20)));

        source.release();
        assert!(queue.wait_idle(WAIT));
        assert_eq!(source.random_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ids(&queue), vec!["a"]);
    }

    #[test]
    fn failure_keeps_existing_cards() {
        let source = Arc::new(
            ScriptedSource::default()
                .random(Ok(cards(&["a", "b"])))
                .random(Err(FetchError::Offline)),
        );
        let queue = queue_with(source, Arc::new(RecordingCache::default()));

        queue.initialize();
        queue.wait_idle(WAIT);
        queue.maybe_prefetch(1);
        queue.wait_idle(WAIT);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.error, Some(FetchError::Offline));
        assert!(snapshot.is_offline());
        assert!(!snapshot.is_loading);
    }

    #[test]
    fn empty_topic_falls_back_to_random() {
        let source = Arc::new(
            ScriptedSource::default()
                .topic(Ok(Vec::new()))
                .random(Ok(cards(&["x"]))),
        );
        let queue = queue_with(source.clone(), Arc::new(RecordingCache::default()));

        queue.enable_topic("Basalt");
        queue.wait_idle(WAIT);

        assert_eq!(ids(&queue), vec!["x"]);
        assert_eq!(queue.topic().as_deref(), Some("Basalt"));
        assert_eq!(source.topic_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.random_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_topic_keeps_growing_with_random_cards() {
        let related = || Ok(cards(&["t1", "t2"]));
        let source = Arc::new(
            ScriptedSource::default()
                .topic(related())
                .topic(related())
                .topic(related())
                .random(Ok(cards(&["r1", "r2"])))
                .random(Ok(cards(&["r3"]))),
        );
        let queue = queue_with(source.clone(), Arc::new(RecordingCache::default()));

        queue.enable_topic("Basalt");
        assert!(queue.wait_idle(WAIT));
        assert!(queue.maybe_prefetch(1));
        assert!(queue.wait_idle(WAIT));
        assert!(queue.maybe_prefetch(3));
        assert!(queue.wait_idle(WAIT));

        assert_eq!(ids(&queue), vec!["t1", "t2", "r1", "r2", "r3"]);
        assert_eq!(queue.topic().as_deref(), Some("Basalt"));
        assert_eq!(source.topic_calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.random_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn topic_requested_mid_fetch_runs_afterwards() {
        let source = Arc::new(
            ScriptedSource::default()
                .random(Ok(cards(&["a"])))
                .topic(Ok(cards(&["t1", "t2"])))
                .hold(),
        );
        let queue = queue_with(source.clone(), Arc::new(RecordingCache::default()));

        queue.initialize();
        queue.enable_topic("Aurora");
        assert_eq!(source.topic_calls.load(Ordering::SeqCst), 0);

        source.release();
        let deadline = Instant::now() + WAIT;
        while ids(&queue).len() < 3 && Instant::now() < deadline {
            queue.wait_idle(Duration::from_millis(50));
        }
        assert_eq!(ids(&queue), vec!["a", "t1", "t2"]);
        assert_eq!(source.topic_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_discards_everything_and_ignores_stale_results() {
        let source = Arc::new(
            ScriptedSource::default()
                .random(Ok(cards(&["n1", "n2"])))
                .hold(),
        );
        let cache = Arc::new(RecordingCache::default());
        cache.stored.lock().extend(cards(&["old"]));
        let queue = queue_with(source.clone(), cache.clone());
        assert_eq!(ids(&queue), vec!["old"]);

        queue.enable_topic("Fjord");
        queue.refresh();
        assert_eq!(queue.topic(), None);
        assert!(queue.snapshot().is_empty());
        assert_eq!(cache.clears.load(Ordering::SeqCst), 1);

        source.release();
        assert!(queue.wait_idle(WAIT));
        // the cancelled topic fetch must not leave an error behind
        thread::sleep(Duration::from_millis(20));
        let snapshot = queue.snapshot();
        assert_eq!(ids(&queue), vec!["n1", "n2"]);
        assert_eq!(snapshot.error, None);
    }

    #[test]
    fn cached_cards_are_restored() {
        let cache = Arc::new(RecordingCache::default());
        cache.stored.lock().extend(cards(&["a", "b"]));
        let source = Arc::new(ScriptedSource::default());
        let queue = queue_with(source.clone(), cache);

        assert_eq!(FeedSource::len(&queue), 2);
        assert!(!queue.initialize());
        assert_eq!(FeedSource::card(&queue, 1).map(|c| c.id), Some("b".into()));
        assert_eq!(source.random_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn initialize_fetches_first_batch() {
        let queue = FeedQueue::new(
            Arc::new(MockContentSource::new()),
            Arc::new(NoCache),
            QueueOptions::default(),
        );
        assert!(queue.initialize());
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(queue.snapshot().len(), 10);
        assert!(!queue.initialize());
    }

    #[test]
    fn prefetch_only_near_the_end() {
        let queue = FeedQueue::new(
            Arc::new(MockContentSource::new()),
            Arc::new(NoCache),
            QueueOptions::default(),
        );
        queue.initialize();
        queue.wait_idle(Duration::from_secs(5));

        assert!(!queue.maybe_prefetch(5));
        assert!(queue.maybe_prefetch(6));
        queue.wait_idle(Duration::from_secs(5));
        assert_eq!(queue.snapshot().len(), 20);
    }

    #[test]
    fn subscribers_get_replayed_state() {
        let queue = FeedQueue::new(
            Arc::new(MockContentSource::new()),
            Arc::new(NoCache),
            QueueOptions::default(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = queue.subscribe(move |snapshot| sink.lock().push(snapshot.clone()));
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].is_empty());

        queue.initialize();
        queue.wait_idle(Duration::from_secs(5));
        let deliveries = seen.lock().clone();
        assert!(deliveries.iter().any(|s| s.is_loading));
        let latest = deliveries.iter().max_by_key(|s| s.version).unwrap();
        assert_eq!(latest.len(), 10);
        assert!(!latest.is_loading);

        queue.unsubscribe(id);
        let count = seen.lock().len();
        queue.disable_topic();
        queue.enable_topic("Comet");
        queue.wait_idle(Duration::from_secs(5));
        assert_eq!(seen.lock().len(), count);
    }
}
