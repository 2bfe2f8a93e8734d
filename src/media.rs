use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::ImageFormat;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::card::Card;
use crate::error::FetchError;
use crate::net::{CancelToken, ResilientFetcher};
use crate::swapper::{Asset, BufferId, MediaSurface};

pub use crate::swapper::LoadedAssets;

pub type Rgb = (u8, u8, u8);

/// Full-bleed backdrop behind a card.
#[derive(Debug, Clone, PartialEq)]
pub struct Background {
    pub key: String,
    pub top: Rgb,
    pub bottom: Rgb,
}

impl Background {
    pub fn gradient(top: Rgb, bottom: Rgb) -> Self {
        Self {
            key: format!("gradient:{}:{}", hex(top), hex(bottom)),
            top,
            bottom,
        }
    }

    /// Colour at `fraction` of the height, 0.0 being the top row.
    pub fn at(&self, fraction: f32) -> Rgb {
        let t = fraction.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
        (
            mix(self.top.0, self.bottom.0),
            mix(self.top.1, self.bottom.1),
            mix(self.top.2, self.bottom.2),
        )
    }
}

impl Asset for Background {
    fn url(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Illustration {
    pub url: String,
}

impl Asset for Illustration {
    fn url(&self) -> &str {
        &self.url
    }
}

/// Blends two colours by the opacity of each layer over black.
pub fn blend(a: Rgb, a_opacity: f32, b: Rgb, b_opacity: f32) -> Rgb {
    let channel = |x: u8, y: u8| {
        let value = x as f32 * a_opacity.clamp(0.0, 1.0) + y as f32 * b_opacity.clamp(0.0, 1.0);
        value.round().clamp(0.0, 255.0) as u8
    };
    (channel(a.0, b.0), channel(a.1, b.1), channel(a.2, b.2))
}

fn hex(rgb: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb.0, rgb.1, rgb.2)
}

pub fn parse_hex(raw: &str) -> Option<Rgb> {
    let digits = raw.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&digits[range], 16).ok();
    Some((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundPalette {
    choices: Vec<Background>,
}

impl BackgroundPalette {
    /// Parses `"#top,#bottom"` entries. Malformed entries are skipped.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> Self {
        let choices = pairs
            .iter()
            .filter_map(|pair| {
                let (top, bottom) = pair.as_ref().split_once(',')?;
                Some(Background::gradient(parse_hex(top)?, parse_hex(bottom)?))
            })
            .collect::<Vec<_>>();
        if choices.is_empty() {
            return Self::default();
        }
        Self { choices }
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    pub fn pick(&self) -> Background {
        let mut rng = rand::thread_rng();
        self.choices
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| Background::gradient((16, 24, 48), (0, 0, 0)))
    }
}

pub const DEFAULT_PALETTE: [&str; 6] = [
    "#1d2b53,#000000",
    "#3a1c71,#0b0b16",
    "#0f3443,#02110f",
    "#41295a,#2f0743",
    "#232526,#0e0e0e",
    "#134e5e,#071f1a",
];

impl Default for BackgroundPalette {
    fn default() -> Self {
        Self {
            choices: DEFAULT_PALETTE
                .iter()
                .filter_map(|pair| {
                    let (top, bottom) = pair.split_once(',')?;
                    Some(Background::gradient(parse_hex(top)?, parse_hex(bottom)?))
                })
                .collect(),
        }
    }
}

/// Session-long card id to asset mapping. `None` is remembered too, so a
/// card without media is not re-examined on every frame.
#[derive(Debug)]
pub struct AssetAssignments<A> {
    assigned: HashMap<String, Option<A>>,
}

impl<A: Clone> Default for AssetAssignments<A> {
    fn default() -> Self {
        Self {
            assigned: HashMap::new(),
        }
    }
}

impl<A: Clone> AssetAssignments<A> {
    pub fn get_or_assign(&mut self, card: &Card, assign: impl FnOnce(&Card) -> Option<A>) -> Option<A> {
        self.assigned
            .entry(card.id.clone())
            .or_insert_with(|| assign(card))
            .clone()
    }

    pub fn get(&self, card_id: &str) -> Option<&A> {
        self.assigned.get(card_id).and_then(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }

    pub fn clear(&mut self) {
        self.assigned.clear();
    }
}

pub fn illustration_for(card: &Card) -> Option<Illustration> {
    card.thumbnail
        .as_ref()
        .filter(|url| !url.is_empty())
        .map(|url| Illustration { url: url.clone() })
}

/// Backgrounds are generated, never fetched, so they are ready as soon as
/// they are requested.
#[derive(Debug, Default)]
pub struct ImmediateSurface {
    ready: Vec<(BufferId, String)>,
}

impl ImmediateSurface {
    pub fn drain(&mut self) -> Vec<(BufferId, String)> {
        std::mem::take(&mut self.ready)
    }
}

impl MediaSurface<Background> for ImmediateSurface {
    fn load(&mut self, buffer: BufferId, asset: &Background) {
        self.ready.push((buffer, asset.key.clone()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub mime: &'static str,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(ImageInfo),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadEvent {
    pub buffer: BufferId,
    pub url: String,
    pub outcome: LoadOutcome,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub workers: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

struct Job {
    buffer: BufferId,
    url: String,
}

/// Downloads illustrations on a few worker threads and reports completions
/// on [`Loader::events`].
pub struct Loader {
    jobs: Option<Sender<Job>>,
    events: Receiver<LoadEvent>,
    cancel: CancelToken,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Loader {
    pub fn new(fetcher: Arc<ResilientFetcher>, cfg: LoaderConfig) -> Result<Self> {
        let workers = if cfg.workers == 0 { 2 } else { cfg.workers };
        let (job_tx, job_rx) = unbounded::<Job>();
        let (event_tx, event_rx) = unbounded();
        let cancel = CancelToken::new();

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let jobs = job_rx.clone();
            let events = event_tx.clone();
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("media-{n}"))
                .spawn(move || worker(&fetcher, &cancel, jobs, events))
                .context("media: spawn worker")?;
            handles.push(handle);
        }

        Ok(Self {
            jobs: Some(job_tx),
            events: event_rx,
            cancel,
            handles,
        })
    }

    pub fn events(&self) -> &Receiver<LoadEvent> {
        &self.events
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        self.jobs.take();
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MediaSurface<Illustration> for Loader {
    fn load(&mut self, buffer: BufferId, asset: &Illustration) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        let _ = jobs.send(Job {
            buffer,
            url: asset.url.clone(),
        });
    }
}

fn worker(
    fetcher: &ResilientFetcher,
    cancel: &CancelToken,
    jobs: Receiver<Job>,
    events: Sender<LoadEvent>,
) {
    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        let outcome = match download(fetcher, &job.url, cancel) {
            Ok(info) => {
                debug!(url = %job.url, mime = info.mime, bytes = info.size_bytes, "illustration loaded");
                LoadOutcome::Loaded(info)
            }
            Err(FetchError::Cancelled) => break,
            Err(err) => {
                warn!(url = %job.url, error = %err, "illustration failed");
                LoadOutcome::Failed(err.to_string())
            }
        };
        let event = LoadEvent {
            buffer: job.buffer,
            url: job.url,
            outcome,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

fn download(fetcher: &ResilientFetcher, url: &str, cancel: &CancelToken) -> Result<ImageInfo, FetchError> {
    let response = fetcher.get(url, Some(cancel))?.error_for_status()?;
    let mime = detect_mime(&response.body)
        .ok_or_else(|| FetchError::Decode(format!("{url} is not a supported image")))?;
    Ok(ImageInfo {
        mime,
        size_bytes: response.body.len(),
    })
}

fn detect_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{fetcher, ScriptedTransport};
    use std::time::Duration;

    const GIF_HEADER: &str = "GIF89a\x01\0\x01\0";

    #[test]
    fn palette_parses_and_skips_garbage() {
        let palette = BackgroundPalette::from_pairs(&["#ff0000,#000000", "nope", "#12345,#000000"]);
        assert_eq!(palette.len(), 1);
        assert_eq!(palette.pick().top, (255, 0, 0));

        let fallback = BackgroundPalette::from_pairs::<&str>(&[]);
        assert_eq!(fallback.len(), DEFAULT_PALETTE.len());
    }

    #[test]
    fn gradient_interpolates() {
        let bg = Background::gradient((0, 0, 0), (200, 100, 50));
        assert_eq!(bg.at(0.0), (0, 0, 0));
        assert_eq!(bg.at(0.5), (100, 50, 25));
        assert_eq!(bg.at(2.0), (200, 100, 50));
        assert_eq!(bg.key, "gradient:#000000:#c86432");
    }

    #[test]
    fn blend_weights_layers() {
        assert_eq!(blend((200, 0, 0), 1.0, (0, 200, 0), 0.0), (200, 0, 0));
        assert_eq!(blend((200, 0, 0), 0.5, (0, 200, 0), 0.5), (100, 100, 0));
    }

    #[test]
    fn assignments_are_sticky() {
        let card = Card {
            id: "en:1".into(),
            title: "T".into(),
            body: String::new(),
            link: String::new(),
            thumbnail: Some("https://img/1.png".into()),
            attribution: None,
            fetched_at: chrono::Utc::now(),
        };
        let mut assignments = AssetAssignments::default();
        let first = assignments.get_or_assign(&card, illustration_for);
        let second = assignments.get_or_assign(&card, |_| None);
        assert_eq!(first, second);
        assert_eq!(assignments.get("en:1").map(|i| i.url.as_str()), Some("https://img/1.png"));

        let bare = Card { id: "en:2".into(), thumbnail: None, ..card };
        assert_eq!(assignments.get_or_assign(&bare, illustration_for), None);
        assert_eq!(assignments.len(), 2);
    }

    #[test]
    fn loader_reports_outcomes() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("good.gif", 200, GIF_HEADER);
        transport.respond("missing.png", 404, "");
        let mut loader = Loader::new(Arc::new(fetcher(transport, 0)), LoaderConfig { workers: 1 })
            .expect("loader");

        loader.load(BufferId::B, &Illustration { url: "https://img/missing.png".into() });
        loader.load(BufferId::A, &Illustration { url: "https://img/good.gif".into() });

        let mut events = Vec::new();
        for _ in 0..2 {
            events.push(loader.events().recv_timeout(Duration::from_secs(5)).expect("event"));
        }
        events.sort_by_key(|e| e.url.clone());

        assert_eq!(events[0].buffer, BufferId::A);
        assert!(matches!(&events[0].outcome, LoadOutcome::Loaded(info) if info.mime == "image/gif"));
        assert_eq!(events[1].buffer, BufferId::B);
        assert!(matches!(events[1].outcome, LoadOutcome::Failed(_)));
    }

    #[test]
    fn immediate_surface_acknowledges_everything() {
        let mut surface = ImmediateSurface::default();
        let bg = Background::gradient((1, 2, 3), (4, 5, 6));
        surface.load(BufferId::B, &bg);
        assert_eq!(surface.drain(), vec![(BufferId::B, bg.key.clone())]);
        assert!(surface.drain().is_empty());
    }
}
