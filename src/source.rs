use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::card::{card_id, normalize_text, Card, ImageAttribution};
use crate::error::FetchError;
use crate::net::{CancelToken, ResilientFetcher};

const TITLE_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'-')
    .remove(b'.')
    .remove(b'(')
    .remove(b')');

pub trait ContentSource: Send + Sync {
    /// `count` independent random cards. Partial success is success; the call
    /// only fails when every request failed.
    fn fetch_random(&self, count: usize, cancel: &CancelToken) -> Result<Vec<Card>, FetchError>;
    /// Cards related to `anchor_title`. An empty result is not an error.
    fn fetch_by_topic(&self, anchor_title: &str, cancel: &CancelToken)
        -> Result<Vec<Card>, FetchError>;
}

/// Folds per-card outcomes of a batch into one result.
pub fn collect_batch(outcomes: Vec<Result<Card, FetchError>>) -> Result<Vec<Card>, FetchError> {
    if outcomes.is_empty() {
        return Ok(Vec::new());
    }
    let mut cards = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(card) => cards.push(card),
            Err(err) => errors.push(err),
        }
    }
    if !cards.is_empty() {
        if !errors.is_empty() {
            debug!(ok = cards.len(), failed = errors.len(), "partial batch");
        }
        return Ok(cards);
    }
    if errors.iter().all(FetchError::is_offline) {
        return Err(FetchError::Offline);
    }
    if errors.iter().all(|err| matches!(err, FetchError::Cancelled)) {
        return Err(FetchError::Cancelled);
    }
    let last = errors
        .last()
        .map(ToString::to_string)
        .unwrap_or_default();
    Err(FetchError::NoContentAvailable(last))
}

#[derive(Debug, Clone, Default)]
pub struct WikipediaConfig {
    pub lang: String,
    /// Overrides `https://{lang}.wikipedia.org`.
    pub base_url: Option<String>,
}

pub struct WikipediaSource {
    fetcher: Arc<ResilientFetcher>,
    lang: String,
    base_url: String,
}

impl WikipediaSource {
    pub fn new(fetcher: Arc<ResilientFetcher>, config: WikipediaConfig) -> Self {
        let lang = if config.lang.trim().is_empty() {
            "en".to_string()
        } else {
            config.lang.trim().to_string()
        };
        let base_url = config
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| format!("https://{lang}.wikipedia.org"));
        Self {
            fetcher,
            lang,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/api/rest_v1/{}", self.base_url, path)
    }

    fn random_card(&self, cancel: &CancelToken) -> Result<Card, FetchError> {
        let response = self
            .fetcher
            .get(&self.rest_url("page/random/summary"), Some(cancel))?
            .error_for_status()?;
        let summary: Summary = response.json()?;
        let mut card = self.card_from_summary(summary)?;
        self.enrich(&mut card, cancel);
        Ok(card)
    }

    fn card_from_summary(&self, summary: Summary) -> Result<Card, FetchError> {
        summary
            .into_card(&self.lang, &self.base_url)
            .ok_or_else(|| FetchError::Decode("summary without page id".into()))
    }

    /// Best-effort attribution lookup; a failure leaves the field empty.
    fn enrich(&self, card: &mut Card, cancel: &CancelToken) {
        let Some(thumbnail) = card.thumbnail.clone() else {
            return;
        };
        match self.attribution(&thumbnail, cancel) {
            Ok(attribution) => card.attribution = attribution,
            Err(err) => debug!(card = %card.id, error = %err, "attribution lookup failed"),
        }
    }

    fn attribution(
        &self,
        image_url: &str,
        cancel: &CancelToken,
    ) -> Result<Option<ImageAttribution>, FetchError> {
        let Some(file) = file_name_from_image_url(image_url) else {
            return Ok(None);
        };
        let url = Url::parse_with_params(
            &format!("{}/w/api.php", self.base_url),
            &[
                ("action", "query"),
                ("format", "json"),
                ("prop", "imageinfo"),
                ("iiprop", "extmetadata|url"),
                ("titles", &format!("File:{file}")),
            ],
        )
        .map_err(|err| FetchError::Decode(format!("attribution url: {err}")))?;
        let response = self
            .fetcher
            .get(url.as_str(), Some(cancel))?
            .error_for_status()?;
        let info: ImageInfoQuery = response.json()?;
        Ok(info.into_attribution())
    }
}

impl ContentSource for WikipediaSource {
    fn fetch_random(&self, count: usize, cancel: &CancelToken) -> Result<Vec<Card>, FetchError> {
        let outcomes = thread::scope(|scope| {
            let handles: Vec<_> = (0..count)
                .map(|_| scope.spawn(|| self.random_card(cancel)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(FetchError::Transient {
                            status: None,
                            message: "random card worker panicked".into(),
                        })
                    })
                })
                .collect::<Vec<_>>()
        });
        collect_batch(outcomes)
    }

    fn fetch_by_topic(
        &self,
        anchor_title: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<Card>, FetchError> {
        let url = self.rest_url(&format!("page/related/{}", encode_title(anchor_title)));
        let response = self.fetcher.get(&url, Some(cancel))?;
        if response.status == 404 {
            return Ok(Vec::new());
        }
        let related: Related = response.error_for_status()?.json()?;
        let mut cards: Vec<Card> = related
            .pages
            .into_iter()
            .filter_map(|summary| summary.into_card(&self.lang, &self.base_url))
            .collect();
        thread::scope(|scope| {
            for card in cards.iter_mut() {
                scope.spawn(move || self.enrich(card, cancel));
            }
        });
        Ok(cards)
    }
}

pub fn encode_title(title: &str) -> String {
    utf8_percent_encode(&title.trim().replace(' ', "_"), TITLE_SEGMENT).to_string()
}

/// `.../commons/thumb/a/ab/Foo.jpg/320px-Foo.jpg` and `.../commons/a/ab/Foo.jpg` both yield `Foo.jpg`.
pub fn file_name_from_image_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let segments: Vec<&str> = url.path_segments()?.collect();
    let name = match segments.iter().position(|segment| *segment == "thumb") {
        Some(pos) => segments.get(pos + 3)?,
        None => segments.last()?,
    };
    if name.is_empty() {
        return None;
    }
    Some(percent_decode_str(name).decode_utf8_lossy().into_owned())
}

fn strip_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for ch in raw.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    normalize_text(&out)
}

#[derive(Debug, Deserialize)]
struct Summary {
    title: String,
    #[serde(default)]
    titles: Option<Titles>,
    #[serde(default)]
    pageid: Option<i64>,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    extract: Option<String>,
    #[serde(default)]
    thumbnail: Option<ImageRef>,
    #[serde(default)]
    originalimage: Option<ImageRef>,
    #[serde(default)]
    content_urls: Option<ContentUrls>,
}

#[derive(Debug, Deserialize)]
struct Titles {
    #[serde(default)]
    normalized: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    source: String,
}

#[derive(Debug, Deserialize)]
struct ContentUrls {
    #[serde(default)]
    desktop: Option<PageUrls>,
}

#[derive(Debug, Deserialize)]
struct PageUrls {
    page: String,
}

#[derive(Debug, Deserialize)]
struct Related {
    #[serde(default)]
    pages: Vec<Summary>,
}

impl Summary {
    fn into_card(self, default_lang: &str, base_url: &str) -> Option<Card> {
        let page_id = self.pageid?;
        let lang = self
            .lang
            .filter(|lang| !lang.is_empty())
            .unwrap_or_else(|| default_lang.to_string());
        let title = self
            .titles
            .and_then(|titles| titles.normalized)
            .unwrap_or(self.title);
        let link = self
            .content_urls
            .and_then(|urls| urls.desktop)
            .map(|desktop| desktop.page)
            .unwrap_or_else(|| format!("{base_url}/wiki/{}", encode_title(&title)));
        let thumbnail = self
            .thumbnail
            .or(self.originalimage)
            .map(|image| image.source);
        Some(Card {
            id: card_id(&lang, page_id),
            body: normalize_text(self.extract.as_deref().unwrap_or_default()),
            title,
            link,
            thumbnail,
            attribution: None,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct ImageInfoQuery {
    #[serde(default)]
    query: Option<QueryPages>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPages {
    #[serde(default)]
    pages: HashMap<String, ImagePage>,
}

#[derive(Debug, Deserialize, Default)]
struct ImagePage {
    #[serde(default)]
    imageinfo: Vec<ImageInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct ImageInfo {
    #[serde(default)]
    extmetadata: HashMap<String, MetaValue>,
    #[serde(default, rename = "descriptionurl")]
    description_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetaValue {
    value: serde_json::Value,
}

impl ImageInfo {
    fn meta(&self, key: &str) -> Option<String> {
        let value = self.extmetadata.get(key)?;
        let text = match &value.value {
            serde_json::Value::String(text) => strip_markup(text),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };
        (!text.is_empty()).then_some(text)
    }
}

impl ImageInfoQuery {
    fn into_attribution(self) -> Option<ImageAttribution> {
        let info = self
            .query?
            .pages
            .into_values()
            .find_map(|page| page.imageinfo.into_iter().next())?;
        let attribution = ImageAttribution {
            artist: info.meta("Artist"),
            license: info.meta("LicenseShortName"),
            source_url: info.description_url.clone(),
        };
        (!attribution.is_empty()).then_some(attribution)
    }
}

const SAMPLE_TOPICS: [&str; 8] = [
    "Lighthouse",
    "Tardigrade",
    "Aurora",
    "Basalt",
    "Origami",
    "Comet",
    "Mangrove",
    "Fjord",
];

/// Offline source used by `--demo` and tests. Every card gets a fresh id.
#[derive(Default)]
pub struct MockContentSource {
    counter: AtomicUsize,
}

impl MockContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_card(&self, title: &str) -> Card {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Card {
            id: card_id("mock", n as i64),
            title: title.to_string(),
            body: format!(
                "{title} is sample card number {n}. Demo mode shows generated content so the feed can be explored without a network connection."
            ),
            link: format!("https://en.wikipedia.org/wiki/{}", encode_title(title)),
            thumbnail: None,
            attribution: None,
            fetched_at: Utc::now(),
        }
    }
}

impl ContentSource for MockContentSource {
    fn fetch_random(&self, count: usize, cancel: &CancelToken) -> Result<Vec<Card>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let mut rng = rand::thread_rng();
        Ok((0..count)
            .map(|_| {
                let title = SAMPLE_TOPICS.choose(&mut rng).copied().unwrap_or("Sample");
                self.next_card(title)
            })
            .collect())
    }

    fn fetch_by_topic(
        &self,
        anchor_title: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<Card>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok((1..=3)
            .map(|k| self.next_card(&format!("{anchor_title} ({k})")))
            .collect())
    }
}
