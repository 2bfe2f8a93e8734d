use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::media::{BackgroundPalette, DEFAULT_PALETTE};
use crate::net::{NetworkStatus, RetryPolicy, DEFAULT_OFFLINE_RECHECK};
use crate::queue::QueueOptions;
use crate::source::WikipediaConfig;
use crate::storage;
use crate::virtualizer::VirtualizerConfig;

const DEFAULT_ENV_PREFIX: &str = "WIKIFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ui: UIConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            base_url: None,
            user_agent: default_user_agent(),
        }
    }
}

impl SourceConfig {
    pub fn wikipedia(&self) -> WikipediaConfig {
        WikipediaConfig {
            lang: self.lang.clone(),
            base_url: self.base_url.clone().filter(|url| !url.trim().is_empty()),
        }
    }
}

fn default_lang() -> String {
    "en".into()
}

fn default_user_agent() -> String {
    format!(
        "wikifeed/{} (terminal card reader)",
        env!("CARGO_PKG_VERSION")
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// How long requests are refused after the network was found unreachable.
    #[serde(default = "default_offline_recheck", with = "humantime_serde")]
    pub offline_recheck: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            offline_recheck: default_offline_recheck(),
        }
    }
}

impl NetworkConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout,
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay.max(self.base_delay),
        }
    }

    pub fn network_status(&self) -> NetworkStatus {
        NetworkStatus::with_recheck(self.offline_recheck)
    }
}

fn default_timeout() -> Duration {
    RetryPolicy::default().timeout
}

fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}

fn default_base_delay() -> Duration {
    RetryPolicy::default().base_delay
}

fn default_max_delay() -> Duration {
    RetryPolicy::default().max_delay
}

fn default_offline_recheck() -> Duration {
    DEFAULT_OFFLINE_RECHECK
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_prefetch_threshold")]
    pub prefetch_threshold: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            prefetch_threshold: default_prefetch_threshold(),
        }
    }
}

impl FeedConfig {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            batch_size: self.batch_size.max(1),
            prefetch_threshold: self.prefetch_threshold,
        }
    }
}

fn default_batch_size() -> usize {
    QueueOptions::default().batch_size
}

fn default_prefetch_threshold() -> usize {
    QueueOptions::default().prefetch_threshold
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_cards")]
    pub max_cards: usize,
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            path: None,
            max_cards: default_max_cards(),
            ttl: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn store_options(&self) -> storage::Options {
        storage::Options {
            path: self.path.clone(),
            max_cards: self.max_cards,
            ttl: self.ttl,
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_cards() -> usize {
    storage::Options::default().max_cards
}

fn default_cache_ttl() -> Duration {
    storage::Options::default().ttl
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_settle_debounce", with = "humantime_serde")]
    pub settle_debounce: Duration,
    #[serde(default = "default_dead_zone")]
    pub dead_zone: f32,
    /// `"#top,#bottom"` gradient pairs.
    #[serde(default = "default_palette")]
    pub palette: Vec<String>,
    #[serde(default = "default_media_workers")]
    pub media_workers: usize,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            settle_debounce: default_settle_debounce(),
            dead_zone: default_dead_zone(),
            palette: default_palette(),
            media_workers: default_media_workers(),
        }
    }
}

impl UIConfig {
    pub fn virtualizer(&self) -> VirtualizerConfig {
        VirtualizerConfig {
            settle_debounce: self.settle_debounce,
            dead_zone: self.dead_zone.max(0.0),
            ..VirtualizerConfig::default()
        }
    }

    pub fn background_palette(&self) -> BackgroundPalette {
        let palette = BackgroundPalette::from_pairs(&self.palette);
        if palette.len() < self.palette.len() {
            warn!(
                configured = self.palette.len(),
                usable = palette.len(),
                "ignoring malformed palette entries"
            );
        }
        palette
    }
}

fn default_settle_debounce() -> Duration {
    VirtualizerConfig::default().settle_debounce
}

fn default_dead_zone() -> f32 {
    VirtualizerConfig::default().dead_zone
}

fn default_palette() -> Vec<String> {
    DEFAULT_PALETTE.iter().map(|pair| pair.to_string()).collect()
}

fn default_media_workers() -> usize {
    2
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

/// Defaults, then the config file (explicit or default location), then
/// `<PREFIX>_<SECTION>__<KEY>` environment overrides.
pub fn load(options: LoadOptions) -> Result<Config> {
    let path = options.config_file.clone().or_else(default_config_path);
    let mut cfg = match path {
        Some(path) if path.exists() => read_config_file(&path)?,
        _ => Config::default(),
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix, env::vars());
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(&data).with_context(|| format!("config: parse {}", path.display()))
}

fn apply_env<I>(cfg: &mut Config, prefix: &str, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    for (key, value) in vars {
        let Some(stripped) = key.strip_prefix(&upper_prefix) else {
            continue;
        };
        let normalized = stripped.to_ascii_lowercase().replace("__", ".");
        if !apply_env_value(cfg, &normalized, &value) {
            warn!(key = %key, "ignoring unrecognised or malformed config override");
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: &str) -> bool {
    fn set<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
        match value.trim().parse() {
            Ok(parsed) => {
                *slot = parsed;
                true
            }
            Err(_) => false,
        }
    }
    fn set_duration(slot: &mut Duration, value: &str) -> bool {
        match humantime::parse_duration(value.trim()) {
            Ok(parsed) => {
                *slot = parsed;
                true
            }
            Err(_) => false,
        }
    }

    match key {
        "source.lang" => cfg.source.lang = value.trim().to_string(),
        "source.base_url" => cfg.source.base_url = Some(value.trim().to_string()),
        "source.user_agent" => cfg.source.user_agent = value.to_string(),
        "network.timeout" => return set_duration(&mut cfg.network.timeout, value),
        "network.max_retries" => return set(&mut cfg.network.max_retries, value),
        "network.base_delay" => return set_duration(&mut cfg.network.base_delay, value),
        "network.max_delay" => return set_duration(&mut cfg.network.max_delay, value),
        "network.offline_recheck" => {
            return set_duration(&mut cfg.network.offline_recheck, value)
        }
        "feed.batch_size" => return set(&mut cfg.feed.batch_size, value),
        "feed.prefetch_threshold" => return set(&mut cfg.feed.prefetch_threshold, value),
        "cache.enabled" => {
            cfg.cache.enabled = matches!(value.trim(), "1" | "true" | "TRUE" | "True")
        }
        "cache.path" => cfg.cache.path = Some(PathBuf::from(value)),
        "cache.max_cards" => return set(&mut cfg.cache.max_cards, value),
        "cache.ttl" => return set_duration(&mut cfg.cache.ttl, value),
        "ui.settle_debounce" => return set_duration(&mut cfg.ui.settle_debounce, value),
        "ui.dead_zone" => return set(&mut cfg.ui.dead_zone, value),
        "ui.palette" => {
            cfg.ui.palette = value
                .split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "ui.media_workers" => return set(&mut cfg.ui.media_workers, value),
        // the log filter is read by the binary directly
        "log" | "log_file" => {}
        _ => return false,
    }
    true
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wikifeed").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("absent.yaml")),
            env_prefix: Some("WIKIFEED_TEST_ABSENT".into()),
        })
        .unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.feed.batch_size, 10);
        assert_eq!(cfg.feed.prefetch_threshold, 3);
        assert_eq!(cfg.ui.settle_debounce, Duration::from_millis(160));
    }

    #[test]
    fn file_values_fill_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "source:\n  lang: de\nnetwork:\n  timeout: 2s\n  max_retries: 1\ncache:\n  ttl: 1h\n",
        )
        .unwrap();

        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("WIKIFEED_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.source.lang, "de");
        assert_eq!(cfg.network.timeout, Duration::from_secs(2));
        assert_eq!(cfg.network.max_retries, 1);
        assert_eq!(cfg.network.base_delay, Duration::from_millis(500));
        assert_eq!(cfg.cache.ttl, Duration::from_secs(3600));
        assert_eq!(cfg.cache.max_cards, 200);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "network: [unterminated").unwrap();
        let err = load(LoadOptions {
            config_file: Some(path),
            env_prefix: None,
        })
        .unwrap_err();
        assert!(err.to_string().starts_with("config: parse"));
    }

    #[test]
    fn env_overrides_apply_per_key() {
        let mut cfg = Config::default();
        apply_env(
            &mut cfg,
            "wikifeed",
            vars(&[
                ("WIKIFEED_FEED__BATCH_SIZE", "4"),
                ("WIKIFEED_NETWORK__MAX_DELAY", "5s"),
                ("WIKIFEED_NETWORK__OFFLINE_RECHECK", "1m"),
                ("WIKIFEED_UI__PALETTE", "#000000,#ffffff; #ff0000,#00ff00"),
                ("WIKIFEED_CACHE__ENABLED", "false"),
                ("WIKIFEED_FEED__PREFETCH_THRESHOLD", "lots"),
                ("OTHER_FEED__BATCH_SIZE", "99"),
            ]),
        );
        assert_eq!(cfg.feed.batch_size, 4);
        assert_eq!(cfg.feed.prefetch_threshold, 3);
        assert_eq!(cfg.network.max_delay, Duration::from_secs(5));
        assert_eq!(cfg.network.offline_recheck, Duration::from_secs(60));
        assert_eq!(cfg.ui.palette.len(), 2);
        assert_eq!(cfg.ui.background_palette().len(), 2);
        assert!(!cfg.cache.enabled);
    }

    #[test]
    fn sections_convert_to_component_options() {
        let mut cfg = Config::default();
        cfg.network.base_delay = Duration::from_secs(10);
        cfg.network.max_delay = Duration::from_secs(1);
        assert_eq!(cfg.network.retry_policy().max_delay, Duration::from_secs(10));

        cfg.feed.batch_size = 0;
        assert_eq!(cfg.feed.queue_options().batch_size, 1);

        cfg.source.base_url = Some("  ".into());
        assert_eq!(cfg.source.wikipedia().base_url, None);

        cfg.ui.dead_zone = 4.0;
        assert_eq!(cfg.ui.virtualizer().dead_zone, 4.0);
        assert_eq!(cfg.ui.virtualizer().slot_extent, 100.0);
    }
}
