use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::media::{Loader, LoaderConfig};
use crate::net::{Connectivity, HttpTransport, NetworkStatus, ResilientFetcher};
use crate::queue::{CardCache, FeedQueue, NoCache};
use crate::services::CardServices;
use crate::source::{ContentSource, MockContentSource, WikipediaSource};
use crate::storage;
use crate::ui;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use generated cards instead of the network, and skip the card cache.
    pub demo: bool,
    pub config_file: Option<PathBuf>,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: opts.config_file.clone(),
        env_prefix: None,
    })
    .context("app: load config")?;

    let wiring = if opts.demo {
        demo_source()
    } else {
        live_source(&cfg)?
    };
    let cache = open_cache(&cfg, opts.demo);

    let queue = FeedQueue::new(wiring.source, cache, cfg.feed.queue_options());
    queue.initialize();
    info!(demo = opts.demo, lang = %cfg.source.lang, "feed started");

    let mut model = ui::Model::new(ui::Options {
        queue,
        services: Arc::new(CardServices::default()),
        virtualizer: cfg.ui.virtualizer(),
        palette: cfg.ui.background_palette(),
        loader: wiring.loader,
        network: wiring.network.map(|network| network as Arc<dyn Connectivity>),
        status_message: wiring.status,
    });
    model.run()
}

struct Wiring {
    source: Arc<dyn ContentSource>,
    loader: Option<Loader>,
    network: Option<Arc<NetworkStatus>>,
    status: String,
}

fn demo_source() -> Wiring {
    Wiring {
        source: Arc::new(MockContentSource::new()),
        loader: None,
        network: None,
        status: "Demo mode: generated cards, no network.".to_string(),
    }
}

fn live_source(cfg: &Config) -> Result<Wiring> {
    let network = Arc::new(cfg.network.network_status());
    let transport = HttpTransport::new(cfg.source.user_agent.clone(), None)
        .context("app: build http transport")?
        .with_network_status(network.clone());
    let fetcher = Arc::new(ResilientFetcher::new(
        Arc::new(transport),
        network.clone(),
        cfg.network.retry_policy(),
    ));
    let source: Arc<dyn ContentSource> =
        Arc::new(WikipediaSource::new(fetcher.clone(), cfg.source.wikipedia()));

    let loader = match Loader::new(
        fetcher,
        LoaderConfig {
            workers: cfg.ui.media_workers,
        },
    ) {
        Ok(loader) => Some(loader),
        Err(err) => {
            warn!(error = %err, "illustrations disabled");
            None
        }
    };

    Ok(Wiring {
        source,
        loader,
        network: Some(network),
        status: String::new(),
    })
}

/// The cache is an optimisation: any failure to open it degrades to no cache.
fn open_cache(cfg: &Config, demo: bool) -> Arc<dyn CardCache> {
    if demo || !cfg.cache.enabled {
        return Arc::new(NoCache);
    }
    match storage::Store::open(cfg.cache.store_options()) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(error = %reason, "card cache unavailable");
            Arc::new(NoCache)
        }
    }
}
