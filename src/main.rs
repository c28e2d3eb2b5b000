use clap::Parser;
use newsflow::config::{AppConfig, PipelineConfig};
use newsflow::dedup::{
    DedupBackend, KvCache, MemoryKvCache, NullDedupBackend, PgDedupBackend, TieredDedupStore,
};
use newsflow::fetcher::FeedFetcher;
use newsflow::fingerprint::Fingerprinter;
use newsflow::judge::{JudgeChain, OpenRouterJudge};
use newsflow::orchestrator::Pipeline;
use newsflow::publish::{
    ContentStore, MemoryContentStore, Notifier, NullNotifier, PayloadContentStore,
    TelegramNotifier,
};
use newsflow::synthesize::Synthesizer;
use newsflow::Classifier;
use std::sync::Arc;
use tracing::{info, warn};

/// Bilingual AI-news ingestion pipeline: fetch feeds, screen and dedup
/// items, synthesize bilingual articles, publish them once.
#[derive(Parser, Debug)]
#[command(name = "newsflow", version)]
struct Cli {
    /// Feed URL to fetch; repeatable. Overrides the built-in feed list.
    #[arg(long = "feed")]
    feeds: Vec<String>,

    /// Stop after publishing this many items.
    #[arg(long)]
    daily_target: Option<usize>,

    /// Run the full pipeline but keep published records in memory.
    #[arg(long)]
    dry_run: bool,

    /// Repeat the run every N seconds instead of exiting after one.
    #[arg(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let app = AppConfig::from_env()?;

    let mut config = PipelineConfig::default();
    if !cli.feeds.is_empty() {
        config.feeds = cli.feeds.clone();
    }
    if let Some(target) = cli.daily_target.or(app.daily_target) {
        config.daily_target = target;
    }

    info!(
        "Starting newsflow: {} feeds, daily target {}",
        config.feeds.len(),
        config.daily_target
    );

    let judge = Arc::new(OpenRouterJudge::new(app.openrouter_api_key.clone()));

    let keyword_chain = JudgeChain::new(
        judge.clone(),
        config.synthesis.keyword_models.clone(),
        config.synthesis.keyword_max_tokens,
    );
    let fingerprinter = Arc::new(Fingerprinter::new(Some(keyword_chain)));

    let cache: Arc<dyn KvCache> = Arc::new(MemoryKvCache::new());
    let backend: Arc<dyn DedupBackend> = match &app.database_url {
        Some(url) => Arc::new(PgDedupBackend::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set, durable dedup disabled");
            Arc::new(NullDedupBackend)
        }
    };
    let dedup = TieredDedupStore::new(cache, backend, fingerprinter, config.dedup.clone());

    let store: Arc<dyn ContentStore> = if cli.dry_run {
        info!("Dry run: published records stay in memory");
        Arc::new(MemoryContentStore::new())
    } else {
        match &app.payload_endpoint {
            Some(endpoint) => Arc::new(PayloadContentStore::new(
                endpoint.clone(),
                app.payload_token.clone(),
                app.payload_email.clone(),
                app.payload_password.clone(),
            )),
            None => {
                warn!("PAYLOAD_API_ENDPOINT not set, published records stay in memory");
                Arc::new(MemoryContentStore::new())
            }
        }
    };

    let notifier: Arc<dyn Notifier> = match (&app.telegram_bot_token, &app.telegram_channel) {
        (Some(token), Some(channel)) => {
            Arc::new(TelegramNotifier::new(token.clone(), channel.clone()))
        }
        _ => Arc::new(NullNotifier),
    };

    let pipeline = Pipeline::new(
        config.clone(),
        FeedFetcher::new(config.fetch.clone()),
        dedup,
        Classifier::new(judge.clone(), config.classification.clone()),
        Synthesizer::new(judge, config.synthesis.clone()),
        store,
        notifier,
    );

    loop {
        let summary = pipeline.run().await?;
        info!(
            "Run {} complete: {} processed, {} published",
            summary.run_id, summary.processed, summary.published
        );
        for title in &summary.published_titles {
            info!("  published: {}", title);
        }

        match cli.interval {
            Some(seconds) => {
                info!("Sleeping {}s until the next run", seconds);
                tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            }
            None => return Ok(()),
        }
    }
}
