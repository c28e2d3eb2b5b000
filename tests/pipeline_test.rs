use newsflow::classify::Classifier;
use newsflow::config::{DedupConfig, FetchConfig, PipelineConfig};
use newsflow::dedup::{MemoryDedupBackend, MemoryKvCache, TieredDedupStore};
use newsflow::fetcher::FeedFetcher;
use newsflow::fingerprint::Fingerprinter;
use newsflow::judge::MockJudge;
use newsflow::orchestrator::Pipeline;
use newsflow::publish::{MemoryContentStore, MemoryNotifier};
use newsflow::synthesize::Synthesizer;
use newsflow::types::CandidateItem;
use std::sync::Arc;

struct Harness {
    judge: Arc<MockJudge>,
    store: Arc<MemoryContentStore>,
    notifier: Arc<MemoryNotifier>,
    backend: Arc<MemoryDedupBackend>,
    cache: Arc<MemoryKvCache>,
}

impl Harness {
    fn new(judge: MockJudge) -> Self {
        Self {
            judge: Arc::new(judge),
            store: Arc::new(MemoryContentStore::new()),
            notifier: Arc::new(MemoryNotifier::new()),
            backend: Arc::new(MemoryDedupBackend::new()),
            cache: Arc::new(MemoryKvCache::new()),
        }
    }

    /// Builds a pipeline sharing this harness's collaborators, so repeated
    /// builds simulate consecutive runs against the same stores.
    fn pipeline(&self, daily_target: usize) -> Pipeline {
        let mut config = PipelineConfig::default();
        config.daily_target = daily_target;
        config.classification.stage1_models = vec!["triage".to_string()];
        config.classification.stage2_models = vec!["deep".to_string()];
        config.synthesis.generation_models = vec!["gen".to_string()];

        let dedup = TieredDedupStore::new(
            self.cache.clone(),
            self.backend.clone(),
            Arc::new(Fingerprinter::new(None)),
            DedupConfig::default(),
        );

        Pipeline::new(
            config.clone(),
            FeedFetcher::new(FetchConfig::default()),
            dedup,
            Classifier::new(self.judge.clone(), config.classification.clone()),
            Synthesizer::new(self.judge.clone(), config.synthesis.clone()),
            self.store.clone(),
            self.notifier.clone(),
        )
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn item(title: &str, link: &str) -> CandidateItem {
    CandidateItem::new(
        "https://openai.com/blog/rss.xml",
        title,
        link,
        "A relevant machine learning summary.",
    )
}

#[tokio::test]
async fn second_run_publishes_nothing_for_the_same_items() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));

    let items = vec![
        item("First Model Story", "https://a.example/1"),
        item("Second Model Story", "https://a.example/2"),
    ];

    let first = harness.pipeline(10).process_items(items.clone()).await;
    assert_eq!(first.published, 2);

    let second = harness.pipeline(10).process_items(items).await;
    assert_eq!(second.published, 0);
    assert_eq!(harness.store.created_count(), 2);
}

#[tokio::test]
async fn trailing_slash_variants_from_different_feeds_publish_once() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));

    let items = vec![
        CandidateItem::new(
            "https://feed-one.example/rss",
            "Shared Story",
            "https://a.example/story/",
            "summary",
        ),
        CandidateItem::new(
            "https://feed-two.example/rss",
            "Shared Story Again",
            "https://A.example/story",
            "summary",
        ),
    ];

    let summary = harness.pipeline(10).process_items(items).await;
    assert_eq!(summary.published, 1);
}

#[tokio::test]
async fn hot_cache_absorbs_repeats_within_retention() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));

    let first = harness
        .pipeline(10)
        .process_items(vec![item("Cached Story", "https://a.example/1")])
        .await;
    assert_eq!(first.published, 1);

    // Give the detached hot-cache write a chance to land.
    tokio::task::yield_now().await;
    let queries_before = harness.backend.query_calls();

    let second = harness
        .pipeline(10)
        .process_items(vec![item("Cached Story", "https://a.example/1")])
        .await;
    assert_eq!(second.published, 0);
    // The repeat was stopped by the hot cache, not the durable store.
    assert_eq!(harness.backend.query_calls(), queries_before);
}

#[tokio::test]
async fn total_judge_outage_still_publishes_forced_items() {
    init_tracing();
    let harness = Harness::new(MockJudge::failing());

    let items = vec![
        item("NVIDIA Unveils New Accelerator", "https://a.example/1"),
        item("A quiet unrelated update", "https://a.example/2"),
    ];

    let summary = harness.pipeline(10).process_items(items).await;
    // Unforced items fall to stage 2, which is down; the 0.5 default
    // confidence misses the pass bar, so only the forced item lands.
    assert_eq!(summary.published, 1);

    let records = harness.store.records();
    let record = &records[0];
    assert!(record.has_mandatory_fields());
    assert_eq!(record.original_language, "en");
    assert!(record.keywords_zh.len() >= 3);
    assert!(record.keywords_en.len() >= 3);
    assert!(record.slug.starts_with("nvidia-unveils-new-accelerator-"));
    assert!(record.body.contains("https://a.example/1"));
}

#[tokio::test]
async fn identical_forced_items_in_one_run_get_distinct_slugs() {
    init_tracing();
    let harness = Harness::new(MockJudge::failing());

    // "OpenAI" is on the force-include list, so neither copy is deduped.
    let items = vec![
        item("OpenAI Announces New Model", "https://a.example/1"),
        item("OpenAI Announces New Model", "https://a.example/1"),
    ];

    let summary = harness.pipeline(10).process_items(items).await;
    assert_eq!(summary.published, 2);

    let records = harness.store.records();
    assert_ne!(records[0].slug, records[1].slug);
    assert!(records[0].slug.starts_with("openai-announces-new-model-"));
}

#[tokio::test]
async fn durable_store_outage_fails_open_and_publishes() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));
    harness.backend.set_fail_queries(true);

    let summary = harness
        .pipeline(10)
        .process_items(vec![item("Story During Outage", "https://a.example/1")])
        .await;
    assert_eq!(summary.published, 1);
}

#[tokio::test]
async fn high_confidence_items_never_reach_stage_two() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.85}"#,
    ));

    let summary = harness
        .pipeline(10)
        .process_items(vec![
            item("Confident Story One", "https://a.example/1"),
            item("Confident Story Two", "https://a.example/2"),
        ])
        .await;
    assert_eq!(summary.published, 2);
    assert_eq!(harness.judge.calls("triage"), 2);
    assert_eq!(harness.judge.calls("deep"), 0);
}

#[tokio::test]
async fn daily_target_caps_a_run_with_surplus_items() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));

    let items: Vec<CandidateItem> = (0..8)
        .map(|i| {
            item(
                &format!("Surplus Story {}", i),
                &format!("https://a.example/{}", i),
            )
        })
        .collect();

    let summary = harness.pipeline(5).process_items(items).await;
    assert_eq!(summary.published, 5);
    assert_eq!(summary.published_titles.len(), 5);
    assert_eq!(harness.store.created_count(), 5);
}

#[tokio::test]
async fn published_articles_are_announced_and_summarized() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));

    let summary = harness
        .pipeline(10)
        .process_items(vec![
            item("Announced Story", "https://a.example/1"),
            item("Another Announced Story", "https://a.example/2"),
        ])
        .await;

    assert_eq!(summary.published, 2);
    assert_eq!(harness.notifier.article_messages().len(), 2);
    assert_eq!(harness.notifier.summary_messages().len(), 1);
    assert_eq!(
        harness.notifier.summary_messages()[0],
        "processed=2 published=2"
    );
}

#[tokio::test]
async fn failed_publish_is_retryable_on_the_next_run() {
    init_tracing();
    let harness = Harness::new(MockJudge::with_default(
        r#"{"relevant": true, "confidence": 0.9}"#,
    ));

    harness.store.set_fail_creates(true);
    let first = harness
        .pipeline(10)
        .process_items(vec![item("Flaky Publish Story", "https://a.example/1")])
        .await;
    assert_eq!(first.published, 0);

    harness.store.set_fail_creates(false);
    let second = harness
        .pipeline(10)
        .process_items(vec![item("Flaky Publish Story", "https://a.example/1")])
        .await;
    assert_eq!(second.published, 1);
}
