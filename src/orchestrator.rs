use crate::classify::{matches_force_include, Classifier};
use crate::config::PipelineConfig;
use crate::dedup::TieredDedupStore;
use crate::fetcher::FeedFetcher;
use crate::publish::{notify_best_effort, ContentStore, Notifier};
use crate::synthesize::Synthesizer;
use crate::types::{CandidateItem, Result, RunSummary, ScreenedItem, Verdict};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// One end-to-end run: fetch, dedup, classify, synthesize, publish. Items
/// are processed sequentially so the daily target and run deadline can stop
/// the loop between items, and so dedup keys for an item are recorded
/// before the next item is considered.
pub struct Pipeline {
    config: PipelineConfig,
    fetcher: FeedFetcher,
    dedup: TieredDedupStore,
    classifier: Classifier,
    synthesizer: Synthesizer,
    store: Arc<dyn ContentStore>,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: FeedFetcher,
        dedup: TieredDedupStore,
        classifier: Classifier,
        synthesizer: Synthesizer,
        store: Arc<dyn ContentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            fetcher,
            dedup,
            classifier,
            synthesizer,
            store,
            notifier,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let feeds = self.config.select_feeds();
        info!("Starting run over {} feeds", feeds.len());

        let items = self.fetcher.fetch_all(&feeds).await;
        Ok(self.process_items(items).await)
    }

    /// The post-fetch half of a run, separated so it can be driven with
    /// synthetic items.
    pub async fn process_items(&self, items: Vec<CandidateItem>) -> RunSummary {
        let mut summary = RunSummary::new();
        let started = Instant::now();

        // Keyword-allow-listed items are exempt from dedup; their slugs get
        // a timestamp suffix downstream instead.
        let (forced, normal): (Vec<CandidateItem>, Vec<CandidateItem>) =
            items.into_iter().partition(|item| {
                matches_force_include(&self.config.classification.force_include_keywords, item)
            });
        if !forced.is_empty() {
            info!("{} items bypass dedup via force-include", forced.len());
        }

        let mut screened: Vec<ScreenedItem> = forced
            .into_iter()
            .map(|item| ScreenedItem {
                item,
                fingerprint: None,
            })
            .collect();
        screened.extend(self.dedup.filter_new(normal).await);
        info!("{} items to screen after dedup", screened.len());

        for screened_item in screened {
            if summary.published >= self.config.daily_target {
                info!(
                    "Daily target of {} reached, stopping",
                    self.config.daily_target
                );
                break;
            }
            if started.elapsed() >= self.config.run_deadline {
                warn!("Run deadline exceeded, stopping");
                break;
            }

            summary.processed += 1;
            let item = &screened_item.item;

            let outcome = self.classifier.classify(item).await;
            if outcome.verdict == Verdict::Rejected {
                continue;
            }

            let record = self.synthesizer.synthesize(item, outcome.forced).await;
            if !record.has_mandatory_fields() {
                warn!("Skipping '{}': record missing mandatory fields", item.title);
                continue;
            }

            match self.store.create(&record).await {
                Ok(_) => {
                    // Dedup keys are written only after a successful create,
                    // so a failed publish stays retryable on the next run.
                    self.dedup.record(item, screened_item.fingerprint).await;
                    summary.published += 1;
                    summary.published_titles.push(record.title_en.clone());
                    notify_best_effort(
                        self.notifier.article_published(&record),
                        "Article",
                    )
                    .await;
                }
                Err(e) => {
                    warn!("Publish failed for '{}': {}", item.title, e);
                }
            }
        }

        notify_best_effort(self.notifier.run_finished(&summary), "Run summary").await;
        info!(
            "Run {} finished: {} processed, {} published",
            summary.run_id, summary.processed, summary.published
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, FetchConfig};
    use crate::fingerprint::Fingerprinter;
    use crate::judge::MockJudge;
    use crate::publish::{MemoryContentStore, MemoryNotifier};
    use crate::dedup::{MemoryDedupBackend, MemoryKvCache};

    fn test_config(daily_target: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.daily_target = daily_target;
        config.classification.stage1_models = vec!["triage".to_string()];
        config.classification.stage2_models = vec!["deep".to_string()];
        config.synthesis.generation_models = vec!["gen".to_string()];
        config
    }

    fn pipeline_from(
        config: PipelineConfig,
        judge: Arc<MockJudge>,
        store: Arc<MemoryContentStore>,
        notifier: Arc<MemoryNotifier>,
        backend: Arc<MemoryDedupBackend>,
    ) -> Pipeline {
        let dedup = TieredDedupStore::new(
            Arc::new(MemoryKvCache::new()),
            backend,
            Arc::new(Fingerprinter::new(None)),
            DedupConfig::default(),
        );
        let classifier = Classifier::new(judge.clone(), config.classification.clone());
        let synthesizer = Synthesizer::new(judge, config.synthesis.clone());

        Pipeline::new(
            config,
            FeedFetcher::new(FetchConfig::default()),
            dedup,
            classifier,
            synthesizer,
            store,
            notifier,
        )
    }

    fn pipeline(
        judge: Arc<MockJudge>,
        store: Arc<MemoryContentStore>,
        notifier: Arc<MemoryNotifier>,
        backend: Arc<MemoryDedupBackend>,
        daily_target: usize,
    ) -> Pipeline {
        pipeline_from(test_config(daily_target), judge, store, notifier, backend)
    }

    fn items(n: usize) -> Vec<CandidateItem> {
        (0..n)
            .map(|i| {
                CandidateItem::new(
                    "https://feed.example/rss",
                    format!("Relevant Model Story {}", i),
                    format!("https://a.example/{}", i),
                    "A relevant summary.",
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn daily_target_stops_the_loop() {
        let judge = Arc::new(MockJudge::with_default(
            r#"{"relevant": true, "confidence": 0.9}"#,
        ));
        let store = Arc::new(MemoryContentStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let backend = Arc::new(MemoryDedupBackend::new());
        let pipeline = pipeline(judge, store.clone(), notifier, backend, 5);

        let summary = pipeline.process_items(items(8)).await;
        assert_eq!(summary.published, 5);
        assert_eq!(store.created_count(), 5);
    }

    #[tokio::test]
    async fn failed_publish_records_no_dedup_keys() {
        let judge = Arc::new(MockJudge::with_default(
            r#"{"relevant": true, "confidence": 0.9}"#,
        ));
        let store = Arc::new(MemoryContentStore::new());
        store.set_fail_creates(true);
        let notifier = Arc::new(MemoryNotifier::new());
        let backend = Arc::new(MemoryDedupBackend::new());
        let pipeline = pipeline(judge, store, notifier, backend.clone(), 5);

        let summary = pipeline.process_items(items(1)).await;
        assert_eq!(summary.published, 0);
        assert_eq!(summary.processed, 1);
        assert_eq!(backend.record_count(), 0);
    }

    #[tokio::test]
    async fn expired_deadline_stops_the_loop_but_still_summarizes() {
        let judge = Arc::new(MockJudge::with_default(
            r#"{"relevant": true, "confidence": 0.9}"#,
        ));
        let store = Arc::new(MemoryContentStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let backend = Arc::new(MemoryDedupBackend::new());

        let mut config = test_config(5);
        config.run_deadline = std::time::Duration::ZERO;
        let pipeline = pipeline_from(
            config,
            judge.clone(),
            store.clone(),
            notifier.clone(),
            backend,
        );

        let summary = pipeline.process_items(items(4)).await;
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.published, 0);
        assert_eq!(store.created_count(), 0);
        assert_eq!(judge.calls("triage"), 0);
        // The run still completes with an aggregate notification.
        assert_eq!(notifier.summary_messages().len(), 1);
        assert_eq!(notifier.summary_messages()[0], "processed=0 published=0");
    }

    #[tokio::test]
    async fn rejected_items_are_processed_but_not_published() {
        let judge = Arc::new(MockJudge::with_default(
            r#"{"relevant": false, "confidence": 0.9}"#,
        ));
        let store = Arc::new(MemoryContentStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let backend = Arc::new(MemoryDedupBackend::new());
        let pipeline = pipeline(judge, store.clone(), notifier.clone(), backend, 5);

        let summary = pipeline.process_items(items(3)).await;
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.published, 0);
        assert_eq!(store.created_count(), 0);
        // The run summary still goes out.
        assert_eq!(notifier.summary_messages().len(), 1);
    }
}
