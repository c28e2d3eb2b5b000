pub mod classify;
pub mod config;
pub mod dedup;
pub mod fetcher;
pub mod fingerprint;
pub mod judge;
pub mod orchestrator;
pub mod publish;
pub mod synthesize;
pub mod types;

pub use classify::{ClassificationOutcome, Classifier};
pub use config::{AppConfig, PipelineConfig};
pub use dedup::TieredDedupStore;
pub use fetcher::FeedFetcher;
pub use fingerprint::Fingerprinter;
pub use judge::{Judge, JudgeChain, OpenRouterJudge};
pub use orchestrator::Pipeline;
pub use publish::{ContentStore, Notifier, PayloadContentStore, TelegramNotifier};
pub use synthesize::Synthesizer;
pub use types::*;
