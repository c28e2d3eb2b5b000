use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single entry discovered in a feed, before dedup and classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateItem {
    pub source_feed_url: String,
    pub title: String,
    pub link: String,
    pub raw_summary: String,
}

impl CandidateItem {
    pub fn new(
        source_feed_url: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
        raw_summary: impl Into<String>,
    ) -> Self {
        Self {
            source_feed_url: source_feed_url.into(),
            title: title.into(),
            link: link.into(),
            raw_summary: raw_summary.into(),
        }
    }
}

/// Derived identity of a candidate item. Two items matching on any one of
/// the three keys are treated as the same story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub normalized_url: String,
    pub title_hash: String,
    pub content_fingerprint: Option<String>,
}

impl Fingerprint {
    /// The durable-store keys for this fingerprint, one per namespace.
    pub fn dedup_keys(&self) -> Vec<String> {
        let mut keys = vec![
            format!("url:{}", self.normalized_url),
            format!("title:{}", self.title_hash),
        ];
        if let Some(fp) = &self.content_fingerprint {
            keys.push(format!("fp:{}", fp));
        }
        keys
    }
}

/// A candidate that survived the dedup tiers, carrying the fingerprint that
/// was computed for the durable-store check (when one was).
#[derive(Debug, Clone)]
pub struct ScreenedItem {
    pub item: CandidateItem,
    pub fingerprint: Option<Fingerprint>,
}

/// Persisted proof that an item was published, keyed under one of the
/// `url:` / `title:` / `fp:` namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub key: String,
    pub title: String,
    pub recorded_at: DateTime<Utc>,
}

/// Stage-1 triage verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub relevant: bool,
    pub confidence: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub must_publish: bool,
}

/// Stage-2 deep evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepEvaluation {
    pub approved: bool,
    pub overall_score: f64,
    #[serde(default)]
    pub dimension_scores: HashMap<String, f64>,
    #[serde(default)]
    pub reasoning: String,
}

/// Terminal classification outcome for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved,
    Rejected,
}

/// Source attribution carried on the published record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub url: String,
    pub name: String,
}

/// The synthesized bilingual record handed to the content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishableRecord {
    pub title_zh: String,
    pub title_en: String,
    pub summary_zh: String,
    pub summary_zh_short: String,
    pub summary_en: String,
    pub summary_en_short: String,
    pub keywords_zh: Vec<String>,
    pub keywords_en: Vec<String>,
    pub original_language: String,
    pub slug: String,
    pub source: SourceAttribution,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

impl PublishableRecord {
    /// Publication requires at minimum both titles and the localized summary.
    pub fn has_mandatory_fields(&self) -> bool {
        !self.title_zh.is_empty() && !self.title_en.is_empty() && !self.summary_zh.is_empty()
    }
}

/// Aggregate bookkeeping for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub processed: usize,
    pub published: usize,
    pub published_titles: Vec<String>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            processed: 0,
            published: 0,
            published_titles: Vec::new(),
        }
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Judge error: {0}")]
    Judge(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Uniform fail-open combinator used at integration boundaries: log the
/// error and hand back the fallback value instead of propagating.
pub trait OrFallback<T> {
    fn or_fallback(self, fallback: T, context: &str) -> T;
}

impl<T> OrFallback<T> for Result<T> {
    fn or_fallback(self, fallback: T, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("{} failed, using fallback: {}", context, e);
                fallback
            }
        }
    }
}
