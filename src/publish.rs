use crate::types::{PipelineError, PublishableRecord, Result, RunSummary};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Destination for synthesized records. One call per record; the returned
/// string is the store's identifier for the created document.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(&self, record: &PublishableRecord) -> Result<String>;
}

/// Payload CMS client. Authenticates with a static token when one is
/// configured, otherwise logs in with email/password and caches the session
/// token. A 401 on create invalidates the cached token and retries once.
pub struct PayloadContentStore {
    client: reqwest::Client,
    endpoint: String,
    static_token: Option<String>,
    email: Option<String>,
    password: Option<String>,
    session_token: Mutex<Option<String>>,
}

impl PayloadContentStore {
    pub fn new(
        endpoint: String,
        static_token: Option<String>,
        email: Option<String>,
        password: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            static_token,
            email,
            password,
            session_token: Mutex::new(None),
        }
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }
        if let Some(token) = self.session_token.lock().unwrap().clone() {
            return Ok(token);
        }
        self.login().await
    }

    async fn login(&self) -> Result<String> {
        let (email, password) = match (&self.email, &self.password) {
            (Some(email), Some(password)) => (email, password),
            _ => {
                return Err(PipelineError::Publish(
                    "no content-store credentials configured".to_string(),
                ))
            }
        };

        debug!("Logging in to content store");
        let response = self
            .client
            .post(format!("{}/api/users/login", self.endpoint))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PipelineError::Publish(format!(
                "content-store login failed with HTTP {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let token = data["token"]
            .as_str()
            .ok_or_else(|| PipelineError::Publish("login response missing token".to_string()))?
            .to_string();

        *self.session_token.lock().unwrap() = Some(token.clone());
        Ok(token)
    }

    async fn create_with_token(
        &self,
        record: &PublishableRecord,
        token: &str,
    ) -> Result<reqwest::Response> {
        let payload = json!({
            "title": record.title_zh,
            "titleEn": record.title_en,
            "summary": record.summary_zh,
            "summaryShort": record.summary_zh_short,
            "summaryEn": record.summary_en,
            "summaryEnShort": record.summary_en_short,
            "keywords": record.keywords_zh,
            "keywordsEn": record.keywords_en,
            "originalLanguage": record.original_language,
            "slug": record.slug,
            "sourceUrl": record.source.url,
            "sourceName": record.source.name,
            "content": record.body,
            "publishedAt": record.published_at.to_rfc3339(),
            "status": "published",
        });

        Ok(self
            .client
            .post(format!("{}/api/articles", self.endpoint))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?)
    }
}

#[async_trait]
impl ContentStore for PayloadContentStore {
    async fn create(&self, record: &PublishableRecord) -> Result<String> {
        let token = self.token().await?;
        let mut response = self.create_with_token(record, &token).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED && self.static_token.is_none() {
            debug!("Session token expired, re-authenticating");
            *self.session_token.lock().unwrap() = None;
            let token = self.login().await?;
            response = self.create_with_token(record, &token).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Publish(format!(
                "create returned HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let id = data["doc"]["id"]
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| data["doc"]["id"].as_i64().map(|n| n.to_string()))
            .unwrap_or_else(|| record.slug.clone());

        info!("Published '{}' as document {}", record.title_en, id);
        Ok(id)
    }
}

/// In-memory store for tests: remembers created records, counts calls, and
/// can be told to fail.
#[derive(Default)]
pub struct MemoryContentStore {
    records: Mutex<Vec<PublishableRecord>>,
    fail_creates: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<PublishableRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn create(&self, record: &PublishableRecord) -> Result<String> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(PipelineError::Publish("store unavailable".to_string()));
        }
        let mut records = self.records.lock().unwrap();
        records.push(record.clone());
        Ok(format!("doc-{}", records.len()))
    }
}

/// Outbound notifications. Both calls are best-effort for the caller; an
/// error here never blocks publication.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn article_published(&self, record: &PublishableRecord) -> Result<()>;
    async fn run_finished(&self, summary: &RunSummary) -> Result<()>;
}

/// Telegram channel notifier using the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
    channel: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, channel: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            bot_token,
            channel,
        }
    }

    async fn send(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "https://api.telegram.org/bot{}/sendMessage",
                self.bot_token
            ))
            .json(&json!({
                "chat_id": self.channel,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PipelineError::Publish(format!(
                "telegram returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn article_published(&self, record: &PublishableRecord) -> Result<()> {
        let text = format!(
            "📰 <b>{}</b>\n{}\n\n{}\n<a href=\"{}\">{}</a>",
            record.title_zh,
            record.title_en,
            record.summary_zh_short,
            record.source.url,
            record.source.name
        );
        self.send(&text).await
    }

    async fn run_finished(&self, summary: &RunSummary) -> Result<()> {
        const TITLE_SAMPLE: usize = 10;

        let mut text = format!(
            "✅ Run {} finished: {} processed, {} published",
            summary.run_id, summary.processed, summary.published
        );
        for title in summary.published_titles.iter().take(TITLE_SAMPLE) {
            text.push_str(&format!("\n• {}", title));
        }
        if summary.published_titles.len() > TITLE_SAMPLE {
            text.push_str(&format!(
                "\n… and {} more",
                summary.published_titles.len() - TITLE_SAMPLE
            ));
        }
        self.send(&text).await
    }
}

/// No-op notifier used when Telegram is not configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn article_published(&self, _record: &PublishableRecord) -> Result<()> {
        Ok(())
    }

    async fn run_finished(&self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}

/// Recording notifier for tests.
#[derive(Default)]
pub struct MemoryNotifier {
    article_messages: Mutex<Vec<String>>,
    summary_messages: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn article_messages(&self) -> Vec<String> {
        self.article_messages.lock().unwrap().clone()
    }

    pub fn summary_messages(&self) -> Vec<String> {
        self.summary_messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn article_published(&self, record: &PublishableRecord) -> Result<()> {
        self.article_messages
            .lock()
            .unwrap()
            .push(record.title_en.clone());
        Ok(())
    }

    async fn run_finished(&self, summary: &RunSummary) -> Result<()> {
        self.summary_messages.lock().unwrap().push(format!(
            "processed={} published={}",
            summary.processed, summary.published
        ));
        Ok(())
    }
}

/// Warn-and-continue wrapper for notification results.
pub async fn notify_best_effort<F>(future: F, context: &str)
where
    F: std::future::Future<Output = Result<()>>,
{
    if let Err(e) = future.await {
        warn!("{} notification failed: {}", context, e);
    }
}
