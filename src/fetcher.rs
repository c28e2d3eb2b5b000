use crate::config::FetchConfig;
use crate::types::{CandidateItem, PipelineError, Result};
use feed_rs::parser;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use tracing::{debug, info, warn};

/// Fetches and parses a batch of feeds. A feed that times out, returns a
/// bad status, or fails to parse contributes zero items and is not retried
/// within the run; it never fails the run. The client timeout is the whole
/// per-feed budget since each feed gets exactly one attempt.
pub struct FeedFetcher {
    client: Client,
    config: FetchConfig,
}

impl FeedFetcher {
    pub fn new(config: FetchConfig) -> Self {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.per_feed_timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// Fetch every feed concurrently (bounded) and flatten the results in
    /// completion order.
    pub async fn fetch_all(&self, feed_urls: &[String]) -> Vec<CandidateItem> {
        let results: Vec<Vec<CandidateItem>> = stream::iter(feed_urls.iter())
            .map(|url| self.fetch_feed(url))
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;

        let items: Vec<CandidateItem> = results.into_iter().flatten().collect();
        info!(
            "Fetched {} feeds, {} candidate items",
            feed_urls.len(),
            items.len()
        );
        items
    }

    async fn fetch_feed(&self, url: &str) -> Vec<CandidateItem> {
        match self.fetch_once(url).await {
            Ok(content) => match parse_items(url, &content) {
                Ok(items) => {
                    debug!("Feed {} yielded {} items", url, items.len());
                    items
                }
                Err(e) => {
                    warn!("Failed to parse feed {}: {}", url, e);
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("Failed to fetch feed {}: {}", url, e);
                Vec::new()
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(PipelineError::General(format!(
                "HTTP {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        Ok(response.text().await?)
    }
}

/// Parse feed XML into candidate items. Entries missing a title or a link
/// are dropped.
pub fn parse_items(feed_url: &str, content: &str) -> Result<Vec<CandidateItem>> {
    let feed = parser::parse(content.as_bytes())
        .map_err(|e| PipelineError::Parse(format!("Failed to parse feed: {}", e)))?;

    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry.links.first()?.href.clone();
            let title = entry
                .title
                .map(|t| t.content)
                .filter(|t| !t.trim().is_empty())?;

            // Prefer full content, fall back to the summary.
            let raw_summary = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .map(|text| strip_html(&text))
                .unwrap_or_default();

            Some(CandidateItem::new(feed_url, title, link, raw_summary))
        })
        .collect();

    Ok(items)
}

/// Drop tags and collapse whitespace. Summaries only feed prompts and
/// fallback text, so lossy is fine.
pub fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
