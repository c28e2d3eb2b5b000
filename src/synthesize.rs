use crate::config::{SynthesisConfig, SynthesisTables};
use crate::fingerprint::to_base36;
use crate::judge::{Judge, JudgeChain};
use crate::types::{CandidateItem, PublishableRecord, SourceAttribution};
use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

const CJK_RANGE: std::ops::RangeInclusive<char> = '\u{4e00}'..='\u{9fa5}';
const TITLE_MAX_WIDTH: usize = 60;
const SLUG_MAX_LEN: usize = 50;
const MIN_KEYWORDS: usize = 3;

/// Shape the generation chain is asked to produce. Every field is
/// defaultable so a partial completion still deserializes; mandatory-field
/// validation happens afterwards.
#[derive(Debug, Default, Deserialize)]
struct GeneratedContent {
    #[serde(default)]
    title_zh: String,
    #[serde(default)]
    title_en: String,
    #[serde(default)]
    summary_zh: String,
    #[serde(default)]
    summary_zh_short: String,
    #[serde(default)]
    summary_en: String,
    #[serde(default)]
    summary_en_short: String,
    #[serde(default)]
    keywords_zh: Vec<String>,
    #[serde(default)]
    keywords_en: Vec<String>,
}

/// Turns an approved item into a complete bilingual record. The generation
/// chain does the real work; when it is exhausted or returns an unusable
/// shape, a table-driven generator produces a serviceable record instead,
/// so synthesis never fails an approved item.
pub struct Synthesizer {
    generation: JudgeChain,
    tables: SynthesisTables,
    slug_clock: AtomicU64,
}

impl Synthesizer {
    pub fn new(judge: Arc<dyn Judge>, config: SynthesisConfig) -> Self {
        let generation = JudgeChain::new(
            judge,
            config.generation_models.clone(),
            config.generation_max_tokens,
        );
        Self {
            generation,
            tables: config.tables,
            slug_clock: AtomicU64::new(0),
        }
    }

    pub async fn synthesize(&self, item: &CandidateItem, forced: bool) -> PublishableRecord {
        let language = detect_language(&format!("{} {}", item.title, item.raw_summary));

        let content = match self
            .generation
            .invoke_json::<GeneratedContent>(&generation_prompt(item, &language))
            .await
        {
            Ok(generated) if !generated.title_zh.is_empty() && !generated.summary_zh.is_empty() => {
                debug!("Model-generated content for: {}", item.title);
                generated
            }
            Ok(_) => {
                warn!(
                    "Generated content for '{}' missing mandatory fields, using fallback",
                    item.title
                );
                self.fallback_content(item, &language)
            }
            Err(e) => {
                warn!("Content generation failed for '{}': {}", item.title, e);
                self.fallback_content(item, &language)
            }
        };

        self.assemble(item, content, &language, forced)
    }

    fn assemble(
        &self,
        item: &CandidateItem,
        mut content: GeneratedContent,
        language: &str,
        forced: bool,
    ) -> PublishableRecord {
        if content.title_en.is_empty() {
            content.title_en = item.title.clone();
        }
        if content.title_zh.is_empty() {
            content.title_zh = self.translate_title(&item.title);
        }
        if content.summary_zh_short.is_empty() {
            content.summary_zh_short = truncate_weighted(&content.summary_zh, 100);
        }
        if content.summary_en_short.is_empty() {
            content.summary_en_short = truncate_weighted(&content.summary_en, 100);
        }
        self.top_up_keywords(item, &mut content);

        let title_zh = truncate_weighted(&content.title_zh, TITLE_MAX_WIDTH);
        let title_en = truncate_weighted(&content.title_en, TITLE_MAX_WIDTH);
        let source = self.source_attribution(item);
        let slug = self.build_slug(&title_en, &content.keywords_en, &title_zh, forced);
        let body = format_body(&content.summary_zh, &content.summary_en, &source);

        info!("Synthesized '{}' as slug '{}'", item.title, slug);

        PublishableRecord {
            title_zh,
            title_en,
            summary_zh: content.summary_zh,
            summary_zh_short: content.summary_zh_short,
            summary_en: content.summary_en,
            summary_en_short: content.summary_en_short,
            keywords_zh: content.keywords_zh,
            keywords_en: content.keywords_en,
            original_language: language.to_string(),
            slug,
            source,
            body,
            published_at: Utc::now(),
        }
    }

    /// Table-driven generator used when the model chain is unavailable.
    /// Guaranteed to fill every mandatory field.
    fn fallback_content(&self, item: &CandidateItem, language: &str) -> GeneratedContent {
        let summary_snippet: String = if item.raw_summary.is_empty() {
            item.title.clone()
        } else {
            item.raw_summary.chars().take(200).collect()
        };

        let (title_zh, summary_zh) = if language == "zh" {
            let summary = if item.raw_summary.is_empty() {
                format!("{}。", item.title)
            } else {
                summary_snippet.clone()
            };
            (item.title.clone(), summary)
        } else {
            let label = self.domain_label(item);
            let company = self.company_name(item);
            let title_zh = match &company {
                Some(name) => format!("{}发布{}最新进展", name, label),
                None => format!("{}最新动态", label),
            };
            let summary_zh = format!(
                "{}领域有新进展。原文标题：{}。{}",
                label,
                item.title,
                self.substitute_terms(&summary_snippet)
            );
            (title_zh, summary_zh)
        };

        let summary_en = if language == "zh" {
            format!("Original coverage: {}", item.title)
        } else {
            summary_snippet
        };

        GeneratedContent {
            title_zh,
            title_en: item.title.clone(),
            summary_zh_short: truncate_weighted(&summary_zh, 100),
            summary_en_short: truncate_weighted(&summary_en, 100),
            summary_zh,
            summary_en,
            keywords_zh: self.trigger_keywords(item, &self.tables.keyword_triggers_zh),
            keywords_en: self.trigger_keywords(item, &self.tables.keyword_triggers_en),
        }
    }

    /// Longest-first phrase substitution over a lowercased copy.
    fn substitute_terms(&self, text: &str) -> String {
        let mut result = text.to_lowercase();
        let mut substitutions: Vec<&(String, String)> =
            self.tables.term_substitutions.iter().collect();
        substitutions.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        for (english, chinese) in substitutions {
            result = result.replace(english.as_str(), chinese);
        }
        result
    }

    fn translate_title(&self, title: &str) -> String {
        let substituted = self.substitute_terms(title);
        if substituted.chars().any(|c| CJK_RANGE.contains(&c)) {
            substituted
        } else {
            format!("AI前沿：{}", title)
        }
    }

    fn domain_label(&self, item: &CandidateItem) -> String {
        let haystack = format!("{} {}", item.title, item.raw_summary).to_lowercase();
        self.tables
            .domain_labels
            .iter()
            .find(|(trigger, _)| haystack.contains(trigger.as_str()))
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| "人工智能技术".to_string())
    }

    fn company_name(&self, item: &CandidateItem) -> Option<String> {
        let haystack = format!("{} {}", item.title, item.link).to_lowercase();
        self.tables
            .company_names
            .iter()
            .find(|(trigger, _)| haystack.contains(trigger.as_str()))
            .map(|(_, name)| name.clone())
    }

    fn trigger_keywords(&self, item: &CandidateItem, triggers: &[(String, String)]) -> Vec<String> {
        let haystack = format!("{} {}", item.title, item.raw_summary).to_lowercase();
        let mut keywords: Vec<String> = triggers
            .iter()
            .filter(|(trigger, _)| haystack.contains(trigger.as_str()))
            .map(|(_, keyword)| keyword.clone())
            .collect();
        keywords.dedup();
        keywords
    }

    fn top_up_keywords(&self, item: &CandidateItem, content: &mut GeneratedContent) {
        if content.keywords_zh.len() < MIN_KEYWORDS {
            let mut extra = self.trigger_keywords(item, &self.tables.keyword_triggers_zh);
            extra.extend(self.tables.fallback_keywords_zh.iter().cloned());
            fill_keywords(&mut content.keywords_zh, extra);
        }
        if content.keywords_en.len() < MIN_KEYWORDS {
            let mut extra = self.trigger_keywords(item, &self.tables.keyword_triggers_en);
            extra.extend(self.tables.fallback_keywords_en.iter().cloned());
            fill_keywords(&mut content.keywords_en, extra);
        }
    }

    fn source_attribution(&self, item: &CandidateItem) -> SourceAttribution {
        let host = Url::parse(&item.source_feed_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();

        let name = self
            .tables
            .source_names
            .iter()
            .find(|(domain, _)| host.contains(domain.as_str()))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| {
                if host.is_empty() {
                    "Unknown Source".to_string()
                } else {
                    host.clone()
                }
            });

        SourceAttribution {
            url: item.link.clone(),
            name,
        }
    }

    fn build_slug(
        &self,
        title_en: &str,
        keywords_en: &[String],
        title_zh: &str,
        forced: bool,
    ) -> String {
        let mut base = slugify(title_en);
        if base.is_empty() {
            base = slugify(&keywords_en.join("-"));
        }
        if base.is_empty() {
            base = slugify(title_zh);
        }
        if base.is_empty() {
            base = "news".to_string();
        }

        if forced {
            format!("{}-{}", base, to_base36(self.next_stamp()))
        } else {
            base
        }
    }

    /// Monotonic millisecond clock: two stamps taken in the same millisecond
    /// still differ, so forced slugs never collide within a process.
    fn next_stamp(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.slug_clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .slug_clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn fill_keywords(keywords: &mut Vec<String>, extra: Vec<String>) {
    for keyword in extra {
        if keywords.len() >= MIN_KEYWORDS {
            break;
        }
        if !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
}

/// "zh" when more than 30% of the letters are CJK, "en" otherwise.
pub fn detect_language(text: &str) -> String {
    let mut total = 0usize;
    let mut cjk = 0usize;
    for c in text.chars() {
        if c.is_alphabetic() {
            total += 1;
            if CJK_RANGE.contains(&c) {
                cjk += 1;
            }
        }
    }
    if total > 0 && (cjk as f64) / (total as f64) > 0.3 {
        "zh".to_string()
    } else {
        "en".to_string()
    }
}

/// Width-aware truncation: CJK characters count double. Truncated text gets
/// an ellipsis.
pub fn truncate_weighted(text: &str, max_width: usize) -> String {
    let mut width = 0usize;
    let mut out = String::new();
    for c in text.chars() {
        let w = if CJK_RANGE.contains(&c) { 2 } else { 1 };
        if width + w > max_width.saturating_sub(1) {
            out.push('…');
            return out;
        }
        width += w;
        out.push(c);
    }
    out
}

/// ASCII slug: lowercase alphanumerics joined by single hyphens, capped in
/// length at a hyphen boundary where possible.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut last_hyphen = true;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > SLUG_MAX_LEN {
        slug.truncate(SLUG_MAX_LEN);
        if let Some(cut) = slug.rfind('-') {
            if cut > SLUG_MAX_LEN / 2 {
                slug.truncate(cut);
            }
        }
        slug = slug.trim_matches('-').to_string();
    }
    slug
}

fn format_body(summary_zh: &str, summary_en: &str, source: &SourceAttribution) -> String {
    format!(
        "<p>{}</p>\n<p>{}</p>\n<p>来源：<a href=\"{}\">{}</a></p>",
        summary_zh, summary_en, source.url, source.name
    )
}

fn generation_prompt(item: &CandidateItem, language: &str) -> String {
    let summary: String = item.raw_summary.chars().take(1000).collect();
    format!(
        "Write bilingual (Simplified Chinese and English) digest content for \
         this news item. Original language: {}.\n\n\
         Title: {}\nSummary: {}\nLink: {}\n\n\
         Respond with ONLY a JSON object with these fields: title_zh, \
         title_en, summary_zh (2-3 sentences), summary_zh_short (one \
         sentence), summary_en (2-3 sentences), summary_en_short (one \
         sentence), keywords_zh (3-5 items), keywords_en (3-5 items). \
         Titles must stay factual; do not invent details absent from the \
         summary.",
        language, item.title, summary, item.link
    )
}
