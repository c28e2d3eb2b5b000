use crate::types::{PipelineError, Result};
use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Feed sources fetched on every run. Rotation pools and per-run feed
/// selection live upstream; this is the stable core set.
pub const CORE_FEEDS: &[&str] = &[
    "https://openai.com/blog/rss.xml",
    "https://blog.google/technology/ai/rss/",
    "https://www.deepmind.com/blog/rss.xml",
    "https://www.microsoft.com/en-us/research/feed/",
    "https://huggingface.co/blog/feed.xml",
    "https://aws.amazon.com/blogs/machine-learning/feed/",
    "https://blog.langchain.dev/rss/",
    "https://lilianweng.github.io/index.xml",
    "https://karpathy.github.io/feed.xml",
    "https://distill.pub/rss.xml",
    "https://arxiv.org/rss/cs.AI",
    "https://simonwillison.net/atom/entries/",
    "https://sebastianraschka.com/blog/index.xml",
    "https://developer.nvidia.com/blog/feed",
    "https://www.anthropic.com/news/rss.xml",
];

/// Fetch-side knobs for one run.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub max_sources_per_run: usize,
    pub max_concurrent: usize,
    /// Whole budget for one feed; feeds are never retried within a run.
    pub per_feed_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "newsflow/1.0".to_string(),
            max_sources_per_run: 30,
            max_concurrent: 20,
            per_feed_timeout: Duration::from_secs(4),
        }
    }
}

/// Knobs for the three dedup tiers.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Max hot-cache lookups issued per run (one concurrent batch).
    pub hot_cache_batch_limit: usize,
    /// Max items covered by the single durable-store existence query.
    pub durable_batch_limit: usize,
    pub hot_cache_ttl: Duration,
    pub retention_ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hot_cache_batch_limit: 30,
            durable_batch_limit: 100,
            hot_cache_ttl: Duration::from_secs(7 * 24 * 3600),
            retention_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Thresholds and model chains for the two classification stages.
#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    /// Below this stage-1 confidence the item is rejected outright.
    pub low_confidence: f64,
    /// At or above this stage-1 confidence the item is approved without
    /// stage 2.
    pub high_confidence: f64,
    /// Stage-2 overall score needed for approval; also the stage-1
    /// confidence bar when the stage-2 chain is exhausted.
    pub pass_score: f64,
    pub stage1_models: Vec<String>,
    pub stage2_models: Vec<String>,
    pub stage1_max_tokens: u32,
    pub stage2_max_tokens: u32,
    /// Case-insensitive allow-list; a title/summary hit bypasses stage 1/2
    /// rejection (but not dedup).
    pub force_include_keywords: Vec<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            low_confidence: 0.3,
            high_confidence: 0.8,
            pass_score: 0.6,
            stage1_models: vec![
                "x-ai/grok-4.1-fast".to_string(),
                "groq/llama-3.1-70b-versatile".to_string(),
                "anthropic/claude-3-5-haiku".to_string(),
            ],
            stage2_models: vec![
                "google/gemini-2.5-pro".to_string(),
                "anthropic/claude-3-5-sonnet".to_string(),
                "x-ai/grok-4.1-fast".to_string(),
            ],
            stage1_max_tokens: 400,
            stage2_max_tokens: 800,
            force_include_keywords: [
                "PostgreSQL",
                "ChatGPT",
                "Google",
                "Microsoft",
                "NVIDIA",
                "OpenAI",
                "Isaac",
                "Replicate",
                "Attention",
                "Sparse",
                "AI Mode",
                "DRIVE AV",
                "Personal Intelligence",
                "Gated Sparse",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Model chains and fixed lookup tables for content synthesis.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub generation_models: Vec<String>,
    pub keyword_models: Vec<String>,
    pub generation_max_tokens: u32,
    pub keyword_max_tokens: u32,
    pub tables: SynthesisTables,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            generation_models: vec![
                "google/gemini-2.5-pro".to_string(),
                "anthropic/claude-3-5-sonnet".to_string(),
                "x-ai/grok-4.1-fast".to_string(),
            ],
            keyword_models: vec!["groq/llama-3.1-8b-instant".to_string()],
            generation_max_tokens: 1500,
            keyword_max_tokens: 50,
            tables: SynthesisTables::default(),
        }
    }
}

/// Fixed lookup tables backing the rule-based fallback generator. Injected
/// so the synthesizer stays swappable in tests.
#[derive(Debug, Clone)]
pub struct SynthesisTables {
    /// English phrase -> Chinese rendering, applied longest-first.
    pub term_substitutions: Vec<(String, String)>,
    /// Substring trigger -> technical-domain label used as a title prefix.
    pub domain_labels: Vec<(String, String)>,
    /// Substring trigger -> company name (Chinese).
    pub company_names: Vec<(String, String)>,
    /// Substring trigger -> Chinese keyword.
    pub keyword_triggers_zh: Vec<(String, String)>,
    /// Substring trigger -> English keyword.
    pub keyword_triggers_en: Vec<(String, String)>,
    pub fallback_keywords_zh: Vec<String>,
    pub fallback_keywords_en: Vec<String>,
    /// Feed host -> human-readable source name.
    pub source_names: Vec<(String, String)>,
}

fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
    raw.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
}

impl Default for SynthesisTables {
    fn default() -> Self {
        Self {
            term_substitutions: pairs(&[
                ("large language model", "大语言模型"),
                ("natural language processing", "自然语言处理"),
                ("artificial intelligence", "人工智能"),
                ("reinforcement learning", "强化学习"),
                ("personal intelligence", "个人智能"),
                ("attention mechanism", "注意力机制"),
                ("machine learning", "机器学习"),
                ("neural network", "神经网络"),
                ("computer vision", "计算机视觉"),
                ("language model", "语言模型"),
                ("deep learning", "深度学习"),
                ("fine-tune", "微调"),
                ("multimodal", "多模态"),
                ("transformer", "变换器架构"),
                ("inference", "推理"),
                ("pre-training", "预训练"),
                ("optimization", "优化"),
                ("postgresql", "PostgreSQL数据库"),
                ("database", "数据库"),
                ("framework", "框架"),
                ("google", "谷歌"),
                ("microsoft", "微软"),
                ("nvidia", "英伟达"),
            ]),
            domain_labels: pairs(&[
                ("search", "AI搜索技术"),
                ("retrieval", "AI搜索技术"),
                ("language", "大语言模型"),
                ("llm", "大语言模型"),
                ("gpt", "大语言模型"),
                ("vision", "计算机视觉"),
                ("image", "计算机视觉"),
                ("multimodal", "多模态AI"),
                ("reinforcement", "强化学习"),
                ("neural", "深度学习"),
                ("deep", "深度学习"),
                ("attention", "注意力机制"),
                ("transformer", "注意力机制"),
                ("database", "数据库技术"),
                ("cloud", "云计算基础设施"),
            ]),
            company_names: pairs(&[
                ("google", "谷歌"),
                ("openai", "OpenAI"),
                ("microsoft", "微软"),
                ("nvidia", "英伟达"),
                ("anthropic", "Anthropic"),
                ("meta", "Meta"),
            ]),
            keyword_triggers_zh: pairs(&[
                ("language model", "大语言模型技术"),
                ("attention", "注意力机制优化"),
                ("reinforcement", "强化学习算法"),
                ("computer vision", "计算机视觉技术"),
                ("multimodal", "多模态AI系统"),
                ("neural", "深度神经网络"),
                ("search", "智能搜索技术"),
                ("fine-tune", "模型微调技术"),
                ("postgresql", "PostgreSQL扩展"),
                ("google", "谷歌AI技术"),
                ("openai", "OpenAI创新"),
                ("microsoft", "微软AI研究"),
                ("nvidia", "英伟达计算平台"),
                ("anthropic", "Anthropic技术"),
            ]),
            keyword_triggers_en: pairs(&[
                ("language model", "language model training"),
                ("attention", "attention mechanisms"),
                ("reinforcement", "reinforcement learning"),
                ("computer vision", "computer vision systems"),
                ("multimodal", "multimodal ai systems"),
                ("neural", "neural network architectures"),
                ("search", "search technologies"),
                ("fine-tune", "model fine-tuning"),
                ("postgresql", "postgresql optimization"),
                ("google", "google ai research"),
                ("openai", "openai technologies"),
                ("microsoft", "microsoft research"),
                ("nvidia", "nvidia computing"),
                ("anthropic", "anthropic ai"),
            ]),
            fallback_keywords_zh: vec![
                "AI技术创新".to_string(),
                "机器学习应用".to_string(),
                "智能计算平台".to_string(),
            ],
            fallback_keywords_en: vec![
                "ai innovation".to_string(),
                "technology advancement".to_string(),
                "computational systems".to_string(),
            ],
            source_names: pairs(&[
                ("openai.com", "OpenAI Blog"),
                ("anthropic.com", "Anthropic News"),
                ("blog.google", "Google AI Blog"),
                ("deepmind.com", "DeepMind Blog"),
                ("deepmind.google", "DeepMind Blog"),
                ("ai.meta.com", "Meta AI Blog"),
                ("microsoft.com", "Microsoft Research"),
                ("huggingface.co", "Hugging Face Blog"),
                ("aws.amazon.com", "AWS Machine Learning Blog"),
                ("blog.langchain.dev", "LangChain Blog"),
                ("lilianweng.github.io", "Lil'Log"),
                ("karpathy.github.io", "Andrej Karpathy Blog"),
                ("distill.pub", "Distill"),
                ("arxiv.org", "arXiv"),
                ("news.ycombinator.com", "Hacker News"),
            ]),
        }
    }
}

/// Everything a run needs, loaded once at startup and injected downward.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub feeds: Vec<String>,
    pub fetch: FetchConfig,
    pub dedup: DedupConfig,
    pub classification: ClassificationConfig,
    pub synthesis: SynthesisConfig,
    /// Stop the per-item loop once this many items were published.
    pub daily_target: usize,
    /// Soft deadline; exceeding it stops starting new items.
    pub run_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feeds: CORE_FEEDS.iter().map(|s| s.to_string()).collect(),
            fetch: FetchConfig::default(),
            dedup: DedupConfig::default(),
            classification: ClassificationConfig::default(),
            synthesis: SynthesisConfig::default(),
            daily_target: 20,
            run_deadline: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Dedup the configured feed list and cap it at the per-run source
    /// limit, preserving order.
    pub fn select_feeds(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.feeds
            .iter()
            .filter(|url| seen.insert(url.as_str()))
            .take(self.fetch.max_sources_per_run)
            .cloned()
            .collect()
    }
}

/// Credentials and endpoints pulled from the environment once at startup.
/// A missing judge key is the one fatal misconfiguration; everything else
/// degrades to a disabled collaborator.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openrouter_api_key: String,
    pub database_url: Option<String>,
    pub payload_endpoint: Option<String>,
    pub payload_token: Option<String>,
    pub payload_email: Option<String>,
    pub payload_password: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_channel: Option<String>,
    pub daily_target: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let openrouter_api_key = env::var("OPENROUTER_API_KEY").map_err(|_| {
            PipelineError::Config("OPENROUTER_API_KEY is not set".to_string())
        })?;

        Ok(Self {
            openrouter_api_key,
            database_url: env::var("DATABASE_URL").ok(),
            payload_endpoint: env::var("PAYLOAD_API_ENDPOINT").ok(),
            payload_token: env::var("PAYLOAD_TOKEN").ok(),
            payload_email: env::var("PAYLOAD_EMAIL").ok(),
            payload_password: env::var("PAYLOAD_PASSWORD").ok(),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_channel: env::var("TELEGRAM_CHANNEL").ok(),
            daily_target: env::var("DAILY_TARGET").ok().and_then(|v| v.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_feeds_dedups_and_caps() {
        let mut config = PipelineConfig::default();
        config.feeds = vec![
            "https://a.example/feed".to_string(),
            "https://b.example/feed".to_string(),
            "https://a.example/feed".to_string(),
        ];
        config.fetch.max_sources_per_run = 2;

        let selected = config.select_feeds();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0], "https://a.example/feed");
        assert_eq!(selected[1], "https://b.example/feed");
    }

    #[test]
    fn default_thresholds_are_ordered() {
        let c = ClassificationConfig::default();
        assert!(c.low_confidence < c.pass_score);
        assert!(c.pass_score < c.high_confidence);
    }
}
