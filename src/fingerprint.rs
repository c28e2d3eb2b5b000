use crate::judge::JudgeChain;
use crate::types::{CandidateItem, Fingerprint, Result};
use tracing::debug;
use url::Url;

/// Canonical form of a link: lowercased scheme+host+path, trailing slashes
/// stripped, query and fragment dropped. Parse failures fall back to the
/// lowercased raw string so this never fails.
pub fn normalize_url(link: &str) -> String {
    match Url::parse(link) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("");
            let authority = match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            let normalized = format!("{}://{}{}", parsed.scheme(), authority, parsed.path());
            normalized.to_lowercase().trim_end_matches('/').to_string()
        }
        Err(e) => {
            debug!("URL parse failed for {}: {}", link, e);
            link.to_lowercase()
        }
    }
}

/// Stable non-cryptographic hash of a normalized title. Keeps word
/// characters, whitespace and CJK; everything else is stripped before
/// hashing, so punctuation variants of the same headline collide on
/// purpose.
pub fn title_hash(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || *c == '_'
                || c.is_whitespace()
                || ('\u{4e00}'..='\u{9fa5}').contains(c)
        })
        .collect();
    let normalized = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    rolling_hash(&normalized)
}

/// 32-bit rolling hash, base-36 encoded.
pub fn rolling_hash(input: &str) -> String {
    let mut hash: i32 = 0;
    for c in input.chars() {
        hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(c as i32);
    }
    to_base36(hash.unsigned_abs() as u64)
}

pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Derives item identity. The semantic content fingerprint goes through the
/// keyword judge chain; any failure there degrades to the title hash.
pub struct Fingerprinter {
    keyword_chain: Option<JudgeChain>,
}

impl Fingerprinter {
    pub fn new(keyword_chain: Option<JudgeChain>) -> Self {
        Self { keyword_chain }
    }

    pub async fn fingerprint(&self, item: &CandidateItem) -> Fingerprint {
        let normalized_url = normalize_url(&item.link);
        let hash = title_hash(&item.title);

        let content_fingerprint = match &self.keyword_chain {
            Some(chain) => match self.keyword_fingerprint(chain, item).await {
                Ok(fp) => fp,
                Err(e) => {
                    debug!("Content fingerprint failed for {}: {}", item.link, e);
                    hash.clone()
                }
            },
            None => hash.clone(),
        };

        Fingerprint {
            normalized_url,
            title_hash: hash,
            content_fingerprint: Some(content_fingerprint),
        }
    }

    async fn keyword_fingerprint(&self, chain: &JudgeChain, item: &CandidateItem) -> Result<String> {
        let summary: String = if item.raw_summary.is_empty() {
            item.title.clone()
        } else {
            item.raw_summary.chars().take(300).collect()
        };

        let prompt = format!(
            "Extract 3-5 core topic keywords from this article. Return ONLY \
             comma-separated keywords in English, lowercase, no extra text.\n\n\
             Title: {}\nSummary: {}\n\nKeywords:",
            item.title, summary
        );

        let response = chain.invoke(&prompt).await?;

        let mut keywords: Vec<String> = response
            .to_lowercase()
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        keywords.sort();

        Ok(rolling_hash(&keywords.join("-")))
    }
}
