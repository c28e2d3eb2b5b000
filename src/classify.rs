use crate::config::ClassificationConfig;
use crate::judge::{Judge, JudgeChain};
use crate::types::{CandidateItem, ClassificationResult, DeepEvaluation, OrFallback, Verdict};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of screening one item. `forced` marks keyword-allow-listed items
/// that skip model judgement; downstream gives those a deterministic slug
/// suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    pub verdict: Verdict,
    pub forced: bool,
}

/// Two-stage relevance gate. Stage 1 is a cheap triage; only mid-confidence
/// items pay for the stage-2 deep evaluation. Model failures lean towards
/// letting items through, so a judge outage degrades precision, not
/// coverage.
pub struct Classifier {
    stage1: JudgeChain,
    stage2: JudgeChain,
    config: ClassificationConfig,
}

impl Classifier {
    pub fn new(judge: Arc<dyn Judge>, config: ClassificationConfig) -> Self {
        let stage1 = JudgeChain::new(
            judge.clone(),
            config.stage1_models.clone(),
            config.stage1_max_tokens,
        );
        let stage2 = JudgeChain::new(
            judge,
            config.stage2_models.clone(),
            config.stage2_max_tokens,
        );
        Self {
            stage1,
            stage2,
            config,
        }
    }

    pub async fn classify(&self, item: &CandidateItem) -> ClassificationOutcome {
        if self.matches_force_include(item) {
            info!("Force-including item: {}", item.title);
            return ClassificationOutcome {
                verdict: Verdict::Approved,
                forced: true,
            };
        }

        let triage = self
            .stage1
            .invoke_json::<ClassificationResult>(&stage1_prompt(item))
            .await
            .or_fallback(
                ClassificationResult {
                    relevant: true,
                    confidence: 0.5,
                    category: String::new(),
                    must_publish: false,
                },
                "Stage-1 triage",
            );

        debug!(
            "Stage 1 for '{}': relevant={} confidence={:.2}",
            item.title, triage.relevant, triage.confidence
        );

        if triage.must_publish {
            return ClassificationOutcome {
                verdict: Verdict::Approved,
                forced: false,
            };
        }

        if !triage.relevant || triage.confidence < self.config.low_confidence {
            return ClassificationOutcome {
                verdict: Verdict::Rejected,
                forced: false,
            };
        }

        if triage.confidence >= self.config.high_confidence {
            return ClassificationOutcome {
                verdict: Verdict::Approved,
                forced: false,
            };
        }

        self.deep_evaluate(item, triage.confidence).await
    }

    async fn deep_evaluate(&self, item: &CandidateItem, stage1_confidence: f64) -> ClassificationOutcome {
        match self
            .stage2
            .invoke_json::<DeepEvaluation>(&stage2_prompt(item))
            .await
        {
            Ok(evaluation) => {
                debug!(
                    "Stage 2 for '{}': approved={} score={:.2}",
                    item.title, evaluation.approved, evaluation.overall_score
                );
                let verdict = if evaluation.approved
                    && evaluation.overall_score >= self.config.pass_score
                {
                    Verdict::Approved
                } else {
                    Verdict::Rejected
                };
                ClassificationOutcome {
                    verdict,
                    forced: false,
                }
            }
            Err(e) => {
                // With no second opinion, the stage-1 confidence must clear
                // the pass bar on its own.
                debug!("Stage 2 failed for '{}': {}", item.title, e);
                let verdict = if stage1_confidence >= self.config.pass_score {
                    Verdict::Approved
                } else {
                    Verdict::Rejected
                };
                ClassificationOutcome {
                    verdict,
                    forced: false,
                }
            }
        }
    }

    fn matches_force_include(&self, item: &CandidateItem) -> bool {
        matches_force_include(&self.config.force_include_keywords, item)
    }
}

/// Case-insensitive allow-list match over title and summary. Shared with the
/// orchestrator, which exempts matching items from dedup.
pub fn matches_force_include(keywords: &[String], item: &CandidateItem) -> bool {
    let haystack = format!("{} {}", item.title, item.raw_summary).to_lowercase();
    keywords
        .iter()
        .any(|keyword| haystack.contains(&keyword.to_lowercase()))
}

fn stage1_prompt(item: &CandidateItem) -> String {
    let summary: String = item.raw_summary.chars().take(500).collect();
    format!(
        "You are screening news items for an AI/ML technology digest. Decide \
         whether this item is about artificial intelligence, machine learning, \
         large language models, or closely related infrastructure.\n\n\
         Title: {}\nSummary: {}\n\n\
         Respond with ONLY a JSON object: {{\"relevant\": true/false, \
         \"confidence\": 0.0-1.0, \"category\": \"...\", \
         \"must_publish\": true/false}}. Set must_publish only for major \
         industry announcements.",
        item.title, summary
    )
}

fn stage2_prompt(item: &CandidateItem) -> String {
    let summary: String = item.raw_summary.chars().take(800).collect();
    format!(
        "Evaluate this AI/ML news item in depth for a curated technology \
         digest.\n\nTitle: {}\nSummary: {}\n\n\
         Score each dimension from 0.0 to 1.0: technical_depth, novelty, \
         industry_impact, credibility. Respond with ONLY a JSON object: \
         {{\"approved\": true/false, \"overall_score\": 0.0-1.0, \
         \"dimension_scores\": {{...}}, \"reasoning\": \"one sentence\"}}.",
        item.title, summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::MockJudge;

    fn config() -> ClassificationConfig {
        ClassificationConfig {
            stage1_models: vec!["triage".to_string()],
            stage2_models: vec!["deep".to_string()],
            ..ClassificationConfig::default()
        }
    }

    fn item(title: &str) -> CandidateItem {
        CandidateItem::new("https://feed.example/rss", title, "https://a.example/x", "summary")
    }

    #[tokio::test]
    async fn force_include_skips_both_stages() {
        let judge = Arc::new(MockJudge::failing());
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("NVIDIA ships new accelerator")).await;
        assert_eq!(outcome.verdict, Verdict::Approved);
        assert!(outcome.forced);
        assert_eq!(judge.calls("triage"), 0);
        assert_eq!(judge.calls("deep"), 0);
    }

    #[tokio::test]
    async fn high_confidence_skips_stage_two() {
        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": true, "confidence": 0.9}"#);
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("Obscure model paper")).await;
        assert_eq!(outcome.verdict, Verdict::Approved);
        assert!(!outcome.forced);
        assert_eq!(judge.calls("deep"), 0);
    }

    #[tokio::test]
    async fn low_confidence_rejects_without_stage_two() {
        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": true, "confidence": 0.1}"#);
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("Unrelated gadget review")).await;
        assert_eq!(outcome.verdict, Verdict::Rejected);
        assert_eq!(judge.calls("deep"), 0);
    }

    #[tokio::test]
    async fn irrelevant_rejects_regardless_of_confidence() {
        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": false, "confidence": 0.95}"#);
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("Celebrity news")).await;
        assert_eq!(outcome.verdict, Verdict::Rejected);
        assert_eq!(judge.calls("deep"), 0);
    }

    #[tokio::test]
    async fn mid_confidence_goes_to_stage_two() {
        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": true, "confidence": 0.5}"#);
        judge.script("deep", r#"{"approved": true, "overall_score": 0.7}"#);
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("Borderline item")).await;
        assert_eq!(outcome.verdict, Verdict::Approved);
        assert_eq!(judge.calls("deep"), 1);
    }

    #[tokio::test]
    async fn stage_two_score_below_pass_rejects() {
        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": true, "confidence": 0.5}"#);
        judge.script("deep", r#"{"approved": true, "overall_score": 0.4}"#);
        let classifier = Classifier::new(judge, config());

        let outcome = classifier.classify(&item("Weak borderline item")).await;
        assert_eq!(outcome.verdict, Verdict::Rejected);
    }

    #[tokio::test]
    async fn stage_one_failure_defaults_to_borderline() {
        // Triage exhausted: default is relevant at 0.5, which routes to
        // stage 2.
        let judge = Arc::new(MockJudge::new());
        judge.script_err("triage", "down");
        judge.script("deep", r#"{"approved": true, "overall_score": 0.8}"#);
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("Item during outage")).await;
        assert_eq!(outcome.verdict, Verdict::Approved);
        assert_eq!(judge.calls("deep"), 1);
    }

    #[tokio::test]
    async fn stage_two_failure_falls_back_to_stage_one_confidence() {
        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": true, "confidence": 0.7}"#);
        judge.script_err("deep", "down");
        let classifier = Classifier::new(judge, config());

        // 0.7 clears the 0.6 pass bar.
        let outcome = classifier.classify(&item("Item with stage two down")).await;
        assert_eq!(outcome.verdict, Verdict::Approved);

        let judge = Arc::new(MockJudge::new());
        judge.script("triage", r#"{"relevant": true, "confidence": 0.5}"#);
        judge.script_err("deep", "down");
        let classifier = Classifier::new(judge, config());

        let outcome = classifier.classify(&item("Weaker item, stage two down")).await;
        assert_eq!(outcome.verdict, Verdict::Rejected);
    }

    #[tokio::test]
    async fn must_publish_flag_approves_immediately() {
        let judge = Arc::new(MockJudge::new());
        judge.script(
            "triage",
            r#"{"relevant": true, "confidence": 0.5, "must_publish": true}"#,
        );
        let classifier = Classifier::new(judge.clone(), config());

        let outcome = classifier.classify(&item("Major launch")).await;
        assert_eq!(outcome.verdict, Verdict::Approved);
        assert!(!outcome.forced);
        assert_eq!(judge.calls("deep"), 0);
    }
}
