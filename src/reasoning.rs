//! Multi-agent reasoning engine: three specialist lenses run in parallel over
//! one captured context, their findings are normalized into a canonical shape
//! and synthesized into severity buckets.
//!
//! Fault isolation is the load-bearing property here: one specialist blowing
//! up yields an empty list for that lens only and never aborts the others.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::evidence::CapturedContext;
use crate::knowledge::KnowledgeStore;
use crate::llm::ChatModel;
use crate::model::{Citation, ConfidenceLevel, Finding, FindingCategory, Severity};
use crate::persona::{build_system_prompt, Persona};

/// Analysis temperature: low enough for contract-shaped output, high enough
/// to not parrot the prompt.
const ANALYSIS_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialistKind {
    Ux,
    Accessibility,
    Conversion,
}

impl SpecialistKind {
    pub fn name(&self) -> &'static str {
        match self {
            SpecialistKind::Ux => "ux",
            SpecialistKind::Accessibility => "accessibility",
            SpecialistKind::Conversion => "conversion",
        }
    }

    fn knowledge_category(&self) -> &'static str {
        match self {
            SpecialistKind::Ux => "ux",
            SpecialistKind::Accessibility => "accessibility",
            SpecialistKind::Conversion => "conversion",
        }
    }

    fn lens_prompt(&self) -> &'static str {
        match self {
            SpecialistKind::Ux => {
                "You are a senior UX researcher. Identify friction, confusing flows, \
                 unclear affordances and mismatches between the interface and the \
                 persona's mental model."
            }
            SpecialistKind::Accessibility => {
                "You are an accessibility specialist. Identify barriers for assistive \
                 technology, keyboard navigation gaps, contrast and target-size issues, \
                 weighted by this persona's stated accessibility needs."
            }
            SpecialistKind::Conversion => {
                "You are a conversion-rate specialist. Identify drop-off risks, trust \
                 gaps, unnecessary steps and unclear calls to action on the persona's \
                 path to their goal."
            }
        }
    }
}

/// Shared input for all three specialists.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub captured: CapturedContext,
    pub tasks: Vec<String>,
    pub persona: Persona,
    pub task_summary: String,
}

/// Raw finding as produced by a model, before normalization.
#[derive(Debug, Clone, Deserialize)]
struct RawFinding {
    title: String,
    #[serde(default)]
    severity: Option<Value>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    suggested_fix: String,
    #[serde(default)]
    affected_tasks: Vec<String>,
    #[serde(default)]
    developer_outputs: Option<Value>,
}

/// Exhaustive decode of the response shapes models actually produce:
/// `{"findings": [...]}`, `{"findings": {...}}`, a bare array, or a bare
/// object. One tagged union feeds one normalization function.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FindingsPayload {
    Wrapped { findings: FindingsValue },
    List(Vec<RawFinding>),
    Single(RawFinding),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FindingsValue {
    List(Vec<RawFinding>),
    Single(RawFinding),
}

fn decode_findings(value: Value) -> Vec<RawFinding> {
    match serde_json::from_value::<FindingsPayload>(value) {
        Ok(FindingsPayload::Wrapped {
            findings: FindingsValue::List(list),
        }) => list,
        Ok(FindingsPayload::Wrapped {
            findings: FindingsValue::Single(one),
        }) => vec![one],
        Ok(FindingsPayload::List(list)) => list,
        Ok(FindingsPayload::Single(one)) => vec![one],
        Err(e) => {
            warn!(error = %e, "unrecognized findings payload");
            vec![]
        }
    }
}

fn normalize(raw: RawFinding, agent: &str, citations: &[Citation]) -> Finding {
    let severity = raw
        .severity
        .as_ref()
        .map(Severity::from_value)
        .unwrap_or(Severity::Med);
    let confidence = raw
        .confidence
        .map(|c| c.clamp(0.0, 100.0) as u8)
        .unwrap_or(50);
    let category = raw
        .category
        .as_deref()
        .map(FindingCategory::parse)
        .unwrap_or(FindingCategory::Other);

    Finding {
        title: raw.title,
        severity,
        confidence,
        confidence_level: ConfidenceLevel::from_score(confidence),
        category,
        description: raw.description,
        suggested_fix: raw.suggested_fix,
        affected_tasks: raw.affected_tasks,
        evidence: vec![],
        citations: citations.to_vec(),
        agent: agent.to_string(),
        developer_outputs: raw.developer_outputs,
    }
}

pub struct ReasoningEngine {
    model: Arc<dyn ChatModel>,
    knowledge: Arc<KnowledgeStore>,
}

impl ReasoningEngine {
    pub fn new(model: Arc<dyn ChatModel>, knowledge: Arc<KnowledgeStore>) -> Self {
        Self { model, knowledge }
    }

    /// Run all three specialists in parallel over the same context and return
    /// the concatenated findings. All three settle before this returns.
    pub async fn analyze(&self, context: &AnalysisContext) -> Vec<Finding> {
        let (ux, a11y, conversion) = tokio::join!(
            self.run_specialist(SpecialistKind::Ux, context),
            self.run_specialist(SpecialistKind::Accessibility, context),
            self.run_specialist(SpecialistKind::Conversion, context),
        );

        let mut findings = ux;
        findings.extend(a11y);
        findings.extend(conversion);
        info!(findings = findings.len(), "specialist analysis settled");
        findings
    }

    /// One specialist pass. Any failure inside is absorbed into an empty
    /// finding list for this lens only.
    async fn run_specialist(
        &self,
        kind: SpecialistKind,
        context: &AnalysisContext,
    ) -> Vec<Finding> {
        let query = format!(
            "{} usability of: {}",
            kind.name(),
            context.captured.context_summary
        );
        let citations = self
            .knowledge
            .retrieve(&query, Some(kind.knowledge_category()))
            .await;

        let system = format!(
            "{}\n\nRespond with JSON only: {{\"findings\": [{{\"title\", \"severity\", \
             \"confidence\", \"category\", \"description\", \"suggested_fix\", \
             \"affected_tasks\"}}]}}",
            kind.lens_prompt()
        );
        let prompt = build_analysis_prompt(context, &citations);

        match self.model.chat_json(&system, &prompt, ANALYSIS_TEMPERATURE).await {
            Ok(value) => {
                let raw = decode_findings(value);
                info!(agent = kind.name(), findings = raw.len(), "specialist finished");
                raw.into_iter()
                    .map(|r| normalize(r, kind.name(), &citations))
                    .collect()
            }
            Err(e) => {
                warn!(agent = kind.name(), error = %e, "specialist failed, continuing without it");
                vec![]
            }
        }
    }
}

fn build_analysis_prompt(context: &AnalysisContext, citations: &[Citation]) -> String {
    let mut prompt = String::new();

    prompt.push_str("## Persona under test\n");
    prompt.push_str(&build_system_prompt(&context.persona));

    prompt.push_str("\n\n## Tasks attempted\n");
    for (i, task) in context.tasks.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, task));
    }

    prompt.push_str("\n## What happened\n");
    prompt.push_str(&context.task_summary);

    prompt.push_str("\n\n## Page context\n");
    prompt.push_str(&context.captured.context_summary);

    if context.captured.screenshot_b64.is_some() {
        prompt.push_str("\n\nA screenshot of the final page state is attached.");
    }

    if !citations.is_empty() {
        // Secondary context only: analysis is persona-driven first.
        prompt.push_str("\n\n## Reference heuristics (secondary validation)\n");
        for citation in citations {
            prompt.push_str(&format!("- {}: {}\n", citation.title, citation.excerpt));
        }
    }

    prompt
}

/// Severity-partitioned synthesis of a flat finding list.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Synthesis {
    pub high: Vec<Finding>,
    pub medium: Vec<Finding>,
    pub low: Vec<Finding>,
    pub summary: String,
}

/// Partition findings into high/medium/low buckets (High bucket takes
/// Blocker and High) and produce a short deterministic summary.
pub fn synthesize(findings: Vec<Finding>) -> Synthesis {
    let mut high = Vec::new();
    let mut medium = Vec::new();
    let mut low = Vec::new();

    for finding in findings {
        match finding.severity {
            Severity::Blocker | Severity::High => high.push(finding),
            Severity::Med => medium.push(finding),
            Severity::Low => low.push(finding),
        }
    }

    let total = high.len() + medium.len() + low.len();
    let summary = if total == 0 {
        "No findings were produced for this run.".to_string()
    } else {
        let top = high
            .iter()
            .max_by_key(|f| (f.severity, f.confidence))
            .or_else(|| medium.first())
            .or_else(|| low.first());
        match top {
            Some(top) => format!(
                "{} finding(s): {} high-priority, {} medium, {} low. Most pressing: {}.",
                total,
                high.len(),
                medium.len(),
                low.len(),
                top.title
            ),
            None => format!("{} finding(s).", total),
        }
    };

    Synthesis {
        high,
        medium,
        low,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnowledgeConfig;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    fn persona() -> Persona {
        Persona {
            id: "p1".to_string(),
            name: "Maya".to_string(),
            role: "busy parent".to_string(),
            goals: vec!["buy groceries".to_string()],
            behaviors: vec![],
            frustrations: vec![],
            constraints: vec![],
            accessibility_needs: vec!["large text".to_string()],
            version_id: None,
            created_at: Utc::now(),
        }
    }

    fn context() -> AnalysisContext {
        AnalysisContext {
            captured: CapturedContext {
                screenshot_b64: None,
                screenshot_url: None,
                context_summary: "Page: Checkout".to_string(),
            },
            tasks: vec!["Check out".to_string()],
            persona: persona(),
            task_summary: "1 of 1 tasks completed".to_string(),
        }
    }

    /// Model double that answers each lens differently and can fail one lens.
    struct LensModel {
        fail_lens: Option<&'static str>,
    }

    #[async_trait]
    impl ChatModel for LensModel {
        async fn chat_json(
            &self,
            system: &str,
            _prompt: &str,
            temperature: f32,
        ) -> Result<Value> {
            assert!((temperature - 0.3).abs() < f32::EPSILON);
            let lens = if system.contains("UX researcher") {
                "ux"
            } else if system.contains("accessibility specialist") {
                "accessibility"
            } else {
                "conversion"
            };
            if self.fail_lens == Some(lens) {
                return Err(Error::llm("model quota exceeded"));
            }
            Ok(json!({
                "findings": [{
                    "title": format!("{} issue", lens),
                    "severity": "high",
                    "confidence": 80,
                    "category": "navigation",
                    "description": "d"
                }]
            }))
        }

        async fn chat_text(
            &self,
            _system: &str,
            _prompt: &str,
            _temperature: f32,
        ) -> Result<String> {
            Err(Error::llm("not used"))
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::llm("no embeddings in this double"))
        }
    }

    fn engine(fail_lens: Option<&'static str>) -> ReasoningEngine {
        let model: Arc<dyn ChatModel> = Arc::new(LensModel { fail_lens });
        let knowledge = Arc::new(KnowledgeStore::new(
            vec![],
            model.clone(),
            &KnowledgeConfig::default(),
        ));
        ReasoningEngine::new(model, knowledge)
    }

    fn finding(title: &str, severity: Severity, confidence: u8) -> Finding {
        Finding {
            title: title.to_string(),
            severity,
            confidence,
            confidence_level: ConfidenceLevel::from_score(confidence),
            category: FindingCategory::Other,
            description: String::new(),
            suggested_fix: String::new(),
            affected_tasks: vec![],
            evidence: vec![],
            citations: vec![],
            agent: "ux".to_string(),
            developer_outputs: None,
        }
    }

    #[test]
    fn test_decode_wrapped_list() {
        let raw = decode_findings(json!({"findings": [{"title": "A"}, {"title": "B"}]}));
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].title, "A");
    }

    #[test]
    fn test_decode_wrapped_single_object() {
        let raw = decode_findings(json!({"findings": {"title": "Only one"}}));
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].title, "Only one");
    }

    #[test]
    fn test_decode_bare_array() {
        let raw = decode_findings(json!([{"title": "A"}]));
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn test_decode_bare_object() {
        let raw = decode_findings(json!({"title": "Bare", "severity": "low"}));
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].title, "Bare");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_findings(json!("nonsense")).is_empty());
        assert!(decode_findings(json!(42)).is_empty());
    }

    #[test]
    fn test_normalize_defaults() {
        let raw = decode_findings(json!({"title": "Minimal"})).remove(0);
        let finding = normalize(raw, "ux", &[]);
        assert_eq!(finding.severity, Severity::Med);
        assert_eq!(finding.confidence, 50);
        assert_eq!(finding.confidence_level, ConfidenceLevel::Med);
        assert_eq!(finding.category, FindingCategory::Other);
        assert_eq!(finding.agent, "ux");
    }

    #[test]
    fn test_normalize_full() {
        let raw = decode_findings(json!({
            "title": "Tiny targets",
            "severity": "critical",
            "confidence": 92,
            "category": "accessibility"
        }))
        .remove(0);
        let citations = vec![Citation {
            source: "s".to_string(),
            title: "t".to_string(),
            excerpt: "e".to_string(),
        }];
        let finding = normalize(raw, "accessibility", &citations);
        assert_eq!(finding.severity, Severity::Blocker);
        assert_eq!(finding.confidence, 92);
        assert_eq!(finding.confidence_level, ConfidenceLevel::High);
        assert_eq!(finding.category, FindingCategory::Accessibility);
        assert_eq!(finding.citations.len(), 1);
    }

    #[test]
    fn test_normalize_clamps_confidence() {
        let raw = decode_findings(json!({"title": "x", "confidence": 400})).remove(0);
        assert_eq!(normalize(raw, "ux", &[]).confidence, 100);
    }

    #[tokio::test]
    async fn test_analyze_all_lenses() {
        let findings = engine(None).analyze(&context()).await;
        assert_eq!(findings.len(), 3);
        let agents: Vec<&str> = findings.iter().map(|f| f.agent.as_str()).collect();
        assert!(agents.contains(&"ux"));
        assert!(agents.contains(&"accessibility"));
        assert!(agents.contains(&"conversion"));
    }

    #[tokio::test]
    async fn test_analyze_isolates_failed_lens() {
        // The accessibility specialist throws; the other two still land.
        let findings = engine(Some("accessibility")).analyze(&context()).await;
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.agent != "accessibility"));
    }

    #[test]
    fn test_synthesize_partitions() {
        let synthesis = synthesize(vec![
            finding("blocker", Severity::Blocker, 90),
            finding("high", Severity::High, 80),
            finding("med", Severity::Med, 50),
            finding("low", Severity::Low, 30),
        ]);
        assert_eq!(synthesis.high.len(), 2);
        assert_eq!(synthesis.medium.len(), 1);
        assert_eq!(synthesis.low.len(), 1);
        assert!(synthesis.summary.contains("4 finding(s)"));
        assert!(synthesis.summary.contains("blocker"));
    }

    #[test]
    fn test_synthesize_empty() {
        let synthesis = synthesize(vec![]);
        assert!(synthesis.high.is_empty());
        assert!(synthesis.summary.contains("No findings"));
    }
}
