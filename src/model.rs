//! Core data model shared across the run pipeline: findings, evidence,
//! timeline events, task results and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Finding severity on the ordinal scale Low < Med < High < Blocker.
///
/// Variant order matters: `Ord` is derived and the comparison engine relies
/// on it for regression detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Med,
    High,
    Blocker,
}

impl Severity {
    /// Normalize free-text severity into the four-value enum.
    ///
    /// Case-insensitive match; "critical" maps to Blocker; numeric 1-3 map to
    /// Low/Med/High; anything unrecognized lands on Med.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "blocker" | "critical" => Severity::Blocker,
            "high" | "3" => Severity::High,
            "medium" | "med" | "2" => Severity::Med,
            "low" | "1" => Severity::Low,
            _ => Severity::Med,
        }
    }

    /// Normalize a JSON value (string or number) into a severity.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Severity::normalize(s),
            Value::Number(n) => match n.as_i64() {
                Some(1) => Severity::Low,
                Some(2) => Severity::Med,
                Some(3) => Severity::High,
                _ => Severity::Med,
            },
            _ => Severity::Med,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Med => "Med",
            Severity::High => "High",
            Severity::Blocker => "Blocker",
        }
    }
}

/// Derived confidence level over the 0-100 confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    Low,
    Med,
    High,
}

impl ConfidenceLevel {
    /// Boundaries 70 and 40 are inclusive.
    pub fn from_score(score: u8) -> Self {
        if score >= 70 {
            ConfidenceLevel::High
        } else if score >= 40 {
            ConfidenceLevel::Med
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Closed category set for findings. Unknown text maps to Other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Navigation,
    Forms,
    Content,
    Accessibility,
    Performance,
    Trust,
    Conversion,
    Other,
}

impl FindingCategory {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "navigation" => FindingCategory::Navigation,
            "forms" | "form" => FindingCategory::Forms,
            "content" => FindingCategory::Content,
            "accessibility" | "a11y" => FindingCategory::Accessibility,
            "performance" => FindingCategory::Performance,
            "trust" => FindingCategory::Trust,
            "conversion" => FindingCategory::Conversion,
            _ => FindingCategory::Other,
        }
    }
}

/// Location of a UI element implicated by an evidence snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiAnchor {
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Structured link between a finding and what happened in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSnippet {
    pub persona_name: String,
    pub persona_role: String,
    pub task_context: String,
    /// Ordered "what happened" steps, oldest first.
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<UiAnchor>,
    pub screenshot_index: u32,
    pub timestamp: DateTime<Utc>,
}

/// One identified usability issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub severity: Severity,
    /// 0-100.
    pub confidence: u8,
    pub confidence_level: ConfidenceLevel,
    pub category: FindingCategory,
    pub description: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default)]
    pub affected_tasks: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceSnippet>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Which specialist lens produced this finding.
    #[serde(default)]
    pub agent: String,
    /// Optional developer-facing outputs (repro notes, selectors, etc).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_outputs: Option<Value>,
}

impl Finding {
    /// Finding identity for comparison/aggregation: case-insensitive exact
    /// title match. Near-duplicates with different wording do not merge.
    pub fn identity(&self) -> String {
        self.title.trim().to_lowercase()
    }
}

/// Citable reference passage attached to findings as secondary validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub title: String,
    pub excerpt: String,
}

/// Immutable reference passage in the knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub category: String,
    pub source: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Timeline event kinds. Click/Submit/Error feed evidence snippets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Click,
    Submit,
    Navigation,
    Error,
    TaskComplete,
    TaskError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub kind: EventKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(kind: EventKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            selector: None,
            frame: None,
            timestamp: Utc::now(),
        }
    }
}

/// How a task was ultimately executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskMethod {
    ObserveAct,
    Act,
    Agent,
}

/// Outcome of one task attempt, as recorded by the orchestrator.
///
/// An unsuccessful result with an explanation is a soft failure (the persona
/// got stuck); one with only an error is a hard failure. Both kinds let the
/// run continue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<TaskMethod>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run status. Transitions are monotonic: Queued -> Running -> Completed|Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Error,
}

/// One execution of a test against a persona version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub test_id: String,
    pub persona_version_id: String,
    pub status: RunStatus,
    /// 0-100. Completed status does not imply 100.
    pub completion_pct: u8,
    pub total_tasks: usize,
    pub duration_ms: u64,
    pub action_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A usability test definition: target URL plus an ordered, immutable task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: String,
    pub name: String,
    pub target_url: String,
    pub persona_id: String,
    pub tasks: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_normalize_names() {
        assert_eq!(Severity::normalize("blocker"), Severity::Blocker);
        assert_eq!(Severity::normalize("critical"), Severity::Blocker);
        assert_eq!(Severity::normalize("HIGH"), Severity::High);
        assert_eq!(Severity::normalize("Medium"), Severity::Med);
        assert_eq!(Severity::normalize("med"), Severity::Med);
        assert_eq!(Severity::normalize("low"), Severity::Low);
    }

    #[test]
    fn test_severity_normalize_numeric_and_unknown() {
        assert_eq!(Severity::normalize("1"), Severity::Low);
        assert_eq!(Severity::normalize("2"), Severity::Med);
        assert_eq!(Severity::normalize("3"), Severity::High);
        assert_eq!(Severity::normalize("n/a"), Severity::Med);
        assert_eq!(Severity::normalize(""), Severity::Med);
    }

    #[test]
    fn test_severity_from_value() {
        assert_eq!(Severity::from_value(&json!("critical")), Severity::Blocker);
        assert_eq!(Severity::from_value(&json!(3)), Severity::High);
        assert_eq!(Severity::from_value(&json!(1)), Severity::Low);
        assert_eq!(Severity::from_value(&json!(null)), Severity::Med);
        assert_eq!(Severity::from_value(&json!(42)), Severity::Med);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Med);
        assert!(Severity::Med < Severity::High);
        assert!(Severity::High < Severity::Blocker);
    }

    #[test]
    fn test_confidence_level_boundaries() {
        assert_eq!(ConfidenceLevel::from_score(85), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(70), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(69), ConfidenceLevel::Med);
        assert_eq!(ConfidenceLevel::from_score(50), ConfidenceLevel::Med);
        assert_eq!(ConfidenceLevel::from_score(40), ConfidenceLevel::Med);
        assert_eq!(ConfidenceLevel::from_score(39), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(10), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0), ConfidenceLevel::Low);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(FindingCategory::parse("Navigation"), FindingCategory::Navigation);
        assert_eq!(FindingCategory::parse("a11y"), FindingCategory::Accessibility);
        assert_eq!(FindingCategory::parse("something else"), FindingCategory::Other);
        assert_eq!(FindingCategory::parse(""), FindingCategory::Other);
    }

    #[test]
    fn test_finding_identity_case_insensitive() {
        let f = Finding {
            title: "  Confusing Checkout  ".to_string(),
            severity: Severity::High,
            confidence: 80,
            confidence_level: ConfidenceLevel::High,
            category: FindingCategory::Conversion,
            description: String::new(),
            suggested_fix: String::new(),
            affected_tasks: vec![],
            evidence: vec![],
            citations: vec![],
            agent: "ux".to_string(),
            developer_outputs: None,
        };
        assert_eq!(f.identity(), "confusing checkout");
    }

    #[test]
    fn test_task_result_serialization() {
        let result = TaskResult {
            task: "Click submit".to_string(),
            success: false,
            method: Some(TaskMethod::Agent),
            duration_ms: 1200,
            explanation: Some("I couldn't find the submit button".to_string()),
            error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"method\":\"agent\""));
        let back: TaskResult = serde_json::from_str(&json).unwrap();
        assert!(!back.success);
        assert!(back.explanation.is_some());
        assert!(back.error.is_none());
    }

    #[test]
    fn test_timeline_event_new() {
        let ev = TimelineEvent::new(EventKind::Click, "Submit button");
        assert_eq!(ev.kind, EventKind::Click);
        assert_eq!(ev.label, "Submit button");
        assert!(ev.selector.is_none());
    }
}
