//! Comparison/aggregation engine: pairwise diffing of two runs and
//! single-pass aggregation across N runs of the same test.
//!
//! Pure functions over persisted findings. Nothing here touches the store or
//! the network, so repeated invocation on the same inputs is byte-identical.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{Finding, Severity};

/// Hotspots returned per multi-run aggregation.
const HOTSPOT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub blocker: usize,
    pub high: usize,
    pub med: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn tally(findings: &[Finding]) -> Self {
        let mut counts = SeverityCounts::default();
        for finding in findings {
            match finding.severity {
                Severity::Blocker => counts.blocker += 1,
                Severity::High => counts.high += 1,
                Severity::Med => counts.med += 1,
                Severity::Low => counts.low += 1,
            }
        }
        counts
    }
}

/// A finding present in both runs whose severity rose on the ordinal scale.
///
/// Severity must rise for a regression; a finding that merely appears more
/// often at the same severity is not one.
#[derive(Debug, Clone, Serialize)]
pub struct Regression {
    pub title: String,
    pub from: Severity,
    pub to: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairwiseComparison {
    pub baseline_run: String,
    pub candidate_run: String,
    pub baseline_counts: SeverityCounts,
    pub candidate_counts: SeverityCounts,
    /// Titles in the baseline but not the candidate.
    pub resolved: Vec<String>,
    /// Titles in the candidate but not the baseline.
    pub new_findings: Vec<String>,
    pub regressions: Vec<Regression>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FindingTrend {
    /// Display title, as first seen.
    pub title: String,
    /// Runs this finding appeared in, in the order the runs were given.
    pub runs: Vec<String>,
    pub severity_by_run: BTreeMap<String, Severity>,
    pub frequency_by_run: BTreeMap<String, usize>,
}

/// A recurring UI area implicated across findings, keyed by frame plus a
/// coarse element label derived from the anchor selector.
#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    pub label: String,
    pub occurrences: usize,
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiRunComparison {
    pub run_ids: Vec<String>,
    pub trends: Vec<FindingTrend>,
    pub hotspots: Vec<Hotspot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ComparisonResult {
    Pairwise(PairwiseComparison),
    MultiRun(MultiRunComparison),
}

/// Collapse one run's findings into an identity map. Duplicate titles within
/// a run keep the worst severity.
fn identity_map(findings: &[Finding]) -> BTreeMap<String, Severity> {
    let mut map: BTreeMap<String, Severity> = BTreeMap::new();
    for finding in findings {
        map.entry(finding.identity())
            .and_modify(|s| *s = (*s).max(finding.severity))
            .or_insert(finding.severity);
    }
    map
}

/// Remember one display title per identity so output keeps human casing.
fn display_titles(findings: &[Finding]) -> BTreeMap<String, String> {
    let mut titles = BTreeMap::new();
    for finding in findings {
        titles
            .entry(finding.identity())
            .or_insert_with(|| finding.title.trim().to_string());
    }
    titles
}

/// Diff exactly two runs: resolved, new and regressed findings by
/// case-insensitive title identity.
pub fn compare_pair(
    baseline_run: &str,
    candidate_run: &str,
    baseline: &[Finding],
    candidate: &[Finding],
) -> PairwiseComparison {
    let base_map = identity_map(baseline);
    let cand_map = identity_map(candidate);
    let mut titles = display_titles(baseline);
    for (identity, title) in display_titles(candidate) {
        titles.entry(identity).or_insert(title);
    }
    let title_for = |identity: &str| -> String {
        titles
            .get(identity)
            .cloned()
            .unwrap_or_else(|| identity.to_string())
    };

    let resolved: Vec<String> = base_map
        .keys()
        .filter(|identity| !cand_map.contains_key(*identity))
        .map(|identity| title_for(identity))
        .collect();

    let new_findings: Vec<String> = cand_map
        .keys()
        .filter(|identity| !base_map.contains_key(*identity))
        .map(|identity| title_for(identity))
        .collect();

    let regressions: Vec<Regression> = base_map
        .iter()
        .filter_map(|(identity, from)| {
            cand_map.get(identity).and_then(|to| {
                (to > from).then(|| Regression {
                    title: title_for(identity),
                    from: *from,
                    to: *to,
                })
            })
        })
        .collect();

    PairwiseComparison {
        baseline_run: baseline_run.to_string(),
        candidate_run: candidate_run.to_string(),
        baseline_counts: SeverityCounts::tally(baseline),
        candidate_counts: SeverityCounts::tally(candidate),
        resolved,
        new_findings,
        regressions,
    }
}

/// Coarse element label for hotspot grouping: the last simple segment of the
/// selector, with pseudo-selectors stripped.
fn element_label(selector: &str) -> String {
    let last = selector
        .rsplit(|c: char| c == '>' || c.is_whitespace())
        .find(|s| !s.is_empty())
        .unwrap_or(selector);
    let label = match last.find(':') {
        Some(i) if i > 0 => &last[..i],
        _ => last,
    };
    if label.is_empty() {
        selector.trim().to_string()
    } else {
        label.to_string()
    }
}

/// Aggregate N runs of one test in a single pass over all findings: per-title
/// run-appearance sets, per-run severity and frequency, plus the top
/// confusion hotspots by anchor occurrence.
///
/// Deliberately O(total findings), not pairwise over C(N,2) run pairs.
pub fn aggregate_runs(runs: &[(String, Vec<Finding>)]) -> MultiRunComparison {
    struct TrendAcc {
        title: String,
        runs: Vec<String>,
        severity_by_run: BTreeMap<String, Severity>,
        frequency_by_run: BTreeMap<String, usize>,
    }

    let mut trends: BTreeMap<String, TrendAcc> = BTreeMap::new();
    let mut hotspots: BTreeMap<(Option<String>, String), (usize, Vec<String>)> = BTreeMap::new();

    for (run_id, findings) in runs {
        for finding in findings {
            let acc = trends
                .entry(finding.identity())
                .or_insert_with(|| TrendAcc {
                    title: finding.title.trim().to_string(),
                    runs: Vec::new(),
                    severity_by_run: BTreeMap::new(),
                    frequency_by_run: BTreeMap::new(),
                });
            if acc.runs.last() != Some(run_id) && !acc.runs.contains(run_id) {
                acc.runs.push(run_id.clone());
            }
            acc.severity_by_run
                .entry(run_id.clone())
                .and_modify(|s| *s = (*s).max(finding.severity))
                .or_insert(finding.severity);
            *acc.frequency_by_run.entry(run_id.clone()).or_insert(0) += 1;

            for snippet in &finding.evidence {
                if let Some(anchor) = &snippet.anchor {
                    let key = (anchor.frame.clone(), element_label(&anchor.selector));
                    let entry = hotspots.entry(key).or_insert_with(|| (0, Vec::new()));
                    entry.0 += 1;
                    if !entry.1.contains(&anchor.selector) {
                        entry.1.push(anchor.selector.clone());
                    }
                }
            }
        }
    }

    let mut hotspots: Vec<Hotspot> = hotspots
        .into_iter()
        .map(|((frame, label), (occurrences, selectors))| Hotspot {
            frame,
            label,
            occurrences,
            selectors,
        })
        .collect();
    hotspots.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.label.cmp(&b.label))
    });
    hotspots.truncate(HOTSPOT_LIMIT);

    MultiRunComparison {
        run_ids: runs.iter().map(|(id, _)| id.clone()).collect(),
        trends: trends
            .into_values()
            .map(|acc| FindingTrend {
                title: acc.title,
                runs: acc.runs,
                severity_by_run: acc.severity_by_run,
                frequency_by_run: acc.frequency_by_run,
            })
            .collect(),
        hotspots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfidenceLevel, EvidenceSnippet, FindingCategory, UiAnchor};
    use chrono::Utc;

    fn finding(title: &str, severity: Severity) -> Finding {
        Finding {
            title: title.to_string(),
            severity,
            confidence: 80,
            confidence_level: ConfidenceLevel::High,
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

    fn anchored(title: &str, severity: Severity, selector: &str, frame: Option<&str>) -> Finding {
        let mut f = finding(title, severity);
        f.evidence.push(EvidenceSnippet {
            persona_name: "Maya".to_string(),
            persona_role: "busy parent".to_string(),
            task_context: "checkout".to_string(),
            steps: vec![],
            quote: None,
            anchor: Some(UiAnchor {
                selector: selector.to_string(),
                frame: frame.map(|f| f.to_string()),
                bounding_box: None,
            }),
            screenshot_index: 0,
            timestamp: Utc::now(),
        });
        f
    }

    #[test]
    fn test_pairwise_resolved_new_regression() {
        let baseline = vec![finding("X", Severity::High)];
        let candidate = vec![finding("X", Severity::Blocker), finding("Y", Severity::Med)];
        let diff = compare_pair("r1", "r2", &baseline, &candidate);

        assert!(diff.resolved.is_empty());
        assert_eq!(diff.new_findings, vec!["Y"]);
        assert_eq!(diff.regressions.len(), 1);
        assert_eq!(diff.regressions[0].title, "X");
        assert_eq!(diff.regressions[0].from, Severity::High);
        assert_eq!(diff.regressions[0].to, Severity::Blocker);
        assert_eq!(diff.baseline_counts.high, 1);
        assert_eq!(diff.candidate_counts.blocker, 1);
        assert_eq!(diff.candidate_counts.med, 1);
    }

    #[test]
    fn test_pairwise_identity_case_insensitive() {
        let baseline = vec![finding("Confusing Checkout", Severity::Med)];
        let candidate = vec![finding("  confusing checkout ", Severity::Med)];
        let diff = compare_pair("r1", "r2", &baseline, &candidate);
        assert!(diff.resolved.is_empty());
        assert!(diff.new_findings.is_empty());
        assert!(diff.regressions.is_empty());
    }

    #[test]
    fn test_pairwise_severity_drop_not_regression() {
        let baseline = vec![finding("X", Severity::Blocker)];
        let candidate = vec![finding("X", Severity::Low)];
        let diff = compare_pair("r1", "r2", &baseline, &candidate);
        assert!(diff.regressions.is_empty());
    }

    #[test]
    fn test_pairwise_resolved() {
        let baseline = vec![finding("Old issue", Severity::High)];
        let candidate = vec![];
        let diff = compare_pair("r1", "r2", &baseline, &candidate);
        assert_eq!(diff.resolved, vec!["Old issue"]);
    }

    #[test]
    fn test_pairwise_duplicate_titles_keep_worst_severity() {
        let baseline = vec![finding("X", Severity::Low)];
        let candidate = vec![finding("X", Severity::Low), finding("X", Severity::High)];
        let diff = compare_pair("r1", "r2", &baseline, &candidate);
        assert_eq!(diff.regressions.len(), 1);
        assert_eq!(diff.regressions[0].to, Severity::High);
    }

    #[test]
    fn test_pairwise_frequency_increase_not_regression() {
        let baseline = vec![finding("X", Severity::Med)];
        let candidate = vec![finding("X", Severity::Med), finding("X", Severity::Med)];
        let diff = compare_pair("r1", "r2", &baseline, &candidate);
        assert!(diff.regressions.is_empty());
    }

    #[test]
    fn test_multi_run_appearance_sets() {
        let runs = vec![
            (
                "run1".to_string(),
                vec![finding("Confusing checkout", Severity::High)],
            ),
            ("run2".to_string(), vec![finding("Other", Severity::Low)]),
            (
                "run3".to_string(),
                vec![finding("Confusing checkout", Severity::Med)],
            ),
        ];
        let agg = aggregate_runs(&runs);

        let trend = agg
            .trends
            .iter()
            .find(|t| t.title == "Confusing checkout")
            .unwrap();
        assert_eq!(trend.runs, vec!["run1", "run3"]);
        assert!(!trend.severity_by_run.contains_key("run2"));
        assert_eq!(trend.severity_by_run["run1"], Severity::High);
        assert_eq!(trend.severity_by_run["run3"], Severity::Med);
        assert_eq!(trend.frequency_by_run["run1"], 1);
    }

    #[test]
    fn test_multi_run_frequency() {
        let runs = vec![(
            "run1".to_string(),
            vec![finding("X", Severity::Med), finding("x", Severity::High)],
        )];
        let agg = aggregate_runs(&runs);
        assert_eq!(agg.trends.len(), 1);
        assert_eq!(agg.trends[0].frequency_by_run["run1"], 2);
        assert_eq!(agg.trends[0].severity_by_run["run1"], Severity::High);
    }

    #[test]
    fn test_hotspot_grouping() {
        let runs = vec![
            (
                "run1".to_string(),
                vec![
                    anchored("A", Severity::Med, "#checkout-btn", None),
                    anchored("B", Severity::Med, "form > #checkout-btn:hover", None),
                ],
            ),
            (
                "run2".to_string(),
                vec![anchored("C", Severity::Med, "#other", Some("payment-frame"))],
            ),
        ];
        let agg = aggregate_runs(&runs);

        let checkout = agg
            .hotspots
            .iter()
            .find(|h| h.label == "#checkout-btn")
            .unwrap();
        assert_eq!(checkout.occurrences, 2);
        assert_eq!(checkout.selectors.len(), 2);

        let framed = agg.hotspots.iter().find(|h| h.label == "#other").unwrap();
        assert_eq!(framed.frame.as_deref(), Some("payment-frame"));
    }

    #[test]
    fn test_hotspot_top_ten_cap() {
        let findings: Vec<Finding> = (0..15)
            .map(|i| anchored(&format!("f{}", i), Severity::Med, &format!("#el-{}", i), None))
            .collect();
        let agg = aggregate_runs(&[("run1".to_string(), findings)]);
        assert_eq!(agg.hotspots.len(), 10);
    }

    #[test]
    fn test_element_label() {
        assert_eq!(element_label("#checkout-btn"), "#checkout-btn");
        assert_eq!(element_label("form > .submit"), ".submit");
        assert_eq!(element_label("div .btn:hover"), ".btn");
        assert_eq!(element_label("main button"), "button");
    }

    #[test]
    fn test_comparison_deterministic() {
        let baseline = vec![
            finding("B", Severity::Med),
            finding("A", Severity::High),
            finding("C", Severity::Low),
        ];
        let candidate = vec![finding("A", Severity::Blocker), finding("D", Severity::Med)];

        let first = serde_json::to_string(&compare_pair("r1", "r2", &baseline, &candidate))
            .expect("serialize");
        let second = serde_json::to_string(&compare_pair("r1", "r2", &baseline, &candidate))
            .expect("serialize");
        assert_eq!(first, second);

        let runs = vec![
            ("r1".to_string(), baseline),
            ("r2".to_string(), candidate),
        ];
        let first = serde_json::to_string(&aggregate_runs(&runs)).expect("serialize");
        let second = serde_json::to_string(&aggregate_runs(&runs)).expect("serialize");
        assert_eq!(first, second);
    }
}
