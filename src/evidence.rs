//! Evidence capture: screenshots, compact page-context summaries and
//! structured evidence snippets linking findings to what actually happened.
//!
//! Capture is single-shot and forgiving. Non-essential failures (screenshot
//! upload, context extraction) are logged and swallowed; nothing here may
//! fail a run.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::automation::{AgentMessage, AutomationProvider, SessionHandle};
use crate::model::{EvidenceSnippet, EventKind, TimelineEvent, UiAnchor};
use crate::persona::Persona;
use crate::store::BlobStore;

/// How many trailing interaction events feed a snippet.
const SNIPPET_EVENT_WINDOW: usize = 6;
/// Upper bound on summary lines extracted from the page context.
const SUMMARY_MAX_LINES: usize = 40;
/// Assistant messages longer than this read like essays, not quotes.
const QUOTE_MAX_LEN: usize = 240;

/// Captured page state shared by all specialist agents.
#[derive(Debug, Clone, Default)]
pub struct CapturedContext {
    pub screenshot_b64: Option<String>,
    pub screenshot_url: Option<String>,
    pub context_summary: String,
}

pub struct EvidenceCapture {
    provider: Arc<dyn AutomationProvider>,
    blob: Arc<dyn BlobStore>,
}

impl EvidenceCapture {
    pub fn new(provider: Arc<dyn AutomationProvider>, blob: Arc<dyn BlobStore>) -> Self {
        Self { provider, blob }
    }

    /// Snapshot the page: screenshot (encoded, best-effort uploaded) plus a
    /// compact DOM/accessibility summary. Never fails; missing pieces are
    /// logged and left empty.
    pub async fn capture(
        &self,
        run_id: &str,
        handle: &SessionHandle,
        screenshot_index: u32,
    ) -> CapturedContext {
        let mut captured = CapturedContext::default();

        match self.provider.screenshot(handle).await {
            Ok(bytes) => {
                captured.screenshot_b64 = Some(STANDARD.encode(&bytes));
                match self
                    .blob
                    .upload_screenshot(run_id, screenshot_index, &bytes)
                    .await
                {
                    Ok(url) => captured.screenshot_url = Some(url),
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "screenshot upload failed");
                    }
                }
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "screenshot capture failed");
            }
        }

        match self.provider.extract_context(handle).await {
            Ok(context) => {
                captured.context_summary = summarize_context(&context);
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "context extraction failed");
            }
        }

        captured
    }

    /// Archive the finished report payload to blob storage. Best-effort like
    /// every other upload here.
    pub async fn archive(&self, run_id: &str, payload: &Value) {
        if let Err(e) = self.blob.upload_evidence(run_id, payload).await {
            warn!(run_id = %run_id, error = %e, "evidence archive failed");
        }
    }
}

/// Assemble an evidence snippet from the recent timeline, the agent's
/// reasoning history and the persona profile.
pub fn build_snippet(
    persona: &Persona,
    task_context: &str,
    timeline: &[TimelineEvent],
    agent_history: &[AgentMessage],
    screenshot_index: u32,
) -> EvidenceSnippet {
    let relevant: Vec<&TimelineEvent> = timeline
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Click | EventKind::Submit | EventKind::Error))
        .collect();
    let window = &relevant[relevant.len().saturating_sub(SNIPPET_EVENT_WINDOW)..];

    let steps = window.iter().map(|e| describe_event(e)).collect();
    let anchor = window.iter().rev().find_map(|e| {
        e.selector.as_ref().map(|selector| UiAnchor {
            selector: selector.clone(),
            frame: e.frame.clone(),
            bounding_box: None,
        })
    });

    EvidenceSnippet {
        persona_name: persona.name.clone(),
        persona_role: persona.role.clone(),
        task_context: task_context.to_string(),
        steps,
        quote: persona_quote(agent_history),
        anchor,
        screenshot_index,
        timestamp: Utc::now(),
    }
}

fn describe_event(event: &TimelineEvent) -> String {
    match event.kind {
        EventKind::Click => format!("clicked \"{}\"", event.label),
        EventKind::Submit => format!("submitted \"{}\"", event.label),
        EventKind::Error => format!("hit an error: {}", event.label),
        EventKind::Navigation => format!("navigated to {}", event.label),
        EventKind::TaskComplete => format!("completed task: {}", event.label),
        EventKind::TaskError => format!("failed task: {}", event.label),
    }
}

/// Extract a first-person quote from the agent's reasoning history.
///
/// A structured `rationale` field wins; otherwise the most recent short
/// assistant message is used.
pub fn persona_quote(history: &[AgentMessage]) -> Option<String> {
    if let Some(rationale) = history.iter().rev().find_map(|m| {
        m.rationale
            .as_ref()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
    }) {
        return Some(rationale.to_string());
    }

    history
        .iter()
        .rev()
        .find(|m| {
            m.role == "assistant"
                && !m.content.trim().is_empty()
                && m.content.trim().len() <= QUOTE_MAX_LEN
        })
        .map(|m| m.content.trim().to_string())
}

/// Compress the provider's extracted page context into a few dozen lines of
/// text the reasoning agents can actually read: page title/URL, landmarks and
/// labelled interactive elements.
pub fn summarize_context(context: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(meta) = context.pointer("/page_metadata/data") {
        if let Some(title) = meta.get("title").and_then(Value::as_str) {
            lines.push(format!("Page: {}", title));
        }
        if let Some(url) = meta.get("url").and_then(Value::as_str) {
            lines.push(format!("URL: {}", url));
        }
    }

    if let Some(tree) = context.pointer("/accessibility_tree/data") {
        walk_a11y(tree, &mut lines);
    }

    lines.truncate(SUMMARY_MAX_LINES);
    lines.join("\n")
}

fn walk_a11y(node: &Value, lines: &mut Vec<String>) {
    if lines.len() >= SUMMARY_MAX_LINES {
        return;
    }

    let role = node.get("role").and_then(Value::as_str).unwrap_or("");
    let name = node.get("accessibleName").and_then(Value::as_str).unwrap_or("");
    let is_landmark = node
        .get("isLandmark")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let is_focusable = node
        .get("isFocusable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if is_landmark {
        lines.push(format!("[{}] {}", role, name));
    } else if is_focusable && !name.is_empty() {
        lines.push(format!("  {} \"{}\"", role, name));
    }

    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            walk_a11y(child, lines);
        }
    }
}
