//! Browser automation provider seam.
//!
//! The orchestration core never talks to a browser directly; it goes through
//! [`AutomationProvider`]. The production implementation ([`HttpAutomation`])
//! drives the automation backend over HTTP; tests substitute scripted doubles.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::AutomationConfig;
use crate::error::{Error, Result};
use crate::model::{EventKind, TimelineEvent};

/// Opaque handle to one live browser session at the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    pub external_id: String,
}

/// One candidate action proposed by the automation layer for an instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Configuration for the autonomous multi-step agent fallback.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub instruction: String,
    pub system_prompt: String,
    pub highlight_cursor: bool,
    pub max_steps: u32,
    pub stream: bool,
}

/// Final agent verdict. `success && completed` is the only positive signal;
/// anything else means the agent got stuck and `message` carries its last words.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub completed: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Vec<AgentMessage>,
}

/// One entry of the agent's reasoning history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// A running agent: a bounded channel of streamed reasoning chunks plus the
/// awaited completion. The consumer drains chunks independently of awaiting
/// the completion; neither blocks the other.
pub struct AgentRun {
    pub chunks: mpsc::Receiver<String>,
    pub completion: oneshot::Receiver<Result<AgentOutcome>>,
}

/// Bound on in-flight reasoning chunks before the producer backs off.
pub const AGENT_CHUNK_BUFFER: usize = 32;

#[async_trait]
pub trait AutomationProvider: Send + Sync {
    async fn open_session(&self, url: &str) -> Result<SessionHandle>;

    async fn close_session(&self, handle: &SessionHandle) -> Result<()>;

    async fn inject_style(&self, handle: &SessionHandle, css: &str) -> Result<()>;

    /// Request candidate actions for an instruction. May legitimately be empty.
    async fn propose_actions(
        &self,
        handle: &SessionHandle,
        instruction: &str,
    ) -> Result<Vec<ProposedAction>>;

    /// Execute one proposed candidate directly.
    async fn execute_candidate(
        &self,
        handle: &SessionHandle,
        action: &ProposedAction,
    ) -> Result<Vec<TimelineEvent>>;

    /// Execute a natural-language instruction in one shot.
    async fn execute_action(
        &self,
        handle: &SessionHandle,
        instruction: &str,
    ) -> Result<Vec<TimelineEvent>>;

    /// Launch the autonomous multi-step agent.
    async fn run_agent(&self, handle: &SessionHandle, config: AgentConfig) -> Result<AgentRun>;

    async fn get_debug_url(&self, external_id: &str) -> Result<String>;

    /// Encoded still image of the current page.
    async fn screenshot(&self, handle: &SessionHandle) -> Result<Vec<u8>>;

    /// Structured DOM/accessibility/metadata context for the current page.
    async fn extract_context(&self, handle: &SessionHandle) -> Result<Value>;
}

/// HTTP implementation against the automation backend.
pub struct HttpAutomation {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct StartSessionRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ScreenshotResponse {
    screenshot: String,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    context: Value,
}

#[derive(Debug, Deserialize)]
struct ProposeResponse {
    #[serde(default)]
    actions: Vec<ProposedAction>,
}

#[derive(Debug, Deserialize)]
struct ActResponse {
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    kind: String,
    label: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    frame: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    success: bool,
    completed: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    history: Vec<AgentMessage>,
    #[serde(default)]
    reasoning_chunks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DebugUrlResponse {
    url: String,
}

impl WireEvent {
    fn into_event(self) -> TimelineEvent {
        let kind = match self.kind.as_str() {
            "click" => EventKind::Click,
            "submit" => EventKind::Submit,
            "navigation" => EventKind::Navigation,
            "error" => EventKind::Error,
            _ => EventKind::Navigation,
        };
        let mut event = TimelineEvent::new(kind, self.label);
        event.selector = self.selector;
        event.frame = self.frame;
        event
    }
}

impl HttpAutomation {
    pub fn new(config: &AutomationConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(180))
                .build()
                .expect("failed to create HTTP client"),
            base_url: config.base_url.clone(),
        }
    }

    async fn post_json<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::provider(format!("{} returned {}: {}", path, status, text)));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::provider(format!("{} returned malformed body: {}", path, e)))
    }
}

#[async_trait]
impl AutomationProvider for HttpAutomation {
    async fn open_session(&self, url: &str) -> Result<SessionHandle> {
        let response: StartSessionResponse =
            self.post_json("/start", &StartSessionRequest { url }).await?;
        info!(external_id = %response.session_id, "browser session opened");
        Ok(SessionHandle {
            external_id: response.session_id,
        })
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<()> {
        let _: Value = self
            .post_json(
                "/close",
                &serde_json::json!({ "sessionId": handle.external_id }),
            )
            .await?;
        Ok(())
    }

    async fn inject_style(&self, handle: &SessionHandle, css: &str) -> Result<()> {
        let _: Value = self
            .post_json(
                "/inject-style",
                &serde_json::json!({ "sessionId": handle.external_id, "css": css }),
            )
            .await?;
        Ok(())
    }

    async fn propose_actions(
        &self,
        handle: &SessionHandle,
        instruction: &str,
    ) -> Result<Vec<ProposedAction>> {
        let response: ProposeResponse = self
            .post_json(
                "/propose",
                &serde_json::json!({
                    "sessionId": handle.external_id,
                    "instruction": instruction,
                }),
            )
            .await?;
        Ok(response.actions)
    }

    async fn execute_candidate(
        &self,
        handle: &SessionHandle,
        action: &ProposedAction,
    ) -> Result<Vec<TimelineEvent>> {
        let response: ActResponse = self
            .post_json(
                "/act",
                &serde_json::json!({
                    "sessionId": handle.external_id,
                    "action": action,
                }),
            )
            .await?;
        Ok(response.events.into_iter().map(WireEvent::into_event).collect())
    }

    async fn execute_action(
        &self,
        handle: &SessionHandle,
        instruction: &str,
    ) -> Result<Vec<TimelineEvent>> {
        let response: ActResponse = self
            .post_json(
                "/act",
                &serde_json::json!({
                    "sessionId": handle.external_id,
                    "instruction": instruction,
                }),
            )
            .await?;
        Ok(response.events.into_iter().map(WireEvent::into_event).collect())
    }

    async fn run_agent(&self, handle: &SessionHandle, config: AgentConfig) -> Result<AgentRun> {
        let (chunk_tx, chunk_rx) = mpsc::channel(AGENT_CHUNK_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();

        let response: Result<AgentResponse> = self
            .post_json(
                "/agent",
                &serde_json::json!({
                    "sessionId": handle.external_id,
                    "config": config,
                }),
            )
            .await;

        // Feed the backend's buffered reasoning through the same channel
        // contract a true streaming transport would use, so the executor's
        // drain loop is exercised identically either way.
        tokio::spawn(async move {
            match response {
                Ok(agent) => {
                    for chunk in &agent.reasoning_chunks {
                        if chunk_tx.send(chunk.clone()).await.is_err() {
                            break;
                        }
                    }
                    let _ = done_tx.send(Ok(AgentOutcome {
                        success: agent.success,
                        completed: agent.completed,
                        message: agent.message,
                        history: agent.history,
                    }));
                }
                Err(e) => {
                    let _ = done_tx.send(Err(e));
                }
            }
        });

        Ok(AgentRun {
            chunks: chunk_rx,
            completion: done_rx,
        })
    }

    async fn get_debug_url(&self, external_id: &str) -> Result<String> {
        let response: DebugUrlResponse = self
            .post_json(
                "/debug-url",
                &serde_json::json!({ "sessionId": external_id }),
            )
            .await?;
        Ok(response.url)
    }

    async fn screenshot(&self, handle: &SessionHandle) -> Result<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let response: ScreenshotResponse = self
            .post_json(
                "/screenshot",
                &serde_json::json!({ "sessionId": handle.external_id }),
            )
            .await?;
        STANDARD
            .decode(response.screenshot.as_bytes())
            .map_err(|e| Error::provider(format!("screenshot is not valid base64: {}", e)))
    }

    async fn extract_context(&self, handle: &SessionHandle) -> Result<Value> {
        let response: ContextResponse = self
            .post_json(
                "/extract-context",
                &serde_json::json!({ "sessionId": handle.external_id }),
            )
            .await?;
        Ok(response.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_event_mapping() {
        let wire = WireEvent {
            kind: "click".to_string(),
            label: "Submit".to_string(),
            selector: Some("#submit".to_string()),
            frame: None,
        };
        let event = wire.into_event();
        assert_eq!(event.kind, EventKind::Click);
        assert_eq!(event.selector.as_deref(), Some("#submit"));

        let wire = WireEvent {
            kind: "weird".to_string(),
            label: "x".to_string(),
            selector: None,
            frame: None,
        };
        assert_eq!(wire.into_event().kind, EventKind::Navigation);
    }

    #[test]
    fn test_agent_response_deserialization() {
        let json = r#"{
            "success": true,
            "completed": false,
            "message": "Could not find the checkout button",
            "history": [
                {"role": "assistant", "content": "Looking for checkout", "rationale": "The cart icon seems clickable"}
            ],
            "reasoning_chunks": ["Looking around. ", "Trying the cart."]
        }"#;
        let parsed: AgentResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.success);
        assert!(!parsed.completed);
        assert_eq!(parsed.reasoning_chunks.len(), 2);
        assert_eq!(
            parsed.history[0].rationale.as_deref(),
            Some("The cart icon seems clickable")
        );
    }

    #[test]
    fn test_proposed_action_defaults() {
        let json = r#"{"description": "Click the login link"}"#;
        let action: ProposedAction = serde_json::from_str(json).unwrap();
        assert_eq!(action.description, "Click the login link");
        assert!(action.selector.is_none());
        assert!(action.method.is_empty());
    }
}
