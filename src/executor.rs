//! Per-task execution cascade: plan-then-act, direct act, autonomous agent.
//!
//! Every failure mode is absorbed into a three-way [`TaskOutcome`] so the
//! orchestrator branches on an explicit tag instead of inspecting optional
//! fields. Only `Completed` counts toward the run's completion ratio; `Stuck`
//! carries a persona-voiced explanation (soft failure) and `Failed` carries
//! the raw error (hard failure). Neither stops the run.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::automation::{AgentConfig, AgentMessage, AutomationProvider, SessionHandle};
use crate::config::ExecutorConfig;
use crate::model::{TaskMethod, TimelineEvent};

/// Explicit three-way task result tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { method: TaskMethod },
    /// The agent ran but got stuck; explanation is in the persona's voice.
    Stuck { explanation: String },
    /// Execution itself failed; raw error, no persona voice.
    Failed { error: String },
}

/// Full record of one executor invocation.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: TaskOutcome,
    pub events: Vec<TimelineEvent>,
    pub agent_history: Vec<AgentMessage>,
    pub duration_ms: u64,
}

/// Callback for streamed agent reasoning text.
pub type ReasoningSink = Arc<dyn Fn(String) + Send + Sync>;

/// Minimum elapsed time before a non-sentence flush.
const FLUSH_INTERVAL_MS: u64 = 500;
/// Minimum non-whitespace characters before a timed flush fires.
const FLUSH_MIN_CHARS: usize = 5;

/// Accumulates streamed reasoning chunks and decides when to emit them.
///
/// Flush on a complete sentence boundary, or after `FLUSH_INTERVAL_MS` once
/// enough non-trivial characters accumulated; timed flushes prefer emitting
/// whole trailing sentences over raw buffer dumps.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    buf: String,
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; returns text to emit if a flush condition is met.
    /// `elapsed_ms` is time since the last emitted flush.
    pub fn push(&mut self, chunk: &str, elapsed_ms: u64) -> Option<String> {
        self.buf.push_str(chunk);

        let trimmed = self.buf.trim_end();
        if trimmed.is_empty() {
            return None;
        }

        // Complete sentence: emit everything.
        if trimmed.chars().last().map(is_sentence_end).unwrap_or(false) {
            let out = self.buf.trim().to_string();
            self.buf.clear();
            return Some(out);
        }

        let significant = self.buf.chars().filter(|c| !c.is_whitespace()).count();
        if elapsed_ms >= FLUSH_INTERVAL_MS && significant >= FLUSH_MIN_CHARS {
            // Prefer flushing up to the last finished sentence, holding the
            // unfinished tail back for the next flush.
            if let Some(pos) = self.buf.rfind(is_sentence_end) {
                let out = self.buf[..=pos].trim().to_string();
                self.buf = self.buf[pos + 1..].trim_start().to_string();
                return Some(out);
            }
            let out = self.buf.trim().to_string();
            self.buf.clear();
            return Some(out);
        }

        None
    }

    /// Emit whatever remains, if anything.
    pub fn flush_remaining(&mut self) -> Option<String> {
        let out = self.buf.trim().to_string();
        self.buf.clear();
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Force an agent's final message into first-person persona voice.
///
/// Empty or bracket-only inputs map to an empty string; any non-empty result
/// is guaranteed to start with "I".
pub fn format_explanation(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.is_empty() || text == "[]" || text == "{}" {
        return String::new();
    }

    // Strip a leading "As <Name>, " prefix.
    if let Some(rest) = text.strip_prefix("As ") {
        if let Some(idx) = rest.find(", ") {
            if idx <= 40 {
                text = rest[idx + 2..].to_string();
            }
        }
    }

    // Trailing colons.
    while text.ends_with(':') {
        text.pop();
    }
    text = text.trim().to_string();

    // Leading third-person references.
    if let Some(rest) = text.strip_prefix("The agent") {
        text = format!("I{}", rest);
    } else if let Some(rest) = text.strip_prefix("It ") {
        text = format!("I {}", rest);
    } else if let Some(rest) = text.strip_prefix("Agent ") {
        text = format!("I {}", rest);
    }

    // Mid-sentence references.
    text = text.replace("the agent", "I");
    text = text.replace("the system", "the interface");
    text = text.trim().to_string();

    if text.is_empty() {
        return String::new();
    }

    if text.len() < 20 && !text.starts_with('I') {
        text = format!("I'm {}", text);
    }

    if !text.starts_with('I') {
        let mut chars = text.chars();
        if let Some(first) = chars.next() {
            text = format!("I {}{}", first.to_lowercase(), chars.as_str());
        }
    }

    text
}

pub struct TaskExecutor {
    provider: Arc<dyn AutomationProvider>,
    act_timeout: Duration,
    agent_max_steps: u32,
}

impl TaskExecutor {
    pub fn new(provider: Arc<dyn AutomationProvider>, config: &ExecutorConfig) -> Self {
        Self {
            provider,
            act_timeout: Duration::from_secs(config.act_timeout_secs),
            agent_max_steps: config.agent_max_steps,
        }
    }

    #[cfg(test)]
    fn with_act_timeout(mut self, timeout: Duration) -> Self {
        self.act_timeout = timeout;
        self
    }

    /// Run the cascade for one instruction. Never errors; every failure mode
    /// lands in the returned [`TaskOutcome`].
    pub async fn execute(
        &self,
        handle: &SessionHandle,
        instruction: &str,
        system_prompt: &str,
        reasoning_sink: Option<ReasoningSink>,
    ) -> Execution {
        let started = Instant::now();

        // Stage 1: plan-then-act.
        match self.provider.propose_actions(handle, instruction).await {
            Ok(candidates) if !candidates.is_empty() => {
                info!(
                    instruction = %instruction,
                    candidates = candidates.len(),
                    "executing first proposed candidate"
                );
                match self.provider.execute_candidate(handle, &candidates[0]).await {
                    Ok(events) => {
                        return Execution {
                            outcome: TaskOutcome::Completed {
                                method: TaskMethod::ObserveAct,
                            },
                            events,
                            agent_history: vec![],
                            duration_ms: started.elapsed().as_millis() as u64,
                        };
                    }
                    Err(e) => {
                        warn!(error = %e, "candidate execution failed, trying direct act");
                    }
                }
            }
            Ok(_) => {
                info!(instruction = %instruction, "no candidates proposed, trying direct act");
            }
            Err(e) => {
                warn!(error = %e, "propose failed, trying direct act");
            }
        }

        // Stage 2: direct act with a bounded timeout.
        let act = tokio::time::timeout(
            self.act_timeout,
            self.provider.execute_action(handle, instruction),
        )
        .await;

        let act_error = match act {
            Ok(Ok(events)) => {
                return Execution {
                    outcome: TaskOutcome::Completed {
                        method: TaskMethod::Act,
                    },
                    events,
                    agent_history: vec![],
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("direct act timed out after {:?}", self.act_timeout),
        };
        warn!(error = %act_error, "direct act failed, falling back to autonomous agent");

        // Stage 3: autonomous agent fallback.
        let (outcome, history) = self
            .run_agent_stage(handle, instruction, system_prompt, reasoning_sink)
            .await;

        Execution {
            outcome,
            events: vec![],
            agent_history: history,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_agent_stage(
        &self,
        handle: &SessionHandle,
        instruction: &str,
        system_prompt: &str,
        reasoning_sink: Option<ReasoningSink>,
    ) -> (TaskOutcome, Vec<AgentMessage>) {
        let config = AgentConfig {
            instruction: instruction.to_string(),
            system_prompt: system_prompt.to_string(),
            highlight_cursor: true,
            max_steps: self.agent_max_steps,
            stream: true,
        };

        let run = match self.provider.run_agent(handle, config).await {
            Ok(run) => run,
            Err(e) => {
                return (
                    TaskOutcome::Failed {
                        error: e.to_string(),
                    },
                    vec![],
                );
            }
        };

        // Drain the chunk channel independently of the completion future.
        let mut chunks = run.chunks;
        let drain = tokio::spawn(async move {
            let mut buffer = StreamBuffer::new();
            let mut last_flush = Instant::now();
            while let Some(chunk) = chunks.recv().await {
                let elapsed = last_flush.elapsed().as_millis() as u64;
                if let Some(text) = buffer.push(&chunk, elapsed) {
                    last_flush = Instant::now();
                    if let Some(sink) = &reasoning_sink {
                        sink(text);
                    }
                }
            }
            if let Some(rest) = buffer.flush_remaining() {
                if let Some(sink) = &reasoning_sink {
                    sink(rest);
                }
            }
        });

        let outcome = match run.completion.await {
            Ok(Ok(agent)) => {
                if agent.success && agent.completed {
                    (
                        TaskOutcome::Completed {
                            method: TaskMethod::Agent,
                        },
                        agent.history,
                    )
                } else {
                    // Agent stuck: soft failure with a persona-voiced explanation.
                    (
                        TaskOutcome::Stuck {
                            explanation: format_explanation(&agent.message),
                        },
                        agent.history,
                    )
                }
            }
            Ok(Err(e)) => (
                TaskOutcome::Failed {
                    error: e.to_string(),
                },
                vec![],
            ),
            Err(_) => (
                TaskOutcome::Failed {
                    error: "agent completion channel dropped".to_string(),
                },
                vec![],
            ),
        };

        // The producer closed (or will close) the channel; wait so every
        // buffered chunk reaches the sink before we report the outcome.
        let _ = drain.await;
        outcome
    }
}
