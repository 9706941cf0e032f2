//! Run orchestrator: drives one test run end to end.
//!
//! Strictly sequential over the task list (tasks share mutated page state).
//! Task failures of either kind never stop the loop, report generation is
//! always attempted, and the session is released on every exit path. Only
//! session acquisition failure and missing records push the run to its
//! terminal `error` state.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::automation::AgentMessage;
use crate::error::Result;
use crate::evidence::{build_snippet, EvidenceCapture};
use crate::executor::{ReasoningSink, TaskExecutor, TaskOutcome};
use crate::model::{EventKind, RunStatus, TaskResult, TestSpec, TimelineEvent};
use crate::persona::{build_system_prompt, InstructionBuilder, Persona};
use crate::reasoning::{AnalysisContext, ReasoningEngine};
use crate::session::{ManagedSession, SessionManager};
use crate::store::{RunPatch, Store};

/// Progress notification pushed before each task and on streamed reasoning.
#[derive(Debug, Clone)]
pub struct RunProgress {
    pub run_id: String,
    pub task_index: usize,
    pub total_tasks: usize,
    pub message: String,
}

/// Caller-supplied progress callback. Returning `false` at the between-task
/// checkpoint stops the run cooperatively; the return value is ignored for
/// mid-task reasoning updates.
pub type ProgressFn = Arc<dyn Fn(RunProgress) -> bool + Send + Sync>;

pub struct RunOrchestrator {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    executor: TaskExecutor,
    instructions: InstructionBuilder,
    evidence: EvidenceCapture,
    reasoning: Arc<ReasoningEngine>,
}

struct DriveOutcome {
    results: Vec<TaskResult>,
    timeline: Vec<TimelineEvent>,
    agent_history: Vec<AgentMessage>,
    cancelled: bool,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        executor: TaskExecutor,
        instructions: InstructionBuilder,
        evidence: EvidenceCapture,
        reasoning: Arc<ReasoningEngine>,
    ) -> Self {
        Self {
            store,
            sessions,
            executor,
            instructions,
            evidence,
            reasoning,
        }
    }

    /// Execute a previously created run to its terminal state. Never returns
    /// an error; every failure is folded into the persisted run record.
    pub async fn run(&self, run_id: &str, progress: ProgressFn) {
        let (test, persona, persona_version_id) = match self.load_run(run_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run setup failed");
                self.finish_error(run_id, &e.to_string()).await;
                return;
            }
        };

        self.patch(run_id, RunPatch {
            status: Some(RunStatus::Running),
            ..RunPatch::default()
        })
        .await;

        // Session acquisition failure is the one run-fatal error.
        let session = match self.sessions.open(&test.target_url).await {
            Ok(session) => session,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "session acquisition failed");
                self.finish_error(run_id, &format!("session acquisition failed: {}", e))
                    .await;
                return;
            }
        };

        info!(run_id = %run_id, session_id = %session.id, test = %test.name, "run started");

        let started = std::time::Instant::now();
        let drive = self
            .drive(run_id, &session, &test, &persona, progress)
            .await;

        // Report generation is always attempted, whatever the loop produced.
        if let Err(e) = self
            .generate_report(run_id, &session, &test, &persona, &persona_version_id, &drive)
            .await
        {
            error!(run_id = %run_id, error = %e, "report generation failed, run keeps its task results");
        }

        // Guaranteed release. close() is idempotent, so an earlier close in
        // an error branch is tolerated.
        self.sessions.close(&session.id).await;

        let completed = drive.results.iter().filter(|r| r.success).count();
        let completion_pct = if drive.results.is_empty() {
            0
        } else {
            ((completed * 100) / test.tasks.len()) as u8
        };

        self.patch(run_id, RunPatch {
            status: Some(RunStatus::Completed),
            completion_pct: Some(completion_pct),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            action_count: Some(drive.results.len()),
            error: None,
        })
        .await;

        info!(
            run_id = %run_id,
            completed = completed,
            total = test.tasks.len(),
            cancelled = drive.cancelled,
            "run finished"
        );
    }

    async fn load_run(&self, run_id: &str) -> Result<(TestSpec, Persona, String)> {
        let run = self.store.get_test_run(run_id).await?;
        let test = self.store.get_test(&run.test_id).await?;
        let persona = self.store.get_persona(&test.persona_id).await?;
        Ok((test, persona, run.persona_version_id))
    }

    /// The sequential task loop. Absorbs every per-task failure; the only
    /// early exit is the cooperative cancellation checkpoint.
    async fn drive(
        &self,
        run_id: &str,
        session: &ManagedSession,
        test: &TestSpec,
        persona: &Persona,
        progress: ProgressFn,
    ) -> DriveOutcome {
        let system_prompt = build_system_prompt(persona);
        let total = test.tasks.len();
        let mut results = Vec::with_capacity(total);
        let mut timeline = Vec::new();
        let mut agent_history = Vec::new();
        let mut cancelled = false;

        for (index, task) in test.tasks.iter().enumerate() {
            // Sole cancellation checkpoint: between tasks, never mid-task.
            let keep_going = progress(RunProgress {
                run_id: run_id.to_string(),
                task_index: index,
                total_tasks: total,
                message: format!("starting task {} of {}", index + 1, total),
            });
            if !keep_going {
                info!(run_id = %run_id, task_index = index, "run cancelled at checkpoint");
                cancelled = true;
                break;
            }

            let instruction = self.instructions.rephrase(task, persona).await;

            let sink: ReasoningSink = {
                let progress = progress.clone();
                let run_id = run_id.to_string();
                Arc::new(move |text: String| {
                    progress(RunProgress {
                        run_id: run_id.clone(),
                        task_index: index,
                        total_tasks: total,
                        message: text,
                    });
                })
            };

            let execution = self
                .executor
                .execute(&session.handle, &instruction, &system_prompt, Some(sink))
                .await;

            timeline.extend(execution.events);
            if !execution.agent_history.is_empty() {
                agent_history = execution.agent_history;
            }

            let result = match execution.outcome {
                TaskOutcome::Completed { method } => TaskResult {
                    task: task.clone(),
                    success: true,
                    method: Some(method),
                    duration_ms: execution.duration_ms,
                    explanation: None,
                    error: None,
                },
                TaskOutcome::Stuck { explanation } => {
                    warn!(run_id = %run_id, task = %task, "persona got stuck, continuing");
                    TaskResult {
                        task: task.clone(),
                        success: false,
                        method: None,
                        duration_ms: execution.duration_ms,
                        explanation: Some(explanation),
                        error: None,
                    }
                }
                TaskOutcome::Failed { error } => {
                    warn!(run_id = %run_id, task = %task, error = %error, "task failed hard, continuing");
                    TaskResult {
                        task: task.clone(),
                        success: false,
                        method: None,
                        duration_ms: execution.duration_ms,
                        explanation: None,
                        error: Some(error),
                    }
                }
            };

            let kind = if result.success {
                EventKind::TaskComplete
            } else {
                EventKind::TaskError
            };
            timeline.push(TimelineEvent::new(kind, task.clone()));
            results.push(result);
        }

        DriveOutcome {
            results,
            timeline,
            agent_history,
            cancelled,
        }
    }

    /// Evidence capture + specialist analysis + persistence. May fail; the
    /// caller logs and moves on.
    async fn generate_report(
        &self,
        run_id: &str,
        session: &ManagedSession,
        test: &TestSpec,
        persona: &Persona,
        persona_version_id: &str,
        drive: &DriveOutcome,
    ) -> Result<()> {
        let captured = self.evidence.capture(run_id, &session.handle, 0).await;

        let task_context = drive
            .results
            .iter()
            .rev()
            .find(|r| !r.success)
            .map(|r| r.task.clone())
            .unwrap_or_else(|| test.name.clone());
        let snippet = build_snippet(
            persona,
            &task_context,
            &drive.timeline,
            &drive.agent_history,
            0,
        );

        let context = AnalysisContext {
            captured,
            tasks: test.tasks.clone(),
            persona: persona.clone(),
            task_summary: summarize_results(&drive.results),
        };

        let mut findings = self.reasoning.analyze(&context).await;
        for finding in &mut findings {
            finding.evidence.push(snippet.clone());
        }

        self.store
            .save_findings(run_id, &findings, persona_version_id)
            .await?;
        self.evidence
            .archive(run_id, &serde_json::to_value(&findings)?)
            .await;

        info!(run_id = %run_id, findings = findings.len(), "report persisted");
        Ok(())
    }

    async fn patch(&self, run_id: &str, patch: RunPatch) {
        if let Err(e) = self.store.update_test_run(run_id, patch).await {
            error!(run_id = %run_id, error = %e, "run record update failed");
        }
    }

    async fn finish_error(&self, run_id: &str, message: &str) {
        self.patch(run_id, RunPatch {
            status: Some(RunStatus::Error),
            error: Some(message.to_string()),
            ..RunPatch::default()
        })
        .await;
    }
}

fn summarize_results(results: &[TaskResult]) -> String {
    let completed = results.iter().filter(|r| r.success).count();
    let mut lines = vec![format!(
        "{} of {} tasks completed.",
        completed,
        results.len()
    )];
    for result in results {
        let status = if result.success {
            "done".to_string()
        } else if let Some(explanation) = &result.explanation {
            format!("stuck: {}", explanation)
        } else {
            format!(
                "failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            )
        };
        lines.push(format!("- {}: {}", result.task, status));
    }
    lines.join("\n")
}
