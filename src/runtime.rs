//! Run manager: the surface the rest of the product talks to.
//!
//! Starts runs on background tasks, pushes progress over a broadcast channel,
//! honors cooperative cancellation at the orchestrator's between-task
//! checkpoint and serves reports/comparisons from persisted state.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::comparison::{aggregate_runs, compare_pair, ComparisonResult};
use crate::error::{Error, Result};
use crate::model::{Finding, TestRun};
use crate::orchestrator::{ProgressFn, RunOrchestrator, RunProgress};
use crate::reasoning::{synthesize, Synthesis};
use crate::session::SessionManager;
use crate::store::Store;

/// Broadcast buffer; slow subscribers lag, they never block a run.
const EVENT_BUFFER: usize = 64;

/// Progress event pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub task_index: usize,
    pub total_tasks: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run: TestRun,
    pub findings: Vec<Finding>,
    pub synthesis: Synthesis,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub active_runs: usize,
    pub active_sessions: usize,
    pub uptime_secs: u64,
}

pub struct RunManager {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    orchestrator: Arc<RunOrchestrator>,
    active: RwLock<HashMap<String, Arc<AtomicBool>>>,
    events: broadcast::Sender<RunEvent>,
    started_at: Instant,
}

impl RunManager {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        orchestrator: Arc<RunOrchestrator>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            store,
            sessions,
            orchestrator,
            active: RwLock::new(HashMap::new()),
            events,
            started_at: Instant::now(),
        })
    }

    /// Create a run record and execute it on a background task. Returns the
    /// run id immediately; progress arrives via [`RunManager::subscribe`].
    pub async fn start_run(self: &Arc<Self>, test_id: &str) -> Result<String> {
        let test = self.store.get_test(test_id).await?;
        let persona_version_id = self.store.persona_version_id(&test.persona_id).await?;
        let run = self
            .store
            .create_test_run(test_id, &persona_version_id, test.tasks.len())
            .await?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.active
            .write()
            .await
            .insert(run.id.clone(), cancel.clone());

        let progress = self.progress_fn(cancel);
        let manager = self.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            manager.orchestrator.run(&run_id, progress).await;
            manager.active.write().await.remove(&run_id);
        });

        info!(run_id = %run.id, test_id = %test_id, "run started in background");
        Ok(run.id)
    }

    fn progress_fn(&self, cancel: Arc<AtomicBool>) -> ProgressFn {
        let events = self.events.clone();
        Arc::new(move |p: RunProgress| {
            let _ = events.send(RunEvent {
                run_id: p.run_id,
                task_index: p.task_index,
                total_tasks: p.total_tasks,
                message: p.message,
            });
            !cancel.load(Ordering::SeqCst)
        })
    }

    /// Request cooperative cancellation. Honored at the next between-task
    /// checkpoint; returns false when the run is unknown or already finished.
    pub async fn cancel_run(&self, run_id: &str) -> bool {
        match self.active.read().await.get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(run_id = %run_id, "cancellation requested");
                true
            }
            None => {
                warn!(run_id = %run_id, "cancellation requested for inactive run");
                false
            }
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<TestRun> {
        self.store.get_test_run(run_id).await
    }

    pub async fn get_report(&self, run_id: &str) -> Result<RunReport> {
        let run = self.store.get_test_run(run_id).await?;
        let findings = self.store.get_findings(run_id).await?;
        let synthesis = synthesize(findings.clone());
        Ok(RunReport {
            run,
            findings,
            synthesis,
        })
    }

    /// Compare persisted findings across runs: exactly two run ids give the
    /// pairwise diff, more give the single-pass multi-run aggregation.
    pub async fn compare(&self, run_ids: &[String]) -> Result<ComparisonResult> {
        if run_ids.len() < 2 {
            return Err(Error::Run(format!(
                "comparison needs at least 2 runs, got {}",
                run_ids.len()
            )));
        }

        let mut loaded = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            // Fail loudly on unknown runs instead of comparing partial data.
            self.store.get_test_run(run_id).await?;
            loaded.push((run_id.clone(), self.store.get_findings(run_id).await?));
        }

        if loaded.len() == 2 {
            let (candidate_id, candidate) = loaded.pop().unwrap_or_default();
            let (baseline_id, baseline) = loaded.pop().unwrap_or_default();
            Ok(ComparisonResult::Pairwise(compare_pair(
                &baseline_id,
                &candidate_id,
                &baseline,
                &candidate,
            )))
        } else {
            Ok(ComparisonResult::MultiRun(aggregate_runs(&loaded)))
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub async fn health(&self) -> Health {
        Health {
            active_runs: self.active.read().await.len(),
            active_sessions: self.sessions.active_count().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Close sessions idle past the configured TTL. Meant to be driven by a
    /// periodic maintenance task.
    pub async fn sweep_idle_sessions(&self, max_age_secs: u64) -> usize {
        let closed = self.sessions.close_expired(max_age_secs).await;
        if !closed.is_empty() {
            info!(count = closed.len(), "closed idle sessions");
        }
        closed.len()
    }
}
