//! Persistence and blob-storage contracts, with in-memory implementations.
//!
//! The dashboard's real database sits behind [`Store`]; this crate only
//! depends on the contract. [`MemoryStore`] backs tests and single-process
//! runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Finding, RunStatus, TestRun, TestSpec};
use crate::persona::Persona;

/// Partial update to a test run.
#[derive(Debug, Default, Clone)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub completion_pct: Option<u8>,
    pub duration_ms: Option<u64>,
    pub action_count: Option<usize>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_test(&self, id: &str) -> Result<TestSpec>;

    async fn get_persona(&self, id: &str) -> Result<Persona>;

    /// Current version id for a persona: the denormalized pointer on the
    /// persona record when present, else the most recent version by creation
    /// time.
    async fn persona_version_id(&self, persona_id: &str) -> Result<String>;

    async fn create_test_run(
        &self,
        test_id: &str,
        persona_version_id: &str,
        total_tasks: usize,
    ) -> Result<TestRun>;

    async fn update_test_run(&self, run_id: &str, patch: RunPatch) -> Result<()>;

    async fn get_test_run(&self, run_id: &str) -> Result<TestRun>;

    async fn test_runs_by_test(&self, test_id: &str) -> Result<Vec<TestRun>>;

    async fn save_findings(
        &self,
        run_id: &str,
        findings: &[Finding],
        persona_version_id: &str,
    ) -> Result<()>;

    async fn get_findings(&self, run_id: &str) -> Result<Vec<Finding>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_screenshot(&self, run_id: &str, index: u32, image: &[u8]) -> Result<String>;

    async fn upload_evidence(&self, run_id: &str, payload: &Value) -> Result<String>;

    async fn delete_evidence(&self, run_id: &str) -> Result<()>;
}

fn status_rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Queued => 0,
        RunStatus::Running => 1,
        RunStatus::Completed => 2,
        RunStatus::Error => 2,
    }
}

#[derive(Debug, Clone)]
pub struct PersonaVersion {
    pub id: String,
    pub persona_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tests: HashMap<String, TestSpec>,
    personas: HashMap<String, Persona>,
    persona_versions: Vec<PersonaVersion>,
    runs: HashMap<String, TestRun>,
    findings: HashMap<String, Vec<Finding>>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_test(&self, test: TestSpec) {
        self.inner.write().await.tests.insert(test.id.clone(), test);
    }

    pub async fn insert_persona(&self, persona: Persona) {
        self.inner
            .write()
            .await
            .personas
            .insert(persona.id.clone(), persona);
    }

    pub async fn insert_persona_version(&self, version: PersonaVersion) {
        self.inner.write().await.persona_versions.push(version);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_test(&self, id: &str) -> Result<TestSpec> {
        self.inner
            .read()
            .await
            .tests
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("test {}", id)))
    }

    async fn get_persona(&self, id: &str) -> Result<Persona> {
        self.inner
            .read()
            .await
            .personas
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("persona {}", id)))
    }

    async fn persona_version_id(&self, persona_id: &str) -> Result<String> {
        let inner = self.inner.read().await;
        let persona = inner
            .personas
            .get(persona_id)
            .ok_or_else(|| Error::NotFound(format!("persona {}", persona_id)))?;

        if let Some(version_id) = &persona.version_id {
            return Ok(version_id.clone());
        }

        inner
            .persona_versions
            .iter()
            .filter(|v| v.persona_id == persona_id)
            .max_by_key(|v| v.created_at)
            .map(|v| v.id.clone())
            .ok_or_else(|| Error::NotFound(format!("persona version for {}", persona_id)))
    }

    async fn create_test_run(
        &self,
        test_id: &str,
        persona_version_id: &str,
        total_tasks: usize,
    ) -> Result<TestRun> {
        let run = TestRun {
            id: Uuid::new_v4().to_string(),
            test_id: test_id.to_string(),
            persona_version_id: persona_version_id.to_string(),
            status: RunStatus::Queued,
            completion_pct: 0,
            total_tasks,
            duration_ms: 0,
            action_count: 0,
            error: None,
            created_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .runs
            .insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn update_test_run(&self, run_id: &str, patch: RunPatch) -> Result<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;

        if let Some(status) = patch.status {
            // Status is monotonic: never step backwards, never leave terminal.
            if status_rank(status) >= status_rank(run.status)
                && !matches!(run.status, RunStatus::Completed | RunStatus::Error)
            {
                run.status = status;
            }
        }
        if let Some(pct) = patch.completion_pct {
            run.completion_pct = pct;
        }
        if let Some(duration) = patch.duration_ms {
            run.duration_ms = duration;
        }
        if let Some(actions) = patch.action_count {
            run.action_count = actions;
        }
        if let Some(error) = patch.error {
            run.error = Some(error);
        }
        Ok(())
    }

    async fn get_test_run(&self, run_id: &str) -> Result<TestRun> {
        self.inner
            .read()
            .await
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
    }

    async fn test_runs_by_test(&self, test_id: &str) -> Result<Vec<TestRun>> {
        let mut runs: Vec<TestRun> = self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.test_id == test_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn save_findings(
        &self,
        run_id: &str,
        findings: &[Finding],
        _persona_version_id: &str,
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .findings
            .insert(run_id.to_string(), findings.to_vec());
        Ok(())
    }

    async fn get_findings(&self, run_id: &str) -> Result<Vec<Finding>> {
        Ok(self
            .inner
            .read()
            .await
            .findings
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory blob store returning stable pseudo-URLs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload_screenshot(&self, run_id: &str, index: u32, image: &[u8]) -> Result<String> {
        let key = format!("{}/shot-{}.png", run_id, index);
        self.blobs
            .write()
            .await
            .insert(key.clone(), image.to_vec());
        Ok(format!("memory://{}", key))
    }

    async fn upload_evidence(&self, run_id: &str, payload: &Value) -> Result<String> {
        let key = format!("{}/evidence.json", run_id);
        self.blobs
            .write()
            .await
            .insert(key.clone(), serde_json::to_vec(payload)?);
        Ok(format!("memory://{}", key))
    }

    async fn delete_evidence(&self, run_id: &str) -> Result<()> {
        let prefix = format!("{}/", run_id);
        self.blobs
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
