use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use uxprobe_agent::automation::{AutomationProvider, HttpAutomation};
use uxprobe_agent::config::Config;
use uxprobe_agent::error::Result;
use uxprobe_agent::evidence::EvidenceCapture;
use uxprobe_agent::executor::TaskExecutor;
use uxprobe_agent::knowledge::KnowledgeStore;
use uxprobe_agent::llm::{ChatModel, LlmClient};
use uxprobe_agent::model::{KnowledgeChunk, RunStatus, TestSpec};
use uxprobe_agent::orchestrator::RunOrchestrator;
use uxprobe_agent::persona::{InstructionBuilder, Persona};
use uxprobe_agent::reasoning::ReasoningEngine;
use uxprobe_agent::runtime::RunManager;
use uxprobe_agent::session::SessionManager;
use uxprobe_agent::store::{BlobStore, MemoryBlobStore, MemoryStore, PersonaVersion, Store};

/// UXProbe Agent - persona-driven automated usability testing
#[derive(Parser, Debug)]
#[command(name = "uxprobe-agent", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "uxprobe.toml")]
    config: String,

    /// Path to a JSON run fixture (persona, test, optional knowledge chunks)
    #[arg(short, long)]
    test: String,
}

/// Everything one run needs, seeded into the in-memory store.
#[derive(Debug, Deserialize)]
struct RunFixture {
    persona: Persona,
    test: TestSpec,
    #[serde(default)]
    knowledge: Vec<KnowledgeChunk>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    let fixture: RunFixture = serde_json::from_str(&std::fs::read_to_string(&args.test)?)?;

    info!(
        test = %fixture.test.name,
        persona = %fixture.persona.name,
        tasks = fixture.test.tasks.len(),
        "fixture loaded"
    );

    let store = Arc::new(MemoryStore::new());
    seed_store(&store, fixture.persona, fixture.test.clone()).await;

    let provider: Arc<dyn AutomationProvider> = Arc::new(HttpAutomation::new(&config.automation));
    let model: Arc<dyn ChatModel> = Arc::new(LlmClient::new(&config.llm));
    let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

    let sessions = Arc::new(SessionManager::new(
        provider.clone(),
        config.automation.embed_base.clone(),
    ));
    let knowledge = Arc::new(KnowledgeStore::new(
        fixture.knowledge,
        model.clone(),
        &config.knowledge,
    ));
    let orchestrator = Arc::new(RunOrchestrator::new(
        store.clone() as Arc<dyn Store>,
        sessions.clone(),
        TaskExecutor::new(provider.clone(), &config.executor),
        InstructionBuilder::new(model.clone()),
        EvidenceCapture::new(provider, blob),
        Arc::new(ReasoningEngine::new(model, knowledge)),
    ));
    let manager = RunManager::new(store.clone() as Arc<dyn Store>, sessions, orchestrator);

    // Idle-session sweeper.
    {
        let manager = manager.clone();
        let max_age = config.session.idle_timeout_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                manager.sweep_idle_sessions(max_age).await;
            }
        });
    }

    // Relay progress events to the log.
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                run_id = %event.run_id,
                task = event.task_index + 1,
                total = event.total_tasks,
                "{}",
                event.message
            );
        }
    });

    let run_id = manager.start_run(&fixture.test.id).await?;
    info!(run_id = %run_id, "run started");

    loop {
        let run = manager.get_run(&run_id).await?;
        match run.status {
            RunStatus::Completed | RunStatus::Error => break,
            _ => sleep(Duration::from_millis(500)).await,
        }
    }

    match manager.get_report(&run_id).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "report unavailable");
        }
    }

    Ok(())
}

async fn seed_store(store: &MemoryStore, mut persona: Persona, test: TestSpec) {
    let version_id = persona
        .version_id
        .clone()
        .unwrap_or_else(|| format!("pv-{}", Uuid::new_v4()));
    persona.version_id = Some(version_id.clone());
    let persona_id = persona.id.clone();
    let created_at = persona.created_at;

    store.insert_persona(persona).await;
    store
        .insert_persona_version(PersonaVersion {
            id: version_id,
            persona_id,
            created_at,
        })
        .await;
    store.insert_test(test).await;
}
