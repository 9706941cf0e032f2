//! Persona profiles and the instruction builder that conditions raw tasks
//! into atomic, persona-voiced instructions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::ChatModel;

/// Simulated end-user profile conditioning instructions and findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub behaviors: Vec<String>,
    #[serde(default)]
    pub frustrations: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub accessibility_needs: Vec<String>,
    /// Denormalized pointer to the current persona version, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Deterministic concatenation of persona fields into directive prose.
pub fn build_system_prompt(persona: &Persona) -> String {
    let mut prompt = format!(
        "You are {}, a {}. Stay in character for the entire session.",
        persona.name, persona.role
    );

    let sections: [(&str, &Vec<String>); 5] = [
        ("Your goals", &persona.goals),
        ("How you behave", &persona.behaviors),
        ("What frustrates you", &persona.frustrations),
        ("Your constraints", &persona.constraints),
        ("Your accessibility needs", &persona.accessibility_needs),
    ];

    for (heading, items) in sections {
        if items.is_empty() {
            continue;
        }
        prompt.push_str(&format!("\n\n{}:", heading));
        for item in items {
            prompt.push_str(&format!("\n- {}", item));
        }
    }

    prompt.push_str(
        "\n\nInteract with the interface the way this person would: follow their \
         habits, give up where they would give up, and describe problems in their voice.",
    );
    prompt
}

/// Connector words that mark a task as compound.
const CONNECTORS: [&str; 7] = [
    " and ", " then ", " after ", " before ", " also ", " plus ", ", ",
];

/// Heuristic gate: a task is atomic when it is short and contains no
/// connector words. Atomic tasks skip the rephrase call entirely.
pub fn is_atomic(task: &str) -> bool {
    if task.len() >= 50 {
        return false;
    }
    let lowered = task.to_lowercase();
    !CONNECTORS.iter().any(|c| lowered.contains(c))
}

/// Rewrites tasks into atomic, persona-conditioned instructions.
pub struct InstructionBuilder {
    model: Arc<dyn ChatModel>,
}

impl InstructionBuilder {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Rephrase a task into a single atomic instruction. Atomic tasks pass
    /// through untouched; any failure degrades to the original task so
    /// instruction building never blocks execution.
    pub async fn rephrase(&self, task: &str, persona: &Persona) -> String {
        if is_atomic(task) {
            return task.to_string();
        }

        let system = format!(
            "You rewrite usability-test tasks into instructions for {}, a {}. \
             Respond with exactly one atomic, specific, single-action instruction. \
             No preamble, no numbering.",
            persona.name, persona.role
        );
        let prompt = format!("Rewrite this task: {}", task);

        match self.model.chat_text(&system, &prompt, 0.2).await {
            Ok(text) => {
                let instruction = text.trim().to_string();
                if instruction.is_empty() {
                    warn!(task = %task, "rephrase returned empty text, keeping original");
                    task.to_string()
                } else {
                    info!(task = %task, instruction = %instruction, "task rephrased");
                    instruction
                }
            }
            Err(e) => {
                warn!(task = %task, error = %e, "rephrase failed, keeping original");
                task.to_string()
            }
        }
    }
}
