pub mod automation;
pub mod comparison;
pub mod config;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod knowledge;
pub mod llm;
pub mod model;
pub mod orchestrator;
pub mod persona;
pub mod reasoning;
pub mod runtime;
pub mod session;
pub mod store;
