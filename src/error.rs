use thiserror::Error;

/// Crate-wide error type.
///
/// Collaborator failures (provider, LLM, storage) are carried as text so they
/// can be absorbed into structured task/run results at the call sites that
/// tolerate them, per the propagation policy: only session acquisition and
/// uncaught orchestration errors are run-fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("automation provider error: {0}")]
    Provider(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("run error: {0}")]
    Run(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for provider-side failures surfaced from trait objects.
    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    pub fn llm(msg: impl Into<String>) -> Self {
        Error::Llm(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }
}
