//! Error types for dealbatch-core

use std::fmt::Write;
use std::sync::Arc;

use thiserror::Error;

use crate::events::BatchFailure;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dealbatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Mutation queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Log(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Queue(err) => Some(err.remediation()),
            Self::Log(_) => Some(
                Remediation::new("Initialize logging once per process.")
                    .alternative("Check that the log file directory is writable."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the script and config paths exist."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Omit --config to run with built-in defaults."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .alternative("Sections are [log] and [queue]; unknown keys are rejected."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Adjust the reported value.")
            }
        }
    }
}

/// Failure reported by a [`Persister`](crate::persist::Persister).
///
/// Cloneable so the same failure can be handed to `on_error`, the error
/// event and a waiting `flush` call.
#[derive(Error, Debug, Clone)]
pub enum PersistError {
    /// The request never reached the backend or the response was lost.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The backend refused the batch.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// The backend answered, but not with one result per submitted mutation.
    #[error("backend returned {received} results for {submitted} submitted mutations")]
    ResultMismatch { submitted: usize, received: usize },

    /// The persist task panicked or was cancelled before it produced a result.
    #[error("persist task aborted: {0}")]
    Aborted(String),

    /// Any other error raised by the persister.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl PersistError {
    /// Wrap an arbitrary error value.
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(err))
    }
}

/// Failure to turn a deferred producer into a concrete descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The previous batch carried no result the producer could build on.
    #[error("previous batch has no result for {0}")]
    MissingResult(String),

    #[error("{0}")]
    Failed(String),
}

/// Mutation queue errors
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// A dispatch awaited by `flush` failed.
    #[error("batch {} failed: {}", .0.batch_id, .0.error)]
    Persist(Box<BatchFailure>),

    /// The queue was built outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl QueueError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Persist(failure) => Remediation::new(format!(
                "{} mutation(s) were not persisted; the aggregate was left unchanged.",
                failure.mutations.len()
            ))
            .alternative("Re-add the failed mutations (MutationQueue::requeue) once the backend recovers."),
            Self::NoRuntime(_) => Remediation::new("Build the queue from inside a tokio runtime.")
                .alternative("Use #[tokio::main] or Runtime::block_on around queue construction."),
        }
    }

    /// The failed batch, when this error came from a dispatch.
    #[must_use]
    pub fn failure(&self) -> Option<&BatchFailure> {
        match self {
            Self::Persist(failure) => Some(failure),
            Self::NoRuntime(_) => None,
        }
    }
}
