//! Error types for the engine broker.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Which of a worker's required files is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRole {
    Executable,
    Model,
    Config,
}

impl fmt::Display for DependencyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executable => write!(f, "executable"),
            Self::Model => write!(f, "model"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// Engine broker error type.
#[derive(Error, Debug)]
pub enum Error {
    /// A path the worker needs does not exist
    #[error("[{engine}] {role} not found: {}", path.display())]
    MissingDependency {
        engine: String,
        role: DependencyRole,
        path: PathBuf,
    },

    /// The worker process is not alive (not started, or between crash and respawn)
    #[error("engine \"{0}\" is not running")]
    WorkerUnavailable(String),

    /// No final response arrived within the allotted window
    #[error("engine \"{engine}\" timeout for id={id} after {after:?}")]
    Timeout {
        engine: String,
        id: String,
        after: Duration,
    },

    /// The worker exited while the request was pending
    #[error("engine \"{engine}\" exited while request was pending ({status})")]
    ProcessCrash { engine: String, status: String },

    /// The worker answered the request with an error message
    #[error("engine \"{engine}\" reported an error: {message}")]
    EngineReported { engine: String, message: String },

    /// A response line could not be decoded
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The request payload cannot carry a correlation id
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No engine with this name is configured
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// The engine was shut down and will not accept work
    #[error("engine \"{0}\" is shut down")]
    ShutDown(String),

    /// The operating system refused to spawn the worker
    #[error("[{engine}] failed to spawn worker: {source}")]
    Spawn {
        engine: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerUnavailable(_) | Self::Timeout { .. } | Self::ProcessCrash { .. }
        )
    }
}

/// Result type alias for engine broker operations.
pub type Result<T> = std::result::Result<T, Error>;
