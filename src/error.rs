//! Error types shared by the worker, the supervisor and the collaborators.

use thiserror::Error;

use crate::hardware::DeviceId;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures that end a worker or stop the supervisor from starting.
#[derive(Debug, Error)]
pub enum Error {
    /// The controller could not be reached. Fatal for that worker.
    #[error("cannot connect to controller {host}: {reason}")]
    Connection { host: String, reason: String },

    /// The controller reported bucket labels we do not know how to store.
    #[error("unexpected {what} labels for {device} on {host}: {found:?}")]
    UnexpectedMetadata {
        host: String,
        device: DeviceId,
        what: &'static str,
        found: Vec<String>,
    },

    /// Controller firmware predates the counters we rely on.
    #[error("controller {host} runs firmware {found}, minimum is {minimum}")]
    FirmwareTooOld {
        host: String,
        found: String,
        minimum: String,
    },

    /// A controller query failed after the connection was established.
    #[error("controller {host}: {reason}")]
    Hardware { host: String, reason: String },

    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The wake/acknowledge channel to the supervisor is broken.
    #[error("worker link: {0}")]
    Link(String),

    #[error("config: {0}")]
    Config(String),

    /// The supervisor's wake loop panicked or was cancelled.
    #[error("supervisor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Starting a worker process failed.
    #[error("cannot start worker for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn hardware(host: &str, reason: impl Into<String>) -> Self {
        Error::Hardware {
            host: host.to_string(),
            reason: reason.into(),
        }
    }
}
