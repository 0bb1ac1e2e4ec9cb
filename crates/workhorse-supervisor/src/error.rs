//! Error types for the worker supervisor.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while supervising the worker.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker (or installer) executable could not be launched.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker exited while the request was outstanding.
    #[error("Worker process crashed (exit code: {})", fmt_code(.exit_code))]
    WorkerCrashed { exit_code: Option<i32> },

    /// The worker was stopped while the request was outstanding.
    #[error("Request cancelled: worker stopped")]
    Cancelled,

    /// A dependency install exited with a non-zero status.
    #[error("Installing '{package}' failed (exit code: {})", fmt_code(.exit_code))]
    Install {
        package: String,
        exit_code: Option<i32>,
    },

    /// A dependency repair failed; the worker stays down until started again.
    #[error("Dependency repair for '{package}' failed; start the worker to recover")]
    RepairFailed { package: String },

    /// A request for this task is already outstanding.
    #[error("A '{0}' request is already in flight")]
    AlreadyInFlight(String),

    /// No reply within the configured window.
    #[error("Timed out after {after:?} waiting for '{task}'")]
    Timeout { task: String, after: Duration },

    /// The worker answered the request with an `error` message.
    #[error("Worker reported an error for '{task}': {message}")]
    Worker { task: String, message: String },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on the worker streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The supervisor was dropped while a caller was waiting.
    #[error("Channel closed")]
    ChannelClosed,
}

impl SupervisorError {
    /// Returns true for errors caused by the worker going away.
    pub fn is_worker_gone(&self) -> bool {
        matches!(self, Self::WorkerCrashed { .. } | Self::Cancelled)
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
