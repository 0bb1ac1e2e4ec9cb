//! Lifecycle states for the worker process and the repair cycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the supervised worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No process has been spawned yet.
    #[default]
    NotStarted,
    /// Process spawned, waiting for its `ready` message.
    Starting,
    /// Process accepts commands.
    Ready,
    /// Process was stopped on request.
    Stopped,
    /// Process exited without being asked to.
    Crashed,
}

impl WorkerState {
    /// Returns true while a process is alive (spawned and not yet exited).
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// State of the dependency repair cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairState {
    /// No repair in progress.
    #[default]
    Running,
    /// `install_needed` received, stopping the worker.
    Repairing,
    /// Package manager running.
    Installing,
    /// Install succeeded, worker restarting.
    Restarting,
    /// Worker back up, replaying the interrupted task.
    Resuming,
    /// Install failed; needs external intervention.
    Failed,
}

impl RepairState {
    /// Returns true while a repair cycle owns the worker.
    pub fn is_repairing(&self) -> bool {
        matches!(
            self,
            Self::Repairing | Self::Installing | Self::Restarting | Self::Resuming
        )
    }
}

impl fmt::Display for RepairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Repairing => write!(f, "repairing"),
            Self::Installing => write!(f, "installing"),
            Self::Restarting => write!(f, "restarting"),
            Self::Resuming => write!(f, "resuming"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
