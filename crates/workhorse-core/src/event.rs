//! Events broadcast to observers (UI, CLI, logs).

use serde::Serialize;

use crate::ids::JobId;
use crate::message::{Completion, Progress, WorkerFailure, WorkerMessage};
use crate::status::{RepairState, WorkerState};

/// Which output stream of a subprocess a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Observer-facing event.
///
/// Observers never resolve requests; they see progress, status and log
/// broadcasts, every `complete`/`error` (orphans included), and supervisor
/// lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Progress(Progress),
    Status {
        text: String,
    },
    Log {
        text: String,
    },
    Completed(Completion),
    Failed(WorkerFailure),

    /// A worker line was dropped.
    FramingError {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
    },

    WorkerStateChanged {
        state: WorkerState,
    },

    /// The worker exited without being asked to.
    WorkerCrashed {
        exit_code: Option<i32>,
    },

    RepairStateChanged {
        state: RepairState,
    },

    /// One line of package-manager output.
    InstallOutput {
        job_id: JobId,
        stream: OutputStream,
        line: String,
    },

    /// Fatal: a dependency install failed and the worker stays down.
    InstallFailed {
        job_id: JobId,
        package: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// Fatal: the worker could not be brought back after an install.
    RestartFailed {
        job_id: JobId,
        message: String,
    },
}

impl SupervisorEvent {
    /// The observer broadcast for a worker message, if it has one.
    pub fn from_message(message: &WorkerMessage) -> Option<Self> {
        match message {
            WorkerMessage::Progress(p) => Some(Self::Progress(p.clone())),
            WorkerMessage::Status(text) => Some(Self::Status { text: text.clone() }),
            WorkerMessage::Log(text) => Some(Self::Log { text: text.clone() }),
            WorkerMessage::Complete(c) => Some(Self::Completed(c.clone())),
            WorkerMessage::Error(e) => Some(Self::Failed(e.clone())),
            WorkerMessage::Ready | WorkerMessage::InstallNeeded(_) | WorkerMessage::Unknown(_) => {
                None
            }
        }
    }

    /// Returns true for events that need user intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InstallFailed { .. } | Self::RestartFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SupervisorEvent::Progress(Progress {
            task: Some("download_model".to_string()),
            current: 10,
            total: 100,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"progress""#));
        assert!(json.contains(r#""current":10"#));

        let event = SupervisorEvent::WorkerStateChanged {
            state: WorkerState::Ready,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("READY"));
    }

    #[test]
    fn test_from_message() {
        assert_eq!(
            SupervisorEvent::from_message(&WorkerMessage::Log("hi".to_string())),
            Some(SupervisorEvent::Log {
                text: "hi".to_string()
            })
        );
        assert!(SupervisorEvent::from_message(&WorkerMessage::Ready).is_none());
    }
}
