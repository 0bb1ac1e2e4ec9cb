//! Classification of worker messages.
//!
//! The routing table lives here as a pure function; the supervisor's event
//! loop applies the resulting [`Route`] under its lock.

use workhorse_core::{InstallJob, WorkerMessage};

use crate::dispatcher::Reply;
use crate::error::SupervisorError;

/// Where a worker message goes.
#[derive(Debug)]
pub enum Route {
    /// Flip the worker to ready and flush the queue.
    Ready,
    /// Settle the request for `task` (if any) and broadcast.
    Correlate { task: Option<String>, reply: Reply },
    /// Observers only.
    Broadcast,
    /// Start a repair cycle.
    Repair(InstallJob),
    /// Unrecognized message type.
    Ignore,
}

/// Decide where `message` goes.
pub fn classify(message: &WorkerMessage) -> Route {
    match message {
        WorkerMessage::Ready => Route::Ready,
        WorkerMessage::Complete(completion) => Route::Correlate {
            task: completion.task.clone(),
            reply: Ok(completion.clone()),
        },
        WorkerMessage::Error(failure) => Route::Correlate {
            task: failure.task.clone(),
            reply: Err(SupervisorError::Worker {
                task: failure.task.clone().unwrap_or_default(),
                message: failure.message.clone(),
            }),
        },
        WorkerMessage::Progress(_) | WorkerMessage::Status(_) | WorkerMessage::Log(_) => {
            Route::Broadcast
        }
        WorkerMessage::InstallNeeded(request) => Route::Repair(InstallJob::from(request.clone())),
        WorkerMessage::Unknown(_) => Route::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(line: &str) -> WorkerMessage {
        WorkerMessage::decode(line.as_bytes()).unwrap()
    }

    #[test]
    fn test_ready() {
        assert!(matches!(classify(&decode(r#"{"type":"ready"}"#)), Route::Ready));
    }

    #[test]
    fn test_complete_correlates_by_task() {
        let route = classify(&decode(
            r#"{"type":"complete","data":{"task":"download_model","path":"/m"}}"#,
        ));
        match route {
            Route::Correlate { task, reply } => {
                assert_eq!(task.as_deref(), Some("download_model"));
                assert_eq!(reply.unwrap().data["path"], json!("/m"));
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_error_rejects() {
        let route = classify(&decode(
            r#"{"type":"error","data":{"task":"solve_problem","message":"CUDA out of memory"}}"#,
        ));
        match route {
            Route::Correlate { task, reply } => {
                assert_eq!(task.as_deref(), Some("solve_problem"));
                let err = reply.unwrap_err();
                assert!(err.to_string().contains("CUDA out of memory"));
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_bare_error_is_orphan() {
        let route = classify(&decode(r#"{"type":"error","data":"boom"}"#));
        assert!(matches!(route, Route::Correlate { task: None, .. }));
    }

    #[test]
    fn test_broadcasts() {
        for line in [
            r#"{"type":"progress","data":{"task":"download_model","current":1,"total":4}}"#,
            r#"{"type":"status","data":"Loading"}"#,
            r#"{"type":"log","data":"hello"}"#,
        ] {
            assert!(matches!(classify(&decode(line)), Route::Broadcast), "{}", line);
        }
    }

    #[test]
    fn test_install_needed_becomes_repair() {
        let route = classify(&decode(
            r#"{"type":"install_needed","data":{"package":"torch","args":["--index-url","https://x"],"task":"install_pytorch"}}"#,
        ));
        match route {
            Route::Repair(job) => {
                assert_eq!(job.package_name, "torch");
                assert_eq!(job.args.len(), 2);
                assert_eq!(job.task, "install_pytorch");
                assert!(!job.is_temp);
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_unknown_is_ignored() {
        assert!(matches!(
            classify(&decode(r#"{"type":"heartbeat","data":{}}"#)),
            Route::Ignore
        ));
    }
}
