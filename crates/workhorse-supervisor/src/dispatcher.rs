//! Request correlation and the pre-ready queue.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info};
use workhorse_core::{Completion, RequestId};

use crate::error::SupervisorError;

/// What a caller eventually receives for its request.
pub type Reply = Result<Completion, SupervisorError>;

struct PendingRequest {
    id: RequestId,
    responder: oneshot::Sender<Reply>,
    issued_at: DateTime<Utc>,
}

/// Handed to the caller when a request is registered.
#[derive(Debug)]
pub struct Ticket {
    pub task: String,
    pub id: RequestId,
    pub reply: oneshot::Receiver<Reply>,
}

/// Tracks outstanding requests by task name.
///
/// The worker's replies carry only the task name, so at most one request per
/// task can be outstanding. A request counts as outstanding from the moment
/// it is registered, including while its frame sits in the pre-ready queue.
#[derive(Default)]
pub struct RequestDispatcher {
    pending: HashMap<String, PendingRequest>,
    queue: VecDeque<(String, Vec<u8>)>,
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `task`.
    pub fn register(&mut self, task: &str) -> Result<Ticket, SupervisorError> {
        if self.pending.contains_key(task) {
            return Err(SupervisorError::AlreadyInFlight(task.to_string()));
        }

        let (responder, reply) = oneshot::channel();
        let id = RequestId::generate();
        self.pending.insert(
            task.to_string(),
            PendingRequest {
                id: id.clone(),
                responder,
                issued_at: Utc::now(),
            },
        );
        debug!(task, request_id = %id, "Request registered");

        Ok(Ticket {
            task: task.to_string(),
            id,
            reply,
        })
    }

    /// Hold an encoded frame until the worker is ready.
    pub fn enqueue(&mut self, task: &str, frame: Vec<u8>) {
        self.queue.push_back((task.to_string(), frame));
        debug!(task, queued = self.queue.len(), "Command queued until worker is ready");
    }

    /// Take every queued frame, oldest first.
    pub fn drain_queue(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).map(|(_, frame)| frame).collect()
    }

    /// Deliver a reply to the request for `task`. Returns false if none was outstanding.
    pub fn resolve(&mut self, task: &str, reply: Reply) -> bool {
        let Some(request) = self.pending.remove(task) else {
            return false;
        };
        let elapsed = Utc::now() - request.issued_at;
        debug!(
            task,
            request_id = %request.id,
            ok = reply.is_ok(),
            elapsed_ms = elapsed.num_milliseconds(),
            "Request resolved"
        );
        // The caller may have stopped waiting.
        let _ = request.responder.send(reply);
        true
    }

    /// Forget the request `id` for `task`, e.g. after its caller timed out.
    ///
    /// Returns false if that request was already answered.
    pub fn expire(&mut self, task: &str, id: &RequestId) -> bool {
        if self.pending.get(task).map(|p| &p.id) != Some(id) {
            return false;
        }
        self.pending.remove(task);
        self.queue.retain(|(queued, _)| queued != task);
        true
    }

    /// Reject every outstanding request and drop the queue.
    pub fn reject_all(&mut self, reason: impl Fn() -> SupervisorError) -> usize {
        self.queue.clear();
        let count = self.pending.len();
        for (task, request) in self.pending.drain() {
            debug!(task = %task, request_id = %request.id, "Rejecting request");
            let _ = request.responder.send(Err(reason()));
        }
        if count > 0 {
            info!(count, "Rejected outstanding requests");
        }
        count
    }

    pub fn is_in_flight(&self, task: &str) -> bool {
        self.pending.contains_key(task)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completion(task: &str) -> Completion {
        Completion {
            task: Some(task.to_string()),
            data: json!({ "task": task }),
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut dispatcher = RequestDispatcher::new();
        let ticket = dispatcher.register("load_model").unwrap();
        assert!(dispatcher.is_in_flight("load_model"));

        assert!(dispatcher.resolve("load_model", Ok(completion("load_model"))));
        assert!(!dispatcher.is_in_flight("load_model"));
        assert_eq!(ticket.reply.await.unwrap().unwrap(), completion("load_model"));
    }

    #[test]
    fn test_single_flight_per_task() {
        let mut dispatcher = RequestDispatcher::new();
        let _first = dispatcher.register("solve_problem").unwrap();
        let err = dispatcher.register("solve_problem").unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyInFlight(ref t) if t == "solve_problem"));

        // A different task is independent.
        assert!(dispatcher.register("load_model").is_ok());
        assert_eq!(dispatcher.pending_len(), 2);
    }

    #[test]
    fn test_resolve_unknown_task() {
        let mut dispatcher = RequestDispatcher::new();
        assert!(!dispatcher.resolve("download_model", Ok(completion("download_model"))));
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut dispatcher = RequestDispatcher::new();
        dispatcher.enqueue("a", b"1\n".to_vec());
        dispatcher.enqueue("b", b"2\n".to_vec());
        dispatcher.enqueue("c", b"3\n".to_vec());

        assert_eq!(
            dispatcher.drain_queue(),
            vec![b"1\n".to_vec(), b"2\n".to_vec(), b"3\n".to_vec()]
        );
        assert_eq!(dispatcher.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_reject_all() {
        let mut dispatcher = RequestDispatcher::new();
        let a = dispatcher.register("a").unwrap();
        let b = dispatcher.register("b").unwrap();
        dispatcher.enqueue("a", b"1\n".to_vec());

        let count = dispatcher.reject_all(|| SupervisorError::WorkerCrashed { exit_code: Some(1) });
        assert_eq!(count, 2);
        assert_eq!(dispatcher.queued_len(), 0);
        assert_eq!(dispatcher.pending_len(), 0);

        for ticket in [a, b] {
            let err = ticket.reply.await.unwrap().unwrap_err();
            assert!(matches!(err, SupervisorError::WorkerCrashed { exit_code: Some(1) }));
        }
    }

    #[test]
    fn test_expire_only_matching_request() {
        let mut dispatcher = RequestDispatcher::new();
        let first = dispatcher.register("load_model").unwrap();
        dispatcher.enqueue("load_model", b"1\n".to_vec());

        assert!(!dispatcher.expire("load_model", &RequestId::generate()));
        assert!(dispatcher.expire("load_model", &first.id));
        assert!(!dispatcher.is_in_flight("load_model"));
        assert_eq!(dispatcher.queued_len(), 0);

        // The task name is free again.
        let second = dispatcher.register("load_model").unwrap();
        assert!(!dispatcher.expire("load_model", &first.id));
        assert!(dispatcher.expire("load_model", &second.id));
    }
}
