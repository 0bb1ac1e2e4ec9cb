//! Commands sent from the supervisor to the worker.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Well-known task names understood by the model worker.
pub mod tasks {
    pub const LOAD_MODEL: &str = "load_model";
    pub const SOLVE_PROBLEM: &str = "solve_problem";
    pub const DOWNLOAD_MODEL: &str = "download_model";
    pub const DOWNLOAD_PYTORCH: &str = "download_pytorch";

    /// Task tag the worker puts on `install_needed` for a PyTorch wheel.
    pub const INSTALL_PYTORCH: &str = "install_pytorch";
    /// Task tag the worker puts on `install_needed` for the llama runtime.
    pub const INSTALL_LLAMA: &str = "install_llama";
}

/// A command frame: `{"command": ..., "payload": {...}}`.
///
/// The command name doubles as the task name used to correlate the
/// worker's `complete`/`error` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl Command {
    /// Create a new command. A `null` payload is sent as `{}`.
    pub fn new(command: impl Into<String>, payload: Value) -> Self {
        let payload = if payload.is_null() {
            empty_payload()
        } else {
            payload
        };
        Self {
            command: command.into(),
            payload,
        }
    }

    /// `load_model{model_path}`.
    pub fn load_model(model_path: impl Into<String>) -> Self {
        Self::new(tasks::LOAD_MODEL, json!({ "model_path": model_path.into() }))
    }

    /// `solve_problem{problem}`.
    pub fn solve_problem(problem: impl Into<String>) -> Self {
        Self::new(tasks::SOLVE_PROBLEM, json!({ "problem": problem.into() }))
    }

    /// The task name this command is correlated under.
    pub fn task(&self) -> &str {
        &self.command
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
