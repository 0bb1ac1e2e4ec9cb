//! Cross-restart task memory.

use serde::{Deserialize, Serialize};

use crate::command::{tasks, Command};

/// The minimal state needed to resume work after the worker was restarted.
///
/// Recorded as commands are issued, consumed when a repair cycle replays
/// the interrupted work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// Model path of the last `load_model` issued.
    pub last_model_path: Option<String>,
    /// Problem text waiting for a loaded model, or being solved.
    pub pending_problem: Option<String>,
    /// Alternate package source for the llama runtime (index URL or wheel URL).
    pub package_source_url: Option<String>,
}

/// What to do once the worker is back after a repair.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePlan {
    /// Nothing to replay; announce the install task itself as complete.
    AnnounceComplete(String),
    /// Reissue this command.
    Replay(Command),
    /// No recorded work.
    Nothing,
}

impl TaskState {
    /// Record what an outgoing command needs for a later replay.
    pub fn record(&mut self, command: &Command) {
        match command.task() {
            tasks::LOAD_MODEL => {
                if let Some(path) = command.payload_str("model_path") {
                    self.last_model_path = Some(path.to_owned());
                }
            }
            tasks::SOLVE_PROBLEM => {
                if let Some(problem) = command.payload_str("problem") {
                    self.pending_problem = Some(problem.to_owned());
                }
            }
            _ => {}
        }
    }

    /// The worker answered `task` (success or error).
    pub fn settle(&mut self, task: &str) {
        if task == tasks::SOLVE_PROBLEM {
            self.pending_problem = None;
        }
    }

    /// Decide how to resume after the install job tagged `task` succeeded.
    ///
    /// The model path is consumed; replaying `load_model` records it again.
    /// A pending problem stays until its `solve_problem` is answered, so the
    /// load completion can chain into it.
    pub fn plan_resume(&mut self, task: &str) -> ResumePlan {
        if task == tasks::INSTALL_PYTORCH {
            return ResumePlan::AnnounceComplete(task.to_owned());
        }
        if let Some(path) = self.last_model_path.take() {
            return ResumePlan::Replay(Command::load_model(path));
        }
        match &self.pending_problem {
            Some(problem) => ResumePlan::Replay(Command::solve_problem(problem.clone())),
            None => ResumePlan::Nothing,
        }
    }
}
