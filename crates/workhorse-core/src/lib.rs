//! Workhorse Core Domain Types
//!
//! This crate contains the pure types shared by the supervisor and its
//! callers, with no dependencies on:
//! - Process spawning
//! - Async runtimes
//!
//! It covers the wire protocol spoken with the worker, lifecycle states,
//! the cross-restart task memory, and observer events.

pub mod command;
pub mod error;
pub mod event;
pub mod ids;
pub mod install;
pub mod message;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use command::{tasks, Command};
pub use error::FramingError;
pub use event::{OutputStream, SupervisorEvent};
pub use ids::{JobId, RequestId};
pub use install::InstallJob;
pub use message::{Completion, Frame, InstallRequest, Progress, WorkerFailure, WorkerMessage};
pub use status::{RepairState, WorkerState};
pub use task::{ResumePlan, TaskState};
