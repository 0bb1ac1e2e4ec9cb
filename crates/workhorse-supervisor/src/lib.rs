//! Worker supervisor for Workhorse
//!
//! This crate runs one long-lived worker (normally a Python script) and talks
//! to it over newline-delimited JSON on its stdin/stdout. It correlates each
//! request with the worker's reply by task name, broadcasts progress and logs
//! to observers, and repairs the worker when it reports a missing dependency:
//! stop, install the package, restart, then replay the interrupted work.
//!
//! # Example
//!
//! ```rust,no_run
//! use workhorse_supervisor::{Supervisor, SupervisorConfig};
//!
//! async fn solve() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SupervisorConfig::for_project(".", "python/main.py");
//!     let supervisor = Supervisor::new(config);
//!
//!     supervisor.on_event(|event| println!("{:?}", event));
//!     supervisor.start()?;
//!
//!     let answer = supervisor
//!         .load_and_solve("models/qwen.gguf", "What is 2 + 2?", None)
//!         .await?;
//!     println!("{}", answer.data);
//!
//!     supervisor.stop();
//!     Ok(())
//! }
//! ```

mod backend;
mod codec;
mod config;
mod dispatcher;
mod error;
mod installer;
mod observer;
mod process;
mod repair;
mod router;
mod supervisor;

pub use backend::{
    BoxedReader, BoxedWriter, ChildProcessBackend, InProcessBackend, WorkerBackend,
    WorkerChannels, WorkerHandle, WorkerIo,
};
pub use codec::{Decoded, FrameCodec};
pub use config::{resolve_interpreter, SupervisorConfig, DEFAULT_SOURCE_OVERRIDE_PACKAGE};
pub use dispatcher::{Reply, RequestDispatcher, Ticket};
pub use error::SupervisorError;
pub use installer::{pip_arguments, resolve_install_args, InstallSpec, PackageInstaller, PipInstaller};
pub use observer::{spawn_observer, EventSink};
pub use process::WorkerProcess;
pub use repair::{InstallHandler, RepairCoordinator};
pub use router::{classify, Route};
pub use supervisor::Supervisor;

// Re-export the domain types callers need alongside the supervisor
pub use workhorse_core::{
    tasks, Command, Completion, InstallJob, JobId, OutputStream, Progress, RepairState,
    SupervisorEvent, TaskState, WorkerFailure, WorkerMessage, WorkerState,
};
