//! Supervisor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

/// Package whose install source can be overridden by a configured URL.
pub const DEFAULT_SOURCE_OVERRIDE_PACKAGE: &str = "llama-cpp-python";

/// Interpreter used when no project virtual environment exists.
pub const SYSTEM_INTERPRETER: &str = "python";

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interpreter that runs the worker script and the package manager.
    pub interpreter: PathBuf,

    /// Worker script passed to the interpreter.
    pub script: PathBuf,

    /// Working directory for the worker (inherited when unset).
    pub working_dir: Option<PathBuf>,

    /// Additional environment variables for the worker.
    pub env_vars: Vec<(String, String)>,

    /// Reject a request that has no reply after this long. Disabled when unset.
    pub request_timeout: Option<Duration>,

    /// Without a timeout, log a warning each time a caller waited this long.
    pub silence_warning: Duration,

    /// How long a repair waits for the restarted worker's `ready`.
    pub ready_timeout: Duration,

    /// Extra delay between `ready` and replaying the interrupted task.
    pub resume_settle: Duration,

    /// Capacity of the observer broadcast channel.
    pub event_capacity: usize,

    /// Package name that `package_source_url` applies to.
    pub source_override_package: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from(SYSTEM_INTERPRETER),
            script: PathBuf::from("python/main.py"),
            working_dir: None,
            env_vars: Vec::new(),
            request_timeout: None,
            silence_warning: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(30),
            resume_settle: Duration::ZERO,
            event_capacity: 256,
            source_override_package: DEFAULT_SOURCE_OVERRIDE_PACKAGE.to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Configuration for a worker script inside `project_root`.
    ///
    /// Uses the project's virtual environment interpreter when present.
    pub fn for_project(project_root: impl AsRef<Path>, script: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref();
        Self {
            interpreter: resolve_interpreter(root),
            script: root.join(script),
            working_dir: Some(root.to_path_buf()),
            ..Self::default()
        }
    }

    /// Set the interpreter.
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Set the worker script.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = script.into();
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Enable the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the silence warning interval.
    pub fn with_silence_warning(mut self, interval: Duration) -> Self {
        self.silence_warning = interval;
        self
    }

    /// Set how long a repair waits for `ready`.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the delay between `ready` and the resume replay.
    pub fn with_resume_settle(mut self, delay: Duration) -> Self {
        self.resume_settle = delay;
        self
    }
}

/// Pick the interpreter for `project_root`.
///
/// Prefers `.venv/bin/python` (`.venv\Scripts\python.exe` on Windows),
/// otherwise falls back to the system `python`.
pub fn resolve_interpreter(project_root: &Path) -> PathBuf {
    let venv = venv_python(project_root);
    if venv.exists() {
        debug!(path = %venv.display(), "Using virtual environment interpreter");
        venv
    } else {
        debug!("Using system interpreter");
        PathBuf::from(SYSTEM_INTERPRETER)
    }
}

fn venv_python(project_root: &Path) -> PathBuf {
    if cfg!(windows) {
        project_root.join(".venv").join("Scripts").join("python.exe")
    } else {
        project_root.join(".venv").join("bin").join("python")
    }
}
