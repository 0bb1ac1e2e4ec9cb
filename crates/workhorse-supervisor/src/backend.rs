//! Worker backends.
//!
//! A backend knows how to launch one worker and hand back its byte streams
//! plus a handle to wait for or kill it. The supervisor does not care whether
//! the worker is an OS process or a task inside this process.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
    WriteHalf,
};
use tokio::process::{Child, ChildStderr, Command as ProcessCommand};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use workhorse_core::{Command, Frame, WorkerMessage};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

/// Buffer size of the in-memory pipe used by [`InProcessBackend`].
const DUPLEX_CAPACITY: usize = 64 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Streams and handle of a freshly launched worker.
pub struct WorkerChannels {
    /// Worker input (commands).
    pub input: BoxedWriter,
    /// Worker output (messages).
    pub output: BoxedReader,
    pub handle: Box<dyn WorkerHandle>,
}

/// Handle to a running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Wait for the worker to exit. `Ok(None)` means it was killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Terminate the worker and reap it.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Something that can launch a worker.
pub trait WorkerBackend: Send + Sync {
    /// Launch a worker. Must be called from within a Tokio runtime.
    fn spawn(&self) -> Result<WorkerChannels, SupervisorError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Runs the worker as a child process with piped stdio.
#[derive(Debug, Clone)]
pub struct ChildProcessBackend {
    program: PathBuf,
    script: Option<PathBuf>,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
}

impl ChildProcessBackend {
    /// Create a backend running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: None,
            args: Vec::new(),
            working_dir: None,
            env_vars: Vec::new(),
        }
    }

    /// `<interpreter> <script>` from the supervisor configuration.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        let mut backend = Self::new(&config.interpreter).with_script(&config.script);
        backend.working_dir = config.working_dir.clone();
        config
            .env_vars
            .iter()
            .fold(backend, |backend, (key, value)| backend.with_env(key, value))
    }

    /// Set the script passed as first argument. It must exist at spawn time.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Append an argument.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    fn spawn_error(&self, source: io::Error) -> SupervisorError {
        SupervisorError::Spawn {
            program: self.program.display().to_string(),
            source,
        }
    }
}

impl WorkerBackend for ChildProcessBackend {
    fn spawn(&self) -> Result<WorkerChannels, SupervisorError> {
        let mut cmd = ProcessCommand::new(&self.program);

        if let Some(script) = &self.script {
            if !script.exists() {
                error!(script = %script.display(), "Worker script not found");
                return Err(self.spawn_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("worker script '{}' not found", script.display()),
                )));
            }
            cmd.arg(script);
        }
        cmd.args(&self.args);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        if let Some(path) = path_with_cuda() {
            cmd.env("PATH", path);
        }

        info!(program = %self.program.display(), script = ?self.script, "Spawning worker process");
        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn worker process");
            self.spawn_error(e)
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Io(io::Error::other("worker stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Io(io::Error::other("worker stdout unavailable")))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        info!(pid = ?child.id(), "Worker process spawned");

        Ok(WorkerChannels {
            input: Box::new(stdin),
            output: Box::new(stdout),
            handle: Box::new(ChildHandle { child }),
        })
    }

    fn describe(&self) -> String {
        match &self.script {
            Some(script) => format!("{} {}", self.program.display(), script.display()),
            None => self.program.display().to_string(),
        }
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ChildHandle {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Log worker stderr line by line.
async fn log_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    warn!(stderr = %trimmed, "Worker stderr");
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}

/// On Windows, make sure `%CUDA_PATH%\bin` is on the worker's `PATH`.
fn path_with_cuda() -> Option<OsString> {
    if !cfg!(windows) {
        return None;
    }
    let cuda_bin = PathBuf::from(std::env::var_os("CUDA_PATH")?).join("bin");
    let current = std::env::var_os("PATH").unwrap_or_default();
    if std::env::split_paths(&current).any(|p| p == cuda_bin) {
        return None;
    }
    let paths = std::iter::once(cuda_bin).chain(std::env::split_paths(&current));
    std::env::join_paths(paths).ok()
}

type WorkerFuture = Pin<Box<dyn Future<Output = i32> + Send>>;
type WorkerFn = dyn Fn(WorkerIo) -> WorkerFuture + Send + Sync;

/// Runs the worker as a Tokio task talking over an in-memory pipe.
///
/// The worker function receives a [`WorkerIo`] and returns its exit code.
/// Returning ends the worker; the supervisor sees the same exit it would see
/// from a child process.
#[derive(Clone)]
pub struct InProcessBackend {
    worker: Arc<WorkerFn>,
}

impl InProcessBackend {
    /// Create a backend from an async worker function.
    pub fn new<F, Fut>(worker: F) -> Self
    where
        F: Fn(WorkerIo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        let worker: Arc<WorkerFn> = Arc::new(move |io: WorkerIo| -> WorkerFuture {
            Box::pin(worker(io))
        });
        Self { worker }
    }
}

impl fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessBackend").finish_non_exhaustive()
    }
}

impl WorkerBackend for InProcessBackend {
    fn spawn(&self) -> Result<WorkerChannels, SupervisorError> {
        let (host, worker_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (output, input) = tokio::io::split(host);
        let join = tokio::spawn((self.worker)(WorkerIo::new(worker_side)));

        debug!("In-process worker started");

        Ok(WorkerChannels {
            input: Box::new(input),
            output: Box::new(output),
            handle: Box::new(TaskHandle { join }),
        })
    }

    fn describe(&self) -> String {
        "in-process worker".to_string()
    }
}

struct TaskHandle {
    join: JoinHandle<i32>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        match (&mut self.join).await {
            Ok(code) => Ok(Some(code)),
            Err(e) if e.is_cancelled() => Ok(None),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.join.abort();
        Ok(())
    }
}

/// The worker's side of an in-process pipe.
pub struct WorkerIo {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl WorkerIo {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Read the next command. Returns `None` once the supervisor closed the pipe.
    ///
    /// Lines that are not valid commands are logged and skipped.
    pub async fn next_command(&mut self) -> Option<Command> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(trimmed) {
                        Ok(command) => return Some(command),
                        Err(e) => warn!(error = %e, "In-process worker got an invalid command"),
                    }
                }
            }
        }
    }

    /// Write one message frame.
    pub async fn emit(&mut self, message: &WorkerMessage) -> io::Result<()> {
        self.write_frame(&message.to_frame()).await
    }

    /// Write one `{"type": kind, "data": data}` frame.
    pub async fn send(&mut self, kind: &str, data: Value) -> io::Result<()> {
        self.write_frame(&Frame::new(kind, data)).await
    }

    /// Write raw bytes, unframed.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        self.write_raw(&bytes).await
    }
}
