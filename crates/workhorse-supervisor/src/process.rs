//! Worker process lifecycle.
//!
//! Each start launches a new generation of the worker with three tasks:
//! a reader that decodes output frames, a writer that serializes input
//! frames, and a monitor that reports the exit. Everything they send is
//! tagged with the generation so the router can drop events from a worker
//! that has already been replaced.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use workhorse_core::WorkerState;

use crate::backend::{BoxedReader, BoxedWriter, WorkerBackend, WorkerHandle};
use crate::codec::{Decoded, FrameCodec};
use crate::error::SupervisorError;

/// Read size for worker output.
const READ_CHUNK: usize = 8192;

/// How long the monitor waits for the reader to drain after an exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that happened to one worker generation.
#[derive(Debug)]
pub(crate) struct ProcessEvent {
    pub generation: u64,
    pub kind: ProcessEventKind,
}

#[derive(Debug)]
pub(crate) enum ProcessEventKind {
    /// One decoded output line.
    Frame(Decoded),
    /// The worker is gone. Always the last event of its generation.
    Exited {
        exit_code: Option<i32>,
        requested: bool,
    },
}

/// The single worker process and its state.
pub struct WorkerProcess {
    backend: Arc<dyn WorkerBackend>,
    state: WorkerState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    kill: Option<oneshot::Sender<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl WorkerProcess {
    pub fn new(backend: Arc<dyn WorkerBackend>) -> Self {
        Self {
            backend,
            state: WorkerState::NotStarted,
            generation: 0,
            outbound: None,
            kill: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the current generation was started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Whether events from `generation` still matter.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state.is_alive()
    }

    /// Launch a new generation. Does nothing if a worker is already alive.
    pub(crate) fn start(
        &mut self,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<bool, SupervisorError> {
        if self.state.is_alive() {
            debug!(generation = self.generation, "Worker already running");
            return Ok(false);
        }

        let channels = self.backend.spawn()?;

        self.generation += 1;
        let generation = self.generation;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_frames(channels.input, outbound_rx));
        let reader = tokio::spawn(read_frames(channels.output, generation, events.clone()));
        tokio::spawn(monitor(channels.handle, kill_rx, reader, generation, events));

        self.state = WorkerState::Starting;
        self.outbound = Some(outbound_tx);
        self.kill = Some(kill_tx);
        self.started_at = Some(Utc::now());

        info!(
            generation,
            backend = %self.backend.describe(),
            "Worker process started"
        );
        Ok(true)
    }

    /// `Starting` -> `Ready`. Returns false in any other state.
    pub(crate) fn mark_ready(&mut self) -> bool {
        if self.state != WorkerState::Starting {
            return false;
        }
        self.state = WorkerState::Ready;
        true
    }

    /// The current generation exited on its own.
    pub(crate) fn mark_crashed(&mut self) {
        self.state = WorkerState::Crashed;
        self.outbound = None;
        self.kill = None;
    }

    /// Queue one encoded frame for the writer task.
    pub(crate) fn write(&self, frame: Vec<u8>) -> Result<(), SupervisorError> {
        match &self.outbound {
            Some(tx) => tx.send(frame).map_err(|_| SupervisorError::ChannelClosed),
            None => Err(SupervisorError::ChannelClosed),
        }
    }

    /// Terminate the current generation. Returns false if nothing was running.
    pub(crate) fn stop(&mut self) -> bool {
        if !self.state.is_alive() {
            return false;
        }
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.outbound = None;
        self.state = WorkerState::Stopped;
        info!(generation = self.generation, "Worker process stopping");
        true
    }
}

async fn write_frames(mut input: BoxedWriter, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        trace!(bytes = frame.len(), "Writing frame to worker");
        if let Err(e) = write_frame(&mut input, &frame).await {
            warn!(error = %e, "Failed to write to worker input");
            break;
        }
    }
    let _ = input.shutdown().await;
}

async fn write_frame(input: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
    input.write_all(frame).await?;
    input.flush().await
}

async fn read_frames(
    mut output: BoxedReader,
    generation: u64,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut codec = FrameCodec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let send = |item: Decoded| {
        events
            .send(ProcessEvent {
                generation,
                kind: ProcessEventKind::Frame(item),
            })
            .is_ok()
    };

    loop {
        match output.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for item in codec.feed(&chunk[..n]) {
                    if !send(item) {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(generation, error = %e, "Error reading worker output");
                break;
            }
        }
    }

    if let Some(item) = codec.finish() {
        send(item);
    }
    debug!(generation, "Worker output closed");
}

async fn monitor(
    mut handle: Box<dyn WorkerHandle>,
    mut kill: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    generation: u64,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    // A dropped kill sender counts as a kill request.
    let exited = tokio::select! {
        status = handle.wait() => Some(status),
        _ = &mut kill => None,
    };

    let (exit_code, requested) = match exited {
        Some(Ok(code)) => (code, false),
        Some(Err(e)) => {
            warn!(generation, error = %e, "Failed to wait for worker");
            (None, false)
        }
        None => {
            if let Err(e) = handle.kill().await {
                warn!(generation, error = %e, "Failed to kill worker");
            }
            (None, true)
        }
    };

    if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
        warn!(generation, "Worker output still open after exit");
    }

    info!(generation, exit_code = ?exit_code, requested, "Worker process exited");
    let _ = events.send(ProcessEvent {
        generation,
        kind: ProcessEventKind::Exited {
            exit_code,
            requested,
        },
    });
}
