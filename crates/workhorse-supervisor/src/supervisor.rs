//! The supervisor: one worker, its requests, and its repairs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use workhorse_core::{
    tasks, Command, Completion, InstallJob, RepairState, SupervisorEvent, TaskState, WorkerMessage,
    WorkerState,
};

use crate::backend::{ChildProcessBackend, WorkerBackend};
use crate::codec::FrameCodec;
use crate::config::SupervisorConfig;
use crate::dispatcher::{RequestDispatcher, Ticket};
use crate::error::SupervisorError;
use crate::installer::{PackageInstaller, PipInstaller};
use crate::observer::{spawn_observer, EventSink};
use crate::process::{ProcessEvent, ProcessEventKind, WorkerProcess};
use crate::repair::{self, InstallHandler, RepairCoordinator};
use crate::router::{classify, Route};

/// State guarded by the supervisor lock.
pub(crate) struct Core {
    pub process: WorkerProcess,
    pub dispatcher: RequestDispatcher,
    pub tasks: TaskState,
    pub repair: RepairCoordinator,
}

struct Inner {
    config: SupervisorConfig,
    installer: Arc<dyn PackageInstaller>,
    core: Mutex<Core>,
    events: EventSink,
    process_tx: mpsc::UnboundedSender<ProcessEvent>,
    worker_state: watch::Sender<WorkerState>,
    install_handler: RwLock<Option<Arc<dyn InstallHandler>>>,
}

/// Supervises a single long-lived worker.
///
/// Cloning is cheap; clones share the same worker. Constructors spawn the
/// routing task, so they must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Supervisor for `<interpreter> <script>` that repairs with pip.
    pub fn new(config: SupervisorConfig) -> Self {
        let backend = Arc::new(ChildProcessBackend::from_config(&config));
        Self::with_backend(config, backend)
    }

    /// Supervisor for a custom backend that repairs with pip.
    pub fn with_backend(config: SupervisorConfig, backend: Arc<dyn WorkerBackend>) -> Self {
        let installer = Arc::new(
            PipInstaller::new(&config.interpreter)
                .with_override_package(&config.source_override_package),
        );
        Self::from_parts(config, backend, installer)
    }

    /// Supervisor with a custom backend and installer.
    pub fn from_parts(
        config: SupervisorConfig,
        backend: Arc<dyn WorkerBackend>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (worker_state, _) = watch::channel(WorkerState::NotStarted);
        let events = EventSink::new(config.event_capacity);

        let inner = Arc::new(Inner {
            config,
            installer,
            core: Mutex::new(Core {
                process: WorkerProcess::new(backend),
                dispatcher: RequestDispatcher::new(),
                tasks: TaskState::default(),
                repair: RepairCoordinator::default(),
            }),
            events,
            process_tx,
            worker_state,
            install_handler: RwLock::new(None),
        });

        tokio::spawn(route_events(Arc::downgrade(&inner), process_rx));
        Self { inner }
    }

    /// Launch the worker. Does nothing if it is already running.
    ///
    /// Also clears a failed repair, since starting by hand is how the caller
    /// recovers from one.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut core = self.core();
        self.start_locked(&mut core)?;
        if core.repair.reset() {
            info!("Cleared failed repair state");
            self.emit(SupervisorEvent::RepairStateChanged {
                state: RepairState::Running,
            });
        }
        Ok(())
    }

    /// Terminate the worker and reject every outstanding request.
    ///
    /// A dependency repair in progress is cancelled along with anything
    /// queued behind it, and the worker stays down.
    pub fn stop(&self) {
        let mut core = self.core();
        if core.repair.cancel() {
            info!("Cancelled dependency repair");
            self.emit(SupervisorEvent::RepairStateChanged {
                state: RepairState::Running,
            });
        }
        self.stop_locked(&mut core);
    }

    pub fn is_running(&self) -> bool {
        self.core().process.state().is_alive()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.core().process.state()
    }

    pub fn repair_state(&self) -> RepairState {
        self.core().repair.state()
    }

    /// Snapshot of the cross-restart task memory.
    pub fn task_state(&self) -> TaskState {
        self.core().tasks.clone()
    }

    /// Set (or clear) the alternate source for the override package.
    pub fn set_package_source(&self, url: Option<String>) {
        debug!(url = ?url, "Package source updated");
        self.core().tasks.package_source_url = url;
    }

    /// Send a command and wait for the worker's `complete` or `error`.
    ///
    /// Before the worker is ready the command waits in a queue and is sent
    /// in order once `ready` arrives. After a failed dependency repair this
    /// returns [`SupervisorError::RepairFailed`] until [`Supervisor::start`].
    pub async fn send(
        &self,
        command: impl Into<String>,
        payload: Value,
    ) -> Result<Completion, SupervisorError> {
        self.request(Command::new(command, payload)).await
    }

    /// Like [`Supervisor::send`] with a prepared command.
    pub async fn request(&self, command: Command) -> Result<Completion, SupervisorError> {
        let ticket = self.issue(command)?;
        self.wait_for(ticket).await
    }

    pub async fn load_model(&self, model_path: &str) -> Result<Completion, SupervisorError> {
        self.request(Command::load_model(model_path)).await
    }

    pub async fn solve_problem(&self, problem: &str) -> Result<Completion, SupervisorError> {
        self.request(Command::solve_problem(problem)).await
    }

    /// Load a model, then solve `problem` with it.
    ///
    /// The problem is remembered with the load, so if the load is interrupted
    /// by a dependency repair, the repair's replay carries on to the solve and
    /// observers receive its result. Nothing is remembered if the load is
    /// refused.
    pub async fn load_and_solve(
        &self,
        model_path: &str,
        problem: &str,
        source_url: Option<String>,
    ) -> Result<Completion, SupervisorError> {
        let ticket = {
            let mut core = self.core();
            let ticket = self.issue_locked(&mut core, Command::load_model(model_path))?;
            if source_url.is_some() {
                core.tasks.package_source_url = source_url;
            }
            core.tasks.pending_problem = Some(problem.to_string());
            ticket
        };
        self.chain_solve(ticket, Some(problem.to_string())).await
    }

    /// Subscribe to observer events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Call `observer` for every event from now on.
    pub fn on_event<F>(&self, observer: F) -> JoinHandle<()>
    where
        F: FnMut(SupervisorEvent) + Send + 'static,
    {
        spawn_observer(self.subscribe(), observer)
    }

    /// Take over `install_needed` handling. `None` restores the built-in repair.
    pub fn set_install_handler(&self, handler: Option<Arc<dyn InstallHandler>>) {
        *self
            .inner
            .install_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub(crate) fn installer(&self) -> &Arc<dyn PackageInstaller> {
        &self.inner.installer
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.inner.events
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn watch_worker_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.worker_state.subscribe()
    }

    /// Launch the worker without touching the repair state.
    pub(crate) fn start_locked(&self, core: &mut Core) -> Result<(), SupervisorError> {
        let launched = core
            .process
            .start(self.inner.process_tx.clone())
            .map_err(|e| {
                error!(error = %e, "Failed to start worker");
                e
            })?;
        if launched {
            self.publish_state(WorkerState::Starting);
        }
        Ok(())
    }

    pub(crate) fn stop_locked(&self, core: &mut Core) {
        if core.process.stop() {
            self.publish_state(WorkerState::Stopped);
        }
        core.dispatcher.reject_all(|| SupervisorError::Cancelled);
    }

    /// Register a request and send or queue its frame.
    pub(crate) fn issue(&self, command: Command) -> Result<Ticket, SupervisorError> {
        let mut core = self.core();
        self.issue_locked(&mut core, command)
    }

    /// Task memory is only updated once the command is accepted.
    pub(crate) fn issue_locked(
        &self,
        core: &mut Core,
        command: Command,
    ) -> Result<Ticket, SupervisorError> {
        if let Some(package) = core.repair.failed_package() {
            return Err(SupervisorError::RepairFailed {
                package: package.to_string(),
            });
        }
        let frame = FrameCodec::encode(&command)?;
        let ticket = core.dispatcher.register(command.task())?;

        if core.process.state() == WorkerState::Ready {
            if let Err(e) = core.process.write(frame) {
                core.dispatcher.expire(&ticket.task, &ticket.id);
                return Err(e);
            }
            debug!(task = %ticket.task, request_id = %ticket.id, "Command sent");
        } else {
            core.dispatcher.enqueue(&ticket.task, frame);
        }
        core.tasks.record(&command);
        Ok(ticket)
    }

    /// Wait for the reply to `ticket`, honoring the configured timeout.
    pub(crate) async fn wait_for(&self, ticket: Ticket) -> Result<Completion, SupervisorError> {
        let Ticket {
            task,
            id,
            mut reply,
        } = ticket;

        if let Some(limit) = self.inner.config.request_timeout {
            let outcome = tokio::time::timeout(limit, &mut reply).await;
            return match outcome {
                Ok(result) => result.map_err(|_| SupervisorError::ChannelClosed)?,
                Err(_) => {
                    if self.core().dispatcher.expire(&task, &id) {
                        warn!(task = %task, request_id = %id, timeout = ?limit, "Request timed out");
                        return Err(SupervisorError::Timeout { task, after: limit });
                    }
                    // The reply won the race against the timer.
                    reply.await.map_err(|_| SupervisorError::ChannelClosed)?
                }
            };
        }

        let interval = self.inner.config.silence_warning;
        if interval.is_zero() {
            return reply.await.map_err(|_| SupervisorError::ChannelClosed)?;
        }
        let mut waited = interval;
        loop {
            tokio::select! {
                result = &mut reply => return result.map_err(|_| SupervisorError::ChannelClosed)?,
                _ = tokio::time::sleep(interval) => {
                    warn!(task = %task, request_id = %id, waited = ?waited, "Still waiting for worker reply");
                    waited += interval;
                }
            }
        }
    }

    /// Wait for a `load_model` reply, then solve `problem`.
    ///
    /// Without a problem of its own the remembered pending problem is used,
    /// unless a solve is already in flight.
    pub(crate) async fn chain_solve(
        &self,
        load: Ticket,
        problem: Option<String>,
    ) -> Result<Completion, SupervisorError> {
        let loaded = self.wait_for(load).await?;

        let ticket = {
            let mut core = self.core();
            let problem = match problem {
                Some(problem) => problem,
                None => {
                    let Some(problem) = core.tasks.pending_problem.clone() else {
                        return Ok(loaded);
                    };
                    if core.dispatcher.is_in_flight(tasks::SOLVE_PROBLEM) {
                        debug!("Solve already in flight, not chaining");
                        return Ok(loaded);
                    }
                    problem
                }
            };
            info!("Model loaded, solving pending problem");
            self.issue_locked(&mut core, Command::solve_problem(problem))?
        };
        self.wait_for(ticket).await
    }

    fn publish_state(&self, state: WorkerState) {
        self.inner.worker_state.send_replace(state);
        debug!(state = %state, "Worker state changed");
        self.emit(SupervisorEvent::WorkerStateChanged { state });
    }

    fn handle_process_event(&self, event: ProcessEvent) {
        let mut core = self.core();
        if !core.process.is_current(event.generation) {
            trace!(generation = event.generation, "Dropping event from a previous worker");
            return;
        }

        match event.kind {
            ProcessEventKind::Frame(Ok(message)) => {
                trace!(kind = message.kind(), "Routing worker message");
                if let Some(job) = self.route(&mut core, message) {
                    drop(core);
                    self.on_install_needed(job);
                }
            }
            ProcessEventKind::Frame(Err(err)) => {
                warn!(error = %err, preview = ?err.preview(), "Dropping malformed worker output");
                self.emit(SupervisorEvent::FramingError {
                    reason: err.to_string(),
                    preview: err.preview().map(str::to_owned),
                });
            }
            ProcessEventKind::Exited { exit_code, .. } => {
                core.process.mark_crashed();
                let rejected = core
                    .dispatcher
                    .reject_all(|| SupervisorError::WorkerCrashed { exit_code });
                error!(exit_code = ?exit_code, rejected, "Worker process exited unexpectedly");
                self.emit(SupervisorEvent::WorkerCrashed { exit_code });
                self.publish_state(WorkerState::Crashed);
            }
        }
    }

    /// Apply the route for `message`. A repair job is returned to the caller,
    /// which handles it after releasing the lock.
    fn route(&self, core: &mut Core, message: WorkerMessage) -> Option<InstallJob> {
        match classify(&message) {
            Route::Ready => {
                if core.process.mark_ready() {
                    let queued = core.dispatcher.drain_queue();
                    let flushed = queued.len();
                    for frame in queued {
                        if let Err(e) = core.process.write(frame) {
                            warn!(error = %e, "Failed to flush queued command");
                        }
                    }
                    info!(flushed, "Worker ready");
                    self.publish_state(WorkerState::Ready);
                } else {
                    debug!("Ignoring duplicate ready");
                }
            }
            Route::Correlate { task, reply } => {
                let matched = match task.as_deref() {
                    Some(task) => {
                        core.tasks.settle(task);
                        core.dispatcher.resolve(task, reply)
                    }
                    None => false,
                };
                if !matched {
                    debug!(task = ?task, kind = message.kind(), "No caller waiting for this reply");
                }
                self.broadcast(&message);
            }
            Route::Broadcast => self.broadcast(&message),
            Route::Ignore => debug!(kind = message.kind(), "Ignoring unknown worker message"),
            Route::Repair(job) => return Some(job),
        }
        None
    }

    fn broadcast(&self, message: &WorkerMessage) {
        if let Some(event) = SupervisorEvent::from_message(message) {
            self.emit(event);
        }
    }

    fn on_install_needed(&self, job: InstallJob) {
        let handler = self
            .inner
            .install_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match handler {
            Some(handler) => {
                info!(package = %job.package_name, "Delegating install to custom handler");
                let supervisor = self.clone();
                tokio::spawn(async move {
                    handler.on_install_needed(job, supervisor).await;
                });
            }
            None => repair::begin(self, job),
        }
    }
}

/// The routing task. Ends once every supervisor handle is dropped.
async fn route_events(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Supervisor { inner }.handle_process_event(event);
    }
    debug!("Supervisor event loop finished");
}
