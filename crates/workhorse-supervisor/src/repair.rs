//! Dependency repair: stop, install, restart, resume.
//!
//! When the worker reports a missing dependency the supervisor stops it,
//! installs the package, starts a fresh worker, waits for its `ready`, and
//! replays the work that was interrupted. Only one job runs at a time; a
//! request for the package already being installed is coalesced and a
//! request for a different package waits its turn.
//!
//! [`Supervisor::stop`] cancels a running repair. Each run carries the epoch
//! it started in and stops acting as soon as that epoch is stale.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use workhorse_core::{
    tasks, Completion, InstallJob, RepairState, ResumePlan, SupervisorEvent, WorkerState,
};

use crate::error::SupervisorError;
use crate::supervisor::{Core, Supervisor};

/// Replaces the built-in repair cycle for `install_needed` messages.
#[async_trait]
pub trait InstallHandler: Send + Sync {
    async fn on_install_needed(&self, job: InstallJob, supervisor: Supervisor);
}

/// Outcome of offering a job to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// No repair was running; this job starts now.
    Start,
    /// The same package is already being installed or waiting.
    Coalesced,
    /// Runs after the current job.
    Queued,
}

/// Repair bookkeeping, kept under the supervisor lock.
#[derive(Debug, Default)]
pub struct RepairCoordinator {
    state: RepairState,
    active: Option<InstallJob>,
    queued: VecDeque<InstallJob>,
    /// Package of the last failed job, until the worker is started again.
    failed: Option<String>,
    epoch: u64,
    task: Option<AbortHandle>,
}

impl RepairCoordinator {
    pub fn state(&self) -> RepairState {
        self.state
    }

    /// The job currently being handled.
    pub fn active(&self) -> Option<&InstallJob> {
        self.active.as_ref()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Package whose repair failed, if the supervisor is still in `Failed`.
    pub fn failed_package(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a run started in `epoch` still owns the repair.
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.active.is_some()
    }

    pub(crate) fn admit(&mut self, job: InstallJob) -> Admission {
        let Some(active) = &self.active else {
            self.active = Some(job);
            self.state = RepairState::Repairing;
            return Admission::Start;
        };
        if active.same_package(&job) || self.queued.iter().any(|q| q.same_package(&job)) {
            return Admission::Coalesced;
        }
        self.queued.push_back(job);
        Admission::Queued
    }

    /// Remember the task running `epoch` so a cancel can abort it.
    pub(crate) fn attach(&mut self, epoch: u64, task: AbortHandle) {
        if self.is_current(epoch) {
            self.task = Some(task);
        } else {
            task.abort();
        }
    }

    pub(crate) fn set_state(&mut self, state: RepairState) {
        self.state = state;
    }

    /// The active job succeeded. Returns the next job, which becomes active.
    pub(crate) fn finish(&mut self) -> Option<InstallJob> {
        self.active = self.queued.pop_front();
        self.state = match self.active {
            Some(_) => RepairState::Repairing,
            None => {
                self.task = None;
                RepairState::Running
            }
        };
        self.active.clone()
    }

    /// The active job failed. Waiting jobs are dropped; returns how many.
    pub(crate) fn fail(&mut self) -> usize {
        let dropped = self.queued.len();
        self.failed = self.active.take().map(|job| job.package_name);
        self.queued.clear();
        self.task = None;
        self.state = RepairState::Failed;
        dropped
    }

    /// Abandon the running repair and everything queued behind it.
    ///
    /// Returns false if no repair was running.
    pub(crate) fn cancel(&mut self) -> bool {
        if !self.state.is_repairing() {
            return false;
        }
        self.epoch += 1;
        self.active = None;
        self.queued.clear();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = RepairState::Running;
        true
    }

    /// Leave `Failed` after the caller restarted the worker by hand.
    pub(crate) fn reset(&mut self) -> bool {
        if self.state != RepairState::Failed {
            return false;
        }
        self.failed = None;
        self.state = RepairState::Running;
        true
    }
}

enum Failure {
    Install(SupervisorError),
    Restart(SupervisorError),
    Cancelled,
}

/// Handle an `install_needed` with the built-in cycle.
///
/// Runs on the router task: by the time it returns the worker is stopped,
/// so nothing else from the old worker is routed.
pub(crate) fn begin(supervisor: &Supervisor, job: InstallJob) {
    let (admission, epoch) = {
        let mut core = supervisor.core();
        let admission = core.repair.admit(job.clone());
        if admission == Admission::Start {
            info!(job_id = %job.id, package = %job.package_name, task = %job.task, "Starting dependency repair");
            supervisor.emit(SupervisorEvent::RepairStateChanged {
                state: RepairState::Repairing,
            });
            supervisor.stop_locked(&mut core);
        }
        (admission, core.repair.epoch())
    };

    match admission {
        Admission::Start => {
            let task = tokio::spawn(run(supervisor.clone(), job, epoch));
            supervisor.core().repair.attach(epoch, task.abort_handle());
        }
        Admission::Coalesced => {
            info!(package = %job.package_name, "Install already in progress, ignoring duplicate request");
        }
        Admission::Queued => {
            info!(package = %job.package_name, "Install queued behind the current repair");
        }
    }
}

async fn run(supervisor: Supervisor, mut job: InstallJob, epoch: u64) {
    loop {
        let outcome = repair_once(&supervisor, &job, epoch).await;
        match conclude(&supervisor, &job, epoch, outcome) {
            Some(next) => job = next,
            None => break,
        }
    }
}

/// Record the outcome of `job` and stop the worker again if another job is waiting.
fn conclude(
    supervisor: &Supervisor,
    job: &InstallJob,
    epoch: u64,
    outcome: Result<(), Failure>,
) -> Option<InstallJob> {
    let mut core = supervisor.core();
    if !core.repair.is_current(epoch) {
        debug!(job_id = %job.id, "Dependency repair was cancelled");
        return None;
    }

    let failure = match outcome {
        Ok(()) => {
            info!(job_id = %job.id, "Dependency repair complete");
            let next = core.repair.finish();
            supervisor.emit(SupervisorEvent::RepairStateChanged {
                state: core.repair.state(),
            });
            if let Some(next) = &next {
                info!(job_id = %next.id, package = %next.package_name, "Starting queued dependency repair");
                supervisor.stop_locked(&mut core);
            }
            return next;
        }
        Err(failure) => failure,
    };

    let package = job.package_name.clone();
    let (event, install_exit) = match failure {
        Failure::Cancelled => return None,
        Failure::Install(err) => {
            let install_exit = match &err {
                SupervisorError::Install { exit_code, .. } => Some(*exit_code),
                _ => None,
            };
            error!(job_id = %job.id, package = %package, error = %err, "Dependency install failed");
            let event = SupervisorEvent::InstallFailed {
                job_id: job.id.clone(),
                package: package.clone(),
                exit_code: install_exit.flatten(),
                message: err.to_string(),
            };
            (event, install_exit)
        }
        Failure::Restart(err) => {
            error!(job_id = %job.id, error = %err, "Worker restart after install failed");
            let event = SupervisorEvent::RestartFailed {
                job_id: job.id.clone(),
                message: err.to_string(),
            };
            (event, None)
        }
    };

    // Queued sends were waiting for a worker that will not come back.
    let rejected = match install_exit {
        Some(exit_code) => core.dispatcher.reject_all(|| SupervisorError::Install {
            package: package.clone(),
            exit_code,
        }),
        None => core.dispatcher.reject_all(|| SupervisorError::RepairFailed {
            package: package.clone(),
        }),
    };
    let dropped = core.repair.fail();
    info!(rejected, dropped, "Dependency repair abandoned");

    supervisor.emit(event);
    supervisor.emit(SupervisorEvent::RepairStateChanged {
        state: RepairState::Failed,
    });
    None
}

/// Move the repair to `state`, unless it was cancelled.
fn advance(
    supervisor: &Supervisor,
    core: &mut Core,
    epoch: u64,
    state: RepairState,
) -> Result<(), Failure> {
    if !core.repair.is_current(epoch) {
        return Err(Failure::Cancelled);
    }
    core.repair.set_state(state);
    debug!(state = %state, "Repair state changed");
    supervisor.emit(SupervisorEvent::RepairStateChanged { state });
    Ok(())
}

fn ensure_current(supervisor: &Supervisor, epoch: u64) -> Result<(), Failure> {
    if supervisor.core().repair.is_current(epoch) {
        Ok(())
    } else {
        Err(Failure::Cancelled)
    }
}

async fn repair_once(
    supervisor: &Supervisor,
    job: &InstallJob,
    epoch: u64,
) -> Result<(), Failure> {
    let source_url = {
        let mut core = supervisor.core();
        advance(supervisor, &mut core, epoch, RepairState::Installing)?;
        core.tasks.package_source_url.clone()
    };

    let exit_code = supervisor
        .installer()
        .install(job, source_url.as_deref(), supervisor.events())
        .await
        .map_err(Failure::Install)?;
    if exit_code != Some(0) {
        return Err(Failure::Install(SupervisorError::Install {
            package: job.package_name.clone(),
            exit_code,
        }));
    }

    supervisor.emit(SupervisorEvent::Status {
        text: "Installation completed successfully.".to_string(),
    });
    if job.is_temp {
        remove_artifact(&job.package_name).await;
    }

    let mut states = supervisor.watch_worker_state();
    {
        let mut core = supervisor.core();
        advance(supervisor, &mut core, epoch, RepairState::Restarting)?;
        supervisor.start_locked(&mut core).map_err(Failure::Restart)?;
    }

    let ready_timeout = supervisor.config().ready_timeout;
    let state = match tokio::time::timeout(
        ready_timeout,
        states.wait_for(|state| *state != WorkerState::Starting),
    )
    .await
    {
        Ok(Ok(state)) => Some(*state),
        _ => None,
    };
    ensure_current(supervisor, epoch)?;
    match state {
        Some(WorkerState::Ready) => debug!("Restarted worker is ready"),
        Some(other) => {
            warn!(state = %other, "Restarted worker did not become ready");
            return Err(Failure::Restart(SupervisorError::WorkerCrashed {
                exit_code: None,
            }));
        }
        None => warn!(
            timeout = ?ready_timeout,
            "Restarted worker not ready in time, replay will wait in the queue"
        ),
    }

    let settle = supervisor.config().resume_settle;
    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    resume(supervisor, job, epoch)
}

/// Replay the interrupted work. Replies are awaited in the background.
fn resume(supervisor: &Supervisor, job: &InstallJob, epoch: u64) -> Result<(), Failure> {
    let replay = {
        let mut core = supervisor.core();
        advance(supervisor, &mut core, epoch, RepairState::Resuming)?;
        match core.tasks.plan_resume(&job.task) {
            ResumePlan::AnnounceComplete(task) => {
                info!(task = %task, "Install task complete");
                supervisor.emit(SupervisorEvent::Completed(Completion {
                    task: Some(task.clone()),
                    data: json!({ "task": task }),
                }));
                None
            }
            ResumePlan::Replay(command) => {
                let task = command.task().to_string();
                info!(task = %task, "Replaying interrupted task");
                match supervisor.issue_locked(&mut core, command) {
                    Ok(ticket) => Some((task, ticket)),
                    Err(e) => {
                        warn!(task = %task, error = %e, "Could not replay interrupted task");
                        None
                    }
                }
            }
            ResumePlan::Nothing => {
                debug!(task = %job.task, "Nothing to replay");
                None
            }
        }
    };

    if let Some((task, ticket)) = replay {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let result = if task == tasks::LOAD_MODEL {
                supervisor.chain_solve(ticket, None).await
            } else {
                supervisor.wait_for(ticket).await
            };
            match result {
                Ok(done) => info!(task = ?done.task, "Replayed task finished"),
                Err(e) if e.is_worker_gone() => {
                    debug!(task = %task, error = %e, "Replayed task interrupted")
                }
                Err(e) => warn!(task = %task, error = %e, "Replayed task failed"),
            }
        });
    }
    Ok(())
}

async fn remove_artifact(path: &str) {
    let path = Path::new(path);
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temporary package file"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary package file"),
    }
}
