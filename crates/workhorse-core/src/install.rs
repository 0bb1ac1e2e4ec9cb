//! Dependency install jobs.

use serde::{Deserialize, Serialize};

use crate::ids::JobId;
use crate::message::InstallRequest;

/// One dependency repair request, created from an `install_needed` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallJob {
    /// Unique job identifier, for log correlation.
    pub id: JobId,
    /// Package name, or a path/URL to a wheel.
    pub package_name: String,
    /// Extra package-manager arguments.
    pub args: Vec<String>,
    /// Task tag of the interrupted work.
    pub task: String,
    /// `package_name` is a temporary file to delete after a successful install.
    pub is_temp: bool,
}

impl InstallJob {
    /// Create a new job for `package_name`.
    pub fn new(package_name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            package_name: package_name.into(),
            args: Vec::new(),
            task: task.into(),
            is_temp: false,
        }
    }

    /// Builder method to set extra arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Builder method to mark the package as a temporary artifact.
    pub fn with_temp(mut self, is_temp: bool) -> Self {
        self.is_temp = is_temp;
        self
    }

    /// Returns true if `other` asks for the same package as this job.
    pub fn same_package(&self, other: &InstallJob) -> bool {
        self.package_name == other.package_name
    }
}

impl From<InstallRequest> for InstallJob {
    fn from(req: InstallRequest) -> Self {
        Self::new(req.package, req.task)
            .with_args(req.args)
            .with_temp(req.is_temp)
    }
}
