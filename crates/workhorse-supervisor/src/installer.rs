//! Dependency installation through the interpreter's package manager.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as ProcessCommand;
use tracing::{debug, error, info, warn};
use workhorse_core::{InstallJob, JobId, OutputStream, SupervisorEvent};

use crate::config::DEFAULT_SOURCE_OVERRIDE_PACKAGE;
use crate::error::SupervisorError;
use crate::observer::EventSink;

const EXTRA_INDEX_FLAG: &str = "--extra-index-url";

/// Flags passed to every `pip install`.
const PIP_FLAGS: &[&str] = &[
    "--no-warn-script-location",
    "--no-input",
    "--prefer-binary",
    "--no-cache-dir",
    "-v",
];

/// Package and extra arguments after source overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    pub package: String,
    pub args: Vec<String>,
}

/// Apply a configured package source to an install request.
///
/// Only `override_package` is affected. Its `--extra-index-url` pair is
/// removed; a `.whl` URL then replaces the package, any other URL becomes
/// the new extra index.
pub fn resolve_install_args(
    package: &str,
    args: &[String],
    source_url: Option<&str>,
    override_package: &str,
) -> InstallSpec {
    let mut spec = InstallSpec {
        package: package.to_string(),
        args: args.to_vec(),
    };

    let Some(url) = source_url.filter(|url| !url.is_empty()) else {
        return spec;
    };
    if package != override_package {
        return spec;
    }

    if let Some(idx) = spec.args.iter().position(|a| a == EXTRA_INDEX_FLAG) {
        let end = (idx + 2).min(spec.args.len());
        spec.args.drain(idx..end);
    }

    if url.ends_with(".whl") {
        spec.package = url.to_string();
    } else {
        spec.args.push(EXTRA_INDEX_FLAG.to_string());
        spec.args.push(url.to_string());
    }
    spec
}

/// Full argument list for `<interpreter> -m pip install ...`.
pub fn pip_arguments(spec: &InstallSpec) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        spec.package.clone(),
    ];
    args.extend(PIP_FLAGS.iter().map(|f| f.to_string()));
    args.extend(spec.args.iter().cloned());
    args
}

/// Installs one package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Run the install and return its exit code (`None` if killed by a signal).
    ///
    /// Output lines are published to `events` as they arrive. `Err` means the
    /// installer could not be run at all.
    async fn install(
        &self,
        job: &InstallJob,
        source_url: Option<&str>,
        events: &EventSink,
    ) -> Result<Option<i32>, SupervisorError>;
}

/// Installs with `<interpreter> -m pip install`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    interpreter: PathBuf,
    override_package: String,
}

impl PipInstaller {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            override_package: DEFAULT_SOURCE_OVERRIDE_PACKAGE.to_string(),
        }
    }

    /// Set the package that a configured source URL applies to.
    pub fn with_override_package(mut self, package: impl Into<String>) -> Self {
        self.override_package = package.into();
        self
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(
        &self,
        job: &InstallJob,
        source_url: Option<&str>,
        events: &EventSink,
    ) -> Result<Option<i32>, SupervisorError> {
        let spec = resolve_install_args(
            &job.package_name,
            &job.args,
            source_url,
            &self.override_package,
        );
        let args = pip_arguments(&spec);

        info!(job_id = %job.id, package = %spec.package, "Installing package");
        events.emit(SupervisorEvent::Status {
            text: format!("Installing {}...", spec.package),
        });
        events.emit(SupervisorEvent::Log {
            text: format!("Command: {} {}", self.interpreter.display(), args.join(" ")),
        });

        let mut child = ProcessCommand::new(&self.interpreter)
            .args(&args)
            .env("PYTHONUNBUFFERED", "1")
            .env("PIP_PROGRESS_BAR", "off")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!(error = %source, "Failed to spawn package installer");
                SupervisorError::Spawn {
                    program: self.interpreter.display().to_string(),
                    source,
                }
            })?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(stream_lines(out, OutputStream::Stdout, job.id.clone(), events.clone()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(stream_lines(err, OutputStream::Stderr, job.id.clone(), events.clone()))
        });

        let status = child.wait().await?;
        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = reader.await;
        }

        let exit_code = status.code();
        info!(job_id = %job.id, exit_code = ?exit_code, "Package installer finished");
        Ok(exit_code)
    }
}

async fn stream_lines<R>(reader: R, stream: OutputStream, job_id: JobId, events: EventSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match stream {
                    OutputStream::Stdout => debug!(job_id = %job_id, "pip: {}", trimmed),
                    OutputStream::Stderr => warn!(job_id = %job_id, "pip: {}", trimmed),
                }
                events.emit(SupervisorEvent::InstallOutput {
                    job_id: job_id.clone(),
                    stream,
                    line: trimmed.to_string(),
                });
            }
            Err(e) => {
                warn!(error = %e, "Error reading installer output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const LLAMA: &str = "llama-cpp-python";

    #[test]
    fn test_no_override_without_url() {
        let args = strings(&["--extra-index-url", "https://default"]);
        let spec = resolve_install_args(LLAMA, &args, None, LLAMA);
        assert_eq!(spec.package, LLAMA);
        assert_eq!(spec.args, args);

        let spec = resolve_install_args(LLAMA, &args, Some(""), LLAMA);
        assert_eq!(spec.args, args);
    }

    #[test]
    fn test_index_url_replaces_extra_index() {
        let args = strings(&["--extra-index-url", "https://default", "--upgrade"]);
        let spec = resolve_install_args(LLAMA, &args, Some("https://mirror/cu121"), LLAMA);

        assert_eq!(spec.package, LLAMA);
        assert_eq!(
            spec.args,
            strings(&["--upgrade", "--extra-index-url", "https://mirror/cu121"])
        );
    }

    #[test]
    fn test_wheel_url_replaces_package() {
        let args = strings(&["--extra-index-url", "https://default"]);
        let url = "https://host/llama_cpp_python-0.3.2-cp311-win_amd64.whl";
        let spec = resolve_install_args(LLAMA, &args, Some(url), LLAMA);

        assert_eq!(spec.package, url);
        assert!(spec.args.is_empty());
    }

    #[test]
    fn test_dangling_flag_is_removed() {
        let args = strings(&["--upgrade", "--extra-index-url"]);
        let spec = resolve_install_args(LLAMA, &args, Some("https://mirror"), LLAMA);
        assert_eq!(
            spec.args,
            strings(&["--upgrade", "--extra-index-url", "https://mirror"])
        );
    }

    #[test]
    fn test_other_packages_untouched() {
        let args = strings(&["--index-url", "https://download.pytorch.org/whl/cu121"]);
        let spec = resolve_install_args("torch", &args, Some("https://mirror"), LLAMA);
        assert_eq!(spec.package, "torch");
        assert_eq!(spec.args, args);
    }

    #[test]
    fn test_pip_arguments() {
        let spec = InstallSpec {
            package: "torch".to_string(),
            args: strings(&["--index-url", "https://x"]),
        };
        assert_eq!(
            pip_arguments(&spec),
            strings(&[
                "-m",
                "pip",
                "install",
                "torch",
                "--no-warn-script-location",
                "--no-input",
                "--prefer-binary",
                "--no-cache-dir",
                "-v",
                "--index-url",
                "https://x",
            ])
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let installer = PipInstaller::new("/definitely/not/a/python");
        let job = InstallJob::new("torch", "install_pytorch");
        let err = installer
            .install(&job, None, &EventSink::new(8))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_installer_reports_exit_code() {
        // `sh -m pip ...` tries to run a script named `pip` and fails.
        let installer = PipInstaller::new("sh");
        let job = InstallJob::new("torch", "install_pytorch");
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();

        let code = installer.install(&job, None, &sink).await.unwrap();
        assert!(matches!(code, Some(c) if c != 0));

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            SupervisorEvent::Status {
                text: "Installing torch...".to_string()
            }
        );
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, SupervisorEvent::Log { ref text } if text.starts_with("Command: sh -m pip install torch")));
    }
}
