//! Messages written by the worker, one JSON envelope per line.
//!
//! Decoding happens in two steps: the line is parsed into a [`Frame`]
//! (`{"type": ..., "data": ...}`), then the `type` drives decoding of `data`
//! into a strict [`WorkerMessage`] variant. Unknown types are kept as
//! [`WorkerMessage::Unknown`] so the caller can log and drop them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FramingError;

/// The wire envelope of a worker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Parse one line (without its terminator) into an envelope.
    pub fn parse(line: &[u8]) -> Result<Self, FramingError> {
        serde_json::from_slice(line).map_err(|e| FramingError::malformed(line, e))
    }

    fn task(&self) -> Option<String> {
        self.data
            .get("task")
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, FramingError> {
        serde_json::from_value(self.data.clone()).map_err(|source| FramingError::InvalidPayload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// Progress report for a long-running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
}

/// A `complete` message. `data` is the full payload, `task` included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub task: Option<String>,
    pub data: Value,
}

/// An `error` message.
///
/// The worker sends either a bare string or an object carrying `task` and a
/// `message`/`error` field. Only the object form can be correlated to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub task: Option<String>,
    pub message: String,
    pub data: Value,
}

/// Payload of `install_needed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub package: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub task: String,
    #[serde(default)]
    pub is_temp: bool,
}

/// A decoded worker message.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// The worker can accept commands.
    Ready,
    Progress(Progress),
    Status(String),
    Log(String),
    Complete(Completion),
    Error(WorkerFailure),
    /// The worker is missing a runtime dependency.
    InstallNeeded(InstallRequest),
    /// Any other `type` (fallback).
    Unknown(Frame),
}

impl WorkerMessage {
    /// Decode one line into a message.
    pub fn decode(line: &[u8]) -> Result<Self, FramingError> {
        Self::try_from(Frame::parse(line)?)
    }

    /// The wire `type` of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::Progress(_) => "progress",
            Self::Status(_) => "status",
            Self::Log(_) => "log",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
            Self::InstallNeeded(_) => "install_needed",
            Self::Unknown(frame) => &frame.kind,
        }
    }

    /// The task this message refers to, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::Progress(p) => p.task.as_deref(),
            Self::Complete(c) => c.task.as_deref(),
            Self::Error(e) => e.task.as_deref(),
            Self::InstallNeeded(r) => Some(&r.task),
            Self::Ready | Self::Status(_) | Self::Log(_) | Self::Unknown(_) => None,
        }
    }

    /// Convert back into a wire envelope.
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Ready => Frame::new("ready", Value::Null),
            Self::Progress(p) => Frame::new("progress", serde_json::to_value(p).unwrap_or_default()),
            Self::Status(text) => Frame::new("status", Value::String(text.clone())),
            Self::Log(text) => Frame::new("log", Value::String(text.clone())),
            Self::Complete(c) => Frame::new("complete", c.data.clone()),
            Self::Error(e) => Frame::new("error", e.data.clone()),
            Self::InstallNeeded(r) => {
                Frame::new("install_needed", serde_json::to_value(r).unwrap_or_default())
            }
            Self::Unknown(frame) => frame.clone(),
        }
    }
}

impl TryFrom<Frame> for WorkerMessage {
    type Error = FramingError;

    fn try_from(frame: Frame) -> Result<Self, FramingError> {
        let message = match frame.kind.as_str() {
            "ready" => Self::Ready,
            "progress" => Self::Progress(frame.decode()?),
            "status" => Self::Status(text_of(&frame.data)),
            "log" => Self::Log(text_of(&frame.data)),
            "complete" => Self::Complete(Completion {
                task: frame.task(),
                data: frame.data,
            }),
            "error" => {
                let message = match &frame.data {
                    Value::String(s) => s.clone(),
                    data => data
                        .get("message")
                        .or_else(|| data.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .unwrap_or_else(|| data.to_string()),
                };
                Self::Error(WorkerFailure {
                    task: frame.task(),
                    message,
                    data: frame.data,
                })
            }
            "install_needed" => Self::InstallNeeded(frame.decode()?),
            _ => Self::Unknown(frame),
        };
        Ok(message)
    }
}

/// Text carried by `status`/`log`: a bare string or `{"message": ...}`.
fn text_of(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| other.to_string()),
    }
}
