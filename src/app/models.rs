use serde::{Deserialize, Serialize};

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub model: String,
    pub sdk_version: Option<u32>,
    pub root_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub text: String,
    pub description: String,
    pub silent: bool,
}

impl CommandRequest {
    pub fn new(text: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            description: description.into(),
            silent: false,
        }
    }

    pub fn silent(text: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            silent: true,
            ..Self::new(text, description)
        }
    }
}

/// Installable package bytes, either downloaded earlier or read from the local fallback.
#[derive(Clone, PartialEq, Eq)]
pub struct ApkArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ApkArtifact {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for ApkArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApkArtifact")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionEvent {
    Progress { stage: String, fraction: f64 },
    Log { text: String, level: LogLevel },
    Finished { success: bool, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RestoreOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl RollbackReport {
    pub fn skipped() -> Self {
        Self {
            attempted: false,
            outcome: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub trace_id: String,
    pub state: WorkflowState,
    pub progress: f64,
    pub completed_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AppError>,
    pub rollback: RollbackReport,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}
