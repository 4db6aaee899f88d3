use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ErrorKind {
    NotConnected,
    TransportFault,
    KnownCommand,
    GenericCommand,
    Conflict,
    ArtifactMissing,
    Transfer,
    Validation,
    System,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotConnected => "ERR_NOT_CONNECTED",
            ErrorKind::TransportFault => "ERR_TRANSPORT",
            ErrorKind::KnownCommand => "ERR_KNOWN_COMMAND",
            ErrorKind::GenericCommand => "ERR_GENERIC_COMMAND",
            ErrorKind::Conflict => "ERR_CONFLICT",
            ErrorKind::ArtifactMissing => "ERR_ARTIFACT_MISSING",
            ErrorKind::Transfer => "ERR_TRANSFER",
            ErrorKind::Validation => "ERR_VALIDATION",
            ErrorKind::System => "ERR_SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip)]
    pub kind: ErrorKind,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: kind.code().to_string(),
            trace_id: trace_id.into(),
            pattern: None,
            kind,
        }
    }

    pub fn not_connected(trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, "ADB not connected", trace_id)
    }

    pub fn transport(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportFault, message, trace_id)
    }

    /// A response matched an entry of the error table; `message` is already user-facing.
    pub fn known_command(
        message: impl Into<String>,
        pattern: &str,
        trace_id: impl Into<String>,
    ) -> Self {
        let mut err = Self::new(ErrorKind::KnownCommand, message, trace_id);
        err.pattern = Some(pattern.to_string());
        err
    }

    pub fn generic_command(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::GenericCommand, message, trace_id)
    }

    pub fn conflict(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message, trace_id)
    }

    pub fn artifact_missing(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::ArtifactMissing, message, trace_id)
    }

    pub fn transfer(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transfer, message, trace_id)
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message, trace_id)
    }

    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        if self.trace_id.is_empty() {
            self.trace_id = trace_id.to_string();
        }
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
