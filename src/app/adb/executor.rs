use tracing::{debug, warn};

use crate::app::adb::classify::{classify_response, CommandOutcome, FailureKind};
use crate::app::adb::frame::{read_all, StreamEnd};
use crate::app::adb::transport::Connection;
use crate::app::error::AppError;
use crate::app::events::{emit_log, ProvisionObserver};
use crate::app::models::{CommandRequest, LogLevel};
use crate::app::state::SessionState;

/// Runs one shell command at a time: open, decode, classify.
pub struct CommandExecutor<'a> {
    observer: &'a dyn ProvisionObserver,
    trace_id: String,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(observer: &'a dyn ProvisionObserver, trace_id: impl Into<String>) -> Self {
        Self {
            observer,
            trace_id: trace_id.into(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn observer(&self) -> &'a dyn ProvisionObserver {
        self.observer
    }

    /// Fails with `NotConnected` before touching the transport when the session has no connection.
    pub fn run(&self, session: &mut SessionState, request: &CommandRequest) -> Result<String, AppError> {
        let connection = session
            .connection_mut()
            .ok_or_else(|| AppError::not_connected(&self.trace_id))?;
        self.run_on(connection, request)
    }

    pub fn run_on(
        &self,
        connection: &mut dyn Connection,
        request: &CommandRequest,
    ) -> Result<String, AppError> {
        if !request.silent {
            emit_log(self.observer, format!("> {}...", request.description), LogLevel::Info);
        }
        debug!(trace_id = %self.trace_id, serial = %connection.serial(), command = %request.text, "shell");

        let result = self.execute(connection, request);
        if !request.silent {
            match &result {
                Ok(_) => emit_log(
                    self.observer,
                    format!("{}: done", request.description),
                    LogLevel::Success,
                ),
                Err(err) => emit_log(
                    self.observer,
                    format!("{}: {}", request.description, err.error),
                    LogLevel::Error,
                ),
            }
        }
        result
    }

    fn execute(&self, connection: &mut dyn Connection, request: &CommandRequest) -> Result<String, AppError> {
        let output = {
            let mut stream = connection.shell(&request.text)?;
            read_all(stream.as_mut(), &self.trace_id)
        };
        if let StreamEnd::Truncated(err) = &output.end {
            warn!(
                trace_id = %self.trace_id,
                command = %request.text,
                error = %err,
                "command output truncated"
            );
            if !request.silent {
                emit_log(
                    self.observer,
                    format!("{}: output truncated ({})", request.description, err.error),
                    LogLevel::Warn,
                );
            }
        }

        match classify_response(&output.text) {
            CommandOutcome::Success(text) => Ok(text),
            CommandOutcome::Failure {
                kind: FailureKind::Known,
                message,
                pattern,
            } => Err(AppError::known_command(
                message,
                pattern.unwrap_or_default(),
                &self.trace_id,
            )),
            CommandOutcome::Failure {
                kind: FailureKind::Generic,
                message,
                ..
            } => Err(AppError::generic_command(message, &self.trace_id)),
        }
    }
}
