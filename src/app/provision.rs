use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::app::accounts::AccountRestorer;
use crate::app::adb::apk::ArtifactSource;
use crate::app::adb::executor::CommandExecutor;
use crate::app::adb::parse::owner_conflict;
use crate::app::adb::paths::quote_device_path;
use crate::app::config::ProvisionSettings;
use crate::app::error::AppError;
use crate::app::events::{emit_log, emit_progress, ProvisionObserver};
use crate::app::models::{
    ApkArtifact, CommandRequest, LogLevel, ProvisionEvent, ProvisionReport, RollbackReport,
    WorkflowState,
};
use crate::app::state::SessionState;

const STAGED_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OwnerPrecheck,
    ObtainArtifact,
    Transfer,
    Install,
    Elevate,
    GrantPermission,
    Launch,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::OwnerPrecheck,
        Step::ObtainArtifact,
        Step::Transfer,
        Step::Install,
        Step::Elevate,
        Step::GrantPermission,
        Step::Launch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::OwnerPrecheck => "owner_precheck",
            Step::ObtainArtifact => "obtain_artifact",
            Step::Transfer => "transfer",
            Step::Install => "install",
            Step::Elevate => "elevate",
            Step::GrantPermission => "grant_permission",
            Step::Launch => "launch",
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            Step::OwnerPrecheck | Step::ObtainArtifact | Step::GrantPermission => 0.0,
            Step::Transfer => 0.3,
            Step::Install => 0.2,
            Step::Elevate => 0.3,
            Step::Launch => 0.2,
        }
    }
}

/// One provisioning run; `run` consumes it.
pub struct ProvisioningWorkflow<'a> {
    settings: &'a ProvisionSettings,
    observer: &'a dyn ProvisionObserver,
    restorer: &'a dyn AccountRestorer,
    trace_id: String,
    state: WorkflowState,
    progress: f64,
    reported: f64,
    completed: Vec<Step>,
}

impl<'a> ProvisioningWorkflow<'a> {
    pub fn new(
        settings: &'a ProvisionSettings,
        observer: &'a dyn ProvisionObserver,
        restorer: &'a dyn AccountRestorer,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            observer,
            restorer,
            trace_id: trace_id.into(),
            state: WorkflowState::Idle,
            progress: 0.0,
            reported: 0.0,
            completed: Vec::new(),
        }
    }

    pub fn run(mut self, session: &mut SessionState, source: &mut ArtifactSource) -> ProvisionReport {
        let started_at = Utc::now().to_rfc3339();
        self.state = WorkflowState::Running;
        info!(trace_id = %self.trace_id, package = %self.settings.target_package, "provisioning started");
        let executor = CommandExecutor::new(self.observer, self.trace_id.clone());

        let result = if session.is_connected() {
            if !session.accounts_clean() {
                emit_log(
                    self.observer,
                    "Accounts were not confirmed as removed; setting the device owner may fail.",
                    LogLevel::Warn,
                );
            }
            self.run_steps(session, source, &executor)
        } else {
            // No step ran, so none is named as failed.
            Err((None, AppError::not_connected(&self.trace_id)))
        };

        let (failed_step, failure, rollback) = match result {
            Ok(()) => {
                self.state = WorkflowState::Completed;
                let rollback = if self.settings.restore_accounts_on_success {
                    self.rollback(session, &executor)
                } else {
                    RollbackReport::skipped()
                };
                let message = format!("Provisioning of {} completed", self.settings.target_package);
                info!(trace_id = %self.trace_id, "{message}");
                self.observer.emit(ProvisionEvent::Finished {
                    success: true,
                    message,
                });
                (None, None, rollback)
            }
            Err((step, err)) => {
                self.state = WorkflowState::Failed;
                let step = step.map(Step::name);
                error!(trace_id = %self.trace_id, step = step.unwrap_or("none"), error = %err, "provisioning failed");
                // Without a connection nothing on the device changed in this run.
                let rollback = if session.is_connected() {
                    self.rollback(session, &executor)
                } else {
                    RollbackReport::skipped()
                };
                self.observer.emit(ProvisionEvent::Finished {
                    success: false,
                    message: err.error.clone(),
                });
                (step.map(str::to_string), Some(err), rollback)
            }
        };

        ProvisionReport {
            trace_id: self.trace_id,
            state: self.state,
            progress: self.progress,
            completed_steps: self.completed.iter().map(|step| step.name().to_string()).collect(),
            failed_step,
            failure,
            rollback,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        }
    }

    fn run_steps(
        &mut self,
        session: &mut SessionState,
        source: &mut ArtifactSource,
        executor: &CommandExecutor<'_>,
    ) -> Result<(), (Option<Step>, AppError)> {
        let mut artifact = None;
        for step in Step::ALL {
            debug!(trace_id = %self.trace_id, step = step.name(), "step started");
            self.execute_step(step, session, source, executor, &mut artifact)
                .map_err(|err| (Some(step), err))?;
            self.complete(step);
        }
        Ok(())
    }

    fn execute_step(
        &mut self,
        step: Step,
        session: &mut SessionState,
        source: &mut ArtifactSource,
        executor: &CommandExecutor<'_>,
        artifact: &mut Option<Arc<ApkArtifact>>,
    ) -> Result<(), AppError> {
        let settings = self.settings;
        match step {
            Step::OwnerPrecheck => {
                let output = executor.run(
                    session,
                    &CommandRequest::new("dpm get-device-owner", "Checking current device owner"),
                )?;
                if let Some(owner) = owner_conflict(&output, &settings.target_package) {
                    return Err(AppError::conflict(
                        format!("Device owner is already set to {owner}. Factory reset the device first."),
                        &self.trace_id,
                    ));
                }
            }
            Step::ObtainArtifact => {
                let obtained = source.obtain(&self.trace_id)?;
                emit_log(
                    self.observer,
                    format!("Using {} ({} bytes)", obtained.name, obtained.len()),
                    LogLevel::Info,
                );
                session.set_apk_downloaded(source.has_downloaded());
                *artifact = Some(obtained);
            }
            Step::Transfer => {
                let artifact = artifact
                    .as_deref()
                    .ok_or_else(|| AppError::artifact_missing("No package to transfer", &self.trace_id))?;
                self.transfer(session, artifact)?;
                settle(settings.push_settle_ms);
            }
            Step::Install => {
                let command = format!("pm install -r -g {}", quote_device_path(&settings.staging_path));
                executor.run(session, &CommandRequest::new(command, "Installing package"))?;
                settle(settings.install_settle_ms);
            }
            Step::Elevate => {
                let command = format!("dpm set-device-owner {}", settings.admin_component());
                executor.run(session, &CommandRequest::new(command, "Setting device owner"))?;
            }
            Step::GrantPermission => {
                let command = format!(
                    "pm grant {} {}",
                    settings.target_package, settings.grant_permission
                );
                executor.run(session, &CommandRequest::new(command, "Granting permission"))?;
            }
            Step::Launch => {
                let command = format!("am start -n {}", settings.launch_component());
                executor.run(session, &CommandRequest::new(command, "Launching app"))?;
            }
        }
        Ok(())
    }

    fn transfer(&mut self, session: &mut SessionState, artifact: &ApkArtifact) -> Result<(), AppError> {
        let connection = session
            .connection_mut()
            .ok_or_else(|| AppError::not_connected(&self.trace_id))?;
        emit_log(
            self.observer,
            format!("> Pushing {} to {}...", artifact.name, self.settings.staging_path),
            LogLevel::Info,
        );

        let observer = self.observer;
        let base = self.progress;
        let band = Step::Transfer.weight();
        let mut reported = self.reported;
        let mut on_progress = |sent: u64, total: u64| {
            let fraction = if total == 0 {
                1.0
            } else {
                (sent as f64 / total as f64).min(1.0)
            };
            let value = base + band * fraction;
            if value > reported {
                reported = value;
                emit_progress(observer, Step::Transfer.name(), value);
            }
        };

        let mut sync = connection.sync()?;
        let pushed = sync.push(artifact, &self.settings.staging_path, STAGED_MODE, &mut on_progress);
        if let Err(err) = sync.quit() {
            warn!(trace_id = %self.trace_id, error = %err, "sync session did not close cleanly");
        }
        self.reported = reported;

        match pushed {
            Ok(()) => {
                emit_log(self.observer, "Package transferred", LogLevel::Success);
                Ok(())
            }
            Err(err) => {
                emit_log(
                    self.observer,
                    format!("Transfer failed: {}", err.error),
                    LogLevel::Error,
                );
                Err(err)
            }
        }
    }

    fn complete(&mut self, step: Step) {
        self.completed.push(step);
        self.progress += step.weight();
        if self.progress > self.reported {
            self.reported = self.progress;
            emit_progress(self.observer, step.name(), self.progress);
        }
    }

    /// Runs the restore collaborator at most once; its failure never replaces the run's own outcome.
    fn rollback(&self, session: &mut SessionState, executor: &CommandExecutor<'_>) -> RollbackReport {
        if session.disabled_packages().is_empty() {
            return RollbackReport::skipped();
        }
        emit_log(self.observer, "Restoring disabled accounts...", LogLevel::Info);
        match self.restorer.restore_accounts(session, executor) {
            Ok(outcome) => {
                emit_log(self.observer, "Accounts restored", LogLevel::Success);
                RollbackReport {
                    attempted: true,
                    outcome: Some(outcome),
                    error: None,
                }
            }
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "account restore failed");
                emit_log(
                    self.observer,
                    format!("Account restore failed: {}", err.error),
                    LogLevel::Error,
                );
                RollbackReport {
                    attempted: true,
                    outcome: None,
                    error: Some(err),
                }
            }
        }
    }
}

fn settle(millis: u64) {
    if millis > 0 {
        thread::sleep(Duration::from_millis(millis));
    }
}
