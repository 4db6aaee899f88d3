use tracing::{info, warn};

use crate::app::adb::executor::CommandExecutor;
use crate::app::config::is_valid_package_name;
use crate::app::error::AppError;
use crate::app::models::{CommandRequest, RestoreOutcome};
use crate::app::state::SessionState;

/// Reverses the account removal performed before provisioning.
pub trait AccountRestorer {
    fn restore_accounts(
        &self,
        session: &mut SessionState,
        executor: &CommandExecutor<'_>,
    ) -> Result<RestoreOutcome, AppError>;
}

/// Re-enables every package recorded as disabled, in recorded order.
///
/// The persisted list is cleared only when all of them came back.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageRestorer;

impl AccountRestorer for PackageRestorer {
    fn restore_accounts(
        &self,
        session: &mut SessionState,
        executor: &CommandExecutor<'_>,
    ) -> Result<RestoreOutcome, AppError> {
        let trace_id = executor.trace_id();
        if !session.is_connected() {
            return Err(AppError::not_connected(trace_id));
        }

        let packages = session.disabled_packages().to_vec();
        let mut outcome = RestoreOutcome {
            restored: Vec::new(),
            failed: Vec::new(),
        };
        for package in packages {
            if !is_valid_package_name(&package) {
                warn!(trace_id = %trace_id, package = %package, "skipping invalid package name");
                outcome.failed.push(package);
                continue;
            }
            let request = CommandRequest::new(
                format!("pm enable {package}"),
                format!("Re-enabling {package}"),
            );
            match executor.run(session, &request) {
                Ok(_) => outcome.restored.push(package),
                Err(err) => {
                    warn!(trace_id = %trace_id, package = %package, error = %err, "re-enable failed");
                    outcome.failed.push(package);
                }
            }
        }

        if !outcome.failed.is_empty() {
            return Err(AppError::generic_command(
                format!("Failed to re-enable: {}", outcome.failed.join(", ")),
                trace_id,
            ));
        }
        session.clear_disabled_packages(trace_id)?;
        info!(trace_id = %trace_id, count = outcome.restored.len(), "accounts restored");
        Ok(outcome)
    }
}
