use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::accounts::{AccountRestorer, PackageRestorer};
use crate::app::adb::apk::ArtifactSource;
use crate::app::adb::download::download_apk;
use crate::app::adb::executor::CommandExecutor;
use crate::app::adb::process::AdbProcessTransport;
use crate::app::config::{
    backup_config_path, config_path, load_config_from_path, resolve_state_path,
    save_config_to_path, AppConfig,
};
use crate::app::error::AppError;
use crate::app::events::{
    emit_log, FanoutObserver, ProvisionObserver, SharedObserver, TracingObserver,
};
use crate::app::logging::init_logging;
use crate::app::models::{
    CommandResponse, DeviceIdentity, LogLevel, ProvisionEvent, RestoreOutcome, WorkflowState,
};
use crate::app::provision::ProvisioningWorkflow;
use crate::app::state::SessionState;
use crate::app::storage::JsonFileStore;

const USAGE: &str = "Usage: device_owner_provisioner <probe|provision|restore|init-config> [--serial SERIAL] [--apk PATH] [--apk-url URL] [--config PATH] [--accounts-clean] [--trace-id ID] [--json]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliCommand {
    Probe,
    Provision,
    Restore,
    InitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub command: CliCommand,
    pub serial: Option<String>,
    pub apk_path: Option<String>,
    pub apk_url: Option<String>,
    pub config_path: Option<PathBuf>,
    pub json: bool,
    pub accounts_clean: bool,
    pub trace_id: Option<String>,
}

pub fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut command = None;
    let mut serial = None;
    let mut apk_path = None;
    let mut apk_url = None;
    let mut config_path = None;
    let mut json = false;
    let mut accounts_clean = false;
    let mut trace_id = None;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--apk" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--apk requires a value".to_string())?;
                apk_path = Some(value);
            }
            "--apk-url" => {
                apk_url = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if apk_url.is_none() {
                    return Err("--apk-url requires a value".to_string());
                }
            }
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--trace-id" => {
                trace_id = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if trace_id.is_none() {
                    return Err("--trace-id requires a value".to_string());
                }
            }
            "--json" => {
                json = true;
            }
            "--accounts-clean" => {
                accounts_clean = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            "probe" | "provision" | "restore" | "init-config" if command.is_none() => {
                command = Some(match arg.as_str() {
                    "probe" => CliCommand::Probe,
                    "provision" => CliCommand::Provision,
                    "restore" => CliCommand::Restore,
                    _ => CliCommand::InitConfig,
                });
            }
            other => return Err(format!("Unknown arg: {other}\n{USAGE}")),
        }
    }

    let command = command.ok_or_else(|| USAGE.to_string())?;
    Ok(CliArgs {
        command,
        serial,
        apk_path,
        apk_url,
        config_path,
        json,
        accounts_clean,
        trace_id,
    })
}

/// Human-readable progress on stderr, keeping stdout free for `--json` output.
struct ConsoleObserver;

impl ProvisionObserver for ConsoleObserver {
    fn emit(&self, event: ProvisionEvent) {
        match event {
            ProvisionEvent::Progress { stage, fraction } => {
                eprintln!("[{:>3}%] {stage}", (fraction * 100.0).round() as u32);
            }
            ProvisionEvent::Log { text, level } => {
                let tag = match level {
                    LogLevel::Info => "info",
                    LogLevel::Success => " ok ",
                    LogLevel::Warn => "warn",
                    LogLevel::Error => "FAIL",
                };
                eprintln!("[{tag}] {text}");
            }
            ProvisionEvent::Finished { success, message } => {
                let tag = if success { "DONE" } else { "FAIL" };
                eprintln!("[{tag}] {message}");
            }
        }
    }
}

#[derive(Serialize)]
struct ProbeSummary {
    identity: DeviceIdentity,
    disabled_packages: Vec<String>,
}

#[derive(Serialize)]
struct InitSummary {
    path: String,
}

fn print_json<T: Serialize>(trace_id: &str, data: T) {
    let response = CommandResponse {
        trace_id: trace_id.to_string(),
        data,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&response).unwrap_or_default()
    );
}

fn load_cli_config(args: &CliArgs, trace_id: &str) -> Result<(AppConfig, PathBuf), AppError> {
    let path = args.config_path.clone().unwrap_or_else(config_path);
    let config = load_config_from_path(&path, trace_id)?;
    Ok((config, path))
}

/// Entry point for the binary; returns the process exit code.
pub fn run_cli() -> i32 {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return 2;
        }
    };
    let trace_id = args
        .trace_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (config, path) = match load_cli_config(&args, &trace_id) {
        Ok(loaded) => loaded,
        Err(err) => {
            init_logging("info");
            error!(trace_id = %trace_id, error = %err, "failed to load config");
            report_error(&args, &err);
            return 1;
        }
    };
    init_logging(&config.logging.log_level);

    match execute(&args, config, &path, &trace_id) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            error!(trace_id = %trace_id, error = %err, "command failed");
            report_error(&args, &err);
            1
        }
    }
}

fn report_error(args: &CliArgs, err: &AppError) {
    if args.json {
        println!("{}", serde_json::to_string_pretty(err).unwrap_or_default());
    } else {
        eprintln!("{err}");
    }
}

/// A failed download is not fatal: the run continues with the local package.
fn fetch_release(
    source: ArtifactSource,
    url: &str,
    config: &AppConfig,
    observer: &dyn ProvisionObserver,
    trace_id: &str,
) -> ArtifactSource {
    let timeout = Duration::from_secs(config.provision.transfer_timeout_secs);
    match download_apk(url, timeout, observer, trace_id) {
        Ok(artifact) => source.with_downloaded(artifact),
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "download failed, using local apk");
            emit_log(
                observer,
                format!(
                    "Download failed ({}); using local APK {}",
                    err.error,
                    source.local_path().display()
                ),
                LogLevel::Warn,
            );
            source
        }
    }
}

fn execute(
    args: &CliArgs,
    config: AppConfig,
    path: &Path,
    trace_id: &str,
) -> Result<bool, AppError> {
    if args.command == CliCommand::InitConfig {
        save_config_to_path(&config, path, &backup_config_path(path), trace_id)?;
        info!(trace_id = %trace_id, path = %path.display(), "config written");
        if args.json {
            print_json(
                trace_id,
                InitSummary {
                    path: path.to_string_lossy().to_string(),
                },
            );
        } else {
            eprintln!("Config written to {}", path.display());
        }
        return Ok(true);
    }

    let serial = args
        .serial
        .clone()
        .or_else(|| std::env::var("ANDROID_SERIAL").ok());
    let transport = AdbProcessTransport::from_settings(
        &config.adb,
        Duration::from_secs(config.provision.transfer_timeout_secs),
        trace_id,
    )?
    .with_serial(serial);

    let observer = FanoutObserver::new(vec![
        Arc::new(ConsoleObserver) as SharedObserver,
        Arc::new(TracingObserver::new(trace_id)) as SharedObserver,
    ]);
    let executor = CommandExecutor::new(&observer, trace_id);
    let store = JsonFileStore::new(resolve_state_path(&config), trace_id);
    let mut session = SessionState::new(Box::new(store));

    let identity = session.connect(&transport, &executor, config.provision.sdk_warning_level)?;
    info!(
        trace_id = %trace_id,
        serial = %identity.serial,
        model = %identity.model,
        "session ready"
    );

    let result = match args.command {
        CliCommand::Probe => {
            let summary = ProbeSummary {
                identity,
                disabled_packages: session.disabled_packages().to_vec(),
            };
            if args.json {
                print_json(trace_id, summary);
            } else {
                eprintln!(
                    "{} ({}) sdk={} root={} disabled_packages={}",
                    summary.identity.model,
                    summary.identity.serial,
                    summary
                        .identity
                        .sdk_version
                        .map(|sdk| sdk.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    summary.identity.root_detected,
                    summary.disabled_packages.len()
                );
            }
            Ok(true)
        }
        CliCommand::Provision => {
            session.set_accounts_clean(args.accounts_clean);
            let apk_path = args
                .apk_path
                .clone()
                .unwrap_or_else(|| config.provision.local_apk_path.clone());
            let mut source = ArtifactSource::new(apk_path);
            let apk_url = args
                .apk_url
                .clone()
                .unwrap_or_else(|| config.provision.apk_url.clone());
            if !apk_url.trim().is_empty() {
                source = fetch_release(source, &apk_url, &config, &observer, trace_id);
            }
            let restorer = PackageRestorer;
            let report = ProvisioningWorkflow::new(&config.provision, &observer, &restorer, trace_id)
                .run(&mut session, &mut source);
            if args.json {
                print_json(trace_id, &report);
            }
            Ok(report.state == WorkflowState::Completed)
        }
        CliCommand::Restore => {
            let outcome: Result<RestoreOutcome, AppError> =
                PackageRestorer.restore_accounts(&mut session, &executor);
            outcome.map(|outcome| {
                if args.json {
                    print_json(trace_id, &outcome);
                } else {
                    eprintln!("Restored {} package(s)", outcome.restored.len());
                }
                true
            })
        }
        CliCommand::InitConfig => Ok(true),
    };

    session.disconnect();
    result
}
