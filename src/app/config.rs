use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::adb::paths::validate_device_path;
use crate::app::error::AppError;

const MAX_SETTLE_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub serial: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionSettings {
    pub target_package: String,
    pub device_admin: String,
    pub main_activity: String,
    pub grant_permission: String,
    pub staging_path: String,
    pub local_apk_path: String,
    pub apk_url: String,
    pub sdk_warning_level: u32,
    pub push_settle_ms: u64,
    pub install_settle_ms: u64,
    pub transfer_timeout_secs: u64,
    pub restore_accounts_on_success: bool,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            target_package: "com.secureguard.mdm".to_string(),
            device_admin: ".SecureGuardDeviceAdminReceiver".to_string(),
            main_activity: ".MainActivity".to_string(),
            grant_permission: "android.permission.WRITE_SECURE_SETTINGS".to_string(),
            staging_path: "/data/local/tmp/app.apk".to_string(),
            local_apk_path: "apk/normal.apk".to_string(),
            apk_url: String::new(),
            sdk_warning_level: 34,
            push_settle_ms: 1000,
            install_settle_ms: 2000,
            transfer_timeout_secs: 180,
            restore_accounts_on_success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub state_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub provision: ProvisionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            provision: ProvisionSettings::default(),
            logging: LoggingSettings::default(),
            storage: StorageSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ProvisionSettings {
    pub fn admin_component(&self) -> String {
        format!("{}/{}", self.target_package, self.device_admin)
    }

    pub fn launch_component(&self) -> String {
        format!("{}/{}", self.target_package, self.main_activity)
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVICE_OWNER_PROVISIONER_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home_dir().join(".device_owner_provisioner.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

/// Where the session store lives when `storage.state_path` is not set.
pub fn default_state_path() -> PathBuf {
    home_dir().join(".device_owner_provisioner_state.json")
}

pub fn resolve_state_path(config: &AppConfig) -> PathBuf {
    let configured = config.storage.state_path.trim();
    if configured.is_empty() {
        default_state_path()
    } else {
        PathBuf::from(configured)
    }
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_value(value).unwrap_or_default();
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

pub fn is_valid_package_name(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed != value {
        return false;
    }
    // Dot separated segments of alnum/underscore, at least two of them.
    let mut count = 0usize;
    for part in trimmed.split('.') {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        count += 1;
    }
    count >= 2
}

fn is_valid_component_suffix(value: &str) -> bool {
    let name = value.strip_prefix('.').unwrap_or(value);
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$'))
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = ProvisionSettings::default();
    let provision = &mut config.provision;
    if !is_valid_package_name(&provision.target_package) {
        provision.target_package = defaults.target_package;
    }
    if !is_valid_component_suffix(&provision.device_admin) {
        provision.device_admin = defaults.device_admin;
    }
    if !is_valid_component_suffix(&provision.main_activity) {
        provision.main_activity = defaults.main_activity;
    }
    if !is_valid_component_suffix(&provision.grant_permission) {
        provision.grant_permission = defaults.grant_permission;
    }
    if validate_device_path(&provision.staging_path).is_err() {
        provision.staging_path = defaults.staging_path;
    }
    if provision.local_apk_path.trim().is_empty() {
        provision.local_apk_path = defaults.local_apk_path;
    }
    let url = provision.apk_url.trim();
    if !url.is_empty() && !(url.starts_with("https://") || url.starts_with("http://")) {
        provision.apk_url = String::new();
    }
    if provision.sdk_warning_level == 0 {
        provision.sdk_warning_level = defaults.sdk_warning_level;
    }
    if provision.push_settle_ms > MAX_SETTLE_MS {
        provision.push_settle_ms = defaults.push_settle_ms;
    }
    if provision.install_settle_ms > MAX_SETTLE_MS {
        provision.install_settle_ms = defaults.install_settle_ms;
    }
    if provision.transfer_timeout_secs == 0 {
        provision.transfer_timeout_secs = defaults.transfer_timeout_secs;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = LoggingSettings::default().log_level;
    }
    config
}
