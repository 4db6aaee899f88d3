use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::DeviceSummary;

pub const GENERIC_MODEL: &str = "Generic Android";

/// Superuser binaries whose presence marks a rooted device.
pub const SU_PATHS: [&str; 3] = ["/system/bin/su", "/system/xbin/su", "/sbin/su"];

pub const ROOT_MARKER: &str = "ROOT_FOUND";

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*'))
        .filter(|line| !line.to_lowercase().starts_with("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_string();
            let state = tokens.next()?.to_string();
            let mut summary = DeviceSummary {
                serial,
                state,
                model: None,
                product: None,
                device: None,
                transport_id: None,
            };
            for token in tokens {
                let Some((key, value)) = token.split_once(':') else {
                    continue;
                };
                let slot = match key {
                    "model" => &mut summary.model,
                    "product" => &mut summary.product,
                    "device" => &mut summary.device,
                    "transport_id" => &mut summary.transport_id,
                    _ => continue,
                };
                *slot = Some(value.to_string());
            }
            Some(summary)
        })
        .collect()
}

/// Picks the requested serial, or the only online device when none was requested.
pub fn pick_online_serial(devices: &[DeviceSummary], preferred: Option<&str>) -> Result<String, String> {
    if let Some(serial) = preferred.map(str::trim).filter(|s| !s.is_empty()) {
        return match devices.iter().find(|d| d.serial == serial) {
            Some(device) if device.state == "device" => Ok(device.serial.clone()),
            Some(device) => Err(format!("device {serial} is {}", device.state)),
            None => Err(format!("device '{serial}' not found")),
        };
    }

    let online: Vec<&DeviceSummary> = devices.iter().filter(|d| d.state == "device").collect();
    match online.as_slice() {
        [] => {
            if devices.iter().any(|d| d.state == "unauthorized") {
                Err("device unauthorized".to_string())
            } else {
                Err("No online adb devices found.".to_string())
            }
        }
        [only] => Ok(only.serial.clone()),
        many => {
            let serials = many
                .iter()
                .map(|d| d.serial.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(format!(
                "Multiple online devices found ({serials}). Set ANDROID_SERIAL or pass --serial."
            ))
        }
    }
}

pub fn parse_model(output: &str) -> String {
    let model = output.replace("ro.product.model:", "");
    let model = model.trim();
    if model.is_empty() {
        GENERIC_MODEL.to_string()
    } else {
        model.to_string()
    }
}

pub fn parse_sdk_version(output: &str) -> Option<u32> {
    let digits: String = output
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn root_probe_command() -> String {
    SU_PATHS
        .iter()
        .map(|path| format!("test -e {path} && echo {ROOT_MARKER}"))
        .collect::<Vec<_>>()
        .join(" || ")
}

pub fn is_root_detected(output: &str) -> bool {
    output.contains(ROOT_MARKER)
}

fn component_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"ComponentInfo\{([A-Za-z0-9_.]+)/[^}]*\}").expect("valid component regex")
    })
}

/// Package of the current device owner as printed by `dpm get-device-owner`.
pub fn parse_device_owner(output: &str) -> Option<String> {
    component_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Returns the conflicting owner when the device is already owned by another package.
pub fn owner_conflict(output: &str, target_package: &str) -> Option<String> {
    if !output.contains("ComponentInfo") {
        return None;
    }
    match parse_device_owner(output) {
        Some(owner) if owner == target_package => None,
        Some(owner) => Some(owner),
        None if output.contains(target_package) => None,
        None => Some(output.trim().to_string()),
    }
}
