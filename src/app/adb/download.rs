use std::io::{ErrorKind as IoErrorKind, Read};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Url;
use tracing::{info, warn};

use crate::app::adb::apk::artifact_from_bytes;
use crate::app::error::AppError;
use crate::app::events::{emit_log, emit_progress, ProvisionObserver};
use crate::app::models::{ApkArtifact, LogLevel};

pub const DOWNLOAD_STAGE: &str = "download";

const CHUNK_SIZE: usize = 64 * 1024;
const MAX_PREALLOC: u64 = 256 * 1024 * 1024;
const FALLBACK_NAME: &str = "download.apk";

fn artifact_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// Drains `reader` into memory, reporting whole-percent steps when the length is known.
fn read_with_progress<R: Read>(
    mut reader: R,
    total: Option<u64>,
    observer: &dyn ProvisionObserver,
    trace_id: &str,
) -> Result<Vec<u8>, AppError> {
    let total = total.filter(|total| *total > 0);
    let mut bytes = Vec::with_capacity(total.unwrap_or(0).min(MAX_PREALLOC) as usize);
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut last_percent = None;
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(AppError::transfer(
                    format!("Download interrupted: {err}"),
                    trace_id,
                ))
            }
        };
        bytes.extend_from_slice(&chunk[..read]);
        if let Some(total) = total {
            let percent = (bytes.len() as u64 * 100 / total).min(100);
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                emit_progress(observer, DOWNLOAD_STAGE, percent as f64 / 100.0);
            }
        }
    }
    Ok(bytes)
}

/// Fetches a release package into memory. The result still has to pass APK validation.
pub fn download_apk(
    url: &str,
    timeout: Duration,
    observer: &dyn ProvisionObserver,
    trace_id: &str,
) -> Result<ApkArtifact, AppError> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AppError::system(format!("Failed to build HTTP client: {err}"), trace_id))?;
    download_with(&client, url, observer, trace_id)
}

fn download_with(
    client: &Client,
    url: &str,
    observer: &dyn ProvisionObserver,
    trace_id: &str,
) -> Result<ApkArtifact, AppError> {
    let url = Url::parse(url.trim())
        .map_err(|err| AppError::validation(format!("Invalid download URL: {err}"), trace_id))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::validation(
            format!("Unsupported download scheme: {}", url.scheme()),
            trace_id,
        ));
    }

    info!(trace_id = %trace_id, url = %url, "downloading apk");
    emit_log(observer, format!("> Downloading {url}..."), LogLevel::Info);
    let response = client
        .get(url.clone())
        .send()
        .map_err(|err| AppError::transfer(format!("Download failed: {err}"), trace_id))?;
    if !response.status().is_success() {
        return Err(AppError::transfer(
            format!("Download failed with status: {}", response.status()),
            trace_id,
        ));
    }

    let total = response.content_length();
    let bytes = read_with_progress(response, total, observer, trace_id)?;
    if let Some(expected) = total {
        if bytes.len() as u64 != expected {
            warn!(trace_id = %trace_id, expected, received = bytes.len(), "download length mismatch");
        }
    }
    let artifact = artifact_from_bytes(&artifact_name(&url), bytes, trace_id)?;
    emit_log(
        observer,
        format!("Downloaded {} ({} bytes)", artifact.name, artifact.len()),
        LogLevel::Success,
    );
    Ok(artifact)
}
