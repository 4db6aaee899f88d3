use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use zip::ZipArchive;

use crate::app::error::AppError;
use crate::app::models::ApkArtifact;

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

pub fn normalize_apk_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

/// An APK is a zip archive that carries a manifest entry.
pub fn validate_apk_bytes(bytes: &[u8]) -> Result<(), String> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| format!("Invalid APK: {err}"))?;
    if archive.by_name(MANIFEST_ENTRY).is_err() {
        return Err(format!("Invalid APK: missing {MANIFEST_ENTRY}"));
    }
    Ok(())
}

pub fn artifact_from_bytes(name: &str, bytes: Vec<u8>, trace_id: &str) -> Result<ApkArtifact, AppError> {
    if bytes.is_empty() {
        return Err(AppError::artifact_missing(format!("APK {name} is empty"), trace_id));
    }
    validate_apk_bytes(&bytes)
        .map_err(|message| AppError::artifact_missing(format!("{message} ({name})"), trace_id))?;
    Ok(ApkArtifact {
        name: name.to_string(),
        bytes,
    })
}

pub fn load_apk_file(path: &Path, trace_id: &str) -> Result<ApkArtifact, AppError> {
    if !path.is_file() {
        return Err(AppError::artifact_missing(
            format!("Local APK is missing: {}", path.display()),
            trace_id,
        ));
    }
    let bytes = fs::read(path).map_err(|err| {
        AppError::artifact_missing(
            format!("Failed to read local APK {}: {err}", path.display()),
            trace_id,
        )
    })?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "app.apk".to_string());
    artifact_from_bytes(&name, bytes, trace_id)
}

/// Where the installable package comes from: a previously downloaded copy, else the local fallback.
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    downloaded: Option<Arc<ApkArtifact>>,
    local_cache: Option<Arc<ApkArtifact>>,
    local_path: PathBuf,
}

impl ArtifactSource {
    pub fn new(local_path: impl AsRef<str>) -> Self {
        Self {
            downloaded: None,
            local_cache: None,
            local_path: normalize_apk_path(local_path.as_ref()),
        }
    }

    pub fn with_downloaded(mut self, artifact: ApkArtifact) -> Self {
        self.downloaded = Some(Arc::new(artifact));
        self
    }

    pub fn has_downloaded(&self) -> bool {
        self.downloaded.is_some()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// The fallback is read once and kept for later runs.
    pub fn obtain(&mut self, trace_id: &str) -> Result<Arc<ApkArtifact>, AppError> {
        if let Some(artifact) = self.downloaded.as_ref().or(self.local_cache.as_ref()) {
            return Ok(Arc::clone(artifact));
        }
        info!(trace_id = %trace_id, path = %self.local_path.display(), "loading local apk");
        let artifact = Arc::new(load_apk_file(&self.local_path, trace_id)?);
        self.local_cache = Some(Arc::clone(&artifact));
        Ok(artifact)
    }
}

#[cfg(test)]
pub(crate) fn sample_apk_bytes() -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(MANIFEST_ENTRY, SimpleFileOptions::default())
        .expect("manifest");
    zip.write_all(b"<manifest/>").expect("write manifest");
    zip.start_file("classes.dex", SimpleFileOptions::default())
        .expect("dex");
    zip.write_all(b"dex\n035").expect("write dex");
    zip.finish().expect("finish").into_inner()
}
