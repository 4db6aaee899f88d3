use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::app::error::AppError;

/// String key-value store backing the persisted part of the session.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), AppError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One JSON object of string values in a single file; every `set` rewrites the file atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    trace_id: String,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, trace_id: &str) -> Self {
        Self {
            path: path.into(),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file reads as empty; the next write replaces it.
    fn read_all(&self) -> BTreeMap<String, String> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&content) {
            Ok(values) => values,
            Err(err) => {
                warn!(
                    trace_id = %self.trace_id,
                    path = %self.path.display(),
                    error = %err,
                    "state file is not a string map, ignoring"
                );
                BTreeMap::new()
            }
        }
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), AppError> {
        let payload = serde_json::to_string_pretty(values)
            .map_err(|err| AppError::system(format!("Failed to serialize state: {err}"), &self.trace_id))?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| {
            AppError::system(format!("Failed to create state dir: {err}"), &self.trace_id)
        })?;
        let mut temp = NamedTempFile::new_in(&parent)
            .map_err(|err| AppError::system(format!("Failed to create temp file: {err}"), &self.trace_id))?;
        temp.write_all(payload.as_bytes())
            .map_err(|err| AppError::system(format!("Failed to write state: {err}"), &self.trace_id))?;
        temp.persist(&self.path)
            .map_err(|err| AppError::system(format!("Failed to save state: {err}"), &self.trace_id))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.read_all().remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        let mut values = self.read_all();
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }
}
