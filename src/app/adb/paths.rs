pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("staging path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("staging path must be an absolute device path starting with '/'".to_string());
    }
    if trimmed.ends_with('/') {
        return Err("staging path must name a file, not a directory".to_string());
    }
    if trimmed.contains(['\0', '"', '`', '$', '\\', '\n']) {
        return Err("staging path contains invalid characters".to_string());
    }
    for segment in trimmed.split('/') {
        if segment == ".." {
            return Err("staging path must not contain '..' segments".to_string());
        }
    }
    Ok(())
}

/// Wraps a validated device path for use inside a device shell command line.
pub fn quote_device_path(path: &str) -> String {
    format!("\"{}\"", path.trim())
}
