use std::path::PathBuf;

use super::StorageError;

/// Expands a leading `~/` or `$HOME` against the `HOME` environment variable.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    if let Some(rest) = raw_path.strip_prefix("~/") {
        let home = std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable)?;
        return Ok(PathBuf::from(home).join(rest));
    }

    if let Some(rest) = raw_path.strip_prefix("$HOME") {
        if rest.is_empty() || rest.starts_with('/') {
            let home =
                std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable)?;
            return Ok(PathBuf::from(format!("{home}{rest}")));
        }
    }

    Ok(PathBuf::from(raw_path))
}
