//! Input validation helpers with consistent error messages.

use anyhow::{bail, Result};
use std::path::Path;

/// Validates that a file exists.
///
/// # Errors
///
/// Returns an error naming the file's role when it does not exist.
pub fn validate_file_exists<P: AsRef<Path>>(path: P, description: &str) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("{description} '{}' does not exist", path.display());
    }
    Ok(())
}

/// Validates that every file in a batch exists.
///
/// # Errors
///
/// Returns an error for the first missing file.
pub fn validate_files_exist<P: AsRef<Path>>(files: &[P], description: &str) -> Result<()> {
    for path in files {
        validate_file_exists(path, description)?;
    }
    Ok(())
}
