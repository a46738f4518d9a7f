//! Which local entries take part in a sync, and how derived files are named.

use std::path::{Path, PathBuf};

pub const SPREADSHEET_EXTENSION: &str = "xlsx";
pub const DERIVED_EXTENSION: &str = "json";
pub const ERROR_LOG_SUFFIX: &str = "_error_log.txt";

const OS_METADATA_FILES: &[&str] = &[".DS_Store"];
const LOCK_FILE_MARKER: &str = "~$";
const ERROR_LOG_MARKER: &str = "_error_log";

/// True for files the synchronizer must never touch remotely: OS metadata,
/// office lock files, derived JSON and error sidecars.
pub fn is_ignored(file_name: &str) -> bool {
    OS_METADATA_FILES.contains(&file_name)
        || file_name.contains(LOCK_FILE_MARKER)
        || file_name.contains(".json")
        || file_name.contains(ERROR_LOG_MARKER)
}

pub fn is_spreadsheet(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == SPREADSHEET_EXTENSION)
}

/// `plate.xlsx` → `plate.json`
pub fn derived_name(file_name: &str) -> String {
    Path::new(file_name)
        .with_extension(DERIVED_EXTENSION)
        .to_string_lossy()
        .into_owned()
}

pub fn derived_path(source: &Path) -> PathBuf {
    source.with_extension(DERIVED_EXTENSION)
}

/// `dir/plate.xlsx` → `dir/plate_error_log.txt`
pub fn error_log_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{stem}{ERROR_LOG_SUFFIX}"))
}
