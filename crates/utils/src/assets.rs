//! Locations of files the services keep on disk.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Directory holding the config file and the local database.
///
/// Falls back to `.devtrack` in the working directory when the platform has no
/// home directory (containers, CI).
pub fn data_dir() -> PathBuf {
    ProjectDirs::from("africa", "devtrack", "devtrack")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".devtrack"))
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

pub fn database_path() -> PathBuf {
    data_dir().join("db.sqlite")
}
