use std::{fs, path::PathBuf};

use directories::ProjectDirs;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("failed to instantiate ProjectDirs")]
    ProjectDirsError,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

fn project_dirs() -> Result<ProjectDirs, PathError> {
    ProjectDirs::from("", "", "sigscope").ok_or(PathError::ProjectDirsError)
}

/// Get the config directory, e.g. `~/.config/sigscope`
/// Also creates it if it doesn't exist
pub fn get_config_dir() -> Result<PathBuf, PathError> {
    let dir = project_dirs()?.config_dir().to_owned();

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    Ok(dir)
}

/// Get path to `<config_dir>/sigscope.toml`
pub fn get_config_filepath() -> Result<PathBuf, PathError> {
    Ok(get_config_dir()?.join("sigscope.toml"))
}

/// Get path to `<data_local_dir>/logs/`
/// Also creates `logs` dir if it doesn't exist
pub fn get_logs_dir() -> Result<PathBuf, PathError> {
    let mut logs_dir = project_dirs()?.data_local_dir().to_owned();
    logs_dir.push("logs");

    if !logs_dir.exists() {
        fs::create_dir_all(&logs_dir)?;
    }

    Ok(logs_dir)
}
