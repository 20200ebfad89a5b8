// src/core/paths.rs

use crate::constants::{
    CONFIG_FILENAMES, HOME_ENV_VAR, LIVE_DIR_NAME, LOG_DIR_NAME, RUNS_DIR_NAME, STATE_DIR_NAME,
};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system data directory.")]
    DataDirNotFound,
    #[error("Could not create directory at '{path}': {source}")]
    DirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No {} found in '{}' or any parent directory.", CONFIG_FILENAMES.join(" or "), .start.display())]
    ConfigNotFound { start: PathBuf },
    #[error("Failed to expand path '{path}': {message}")]
    Expansion { path: String, message: String },
}

/// The directories holding persisted instance state and run logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeDirs {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    /// `state/live`: one record per running service.
    pub live_dir: PathBuf,
    /// `state/runs`: one directory of run records per service.
    pub runs_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl HomeDirs {
    /// Lays out `state/live`, `state/runs` and `logs/` under `root`, creating them if needed.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, PathError> {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        let dirs = Self {
            live_dir: state_dir.join(LIVE_DIR_NAME),
            runs_dir: state_dir.join(RUNS_DIR_NAME),
            log_dir: root.join(LOG_DIR_NAME),
            state_dir,
            root,
        };
        for dir in [&dirs.live_dir, &dirs.runs_dir, &dirs.log_dir] {
            ensure_dir(dir)?;
        }
        Ok(dirs)
    }

    /// Resolves the home root: an explicit override, then `MUSTER_HOME`, then the
    /// platform's local data directory.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, PathError> {
        if let Some(root) = explicit {
            return Self::at(root);
        }
        if let Some(root) = std::env::var_os(HOME_ENV_VAR).filter(|v| !v.is_empty()) {
            return Self::at(PathBuf::from(root));
        }
        let root = dirs::data_local_dir()
            .ok_or(PathError::DataDirNotFound)?
            .join("muster");
        Self::at(root)
    }
}

fn ensure_dir(dir: &Path) -> Result<(), PathError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| PathError::DirCreation {
            path: dir.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}

/// Walks up from `start` looking for a config file.
pub fn find_config_file(start: &Path) -> Result<PathBuf, PathError> {
    for dir in start.ancestors() {
        for name in CONFIG_FILENAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(PathError::ConfigNotFound {
        start: start.to_path_buf(),
    })
}

/// Expands `~` and `$VAR` in `raw`, then anchors relative results at `base`.
pub fn resolve_path(raw: &str, base: &Path) -> Result<PathBuf, PathError> {
    let expanded = shellexpand::full(raw).map_err(|e| PathError::Expansion {
        path: raw.to_string(),
        message: e.to_string(),
    })?;
    let path = PathBuf::from(expanded.into_owned());
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(base.join(path))
    }
}
