// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Update Controller.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! State persistence module for the update controller

use crate::error::{Result, UpdaterError};
use crate::version::SemVer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A release that was staged by a successful check but not installed yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelease {
    pub version: SemVer,
    pub root_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdaterState {
    /// Version last reported by the device
    pub current_version: Option<SemVer>,

    /// Version of the newest published release
    pub latest_version: Option<SemVer>,

    /// Last time a check completed
    pub last_check_at: Option<DateTime<Utc>>,

    /// Last successful install timestamp
    pub last_install_at: Option<DateTime<Utc>>,

    /// Most recent backup image taken before an install
    pub last_backup: Option<PathBuf>,

    /// Staged release awaiting install
    pub pending_release: Option<PendingRelease>,

    /// Number of consecutive failed installs
    pub consecutive_failures: u32,
}

pub fn load_state(path: &Path) -> Result<UpdaterState> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            UpdaterError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse state: {e}"),
            ))
        })
    } else {
        Ok(UpdaterState::default())
    }
}

pub fn save_state(state: &UpdaterState, path: &Path) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(state)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_state() {
        let state = UpdaterState::default();
        assert!(state.current_version.is_none());
        assert!(state.latest_version.is_none());
        assert!(state.last_check_at.is_none());
        assert!(state.last_install_at.is_none());
        assert!(state.last_backup.is_none());
        assert!(state.pending_release.is_none());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_missing_file_gives_default() {
        let dir = TempDir::new().unwrap();
        let state = load_state(&dir.path().join("absent.json")).unwrap();
        assert!(state.current_version.is_none());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater_state.json");
        let state = UpdaterState {
            current_version: Some(SemVer::new(1, 2, 0)),
            latest_version: Some(SemVer::new(1, 3, 0)),
            last_check_at: Some(Utc::now()),
            last_install_at: None,
            last_backup: Some(PathBuf::from("backups/backup_20250101_120000.bin")),
            pending_release: Some(PendingRelease {
                version: SemVer::new(1, 3, 0),
                root_dir: PathBuf::from("releases/1.3.0"),
            }),
            consecutive_failures: 1,
        };

        save_state(&state, &path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.current_version, state.current_version);
        assert_eq!(loaded.latest_version, state.latest_version);
        assert_eq!(loaded.pending_release, state.pending_release);
        assert_eq!(loaded.consecutive_failures, 1);
    }

    #[test]
    fn test_corrupt_state_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater_state.json");
        std::fs::write(&path, "][").unwrap();
        assert!(load_state(&path).is_err());
    }
}
