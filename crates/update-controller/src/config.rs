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

//! Configuration module for the update controller

use crate::error::{Result, UpdaterError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "updater_config.json";
const DEFAULT_REPO: &str = "SkvorikovCode/software-update-controller";
const TOKEN_ENV: &str = "GITHUB_TOKEN";

fn default_repo() -> String {
    DEFAULT_REPO.to_owned()
}

fn default_extension() -> String {
    ".zip".to_owned()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_30() -> u64 {
    30
}

fn default_state_file() -> String {
    "updater_state.json".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// GitHub repository publishing device releases, "owner/name"
    #[serde(default = "default_repo")]
    pub github_repo: String,

    /// Custom API base URL for testing (overrides default GitHub API)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    /// Token for private repositories, falls back to $GITHUB_TOKEN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    /// Release asset suffix that marks the update archive
    #[serde(default = "default_extension")]
    pub archive_extension: String,

    /// Root for the backups/, temp/ and releases/ directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP timeout for metadata requests (seconds)
    #[serde(default = "default_30")]
    pub request_timeout_secs: u64,

    /// Persisted controller state, relative to `data_dir`
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            github_repo: default_repo(),
            api_base_url: None,
            github_token: None,
            archive_extension: default_extension(),
            data_dir: default_data_dir(),
            request_timeout_secs: 30,
            state_file: default_state_file(),
        }
    }
}

impl UpdaterConfig {
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("temp")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.data_dir.join("releases")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }

    pub fn api_base(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or("https://api.github.com")
            .trim_end_matches('/')
    }

    /// Token from config, or from the environment
    pub fn token(&self) -> Option<String> {
        self.github_token
            .clone()
            .or_else(|| std::env::var(TOKEN_ENV).ok())
            .filter(|t| !t.is_empty())
    }

    /// Create backups/, temp/ and releases/ if absent
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.backups_dir(), self.temp_dir(), self.releases_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut parts = self.github_repo.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {}
            _ => {
                return Err(UpdaterError::Config(format!(
                    "github_repo must be \"owner/name\", got {:?}",
                    self.github_repo
                )));
            }
        }
        if self.archive_extension.is_empty() {
            return Err(UpdaterError::Config(
                "archive_extension must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<UpdaterConfig> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| UpdaterError::Config(format!("Failed to parse config: {e}")))?
    } else {
        // Create with defaults
        let config = UpdaterConfig::default();
        save_config(&config, path)?;
        tracing::info!("Wrote default config to {}", path.display());
        config
    };
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &UpdaterConfig, path: &Path) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}
