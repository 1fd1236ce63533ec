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

//! GitHub API release checking module

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::version::SemVer;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub(crate) const USER_AGENT: &str = concat!("update-controller/", env!("CARGO_PKG_VERSION"));

/// The newest published release and its update archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub version: SemVer,
    pub tag: String,
    pub archive_url: String,
    pub archive_name: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Talks to the release index and downloads archives
#[derive(Debug, Clone)]
pub struct ReleaseFetcher {
    pub(crate) client: reqwest::Client,
    api_base: String,
    pub(crate) token: Option<String>,
    archive_extension: String,
    request_timeout: Duration,
}

impl ReleaseFetcher {
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| UpdaterError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base().to_owned(),
            token: config.token(),
            archive_extension: config.archive_extension.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Look up the latest release of `repo` ("owner/name")
    pub async fn fetch_latest(&self, repo: &str) -> Result<ReleaseDescriptor> {
        let url = format!("{}/repos/{repo}/releases/latest", self.api_base);
        tracing::debug!("Fetching {url}");

        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .timeout(self.request_timeout);

        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpdaterError::Network(format!("Request failed: {e}")))?;

        // Check rate limit
        if let Some(remaining) = response.headers().get("x-ratelimit-remaining")
            && let Ok(remaining_str) = remaining.to_str()
            && let Ok(remaining_int) = remaining_str.parse::<u32>()
            && remaining_int < 10
        {
            tracing::warn!("GitHub rate limit low: {remaining_int} remaining");
        }

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(UpdaterError::NotFound(repo.to_owned())),
            status => {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!("Release index returned {status}: {body}");
                return Err(UpdaterError::Remote {
                    status: status.as_u16(),
                });
            }
        }

        let release: GithubRelease = response.json().await.map_err(|e| {
            if e.is_decode() {
                UpdaterError::InvalidReleaseFormat(format!("Failed to parse response: {e}"))
            } else {
                UpdaterError::Network(format!("Failed to read response: {e}"))
            }
        })?;

        let version = SemVer::parse(&release.tag_name).map_err(|e| {
            UpdaterError::InvalidReleaseFormat(format!("use tags like v1.0.0: {e}"))
        })?;

        let asset = release
            .assets
            .iter()
            .find(|a| a.name.ends_with(&self.archive_extension))
            .ok_or_else(|| UpdaterError::MissingAsset(self.archive_extension.clone()))?;

        if asset.name.contains(['/', '\\']) || asset.name == self.archive_extension {
            return Err(UpdaterError::InvalidReleaseFormat(format!(
                "unusable asset name {:?}",
                asset.name
            )));
        }

        tracing::info!("Latest release of {repo}: {version} ({})", asset.name);

        Ok(ReleaseDescriptor {
            version,
            tag: release.tag_name.clone(),
            archive_url: asset.browser_download_url.clone(),
            archive_name: asset.name.clone(),
            published_at: release.published_at,
        })
    }
}
