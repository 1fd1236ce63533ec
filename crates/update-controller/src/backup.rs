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

//! Backup module for pre-install device snapshots
//!
//! Images are stored as `backup_<YYYYMMDD_HHMMSS>.bin` stamped in UTC, so
//! sorting names descending yields newest first across DST changes. Each
//! image gets a `sha256sum`-style sidecar (`<name>.sha256`) that is checked
//! before it is restored.

use crate::downloader::PartialFile;
use crate::error::{Result, UpdaterError};
use crate::protocol::DeviceClient;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const BACKUP_PREFIX: &str = "backup_";
pub const BACKUP_EXTENSION: &str = ".bin";
const CHECKSUM_EXTENSION: &str = "sha256";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub created_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

impl Backup {
    fn from_path(path: PathBuf) -> Self {
        let created_at = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(BACKUP_PREFIX))
            .and_then(|n| n.strip_suffix(BACKUP_EXTENSION))
            .and_then(|ts| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok())
            .map(|naive| Utc.from_utc_datetime(&naive));
        Self { created_at, path }
    }

    fn checksum_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(CHECKSUM_EXTENSION);
        PathBuf::from(name)
    }

    /// Read the image, verifying it against its sidecar when one exists
    pub fn read_verified(&self) -> Result<Vec<u8>> {
        let image = fs::read(&self.path)?;
        let sidecar = self.checksum_path();
        if sidecar.exists() {
            let expected = parse_sha256sum(&fs::read_to_string(&sidecar)?);
            let actual = sha256_hex(&image);
            if expected.as_deref() != Some(actual.as_str()) {
                tracing::error!(
                    "Checksum mismatch for {}: expected {expected:?}, got {actual}",
                    self.path.display()
                );
                return Err(UpdaterError::BackupCorrupt {
                    path: self.path.display().to_string(),
                });
            }
        } else {
            tracing::warn!("No checksum for {}, restoring unverified", self.path.display());
        }
        Ok(image)
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// First hash in `sha256sum` output
fn parse_sha256sum(content: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .next()
        .map(str::to_lowercase)
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pull the device image and store it under a fresh timestamped name
    ///
    /// Any protocol or filesystem failure is reported as `BackupFailed`.
    pub async fn create_backup(&self, device: &DeviceClient, port: &str) -> Result<Backup> {
        self.try_create_backup(device, port)
            .await
            .map_err(UpdaterError::into_backup_failure)
    }

    async fn try_create_backup(&self, device: &DeviceClient, port: &str) -> Result<Backup> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let image = device.begin_backup(port).await?;
        if image.is_empty() {
            return Err(UpdaterError::BackupFailed(
                "device returned an empty image".to_owned(),
            ));
        }

        let path = self.fresh_path(Utc::now());
        let backup = Backup::from_path(path);
        let checksum = sha256_hex(&image);
        let file_name = backup
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Image first via temp + rename, sidecar last
        let mut temp = PartialFile::new(backup.path.with_extension("part"));
        tokio::fs::write(temp.path(), &image).await?;
        tokio::fs::rename(temp.path(), &backup.path).await?;
        temp.disarm();
        tokio::fs::write(backup.checksum_path(), format!("{checksum}  {file_name}\n")).await?;

        tracing::info!(
            "Created backup at {} ({} bytes, sha256 {checksum})",
            backup.path.display(),
            image.len()
        );
        Ok(backup)
    }

    /// `backup_<timestamp>.bin`, bumped a second at a time if the name is taken
    fn fresh_path(&self, now: DateTime<Utc>) -> PathBuf {
        let mut at = now;
        loop {
            let name = format!("{BACKUP_PREFIX}{}{BACKUP_EXTENSION}", at.format(TIMESTAMP_FORMAT));
            let path = self.dir.join(name);
            if !path.exists() {
                return path;
            }
            at += chrono::Duration::seconds(1);
        }
    }

    /// All backups, newest first
    pub fn list(&self) -> Result<Vec<Backup>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
            .filter(|name| name.ends_with(BACKUP_EXTENSION))
            .collect();

        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names
            .into_iter()
            .map(|name| Backup::from_path(self.dir.join(name)))
            .collect())
    }

    /// Most recent backup by filename, if any
    pub fn latest_backup(&self) -> Result<Option<Backup>> {
        Ok(self.list()?.into_iter().next())
    }
}
