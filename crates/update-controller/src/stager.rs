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

//! Release archive extraction and install-set enumeration
//!
//! Staging is all-or-nothing: either `releases/<version>/` holds the archive,
//! its extracted contents and a `.staged` marker, or the directory is gone.

use crate::error::{Result, UpdaterError};
use crate::version::SemVer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const STAGED_MARKER: &str = ".staged";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    pub absolute_path: PathBuf,
    /// `/`-separated path relative to the device filesystem root
    pub device_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedRelease {
    pub version: SemVer,
    pub root_dir: PathBuf,
    /// Install order, sorted by `device_path`
    pub files: Vec<StagedFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    version: SemVer,
    archive: String,
}

/// Removes the destination directory unless disarmed, even while unwinding
struct StagingGuard<'a> {
    dir: &'a Path,
    armed: bool,
}

impl Drop for StagingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.dir.exists() {
            tracing::warn!("Removing incomplete release at {}", self.dir.display());
            if let Err(e) = fs::remove_dir_all(self.dir) {
                tracing::error!("Failed to remove {}: {e}", self.dir.display());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseStager {
    releases_dir: PathBuf,
}

impl ReleaseStager {
    pub fn new(releases_dir: impl Into<PathBuf>) -> Self {
        Self {
            releases_dir: releases_dir.into(),
        }
    }

    pub fn release_dir(&self, version: SemVer) -> PathBuf {
        self.releases_dir.join(version.to_string())
    }

    /// Extract `archive_path` into `destination_dir` and enumerate the install set
    pub async fn stage(
        &self,
        version: SemVer,
        archive_path: &Path,
        destination_dir: &Path,
    ) -> Result<StagedRelease> {
        let archive_path = archive_path.to_path_buf();
        let destination_dir = destination_dir.to_path_buf();
        let failed_dir = destination_dir.clone();

        match tokio::task::spawn_blocking(move || {
            stage_blocking(version, &archive_path, &destination_dir)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                // The guard already ran during unwinding; this covers aborts
                let _ = fs::remove_dir_all(&failed_dir);
                Err(UpdaterError::CorruptArchive(format!("extraction task failed: {e}")))
            }
        }
    }

    /// A previously completed staging of `version`, if one is on disk
    pub fn load_staged(&self, version: SemVer) -> Result<Option<StagedRelease>> {
        let dir = self.release_dir(version);
        let marker_path = dir.join(STAGED_MARKER);
        if !marker_path.is_file() {
            return Ok(None);
        }

        let marker: Marker = match serde_json::from_str(&fs::read_to_string(&marker_path)?) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Ignoring unreadable marker {}: {e}", marker_path.display());
                return Ok(None);
            }
        };
        if marker.version != version {
            return Ok(None);
        }

        let files = enumerate(&dir, &dir.join(&marker.archive))?;
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(StagedRelease {
            version,
            root_dir: dir,
            files,
        }))
    }

    /// Remove the directory of a release that is no longer needed
    pub fn discard(&self, version: SemVer) -> Result<()> {
        let dir = self.release_dir(version);
        if dir.exists() {
            tracing::info!("Removing release directory {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn stage_blocking(version: SemVer, archive_path: &Path, destination_dir: &Path) -> Result<StagedRelease> {
    let mut guard = StagingGuard {
        dir: destination_dir,
        armed: true,
    };

    fs::create_dir_all(destination_dir)?;
    let archive_name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| UpdaterError::CorruptArchive(format!("bad archive path {}", archive_path.display())))?
        .to_owned();

    extract(archive_path, destination_dir)?;

    let files = enumerate(destination_dir, archive_path)?;
    if files.is_empty() {
        return Err(UpdaterError::EmptyRelease);
    }

    let marker = Marker {
        version,
        archive: archive_name,
    };
    fs::write(
        destination_dir.join(STAGED_MARKER),
        serde_json::to_string_pretty(&marker)?,
    )?;

    guard.armed = false;
    tracing::info!(
        "Staged {version}: {} files in {}",
        files.len(),
        destination_dir.display()
    );

    Ok(StagedRelease {
        version,
        root_dir: destination_dir.to_path_buf(),
        files,
    })
}

fn corrupt(e: impl std::fmt::Display) -> UpdaterError {
    UpdaterError::CorruptArchive(e.to_string())
}

fn extract(archive_path: &Path, destination_dir: &Path) -> Result<()> {
    let file = fs::File::open(archive_path).map_err(corrupt)?;
    let mut archive = zip::ZipArchive::new(file).map_err(corrupt)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(corrupt)?;

        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(UpdaterError::CorruptArchive(format!(
                "member escapes release directory: {}",
                entry.name()
            )));
        };
        if entry.name().chars().any(char::is_control) {
            return Err(UpdaterError::CorruptArchive(format!(
                "member name contains control characters: {:?}",
                entry.name()
            )));
        }
        if relative.components().all(|c| matches!(c, Component::CurDir)) {
            continue;
        }

        let out_path = destination_dir.join(&relative);
        if out_path == archive_path || relative == Path::new(STAGED_MARKER) {
            tracing::debug!("Skipping reserved member {}", entry.name());
            continue;
        }

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(corrupt)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(corrupt)?;
        }
        let mut out = fs::File::create(&out_path).map_err(corrupt)?;
        std::io::copy(&mut entry, &mut out).map_err(corrupt)?;
    }

    Ok(())
}

/// Every regular file under `root` except the archive and the marker, sorted
fn enumerate(root: &Path, archive_path: &Path) -> Result<Vec<StagedFile>> {
    let mut files = Vec::new();
    walk(root, root, archive_path, &mut files)?;
    files.sort_by(|a, b| a.device_path.cmp(&b.device_path));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, archive_path: &Path, files: &mut Vec<StagedFile>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk(root, &path, archive_path, files)?;
            continue;
        }
        if !file_type.is_file() || path == archive_path {
            continue;
        }

        let relative = path.strip_prefix(root).map_err(corrupt)?;
        if relative == Path::new(STAGED_MARKER) {
            continue;
        }
        let device_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push(StagedFile {
            absolute_path: path,
            device_path,
        });
    }
    Ok(())
}
