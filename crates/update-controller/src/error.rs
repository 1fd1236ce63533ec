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

//! Error types for the update controller

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Malformed or unexpected replies from the device
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("device reported malformed version: {0:?}")]
    MalformedVersion(String),

    #[error("no response from device")]
    NoResponse,

    #[error("stream truncated: expected {expected} bytes, received {received}")]
    TruncatedStream { expected: usize, received: usize },

    #[error("unexpected reply from device: {0:?}")]
    UnexpectedReply(String),

    #[error("device refused the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cannot open port {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("timed out after {0:?} waiting for device")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("device rejected file {index} ({path}): {reason}")]
    FileRejected {
        index: usize,
        path: String,
        reason: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("release index returned status {status}")]
    Remote { status: u16 },

    #[error("repository not found or has no public releases: {0}")]
    NotFound(String),

    #[error("invalid release format: {0}")]
    InvalidReleaseFormat(String),

    #[error("release has no asset ending in {0}")]
    MissingAsset(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("release contains no installable files")]
    EmptyRelease,

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("backup {path} failed checksum verification")]
    BackupCorrupt { path: String },

    #[error("no backup available")]
    NoBackupAvailable,

    #[error("another operation is already in progress")]
    OperationInProgress,

    #[error("no staged update, check for updates first")]
    NotChecked,

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Coarse error classification surfaced to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    TimeoutError,
    ProtocolError,
    FileRejected,
    NetworkError,
    RemoteError,
    NotFound,
    InvalidReleaseFormat,
    MissingAsset,
    CorruptArchive,
    EmptyRelease,
    BackupFailed,
    BackupCorrupt,
    NoBackupAvailable,
    OperationInProgress,
    NotChecked,
    InvalidTransition,
    Cancelled,
    Config,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionError => "ConnectionError",
            Self::TimeoutError => "TimeoutError",
            Self::ProtocolError => "ProtocolError",
            Self::FileRejected => "FileRejected",
            Self::NetworkError => "NetworkError",
            Self::RemoteError => "RemoteError",
            Self::NotFound => "NotFound",
            Self::InvalidReleaseFormat => "InvalidReleaseFormat",
            Self::MissingAsset => "MissingAsset",
            Self::CorruptArchive => "CorruptArchive",
            Self::EmptyRelease => "EmptyRelease",
            Self::BackupFailed => "BackupFailed",
            Self::BackupCorrupt => "BackupCorrupt",
            Self::NoBackupAvailable => "NoBackupAvailable",
            Self::OperationInProgress => "OperationInProgress",
            Self::NotChecked => "NotChecked",
            Self::InvalidTransition => "InvalidTransition",
            Self::Cancelled => "Cancelled",
            Self::Config => "Config",
            Self::Io => "Io",
        };
        f.write_str(name)
    }
}

impl UpdaterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::Timeout(_) => ErrorKind::TimeoutError,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::FileRejected { .. } => ErrorKind::FileRejected,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::Remote { .. } => ErrorKind::RemoteError,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidReleaseFormat(_) => ErrorKind::InvalidReleaseFormat,
            Self::MissingAsset(_) => ErrorKind::MissingAsset,
            Self::CorruptArchive(_) => ErrorKind::CorruptArchive,
            Self::EmptyRelease => ErrorKind::EmptyRelease,
            Self::BackupFailed(_) => ErrorKind::BackupFailed,
            Self::BackupCorrupt { .. } => ErrorKind::BackupCorrupt,
            Self::NoBackupAvailable => ErrorKind::NoBackupAvailable,
            Self::OperationInProgress => ErrorKind::OperationInProgress,
            Self::NotChecked => ErrorKind::NotChecked,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Wrap any failure raised while taking a backup
    pub fn into_backup_failure(self) -> Self {
        match self {
            Self::BackupFailed(_) | Self::Cancelled => self,
            other => Self::BackupFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            UpdaterError::Protocol(ProtocolError::NoResponse).kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            UpdaterError::Remote { status: 500 }.kind(),
            ErrorKind::RemoteError
        );
        assert_eq!(UpdaterError::EmptyRelease.kind(), ErrorKind::EmptyRelease);
        assert_eq!(
            UpdaterError::Io(std::io::Error::other("disk")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_backup_failure_wrapping() {
        let err = UpdaterError::Protocol(ProtocolError::TruncatedStream {
            expected: 10,
            received: 4,
        })
        .into_backup_failure();
        assert_eq!(err.kind(), ErrorKind::BackupFailed);
        assert!(err.to_string().contains("expected 10 bytes"));

        // Cancellation stays distinguishable
        assert_eq!(
            UpdaterError::Cancelled.into_backup_failure().kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NoBackupAvailable).unwrap();
        assert_eq!(json, "\"no_backup_available\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "NotFound");
    }
}
