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

//! Update Controller - firmware updates for serial-attached devices
//!
//! Checks GitHub Releases for a newer device image, stages it locally, backs
//! up the device and streams the new files over a 9600 baud serial link, with
//! rollback to the most recent backup.

pub mod backup;
pub mod config;
pub mod downloader;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod release_checker;
pub mod stager;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod version;

#[cfg(test)]
mod test_support;

pub use config::{UpdaterConfig, load_config};
pub use error::{ErrorKind, UpdaterError};
pub use orchestrator::{FailureReport, Orchestrator, Outcome, UpdateState};
pub use progress::{Operation, UpdateEvent};
pub use state::UpdaterState;
pub use version::{SemVer, is_newer};
