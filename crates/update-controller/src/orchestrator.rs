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

//! Update state machine
//!
//! ```text
//! Idle -> Checking -> UpdateAvailable -> Installing -> Installed | Failed
//!            \-> UpToDate -> Idle
//! Idle | Failed -> RollingBack -> RolledBack | Failed
//! ```
//!
//! Only one operation runs at a time. Every public operation resolves to an
//! [`Outcome`]; errors are reported, never returned.

use crate::backup::{Backup, BackupManager};
use crate::config::UpdaterConfig;
use crate::error::{ErrorKind, Result, UpdaterError};
use crate::progress::{EventSink, Operation, ProgressReporter, UpdateEvent};
use crate::protocol::{DeviceClient, UpdateFile};
use crate::release_checker::{ReleaseDescriptor, ReleaseFetcher};
use crate::stager::{ReleaseStager, StagedRelease};
use crate::state::{PendingRelease, UpdaterState, load_state, save_state};
use crate::version::{SemVer, is_newer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable,
    Installing,
    Installed,
    RollingBack,
    RolledBack,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpToDate => "up to date",
            Self::UpdateAvailable => "update available",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::RollingBack => "rolling back",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    /// The install failed after a backup was taken; device state is unknown
    pub rollback_recommended: bool,
}

impl FailureReport {
    fn new(error: &UpdaterError, rollback_recommended: bool) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            rollback_recommended,
        }
    }
}

/// Final result of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    UpToDate { current: SemVer },
    UpdateAvailable { current: SemVer, latest: SemVer },
    Installed { version: SemVer },
    RolledBack { backup: PathBuf },
    Failed(FailureReport),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        match self {
            Self::Failed(report) => Some(report),
            _ => None,
        }
    }
}

/// What a successful check learned, consumed by install
#[derive(Debug, Clone)]
pub struct UpdateSession {
    pub current_version: SemVer,
    pub latest_version: SemVer,
    /// `None` when the session was restored from disk
    pub release: Option<ReleaseDescriptor>,
    pub staged: StagedRelease,
}

/// Point-in-time view for the presentation layer
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: UpdateState,
    pub current_version: Option<SemVer>,
    pub latest_version: Option<SemVer>,
    pub pending_version: Option<SemVer>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_install_at: Option<DateTime<Utc>>,
    pub last_backup: Option<PathBuf>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Machine {
    state: UpdateState,
    session: Option<UpdateSession>,
    persisted: UpdaterState,
}

/// Clears the busy flag when the running operation ends
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct Inner {
    repo: String,
    state_path: PathBuf,
    device: DeviceClient,
    fetcher: ReleaseFetcher,
    stager: ReleaseStager,
    backups: BackupManager,
    temp_dir: PathBuf,
    events: EventSink,
    busy: AtomicBool,
    machine: Mutex<Machine>,
}

/// Cheap to clone; clones drive the same device and state
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(UpdaterError::Cancelled),
        result = operation => result,
    }
}

fn rejected(error: &UpdaterError) -> Outcome {
    warn!("Request rejected: {error}");
    Outcome::Failed(FailureReport::new(error, false))
}

impl Orchestrator {
    /// Build from config, resuming a staged update left by an earlier check
    pub fn new(
        config: &UpdaterConfig,
        device: DeviceClient,
        events: UnboundedSender<UpdateEvent>,
    ) -> Result<Self> {
        config.ensure_dirs()?;
        let state_path = config.state_path();
        let persisted = load_state(&state_path)?;
        let stager = ReleaseStager::new(config.releases_dir());

        let session = resume_session(&persisted, &stager)?;
        let state = if session.is_some() {
            UpdateState::UpdateAvailable
        } else {
            UpdateState::Idle
        };

        Ok(Self {
            inner: Arc::new(Inner {
                repo: config.github_repo.clone(),
                state_path,
                device,
                fetcher: ReleaseFetcher::new(config)?,
                stager,
                backups: BackupManager::new(config.backups_dir()),
                temp_dir: config.temp_dir(),
                events: EventSink::new(events),
                busy: AtomicBool::new(false),
                machine: Mutex::new(Machine {
                    state,
                    session,
                    persisted,
                }),
            }),
        })
    }

    pub fn state(&self) -> UpdateState {
        self.machine().state
    }

    pub fn status(&self) -> Status {
        let machine = self.machine();
        let persisted = &machine.persisted;
        Status {
            state: machine.state,
            current_version: persisted.current_version,
            latest_version: persisted.latest_version,
            pending_version: machine.session.as_ref().map(|s| s.latest_version),
            last_check_at: persisted.last_check_at,
            last_install_at: persisted.last_install_at,
            last_backup: persisted.last_backup.clone(),
            consecutive_failures: persisted.consecutive_failures,
        }
    }

    pub fn backups(&self) -> &BackupManager {
        &self.inner.backups
    }

    /// Return a finished operation's terminal state to `Idle`
    pub fn acknowledge(&self) -> UpdateState {
        if self.inner.busy.load(Ordering::Acquire) {
            return self.state();
        }
        let state = self.state();
        if matches!(
            state,
            UpdateState::Installed | UpdateState::RolledBack | UpdateState::Failed | UpdateState::UpToDate
        ) {
            self.transition(UpdateState::Idle);
            return UpdateState::Idle;
        }
        state
    }

    pub async fn check_for_update(&self, port: &str, cancel: &CancellationToken) -> Outcome {
        let outcome = match BusyGuard::acquire(&self.inner.busy) {
            Some(_busy) => self.run_check(port, cancel).await,
            None => rejected(&UpdaterError::OperationInProgress),
        };
        self.finish(Operation::Check, outcome)
    }

    pub async fn install(&self, port: &str, cancel: &CancellationToken) -> Outcome {
        let outcome = match BusyGuard::acquire(&self.inner.busy) {
            Some(_busy) => self.run_install(port, cancel).await,
            None => rejected(&UpdaterError::OperationInProgress),
        };
        self.finish(Operation::Install, outcome)
    }

    pub async fn rollback(&self, port: &str, cancel: &CancellationToken) -> Outcome {
        let outcome = match BusyGuard::acquire(&self.inner.busy) {
            Some(_busy) => self.run_rollback(port, cancel).await,
            None => rejected(&UpdaterError::OperationInProgress),
        };
        self.finish(Operation::Rollback, outcome)
    }

    pub fn spawn_check(&self, port: impl Into<String>, cancel: CancellationToken) -> JoinHandle<Outcome> {
        let this = self.clone();
        let port = port.into();
        tokio::spawn(async move { this.check_for_update(&port, &cancel).await })
    }

    pub fn spawn_install(&self, port: impl Into<String>, cancel: CancellationToken) -> JoinHandle<Outcome> {
        let this = self.clone();
        let port = port.into();
        tokio::spawn(async move { this.install(&port, &cancel).await })
    }

    pub fn spawn_rollback(&self, port: impl Into<String>, cancel: CancellationToken) -> JoinHandle<Outcome> {
        let this = self.clone();
        let port = port.into();
        tokio::spawn(async move { this.rollback(&port, &cancel).await })
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, machine: &Machine) {
        if let Err(e) = save_state(&machine.persisted, &self.inner.state_path) {
            error!("Failed to save state: {e}");
        }
    }

    fn transition(&self, to: UpdateState) {
        let from = {
            let mut machine = self.machine();
            std::mem::replace(&mut machine.state, to)
        };
        debug!("State {from} -> {to}");
        self.inner.events.emit(UpdateEvent::StateChanged { from, to });
    }

    fn finish(&self, operation: Operation, outcome: Outcome) -> Outcome {
        self.inner.events.emit(UpdateEvent::Finished {
            operation,
            outcome: outcome.clone(),
        });
        outcome
    }

    // --- check ---

    async fn run_check(&self, port: &str, cancel: &CancellationToken) -> Outcome {
        let state = self.state();
        if !matches!(state, UpdateState::Idle | UpdateState::UpdateAvailable) {
            return rejected(&UpdaterError::InvalidTransition {
                operation: "check",
                state: state.to_string(),
            });
        }

        self.transition(UpdateState::Checking);
        let reporter = self.inner.events.reporter(Operation::Check);

        match self.check(port, cancel, &reporter).await {
            Ok(session) => self.commit_check(session, &reporter),
            Err(e) => {
                error!("Update check failed: {e}");
                {
                    let mut machine = self.machine();
                    machine.session = None;
                    if machine.persisted.pending_release.take().is_some() {
                        self.persist(&machine);
                    }
                }
                self.transition(UpdateState::Failed);
                self.transition(UpdateState::Idle);
                Outcome::Failed(FailureReport::new(&e, false))
            }
        }
    }

    async fn check(
        &self,
        port: &str,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<UpdateSession> {
        let inner = &self.inner;

        reporter.report(0, format!("Querying device on {port}"));
        let current = cancellable(cancel, inner.device.query_version(port)).await?;
        info!("Device on {port} runs {current}");

        reporter.report(10, "Fetching latest release");
        let release = cancellable(cancel, inner.fetcher.fetch_latest(&inner.repo)).await?;

        let staged = match inner.stager.load_staged(release.version)? {
            Some(staged) => {
                info!(
                    "Release {} already staged at {}",
                    release.version,
                    staged.root_dir.display()
                );
                staged
            }
            None => self.download_and_stage(&release, cancel, reporter).await?,
        };

        reporter.report(80, format!("Staged {} files", staged.files.len()));
        Ok(UpdateSession {
            current_version: current,
            latest_version: release.version,
            release: Some(release),
            staged,
        })
    }

    async fn download_and_stage(
        &self,
        release: &ReleaseDescriptor,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<StagedRelease> {
        let inner = &self.inner;
        inner.stager.discard(release.version)?;
        let dir = inner.stager.release_dir(release.version);

        reporter.report(10, format!("Downloading {}", release.archive_name));
        let archive = match inner
            .fetcher
            .download_archive(release, &inner.temp_dir, &dir, cancel, |done, total| {
                if let Some(total) = total {
                    reporter.track(10, 50, done, total, "Downloading");
                }
            })
            .await
        {
            Ok(path) => path,
            Err(e) => {
                let _ = inner.stager.discard(release.version);
                return Err(e);
            }
        };

        reporter.report(50, "Extracting release");
        let staged = inner.stager.stage(release.version, &archive, &dir).await?;
        if cancel.is_cancelled() {
            return Err(UpdaterError::Cancelled);
        }
        Ok(staged)
    }

    fn commit_check(&self, session: UpdateSession, reporter: &ProgressReporter) -> Outcome {
        let current = session.current_version;
        let latest = session.latest_version;
        let newer = is_newer(current, latest);

        {
            let mut machine = self.machine();
            machine.persisted.current_version = Some(current);
            machine.persisted.latest_version = Some(latest);
            machine.persisted.last_check_at = Some(Utc::now());
            machine.persisted.pending_release = newer.then(|| PendingRelease {
                version: latest,
                root_dir: session.staged.root_dir.clone(),
            });
            machine.session = newer.then_some(session);
            self.persist(&machine);
        }

        if newer {
            info!("Update available: {current} -> {latest}");
            reporter.report(100, format!("Version {latest} is ready to install"));
            self.transition(UpdateState::UpdateAvailable);
            Outcome::UpdateAvailable { current, latest }
        } else {
            info!("Device is up to date ({current}, latest {latest})");
            reporter.report(100, "Up to date");
            self.transition(UpdateState::UpToDate);
            self.transition(UpdateState::Idle);
            Outcome::UpToDate { current }
        }
    }

    // --- install ---

    async fn run_install(&self, port: &str, cancel: &CancellationToken) -> Outcome {
        let session = {
            let mut machine = self.machine();
            let state = machine.state;
            if state == UpdateState::UpdateAvailable
                && let Some(session) = machine.session.take()
            {
                session
            } else if matches!(state, UpdateState::Idle | UpdateState::UpdateAvailable) {
                return rejected(&UpdaterError::NotChecked);
            } else {
                return rejected(&UpdaterError::InvalidTransition {
                    operation: "install",
                    state: state.to_string(),
                });
            }
        };

        self.transition(UpdateState::Installing);
        let reporter = self.inner.events.reporter(Operation::Install);

        let files = match self.prepare_install(&session, port, cancel, &reporter).await {
            Ok(files) => files,
            Err(e) => return self.fail_install(&e, false),
        };

        match self.transfer(&files, port, cancel, &reporter).await {
            Ok(()) => self.commit_install(&session, &reporter),
            Err(e) => self.fail_install(&e, true),
        }
    }

    /// Load the install set, then take the mandatory backup
    async fn prepare_install(
        &self,
        session: &UpdateSession,
        port: &str,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Vec<UpdateFile>> {
        let mut files = Vec::with_capacity(session.staged.files.len());
        for file in &session.staged.files {
            files.push(UpdateFile {
                relative_path: file.device_path.clone(),
                content: tokio::fs::read(&file.absolute_path).await?,
            });
        }

        reporter.report(0, "Creating backup");
        let backup = cancellable(
            cancel,
            self.inner.backups.create_backup(&self.inner.device, port),
        )
        .await?;

        {
            let mut machine = self.machine();
            machine.persisted.last_backup = Some(backup.path.clone());
            self.persist(&machine);
        }

        if cancel.is_cancelled() {
            return Err(UpdaterError::Cancelled);
        }
        Ok(files)
    }

    async fn transfer(
        &self,
        files: &[UpdateFile],
        port: &str,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        reporter.report(0, format!("Installing {} files", files.len()));
        cancellable(
            cancel,
            self.inner.device.begin_update(port, files, |done, total| {
                reporter.track(
                    0,
                    100,
                    done as u64,
                    total as u64,
                    &format!("Installed {done}/{total} files"),
                );
            }),
        )
        .await
    }

    fn commit_install(&self, session: &UpdateSession, reporter: &ProgressReporter) -> Outcome {
        let version = session.staged.version;
        {
            let mut machine = self.machine();
            machine.persisted.current_version = Some(version);
            machine.persisted.last_install_at = Some(Utc::now());
            machine.persisted.pending_release = None;
            machine.persisted.consecutive_failures = 0;
            self.persist(&machine);
        }

        info!("Installed {version} ({} files)", session.staged.files.len());
        reporter.report(100, format!("Installed {version}"));
        self.transition(UpdateState::Installed);
        Outcome::Installed { version }
    }

    fn fail_install(&self, error: &UpdaterError, after_backup: bool) -> Outcome {
        error!("Install failed: {error}");
        if after_backup {
            warn!("Device state is unknown, rollback is recommended");
        }
        {
            let mut machine = self.machine();
            machine.persisted.pending_release = None;
            machine.persisted.consecutive_failures += 1;
            self.persist(&machine);
        }
        self.transition(UpdateState::Failed);
        Outcome::Failed(FailureReport::new(error, after_backup))
    }

    // --- rollback ---

    async fn run_rollback(&self, port: &str, cancel: &CancellationToken) -> Outcome {
        let state = self.state();
        if !matches!(
            state,
            UpdateState::Idle | UpdateState::Failed | UpdateState::UpdateAvailable
        ) {
            return rejected(&UpdaterError::InvalidTransition {
                operation: "rollback",
                state: state.to_string(),
            });
        }

        let backup = match self.inner.backups.latest_backup() {
            Ok(Some(backup)) => backup,
            Ok(None) => return rejected(&UpdaterError::NoBackupAvailable),
            Err(e) => return rejected(&e),
        };

        // The device is about to change under the staged update
        {
            let mut machine = self.machine();
            if machine.session.take().is_some() || machine.persisted.pending_release.is_some() {
                info!("Dropping pending update before rollback");
                machine.persisted.pending_release = None;
                self.persist(&machine);
            }
        }

        self.transition(UpdateState::RollingBack);
        let reporter = self.inner.events.reporter(Operation::Rollback);

        match self.restore(&backup, port, cancel, &reporter).await {
            Ok(()) => {
                {
                    let mut machine = self.machine();
                    // Unknown until the next check
                    machine.persisted.current_version = None;
                    machine.persisted.pending_release = None;
                    machine.session = None;
                    self.persist(&machine);
                }
                info!("Rolled back to {}", backup.path.display());
                reporter.report(100, "Backup restored");
                self.transition(UpdateState::RolledBack);
                Outcome::RolledBack { backup: backup.path }
            }
            Err(e) => {
                error!("Rollback failed: {e}");
                self.transition(UpdateState::Failed);
                Outcome::Failed(FailureReport::new(&e, false))
            }
        }
    }

    async fn restore(
        &self,
        backup: &Backup,
        port: &str,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        reporter.report(0, format!("Verifying {}", backup.path.display()));
        let image = {
            let backup = backup.clone();
            tokio::task::spawn_blocking(move || backup.read_verified())
                .await
                .map_err(|e| UpdaterError::Io(std::io::Error::other(e)))??
        };

        reporter.report(10, format!("Restoring {} byte image", image.len()));
        cancellable(
            cancel,
            self.inner.device.begin_restore(port, &image, |sent, total| {
                reporter.track(10, 95, sent as u64, total as u64, "Restoring");
            }),
        )
        .await
    }
}

fn resume_session(persisted: &UpdaterState, stager: &ReleaseStager) -> Result<Option<UpdateSession>> {
    let Some(pending) = &persisted.pending_release else {
        return Ok(None);
    };
    let Some(current) = persisted.current_version else {
        return Ok(None);
    };
    if !is_newer(current, pending.version) {
        return Ok(None);
    }

    let Some(staged) = stager.load_staged(pending.version)? else {
        warn!("Pending release {} is no longer staged", pending.version);
        return Ok(None);
    };
    if staged.root_dir != pending.root_dir {
        warn!(
            "Pending release moved from {} to {}, check again",
            pending.root_dir.display(),
            staged.root_dir.display()
        );
        return Ok(None);
    }

    info!("Resuming staged update {current} -> {}", pending.version);
    Ok(Some(UpdateSession {
        current_version: current,
        latest_version: pending.version,
        release: None,
        staged,
    }))
}
