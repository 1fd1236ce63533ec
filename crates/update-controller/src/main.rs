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

//! Update Controller - command line front end
//!
//! Each command runs one operation to completion. A check stages the release
//! and records it in the state file, so `install` can run in a later
//! invocation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use update_controller::backup::BackupManager;
use update_controller::config::DEFAULT_CONFIG_PATH;
use update_controller::protocol::DeviceClient;
use update_controller::transport::{SerialTransport, list_ports};
use update_controller::{Orchestrator, Outcome, UpdateEvent, load_config};

#[derive(Parser)]
#[command(name = "update-controller")]
#[command(about = "Check, install and roll back firmware on a serial-attached device", long_about = None)]
struct Cli {
    /// Path to the JSON config (created with defaults if it doesn't exist)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available serial ports
    Ports,
    /// Query the device version and stage the latest release
    Check {
        #[arg(short, long)]
        port: String,
    },
    /// Back up the device, then send the staged release
    Install {
        #[arg(short, long)]
        port: String,
    },
    /// Restore the most recent backup
    Rollback {
        #[arg(short, long)]
        port: String,
    },
    /// List backups, newest first
    Backups,
    /// Print the persisted controller state
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("update_controller=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Command::Ports = cli.command {
        print_ports()?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    info!(
        "Loaded config: repo={}, data_dir={}",
        config.github_repo,
        config.data_dir.display()
    );

    if let Command::Backups = cli.command {
        print_backups(&BackupManager::new(config.backups_dir()))?;
        return Ok(ExitCode::SUCCESS);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let device = DeviceClient::new(SerialTransport::system());
    let orchestrator = Orchestrator::new(&config, device, tx).context("Failed to initialise controller")?;
    let renderer = tokio::spawn(render(rx));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    let outcome = match cli.command {
        Command::Check { port } => Some(orchestrator.spawn_check(port, cancel).await?),
        Command::Install { port } => Some(orchestrator.spawn_install(port, cancel).await?),
        Command::Rollback { port } => Some(orchestrator.spawn_rollback(port, cancel).await?),
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
            None
        }
        Command::Ports | Command::Backups => None,
    };

    // Closing the event channel ends the renderer
    drop(orchestrator);
    renderer.await?;

    Ok(outcome.as_ref().map_or(ExitCode::SUCCESS, summarize))
}

async fn render(mut events: mpsc::UnboundedReceiver<UpdateEvent>) {
    while let Some(event) = events.recv().await {
        if let UpdateEvent::Progress {
            operation,
            percent,
            message,
        } = event
        {
            println!("[{operation} {percent:>3}%] {message}");
        }
    }
}

fn summarize(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::UpToDate { current } => println!("Device is up to date ({current})"),
        Outcome::UpdateAvailable { current, latest } => {
            println!("Update available: {current} -> {latest}. Run `install` to apply it.");
        }
        Outcome::Installed { version } => println!("Installed {version}"),
        Outcome::RolledBack { backup } => println!("Restored {}", backup.display()),
        Outcome::Failed(report) => {
            eprintln!("{}: {}", report.kind, report.message);
            if report.rollback_recommended {
                eprintln!(
                    "The device may be left in an inconsistent state. \
                     Run `update-controller rollback --port <PORT>` to restore the last backup."
                );
            }
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}\t{vid:04x}:{pid:04x}\t{}",
                port.name,
                port.product.or(port.manufacturer).unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
    Ok(())
}

fn print_backups(backups: &BackupManager) -> Result<()> {
    let list = backups.list()?;
    if list.is_empty() {
        println!("No backups in {}", backups.dir().display());
        return Ok(());
    }
    for backup in list {
        let created = backup
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        println!("{created}\t{}", backup.path.display());
    }
    Ok(())
}
