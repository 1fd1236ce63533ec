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

//! Scripted in-memory device for tests

use crate::error::{Result, UpdaterError};
use crate::transport::{PortOpener, SerialIo, SerialTransport};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

pub(crate) const FAKE_PORT: &str = "/dev/ttyFAKE";

#[derive(Debug, Clone)]
pub(crate) struct DeviceBehavior {
    /// Reply to `version`; `None` stays silent
    pub version: Option<String>,
    /// Image sent for `backup`; `None` stays silent
    pub backup_image: Option<Vec<u8>>,
    /// Declare the full image length but only send this many bytes
    pub truncate_backup_to: Option<usize>,
    /// 1-based file index answered with `ERR write failed`
    pub reject_file: Option<usize>,
    /// 1-based file index that never gets acknowledged
    pub silent_on_file: Option<usize>,
    /// Final reply to `restore`; `None` stays silent
    pub restore_reply: Option<String>,
}

impl Default for DeviceBehavior {
    fn default() -> Self {
        Self {
            version: Some("1.2.0".to_owned()),
            backup_image: Some(b"current device image".to_vec()),
            truncate_backup_to: None,
            reject_file: None,
            silent_on_file: None,
            restore_reply: Some("OK".to_owned()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceLog {
    pub opens: usize,
    pub commands: Vec<String>,
    pub files: Vec<(String, Vec<u8>)>,
    pub restored: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeDevice {
    behavior: Arc<Mutex<DeviceBehavior>>,
    log: Arc<Mutex<DeviceLog>>,
}

impl FakeDevice {
    pub(crate) fn new(behavior: DeviceBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }

    pub(crate) fn transport(&self) -> SerialTransport {
        SerialTransport::new(Arc::new(self.clone()))
    }

    pub(crate) fn log(&self) -> DeviceLog {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn update_behavior(&self, f: impl FnOnce(&mut DeviceBehavior)) {
        f(&mut self.behavior.lock().unwrap());
    }
}

#[async_trait]
impl PortOpener for FakeDevice {
    async fn open(&self, port: &str) -> Result<Box<dyn SerialIo>> {
        if port != FAKE_PORT {
            return Err(UpdaterError::Connection {
                port: port.to_owned(),
                reason: "No such file or directory".to_owned(),
            });
        }
        self.log.lock().unwrap().opens += 1;

        let (host, device) = tokio::io::duplex(64 * 1024);
        let behavior = self.behavior.lock().unwrap().clone();
        tokio::spawn(serve(BufReader::new(device), behavior, Arc::clone(&self.log)));
        Ok(Box::new(host))
    }
}

async fn read_frame(io: &mut BufReader<DuplexStream>) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    io.read_exact(&mut header).await?;
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn read_line(io: &mut BufReader<DuplexStream>) -> Option<String> {
    let mut line = String::new();
    match io.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end().to_owned()),
    }
}

async fn reply(io: &mut BufReader<DuplexStream>, line: &str) -> std::io::Result<()> {
    let stream = io.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

async fn serve(mut io: BufReader<DuplexStream>, behavior: DeviceBehavior, log: Arc<Mutex<DeviceLog>>) {
    while let Some(command) = read_line(&mut io).await {
        log.lock().unwrap().commands.push(command.clone());

        let result = match command.as_str() {
            "version" => match &behavior.version {
                Some(v) => reply(&mut io, v).await,
                None => Ok(()),
            },
            "backup" => match &behavior.backup_image {
                Some(image) => {
                    let sent = behavior.truncate_backup_to.unwrap_or(image.len());
                    let stream = io.get_mut();
                    let header = (image.len() as u32).to_be_bytes();
                    async {
                        stream.write_all(&header).await?;
                        stream.write_all(&image[..sent]).await?;
                        stream.flush().await
                    }
                    .await
                }
                None => Ok(()),
            },
            "update" => serve_update(&mut io, &behavior, &log).await,
            "restore" => match read_frame(&mut io).await {
                Ok(image) => {
                    log.lock().unwrap().restored.push(image);
                    match &behavior.restore_reply {
                        Some(r) => reply(&mut io, r).await,
                        None => Ok(()),
                    }
                }
                Err(e) => Err(e),
            },
            _ => reply(&mut io, "ERR unknown command").await,
        };

        if result.is_err() {
            return;
        }
    }
}

async fn serve_update(
    io: &mut BufReader<DuplexStream>,
    behavior: &DeviceBehavior,
    log: &Arc<Mutex<DeviceLog>>,
) -> std::io::Result<()> {
    let Some(count) = read_line(io).await.and_then(|c| c.parse::<usize>().ok()) else {
        return reply(io, "ERR bad count").await;
    };

    for index in 1..=count {
        let Some(path) = read_line(io).await else {
            return Ok(());
        };
        let content = read_frame(io).await?;
        log.lock().unwrap().files.push((path, content));

        if behavior.reject_file == Some(index) {
            return reply(io, "ERR write failed").await;
        }
        if behavior.silent_on_file == Some(index) {
            return Ok(());
        }
        reply(io, "OK").await?;
    }
    Ok(())
}
