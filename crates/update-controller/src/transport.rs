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

//! Byte-level serial transport
//!
//! A [`Connection`] is a claimed, buffered byte stream to one port. It knows
//! about lines and raw bytes, nothing about commands or frames. Only one
//! connection per [`SerialTransport`] can exist at a time; the claim is
//! released when the connection is dropped, on every exit path.

use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

pub const BAUD_RATE: u32 = 9600;
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Anything that can stand in for a serial port
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

#[async_trait]
pub trait PortOpener: Send + Sync + fmt::Debug {
    async fn open(&self, port: &str) -> Result<Box<dyn SerialIo>>;
}

/// Opens real serial devices at 9600 8N1
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

#[async_trait]
impl PortOpener for SystemPortOpener {
    async fn open(&self, port: &str) -> Result<Box<dyn SerialIo>> {
        let builder = tokio_serial::new(port, BAUD_RATE).timeout(READ_TIMEOUT);
        let stream =
            tokio_serial::SerialStream::open(&builder).map_err(|e| UpdaterError::Connection {
                port: port.to_owned(),
                reason: e.to_string(),
            })?;

        #[cfg(unix)]
        let stream = {
            let mut stream = stream;
            stream
                .set_exclusive(true)
                .map_err(|e| UpdaterError::Connection {
                    port: port.to_owned(),
                    reason: format!("cannot claim port: {e}"),
                })?;
            stream
        };

        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Enumerate serial ports visible to the OS
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports().map_err(|e| UpdaterError::Connection {
        port: "*".to_owned(),
        reason: format!("cannot enumerate ports: {e}"),
    })?;

    let mut infos: Vec<PortInfo> = ports
        .into_iter()
        .map(|p| match p.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => PortInfo {
                name: p.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => PortInfo {
                name: p.port_name,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            },
        })
        .collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
}

/// Hands out at most one [`Connection`] at a time
#[derive(Debug, Clone)]
pub struct SerialTransport {
    opener: Arc<dyn PortOpener>,
    claim: Arc<Mutex<()>>,
}

impl SerialTransport {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            claim: Arc::new(Mutex::new(())),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemPortOpener))
    }

    pub async fn open(&self, port: &str) -> Result<Connection> {
        let claim = Arc::clone(&self.claim)
            .try_lock_owned()
            .map_err(|_| UpdaterError::Connection {
                port: port.to_owned(),
                reason: "port already in use by another exchange".to_owned(),
            })?;

        let io = self.opener.open(port).await?;
        debug!("Opened {port}");

        Ok(Connection {
            port: port.to_owned(),
            stream: BufReader::new(io),
            _claim: claim,
        })
    }
}

pub struct Connection {
    port: String,
    stream: BufReader<Box<dyn SerialIo>>,
    _claim: OwnedMutexGuard<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Write `line` followed by `\n`
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("{} <- {line:?}", self.port);
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read up to the next `\n`, without the terminator or a trailing `\r`
    ///
    /// Fails with [`UpdaterError::Timeout`] if no terminator arrives in time.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(timeout, self.stream.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| UpdaterError::Timeout(timeout))??;

        if read == 0 || buf.last() != Some(&b'\n') {
            return Err(UpdaterError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed mid-line", self.port),
            )));
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        trace!("{} -> {line:?}", self.port);
        Ok(line)
    }

    /// Read whatever is available into `buf`, waiting at most `timeout`
    ///
    /// Returns 0 at end of stream.
    pub async fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = tokio::time::timeout(timeout, self.stream.read(buf))
            .await
            .map_err(|_| UpdaterError::Timeout(timeout))??;
        Ok(n)
    }

    /// Flush and shut down the write side
    pub async fn close(mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("Closed {}", self.port);
    }
}
