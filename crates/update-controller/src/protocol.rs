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

//! Device command protocol
//!
//! Commands are `\n`-terminated ASCII lines. Binary payloads travel as frames:
//! a 4-byte big-endian length followed by exactly that many bytes.
//!
//! | command   | host sends                                      | device replies          |
//! |-----------|-------------------------------------------------|-------------------------|
//! | `version` | -                                               | `X.Y.Z`                 |
//! | `backup`  | -                                               | frame(image)            |
//! | `update`  | `<count>`, then per file `<path>` + frame(data) | `OK`/`ERR ...` per file |
//! | `restore` | frame(image)                                    | `OK`/`ERR ...`          |
//!
//! Each call opens and closes its own connection. `update` keeps one
//! connection for the whole file sequence so the device sees a single
//! uninterrupted transfer.

use crate::error::{ProtocolError, Result, UpdaterError};
use crate::transport::{Connection, READ_TIMEOUT, SerialTransport};
use crate::version::SemVer;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CMD_VERSION: &str = "version";
pub const CMD_BACKUP: &str = "backup";
pub const CMD_UPDATE: &str = "update";
pub const CMD_RESTORE: &str = "restore";

/// Refuse to allocate for absurd length prefixes from a noisy line
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const WRITE_CHUNK: usize = 256;

/// One file of an update, addressed relative to the device filesystem root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFile {
    pub relative_path: String,
    pub content: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
enum Ack {
    Ok,
    Err(String),
    Unexpected(String),
}

fn parse_ack(line: &str) -> Ack {
    let line = line.trim();
    if line == "OK" {
        Ack::Ok
    } else if let Some(rest) = line.strip_prefix("ERR") {
        let reason = rest.trim();
        if reason.is_empty() {
            Ack::Err("device reported ERR".to_owned())
        } else {
            Ack::Err(reason.to_owned())
        }
    } else {
        Ack::Unexpected(line.to_owned())
    }
}

/// Silence on the line (timeout or closed port) is "no response"
fn no_response(err: UpdaterError) -> UpdaterError {
    match err {
        UpdaterError::Timeout(_) => ProtocolError::NoResponse.into(),
        UpdaterError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            ProtocolError::NoResponse.into()
        }
        other => other,
    }
}

/// Read until `buf` is full, the line goes quiet, or the port closes
async fn fill(conn: &mut Connection, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match conn.read_some(&mut buf[filled..], timeout).await {
            Ok(0) | Err(UpdaterError::Timeout(_)) => break,
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) async fn read_frame(conn: &mut Connection, timeout: Duration) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    match fill(conn, &mut header, timeout).await? {
        0 => return Err(ProtocolError::NoResponse.into()),
        4 => {}
        received => {
            return Err(ProtocolError::TruncatedStream {
                expected: 4,
                received,
            }
            .into());
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::UnexpectedReply(format!(
            "frame length {len} exceeds {MAX_FRAME_LEN}"
        ))
        .into());
    }

    let mut payload = vec![0u8; len];
    let received = fill(conn, &mut payload, timeout).await?;
    if received < len {
        return Err(ProtocolError::TruncatedStream {
            expected: len,
            received,
        }
        .into());
    }
    Ok(payload)
}

pub(crate) async fn write_frame<F>(conn: &mut Connection, payload: &[u8], mut on_chunk: F) -> Result<()>
where
    F: FnMut(usize, usize),
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        UpdaterError::Protocol(ProtocolError::UnexpectedReply(format!(
            "payload of {} bytes does not fit a frame",
            payload.len()
        )))
    })?;
    conn.write_bytes(&len.to_be_bytes()).await?;

    let mut sent = 0;
    for chunk in payload.chunks(WRITE_CHUNK) {
        conn.write_bytes(chunk).await?;
        sent += chunk.len();
        on_chunk(sent, payload.len());
    }
    Ok(())
}

/// Speaks the command protocol over short-lived connections
#[derive(Debug, Clone)]
pub struct DeviceClient {
    transport: SerialTransport,
    read_timeout: Duration,
}

impl DeviceClient {
    pub fn new(transport: SerialTransport) -> Self {
        Self {
            transport,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Override the per-read inactivity timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub async fn query_version(&self, port: &str) -> Result<SemVer> {
        let mut conn = self.transport.open(port).await?;
        conn.write_line(CMD_VERSION).await?;
        let line = conn
            .read_line(self.read_timeout)
            .await
            .map_err(no_response)?;

        let version = SemVer::parse(line.trim())
            .map_err(|_| ProtocolError::MalformedVersion(line.clone()))?;
        debug!("Device on {port} reports version {version}");
        Ok(version)
    }

    /// Pull the device's current image
    pub async fn begin_backup(&self, port: &str) -> Result<Vec<u8>> {
        let mut conn = self.transport.open(port).await?;
        conn.write_line(CMD_BACKUP).await?;
        let image = read_frame(&mut conn, self.read_timeout).await?;
        info!("Received {} byte backup image from {port}", image.len());
        Ok(image)
    }

    /// Push `files` in order, waiting for an acknowledgement after each one
    ///
    /// `on_file_done(completed, total)` fires after every `OK`. The first
    /// `ERR`, unexpected reply or silence aborts the transfer; the remaining
    /// files are never sent. [`UpdaterError::FileRejected::index`] is 1-based.
    pub async fn begin_update<F>(&self, port: &str, files: &[UpdateFile], mut on_file_done: F) -> Result<()>
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = files.len();
        let mut conn = self.transport.open(port).await?;
        conn.write_line(CMD_UPDATE).await?;
        conn.write_line(&total.to_string()).await?;

        for (i, file) in files.iter().enumerate() {
            let index = i + 1;
            let rejected = |reason: String| UpdaterError::FileRejected {
                index,
                path: file.relative_path.clone(),
                reason,
            };

            debug!(
                "Sending file {index}/{total}: {} ({} bytes)",
                file.relative_path,
                file.content.len()
            );
            conn.write_line(&file.relative_path).await?;
            write_frame(&mut conn, &file.content, |_, _| {}).await?;

            let reply = match conn.read_line(self.read_timeout).await {
                Ok(line) => line,
                Err(UpdaterError::Timeout(_)) => {
                    return Err(rejected("no acknowledgement from device".to_owned()));
                }
                Err(UpdaterError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(rejected("port closed before acknowledgement".to_owned()));
                }
                Err(e) => return Err(e),
            };

            match parse_ack(&reply) {
                Ack::Ok => on_file_done(index, total),
                Ack::Err(reason) => {
                    warn!("Device rejected {}: {reason}", file.relative_path);
                    return Err(rejected(reason));
                }
                Ack::Unexpected(line) => {
                    return Err(rejected(format!("unexpected reply {line:?}")));
                }
            }
        }

        info!("Transferred {total} files to {port}");
        conn.close().await?;
        Ok(())
    }

    /// Push a backup image back; `on_progress(sent, total)` fires per chunk
    pub async fn begin_restore<F>(&self, port: &str, image: &[u8], on_progress: F) -> Result<()>
    where
        F: FnMut(usize, usize) + Send,
    {
        let mut conn = self.transport.open(port).await?;
        conn.write_line(CMD_RESTORE).await?;
        write_frame(&mut conn, image, on_progress).await?;

        let reply = conn
            .read_line(self.read_timeout)
            .await
            .map_err(no_response)?;
        match parse_ack(&reply) {
            Ack::Ok => {
                info!("Device on {port} restored {} byte image", image.len());
                conn.close().await?;
                Ok(())
            }
            Ack::Err(reason) => Err(ProtocolError::Rejected(reason).into()),
            Ack::Unexpected(line) => Err(ProtocolError::UnexpectedReply(line).into()),
        }
    }
}
