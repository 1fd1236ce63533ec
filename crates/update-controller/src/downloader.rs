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

//! Streaming archive downloader

use crate::error::{Result, UpdaterError};
use crate::release_checker::{ReleaseDescriptor, ReleaseFetcher};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Removes a half-written file unless disarmed
#[derive(Debug)]
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl ReleaseFetcher {
    /// Stream the release archive to `destination_dir/<archive name>`
    ///
    /// Bytes land in `scratch_dir` first and are only moved into place once
    /// complete. `on_progress(downloaded, total)` fires after every chunk;
    /// `total` is `None` when the server declares no content length.
    pub async fn download_archive<F>(
        &self,
        release: &ReleaseDescriptor,
        scratch_dir: &Path,
        destination_dir: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        tokio::fs::create_dir_all(scratch_dir).await?;
        let final_path = destination_dir.join(&release.archive_name);
        let mut partial =
            PartialFile::new(scratch_dir.join(format!("{}.part", release.archive_name)));

        let mut request = self.client.get(&release.archive_url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            response = request.send() => response
                .map_err(|e| UpdaterError::Network(format!("Request failed: {e}")))?,
        };

        if !response.status().is_success() {
            return Err(UpdaterError::Remote {
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        if total.is_none() {
            tracing::debug!("No content length for {}, progress is indeterminate", release.archive_name);
        }

        let mut file = tokio::fs::File::create(partial.path()).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        on_progress(0, total);

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(UpdaterError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk.map_err(|e| UpdaterError::Network(format!("Download interrupted: {e}")))?;
            file.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;
            on_progress(downloaded, total);
        }

        if let Some(expected) = total
            && downloaded != expected
        {
            return Err(UpdaterError::Network(format!(
                "Download ended after {downloaded} of {expected} bytes"
            )));
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::create_dir_all(destination_dir).await?;
        tokio::fs::rename(partial.path(), &final_path).await?;
        partial.disarm();

        tracing::info!(
            "Downloaded {} ({downloaded} bytes) to {}",
            release.archive_name,
            final_path.display()
        );
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdaterConfig;
    use crate::version::SemVer;
    use mockito::{Server, ServerGuard};
    use tempfile::TempDir;

    fn fetcher(server: &ServerGuard) -> ReleaseFetcher {
        let config = UpdaterConfig {
            api_base_url: Some(server.url()),
            ..Default::default()
        };
        ReleaseFetcher::new(&config).unwrap()
    }

    fn descriptor(server: &ServerGuard) -> ReleaseDescriptor {
        ReleaseDescriptor {
            version: SemVer::new(1, 3, 0),
            tag: "v1.3.0".to_owned(),
            archive_url: format!("{}/download/fw.zip", server.url()),
            archive_name: "fw.zip".to_owned(),
            published_at: None,
        }
    }

    #[tokio::test]
    async fn test_download_reports_progress() {
        let mut server = Server::new_async().await;
        let body = vec![0xABu8; 10_000];
        let mock = server
            .mock("GET", "/download/fw.zip")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp");
        let release_dir = dir.path().join("releases").join("1.3.0");
        let mut events = Vec::new();
        let path = fetcher(&server)
            .download_archive(
                &descriptor(&server),
                &scratch,
                &release_dir,
                &CancellationToken::new(),
                |d, t| events.push((d, t)),
            )
            .await
            .unwrap();

        assert_eq!(path, release_dir.join("fw.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);

        assert_eq!(events.first(), Some(&(0, Some(10_000))));
        assert_eq!(events.last(), Some(&(10_000, Some(10_000))));
        assert!(events.windows(2).all(|w| w[0].0 <= w[1].0));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_without_content_length() {
        use std::io::Write as _;

        let mut server = Server::new_async().await;
        server
            .mock("GET", "/download/fw.zip")
            .with_status(200)
            .with_chunked_body(|w| {
                w.write_all(b"first chunk,")?;
                w.write_all(b"second chunk")
            })
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let mut totals = Vec::new();
        let path = fetcher(&server)
            .download_archive(
                &descriptor(&server),
                dir.path(),
                dir.path(),
                &CancellationToken::new(),
                |_, t| totals.push(t),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"first chunk,second chunk");
        assert!(totals.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_download_http_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/download/fw.zip")
            .with_status(500)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let err = fetcher(&server)
            .download_archive(
                &descriptor(&server),
                dir.path(),
                dir.path(),
                &CancellationToken::new(),
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Remote { status: 500 }));
        assert!(!dir.path().join("fw.zip").exists());
        assert!(!dir.path().join("fw.zip.part").exists());
    }

    #[tokio::test]
    async fn test_download_cancelled_leaves_nothing() {
        let server = Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(&server)
            .download_archive(&descriptor(&server), dir.path(), dir.path(), &cancel, |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Cancelled));
        assert!(!dir.path().join("fw.zip").exists());
        assert!(!dir.path().join("fw.zip.part").exists());
    }

    #[test]
    fn test_partial_file_removed_unless_disarmed() {
        let dir = TempDir::new().unwrap();
        let dropped = dir.path().join("dropped.part");
        let kept = dir.path().join("kept.part");
        std::fs::write(&dropped, b"half").unwrap();
        std::fs::write(&kept, b"whole").unwrap();

        drop(PartialFile::new(dropped.clone()));
        let mut guard = PartialFile::new(kept.clone());
        guard.disarm();
        drop(guard);

        assert!(!dropped.exists());
        assert!(kept.exists());
    }
}
