//! Package download and verification.
//!
//! The payload is streamed to `<package>.part` in the staging directory,
//! renamed into place once complete, then verified. A package that fails
//! verification is deleted and never handed to the installer.

use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::integrity::verify_package;
use super::progress::{UpdatePhase, UpdateProgress};
use super::release::ReleaseDescriptor;
use crate::error::{Result, UpdateError};

/// Write granularity and progress accounting unit.
const CHUNK_SIZE: usize = 32 * 1024;

/// Downloads and verifies update packages.
pub struct ArtifactFetcher {
    client: reqwest::Client,
    staging_dir: PathBuf,
}

impl ArtifactFetcher {
    pub fn new(client: reqwest::Client, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
        }
    }

    /// Where `descriptor`'s package is staged.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Security`] if the package name would leave the
    /// staging directory.
    pub fn staged_path(&self, descriptor: &ReleaseDescriptor) -> Result<PathBuf> {
        Ok(self.staging_dir.join(descriptor.package_file_name()?))
    }

    /// Download, verify and return the staged package path.
    ///
    /// `on_progress` sees download progress (percent of the package) at most
    /// once per whole-percent change, then one `Verifying` report. An
    /// already-staged package that verifies is reused without a request.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Security`] if the package name is not a plain file name
    /// - [`UpdateError::Network`] if the descriptor has no URL, the request
    ///   fails, or the stream breaks
    /// - [`UpdateError::Integrity`] if size, digest or archive checks fail
    /// - [`UpdateError::Io`] if the staging file cannot be written
    ///
    /// In every error case the staged file is removed.
    pub async fn download<F>(&self, descriptor: &ReleaseDescriptor, mut on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(UpdateProgress) + Send,
    {
        if descriptor.download_url.is_empty() {
            return Err(UpdateError::Network(format!(
                "release {} has no package for this platform",
                descriptor.version
            )));
        }

        let target = self.staged_path(descriptor)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        if target.exists() {
            match verify_staged(&target, descriptor).await {
                Ok(()) => {
                    tracing::info!(path = %target.display(), "package already staged, skipping download");
                    on_progress(UpdateProgress {
                        total_size: descriptor.size_bytes,
                        downloaded: descriptor.size_bytes,
                        ..UpdateProgress::new(UpdatePhase::Downloading, "package already downloaded", 100.0)
                    });
                    return Ok(target);
                }
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "staged package invalid, downloading again");
                    remove_quietly(&target).await;
                }
            }
        }

        let partial = target.with_file_name(format!("{}.part", descriptor.package_file_name()?));
        if let Err(e) = self.stream_to(descriptor, &partial, &mut on_progress).await {
            remove_quietly(&partial).await;
            return Err(e.with_phase("download"));
        }
        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            remove_quietly(&partial).await;
            return Err(UpdateError::Io(format!(
                "cannot move package into {}: {e}",
                target.display()
            )));
        }

        on_progress(UpdateProgress::new(UpdatePhase::Verifying, "verifying package", 100.0));
        if let Err(e) = verify_staged(&target, descriptor).await {
            tracing::warn!(path = %target.display(), error = %e, "package failed verification, deleting");
            remove_quietly(&target).await;
            return Err(e.with_phase("verify"));
        }

        Ok(target)
    }

    async fn stream_to<F>(&self, descriptor: &ReleaseDescriptor, dest: &Path, on_progress: &mut F) -> Result<u64>
    where
        F: FnMut(UpdateProgress) + Send,
    {
        tracing::info!(url = %descriptor.download_url, "downloading package");
        let response = self
            .client
            .get(&descriptor.download_url)
            .send()
            .await
            .map_err(|e| UpdateError::Network(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "package download returned HTTP {}",
                response.status()
            )));
        }

        let total = response
            .content_length()
            .filter(|n| *n > 0)
            .unwrap_or(descriptor.size_bytes);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let mut downloaded: u64 = 0;
        let mut last_percent: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::Network(format!("stream interrupted: {e}")))?;
            for piece in chunk.chunks(CHUNK_SIZE) {
                file.write_all(piece).await?;
                downloaded += piece.len() as u64;

                if total == 0 {
                    continue;
                }
                let percent = (downloaded.saturating_mul(100) / total).min(100);
                if percent > last_percent {
                    last_percent = percent;
                    on_progress(download_progress(downloaded, total, started));
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        tracing::info!(bytes = downloaded, elapsed_ms = started.elapsed().as_millis() as u64, "download finished");
        Ok(downloaded)
    }
}

fn download_progress(downloaded: u64, total: u64, started: Instant) -> UpdateProgress {
    let elapsed = started.elapsed().as_secs_f64().max(0.001);
    let speed = (downloaded as f64 / elapsed) as u64;
    let eta_secs = if speed > 0 {
        total.saturating_sub(downloaded) / speed
    } else {
        0
    };
    let percent = downloaded as f64 / total as f64 * 100.0;
    UpdateProgress {
        total_size: total,
        downloaded,
        speed,
        eta_secs,
        ..UpdateProgress::new(
            UpdatePhase::Downloading,
            format!("downloading {percent:.1}%"),
            percent.min(100.0),
        )
    }
}

async fn verify_staged(path: &Path, descriptor: &ReleaseDescriptor) -> Result<()> {
    let path = path.to_path_buf();
    let size = descriptor.size_bytes;
    let checksum = descriptor.checksum.clone();
    tokio::task::spawn_blocking(move || verify_package(&path, size, checksum.as_deref()))
        .await
        .map_err(|e| UpdateError::Io(format!("verification task failed: {e}")))?
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove package file");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
