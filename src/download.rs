//! Resumable asset downloader (spec ref: §4.5 Downloader).
//!
//! Grounded in `icloudpd/download.py::download_media`: directories are
//! created before the transfer, the retry loop treats "Invalid global
//! session" specially (triggering re-auth instead of a backoff sleep), and
//! the file lands via a `.part` temp name renamed into place, with mtime
//! set to the asset's creation date. `.part` resume via a `Range` header is
//! a supplement beyond what the original does (it always restarts from
//! byte zero); see DESIGN.md.

use crate::error::SyncError;
use crate::transport::Transport;
use anyhow::{Context, Result};
use reqwest::Method;
use std::path::Path;
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

const MAX_RETRIES: usize = 5;
const WAIT_SECONDS: u64 = 5;

pub enum DownloadOutcome {
    Downloaded,
    DryRun,
    MissingUrl,
    IoError,
}

pub struct Downloader {
    transport: Transport,
    dry_run: bool,
}

impl Downloader {
    pub fn new(transport: Transport, dry_run: bool) -> Self {
        Self { transport, dry_run }
    }

    /// Downloads `url` to `destination`, retrying through transient
    /// failures and session expiry. `reauthenticate` is called in place of
    /// the original's `icloud.authenticate()` when a response signals an
    /// expired session.
    pub async fn download_media<F, Fut>(
        &self,
        url: &str,
        destination: &Path,
        created: OffsetDateTime,
        reauthenticate: F,
    ) -> Result<DownloadOutcome>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if let Some(parent) = destination.parent() {
            if self.dry_run {
                if !parent.exists() {
                    tracing::info!(dir = %parent.display(), "dry-run: would create folder hierarchy");
                }
            } else if let Err(err) = fs::create_dir_all(parent).await {
                tracing::error!(dir = %parent.display(), error = %err, "could not create folder");
                return Ok(DownloadOutcome::IoError);
            }
        }

        if self.dry_run {
            tracing::info!(path = %destination.display(), "dry-run: would download");
            return Ok(DownloadOutcome::DryRun);
        }

        for attempt in 0..MAX_RETRIES {
            match self.try_download(url, destination).await {
                Ok(()) => {
                    set_mtime(destination, created)?;
                    return Ok(DownloadOutcome::Downloaded);
                }
                Err(err) => {
                    if is_session_expired(&err) {
                        tracing::error!("session error, re-authenticating");
                        if attempt > 0 {
                            sleep(Duration::from_secs(WAIT_SECONDS)).await;
                        }
                        reauthenticate().await?;
                    } else {
                        let wait = Duration::from_secs(WAIT_SECONDS * (attempt as u64 + 1));
                        tracing::error!(error = %err, wait = ?wait, "error downloading, retrying");
                        sleep(wait).await;
                    }
                }
            }
        }

        tracing::error!(url, "could not download after retries, giving up");
        Ok(DownloadOutcome::IoError)
    }

    /// One attempt: streams the response body to `<dest>.part`, resuming
    /// from an existing partial file via `Range` when present, then renames
    /// atomically into place.
    async fn try_download(&self, url: &str, destination: &Path) -> Result<(), SyncError> {
        let part_path = part_path(destination);
        let existing_len = fs::metadata(&part_path).await.map(|m| m.len()).unwrap_or(0);

        let extra_headers: Vec<(&str, String)> = if existing_len > 0 {
            vec![("Range", format!("bytes={existing_len}-"))]
        } else {
            Vec::new()
        };

        let mut response = self.transport.get_stream(url, &extra_headers).await?;

        let append = existing_len > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let mut file = if append {
            tokio::fs::OpenOptions::new().append(true).open(&part_path).await
        } else {
            tokio::fs::File::create(&part_path).await
        }
        .map_err(SyncError::DownloadIo)?;

        while let Some(chunk) = response.chunk().await.map_err(|err| SyncError::Connection(crate::error::ConnectionError::Request(err)))? {
            file.write_all(&chunk).await.map_err(SyncError::DownloadIo)?;
        }
        file.flush().await.map_err(SyncError::DownloadIo)?;
        drop(file);

        fs::rename(&part_path, destination)
            .await
            .map_err(SyncError::DownloadIo)?;
        Ok(())
    }
}

fn part_path(destination: &Path) -> std::path::PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    std::path::PathBuf::from(name)
}

fn is_session_expired(err: &SyncError) -> bool {
    err.is_session_expired()
}

fn set_mtime(path: &Path, created: OffsetDateTime) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("reopening {} to set mtime", path.display()))?;
    let system_time = SystemTime::UNIX_EPOCH + Duration::from_secs(created.unix_timestamp().max(0) as u64);
    file.set_modified(system_time).with_context(|| format!("setting mtime on {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        let dest = Path::new("/tmp/photos/IMG_0001.JPG");
        assert_eq!(part_path(dest), Path::new("/tmp/photos/IMG_0001.JPG.part"));
    }

    #[test]
    fn session_expired_detection_matches_api_error_substring() {
        let err = SyncError::Api { code: "Unknown".to_string(), reason: "Invalid global session".to_string() };
        assert!(is_session_expired(&err));
        let other = SyncError::Api { code: "Unknown".to_string(), reason: "some other error".to_string() };
        assert!(!is_session_expired(&other));
    }
}
