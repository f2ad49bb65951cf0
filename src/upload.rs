//! Generic remote-upload plugin slot (spec ref: SPEC_FULL.md §1
//! collaborators, "a generic remote-upload plugin slot" — e.g. pushing a
//! downloaded asset on to a third-party media server). Out of scope as a
//! concrete backend (spec.md Non-goals exclude specific upload plugins),
//! but the capability trait is ambient plumbing like `notify.rs`/`heic.rs`.
//!
//! Grounded in the teacher's `upload.rs`: a retrying client around a
//! streamed `reqwest::Body`, built once and reused across calls, with the
//! same attempt/backoff split between retryable (timeout, connect, 5xx,
//! 429) and fatal failures.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::time::sleep;
use tokio_util::io::ReaderStream;

const MAX_ATTEMPTS: usize = 6;
const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 30_000;

#[async_trait]
pub trait UploadTarget: Send + Sync {
    /// Uploads the already-downloaded file at `local_path` under
    /// `remote_name`. Implementations decide how that name maps onto their
    /// own namespace (object key, album id, ...).
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()>;
}

/// No remote-upload plugin configured; every downloaded asset stays local
/// only, which is the default for this crate.
pub struct NoopUploadTarget;

#[async_trait]
impl UploadTarget for NoopUploadTarget {
    async fn upload(&self, _local_path: &Path, _remote_name: &str) -> Result<()> {
        Ok(())
    }
}

struct AttemptError {
    error: anyhow::Error,
    retryable: bool,
}

impl AttemptError {
    fn fatal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self { error: err.into(), retryable: false }
    }

    fn retryable<E: Into<anyhow::Error>>(err: E) -> Self {
        Self { error: err.into(), retryable: true }
    }
}

/// Streams a file to a plain HTTP PUT endpoint, e.g. a presigned object
/// storage URL. One concrete, testable implementation of `UploadTarget`;
/// third-party media-server plugins (spec.md Non-goal) would implement the
/// same trait without touching `sync.rs`.
pub struct HttpPutUploadTarget {
    client: Client,
    base_url: String,
}

impl HttpPutUploadTarget {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().user_agent("icloudpd-rs/0.1").build()?;
        Ok(Self { client, base_url: base_url.into() })
    }

    async fn try_upload(&self, local_path: &Path, remote_name: &str) -> std::result::Result<(), AttemptError> {
        let metadata = tokio::fs::metadata(local_path).await.map_err(AttemptError::fatal)?;
        let file = File::open(local_path).await.map_err(AttemptError::fatal)?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&metadata.len().to_string()).map_err(AttemptError::fatal)?,
        );

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), remote_name.trim_start_matches('/'));
        let response = self.client.put(&url).headers(headers).body(body).send().await;
        let response = match response {
            Ok(resp) => resp,
            Err(err) => {
                if err.is_timeout() || err.is_connect() {
                    return Err(AttemptError::retryable(err));
                }
                return Err(AttemptError::fatal(err));
            }
        };

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_else(|_| "<unavailable>".to_string());
        let err = anyhow::anyhow!("upload failed with status {status} for {remote_name}: {text}");
        if should_retry_status(status) {
            Err(AttemptError::retryable(err))
        } else {
            Err(AttemptError::fatal(err))
        }
    }
}

#[async_trait]
impl UploadTarget for HttpPutUploadTarget {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);
        for attempt in 0..MAX_ATTEMPTS {
            match self.try_upload(local_path, remote_name).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let attempts_left = MAX_ATTEMPTS - attempt - 1;
                    if err.retryable && attempts_left > 0 {
                        tracing::warn!(error = %err.error, attempt = attempt + 1, "upload failed, retrying");
                        sleep(delay).await;
                        delay = std::cmp::min(delay * 2, Duration::from_millis(MAX_DELAY_MS));
                        continue;
                    }
                    return Err(err.error);
                }
            }
        }
        unreachable!("retry loop returns before exhausting attempts")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_target_never_fails() {
        let target = NoopUploadTarget;
        let result = target.upload(Path::new("/does/not/exist"), "whatever").await;
        assert!(result.is_ok());
    }

    #[test]
    fn retry_status_covers_429_and_5xx() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_retry_status(StatusCode::NOT_FOUND));
    }
}
