//! Resumable file downloads with digest verification.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Progress report for one file download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Remote path being fetched.
    pub url: String,
    /// Bytes on disk so far, including any resumed prefix.
    pub received: u64,
    /// Total size when the server reports one.
    pub total: Option<u64>,
}

/// Progress callback.
pub type ProgressFn = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Options controlling [`ModelCache::download_model`](crate::ModelCache::download_model).
#[derive(Default, Clone)]
pub struct DownloadOptions {
    /// Trust existing files without hashing them.
    pub skip_integrity_check: bool,
    /// Invoked after every received chunk.
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("skip_integrity_check", &self.skip_integrity_check)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Check whether a cached file already satisfies its manifest digest.
pub(crate) async fn is_file_valid(
    path: &Path,
    expected_sha1: &str,
    skip_integrity_check: bool,
) -> Result<bool, CacheError> {
    if !path.exists() {
        return Ok(false);
    }
    if skip_integrity_check {
        return Ok(true);
    }
    let digest = file_sha1(path).await?;
    Ok(digest.eq_ignore_ascii_case(expected_sha1))
}

/// SHA-1 of a file's contents, lowercase hex.
pub(crate) async fn file_sha1(path: &Path) -> Result<String, CacheError> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Download `url` to `dest`, resuming from the bytes already on disk.
///
/// A partial file is continued with an HTTP `Range` request; servers that
/// ignore the range (status 200) cause a clean restart. Ctrl-C stops the
/// transfer gracefully with [`CacheError::Interrupted`], leaving the
/// partial file in place for the next attempt. The Ctrl-C listener exists
/// only for the duration of the transfer.
pub(crate) async fn fetch_resumable(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    options: &DownloadOptions,
) -> Result<(), CacheError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let offset = match tokio::fs::metadata(dest).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(url);
    if offset > 0 {
        debug!(url, offset, "resuming download");
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    }
    let mut response = request.send().await.map_err(|e| CacheError::Request {
        url: url.to_owned(),
        message: e.to_string(),
    })?;

    // A corrupt-but-complete file resumes past the end; restart clean.
    if response.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
        tokio::fs::remove_file(dest).await?;
        response = client.get(url).send().await.map_err(|e| CacheError::Request {
            url: url.to_owned(),
            message: e.to_string(),
        })?;
    }

    let status = response.status();
    if !status.is_success() {
        return Err(CacheError::Http {
            status: status.as_u16(),
            url: url.to_owned(),
        });
    }

    // 206 means the server honored the range; anything else restarts.
    let resuming = status == reqwest::StatusCode::PARTIAL_CONTENT && offset > 0;
    let mut received = if resuming { offset } else { 0 };
    let total = response
        .content_length()
        .map(|len| len + if resuming { offset } else { 0 });

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(resuming)
        .write(true)
        .truncate(!resuming)
        .open(dest)
        .await?;

    let mut stream = response.bytes_stream();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                file.flush().await?;
                warn!(url, received, "download interrupted");
                return Err(CacheError::Interrupted);
            }
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                let chunk = chunk.map_err(|e| CacheError::Request {
                    url: url.to_owned(),
                    message: e.to_string(),
                })?;
                file.write_all(&chunk).await?;
                received += chunk.len() as u64;
                if let Some(progress) = &options.progress {
                    progress(&DownloadProgress {
                        url: url.to_owned(),
                        received,
                        total,
                    });
                }
            }
        }
    }

    file.flush().await?;
    debug!(url, received, "download complete");
    Ok(())
}
