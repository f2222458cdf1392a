use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, UNIX_EPOCH},
};

use futures_util::StreamExt;
use md5::Context;
use reqwest::header::{CONTENT_RANGE, HeaderMap, IF_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::sync::catalog::CatalogEntry;
use crate::sync::paths::Layout;

const READ_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("partial metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("server answered range request from byte {offset} with {content_range:?}")]
    UnexpectedRange {
        offset: u64,
        content_range: Option<String>,
    },
    #[error("transfer ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("transfer aborted: {0}")]
    Aborted(String),
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Failures that leave a usable partial behind and may succeed on retry.
    pub fn is_interrupted(&self) -> bool {
        match self {
            TransferError::Request(_)
            | TransferError::Io(_)
            | TransferError::UnexpectedRange { .. }
            | TransferError::Incomplete { .. } => true,
            TransferError::Status { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::TOO_MANY_REQUESTS
                            | StatusCode::REQUEST_TIMEOUT
                            | StatusCode::RANGE_NOT_SATISFIABLE
                    )
            }
            TransferError::Json(_)
            | TransferError::IntegrityMismatch { .. }
            | TransferError::Aborted(_)
            | TransferError::Cancelled => false,
        }
    }
}

/// Consulted every `check_bytes` while writing; an `Err` aborts the transfer.
pub trait TransferGuard: Send + Sync {
    fn check(&self) -> Result<(), String>;
}

/// Upstream revision the bytes of a partial download belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PartialIdentity {
    url: String,
    size: u64,
    digest: Option<String>,
    etag: Option<String>,
    last_modified: Option<i64>,
}

impl PartialIdentity {
    fn for_entry(entry: &CatalogEntry) -> Self {
        Self {
            url: entry.url.to_string(),
            size: entry.size,
            digest: entry.digest.clone(),
            etag: entry.etag.clone(),
            last_modified: entry.last_modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes_transferred: u64,
    pub resumed_from: u64,
    /// md5 of the whole staged file.
    pub digest: String,
}

/// Concurrency is bounded by the caller.
#[derive(Clone)]
pub struct Downloader {
    http: Client,
    layout: Layout,
    check_bytes: u64,
}

impl Downloader {
    pub fn new(http: Client, layout: Layout, check_bytes: u64) -> Self {
        Self {
            http,
            layout,
            check_bytes: check_bytes.max(1),
        }
    }

    /// `received` grows by every body byte read from the network, including
    /// bytes of attempts that end in an error.
    pub async fn download(
        &self,
        entry: &CatalogEntry,
        guard: &dyn TransferGuard,
        cancel: &CancellationToken,
        received: &mut u64,
    ) -> Result<DownloadOutcome, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        tokio::fs::create_dir_all(self.layout.staging_dir()).await?;

        let partial = self.layout.partial_path(&entry.name);
        let offset = self.resumable_offset(entry).await?;
        let mut hasher = Context::new();
        if offset > 0 {
            hash_prefix(&partial, offset, &mut hasher).await?;
        }

        let (resumed_from, bytes_transferred) = if offset < entry.size {
            self.fetch(entry, &partial, offset, &mut hasher, guard, cancel, received)
                .await?
        } else {
            tracing::debug!(file = %entry.name, "partial download already complete");
            (offset, 0)
        };

        let digest = format!("{:x}", hasher.compute());
        if let Some(expected) = entry.digest.as_deref()
            && !expected.eq_ignore_ascii_case(&digest)
        {
            self.discard(&entry.name).await?;
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_ascii_lowercase(),
                actual: digest,
            });
        }

        Ok(DownloadOutcome {
            path: partial,
            bytes_transferred,
            resumed_from,
            digest,
        })
    }

    /// Removes the partial download of `name` and its sidecar.
    pub async fn discard(&self, name: &str) -> io::Result<()> {
        remove_if_exists(&self.layout.partial_path(name)).await?;
        remove_if_exists(&self.layout.partial_meta_path(name)).await
    }

    async fn resumable_offset(&self, entry: &CatalogEntry) -> Result<u64, TransferError> {
        let partial = self.layout.partial_path(&entry.name);
        let meta = self.layout.partial_meta_path(&entry.name);
        let identity = PartialIdentity::for_entry(entry);
        let stored = read_identity(&meta).await;
        let len = match tokio::fs::metadata(&partial).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        if stored.as_ref() == Some(&identity) && len <= entry.size {
            if len > 0 {
                tracing::info!(file = %entry.name, offset = len, "resuming partial download");
            }
            return Ok(len);
        }
        if len > 0 {
            tracing::info!(file = %entry.name, "discarding partial download of another revision");
        }
        remove_if_exists(&partial).await?;
        write_identity(&meta, &identity).await?;
        Ok(0)
    }

    async fn fetch(
        &self,
        entry: &CatalogEntry,
        partial: &Path,
        offset: u64,
        hasher: &mut Context,
        guard: &dyn TransferGuard,
        cancel: &CancellationToken,
        wire_bytes: &mut u64,
    ) -> Result<(u64, u64), TransferError> {
        let mut request = self.http.get(entry.url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
            if let Some(validator) = if_range_validator(entry) {
                request = request.header(IF_RANGE, validator);
            }
        }
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let (mut file, start) = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            check_content_range(response.headers(), offset)?;
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await?;
            (file, offset)
        } else if status.is_success() {
            if offset > 0 {
                tracing::info!(file = %entry.name, "server ignored range request, restarting");
                *hasher = Context::new();
            }
            (tokio::fs::File::create(partial).await?, 0)
        } else {
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                remove_if_exists(partial).await?;
            }
            return Err(TransferError::Status {
                status,
                url: entry.url.to_string(),
            });
        };

        let mut received = start;
        let mut since_check = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    file.flush().await?;
                    return Err(err.into());
                }
            };
            let len = chunk.len() as u64;
            *wire_bytes = wire_bytes.saturating_add(len);
            if received + len > entry.size {
                drop(file);
                self.discard(&entry.name).await?;
                return Err(TransferError::IntegrityMismatch {
                    expected: format!("{} bytes", entry.size),
                    actual: format!("more than {} bytes", received + len - 1),
                });
            }
            file.write_all(&chunk).await?;
            hasher.consume(&chunk);
            received += len;
            since_check += len;
            if since_check >= self.check_bytes {
                since_check = 0;
                if let Err(reason) = guard.check() {
                    file.flush().await?;
                    return Err(TransferError::Aborted(reason));
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        if received < entry.size {
            return Err(TransferError::Incomplete {
                received,
                expected: entry.size,
            });
        }
        Ok((start, received - start))
    }
}

/// Weak ETags cannot validate a byte range; fall back to the modification date.
fn if_range_validator(entry: &CatalogEntry) -> Option<String> {
    if let Some(etag) = entry.etag.as_deref()
        && !etag.starts_with("W/")
    {
        return Some(etag.to_string());
    }
    let secs = u64::try_from(entry.last_modified?).ok()?;
    Some(httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(secs)))
}

fn check_content_range(headers: &HeaderMap, offset: u64) -> Result<(), TransferError> {
    let value = headers
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok());
    match value {
        Some(range) if range.starts_with(&format!("bytes {offset}-")) => Ok(()),
        other => Err(TransferError::UnexpectedRange {
            offset,
            content_range: other.map(str::to_string),
        }),
    }
}

async fn hash_prefix(path: &Path, len: u64, hasher: &mut Context) -> io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = file.take(len);
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        hasher.consume(&buf[..read]);
    }
}

async fn read_identity(path: &Path) -> Option<PartialIdentity> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn write_identity(path: &Path, identity: &PartialIdentity) -> Result<(), TransferError> {
    let bytes = serde_json::to_vec_pretty(identity)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
