use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use md5::Context;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::sync::paths::Layout;

const COPY_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("corrupt compressed stream {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unpack cancelled")]
    Cancelled,
    #[error("unpack task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Bzip2,
    Gzip,
    None,
}

impl Compression {
    pub fn detect(name: &str) -> Self {
        if name.ends_with(".bz2") {
            Compression::Bzip2
        } else if name.ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// `pages-articles.xml.bz2` unpacks to `pages-articles.xml`.
    pub fn artifact_name(name: &str) -> String {
        name.strip_suffix(".bz2")
            .or_else(|| name.strip_suffix(".gz"))
            .unwrap_or(name)
            .to_string()
    }

    fn magic(&self) -> &'static [u8] {
        match self {
            Compression::Bzip2 => b"BZh",
            Compression::Gzip => &[0x1f_u8, 0x8b],
            Compression::None => b"",
        }
    }
}

/// Unpacked output waiting in staging for promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub name: String,
    pub dir: PathBuf,
    pub artifact_name: String,
    pub artifact_size: u64,
    pub artifact_digest: String,
    pub original: PathBuf,
    pub unpacked_at: i64,
}

#[derive(Debug, Clone)]
pub struct Unpacker {
    layout: Layout,
}

impl Unpacker {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub async fn unpack(
        &self,
        name: &str,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact, UnpackError> {
        let dir = self.layout.unpack_dir(name);
        self.discard(name).await?;
        tokio::fs::create_dir_all(&dir).await?;

        let compression = Compression::detect(name);
        let artifact_name = Compression::artifact_name(name);
        let target = dir.join(&artifact_name);
        let input = source.to_path_buf();
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            unpack_blocking(compression, &input, &target, &token)
        })
        .await
        .map_err(UnpackError::from)
        .and_then(|inner| inner);

        let (artifact_size, artifact_digest) = match result {
            Ok(done) => done,
            Err(err) => {
                self.discard(name).await?;
                return Err(err);
            }
        };
        tracing::debug!(file = %name, artifact = %artifact_name, size = artifact_size, "unpacked");

        Ok(StagedArtifact {
            name: name.to_string(),
            dir,
            artifact_name,
            artifact_size,
            artifact_digest,
            original: source.to_path_buf(),
            unpacked_at: crate::sync::now_unix(),
        })
    }

    pub async fn discard(&self, name: &str) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.layout.unpack_dir(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn unpack_blocking(
    compression: Compression,
    source: &Path,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(u64, String), UnpackError> {
    let mut input = BufReader::with_capacity(COPY_BUFFER_BYTES, File::open(source)?);
    let head = input.fill_buf()?;
    if !head.starts_with(compression.magic()) {
        return Err(UnpackError::Corrupt {
            path: source.to_path_buf(),
            reason: "missing stream header".into(),
        });
    }

    let mut reader: Box<dyn Read> = match compression {
        Compression::Bzip2 => Box::new(MultiBzDecoder::new(input)),
        Compression::Gzip => Box::new(MultiGzDecoder::new(input)),
        Compression::None => Box::new(input),
    };
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_BYTES, File::create(target)?);
    let mut hasher = Context::new();
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }
        let read = match reader.read(&mut buf) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if compression != Compression::None && is_stream_error(&err) => {
                return Err(UnpackError::Corrupt {
                    path: source.to_path_buf(),
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read])?;
        hasher.consume(&buf[..read]);
        written += read as u64;
    }

    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    Ok((written, format!("{:x}", hasher.compute())))
}

// Decoder failures carry no OS error code; failures of the underlying file do.
fn is_stream_error(err: &io::Error) -> bool {
    err.raw_os_error().is_none()
}
