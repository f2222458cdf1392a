use std::collections::HashMap;

use futures_util::future::try_join_all;
use serde::Serialize;
use thiserror::Error;
use url::Url;
use wikidump_core::{ChecksumLine, DumpsClient, DumpsError, ErrorClass, split_dump_name};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(#[source] DumpsError),
    #[error("catalog malformed: {0}")]
    Malformed(String),
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Unavailable(err) => err.is_retryable(),
            CatalogError::Malformed(_) => false,
        }
    }
}

impl From<DumpsError> for CatalogError {
    fn from(err: DumpsError) -> Self {
        match err.classification() {
            ErrorClass::Malformed => CatalogError::Malformed(err.to_string()),
            ErrorClass::Transient | ErrorClass::Permanent => CatalogError::Unavailable(err),
        }
    }
}

/// Remote state of one tracked file for the current attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Tracked name, e.g. `pages-articles.xml.bz2`.
    pub name: String,
    pub url: Url,
    pub size: u64,
    pub digest: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
    /// `YYYYMMDD` of the dump run the listing belongs to.
    pub dump_date: Option<String>,
}

pub struct CatalogFetcher {
    client: DumpsClient,
    tracked: Vec<String>,
    verify_checksums: bool,
}

impl CatalogFetcher {
    pub fn new(client: DumpsClient, tracked: Vec<String>, verify_checksums: bool) -> Self {
        Self {
            client,
            tracked,
            verify_checksums,
        }
    }

    /// Files the edition does not publish are left out of the result.
    pub async fn fetch(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let listing = self.client.fetch_checksums().await?.unwrap_or_default();
        let sums = index_checksums(&listing, self.client.language());

        let heads = try_join_all(self.tracked.iter().map(|suffix| async move {
            let remote = self
                .client
                .head_file(&self.client.file_name(suffix))
                .await?;
            Ok::<_, DumpsError>((suffix, remote))
        }))
        .await?;

        let mut entries = Vec::with_capacity(heads.len());
        for (suffix, remote) in heads {
            let Some(remote) = remote else {
                tracing::debug!(file = %suffix, "not published for this edition");
                continue;
            };
            let listed = sums.get(suffix.as_str());
            entries.push(CatalogEntry {
                name: suffix.clone(),
                url: remote.url,
                size: remote.size,
                digest: listed
                    .filter(|_| self.verify_checksums)
                    .map(|(digest, _)| digest.to_string()),
                etag: remote.etag,
                last_modified: remote.last_modified,
                dump_date: listed.and_then(|(_, stamp)| *stamp).map(str::to_string),
            });
        }
        Ok(entries)
    }
}

/// Maps tracked suffix to `(digest, dump date)`.
fn index_checksums<'a>(
    listing: &'a [ChecksumLine],
    language: &str,
) -> HashMap<&'a str, (&'a str, Option<&'a str>)> {
    let mut out = HashMap::new();
    for line in listing {
        let Some((stamp, suffix)) = split_dump_name(&line.file_name, language) else {
            continue;
        };
        let date = (stamp.len() == 8 && stamp.bytes().all(|b| b.is_ascii_digit())).then_some(stamp);
        out.insert(suffix, (line.digest.as_str(), date));
    }
    out
}
