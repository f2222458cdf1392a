use std::time::{Duration, UNIX_EPOCH};

use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::checksums::{ChecksumLine, parse_checksums};

pub const DEFAULT_BASE_URL: &str = "https://dumps.wikimedia.org";
pub const DEFAULT_USER_AGENT: &str = concat!("WikiSync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum DumpsError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("response for {url} has no {header} header")]
    MissingHeader { url: String, header: &'static str },
    #[error("response for {url} has invalid {header} header: {value}")]
    InvalidHeader {
        url: String,
        header: &'static str,
        value: String,
    },
    #[error("malformed checksum listing at line {line}: {content}")]
    MalformedChecksums { line: usize, content: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failures, timeouts, 5xx and rate limiting.
    Transient,
    /// The server answered but the listing does not have the expected shape.
    Malformed,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Metadata of one dump file as reported by a `HEAD` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFile {
    pub name: String,
    pub url: Url,
    pub size: u64,
    pub etag: Option<String>,
    /// Unix seconds parsed from `Last-Modified`.
    pub last_modified: Option<i64>,
}

#[derive(Clone)]
pub struct DumpsClient {
    http: Client,
    base_url: Url,
    language: String,
}

impl DumpsClient {
    pub fn new(language: impl Into<String>) -> Result<Self, DumpsError> {
        Self::with_base_url(DEFAULT_BASE_URL, language)
    }

    pub fn with_base_url(base_url: &str, language: impl Into<String>) -> Result<Self, DumpsError> {
        Self::with_options(base_url, language, &ClientOptions::default())
    }

    pub fn with_options(
        base_url: &str,
        language: impl Into<String>,
        options: &ClientOptions,
    ) -> Result<Self, DumpsError> {
        let http = Client::builder()
            .user_agent(options.user_agent.clone())
            .timeout(options.timeout)
            .build()?;
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            language: language.into(),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// `https://dumps.wikimedia.org/enwiki/latest/`
    pub fn directory_url(&self) -> Result<Url, DumpsError> {
        Ok(self
            .base_url
            .join(&format!("{}wiki/latest/", self.language))?)
    }

    /// Remote name of a tracked dump, e.g. `enwiki-latest-page.sql.gz` for `page.sql.gz`.
    pub fn file_name(&self, suffix: &str) -> String {
        format!("{}wiki-latest-{}", self.language, suffix)
    }

    pub fn file_url(&self, file_name: &str) -> Result<Url, DumpsError> {
        Ok(self.directory_url()?.join(file_name)?)
    }

    /// Returns `None` when the edition does not publish `file_name`.
    pub async fn head_file(&self, file_name: &str) -> Result<Option<RemoteFile>, DumpsError> {
        let url = self.file_url(file_name)?;
        let response = self.http.head(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DumpsError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }
        let headers = response.headers();
        let size = content_length(headers, &url)?;
        let etag = header_str(headers, ETAG, &url)?.map(str::to_string);
        let last_modified = match header_str(headers, LAST_MODIFIED, &url)? {
            Some(value) => Some(parse_last_modified(value).ok_or_else(|| {
                DumpsError::InvalidHeader {
                    url: url.to_string(),
                    header: "last-modified",
                    value: value.to_string(),
                }
            })?),
            None => None,
        };
        Ok(Some(RemoteFile {
            name: file_name.to_string(),
            url,
            size,
            etag,
            last_modified,
        }))
    }

    /// Fetches `{lang}wiki-latest-md5sums.txt`. `None` when the listing is not published.
    pub async fn fetch_checksums(&self) -> Result<Option<Vec<ChecksumLine>>, DumpsError> {
        let url = self.file_url(&self.file_name("md5sums.txt"))?;
        let response = self.http.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DumpsError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        Ok(Some(parse_checksums(&body)?))
    }
}

impl DumpsError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            DumpsError::Request(_) => ErrorClass::Transient,
            DumpsError::Status { status, .. } => classify_status(*status),
            DumpsError::MissingHeader { .. }
            | DumpsError::InvalidHeader { .. }
            | DumpsError::MalformedChecksums { .. } => ErrorClass::Malformed,
            DumpsError::Url(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == ErrorClass::Transient
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if status.is_server_error()
        || matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
        )
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: reqwest::header::HeaderName,
    url: &Url,
) -> Result<Option<&'a str>, DumpsError> {
    let Some(value) = headers.get(&name) else {
        return Ok(None);
    };
    value.to_str().map(Some).map_err(|_| DumpsError::InvalidHeader {
        url: url.to_string(),
        header: static_header_name(&name),
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })
}

// Content-Length is read from the header map: reqwest reports a zero-length
// body for HEAD responses.
fn content_length(headers: &HeaderMap, url: &Url) -> Result<u64, DumpsError> {
    let value = header_str(headers, CONTENT_LENGTH, url)?.ok_or_else(|| {
        DumpsError::MissingHeader {
            url: url.to_string(),
            header: "content-length",
        }
    })?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| DumpsError::InvalidHeader {
            url: url.to_string(),
            header: "content-length",
            value: value.to_string(),
        })
}

fn static_header_name(name: &reqwest::header::HeaderName) -> &'static str {
    if name == CONTENT_LENGTH {
        "content-length"
    } else if name == ETAG {
        "etag"
    } else if name == LAST_MODIFIED {
        "last-modified"
    } else {
        "header"
    }
}

fn parse_last_modified(value: &str) -> Option<i64> {
    let parsed = httpdate::parse_http_date(value).ok()?;
    let secs = parsed.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}
