use serde::{Deserialize, Serialize};

use crate::client::DumpsError;

/// One `<md5>  <file name>` line of a `*-md5sums.txt` listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChecksumLine {
    pub digest: String,
    pub file_name: String,
}

pub fn parse_checksums(text: &str) -> Result<Vec<ChecksumLine>, DumpsError> {
    let mut out = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(digest), Some(file_name), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DumpsError::MalformedChecksums {
                line: index + 1,
                content: line.to_string(),
            });
        };
        if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DumpsError::MalformedChecksums {
                line: index + 1,
                content: line.to_string(),
            });
        }
        out.push(ChecksumLine {
            digest: digest.to_ascii_lowercase(),
            file_name: file_name.trim_start_matches('*').to_string(),
        });
    }
    Ok(out)
}

/// Splits `enwiki-20240601-pages-articles.xml.bz2` into `("20240601", "pages-articles.xml.bz2")`.
/// The middle segment is `latest` for names from the rolling directory.
pub fn split_dump_name<'a>(file_name: &'a str, language: &str) -> Option<(&'a str, &'a str)> {
    let rest = file_name.strip_prefix(&format!("{language}wiki-"))?;
    let (stamp, suffix) = rest.split_once('-')?;
    if suffix.is_empty() {
        return None;
    }
    Some((stamp, suffix))
}
