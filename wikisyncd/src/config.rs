use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use wikidump_core::{DEFAULT_BASE_URL, DEFAULT_USER_AGENT};

use crate::sync::governor::ResourceThresholds;
use crate::sync::paths::validate_file_name;
use crate::sync::retention::RetentionPolicy;
use crate::sync::unpack::Compression;

const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_FILES: &[&str] = &[
    "pages-articles.xml.bz2",
    "pages-articles-multistream.xml.bz2",
    "pages-meta-current.xml.bz2",
    "page.sql.gz",
    "categorylinks.sql.gz",
    "langlinks.sql.gz",
];
const DEFAULT_PARALLELISM: u64 = 3;
const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_GOVERNOR_CHECK_MB: u64 = 64;
const DEFAULT_MIN_FREE_DISK_GB: u64 = 10;
const DEFAULT_MIN_MEMORY_MB: u64 = 2048;
const DEFAULT_MAX_CPU_PERCENT: u64 = 80;
const DEFAULT_KEEP_VERSIONS: u32 = 3;
const DEFAULT_MAX_AGE_DAYS: u32 = 30;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Everything the engine needs, resolved once at startup.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub language: String,
    pub base_url: String,
    /// Tracked dump suffixes, e.g. `page.sql.gz`.
    pub files: Vec<String>,
    pub parallelism: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub user_agent: String,
    pub verify_checksums: bool,
    pub governor_check_bytes: u64,
    pub thresholds: ResourceThresholds,
    pub retention: RetentionPolicy,
}

impl EngineConfig {
    pub fn with_defaults(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            files: DEFAULT_FILES.iter().map(|file| file.to_string()).collect(),
            parallelism: DEFAULT_PARALLELISM as usize,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS as u32,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            verify_checksums: true,
            governor_check_bytes: DEFAULT_GOVERNOR_CHECK_MB * MIB,
            thresholds: ResourceThresholds {
                min_free_disk_bytes: DEFAULT_MIN_FREE_DISK_GB * GIB,
                min_available_memory_bytes: DEFAULT_MIN_MEMORY_MB * MIB,
                max_cpu_percent: DEFAULT_MAX_CPU_PERCENT as f32,
            },
            retention: RetentionPolicy {
                keep_versions: DEFAULT_KEEP_VERSIONS,
                max_age_days: DEFAULT_MAX_AGE_DAYS,
                cleanup_after_sync: true,
            },
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_root = std::env::var("WIKISYNC_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_root);
        let mut config = Self::with_defaults(data_root);

        if let Ok(language) = std::env::var("WIKISYNC_LANGUAGE") {
            config.language = language.trim().to_ascii_lowercase();
        }
        if let Ok(base_url) = std::env::var("WIKISYNC_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(files) = std::env::var("WIKISYNC_FILES") {
            config.files = parse_file_list(&files);
        }
        if let Ok(user_agent) = std::env::var("WIKISYNC_USER_AGENT") {
            config.user_agent = user_agent;
        }
        config.parallelism = read_u64_env("WIKISYNC_PARALLELISM", DEFAULT_PARALLELISM) as usize;
        config.retry_attempts =
            read_u64_env("WIKISYNC_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS) as u32;
        config.retry_delay = Duration::from_secs(read_u64_env(
            "WIKISYNC_RETRY_DELAY_SECS",
            DEFAULT_RETRY_DELAY_SECS,
        ));
        config.timeout =
            Duration::from_secs(read_u64_env("WIKISYNC_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS));
        config.verify_checksums = read_bool_env("WIKISYNC_VERIFY_CHECKSUMS", true);
        config.governor_check_bytes =
            read_u64_env("WIKISYNC_GOVERNOR_CHECK_MB", DEFAULT_GOVERNOR_CHECK_MB) * MIB;
        config.thresholds = ResourceThresholds {
            min_free_disk_bytes: read_u64_env("WIKISYNC_MIN_FREE_DISK_GB", DEFAULT_MIN_FREE_DISK_GB)
                * GIB,
            min_available_memory_bytes: read_u64_env("WIKISYNC_MIN_MEMORY_MB", DEFAULT_MIN_MEMORY_MB)
                * MIB,
            max_cpu_percent: read_u64_env("WIKISYNC_MAX_CPU_PERCENT", DEFAULT_MAX_CPU_PERCENT)
                .min(100) as f32,
        };
        config.retention = RetentionPolicy {
            keep_versions: read_count_env("WIKISYNC_KEEP_VERSIONS", DEFAULT_KEEP_VERSIONS),
            max_age_days: read_count_env("WIKISYNC_MAX_AGE_DAYS", DEFAULT_MAX_AGE_DAYS),
            cleanup_after_sync: read_bool_env("WIKISYNC_CLEANUP_AFTER_SYNC", true),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.language.is_empty()
            || !self
                .language
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("invalid language code: {:?}", self.language);
        }
        if self.files.is_empty() {
            anyhow::bail!("no dump files are tracked");
        }
        let mut artifacts: HashMap<String, &str> = HashMap::new();
        for file in &self.files {
            validate_file_name(file).with_context(|| format!("invalid tracked file {file:?}"))?;
            match artifacts.insert(Compression::artifact_name(file), file) {
                Some(other) if other == file => anyhow::bail!("file {file:?} is tracked twice"),
                Some(other) => {
                    anyhow::bail!("tracked files {other:?} and {file:?} unpack to the same name")
                }
                None => {}
            }
        }
        url::Url::parse(&self.base_url)
            .with_context(|| format!("invalid base url {:?}", self.base_url))?;
        Ok(())
    }
}

fn parse_file_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|file| !file.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wikisync")
}

pub(crate) fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_count_env(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_tilde_to_home_data_dir() {
        let home = PathBuf::from("/tmp/home-user");
        assert_eq!(
            expand_with_home("~/wikisync", &home),
            PathBuf::from("/tmp/home-user/wikisync")
        );
        assert_eq!(expand_with_home("/srv/wiki", &home), PathBuf::from("/srv/wiki"));
    }

    #[test]
    fn reads_numbers_from_env_or_default() {
        assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
        assert_eq!(read_count_env("NO_SUCH_COUNT_ENV_FOR_TEST", 3), 3);
        assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
    }

    #[test]
    fn defaults_track_the_standard_dumps() {
        let config = EngineConfig::with_defaults("/data");
        assert_eq!(config.language, "en");
        assert_eq!(config.files.len(), 6);
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.retention.keep_versions, 3);
        assert_eq!(config.thresholds.min_free_disk_bytes, 10 * GIB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_comma_separated_file_lists() {
        assert_eq!(
            parse_file_list(" page.sql.gz, ,langlinks.sql.gz "),
            vec!["page.sql.gz".to_string(), "langlinks.sql.gz".to_string()]
        );
    }

    #[test]
    fn rejects_unsafe_values() {
        let mut config = EngineConfig::with_defaults("/data");
        config.files = vec!["../etc/passwd".into()];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_defaults("/data");
        config.language = "en/../x".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_files_sharing_an_artifact_name() {
        let mut config = EngineConfig::with_defaults("/data");
        config.files = vec!["page.sql.gz".into(), "page.sql.bz2".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unpack to the same name"));

        config.files = vec!["page.sql".into(), "page.sql.gz".into()];
        assert!(config.validate().is_err());

        config.files = vec!["page.sql.gz".into(), "page.sql.gz".into()];
        assert!(config.validate().is_err());
    }
}
