use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::sync::paths::Layout;
use crate::sync::state::{LocalFileRecord, StateStore};
use crate::sync::store::{StoreError, VersionStore};
use crate::sync::transfer::remove_if_exists;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Non-latest versions kept per file.
    pub keep_versions: u32,
    /// `0` disables the age limit.
    pub max_age_days: u32,
    pub cleanup_after_sync: bool,
}

impl RetentionPolicy {
    fn max_age_millis(&self) -> Option<i64> {
        (self.max_age_days > 0).then(|| i64::from(self.max_age_days) * DAY_MILLIS)
    }
}

/// Version ids of `name` to remove. Version ids are promotion times in unix milliseconds.
pub fn select_evictions(
    versions: &[LocalFileRecord],
    latest: Option<i64>,
    policy: &RetentionPolicy,
    now_millis: i64,
) -> Vec<i64> {
    let mut candidates: Vec<i64> = versions
        .iter()
        .map(|record| record.version_id)
        .filter(|id| Some(*id) != latest)
        .collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));

    let max_age = policy.max_age_millis();
    candidates
        .into_iter()
        .enumerate()
        .filter(|(rank, id)| {
            let beyond_count = *rank >= policy.keep_versions as usize;
            let too_old = max_age.is_some_and(|max_age| now_millis.saturating_sub(*id) > max_age);
            beyond_count || too_old
        })
        .map(|(_, id)| id)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedVersion {
    pub name: String,
    pub version_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionFailure {
    pub name: String,
    pub version_id: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub removed: Vec<RemovedVersion>,
    pub failures: Vec<RetentionFailure>,
    pub purged_partials: Vec<String>,
}

pub struct RetentionManager {
    store: Arc<VersionStore>,
    state: StateStore,
    layout: Layout,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(
        store: Arc<VersionStore>,
        state: StateStore,
        layout: Layout,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            state,
            layout,
            policy,
        }
    }

    /// Removal failures are collected; the batch continues.
    pub async fn run(&self, now_millis: i64) -> Result<RetentionReport, StoreError> {
        let mut report = RetentionReport::default();
        for name in self.state.tracked_names().await? {
            let versions = self.state.list_records(&name).await?;
            let latest = self
                .state
                .get_latest(&name)
                .await?
                .map(|latest| latest.version_id);
            for version_id in select_evictions(&versions, latest, &self.policy, now_millis) {
                match self.store.remove_version(&name, version_id).await {
                    Ok(()) => report.removed.push(RemovedVersion {
                        name: name.clone(),
                        version_id,
                    }),
                    Err(err) => {
                        tracing::warn!(file = %name, version = version_id, error = %err, "failed to remove version");
                        report.failures.push(RetentionFailure {
                            name: name.clone(),
                            version_id: Some(version_id),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
        self.purge_stale_partials(now_millis, &mut report).await;
        tracing::info!(
            removed = report.removed.len(),
            failures = report.failures.len(),
            purged = report.purged_partials.len(),
            "retention finished"
        );
        Ok(report)
    }

    async fn purge_stale_partials(&self, now_millis: i64, report: &mut RetentionReport) {
        let Some(max_age) = self.policy.max_age_millis() else {
            return;
        };
        let Ok(mut entries) = tokio::fs::read_dir(self.layout.staging_dir()).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file_name.strip_suffix(".partial") else {
                continue;
            };
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .and_then(|age| i64::try_from(age.as_millis()).ok());
            let Some(modified) = modified else {
                continue;
            };
            if now_millis.saturating_sub(modified) <= max_age {
                continue;
            }
            let result = match remove_if_exists(&entry.path()).await {
                Ok(()) => remove_if_exists(&self.layout.partial_meta_path(name)).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => report.purged_partials.push(name.to_string()),
                Err(err) => report.failures.push(RetentionFailure {
                    name: name.to_string(),
                    version_id: None,
                    message: err.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version_id: i64) -> LocalFileRecord {
        LocalFileRecord {
            name: "pages.xml.bz2".into(),
            version_id,
            digest: None,
            etag: None,
            size: 1,
            remote_modified: None,
            downloaded_at: 0,
            unpacked_at: 0,
            artifact_name: "pages.xml".into(),
            artifact_size: 1,
            artifact_digest: "a".into(),
        }
    }

    fn policy(keep_versions: u32, max_age_days: u32) -> RetentionPolicy {
        RetentionPolicy {
            keep_versions,
            max_age_days,
            cleanup_after_sync: true,
        }
    }

    const NOW: i64 = 100 * DAY_MILLIS;

    #[test]
    fn keeps_newest_versions_besides_latest() {
        let versions: Vec<_> = (1..=5).map(|day| record(NOW - day * DAY_MILLIS)).collect();
        let latest = Some(NOW - DAY_MILLIS);

        let mut evicted = select_evictions(&versions, latest, &policy(2, 0), NOW);
        evicted.sort_unstable();

        assert_eq!(evicted, vec![NOW - 5 * DAY_MILLIS, NOW - 4 * DAY_MILLIS]);
    }

    #[test]
    fn drops_versions_older_than_max_age() {
        let versions: Vec<_> = [1, 10, 40].iter().map(|day| record(NOW - day * DAY_MILLIS)).collect();
        let evicted = select_evictions(&versions, Some(NOW - DAY_MILLIS), &policy(5, 30), NOW);
        assert_eq!(evicted, vec![NOW - 40 * DAY_MILLIS]);
    }

    #[test]
    fn never_evicts_latest_even_when_old() {
        let versions = vec![record(NOW - 90 * DAY_MILLIS)];
        let evicted = select_evictions(&versions, Some(NOW - 90 * DAY_MILLIS), &policy(0, 1), NOW);
        assert!(evicted.is_empty());
    }

    #[test]
    fn zero_keep_removes_every_older_version() {
        let versions: Vec<_> = (1..=3).map(record).collect();
        let mut evicted = select_evictions(&versions, Some(3), &policy(0, 0), NOW);
        evicted.sort_unstable();
        assert_eq!(evicted, vec![1, 2]);
    }
}
