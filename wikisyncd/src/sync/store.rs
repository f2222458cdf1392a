use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::paths::{Layout, PathError, validate_file_name};
use crate::sync::state::{LocalFileRecord, StateError, StateStore};
use crate::sync::transfer::remove_if_exists;
use crate::sync::unpack::StagedArtifact;
use crate::sync::{now_millis, now_unix};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("invalid file name: {0}")]
    Path(#[from] PathError),
    #[error("version {version_id} of {name} is latest and cannot be removed")]
    CannotRemoveLatest { name: String, version_id: i64 },
    #[error("unknown version {version_id} of {name}")]
    UnknownVersion { name: String, version_id: i64 },
}

/// Written last into every version directory; its presence marks the version complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub name: String,
    pub version_id: i64,
    pub artifact_name: String,
    pub artifact_size: u64,
    pub artifact_digest: String,
    pub digest: Option<String>,
    pub etag: Option<String>,
    pub size: u64,
    pub remote_modified: Option<i64>,
    pub dump_date: Option<String>,
    pub downloaded_at: i64,
    pub unpacked_at: i64,
}

impl VersionManifest {
    fn to_record(&self) -> LocalFileRecord {
        LocalFileRecord {
            name: self.name.clone(),
            version_id: self.version_id,
            digest: self.digest.clone(),
            etag: self.etag.clone(),
            size: i64::try_from(self.size).unwrap_or(i64::MAX),
            remote_modified: self.remote_modified,
            downloaded_at: self.downloaded_at,
            unpacked_at: self.unpacked_at,
            artifact_name: self.artifact_name.clone(),
            artifact_size: i64::try_from(self.artifact_size).unwrap_or(i64::MAX),
            artifact_digest: self.artifact_digest.clone(),
        }
    }
}

/// Upstream identity of the bytes being promoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionMeta {
    pub digest: Option<String>,
    pub etag: Option<String>,
    pub size: u64,
    pub remote_modified: Option<i64>,
    pub dump_date: Option<String>,
    pub downloaded_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub record: LocalFileRecord,
    pub is_latest: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub originals: u64,
    pub versions: u64,
    /// Bytes reachable through `latest/`; shared with `versions`.
    pub latest: u64,
    pub staging: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub completed: Vec<(String, i64)>,
    pub discarded: Vec<(String, i64)>,
    pub realigned: usize,
}

pub struct VersionStore {
    layout: Layout,
    state: StateStore,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VersionStore {
    pub fn new(layout: Layout, state: StateStore) -> Self {
        Self {
            layout,
            state,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Moves a staged artifact into `versions/` and makes it the latest version of its file.
    pub async fn promote(
        &self,
        staged: StagedArtifact,
        meta: PromotionMeta,
    ) -> Result<LocalFileRecord, StoreError> {
        validate_file_name(&staged.name)?;
        let lock = self.lock_for(&staged.name);
        let _guard = lock.lock().await;

        let version_id = self.next_version_id(&staged.name).await?;
        let manifest = VersionManifest {
            name: staged.name.clone(),
            version_id,
            artifact_name: staged.artifact_name.clone(),
            artifact_size: staged.artifact_size,
            artifact_digest: staged.artifact_digest.clone(),
            digest: meta.digest,
            etag: meta.etag,
            size: meta.size,
            remote_modified: meta.remote_modified,
            dump_date: meta.dump_date,
            downloaded_at: meta.downloaded_at,
            unpacked_at: staged.unpacked_at,
        };
        write_manifest(&staged.dir, &manifest).await?;

        let version_dir = self.layout.version_dir(&staged.name, version_id);
        create_parent(&version_dir).await?;
        tokio::fs::rename(&staged.dir, &version_dir).await?;
        self.move_original(&staged.name, version_id, &staged.original)
            .await?;

        let previous = self.state.get_latest(&staged.name).await?;
        self.point_latest(&staged.name, version_id, &staged.artifact_name)
            .await?;
        let record = manifest.to_record();
        if let Err(err) = self.state.commit_promotion(&record, now_unix()).await {
            if let Some(previous) = previous
                && let Ok(Some(prior)) = self
                    .state
                    .get_record(&previous.name, previous.version_id)
                    .await
                && let Err(rollback) = self
                    .point_latest(&prior.name, prior.version_id, &prior.artifact_name)
                    .await
            {
                tracing::error!(
                    file = %prior.name,
                    version = prior.version_id,
                    error = %rollback,
                    "failed to restore latest link after commit failure; realigned on next start"
                );
            }
            return Err(err.into());
        }

        tracing::info!(
            file = %record.name,
            version = record.version_id,
            artifact = %record.artifact_name,
            size = record.artifact_size,
            "promoted to latest"
        );
        Ok(record)
    }

    /// Intact when the manifest is present and the artifact has the recorded size.
    pub async fn verify_version(&self, name: &str, version_id: i64) -> Result<bool, StoreError> {
        let dir = self.layout.version_dir(name, version_id);
        let Some(manifest) = read_manifest(&dir).await? else {
            return Ok(false);
        };
        if manifest.name != name || manifest.version_id != version_id {
            return Ok(false);
        }
        match tokio::fs::metadata(dir.join(&manifest.artifact_name)).await {
            Ok(metadata) => Ok(metadata.is_file() && metadata.len() == manifest.artifact_size),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Recorded versions of `name`, newest first.
    pub async fn list_versions(&self, name: &str) -> Result<Vec<VersionInfo>, StoreError> {
        let latest = self.state.get_latest(name).await?;
        let latest_id = latest.map(|latest| latest.version_id);
        Ok(self
            .state
            .list_records(name)
            .await?
            .into_iter()
            .map(|record| VersionInfo {
                is_latest: Some(record.version_id) == latest_id,
                record,
            })
            .collect())
    }

    pub async fn remove_version(&self, name: &str, version_id: i64) -> Result<(), StoreError> {
        validate_file_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        if let Some(latest) = self.state.get_latest(name).await?
            && latest.version_id == version_id
        {
            return Err(StoreError::CannotRemoveLatest {
                name: name.to_string(),
                version_id,
            });
        }
        let version_dir = self.layout.version_dir(name, version_id);
        let original_dir = self.layout.original_dir(name, version_id);
        let recorded = self.state.get_record(name, version_id).await?.is_some();
        let on_disk = path_exists(&version_dir).await? || path_exists(&original_dir).await?;
        if !recorded && !on_disk {
            return Err(StoreError::UnknownVersion {
                name: name.to_string(),
                version_id,
            });
        }

        let trash = self
            .layout
            .trash_dir()
            .join(format!("{name}-{version_id}-{}", now_millis()));
        tokio::fs::create_dir_all(&trash).await?;
        if path_exists(&version_dir).await? {
            tokio::fs::rename(&version_dir, trash.join("version")).await?;
        }
        if path_exists(&original_dir).await? {
            tokio::fs::rename(&original_dir, trash.join("original")).await?;
        }
        self.state.delete_record(name, version_id).await?;
        tokio::fs::remove_dir_all(&trash).await?;
        tracing::info!(file = %name, version = version_id, "removed version");
        Ok(())
    }

    /// Startup reconciliation of interrupted promotions and removals.
    pub async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        self.layout.ensure().await?;
        let mut report = RecoveryReport::default();

        remove_dir_if_exists(&self.layout.trash_dir()).await?;
        tokio::fs::create_dir_all(self.layout.trash_dir()).await?;
        for entry in read_dir_names(&self.layout.latest_dir()).await? {
            if entry.starts_with('.') && entry.contains(".tmp-") {
                remove_if_exists(&self.layout.latest_dir().join(entry)).await?;
            }
        }

        self.adopt_staged_versions().await?;

        for name in read_dir_names(&self.layout.versions_dir()).await? {
            if validate_file_name(&name).is_err() {
                continue;
            }
            for id in read_dir_names(&self.layout.versions_dir().join(&name)).await? {
                let Ok(version_id) = id.parse::<i64>() else {
                    continue;
                };
                if self.state.get_record(&name, version_id).await?.is_some() {
                    continue;
                }
                if self.complete_promotion(&name, version_id).await? {
                    report.completed.push((name.clone(), version_id));
                } else {
                    remove_dir_if_exists(&self.layout.version_dir(&name, version_id)).await?;
                    remove_dir_if_exists(&self.layout.original_dir(&name, version_id)).await?;
                    tracing::warn!(file = %name, version = version_id, "discarded unrecorded version");
                    report.discarded.push((name.clone(), version_id));
                }
            }
        }

        for name in read_dir_names(&self.layout.originals_dir()).await? {
            for id in read_dir_names(&self.layout.originals_dir().join(&name)).await? {
                let Ok(version_id) = id.parse::<i64>() else {
                    continue;
                };
                if self.state.get_record(&name, version_id).await?.is_none() {
                    remove_dir_if_exists(&self.layout.original_dir(&name, version_id)).await?;
                }
            }
        }

        report.realigned = self.realign_latest().await?;
        Ok(report)
    }

    pub async fn usage(&self) -> Result<DiskUsage, StoreError> {
        let layout = self.layout.clone();
        let (originals, versions, staging) = tokio::task::spawn_blocking(move || {
            (
                dir_size(&layout.originals_dir()),
                dir_size(&layout.versions_dir()),
                dir_size(&layout.staging_dir()),
            )
        })
        .await
        .map_err(io::Error::other)?;
        let latest = self
            .state
            .latest_records()
            .await?
            .iter()
            .map(|(_, record)| u64::try_from(record.artifact_size).unwrap_or(0))
            .sum();
        Ok(DiskUsage {
            originals,
            versions,
            latest,
            staging,
        })
    }

    async fn next_version_id(&self, name: &str) -> Result<i64, StoreError> {
        let floor = self.state.max_version_id(name).await?.unwrap_or(0) + 1;
        Ok(now_millis().max(floor))
    }

    async fn move_original(&self, name: &str, version_id: i64, source: &Path) -> io::Result<()> {
        if !path_exists(source).await? {
            return Ok(());
        }
        let dir = self.layout.original_dir(name, version_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::rename(source, dir.join(name)).await?;
        remove_if_exists(&self.layout.partial_meta_path(name)).await
    }

    async fn point_latest(&self, name: &str, version_id: i64, artifact_name: &str) -> io::Result<()> {
        let latest_dir = self.layout.latest_dir();
        tokio::fs::create_dir_all(&latest_dir).await?;
        let link = self.layout.latest_link(artifact_name);
        let tmp = latest_dir.join(format!(".{artifact_name}.tmp-{version_id}"));
        remove_if_exists(&tmp).await?;
        tokio::fs::symlink(
            self.layout.latest_target(name, version_id, artifact_name),
            &tmp,
        )
        .await?;
        tokio::fs::rename(&tmp, &link).await?;
        sync_dir(&latest_dir).await
    }

    /// Staged directories that already carry a manifest were renamed mid-promotion.
    async fn adopt_staged_versions(&self) -> Result<(), StoreError> {
        let staging = self.layout.staging_dir();
        for entry in read_dir_names(&staging).await? {
            let Some(name) = entry.strip_suffix(".unpacked") else {
                continue;
            };
            let dir = staging.join(&entry);
            match read_manifest(&dir).await {
                Ok(Some(manifest)) if manifest.name == name => {
                    let target = self.layout.version_dir(name, manifest.version_id);
                    if path_exists(&target).await? {
                        remove_dir_if_exists(&dir).await?;
                    } else {
                        create_parent(&target).await?;
                        tokio::fs::rename(&dir, &target).await?;
                    }
                }
                _ => remove_dir_if_exists(&dir).await?,
            }
        }
        Ok(())
    }

    async fn complete_promotion(&self, name: &str, version_id: i64) -> Result<bool, StoreError> {
        if !self.verify_version(name, version_id).await? {
            return Ok(false);
        }
        if let Some(latest) = self.state.get_latest(name).await?
            && latest.version_id >= version_id
        {
            return Ok(false);
        }
        let Some(manifest) = read_manifest(&self.layout.version_dir(name, version_id)).await?
        else {
            return Ok(false);
        };

        let partial = self.layout.partial_path(name);
        if !path_exists(&self.layout.original_dir(name, version_id)).await?
            && let Ok(metadata) = tokio::fs::metadata(&partial).await
            && metadata.len() == manifest.size
        {
            self.move_original(name, version_id, &partial).await?;
        }
        self.point_latest(name, version_id, &manifest.artifact_name)
            .await?;
        self.state
            .commit_promotion(&manifest.to_record(), now_unix())
            .await?;
        tracing::info!(file = %name, version = version_id, "completed interrupted promotion");
        Ok(true)
    }

    async fn realign_latest(&self) -> Result<usize, StoreError> {
        let mut realigned = 0;
        let mut expected = HashSet::new();
        for (latest, record) in self.state.latest_records().await? {
            let link = self.layout.latest_link(&record.artifact_name);
            let target =
                self.layout
                    .latest_target(&latest.name, latest.version_id, &record.artifact_name);
            expected.insert(record.artifact_name.clone());
            let current = tokio::fs::read_link(&link).await.ok();
            if current.as_deref() != Some(target.as_path()) {
                self.point_latest(&latest.name, latest.version_id, &record.artifact_name)
                    .await?;
                realigned += 1;
            }
        }
        for entry in read_dir_names(&self.layout.latest_dir()).await? {
            if !expected.contains(&entry) {
                remove_if_exists(&self.layout.latest_dir().join(&entry)).await?;
                realigned += 1;
            }
        }
        if realigned > 0 {
            tracing::info!(links = realigned, "realigned latest links");
        }
        Ok(realigned)
    }
}

async fn write_manifest(dir: &Path, manifest: &VersionManifest) -> Result<(), StoreError> {
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let bytes = serde_json::to_vec_pretty(manifest)?;
    let mut file = tokio::fs::File::create(&tmp).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp, dir.join(MANIFEST_FILE)).await?;
    sync_dir(dir).await?;
    Ok(())
}

async fn read_manifest(dir: &Path) -> Result<Option<VersionManifest>, StoreError> {
    match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn sync_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

async fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

async fn path_exists(path: &Path) -> io::Result<bool> {
    tokio::fs::try_exists(path).await
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

async fn read_dir_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.path().symlink_metadata() else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    total
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
