use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use fs4::fs_std::FileExt;
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use wikidump_core::{ClientOptions, DumpsClient, DumpsError};

use crate::config::EngineConfig;
use crate::sync::backoff::RetryPolicy;
use crate::sync::catalog::{CatalogEntry, CatalogError, CatalogFetcher};
use crate::sync::governor::{ResourceGovernor, ResourceProbe, ResourceSnapshot, SystemProbe};
use crate::sync::paths::Layout;
use crate::sync::planner::{LocalState, PlannedFile, plan};
use crate::sync::retention::{RetentionManager, RetentionReport};
use crate::sync::state::{
    FailureKind, FileFailure, RunOutcome, RunRecord, StateError, StateStore,
};
use crate::sync::store::{DiskUsage, PromotionMeta, StoreError, VersionStore};
use crate::sync::transfer::{DownloadOutcome, Downloader, TransferError};
use crate::sync::unpack::{StagedArtifact, UnpackError, Unpacker};
use crate::sync::{now_millis, now_unix};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a sync run is already in progress")]
    RunInProgress,
    #[error("another wikisync process holds the lock {0:?}")]
    Locked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dumps client error: {0}")]
    Client(#[from] DumpsError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Gating,
    Planning,
    Transferring,
    Promoting,
    Retaining,
    Reporting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub name: String,
    pub version_id: i64,
    pub promoted_at: i64,
    pub digest: Option<String>,
    pub artifact_name: String,
    pub artifact_size: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// `None` when read from outside the process running the engine.
    pub phase: Option<RunPhase>,
    pub last_run: Option<RunRecord>,
    pub files: Vec<FileStatus>,
    pub disk_usage: DiskUsage,
    pub resources: Option<ResourceSnapshot>,
}

struct StagedFile {
    entry: CatalogEntry,
    download: DownloadOutcome,
    artifact: StagedArtifact,
    downloaded_at: i64,
}

struct FileResult {
    bytes: u64,
    outcome: Result<StagedFile, FileFailure>,
}

pub struct SyncEngine {
    config: EngineConfig,
    layout: Layout,
    state: StateStore,
    store: Arc<VersionStore>,
    catalog: CatalogFetcher,
    downloader: Downloader,
    unpacker: Unpacker,
    governor: ResourceGovernor,
    retention: RetentionManager,
    retry: RetryPolicy,
    run_lock: Mutex<()>,
    phase: watch::Sender<RunPhase>,
    shutdown: CancellationToken,
    _process_lock: std::fs::File,
}

impl SyncEngine {
    pub async fn open(config: EngineConfig, shutdown: CancellationToken) -> Result<Self, EngineError> {
        Self::open_with_probe(config, Arc::new(SystemProbe::new()), shutdown).await
    }

    /// Opens the data root, takes the process lock and reconciles interrupted work.
    pub async fn open_with_probe(
        config: EngineConfig,
        probe: Arc<dyn ResourceProbe>,
        shutdown: CancellationToken,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|err| EngineError::Config(format!("{err:#}")))?;
        let layout = Layout::new(&config.data_root);
        layout.ensure().await?;
        let process_lock = acquire_process_lock(layout.lock_path()).await?;

        let state = StateStore::open(&layout.database_path()).await?;
        let store = Arc::new(VersionStore::new(layout.clone(), state.clone()));
        let recovery = store.recover().await?;
        if !recovery.completed.is_empty() || !recovery.discarded.is_empty() {
            tracing::info!(
                completed = recovery.completed.len(),
                discarded = recovery.discarded.len(),
                "recovered interrupted promotions"
            );
        }

        let options = ClientOptions {
            user_agent: config.user_agent.clone(),
            timeout: config.timeout,
        };
        let client = DumpsClient::with_options(&config.base_url, config.language.clone(), &options)?;
        let catalog = CatalogFetcher::new(client, config.files.clone(), config.verify_checksums);
        // Dumps take hours to stream; only the connection phase is bounded.
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout)
            .build()?;
        let downloader = Downloader::new(http, layout.clone(), config.governor_check_bytes);
        let unpacker = Unpacker::new(layout.clone());
        let governor = ResourceGovernor::new(probe, config.thresholds, layout.root());
        let retention = RetentionManager::new(
            Arc::clone(&store),
            state.clone(),
            layout.clone(),
            config.retention,
        );
        let retry = RetryPolicy::new(config.retry_attempts, config.retry_delay);
        let (phase, _) = watch::channel(RunPhase::Idle);

        Ok(Self {
            config,
            layout,
            state,
            store,
            catalog,
            downloader,
            unpacker,
            governor,
            retention,
            retry,
            run_lock: Mutex::new(()),
            phase,
            shutdown,
            _process_lock: process_lock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Runs one full sync. Fails with `RunInProgress` while another run holds the engine.
    pub async fn sync(&self) -> Result<RunRecord, EngineError> {
        let _run = self
            .run_lock
            .try_lock()
            .map_err(|_| EngineError::RunInProgress)?;
        let mut run = RunRecord::started(now_unix());
        tracing::info!(language = %self.config.language, files = self.config.files.len(), "sync started");

        self.execute(&mut run).await;

        run.finished_at = now_unix();
        if run.outcome != RunOutcome::Failed {
            self.set_phase(RunPhase::Reporting);
        }
        let inserted = self.state.insert_run(&run).await;
        self.set_phase(RunPhase::Idle);
        run.id = inserted?;

        tracing::info!(
            outcome = run.outcome.as_str(),
            planned = run.files_planned,
            transferred = run.files_transferred,
            failed = run.files_failed,
            deferred = run.files_deferred,
            bytes = run.bytes_transferred,
            "sync finished"
        );
        Ok(run)
    }

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        build_status(
            &self.state,
            &self.store,
            &self.layout,
            &self.governor,
            Some(self.phase()),
        )
        .await
    }

    /// Applies the retention policy now, regardless of `cleanup_after_sync`.
    pub async fn cleanup(&self) -> Result<RetentionReport, EngineError> {
        Ok(self.retention.run(now_millis()).await?)
    }

    async fn execute(&self, run: &mut RunRecord) {
        self.set_phase(RunPhase::Gating);
        match self.governor.check() {
            Ok(decision) if !decision.is_clear() => {
                tracing::warn!(reason = %decision.describe(), "insufficient resources, skipping sync");
                run.outcome = RunOutcome::SkippedInsufficientResources;
                run.error = Some(decision.describe());
                return;
            }
            Ok(_) => {}
            Err(err) => {
                self.fail(run, format!("resource probe failed: {err}"));
                return;
            }
        }

        self.set_phase(RunPhase::Planning);
        let catalog = match self.fetch_catalog().await {
            Ok(catalog) => catalog,
            Err(err) => {
                self.fail(run, err.to_string());
                return;
            }
        };
        let planned = match self.plan(&catalog).await {
            Ok(planned) => planned,
            Err(err) => {
                self.fail(run, err.to_string());
                return;
            }
        };
        let work: Vec<PlannedFile> = planned
            .into_iter()
            .filter(|file| {
                if !file.needs_transfer() {
                    tracing::debug!(file = %file.entry.name, reason = file.reason, "up to date");
                }
                file.needs_transfer()
            })
            .collect();
        run.files_planned = u32::try_from(work.len()).unwrap_or(u32::MAX);

        self.set_phase(RunPhase::Transferring);
        let staged = self.transfer_all(work, run).await;

        self.set_phase(RunPhase::Promoting);
        for file in staged {
            self.promote(file, run).await;
        }

        if self.config.retention.cleanup_after_sync && !self.shutdown.is_cancelled() {
            self.set_phase(RunPhase::Retaining);
            match self.retention.run(now_millis()).await {
                Ok(report) if !report.failures.is_empty() => {
                    tracing::warn!(failures = report.failures.len(), "retention left versions behind");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "retention failed"),
            }
        }

        run.outcome = if self.shutdown.is_cancelled() {
            RunOutcome::Cancelled
        } else if run.files_failed > 0 || run.files_deferred > 0 {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Succeeded
        };
    }

    fn fail(&self, run: &mut RunRecord, message: String) {
        tracing::error!(error = %message, "sync failed");
        self.set_phase(RunPhase::Failed);
        run.outcome = RunOutcome::Failed;
        run.error = Some(message);
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.catalog.fetch().await {
                Ok(catalog) => return Ok(catalog),
                Err(err) if err.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "catalog fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn plan(&self, catalog: &[CatalogEntry]) -> Result<Vec<PlannedFile>, EngineError> {
        let mut local = HashMap::new();
        for entry in catalog {
            let Some(latest) = self.state.get_latest(&entry.name).await? else {
                continue;
            };
            let Some(record) = self
                .state
                .get_record(&latest.name, latest.version_id)
                .await?
            else {
                continue;
            };
            let intact = self
                .store
                .verify_version(&latest.name, latest.version_id)
                .await?;
            local.insert(entry.name.clone(), LocalState { record, intact });
        }
        Ok(plan(catalog, &local))
    }

    async fn transfer_all(&self, work: Vec<PlannedFile>, run: &mut RunRecord) -> Vec<StagedFile> {
        let results: Vec<FileResult> = futures_util::stream::iter(work)
            .map(|file| self.process_file(file))
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut staged = Vec::new();
        for result in results {
            run.bytes_transferred = run
                .bytes_transferred
                .saturating_add(i64::try_from(result.bytes).unwrap_or(i64::MAX));
            match result.outcome {
                Ok(file) => staged.push(file),
                Err(failure) => {
                    tracing::warn!(
                        file = %failure.name,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "file not synced"
                    );
                    run.record_failure(failure);
                }
            }
        }
        staged
    }

    /// Download then unpack one file. Never touches `versions/` or `latest/`.
    async fn process_file(&self, file: PlannedFile) -> FileResult {
        let name = file.entry.name.clone();
        let failure = |kind: FailureKind, message: String| FileFailure {
            name: name.clone(),
            kind,
            message,
        };

        if self.shutdown.is_cancelled() {
            return FileResult {
                bytes: 0,
                outcome: Err(failure(FailureKind::Cancelled, "shutdown requested".into())),
            };
        }
        match self.governor.check() {
            Ok(decision) if !decision.is_clear() => {
                return FileResult {
                    bytes: 0,
                    outcome: Err(failure(FailureKind::InsufficientResources, decision.describe())),
                };
            }
            Ok(_) => {}
            Err(err) => {
                return FileResult {
                    bytes: 0,
                    outcome: Err(failure(FailureKind::InsufficientResources, err.to_string())),
                };
            }
        }

        tracing::info!(
            file = %name,
            action = ?file.action,
            reason = file.reason,
            size = file.entry.size,
            "transferring"
        );
        let (download, bytes) = match self.download_with_retry(&file.entry).await {
            (Ok(download), bytes) => (download, bytes),
            (Err(err), bytes) => {
                let kind = match &err {
                    TransferError::Cancelled => FailureKind::Cancelled,
                    TransferError::Aborted(_) => FailureKind::TransferAborted,
                    TransferError::IntegrityMismatch { .. } => FailureKind::IntegrityMismatch,
                    _ => FailureKind::TransferInterrupted,
                };
                return FileResult {
                    bytes,
                    outcome: Err(failure(kind, err.to_string())),
                };
            }
        };
        let downloaded_at = now_unix();

        let artifact = match self
            .unpacker
            .unpack(&name, &download.path, &self.shutdown)
            .await
        {
            Ok(artifact) => artifact,
            Err(err) => {
                let kind = match &err {
                    UnpackError::Corrupt { .. } => FailureKind::UnpackCorrupt,
                    UnpackError::Cancelled => FailureKind::Cancelled,
                    UnpackError::Io(_) | UnpackError::Join(_) => FailureKind::Storage,
                };
                return FileResult {
                    bytes,
                    outcome: Err(failure(kind, err.to_string())),
                };
            }
        };

        FileResult {
            bytes,
            outcome: Ok(StagedFile {
                entry: file.entry,
                download,
                artifact,
                downloaded_at,
            }),
        }
    }

    /// Also returns the body bytes received over all attempts.
    async fn download_with_retry(
        &self,
        entry: &CatalogEntry,
    ) -> (Result<DownloadOutcome, TransferError>, u64) {
        let mut attempt = 0;
        let mut received = 0;
        loop {
            attempt += 1;
            match self
                .downloader
                .download(entry, &self.governor, &self.shutdown, &mut received)
                .await
            {
                Ok(download) => return (Ok(download), received),
                Err(err) if err.is_interrupted() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        file = %entry.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transfer interrupted, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return (Err(TransferError::Cancelled), received),
                    }
                }
                Err(err) => return (Err(err), received),
            }
        }
    }

    async fn promote(&self, file: StagedFile, run: &mut RunRecord) {
        let name = file.entry.name.clone();
        let meta = PromotionMeta {
            digest: Some(file.download.digest.clone()),
            etag: file.entry.etag.clone(),
            size: file.entry.size,
            remote_modified: file.entry.last_modified,
            dump_date: file.entry.dump_date.clone(),
            downloaded_at: file.downloaded_at,
        };
        match self.store.promote(file.artifact, meta).await {
            Ok(_) => {
                run.files_transferred += 1;
                if let Err(err) = self.downloader.discard(&name).await {
                    tracing::warn!(file = %name, error = %err, "failed to clear staging");
                }
            }
            Err(err) => {
                if let Err(cleanup) = self.unpacker.discard(&name).await {
                    tracing::warn!(file = %name, error = %cleanup, "failed to clear staging");
                }
                tracing::error!(file = %name, error = %err, "promotion failed");
                run.record_failure(FileFailure {
                    name,
                    kind: FailureKind::Promotion,
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Status of a data root without taking the process lock, e.g. while the service runs.
pub async fn read_status(config: &EngineConfig) -> Result<StatusReport, EngineError> {
    let layout = Layout::new(&config.data_root);
    layout.ensure().await?;
    let state = StateStore::open(&layout.database_path()).await?;
    let store = VersionStore::new(layout.clone(), state.clone());
    let governor = ResourceGovernor::new(
        Arc::new(SystemProbe::new()),
        config.thresholds,
        layout.root(),
    );
    build_status(&state, &store, &layout, &governor, None).await
}

async fn build_status(
    state: &StateStore,
    store: &VersionStore,
    layout: &Layout,
    governor: &ResourceGovernor,
    phase: Option<RunPhase>,
) -> Result<StatusReport, EngineError> {
    let files = state
        .latest_records()
        .await?
        .into_iter()
        .map(|(latest, record)| FileStatus {
            path: layout.latest_link(&record.artifact_name),
            name: record.name,
            version_id: latest.version_id,
            promoted_at: latest.promoted_at,
            digest: record.digest,
            artifact_name: record.artifact_name,
            artifact_size: record.artifact_size,
        })
        .collect();
    Ok(StatusReport {
        phase,
        last_run: state.last_run().await?,
        files,
        disk_usage: store.usage().await?,
        resources: governor.snapshot().ok(),
    })
}

async fn acquire_process_lock(lock_path: PathBuf) -> Result<std::fs::File, EngineError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| EngineError::Locked(lock_path.clone()))?;
        Ok::<std::fs::File, EngineError>(file)
    })
    .await?
}
