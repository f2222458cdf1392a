use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

use crate::config::{EngineConfig, read_bool_env};
use crate::signals::ServiceSignals;
use crate::sync::engine::{EngineError, SyncEngine};

const DEFAULT_SCHEDULE: &str = "daily 02:00";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub schedule: Schedule,
    pub sync_on_start: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let engine = EngineConfig::from_env()?;
        let schedule = match std::env::var("WIKISYNC_SCHEDULE") {
            Ok(value) => Schedule::parse(&value)
                .with_context(|| format!("invalid WIKISYNC_SCHEDULE {value:?}"))?,
            Err(_) => Schedule::parse(DEFAULT_SCHEDULE)?,
        };
        let sync_on_start = read_bool_env("WIKISYNC_SYNC_ON_START", true);

        Ok(Self {
            engine,
            schedule,
            sync_on_start,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    signals: ServiceSignals,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig, signals: ServiceSignals) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.engine.data_root)
            .await
            .with_context(|| format!("failed to create {}", config.engine.data_root.display()))?;
        let engine = SyncEngine::open(config.engine.clone(), signals.shutdown())
            .await
            .context("failed to open sync engine")?;

        Ok(Self {
            config,
            engine: Arc::new(engine),
            signals,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Runs scheduled syncs until shutdown; sync requests run one immediately.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            data_root = %self.config.engine.data_root.display(),
            language = %self.config.engine.language,
            schedule = %self.config.schedule,
            "wikisyncd started"
        );
        let shutdown = self.signals.shutdown();
        if self.config.sync_on_start {
            self.run_sync("startup").await;
        }

        while !shutdown.is_cancelled() {
            let now = OffsetDateTime::now_utc();
            let next = self.config.schedule.next_after(now);
            tracing::info!(next_run = %format_timestamp(next), "waiting for next sync");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(duration_until(now, next)) => self.run_sync("schedule").await,
                _ = self.signals.sync_requested() => self.run_sync("request").await,
            }
        }

        tracing::info!("wikisyncd stopped");
        Ok(())
    }

    async fn run_sync(&self, trigger: &str) {
        tracing::info!(trigger, "sync triggered");
        match self.engine.sync().await {
            Ok(run) => tracing::info!(trigger, outcome = run.outcome.as_str(), "sync completed"),
            Err(EngineError::RunInProgress) => {
                tracing::warn!(trigger, "sync already running, trigger ignored");
            }
            Err(err) => tracing::error!(trigger, error = %err, "sync could not run"),
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
