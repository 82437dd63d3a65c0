use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use skysync_core::HttpRemoteClient;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::sync::index::{IndexError, IndexStore};
use crate::sync::orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle, SyncSettings};
use crate::sync::status::StatusView;

const DEFAULT_SYNC_DIR_NAME: &str = "SkySync";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub db_path: PathBuf,
    pub token: String,
    pub api_url: Option<String>,
    pub settings: SyncSettings,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(&home, |name| std::env::var(name).ok())
    }

    fn from_vars(home: &Path, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let sync_root = var("SKYSYNC_ROOT")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let db_path = match var("SKYSYNC_DB") {
            Some(value) => expand_with_home(&value, home),
            None => IndexStore::default_path().context("no data directory for the index")?,
        };
        let token = var("SKYSYNC_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .context("SKYSYNC_TOKEN is not set")?;
        let api_url = var("SKYSYNC_API_URL").filter(|url| !url.trim().is_empty());

        let defaults = SyncSettings::default();
        let settings = SyncSettings {
            excluded: var("SKYSYNC_EXCLUDED")
                .map(|value| parse_excluded(&value))
                .unwrap_or_default(),
            max_cpu_percent: read_u64(
                var("SKYSYNC_MAX_CPU_PERCENT"),
                u64::from(defaults.max_cpu_percent),
            )
            .min(100) as u32,
            reindex_interval: Duration::from_secs(
                read_u64(
                    var("SKYSYNC_REINDEX_DAYS"),
                    defaults.reindex_interval.as_secs() / SECS_PER_DAY,
                ) * SECS_PER_DAY,
            ),
            upload_workers: read_u64(
                var("SKYSYNC_UPLOAD_WORKERS"),
                defaults.upload_workers as u64,
            ) as usize,
            download_workers: read_u64(
                var("SKYSYNC_DOWNLOAD_WORKERS"),
                defaults.download_workers as u64,
            ) as usize,
            debounce: Duration::from_millis(read_u64(
                var("SKYSYNC_DEBOUNCE_MS"),
                defaults.debounce.as_millis() as u64,
            )),
            use_trash: read_bool(var("SKYSYNC_USE_TRASH"), defaults.use_trash),
            ..defaults
        };

        Ok(Self {
            sync_root,
            db_path,
            token,
            api_url,
            settings,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    index: IndexStore,
    orchestrator: Orchestrator,
    settings: watch::Sender<SyncSettings>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;

        let client = match &config.api_url {
            Some(url) => HttpRemoteClient::with_base_url(url, config.token.clone()),
            None => HttpRemoteClient::new(config.token.clone()),
        }
        .context("failed to build the API client")?;
        let index = open_index(&config.db_path)
            .await
            .with_context(|| format!("failed to open index at {:?}", config.db_path))?;

        let (settings, settings_rx) = watch::channel(config.settings.clone());
        let orchestrator = Orchestrator::new(
            Arc::new(client),
            index.clone(),
            config.sync_root.clone(),
            settings_rx,
        );

        Ok(Self {
            config,
            index,
            orchestrator,
            settings,
        })
    }

    /// Forgets all sync state before the first cycle.
    pub async fn rebuild_index(&self) -> anyhow::Result<()> {
        self.index
            .clear_all()
            .await
            .context("failed to clear the index")?;
        tracing::info!(db = %self.config.db_path.display(), "index cleared");
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            index,
            orchestrator,
            settings,
        } = self;
        tracing::info!(
            sync_root = %config.sync_root.display(),
            db = %config.db_path.display(),
            excluded = config.settings.excluded.len(),
            "skysyncd started"
        );

        let handle = orchestrator.handle();
        let mut sync = tokio::spawn(orchestrator.run());
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        let joined = loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    tracing::info!("received SIGINT, shutting down");
                    break stop_sync(&handle, &mut sync).await;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break stop_sync(&handle, &mut sync).await;
                }
                _ = sighup.recv() => reload_settings(&config, &settings),
                joined = &mut sync => break joined,
            }
        };

        log_summary(&handle.status_view()).await;
        index.close().await;
        match joined.context("sync task failed")? {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("sync stopped")),
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
