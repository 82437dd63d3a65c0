async fn stop_sync(
    handle: &OrchestratorHandle,
    sync: &mut JoinHandle<Result<(), OrchestratorError>>,
) -> Result<Result<(), OrchestratorError>, JoinError> {
    handle.stop();
    sync.await
}

/// Re-reads the environment and hands the new settings to the next cycles.
/// The sync root and credentials only change on restart.
fn reload_settings(current: &DaemonConfig, settings: &watch::Sender<SyncSettings>) {
    dotenvy::dotenv_override().ok();
    match DaemonConfig::from_env() {
        Ok(config) => {
            if config.sync_root != current.sync_root {
                tracing::warn!(
                    sync_root = %config.sync_root.display(),
                    "a new sync root takes effect after a restart"
                );
            }
            settings.send_replace(config.settings);
            tracing::info!("settings reloaded");
        }
        Err(err) => tracing::warn!(error = %err, "settings not reloaded"),
    }
}

/// Opens the index, moving an unreadable database aside so the next start
/// rebuilds from both replicas.
async fn open_index(path: &Path) -> Result<IndexStore, IndexError> {
    match IndexStore::open(path).await {
        Err(err) if err.is_corrupted() => {
            let aside = corrupt_copy_path(path);
            tracing::warn!(
                error = %err,
                aside = %aside.display(),
                "index is corrupted, starting a new one"
            );
            tokio::fs::rename(path, &aside).await?;
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = path.as_os_str().to_os_string();
                sidecar.push(suffix);
                let _ = tokio::fs::remove_file(PathBuf::from(sidecar)).await;
            }
            IndexStore::open(path).await
        }
        result => result,
    }
}

fn corrupt_copy_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}

async fn log_summary(view: &StatusView) {
    let errors = view.errors().await.map(|errors| errors.len());
    let conflicts = view.conflicts().await.map(|conflicts| conflicts.len());
    match (errors, conflicts) {
        (Ok(errors), Ok(conflicts)) => tracing::info!(
            status = ?view.engine_status(),
            errors,
            conflicts,
            "skysyncd stopped"
        ),
        (Err(err), _) | (_, Err(err)) => {
            tracing::warn!(error = %err, "could not summarize sync state")
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

/// Comma-separated sync paths; blanks are dropped.
fn parse_excluded(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(|path| {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        })
        .collect()
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
