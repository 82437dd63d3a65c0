use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use skysync_core::{ApiErrorClass, Metadata, RemoteClient, RemoteError, WriteMode};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Notify, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::backoff::{Backoff, MAX_RETRY_ATTEMPTS};
use super::conflict::{
    CASE_CONFLICT_SUFFIX, DownloadDecision, LocalState, RemoteChange, SELECTIVE_SYNC_SUFFIX,
    TypeSwap, UploadCheck, UploadDecision, conflicting_copy_path, decide_download, decide_upload,
    suffixed_path, unique_path,
};
use super::event::{
    ChangeType, Direction, EventStatus, ItemType, SyncEvent, unix_now, unix_now_nanos,
};
use super::ignore::IgnorePatterns;
use super::index::{HashCacheEntry, IndexEntry, IndexError, IndexStore, SyncErrorRecord};
use super::local_watcher::{Expected, ExpectedChanges, walk_below};
use super::paths::{self, PathError, local_path_for};
use super::queue::{InFlight, InFlightGuard, sort_hierarchically};
use super::transfer::{self, FileSnapshot, TransferError};

const CLAIM_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sync root is unavailable: {0}")]
    RootUnavailable(PathBuf),
}

/// How a failed apply is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff, then parked in the error set while still pending.
    Transient,
    /// Recorded for the path only; other paths carry on.
    PathLevel,
    /// Halts the engine.
    Fatal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Index(err) | EngineError::Transfer(TransferError::Index(err)) => {
                index_error_kind(err)
            }
            EngineError::Remote(err) => match err.classification() {
                ApiErrorClass::Auth => ErrorKind::Fatal,
                ApiErrorClass::RateLimit | ApiErrorClass::Transient => ErrorKind::Transient,
                ApiErrorClass::NotFound
                | ApiErrorClass::Conflict
                | ApiErrorClass::QuotaExceeded
                | ApiErrorClass::Permanent => ErrorKind::PathLevel,
            },
            EngineError::Transfer(TransferError::Io(err)) | EngineError::Io(err) => {
                io_error_kind(err)
            }
            EngineError::Transfer(TransferError::IntegrityMismatch { .. })
            | EngineError::Transfer(TransferError::Unstable(_)) => ErrorKind::Transient,
            EngineError::Transfer(TransferError::Trash(_)) | EngineError::Path(_) => {
                ErrorKind::PathLevel
            }
            EngineError::RootUnavailable(_) => ErrorKind::Fatal,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            EngineError::Remote(err) => err.retry_after_secs(),
            _ => None,
        }
    }
}

fn index_error_kind(err: &IndexError) -> ErrorKind {
    match err {
        IndexError::Sqlx(_) => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

fn io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ErrorKind::Transient
        }
        _ => ErrorKind::PathLevel,
    }
}

/// Settings that hold for one whole cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleConfig {
    pub ignore: IgnorePatterns,
    pub use_trash: bool,
}

/// Per-status counts for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub done: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub aborted: usize,
}

impl ApplySummary {
    fn record(&mut self, status: EventStatus) {
        match status {
            EventStatus::Done => self.done += 1,
            EventStatus::Conflict => self.conflicts += 1,
            EventStatus::Failed => self.failed += 1,
            EventStatus::Aborted => self.aborted += 1,
            EventStatus::Skipped | EventStatus::Queued | EventStatus::Syncing => self.skipped += 1,
        }
    }
}

/// Index writes that make one applied event durable. Everything goes into a
/// single transaction together with clearing the event's pending mark.
#[derive(Debug, Default)]
struct Commit {
    moves: Vec<(String, String)>,
    remove: Vec<String>,
    put: Vec<IndexEntry>,
    pending: Vec<(String, Direction)>,
    conflict: Option<(String, String, &'static str)>,
}

/// Applies normalized change batches to the opposite replica.
pub struct SyncEngine {
    client: Arc<dyn RemoteClient>,
    index: IndexStore,
    root: PathBuf,
    expected: ExpectedChanges,
    in_flight: InFlight,
    backoff: Backoff,
    user_name: OnceCell<String>,
    requeue_upload: Arc<Notify>,
    requeue_download: Arc<Notify>,
}

impl SyncEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        index: IndexStore,
        root: PathBuf,
        expected: ExpectedChanges,
    ) -> Self {
        Self {
            client,
            index,
            root,
            expected,
            in_flight: InFlight::default(),
            backoff: Backoff::default(),
            user_name: OnceCell::new(),
            requeue_upload: Arc::new(Notify::new()),
            requeue_download: Arc::new(Notify::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Notified whenever an apply leaves new work pending in `direction`.
    pub fn requeue_signal(&self, direction: Direction) -> Arc<Notify> {
        match direction {
            Direction::Upload => self.requeue_upload.clone(),
            Direction::Download => self.requeue_download.clone(),
        }
    }

    pub async fn apply_remote_changes(
        self: &Arc<Self>,
        events: Vec<SyncEvent>,
        config: &CycleConfig,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<ApplySummary, EngineError> {
        self.apply_changes(events, config, pool, cancel).await
    }

    pub async fn apply_local_changes(
        self: &Arc<Self>,
        events: Vec<SyncEvent>,
        config: &CycleConfig,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<ApplySummary, EngineError> {
        self.apply_changes(events, config, pool, cancel).await
    }

    /// Marks the sorted batch pending, then applies deletions, folders and
    /// moves one by one before handing files to the worker pool.
    ///
    /// Only fatal errors are returned. Cancelled work stays pending.
    async fn apply_changes(
        self: &Arc<Self>,
        events: Vec<SyncEvent>,
        config: &CycleConfig,
        pool: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<ApplySummary, EngineError> {
        let mut summary = ApplySummary::default();
        if events.is_empty() {
            return Ok(summary);
        }
        if !self.root.is_dir() {
            return Err(EngineError::RootUnavailable(self.root.clone()));
        }

        let batch = sort_hierarchically(events);
        self.mark_batch_pending(batch.sequential.iter().chain(&batch.parallel))
            .await?;
        tracing::debug!(
            sequential = batch.sequential.len(),
            parallel = batch.parallel.len(),
            "applying batch"
        );

        let config = Arc::new(config.clone());
        let batch_cancel = cancel.child_token();

        for event in batch.sequential {
            if batch_cancel.is_cancelled() {
                summary.record(EventStatus::Aborted);
                continue;
            }
            let status = self
                .clone()
                .process(event, config.clone(), batch_cancel.clone())
                .await?;
            summary.record(status);
        }

        let mut workers = JoinSet::new();
        for event in batch.parallel {
            let permit = tokio::select! {
                permit = pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        summary.record(EventStatus::Aborted);
                        continue;
                    }
                },
                _ = batch_cancel.cancelled() => {
                    summary.record(EventStatus::Aborted);
                    continue;
                }
            };
            let engine = self.clone();
            let config = config.clone();
            let cancel = batch_cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                engine.process(event, config, cancel).await
            });
        }

        let mut fatal = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(status)) => summary.record(status),
                Ok(Err(err)) => {
                    batch_cancel.cancel();
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "sync worker ended abnormally");
                    summary.record(EventStatus::Aborted);
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        tracing::info!(
            done = summary.done,
            skipped = summary.skipped,
            conflicts = summary.conflicts,
            failed = summary.failed,
            aborted = summary.aborted,
            "batch applied"
        );
        Ok(summary)
    }

    async fn mark_batch_pending(
        &self,
        events: impl Iterator<Item = &SyncEvent>,
    ) -> Result<(), IndexError> {
        let mut txn = self.index.begin().await?;
        for event in events {
            txn.mark_pending(&event.path, event.direction).await?;
            if let Some(from) = &event.path_from {
                txn.mark_pending(from, event.direction).await?;
            }
        }
        txn.commit().await
    }

    /// Claims the event's paths, waiting while overlapping work runs.
    async fn claim(
        &self,
        event: &SyncEvent,
        cancel: &CancellationToken,
    ) -> Option<Vec<InFlightGuard>> {
        let mut wanted = vec![event.path.as_str()];
        if let Some(from) = event.path_from.as_deref()
            && paths::normalize(from) != event.path_key()
        {
            wanted.push(from);
        }

        loop {
            let mut guards = Vec::with_capacity(wanted.len());
            for path in &wanted {
                match self.in_flight.try_claim(path, event.direction) {
                    Some(guard) => guards.push(guard),
                    None => break,
                }
            }
            if guards.len() == wanted.len() {
                return Some(guards);
            }
            drop(guards);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(CLAIM_RETRY) => {}
            }
        }
    }

    async fn process(
        self: Arc<Self>,
        event: SyncEvent,
        config: Arc<CycleConfig>,
        cancel: CancellationToken,
    ) -> Result<EventStatus, EngineError> {
        let Some(_claims) = self.claim(&event, &cancel).await else {
            return Ok(EventStatus::Aborted);
        };

        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(EventStatus::Aborted),
                result = self.apply_event(&event, &config) => result,
            };
            let err = match result {
                Ok(status) => return Ok(status),
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::Fatal => {
                    tracing::error!(path = %event.path, error = %err, "fatal sync error");
                    return Err(err);
                }
                ErrorKind::Transient if attempt + 1 < MAX_RETRY_ATTEMPTS => {
                    let delay = self.backoff.retry_delay(attempt, err.retry_after_secs());
                    attempt += 1;
                    tracing::warn!(
                        path = %event.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying sync"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(EventStatus::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                kind => {
                    self.park_failure(&event, &err, kind == ErrorKind::Transient)
                        .await?;
                    return Ok(EventStatus::Failed);
                }
            }
        }
    }

    async fn apply_event(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        match event.direction {
            Direction::Download => self.apply_download(event, config).await,
            Direction::Upload => self.apply_upload(event, config).await,
        }
    }

    /// Records the failure. Transient failures keep their pending mark so the
    /// next requeue retries them; path-level ones wait for a new change, a
    /// resume or a restart.
    async fn park_failure(
        &self,
        event: &SyncEvent,
        err: &EngineError,
        keep_pending: bool,
    ) -> Result<(), EngineError> {
        let title = match event.direction {
            Direction::Upload => "Could not upload",
            Direction::Download => "Could not download",
        };
        let mut failed = event.clone();
        failed.status = EventStatus::Failed;
        failed.timestamp = unix_now();

        let mut txn = self.index.begin().await?;
        txn.record_error(&SyncErrorRecord {
            path: event.path.clone(),
            direction: event.direction,
            title: title.to_string(),
            message: err.to_string(),
            created: unix_now(),
        })
        .await?;
        if !keep_pending {
            txn.clear_pending(&event.path, event.direction).await?;
            if let Some(from) = &event.path_from {
                txn.clear_pending(from, event.direction).await?;
            }
        }
        txn.append_event(&failed).await?;
        txn.commit().await?;

        tracing::warn!(
            path = %event.path,
            direction = event.direction.as_str(),
            error = %err,
            "sync failed for path"
        );
        Ok(())
    }

    /// Writes `commit` and the history entry for `event` (when `history` is
    /// set) in one transaction, clearing the event's pending and error rows.
    async fn commit(
        &self,
        event: &SyncEvent,
        history: Option<SyncEvent>,
        commit: Commit,
    ) -> Result<(), EngineError> {
        let mut txn = self.index.begin().await?;
        for (from, to) in &commit.moves {
            txn.move_entries(from, to).await?;
        }
        for path in &commit.remove {
            txn.remove(path).await?;
        }
        for entry in &commit.put {
            txn.put(entry).await?;
        }
        for path in std::iter::once(&event.path).chain(event.path_from.as_ref()) {
            txn.clear_pending(path, event.direction).await?;
            txn.clear_error(path, event.direction).await?;
        }
        for (path, direction) in &commit.pending {
            txn.mark_pending(path, *direction).await?;
        }
        if let Some((path, copy, reason)) = &commit.conflict {
            txn.record_conflict(path, copy, reason).await?;
        }
        if let Some(history) = &history {
            txn.append_event(history).await?;
        }
        txn.commit().await?;

        for (_, direction) in &commit.pending {
            self.requeue_signal(*direction).notify_one();
        }
        Ok(())
    }

    async fn user_name(&self) -> String {
        let fetched = self
            .user_name
            .get_or_try_init(|| async { self.client.account_display_name().await })
            .await;
        match fetched {
            Ok(name) => name.clone(),
            Err(err) => {
                tracing::warn!(error = %err, "could not fetch account name for conflict copies");
                String::new()
            }
        }
    }

    /// Free conflicting-copy name for `path`, checked against the local tree.
    async fn conflict_copy_name(&self, path: &str, is_dir: bool) -> String {
        let user = self.user_name().await;
        let candidate =
            conflicting_copy_path(path, &user, OffsetDateTime::now_utc().date(), is_dir);
        self.free_local_name(&candidate, is_dir)
    }

    fn free_local_name(&self, candidate: &str, is_dir: bool) -> String {
        unique_path(candidate, is_dir, |candidate| {
            local_path_for(&self.root, candidate)
                .is_ok_and(|local| local.symlink_metadata().is_ok())
        })
    }

    /// Files and folders below `local`, relative to the sync root.
    async fn local_tree(
        &self,
        local: &Path,
        ignore: &IgnorePatterns,
    ) -> Result<Vec<(String, bool)>, EngineError> {
        let root = self.root.clone();
        let dir = local.to_path_buf();
        let ignore = ignore.clone();
        let tree = tokio::task::spawn_blocking(move || walk_below(&root, &dir, &ignore))
            .await
            .map_err(io::Error::other)??;
        Ok(tree)
    }
}

/// The history entry for an event that finished with `status`.
fn finished(event: &SyncEvent, status: EventStatus) -> SyncEvent {
    let mut done = event.clone();
    done.status = status;
    done.timestamp = unix_now();
    if status == EventStatus::Done {
        done.completed = done.size;
    }
    done
}

include!("engine_impl_download.rs");
include!("engine_impl_upload.rs");
