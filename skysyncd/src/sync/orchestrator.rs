use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use skysync_core::RemoteClient;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::engine::{ApplySummary, CycleConfig, EngineError, ErrorKind, SyncEngine};
use super::event::{Direction, SyncEvent, unix_now};
use super::ignore::IgnorePatterns;
use super::index::{IndexError, IndexStore, STATE_LAST_REINDEX, STATE_REINDEX_POSITION};
use super::local_watcher::{ExpectedChanges, LocalWatcher, WatcherError};
use super::remote_watcher::{RemoteChanges, RemoteWatcher};
use super::status::{EngineStatus, StatusView};
use super::throttle::CpuThrottle;
use super::transfer::TransferError;

pub const MAX_WORKERS: usize = 16;
const EXPECTED_CHANGE_TTL: Duration = Duration::from_secs(5);
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(5);

const DEFAULT_REINDEX_INTERVAL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
const DEFAULT_HISTORY_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_HISTORY_MAX_COUNT: u32 = 1000;
const DEFAULT_ERROR_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("sync halted: {0}")]
    Halted(String),
}

impl OrchestratorError {
    fn is_corrupted(&self) -> bool {
        match self {
            OrchestratorError::Engine(EngineError::Index(err))
            | OrchestratorError::Engine(EngineError::Transfer(TransferError::Index(err)))
            | OrchestratorError::Watcher(WatcherError::Index(err))
            | OrchestratorError::Watcher(WatcherError::Transfer(TransferError::Index(err)))
            | OrchestratorError::Index(err) => err.is_corrupted(),
            _ => false,
        }
    }

    fn is_fatal(&self) -> bool {
        match self {
            OrchestratorError::Engine(err) => err.kind() == ErrorKind::Fatal,
            OrchestratorError::Watcher(err) => err.is_fatal(),
            OrchestratorError::Index(err) => !matches!(err, IndexError::Sqlx(_)),
            OrchestratorError::Halted(_) => true,
        }
    }
}

/// User-facing knobs. Each cycle works with the snapshot taken when it
/// started.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub excluded: Vec<String>,
    /// CPU budget per core, in percent. 0 disables pacing.
    pub max_cpu_percent: u32,
    pub reindex_interval: Duration,
    pub upload_workers: usize,
    pub download_workers: usize,
    pub history_max_age: Duration,
    pub history_max_count: u32,
    pub error_max_age: Duration,
    pub debounce: Duration,
    pub min_poll_interval: Duration,
    pub longpoll_timeout: Duration,
    pub maintenance_interval: Duration,
    pub use_trash: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            excluded: Vec::new(),
            max_cpu_percent: 20,
            reindex_interval: DEFAULT_REINDEX_INTERVAL,
            upload_workers: default_workers(),
            download_workers: default_workers(),
            history_max_age: DEFAULT_HISTORY_MAX_AGE,
            history_max_count: DEFAULT_HISTORY_MAX_COUNT,
            error_max_age: DEFAULT_ERROR_MAX_AGE,
            debounce: Duration::from_millis(500),
            min_poll_interval: Duration::from_secs(1),
            longpoll_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(10 * 60),
            use_trash: true,
        }
    }
}

/// Twice the core count, capped at [`MAX_WORKERS`].
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(1);
    (cores * 2).min(MAX_WORKERS)
}

/// What the sync has durably achieved so far plus the settings of the
/// running cycle. Reloaded from the index at every cycle boundary.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub cursor: Option<String>,
    pub pending_uploads: Vec<String>,
    pub pending_downloads: Vec<String>,
    pub last_reindex: Option<i64>,
    pub reindex_position: Option<String>,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub async fn load(index: &IndexStore, settings: SyncSettings) -> Result<Self, IndexError> {
        let mut pending_uploads = Vec::new();
        let mut pending_downloads = Vec::new();
        for pending in index.get_pending().await? {
            match pending.direction {
                Direction::Upload => pending_uploads.push(pending.path),
                Direction::Download => pending_downloads.push(pending.path),
            }
        }
        let last_reindex = match index.get_state(STATE_LAST_REINDEX).await? {
            Some(value) => Some(value.parse::<i64>().map_err(|_| {
                IndexError::InvalidValue(format!("{STATE_LAST_REINDEX} = {value}"))
            })?),
            None => None,
        };

        Ok(Self {
            cursor: index.get_cursor().await?,
            pending_uploads,
            pending_downloads,
            last_reindex,
            reindex_position: index.get_state(STATE_REINDEX_POSITION).await?,
            settings,
        })
    }

    pub async fn refresh(
        &mut self,
        index: &IndexStore,
        settings: SyncSettings,
    ) -> Result<(), IndexError> {
        *self = Self::load(index, settings).await?;
        Ok(())
    }

    pub fn needs_initial_listing(&self) -> bool {
        self.cursor.is_none()
    }

    /// An interrupted walk is resumed right away; a finished one is repeated
    /// once the reindex interval has passed.
    pub fn reindex_due(&self, now: i64) -> bool {
        if self.reindex_position.is_some() {
            return true;
        }
        match self.last_reindex {
            Some(last) => {
                now.saturating_sub(last) >= self.settings.reindex_interval.as_secs() as i64
            }
            None => true,
        }
    }

    /// Stores the position after a page whose events have been applied.
    pub async fn advance_cursor(
        &mut self,
        index: &IndexStore,
        cursor: String,
    ) -> Result<(), IndexError> {
        index.set_cursor(&cursor).await?;
        self.cursor = Some(cursor);
        Ok(())
    }
}

/// State shared by the cycles and the control handle.
struct Shared {
    engine: Arc<SyncEngine>,
    index: IndexStore,
    root: PathBuf,
    expected: ExpectedChanges,
    settings: watch::Receiver<SyncSettings>,
    status: watch::Sender<EngineStatus>,
    stop: CancellationToken,
    /// Cancelled on pause; replaced by a fresh child of `stop` on resume.
    work: Mutex<CancellationToken>,
    paused: watch::Sender<bool>,
    /// Cycles hold it shared; a rebuild holds it exclusively.
    gate: RwLock<()>,
    active: AtomicUsize,
    /// Set at start and on resume so paths parked in the error set get
    /// another attempt.
    retry_failed: AtomicBool,
}

impl Shared {
    fn settings(&self) -> SyncSettings {
        self.settings.borrow().clone()
    }

    fn work_token(&self) -> CancellationToken {
        self.work.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Cancels whatever runs now and, unless paused, lets new work start.
    fn restart_work(&self) {
        let mut work = self.work.lock().unwrap_or_else(PoisonError::into_inner);
        work.cancel();
        if !*self.paused.borrow() {
            *work = self.stop.child_token();
        }
    }

    fn cycle_config(&self, settings: &SyncSettings) -> CycleConfig {
        let ignore = IgnorePatterns::load(&self.root, &settings.excluded).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignore file is unusable, applying exclusions only");
            IgnorePatterns::new(&settings.excluded)
        });
        CycleConfig {
            ignore,
            use_trash: settings.use_trash,
        }
    }

    /// Returns false once the orchestrator is stopping.
    async fn wait_until_running(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.stop.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn apply(
        &self,
        direction: Direction,
        events: Vec<SyncEvent>,
        config: &CycleConfig,
        pool: &Arc<Semaphore>,
        work: &CancellationToken,
    ) -> Result<ApplySummary, EngineError> {
        let events = dedup_events(events);
        if events.is_empty() {
            return Ok(ApplySummary::default());
        }
        let _active = self.begin_cycle();
        let summary = match direction {
            Direction::Upload => {
                self.engine
                    .apply_local_changes(events, config, pool, work)
                    .await?
            }
            Direction::Download => {
                self.engine
                    .apply_remote_changes(events, config, pool, work)
                    .await?
            }
        };
        tracing::info!(
            direction = direction.as_str(),
            done = summary.done,
            skipped = summary.skipped,
            conflicts = summary.conflicts,
            failed = summary.failed,
            aborted = summary.aborted,
            "batch applied"
        );
        Ok(summary)
    }

    fn begin_cycle(&self) -> ActiveCycle<'_> {
        if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
            self.set_activity(EngineStatus::Syncing);
        }
        ActiveCycle { shared: self }
    }

    /// Switches between idle and syncing; paused and halted stick.
    fn set_activity(&self, next: EngineStatus) {
        self.status.send_if_modified(|status| match status {
            EngineStatus::Paused | EngineStatus::Halted(_) => false,
            current if *current == next => false,
            current => {
                *current = next;
                true
            }
        });
    }

    fn halt(&self, reason: String) {
        let first = self.status.send_if_modified(|status| {
            if matches!(status, EngineStatus::Halted(_)) {
                return false;
            }
            *status = EngineStatus::Halted(reason.clone());
            true
        });
        if first {
            tracing::error!(reason = %reason, "sync halted");
        }
        self.stop.cancel();
    }

    /// Decides how a failed cycle continues. Returns false when the loop
    /// must end.
    async fn recover(&self, err: OrchestratorError) -> bool {
        if err.is_corrupted() {
            tracing::warn!(error = %err, "index is corrupted");
            return match self.rebuild().await {
                Ok(()) => true,
                Err(rebuild_err) => {
                    self.halt(format!("index rebuild failed: {rebuild_err}"));
                    false
                }
            };
        }
        if err.is_fatal() {
            self.halt(err.to_string());
            return false;
        }
        tracing::warn!(error = %err, "sync cycle failed, retrying");
        self.sleep(ERROR_RETRY_DELAY).await
    }

    /// Forgets the index so the next cycles relist the remote and reindex
    /// the local tree.
    async fn rebuild(&self) -> Result<(), IndexError> {
        tracing::warn!("rebuilding the index");
        self.restart_work();
        {
            let _gate = self.gate.write().await;
            self.index.clear_all().await?;
        }
        self.engine.requeue_signal(Direction::Download).notify_one();
        self.engine.requeue_signal(Direction::Upload).notify_one();
        Ok(())
    }

    async fn retry_failed_paths(&self) -> Result<(), IndexError> {
        if !self.retry_failed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let requeued = match self.index.requeue_errors().await {
            Ok(requeued) => requeued,
            Err(err) => {
                self.retry_failed.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };
        if requeued > 0 {
            tracing::info!(requeued, "retrying paths that failed earlier");
            self.engine.requeue_signal(Direction::Download).notify_one();
            self.engine.requeue_signal(Direction::Upload).notify_one();
        }
        Ok(())
    }

    async fn maintain(&self, settings: &SyncSettings) -> Result<(), IndexError> {
        self.index.checkpoint().await?;
        let pruned = self
            .index
            .prune_events(settings.history_max_age, settings.history_max_count)
            .await?;
        let stale = self.index.prune_stale_errors(settings.error_max_age).await?;
        tracing::debug!(pruned, stale, "index maintenance done");

        let ctx = SyncContext::load(&self.index, settings.clone()).await?;
        if ctx.reindex_due(unix_now()) {
            self.engine.requeue_signal(Direction::Upload).notify_one();
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), OrchestratorError> {
        match &*self.status.borrow() {
            EngineStatus::Halted(reason) => Err(OrchestratorError::Halted(reason.clone())),
            _ => Ok(()),
        }
    }
}

struct ActiveCycle<'a> {
    shared: &'a Shared,
}

impl Drop for ActiveCycle<'_> {
    fn drop(&mut self) {
        if self.shared.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.set_activity(EngineStatus::Idle);
        }
    }
}

/// One event per path, change and item type; the first one wins.
fn dedup_events(events: Vec<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert((event.path_key(), event.change_type, event.item_type)))
        .collect()
}

struct WorkerPool {
    width: usize,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    fn new(width: usize) -> Self {
        let width = width.clamp(1, MAX_WORKERS);
        Self {
            width,
            slots: Arc::new(Semaphore::new(width)),
        }
    }

    fn resize(&mut self, width: usize) -> Arc<Semaphore> {
        let width = width.clamp(1, MAX_WORKERS);
        if width != self.width {
            tracing::debug!(from = self.width, to = width, "resizing worker pool");
            *self = Self::new(width);
        }
        self.slots.clone()
    }
}

struct DownloadSide {
    shared: Arc<Shared>,
    remote: RemoteWatcher,
    ctx: SyncContext,
    pool: WorkerPool,
    throttle: CpuThrottle,
}

impl DownloadSide {
    async fn cycle(&mut self, changed: bool) -> Result<(), OrchestratorError> {
        let shared = self.shared.clone();
        let settings = shared.settings();
        shared.retry_failed_paths().await?;
        self.ctx.refresh(&shared.index, settings.clone()).await?;
        let config = shared.cycle_config(&settings);
        let pool = self.pool.resize(settings.download_workers);
        let work = shared.work_token();
        let _gate = shared.gate.read().await;

        let pending = self
            .remote
            .pending_download_events(&shared.index, &config.ignore)
            .await?;
        shared
            .apply(Direction::Download, pending, &config, &pool, &work)
            .await?;

        if self.ctx.needs_initial_listing() {
            tracing::info!("listing the remote tree");
            let page = self.remote.full_listing(&shared.index, &config.ignore).await?;
            self.apply_pages(page, &config, &pool, &work).await?;
        } else if changed {
            if let Some(cursor) = self.ctx.cursor.clone() {
                let page = self
                    .remote
                    .list_remote_changes(&cursor, &shared.index, &config.ignore)
                    .await?;
                self.apply_pages(page, &config, &pool, &work).await?;
            }
        }
        Ok(())
    }

    /// Applies `page` and the ones after it. Each page's cursor is stored
    /// only after its events went through the engine.
    async fn apply_pages(
        &mut self,
        mut page: RemoteChanges,
        config: &CycleConfig,
        pool: &Arc<Semaphore>,
        work: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        loop {
            self.shared
                .apply(Direction::Download, page.events, config, pool, work)
                .await?;
            let cursor = page.cursor;
            self.ctx.advance_cursor(&self.shared.index, cursor.clone()).await?;
            if !page.has_more || work.is_cancelled() {
                return Ok(());
            }
            page = self
                .remote
                .list_remote_changes(&cursor, &self.shared.index, &config.ignore)
                .await?;
        }
    }

    async fn run(mut self) {
        let shared = self.shared.clone();
        let requeue = shared.engine.requeue_signal(Direction::Download);
        loop {
            if !shared.wait_until_running().await {
                return;
            }
            let settings = shared.settings();
            let work = shared.work_token();
            let timeout = settings.longpoll_timeout;
            let changed = match self.ctx.cursor.clone() {
                None => true,
                Some(cursor) => tokio::select! {
                    _ = work.cancelled() => continue,
                    _ = requeue.notified() => false,
                    polled = self.remote.wait_for_remote_changes(&cursor, timeout) => match polled {
                        Ok(changed) => changed,
                        Err(err) => {
                            if shared.recover(err.into()).await {
                                continue;
                            }
                            return;
                        }
                    },
                },
            };

            if let Err(err) = self.cycle(changed).await {
                if !shared.recover(err).await {
                    return;
                }
            }
            self.throttle.set_limit(settings.max_cpu_percent);
            self.throttle.pace().await;
            if !shared.sleep(settings.min_poll_interval).await {
                return;
            }
        }
    }
}

struct UploadSide {
    shared: Arc<Shared>,
    watcher: LocalWatcher,
    /// Changes made while the daemon was down only show up in a walk.
    walk_on_start: bool,
    ctx: SyncContext,
    pool: WorkerPool,
    throttle: CpuThrottle,
}

impl UploadSide {
    async fn cycle(&mut self, changed: bool) -> Result<(), OrchestratorError> {
        let shared = self.shared.clone();
        let settings = shared.settings();
        shared.retry_failed_paths().await?;
        self.ctx.refresh(&shared.index, settings.clone()).await?;
        self.watcher.set_debounce(settings.debounce);
        let config = shared.cycle_config(&settings);
        let pool = self.pool.resize(settings.upload_workers);
        let work = shared.work_token();
        let _gate = shared.gate.read().await;

        let mut events = self
            .watcher
            .pending_upload_events(&shared.index, &config.ignore)
            .await?;
        let overflow = self.watcher.take_overflow();
        let on_start = std::mem::take(&mut self.walk_on_start);
        if on_start || overflow || self.ctx.reindex_due(unix_now()) {
            if overflow {
                tracing::warn!("file notifications were lost, reindexing");
            }
            let position = self.ctx.reindex_position.clone();
            if let Some(position) = &position {
                tracing::info!(position = %position, "resuming local reindex");
            }
            events.extend(
                self.watcher
                    .reindex(&shared.index, &config.ignore, position.as_deref())
                    .await?,
            );
        }
        if changed {
            events.extend(
                self.watcher
                    .list_local_changes(&shared.index, &config.ignore)
                    .await?,
            );
        }
        shared
            .apply(Direction::Upload, events, &config, &pool, &work)
            .await?;
        Ok(())
    }

    async fn run(mut self) {
        let shared = self.shared.clone();
        let requeue = shared.engine.requeue_signal(Direction::Upload);
        loop {
            if !shared.wait_until_running().await {
                return;
            }
            let settings = shared.settings();
            let work = shared.work_token();
            let changed = tokio::select! {
                _ = work.cancelled() => continue,
                _ = requeue.notified() => false,
                changed = self.watcher.wait_for_local_changes(settings.longpoll_timeout) => changed,
            };

            if let Err(err) = self.cycle(changed).await {
                if !shared.recover(err).await {
                    return;
                }
            }
            self.throttle.set_limit(settings.max_cpu_percent);
            self.throttle.pace().await;
            if !shared.sleep(settings.min_poll_interval).await {
                return;
            }
        }
    }
}

async fn maintenance_loop(shared: Arc<Shared>) {
    loop {
        let settings = shared.settings();
        if !shared.sleep(settings.maintenance_interval).await
            || !shared.wait_until_running().await
        {
            return;
        }
        if let Err(err) = shared.maintain(&settings).await {
            if !shared.recover(err.into()).await {
                return;
            }
        }
    }
}

/// Runs the download, upload and maintenance cycles against one sync root.
pub struct Orchestrator {
    shared: Arc<Shared>,
    client: Arc<dyn RemoteClient>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        index: IndexStore,
        root: PathBuf,
        settings: watch::Receiver<SyncSettings>,
    ) -> Self {
        let expected = ExpectedChanges::new(EXPECTED_CHANGE_TTL);
        let engine = Arc::new(SyncEngine::new(
            client.clone(),
            index.clone(),
            root.clone(),
            expected.clone(),
        ));
        let stop = CancellationToken::new();
        let work = Mutex::new(stop.child_token());
        Self {
            shared: Arc::new(Shared {
                engine,
                index,
                root,
                expected,
                settings,
                status: watch::channel(EngineStatus::Idle).0,
                stop,
                work,
                paused: watch::channel(false).0,
                gate: RwLock::new(()),
                active: AtomicUsize::new(0),
                retry_failed: AtomicBool::new(true),
            }),
            client,
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Brings both replicas up to date, then keeps them in sync until
    /// stopped. Returns an error only when the sync halted.
    pub async fn run(self) -> Result<(), OrchestratorError> {
        let shared = self.shared.clone();
        let (mut download, mut upload) = match self.start().await {
            Ok(sides) => sides,
            Err(err) => {
                shared.halt(err.to_string());
                return shared.finish();
            }
        };

        // The remote tree goes first so the local walk compares against it.
        if let Err(err) = download.cycle(true).await {
            if !shared.recover(err).await {
                return shared.finish();
            }
        }
        if let Err(err) = upload.cycle(false).await {
            if !shared.recover(err).await {
                return shared.finish();
            }
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(download.run());
        tasks.spawn(upload.run());
        tasks.spawn(maintenance_loop(shared.clone()));
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                shared.halt(format!("sync task failed: {err}"));
            }
        }
        tracing::info!("sync stopped");
        shared.finish()
    }

    async fn start(self) -> Result<(DownloadSide, UploadSide), OrchestratorError> {
        let shared = self.shared;
        let settings = shared.settings();
        let ctx = match SyncContext::load(&shared.index, settings.clone()).await {
            Ok(ctx) => ctx,
            Err(err) if err.is_corrupted() => {
                tracing::warn!(error = %err, "index is corrupted");
                shared.rebuild().await?;
                SyncContext::load(&shared.index, settings.clone()).await?
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(
            root = %shared.root.display(),
            has_cursor = ctx.cursor.is_some(),
            pending_uploads = ctx.pending_uploads.len(),
            pending_downloads = ctx.pending_downloads.len(),
            "starting sync"
        );

        let watcher =
            LocalWatcher::start(&shared.root, shared.expected.clone(), settings.debounce)?;
        let download = DownloadSide {
            shared: shared.clone(),
            remote: RemoteWatcher::new(self.client, shared.root.clone()),
            ctx: ctx.clone(),
            pool: WorkerPool::new(settings.download_workers),
            throttle: CpuThrottle::new(settings.max_cpu_percent),
        };
        let upload = UploadSide {
            shared: shared.clone(),
            watcher,
            walk_on_start: true,
            ctx,
            pool: WorkerPool::new(settings.upload_workers),
            throttle: CpuThrottle::new(settings.max_cpu_percent),
        };
        Ok((download, upload))
    }
}

/// Controls a running [`Orchestrator`] from outside.
#[derive(Clone)]
pub struct OrchestratorHandle {
    shared: Arc<Shared>,
}

impl OrchestratorHandle {
    /// Cancels running transfers, which stay pending, and holds new cycles.
    pub fn pause(&self) {
        if matches!(self.status(), EngineStatus::Halted(_)) || *self.shared.paused.borrow() {
            return;
        }
        self.shared.paused.send_replace(true);
        self.shared.status.send_replace(EngineStatus::Paused);
        self.shared.restart_work();
        tracing::info!("sync paused");
    }

    pub fn resume(&self) {
        if !*self.shared.paused.borrow() {
            return;
        }
        self.shared.paused.send_replace(false);
        self.shared.retry_failed.store(true, Ordering::SeqCst);
        self.shared.restart_work();
        self.shared.status.send_if_modified(|status| {
            if *status != EngineStatus::Paused {
                return false;
            }
            *status = EngineStatus::Idle;
            true
        });
        self.shared.engine.requeue_signal(Direction::Download).notify_one();
        self.shared.engine.requeue_signal(Direction::Upload).notify_one();
        tracing::info!("sync resumed");
    }

    /// Ends all cycles without waiting for transfers.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    pub async fn rebuild_index(&self) -> Result<(), IndexError> {
        self.shared.rebuild().await
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn status_view(&self) -> StatusView {
        StatusView::new(
            self.shared.index.clone(),
            self.shared.engine.in_flight().clone(),
            self.shared.status.subscribe(),
        )
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
