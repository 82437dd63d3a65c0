use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use skysync_core::{ApiErrorClass, RemoteError};
use thiserror::Error;
use tokio::sync::mpsc;

use super::conflict::{CASE_CONFLICT_SUFFIX, suffixed_path, unique_path};
use super::event::{ChangeType, Direction, ItemType, SyncEvent, unix_now};
use super::ignore::IgnorePatterns;
use super::index::{IndexError, IndexStore, STATE_LAST_REINDEX, STATE_REINDEX_POSITION};
use super::paths::{self, PathError, local_path_for, sync_path_for};
use super::transfer::{self, FileSnapshot, TransferError};

const CHANNEL_CAPACITY: usize = 4096;
const REINDEX_SAVE_EVERY: usize = 256;
/// Upper bound on how long a steady stream of changes can extend the debounce.
const MAX_SETTLE_ROUNDS: u32 = 20;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("sync root is unavailable: {0}")]
    RootUnavailable(PathBuf),
}

impl WatcherError {
    pub fn is_fatal(&self) -> bool {
        match self {
            WatcherError::RootUnavailable(_) => true,
            WatcherError::Index(err) => err.is_corrupted(),
            WatcherError::Transfer(TransferError::Index(err)) => err.is_corrupted(),
            WatcherError::Remote(err) => err.classification() == ApiErrorClass::Auth,
            _ => false,
        }
    }
}

/// A filesystem notification reduced to sync paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    Created(String),
    Modified(String),
    Removed(String),
    Moved { from: String, to: String },
}

/// The folded outcome for one path (or one move) after a debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Added(String),
    Modified(String),
    Removed(String),
    Moved { from: String, to: String },
}

fn map_event(root: &Path, event: Event) -> Vec<RawChange> {
    let to_sync = |path: &PathBuf| sync_path_for(root, path).filter(|path| path != "/");
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => {
                if event.paths.len() >= 2
                    && let (Some(from), Some(to)) =
                        (to_sync(&event.paths[0]), to_sync(&event.paths[1]))
                {
                    return vec![RawChange::Moved { from, to }];
                }
                Vec::new()
            }
            RenameMode::From => event
                .paths
                .iter()
                .filter_map(to_sync)
                .map(RawChange::Removed)
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .filter_map(to_sync)
                .map(RawChange::Created)
                .collect(),
            _ => event
                .paths
                .iter()
                .filter_map(|path| {
                    let sync = to_sync(path)?;
                    Some(if path.symlink_metadata().is_ok() {
                        RawChange::Created(sync)
                    } else {
                        RawChange::Removed(sync)
                    })
                })
                .collect(),
        },
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(to_sync)
            .map(RawChange::Created)
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(to_sync)
            .map(RawChange::Modified)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(to_sync)
            .map(RawChange::Removed)
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathChange {
    Created,
    Modified,
    Removed,
}

/// Folds raw notifications into at most one change per path plus a list of
/// moves.
#[derive(Debug, Default)]
pub struct LocalChangeCollector {
    changes: HashMap<String, (usize, String, PathChange)>,
    moves: Vec<(usize, String, String)>,
    seq: usize,
}

impl LocalChangeCollector {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.moves.is_empty()
    }

    pub fn push(&mut self, change: RawChange) {
        self.seq += 1;
        match change {
            RawChange::Created(path) => self.fold(path, PathChange::Created),
            RawChange::Modified(path) => self.fold(path, PathChange::Modified),
            RawChange::Removed(path) => {
                let key = paths::normalize(&path);
                if let Some(pos) = self
                    .moves
                    .iter()
                    .position(|(_, _, to)| paths::normalize(to) == key)
                {
                    let (_, from, _) = self.moves.remove(pos);
                    self.fold(from, PathChange::Removed);
                } else {
                    self.fold(path, PathChange::Removed);
                }
            }
            RawChange::Moved { from, to } => self.push_move(from, to),
        }
    }

    fn fold(&mut self, path: String, next: PathChange) {
        let key = paths::normalize(&path);
        let Some((seq, display, prev)) = self.changes.remove(&key) else {
            self.changes.insert(key, (self.seq, path, next));
            return;
        };
        let folded = match (prev, next) {
            (PathChange::Created, PathChange::Removed) => None,
            (PathChange::Created, _) => Some(PathChange::Created),
            (PathChange::Removed, PathChange::Removed) => Some(PathChange::Removed),
            (PathChange::Removed, _) => Some(PathChange::Modified),
            (PathChange::Modified, PathChange::Removed) => Some(PathChange::Removed),
            (PathChange::Modified, _) => Some(PathChange::Modified),
        };
        if let Some(state) = folded {
            let display = if next == PathChange::Removed { display } else { path };
            self.changes.insert(key, (seq, display, state));
        }
    }

    fn push_move(&mut self, from: String, to: String) {
        let from_key = paths::normalize(&from);

        if let Some((_, _, prev)) = self.changes.get(&from_key).cloned() {
            match prev {
                PathChange::Created => {
                    self.changes.remove(&from_key);
                    self.fold(to, PathChange::Created);
                    return;
                }
                PathChange::Modified => {
                    self.changes.remove(&from_key);
                    self.fold(to.clone(), PathChange::Modified);
                }
                PathChange::Removed => {}
            }
        }

        if let Some(pos) = self
            .moves
            .iter()
            .position(|(_, _, prev_to)| paths::normalize(prev_to) == from_key)
        {
            // a -> b -> c becomes a -> c; a -> b -> a cancels out.
            if self.moves[pos].1 == to {
                self.moves.remove(pos);
            } else {
                self.moves[pos].2 = to;
            }
            return;
        }

        self.moves.push((self.seq, from, to));
    }

    /// Returns the folded changes in arrival order. Moves of children inside a
    /// moved folder are dropped in favour of the folder move.
    pub fn drain(&mut self) -> Vec<LocalChange> {
        let moves = std::mem::take(&mut self.moves);
        let changes = std::mem::take(&mut self.changes);

        let mut out: Vec<(usize, LocalChange)> = Vec::with_capacity(moves.len() + changes.len());
        for (seq, from, to) in &moves {
            let covered = moves.iter().any(|(_, parent_from, parent_to)| {
                paths::is_child(from, parent_from)
                    && paths::is_child(to, parent_to)
                    && relative_tail(from, parent_from) == relative_tail(to, parent_to)
            });
            if !covered {
                out.push((
                    *seq,
                    LocalChange::Moved {
                        from: from.clone(),
                        to: to.clone(),
                    },
                ));
            }
        }
        for (_, (seq, path, state)) in changes {
            let change = match state {
                PathChange::Created => LocalChange::Added(path),
                PathChange::Modified => LocalChange::Modified(path),
                PathChange::Removed => LocalChange::Removed(path),
            };
            out.push((seq, change));
        }
        out.sort_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, change)| change).collect()
    }
}

fn relative_tail(path: &str, ancestor: &str) -> String {
    let path = paths::normalize(path);
    let ancestor = paths::normalize(ancestor);
    path.get(ancestor.len()..).unwrap_or_default().to_string()
}

/// Paths the engine is changing itself.
///
/// Each expectation matches the first notification for its exact path. Only
/// folder removals also cover what lies below. An entry expires `ttl` after
/// its [`Expected`] guard is dropped.
#[derive(Debug, Clone)]
pub struct ExpectedChanges {
    inner: Arc<Mutex<HashMap<String, Expectation>>>,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Expectation {
    /// `None` while the operation still runs.
    deadline: Option<Instant>,
    tree: bool,
}

impl ExpectedChanges {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn expect(&self, path: &str) -> Expected {
        self.insert(path, false)
    }

    /// Covers `path` and everything below it, for removing a folder.
    pub fn expect_tree(&self, path: &str) -> Expected {
        self.insert(path, true)
    }

    fn insert(&self, path: &str, tree: bool) -> Expected {
        let key = paths::normalize(path);
        let mut map = self.lock();
        let expectation = map.entry(key.clone()).or_insert(Expectation { deadline: None, tree });
        expectation.deadline = None;
        expectation.tree |= tree;
        drop(map);
        Expected {
            changes: self.clone(),
            key,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Expectation>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when a notification for `path` came from the engine. An exact
    /// match is used up.
    pub fn take(&self, path: &str) -> bool {
        let mut map = self.lock();
        let now = Instant::now();
        map.retain(|_, expectation| expectation.deadline.is_none_or(|deadline| deadline > now));

        let key = paths::normalize(path);
        if map.get(&key).is_some_and(|expectation| !expectation.tree) {
            map.remove(&key);
            return true;
        }
        map.iter().any(|(expected, expectation)| {
            expectation.tree && paths::is_equal_or_child(&key, expected)
        })
    }
}

/// Keeps an expectation open until the operation is done.
#[must_use = "the expectation expires once the guard is dropped"]
#[derive(Debug)]
pub struct Expected {
    changes: ExpectedChanges,
    key: String,
}

impl Drop for Expected {
    fn drop(&mut self) {
        let deadline = Instant::now() + self.changes.ttl;
        if let Some(expectation) = self.changes.lock().get_mut(&self.key) {
            expectation.deadline = Some(deadline);
        }
    }
}

/// How much work [`LocalWatcher::state_events`] may do to prove a file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCheck {
    /// A notification arrived: trust it without hashing.
    Notified,
    /// Walk: only files with an mtime after the last sync are hashed.
    Reindex,
    /// Requeue: hash regardless of mtime.
    Pending,
}

pub struct LocalWatcher {
    root: PathBuf,
    _watcher: Option<RecommendedWatcher>,
    tx: mpsc::Sender<RawChange>,
    rx: mpsc::Receiver<RawChange>,
    overflow: Arc<AtomicBool>,
    collector: LocalChangeCollector,
    expected: ExpectedChanges,
    debounce: Duration,
}

impl LocalWatcher {
    /// Watches `root` recursively with the platform's recommended backend.
    pub fn start(
        root: &Path,
        expected: ExpectedChanges,
        debounce: Duration,
    ) -> Result<Self, WatcherError> {
        if !root.is_dir() {
            return Err(WatcherError::RootUnavailable(root.to_path_buf()));
        }
        let mut watcher = Self::detached(root, expected, debounce);
        let tx = watcher.tx.clone();
        let overflow = watcher.overflow.clone();
        let watch_root = root.to_path_buf();
        let mut notify_watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in map_event(&watch_root, event) {
                        if tx.try_send(change).is_err() {
                            overflow.store(true, Ordering::Relaxed);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "file watcher reported an error");
                    overflow.store(true, Ordering::Relaxed);
                }
            })?;
        notify_watcher.watch(root, RecursiveMode::Recursive)?;
        watcher._watcher = Some(notify_watcher);
        Ok(watcher)
    }

    /// A watcher without an OS backend; changes arrive through [`Self::sender`].
    pub fn detached(root: &Path, expected: ExpectedChanges, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            root: root.to_path_buf(),
            _watcher: None,
            tx,
            rx,
            overflow: Arc::new(AtomicBool::new(false)),
            collector: LocalChangeCollector::default(),
            expected,
            debounce,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<RawChange> {
        self.tx.clone()
    }

    pub fn set_debounce(&mut self, debounce: Duration) {
        self.debounce = debounce;
    }

    /// True once after notifications were lost; a reindex should follow.
    pub fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::Relaxed)
    }

    /// Waits up to `timeout` for a notification, then keeps collecting until
    /// the debounce window passes quietly.
    pub async fn wait_for_local_changes(&mut self, timeout: Duration) -> bool {
        if self.collector.is_empty() {
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Some(change)) => self.collector.push(change),
                Ok(None) | Err(_) => return false,
            }
        }

        let mut rounds = 0;
        while rounds < MAX_SETTLE_ROUNDS {
            match tokio::time::timeout(self.debounce, self.rx.recv()).await {
                Ok(Some(change)) => {
                    self.collector.push(change);
                    while let Ok(change) = self.rx.try_recv() {
                        self.collector.push(change);
                    }
                }
                Ok(None) | Err(_) => break,
            }
            rounds += 1;
        }
        !self.collector.is_empty()
    }

    /// Turns the collected notifications into upload events, dropping ignored
    /// and self-generated changes.
    pub async fn list_local_changes(
        &mut self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        while let Ok(change) = self.rx.try_recv() {
            self.collector.push(change);
        }

        let mut events = Vec::new();
        for change in self.collector.drain() {
            match change {
                LocalChange::Moved { from, to } => {
                    let from_ours = self.expected.take(&from);
                    if self.expected.take(&to) && from_ours {
                        continue;
                    }
                    events.extend(self.move_events(index, ignore, &from, &to).await?);
                }
                LocalChange::Removed(path) => {
                    if self.expected.take(&path) {
                        continue;
                    }
                    events.extend(
                        self.state_events(index, ignore, &path, ChangeCheck::Notified)
                            .await?,
                    );
                }
                LocalChange::Added(path) | LocalChange::Modified(path) => {
                    // The engine's own write may share a debounce window with
                    // a user edit, so an expected path is compared by content.
                    let check = if self.expected.take(&path) {
                        ChangeCheck::Pending
                    } else {
                        ChangeCheck::Notified
                    };
                    events.extend(self.state_events(index, ignore, &path, check).await?);
                }
            }
        }
        Ok(events)
    }

    async fn move_events(
        &self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
        from: &str,
        to: &str,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        let to_snap = transfer::snapshot(&local_path_for(&self.root, to)?).await?;
        let is_dir = to_snap.is_some_and(|snap| snap.is_dir);
        let from_skipped = ignore.should_skip_local(from, is_dir);
        let to_skipped = ignore.should_skip_local(to, is_dir);

        match (from_skipped, to_skipped) {
            (true, true) => Ok(Vec::new()),
            (false, true) => self.state_events(index, ignore, from, ChangeCheck::Notified).await,
            (true, false) => self.state_events(index, ignore, to, ChangeCheck::Notified).await,
            (false, false) => {
                let Some(snap) = to_snap else {
                    return self.state_events(index, ignore, from, ChangeCheck::Notified).await;
                };
                if index.get(from).await?.is_none() {
                    return self.state_events(index, ignore, to, ChangeCheck::Notified).await;
                }
                let item_type = if snap.is_dir { ItemType::Folder } else { ItemType::File };
                let mut event = SyncEvent::new(Direction::Upload, ChangeType::Moved, item_type, to)
                    .moved_from(from)
                    .with_size(snap.size);
                event.change_time = Some(snap.mtime / 1_000_000_000);
                Ok(vec![event])
            }
        }
    }

    /// Derives the upload events for one path by comparing what is on disk
    /// with the index.
    pub async fn state_events(
        &self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
        path: &str,
        check: ChangeCheck,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        let local = local_path_for(&self.root, path)?;
        let snap = transfer::snapshot(&local).await?;
        let is_dir = snap.is_some_and(|snap| snap.is_dir);
        if IgnorePatterns::is_always_excluded(path) || ignore.matches_rules(path, is_dir) {
            return Ok(Vec::new());
        }
        let indexed = index.get(path).await?;
        if ignore.is_excluded(path) {
            // Created by the user inside an excluded folder: the engine decides
            // whether it clashes with the remote item.
            return Ok(match snap {
                Some(snap) if check != ChangeCheck::Reindex && indexed.is_none() => {
                    let item_type = if snap.is_dir { ItemType::Folder } else { ItemType::File };
                    vec![
                        SyncEvent::new(Direction::Upload, ChangeType::Added, item_type, path)
                            .with_size(snap.size),
                    ]
                }
                _ => Vec::new(),
            });
        }

        let Some(snap) = snap else {
            let Some(entry) = indexed else {
                return Ok(Vec::new());
            };
            if entry.path != path
                && transfer::snapshot(&local_path_for(&self.root, &entry.path)?)
                    .await?
                    .is_some()
            {
                return Ok(Vec::new());
            }
            let item_type = entry.item_type;
            return Ok(vec![SyncEvent::new(
                Direction::Upload,
                ChangeType::Removed,
                item_type,
                entry.path,
            )]);
        };

        let item_type = if snap.is_dir { ItemType::Folder } else { ItemType::File };
        let upload = |change: ChangeType, item_type: ItemType, path: &str| {
            let size = if snap.is_dir { 0 } else { snap.size };
            let mut event =
                SyncEvent::new(Direction::Upload, change, item_type, path).with_size(size);
            event.change_time = Some(snap.mtime / 1_000_000_000);
            event
        };

        let Some(entry) = indexed else {
            return Ok(vec![upload(ChangeType::Added, item_type, path)]);
        };

        if entry.path != path {
            let tracked = local_path_for(&self.root, &entry.path)?;
            if let Some(tracked_snap) = transfer::snapshot(&tracked).await?
                && tracked_snap.inode != snap.inode
            {
                let renamed = self.rename_case_conflict(path, &snap).await?;
                return Ok(vec![upload(ChangeType::Added, item_type, &renamed)]);
            }
            let mut event = upload(ChangeType::Moved, item_type, path);
            event.path_from = Some(entry.path.clone());
            return Ok(vec![event]);
        }

        if entry.is_folder() != snap.is_dir {
            return Ok(vec![
                SyncEvent::new(Direction::Upload, ChangeType::Removed, entry.item_type, path),
                upload(ChangeType::Added, item_type, path),
            ]);
        }
        if snap.is_dir {
            return Ok(Vec::new());
        }

        let changed = match check {
            ChangeCheck::Notified => true,
            ChangeCheck::Reindex if snap.mtime <= entry.last_sync.unwrap_or(0) => false,
            ChangeCheck::Reindex | ChangeCheck::Pending => {
                let hash = transfer::cached_hash(index, &local, &snap).await?;
                entry.content_hash.as_deref() != Some(hash.as_str())
            }
        };
        if changed {
            Ok(vec![upload(ChangeType::Modified, item_type, path)])
        } else {
            Ok(Vec::new())
        }
    }

    /// Renames a local item whose name clashes with a tracked item by case only.
    async fn rename_case_conflict(
        &self,
        path: &str,
        snap: &FileSnapshot,
    ) -> Result<String, WatcherError> {
        let candidate = suffixed_path(path, CASE_CONFLICT_SUFFIX, snap.is_dir);
        let root = self.root.clone();
        let renamed = unique_path(&candidate, snap.is_dir, |candidate| {
            local_path_for(&root, candidate).is_ok_and(|local| local.symlink_metadata().is_ok())
        });

        let _from = self.expected.expect(path);
        let _to = self.expected.expect(&renamed);
        tokio::fs::rename(
            local_path_for(&self.root, path)?,
            local_path_for(&self.root, &renamed)?,
        )
        .await?;
        tracing::info!(
            path,
            renamed = %renamed,
            "renamed local item that differs from a synced item only by case"
        );
        Ok(renamed)
    }
}

include!("local_watcher_reindex.rs");

#[cfg(test)]
#[path = "local_watcher_tests.rs"]
mod tests;
