use super::*;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use futures_util::TryStreamExt;
use skysync_core::StatusCode;
use tempfile::TempDir;

use crate::sync::backoff::Backoff;
use crate::sync::local_watcher::LocalWatcher;
use crate::sync::memory_remote::MemoryRemote;

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    index: IndexStore,
    remote: Arc<MemoryRemote>,
    engine: Arc<SyncEngine>,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
    config: CycleConfig,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sync");
    std::fs::create_dir_all(&root).unwrap();
    let index = IndexStore::open(&dir.path().join("index.db")).await.unwrap();
    let remote = Arc::new(MemoryRemote::default());
    let engine = Arc::new(new_engine(&remote, &index, &root));
    Harness {
        _dir: dir,
        root,
        index,
        remote,
        engine,
        pool: Arc::new(Semaphore::new(4)),
        cancel: CancellationToken::new(),
        config: CycleConfig::default(),
    }
}

fn new_engine(remote: &Arc<MemoryRemote>, index: &IndexStore, root: &Path) -> SyncEngine {
    let client: Arc<dyn RemoteClient> = remote.clone();
    SyncEngine::new(
        client,
        index.clone(),
        root.to_path_buf(),
        ExpectedChanges::new(Duration::from_secs(60)),
    )
    .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false))
}

fn upload_event(change: ChangeType, item: ItemType, path: &str) -> SyncEvent {
    SyncEvent::new(Direction::Upload, change, item, path)
}

impl Harness {
    fn local(&self, path: &str) -> PathBuf {
        local_path_for(&self.root, path).unwrap()
    }

    fn write(&self, path: &str, content: &[u8]) {
        let local = self.local(path);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(local, content).unwrap();
    }

    /// A local edit whose mtime is clearly after any earlier sync.
    fn edit(&self, path: &str, content: &[u8]) {
        self.write(path, content);
        let file = std::fs::File::options().write(true).open(self.local(path)).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.local(path)).ok()
    }

    fn exists(&self, path: &str) -> bool {
        self.local(path).symlink_metadata().is_ok()
    }

    /// Same file on both sides, recorded as synced.
    async fn synced_file(&self, path: &str, content: &[u8]) {
        let rev = self.remote.put_file(path, content);
        self.write(path, content);
        let snap = transfer::snapshot(&self.local(path)).await.unwrap().unwrap();
        let mut entry = IndexEntry::file(path, rev, Some(transfer::hash_bytes(content)));
        entry.inode = snap.inode;
        entry.last_sync = Some(snap.mtime);
        self.index.put(&entry).await.unwrap();
    }

    async fn synced_folder(&self, path: &str) {
        self.remote.put_folder(path);
        std::fs::create_dir_all(self.local(path)).unwrap();
        let mut entry = IndexEntry::folder(path);
        entry.last_sync = Some(unix_now_nanos());
        self.index.put(&entry).await.unwrap();
    }

    /// The download event the remote feed would report for `path` now.
    fn remote_event(&self, change: ChangeType, path: &str) -> SyncEvent {
        match self.remote.content(path) {
            Some(content) => SyncEvent::new(Direction::Download, change, ItemType::File, path)
                .with_rev(self.remote.rev_of(path).unwrap())
                .with_hash(Some(transfer::hash_bytes(&content)))
                .with_size(content.len() as u64),
            None if self.remote.exists(path) => {
                SyncEvent::new(Direction::Download, change, ItemType::Folder, path)
            }
            None => SyncEvent::new(Direction::Download, ChangeType::Removed, ItemType::File, path),
        }
    }

    async fn pull(&self, events: Vec<SyncEvent>) -> ApplySummary {
        self.engine
            .apply_remote_changes(events, &self.config, &self.pool, &self.cancel)
            .await
            .unwrap()
    }

    async fn push(&self, events: Vec<SyncEvent>) -> ApplySummary {
        self.engine
            .apply_local_changes(events, &self.config, &self.pool, &self.cancel)
            .await
            .unwrap()
    }

    /// Upload events for everything left pending, as a later cycle sees it.
    async fn pending_uploads(&self) -> Vec<SyncEvent> {
        let watcher = LocalWatcher::detached(
            &self.root,
            ExpectedChanges::new(Duration::from_secs(60)),
            Duration::from_millis(10),
        );
        watcher
            .pending_upload_events(&self.index, &self.config.ignore)
            .await
            .unwrap()
    }

    async fn history(&self) -> Vec<SyncEvent> {
        self.index.list_events(0).try_collect().await.unwrap()
    }

    async fn pending(&self) -> Vec<(String, Direction)> {
        self.index
            .get_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|pending| (pending.path, pending.direction))
            .collect()
    }

    /// Sync path and content of every local file.
    fn local_files(&self) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    dirs.push(path);
                } else {
                    let sync = paths::sync_path_for(&self.root, &path).unwrap();
                    files.push((sync, std::fs::read(&path).unwrap()));
                }
            }
        }
        files.sort();
        files
    }
}

fn copy_name(path: &str) -> String {
    conflicting_copy_path(path, "Alex", OffsetDateTime::now_utc().date(), false)
}
