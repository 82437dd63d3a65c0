use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use skysync_core::{FileMetadata, Metadata, RemoteClient};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use super::event::{ChangeType, Direction, ItemType, SyncEvent};
use super::ignore::IgnorePatterns;
use super::index::IndexStore;
use super::local_watcher::WatcherError;
use super::paths::{self, local_path_for};
use super::transfer;

/// The remote service refuses long-poll timeouts shorter than this.
pub const MIN_LONGPOLL_TIMEOUT: Duration = Duration::from_secs(30);

/// One processed page of the remote change feed.
#[derive(Debug, Clone)]
pub struct RemoteChanges {
    pub events: Vec<SyncEvent>,
    pub cursor: String,
    pub has_more: bool,
}

pub struct RemoteWatcher {
    client: Arc<dyn RemoteClient>,
    root: PathBuf,
    /// Keys deleted in the previous page, for type changes split across pages.
    recent_deletes: HashSet<String>,
}

impl RemoteWatcher {
    pub fn new(client: Arc<dyn RemoteClient>, root: PathBuf) -> Self {
        Self {
            client,
            root,
            recent_deletes: HashSet::new(),
        }
    }

    /// First page of a recursive listing of the whole account. Continue with
    /// [`Self::list_remote_changes`] while `has_more` is set.
    pub async fn full_listing(
        &mut self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
    ) -> Result<RemoteChanges, WatcherError> {
        self.recent_deletes.clear();
        let page = self.client.list_folder("/", true).await?;
        let events = self.normalize_page(page.entries, index, ignore).await?;
        Ok(RemoteChanges {
            events,
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    /// One page of changes after `cursor`. The caller persists the returned
    /// cursor only once the page's events are applied.
    pub async fn list_remote_changes(
        &mut self,
        cursor: &str,
        index: &IndexStore,
        ignore: &IgnorePatterns,
    ) -> Result<RemoteChanges, WatcherError> {
        let page = self.client.list_folder_continue(cursor).await?;
        let events = self.normalize_page(page.entries, index, ignore).await?;
        tracing::debug!(events = events.len(), has_more = page.has_more, "remote page processed");
        Ok(RemoteChanges {
            events,
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    /// Long-polls for changes after `cursor`. Returns whether there are any.
    pub async fn wait_for_remote_changes(
        &self,
        cursor: &str,
        timeout: Duration,
    ) -> Result<bool, WatcherError> {
        let result = self
            .client
            .wait_for_changes(cursor, timeout.max(MIN_LONGPOLL_TIMEOUT))
            .await?;
        if let Some(backoff) = result.backoff {
            tracing::debug!(backoff, "remote asked to back off before polling again");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
        }
        Ok(result.changes)
    }

    /// Rebuilds download events for paths left pending by an earlier cycle
    /// from what the remote holds now.
    pub async fn pending_download_events(
        &self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        let mut events = Vec::new();
        for pending in index.get_pending().await? {
            if pending.direction != Direction::Download {
                continue;
            }
            if ignore.should_skip_remote(&pending.path) {
                index.clear_pending(&pending.path, Direction::Download).await?;
                continue;
            }
            let indexed = index.get(&pending.path).await?;
            let (item_type, mut upsert) = match self.client.get_metadata(&pending.path).await? {
                Some(Metadata::File(file)) => (ItemType::File, file_event(file)),
                Some(Metadata::Folder(folder)) => (
                    ItemType::Folder,
                    download(ChangeType::Added, ItemType::Folder, &folder.path_display),
                ),
                Some(Metadata::Deleted(_)) | None => {
                    match indexed {
                        Some(entry) => events.push(download(
                            ChangeType::Removed,
                            entry.item_type,
                            &entry.path,
                        )),
                        None => {
                            index
                                .clear_pending(&pending.path, Direction::Download)
                                .await?
                        }
                    }
                    continue;
                }
            };
            if let Some(entry) = indexed {
                if entry.item_type != item_type {
                    events.push(download(ChangeType::Removed, entry.item_type, &entry.path));
                } else {
                    upsert.change_type = ChangeType::Modified;
                }
            }
            events.push(upsert);
        }
        Ok(events)
    }

    /// Collapses duplicate records (last one wins) and turns them into
    /// download events, consulting the index to tell additions from
    /// modifications and to spot type changes.
    async fn normalize_page(
        &mut self,
        entries: Vec<Metadata>,
        index: &IndexStore,
        ignore: &IgnorePatterns,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        let mut latest: HashMap<String, (usize, Metadata)> = HashMap::new();
        let mut deleted_here: HashSet<String> = HashSet::new();
        for (order, entry) in entries.into_iter().enumerate() {
            let key = paths::normalize(entry.path_lower());
            if entry.is_deleted() {
                deleted_here.insert(key.clone());
            }
            latest.insert(key, (order, entry));
        }

        let mut ordered: Vec<(usize, Metadata)> = latest.into_values().collect();
        ordered.sort_by_key(|(order, _)| *order);

        let mut events = Vec::with_capacity(ordered.len());
        for (_, entry) in ordered {
            let path = entry.path_display().to_string();
            if ignore.should_skip_remote(&path) {
                continue;
            }
            let key = paths::normalize(&path);
            let indexed = index.get(&path).await?;

            let (item_type, upsert) = match entry {
                Metadata::Deleted(_) => {
                    if let Some(entry) = indexed {
                        events.push(download(ChangeType::Removed, entry.item_type, &entry.path));
                    }
                    continue;
                }
                Metadata::File(file) => (ItemType::File, file_event(file)),
                Metadata::Folder(folder) => (
                    ItemType::Folder,
                    download(ChangeType::Added, ItemType::Folder, &folder.path_display),
                ),
            };

            let deleted_nearby = deleted_here.contains(&key) || self.recent_deletes.contains(&key);
            match indexed {
                Some(entry) if entry.item_type != item_type => {
                    events.push(download(ChangeType::Removed, entry.item_type, &entry.path));
                    events.push(upsert);
                }
                Some(_) if item_type == ItemType::Folder => {}
                Some(_) => {
                    let mut upsert = upsert;
                    upsert.change_type = ChangeType::Modified;
                    events.push(upsert);
                }
                None => {
                    if deleted_nearby && self.local_type_differs(&path, item_type).await? {
                        let old_type = match item_type {
                            ItemType::File => ItemType::Folder,
                            ItemType::Folder => ItemType::File,
                        };
                        events.push(download(ChangeType::Removed, old_type, &path));
                    }
                    events.push(upsert);
                }
            }
        }

        self.recent_deletes = deleted_here;
        Ok(events)
    }

    async fn local_type_differs(
        &self,
        path: &str,
        item_type: ItemType,
    ) -> Result<bool, WatcherError> {
        let snap = transfer::snapshot(&local_path_for(&self.root, path)?).await?;
        Ok(snap.is_some_and(|snap| snap.is_dir != (item_type == ItemType::Folder)))
    }
}

fn download(change: ChangeType, item_type: ItemType, path: &str) -> SyncEvent {
    SyncEvent::new(Direction::Download, change, item_type, path)
}

fn file_event(file: FileMetadata) -> SyncEvent {
    let mut event = download(ChangeType::Added, ItemType::File, &file.path_display)
        .with_rev(file.rev)
        .with_hash(file.content_hash)
        .with_size(file.size);
    event.change_time = file
        .server_modified
        .as_deref()
        .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok())
        .map(OffsetDateTime::unix_timestamp);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::IndexEntry;
    use serde_json::json;
    use skysync_core::HttpRemoteClient;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (TempDir, IndexStore, RemoteWatcher) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sync");
        std::fs::create_dir_all(&root).unwrap();
        let index = IndexStore::open(&dir.path().join("index.db")).await.unwrap();
        let client = HttpRemoteClient::with_base_url(&server.uri(), "token").unwrap();
        let watcher = RemoteWatcher::new(Arc::new(client), root);
        (dir, index, watcher)
    }

    fn file(path: &str, rev: &str) -> serde_json::Value {
        json!({
            ".tag": "file",
            "name": paths::file_name(path),
            "path_lower": path.to_lowercase(),
            "path_display": path,
            "rev": rev,
            "size": 4,
            "content_hash": format!("hash-{rev}"),
            "server_modified": "2024-01-02T03:04:05Z"
        })
    }

    async fn mount_continue(
        server: &MockServer,
        cursor: &str,
        entries: serde_json::Value,
        next: &str,
        has_more: bool,
    ) {
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/continue"))
            .and(body_json(json!({ "cursor": cursor })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": entries,
                "cursor": next,
                "has_more": has_more
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn duplicates_collapse_and_index_decides_added_or_modified() {
        let server = MockServer::start().await;
        let (_dir, index, mut watcher) = setup(&server).await;
        index
            .put(&IndexEntry::file("/Known.txt", "r0", None))
            .await
            .unwrap();
        mount_continue(
            &server,
            "c1",
            json!([file("/New.txt", "r1"), file("/Known.txt", "r2"), file("/New.txt", "r3")]),
            "c2",
            true,
        )
        .await;

        let changes = watcher
            .list_remote_changes("c1", &index, &IgnorePatterns::default())
            .await
            .unwrap();

        assert_eq!(changes.cursor, "c2");
        assert!(changes.has_more);
        assert_eq!(changes.events.len(), 2);
        assert_eq!(changes.events[0].path, "/Known.txt");
        assert_eq!(changes.events[0].change_type, ChangeType::Modified);
        assert_eq!(changes.events[1].path, "/New.txt");
        assert_eq!(changes.events[1].change_type, ChangeType::Added);
        assert_eq!(changes.events[1].rev.as_deref(), Some("r3"));
        assert_eq!(changes.events[1].change_time, Some(1_704_164_645));
    }

    #[tokio::test]
    async fn type_change_synthesizes_removal_first() {
        let server = MockServer::start().await;
        let (_dir, index, mut watcher) = setup(&server).await;
        index.put(&IndexEntry::folder("/Thing")).await.unwrap();
        mount_continue(
            &server,
            "c1",
            json!([
                {".tag": "deleted", "name": "Thing",
                 "path_lower": "/thing", "path_display": "/Thing"},
                file("/Thing", "r1")
            ]),
            "c2",
            false,
        )
        .await;

        let changes = watcher
            .list_remote_changes("c1", &index, &IgnorePatterns::default())
            .await
            .unwrap();

        let summary: Vec<(ChangeType, ItemType)> = changes
            .events
            .iter()
            .map(|event| (event.change_type, event.item_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeType::Removed, ItemType::Folder),
                (ChangeType::Added, ItemType::File)
            ]
        );
    }

    #[tokio::test]
    async fn delete_in_previous_page_with_local_type_mismatch_is_synthesized() {
        let server = MockServer::start().await;
        let (dir, index, mut watcher) = setup(&server).await;
        std::fs::create_dir_all(dir.path().join("sync/Thing")).unwrap();
        mount_continue(
            &server,
            "c1",
            json!([{
                ".tag": "deleted", "name": "Thing", "path_lower": "/thing", "path_display": "/Thing"
            }]),
            "c2",
            true,
        )
        .await;
        mount_continue(&server, "c2", json!([file("/Thing", "r1")]), "c3", false).await;

        let first = watcher
            .list_remote_changes("c1", &index, &IgnorePatterns::default())
            .await
            .unwrap();
        assert!(first.events.is_empty());
        let second = watcher
            .list_remote_changes(&first.cursor, &index, &IgnorePatterns::default())
            .await
            .unwrap();
        assert_eq!(second.events.len(), 2);
        assert_eq!(second.events[0].change_type, ChangeType::Removed);
        assert_eq!(second.events[0].item_type, ItemType::Folder);
    }

    #[tokio::test]
    async fn excluded_and_system_paths_are_filtered() {
        let server = MockServer::start().await;
        let (_dir, index, mut watcher) = setup(&server).await;
        mount_continue(
            &server,
            "c1",
            json!([
                file("/Photos/a.jpg", "r1"),
                file("/Docs/.DS_Store", "r2"),
                file("/Docs/a.txt", "r3")
            ]),
            "c2",
            false,
        )
        .await;

        let ignore = IgnorePatterns::new(&["/photos".to_string()]);
        let changes = watcher.list_remote_changes("c1", &index, &ignore).await.unwrap();
        assert_eq!(changes.events.len(), 1);
        assert_eq!(changes.events[0].path, "/Docs/a.txt");
    }

    #[tokio::test]
    async fn full_listing_lists_root_recursively() {
        let server = MockServer::start().await;
        let (_dir, index, mut watcher) = setup(&server).await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .and(body_json(json!({ "path": "", "recursive": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    {".tag": "folder", "name": "Docs",
                     "path_lower": "/docs", "path_display": "/Docs"},
                    file("/Docs/a.txt", "r1")
                ],
                "cursor": "c1",
                "has_more": false
            })))
            .mount(&server)
            .await;

        let changes = watcher
            .full_listing(&index, &IgnorePatterns::default())
            .await
            .unwrap();
        assert_eq!(changes.cursor, "c1");
        assert_eq!(changes.events.len(), 2);
        assert!(changes.events[0].is_folder());
    }

    #[tokio::test]
    async fn long_poll_reports_changes() {
        let server = MockServer::start().await;
        let (_dir, _index, watcher) = setup(&server).await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/longpoll"))
            .and(body_json(json!({ "cursor": "c1", "timeout": 30 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "changes": true })))
            .mount(&server)
            .await;

        assert!(
            watcher
                .wait_for_remote_changes("c1", Duration::from_secs(5))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn pending_downloads_are_rebuilt_from_remote_state() {
        let server = MockServer::start().await;
        let (_dir, index, watcher) = setup(&server).await;
        index
            .put(&IndexEntry::file("/doc.txt", "r1", None))
            .await
            .unwrap();
        index.put(&IndexEntry::file("/gone.txt", "r1", None)).await.unwrap();
        for path in ["/doc.txt", "/gone.txt", "/never.txt"] {
            index.mark_pending(path, Direction::Download).await.unwrap();
        }
        index.mark_pending("/upload.txt", Direction::Upload).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .and(body_json(json!({ "path": "/doc.txt" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(file("/doc.txt", "r2")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/get_metadata"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_json(json!({ "error_summary": "path/not_found/.." })),
            )
            .mount(&server)
            .await;

        let mut events = watcher
            .pending_download_events(&index, &IgnorePatterns::default())
            .await
            .unwrap();
        events.sort_by(|a, b| a.path.cmp(&b.path));

        let summary: Vec<(&str, ChangeType)> = events
            .iter()
            .map(|event| (event.path.as_str(), event.change_type))
            .collect();
        assert_eq!(
            summary,
            vec![("/doc.txt", ChangeType::Modified), ("/gone.txt", ChangeType::Removed)]
        );
        assert_eq!(events[0].rev.as_deref(), Some("r2"));
        assert!(!index.is_pending("/never.txt", Direction::Download).await.unwrap());
        assert!(index.is_pending("/upload.txt", Direction::Upload).await.unwrap());
    }
}
