use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use skysync_core::{
    DeletedMetadata, FileMetadata, FolderMetadata, ListFolderPage, LongpollResult, Metadata,
    RemoteClient, RemoteError, StatusCode, WriteMode,
};

use super::conflict::{suffixed_path, unique_path};
use super::paths;
use super::transfer;

#[derive(Debug, Clone)]
enum Node {
    File { path: String, rev: String, content: Vec<u8> },
    Folder { path: String },
}

impl Node {
    fn path(&self) -> &str {
        match self {
            Node::File { path, .. } | Node::Folder { path } => path,
        }
    }

    fn metadata(&self) -> Metadata {
        match self {
            Node::File { path, rev, content } => Metadata::File(file_meta(path, rev, content)),
            Node::Folder { path } => Metadata::Folder(FolderMetadata {
                name: paths::file_name(path).to_string(),
                path_lower: paths::normalize(path),
                path_display: path.clone(),
                id: None,
            }),
        }
    }
}

fn file_meta(path: &str, rev: &str, content: &[u8]) -> FileMetadata {
    FileMetadata {
        name: paths::file_name(path).to_string(),
        path_lower: paths::normalize(path),
        path_display: path.to_string(),
        id: None,
        rev: rev.to_string(),
        size: content.len() as u64,
        content_hash: Some(transfer::hash_bytes(content)),
        server_modified: None,
        client_modified: None,
    }
}

fn not_found() -> RemoteError {
    RemoteError::api(StatusCode::CONFLICT, "path/not_found/")
}

fn conflict() -> RemoteError {
    RemoteError::api(StatusCode::CONFLICT, "path/conflict/file/")
}

#[derive(Default)]
struct RemoteState {
    nodes: BTreeMap<String, Node>,
    next_rev: u64,
    failures: VecDeque<RemoteError>,
    /// One-shot failures for downloads of a given path key.
    download_failures: HashMap<String, RemoteError>,
    /// Display paths in the order they changed; a cursor is an offset here.
    changes: Vec<String>,
}

impl RemoteState {
    fn rev(&mut self) -> String {
        self.next_rev += 1;
        format!("rev{}", self.next_rev)
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut parent = paths::parent_path(path);
        while let Some(dir) = parent {
            if dir == "/" {
                break;
            }
            self.insert(Node::Folder { path: dir.clone() }, false);
            parent = paths::parent_path(&dir);
        }
    }

    fn write(&mut self, path: &str, content: Vec<u8>) -> FileMetadata {
        self.ensure_parents(path);
        let rev = self.rev();
        let meta = file_meta(path, &rev, &content);
        self.insert(
            Node::File {
                path: path.to_string(),
                rev,
                content,
            },
            true,
        );
        meta
    }

    /// Adds `node`, keeping an existing entry unless `replace` is set.
    fn insert(&mut self, node: Node, replace: bool) {
        let key = paths::normalize(node.path());
        if !replace && self.nodes.contains_key(&key) {
            return;
        }
        self.changes.push(node.path().to_string());
        self.nodes.insert(key, node);
    }

    fn cursor(&self) -> String {
        format!("mem-{}", self.changes.len())
    }

    fn changes_since(&self, cursor: &str) -> Vec<Metadata> {
        let offset = cursor
            .strip_prefix("mem-")
            .and_then(|offset| offset.parse::<usize>().ok())
            .unwrap_or(0);
        self.changes
            .iter()
            .skip(offset)
            .map(|path| match self.nodes.get(&paths::normalize(path)) {
                Some(node) => node.metadata(),
                None => Metadata::Deleted(DeletedMetadata {
                    name: paths::file_name(path).to_string(),
                    path_lower: paths::normalize(path),
                    path_display: path.clone(),
                }),
            })
            .collect()
    }

    fn free_name(&self, path: &str, is_dir: bool) -> String {
        unique_path(&suffixed_path(path, "conflicted copy", is_dir), is_dir, |candidate| {
            self.nodes.contains_key(&paths::normalize(candidate))
        })
    }

    fn take_failure(&mut self) -> Result<(), RemoteError> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn remove_tree(&mut self, key: &str) -> Vec<Node> {
        let keys: Vec<String> = self
            .nodes
            .keys()
            .filter(|candidate| paths::is_equal_or_child(candidate, key))
            .cloned()
            .collect();
        let removed: Vec<Node> = keys.iter().filter_map(|key| self.nodes.remove(key)).collect();
        self.changes
            .extend(removed.iter().map(|node| node.path().to_string()));
        removed
    }
}

/// Remote storage held in memory, case-insensitive like the real service.
#[derive(Default)]
pub(crate) struct MemoryRemote {
    state: Mutex<RemoteState>,
    pub(crate) upload_calls: AtomicUsize,
    /// Uploads after this many calls never finish.
    hang_after: Mutex<Option<usize>>,
}

impl MemoryRemote {
    pub(crate) fn put_file(&self, path: &str, content: &[u8]) -> String {
        self.state.lock().unwrap().write(path, content.to_vec()).rev
    }

    pub(crate) fn put_folder(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        state.ensure_parents(path);
        state.insert(
            Node::Folder {
                path: path.to_string(),
            },
            true,
        );
    }

    pub(crate) fn remove(&self, path: &str) {
        self.state.lock().unwrap().remove_tree(&paths::normalize(path));
    }

    pub(crate) fn content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(&paths::normalize(path)) {
            Some(Node::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    pub(crate) fn rev_of(&self, path: &str) -> Option<String> {
        match self.state.lock().unwrap().nodes.get(&paths::normalize(path)) {
            Some(Node::File { rev, .. }) => Some(rev.clone()),
            _ => None,
        }
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .nodes
            .contains_key(&paths::normalize(path))
    }

    /// Display path and content of every file.
    pub(crate) fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter_map(|node| match node {
                Node::File { path, content, .. } => Some((path.clone(), content.clone())),
                Node::Folder { .. } => None,
            })
            .collect()
    }

    pub(crate) fn fail_next(&self, err: RemoteError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// Fails the next download of `path` only.
    pub(crate) fn fail_download(&self, path: &str, err: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .download_failures
            .insert(paths::normalize(path), err);
    }

    pub(crate) fn hang_uploads_after(&self, calls: Option<usize>) {
        *self.hang_after.lock().unwrap() = calls;
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn list_folder(
        &self,
        path: &str,
        _recursive: bool,
    ) -> Result<ListFolderPage, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        let key = paths::normalize(path);
        let entries = state
            .nodes
            .iter()
            .filter(|(candidate, _)| key == "/" || paths::is_child(candidate, &key))
            .map(|(_, node)| node.metadata())
            .collect();
        Ok(ListFolderPage {
            entries,
            cursor: state.cursor(),
            has_more: false,
        })
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderPage, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        Ok(ListFolderPage {
            entries: state.changes_since(cursor),
            cursor: state.cursor(),
            has_more: false,
        })
    }

    /// Answers at once instead of holding the poll open.
    async fn wait_for_changes(
        &self,
        cursor: &str,
        _timeout: Duration,
    ) -> Result<LongpollResult, RemoteError> {
        let state = self.state.lock().unwrap();
        Ok(LongpollResult {
            changes: !state.changes_since(cursor).is_empty(),
            backoff: None,
        })
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        Ok(state.nodes.get(&paths::normalize(path)).map(Node::metadata))
    }

    async fn download(&self, path: &str) -> Result<(FileMetadata, Vec<u8>), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        if let Some(err) = state.download_failures.remove(&paths::normalize(path)) {
            return Err(err);
        }
        match state.nodes.get(&paths::normalize(path)) {
            Some(Node::File { path, rev, content }) => {
                Ok((file_meta(path, rev, content), content.clone()))
            }
            _ => Err(not_found()),
        }
    }

    async fn upload(
        &self,
        path: &str,
        content: Vec<u8>,
        mode: WriteMode,
        autorename: bool,
    ) -> Result<FileMetadata, RemoteError> {
        let calls = self.upload_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let hang = self.hang_after.lock().unwrap().is_some_and(|after| calls > after);
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        let existing = state.nodes.get(&paths::normalize(path)).cloned();
        let clashes = match (&existing, &mode) {
            (None, _) => false,
            (Some(Node::Folder { .. }), _) => true,
            (Some(Node::File { rev, content: current, path: stored }), mode) => {
                if *current == content {
                    return Ok(file_meta(stored, rev, current));
                }
                match mode {
                    WriteMode::Add => true,
                    WriteMode::Overwrite => false,
                    WriteMode::Update(expected) => expected != rev,
                }
            }
        };
        if !clashes {
            let target = existing.as_ref().map_or(path, Node::path).to_string();
            return Ok(state.write(&target, content));
        }
        if !autorename {
            return Err(conflict());
        }
        let target = state.free_name(path, false);
        Ok(state.write(&target, content))
    }

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        let key = paths::normalize(path);
        if state.nodes.contains_key(&key) {
            return Err(RemoteError::api(StatusCode::CONFLICT, "path/conflict/folder/"));
        }
        state.ensure_parents(path);
        let node = Node::Folder {
            path: path.to_string(),
        };
        let Metadata::Folder(meta) = node.metadata() else {
            unreachable!("folder node");
        };
        state.insert(node, true);
        Ok(meta)
    }

    async fn delete(&self, path: &str, parent_rev: Option<&str>) -> Result<Metadata, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        let key = paths::normalize(path);
        match (state.nodes.get(&key), parent_rev) {
            (None, _) => return Err(not_found()),
            (Some(Node::File { rev, .. }), Some(expected)) if rev != expected => {
                return Err(conflict());
            }
            _ => {}
        }
        let removed = state.remove_tree(&key);
        let display = removed
            .first()
            .map_or_else(|| path.to_string(), |node| node.path().to_string());
        Ok(Metadata::Deleted(DeletedMetadata {
            name: paths::file_name(&display).to_string(),
            path_lower: key,
            path_display: display,
        }))
    }

    async fn move_item(
        &self,
        from: &str,
        to: &str,
        autorename: bool,
    ) -> Result<Metadata, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure()?;
        let from_key = paths::normalize(from);
        let Some(source) = state.nodes.get(&from_key).cloned() else {
            return Err(not_found());
        };
        let is_dir = matches!(source, Node::Folder { .. });
        let mut target = to.to_string();
        if paths::normalize(to) != from_key && state.nodes.contains_key(&paths::normalize(to)) {
            if !autorename {
                return Err(conflict());
            }
            target = state.free_name(to, is_dir);
        }

        let source_len = source.path().len();
        state.ensure_parents(&target);
        for node in state.remove_tree(&from_key) {
            let path = format!("{target}{}", &node.path()[source_len..]);
            let moved = match node {
                Node::File { rev, content, .. } => Node::File { path, rev, content },
                Node::Folder { .. } => Node::Folder { path },
            };
            state.insert(moved, true);
        }
        Ok(state.nodes[&paths::normalize(&target)].metadata())
    }

    async fn account_display_name(&self) -> Result<String, RemoteError> {
        Ok("Alex".to_string())
    }
}
