use std::time::Duration;

use async_trait::async_trait;

use crate::client::RemoteError;
use crate::metadata::{
    FileMetadata, FolderMetadata, ListFolderPage, LongpollResult, Metadata, WriteMode,
};

/// Operations the sync engine needs from the remote storage service.
///
/// Paths are absolute within the account ("/Docs/a.txt"); the service treats
/// them case-insensitively.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListFolderPage, RemoteError>;

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderPage, RemoteError>;

    /// Blocks until the feed behind `cursor` has changes or `timeout` elapses.
    async fn wait_for_changes(
        &self,
        cursor: &str,
        timeout: Duration,
    ) -> Result<LongpollResult, RemoteError>;

    /// Returns `None` when nothing exists at `path`.
    async fn get_metadata(&self, path: &str) -> Result<Option<Metadata>, RemoteError>;

    async fn download(&self, path: &str) -> Result<(FileMetadata, Vec<u8>), RemoteError>;

    async fn upload(
        &self,
        path: &str,
        content: Vec<u8>,
        mode: WriteMode,
        autorename: bool,
    ) -> Result<FileMetadata, RemoteError>;

    async fn create_folder(&self, path: &str) -> Result<FolderMetadata, RemoteError>;

    async fn delete(&self, path: &str, parent_rev: Option<&str>) -> Result<Metadata, RemoteError>;

    async fn move_item(
        &self,
        from: &str,
        to: &str,
        autorename: bool,
    ) -> Result<Metadata, RemoteError>;

    async fn account_display_name(&self) -> Result<String, RemoteError>;
}
