use serde::{Deserialize, Serialize};

/// A single record from the remote namespace.
///
/// The remote service reports three kinds of records and nothing else, so the
/// engine matches on them exhaustively instead of probing fields at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl Metadata {
    pub fn name(&self) -> &str {
        match self {
            Metadata::File(file) => &file.name,
            Metadata::Folder(folder) => &folder.name,
            Metadata::Deleted(deleted) => &deleted.name,
        }
    }

    pub fn path_display(&self) -> &str {
        match self {
            Metadata::File(file) => &file.path_display,
            Metadata::Folder(folder) => &folder.path_display,
            Metadata::Deleted(deleted) => &deleted.path_display,
        }
    }

    pub fn path_lower(&self) -> &str {
        match self {
            Metadata::File(file) => &file.path_lower,
            Metadata::Folder(folder) => &folder.path_lower,
            Metadata::Deleted(deleted) => &deleted.path_lower,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Metadata::Deleted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileMetadata {
    pub name: String,
    pub path_lower: String,
    pub path_display: String,
    #[serde(default)]
    pub id: Option<String>,
    pub rev: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub server_modified: Option<String>,
    #[serde(default)]
    pub client_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FolderMetadata {
    pub name: String,
    pub path_lower: String,
    pub path_display: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeletedMetadata {
    pub name: String,
    pub path_lower: String,
    pub path_display: String,
}

/// One page of a folder listing or of the change feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListFolderPage {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct LongpollResult {
    pub changes: bool,
    #[serde(default)]
    pub backoff: Option<u64>,
}

/// How an upload treats an existing remote file at the target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Never overwrite; conflicts are renamed (or rejected without autorename).
    Add,
    /// Unconditionally replace.
    Overwrite,
    /// Replace only if the current remote revision matches.
    Update(String),
}
