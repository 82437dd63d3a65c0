use skysync_core::{Metadata, WriteMode};
use time::{Date, macros::format_description};

use super::index::IndexEntry;
use super::paths;

pub const SELECTIVE_SYNC_SUFFIX: &str = "selective sync conflict";
pub const CASE_CONFLICT_SUFFIX: &str = "case conflict";

/// What is on disk at a path when a change is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    pub exists: bool,
    pub is_dir: bool,
    /// File mtime in nanoseconds since the epoch. Unused for folders.
    pub newest_mtime: i64,
    /// Set for files when a content comparison was needed.
    pub hash: Option<String>,
    /// Folders: some file below is untracked or newer than its own last sync.
    pub changed_below: bool,
}

impl LocalState {
    pub fn missing() -> Self {
        Self::default()
    }

    /// Changed after the last successful sync, or never synced at all.
    pub fn modified_since(&self, indexed: Option<&IndexEntry>) -> bool {
        if !self.exists {
            return false;
        }
        match indexed {
            None => true,
            Some(entry) if entry.is_folder() != self.is_dir => true,
            Some(_) if self.is_dir => self.changed_below,
            Some(entry) => self.newest_mtime > entry.last_sync.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChange<'a> {
    File { rev: &'a str, hash: Option<&'a str> },
    Folder,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadDecision {
    /// Already at this version.
    NoOp,
    /// Same content on both sides; record the version tag only.
    UpdateIndex,
    /// Make the local side match the remote one.
    Apply,
    /// Download the remote file under a conflicting-copy name.
    ConflictCopy,
    /// Rename the local item aside, then apply the remote change.
    MoveLocalAside,
    /// Remote deletion of a locally changed item: keep it and re-upload.
    KeepLocal,
}

pub fn decide_download(
    remote: RemoteChange<'_>,
    indexed: Option<&IndexEntry>,
    local: &LocalState,
) -> DownloadDecision {
    let modified = local.modified_since(indexed);

    match remote {
        RemoteChange::File { rev, hash } => {
            if indexed.is_some_and(|entry| !entry.is_folder() && entry.remote_version == rev) {
                return DownloadDecision::NoOp;
            }
            if local.exists
                && !local.is_dir
                && hash.is_some()
                && local.hash.as_deref() == hash
            {
                return DownloadDecision::UpdateIndex;
            }
            if !modified {
                DownloadDecision::Apply
            } else {
                DownloadDecision::ConflictCopy
            }
        }
        RemoteChange::Folder => {
            if local.exists && local.is_dir {
                return match indexed {
                    Some(entry) if entry.is_folder() => DownloadDecision::NoOp,
                    _ => DownloadDecision::UpdateIndex,
                };
            }
            if local.exists && modified {
                DownloadDecision::MoveLocalAside
            } else {
                DownloadDecision::Apply
            }
        }
        RemoteChange::Deleted => {
            if !local.exists {
                return if indexed.is_some() {
                    DownloadDecision::Apply
                } else {
                    DownloadDecision::NoOp
                };
            }
            if modified {
                DownloadDecision::KeepLocal
            } else {
                DownloadDecision::Apply
            }
        }
    }
}

/// How the remote item of the old type is cleared before a type swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSwap {
    /// The remote side has changes we never saw: keep them under a copy name.
    MoveRemoteAside,
    DeleteRemote { rev: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDecision {
    /// Excluded and absent remotely, or nothing to send.
    Skip,
    SelectiveSyncConflict,
    CaseConflict,
    /// Remote already has this content.
    RefreshIndex { rev: String },
    Upload {
        mode: WriteMode,
        swap: Option<TypeSwap>,
    },
    CreateFolder {
        swap: Option<TypeSwap>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct UploadCheck<'a> {
    pub local: &'a LocalState,
    pub indexed: Option<&'a IndexEntry>,
    pub remote: Option<&'a Metadata>,
    pub excluded: bool,
    /// A different, still existing local path folds to the same key.
    pub case_clash: bool,
}

pub fn decide_upload(check: UploadCheck<'_>) -> UploadDecision {
    let remote = check.remote.filter(|meta| !meta.is_deleted());

    if check.excluded {
        return if remote.is_some() {
            UploadDecision::SelectiveSyncConflict
        } else {
            UploadDecision::Skip
        };
    }
    if check.case_clash {
        return UploadDecision::CaseConflict;
    }
    if !check.local.exists {
        return UploadDecision::Skip;
    }

    let swap = remote.and_then(|meta| type_swap(meta, check.local.is_dir, check.indexed));

    if check.local.is_dir {
        return UploadDecision::CreateFolder { swap };
    }

    if swap.is_none()
        && let (Some(Metadata::File(file)), Some(local_hash)) =
            (remote, check.local.hash.as_deref())
        && file.content_hash.as_deref() == Some(local_hash)
    {
        return UploadDecision::RefreshIndex {
            rev: file.rev.clone(),
        };
    }

    // Unchanged content whose remote copy is gone: the remote deletion wins.
    if remote.is_none()
        && check.local.hash.is_some()
        && check.indexed.and_then(|entry| entry.content_hash.as_deref())
            == check.local.hash.as_deref()
    {
        return UploadDecision::Skip;
    }

    let mode = match (check.indexed, swap.is_some()) {
        (Some(entry), false) if !entry.is_folder() => {
            WriteMode::Update(entry.remote_version.clone())
        }
        _ => WriteMode::Add,
    };
    UploadDecision::Upload { mode, swap }
}

fn type_swap(
    remote: &Metadata,
    local_is_dir: bool,
    indexed: Option<&IndexEntry>,
) -> Option<TypeSwap> {
    match remote {
        Metadata::File(file) if local_is_dir => {
            let seen = indexed
                .is_some_and(|entry| !entry.is_folder() && entry.remote_version == file.rev);
            Some(if seen {
                TypeSwap::DeleteRemote {
                    rev: Some(file.rev.clone()),
                }
            } else {
                TypeSwap::MoveRemoteAside
            })
        }
        Metadata::Folder(_) if !local_is_dir => {
            let seen = indexed.is_some_and(IndexEntry::is_folder);
            Some(if seen {
                TypeSwap::DeleteRemote { rev: None }
            } else {
                TypeSwap::MoveRemoteAside
            })
        }
        _ => None,
    }
}

/// `doc.txt` becomes `doc (Alex's conflicting copy 2024-01-02).txt`.
pub fn conflicting_copy_path(path: &str, user: &str, date: Date, is_dir: bool) -> String {
    let format = format_description!("[year]-[month]-[day]");
    let stamp = date.format(&format).unwrap_or_else(|_| date.to_string());
    let label = if user.is_empty() {
        format!("conflicting copy {stamp}")
    } else {
        format!("{user}'s conflicting copy {stamp}")
    };
    suffixed_path(path, &label, is_dir)
}

/// Inserts ` (<label>)` before the extension of the last path component.
pub fn suffixed_path(path: &str, label: &str, is_dir: bool) -> String {
    let parent = paths::parent_path(path).unwrap_or_else(|| "/".to_string());
    let name = paths::file_name(path);

    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !is_dir && !stem.is_empty() => format!("{stem} ({label}).{ext}"),
        _ => format!("{name} ({label})"),
    };
    paths::join(&parent, &renamed)
}

/// First of `candidate`, `candidate (1)`, `candidate (2)`... that is free.
pub fn unique_path(candidate: &str, is_dir: bool, taken: impl Fn(&str) -> bool) -> String {
    if !taken(candidate) {
        return candidate.to_string();
    }
    let mut n = 1u32;
    loop {
        let numbered = suffixed_path(candidate, &n.to_string(), is_dir);
        if !taken(&numbered) {
            return numbered;
        }
        n += 1;
    }
}
