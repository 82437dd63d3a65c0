use std::{
    io,
    path::{Path, PathBuf},
};

use md5::Context;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::event::system_time_nanos;
use super::index::{HashCacheEntry, IndexError, IndexStore};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
    #[error("file changed while it was being read: {0}")]
    Unstable(PathBuf),
    #[error("failed to move to trash: {0}")]
    Trash(String),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Size, mtime and inode of a local item at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    /// Nanoseconds since the epoch.
    pub mtime: i64,
    pub inode: Option<u64>,
    pub is_dir: bool,
}

impl FileSnapshot {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mtime = metadata.modified().map(system_time_nanos).unwrap_or(0);
        Self {
            size: metadata.len(),
            mtime,
            inode: inode_of(metadata),
            is_dir: metadata.is_dir(),
        }
    }
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Returns `None` when nothing exists at `path`. Symlinks are not followed.
pub async fn snapshot(path: &Path) -> Result<Option<FileSnapshot>, TransferError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(FileSnapshot::from_metadata(&metadata))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

pub fn hash_bytes(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

/// Streaming md5 of a local file, hex encoded.
pub async fn content_hash(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Content hash through the index's hash cache. The cache entry is trusted
/// only while size, mtime and inode are unchanged.
///
/// Takes the store's write lock on a miss, so never call it while holding an
/// [`IndexTxn`](super::index::IndexTxn).
pub async fn cached_hash(
    index: &IndexStore,
    path: &Path,
    snap: &FileSnapshot,
) -> Result<String, TransferError> {
    let key = path.to_string_lossy().into_owned();
    if let Some(cached) = index.get_hash(&key).await?
        && cached.mtime == snap.mtime
        && cached.size == snap.size
        && cached.inode == snap.inode
    {
        return Ok(cached.hash);
    }

    let hash = content_hash(path).await?;
    index
        .put_hash(&HashCacheEntry {
            local_path: key,
            inode: snap.inode,
            mtime: snap.mtime,
            size: snap.size,
            hash: hash.clone(),
        })
        .await?;
    Ok(hash)
}

/// Writes `content` next to `target` and renames it into place, so readers
/// never observe a half-written file.
pub async fn write_atomic(
    target: &Path,
    content: &[u8],
    expected_md5: Option<&str>,
) -> Result<(), TransferError> {
    if let Some(expected_md5) = expected_md5 {
        let actual_md5 = hash_bytes(content);
        if actual_md5 != expected_md5.to_ascii_lowercase() {
            return Err(TransferError::IntegrityMismatch {
                expected_md5: expected_md5.to_ascii_lowercase(),
                actual_md5,
            });
        }
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let mut file = tokio::fs::File::create(&partial).await?;
    for chunk in content.chunks(READ_CHUNK) {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err.into());
    }
    Ok(())
}

/// Reads a file and fails with [`TransferError::Unstable`] if its size or
/// mtime moved during the read.
pub async fn stable_read(path: &Path) -> Result<(Vec<u8>, FileSnapshot), TransferError> {
    let before = tokio::fs::metadata(path).await?;
    let before = FileSnapshot::from_metadata(&before);
    let content = tokio::fs::read(path).await?;
    let after = tokio::fs::metadata(path).await?;
    let after = FileSnapshot::from_metadata(&after);

    if before.size != after.size
        || before.mtime != after.mtime
        || content.len() as u64 != after.size
    {
        return Err(TransferError::Unstable(path.to_path_buf()));
    }
    Ok((content, after))
}

/// Deletes a local file or folder tree, through the desktop trash when asked.
pub async fn remove_local(path: &Path, use_trash: bool) -> Result<(), TransferError> {
    let Some(snap) = snapshot(path).await? else {
        return Ok(());
    };
    if use_trash {
        let target = path.to_path_buf();
        return tokio::task::spawn_blocking(move || trash::delete(&target))
            .await
            .map_err(|err| TransferError::Trash(err.to_string()))?
            .map_err(|err| TransferError::Trash(err.to_string()));
    }
    if snap.is_dir {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}
