use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::{Stream, StreamExt};
use sqlx::{
    Row, Sqlite, SqlitePool, Transaction,
    migrate::Migrator,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::event::{ChangeType, Direction, EventStatus, ItemType, SyncEvent, unix_now};
use super::paths;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Version tag stored for folders, which carry no remote revision.
pub const FOLDER_REV: &str = "folder";

pub const STATE_CURSOR: &str = "cursor";
pub const STATE_LAST_REINDEX: &str = "last_reindex";
pub const STATE_REINDEX_POSITION: &str = "reindex_position";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("index database is corrupted: {0}")]
    Corrupted(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

impl IndexError {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, IndexError::Corrupted(_))
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("malformed")
            || lower.contains("corrupt")
            || lower.contains("not a database")
        {
            IndexError::Corrupted(message)
        } else {
            IndexError::Sqlx(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: String,
    pub item_type: ItemType,
    /// Remote revision, or [`FOLDER_REV`] for folders.
    pub remote_version: String,
    pub content_hash: Option<String>,
    pub inode: Option<u64>,
    /// Nanoseconds since the epoch of the last successful apply.
    pub last_sync: Option<i64>,
}

impl IndexEntry {
    pub fn file(path: impl Into<String>, rev: impl Into<String>, hash: Option<String>) -> Self {
        Self {
            path: path.into(),
            item_type: ItemType::File,
            remote_version: rev.into(),
            content_hash: hash,
            inode: None,
            last_sync: None,
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            item_type: ItemType::Folder,
            remote_version: FOLDER_REV.to_string(),
            content_hash: None,
            inode: None,
            last_sync: None,
        }
    }

    pub fn path_key(&self) -> String {
        paths::normalize(&self.path)
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCacheEntry {
    pub local_path: String,
    pub inode: Option<u64>,
    pub mtime: i64,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub path: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncErrorRecord {
    pub path: String,
    pub direction: Direction,
    pub title: String,
    pub message: String,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: i64,
    pub path: String,
    pub copy_path: String,
    pub reason: String,
    pub created: i64,
}

/// Durable sync state. Reads go through the pool; every write is serialized by
/// `write_lock` and runs inside a transaction.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

/// A write transaction holding the store's write lock until commit or drop.
pub struct IndexTxn {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

fn inode_to_db(inode: Option<u64>) -> Option<i64> {
    inode.map(|value| value as i64)
}

fn inode_from_db(value: Option<i64>) -> Option<u64> {
    value.map(|value| value as u64)
}

fn parse_field<T>(value: &str, parse: fn(&str) -> Option<T>) -> Result<T, IndexError> {
    parse(value).ok_or_else(|| IndexError::InvalidValue(value.to_string()))
}

fn entry_from_row(row: &SqliteRow) -> Result<IndexEntry, IndexError> {
    let item_type: String = row.try_get("item_type")?;
    Ok(IndexEntry {
        path: row.try_get("path")?,
        item_type: parse_field(&item_type, ItemType::parse)?,
        remote_version: row.try_get("rev")?,
        content_hash: row.try_get("content_hash")?,
        inode: inode_from_db(row.try_get("inode")?),
        last_sync: row.try_get("last_sync")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<SyncEvent, IndexError> {
    let direction: String = row.try_get("direction")?;
    let item_type: String = row.try_get("item_type")?;
    let change_type: String = row.try_get("change_type")?;
    let status: String = row.try_get("status")?;
    let size: i64 = row.try_get("size")?;
    let completed: i64 = row.try_get("completed")?;
    Ok(SyncEvent {
        direction: parse_field(&direction, Direction::parse)?,
        change_type: parse_field(&change_type, ChangeType::parse)?,
        item_type: parse_field(&item_type, ItemType::parse)?,
        path: row.try_get("path")?,
        path_from: row.try_get("path_from")?,
        rev: row.try_get("rev")?,
        content_hash: row.try_get("content_hash")?,
        size: size.max(0) as u64,
        change_time: row.try_get("change_time")?,
        timestamp: row.try_get("sync_time")?,
        completed: completed.max(0) as u64,
        status: parse_field(&status, EventStatus::parse)?,
    })
}

/// `path_key` range covering `key` and everything below it.
fn descendant_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{key}/")
    }
}

include!("index_store_impl.rs");

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
