use std::time::{SystemTime, UNIX_EPOCH};

use super::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(Direction::Upload),
            "download" => Some(Direction::Download),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(ItemType::File),
            "folder" => Some(ItemType::Folder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Moved,
    Modified,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Moved => "moved",
            ChangeType::Modified => "modified",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "added" => Some(ChangeType::Added),
            "removed" => Some(ChangeType::Removed),
            "moved" => Some(ChangeType::Moved),
            "modified" => Some(ChangeType::Modified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Queued,
    Syncing,
    Done,
    Skipped,
    Conflict,
    Failed,
    Aborted,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Syncing => "syncing",
            EventStatus::Done => "done",
            EventStatus::Skipped => "skipped",
            EventStatus::Conflict => "conflict",
            EventStatus::Failed => "failed",
            EventStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(EventStatus::Queued),
            "syncing" => Some(EventStatus::Syncing),
            "done" => Some(EventStatus::Done),
            "skipped" => Some(EventStatus::Skipped),
            "conflict" => Some(EventStatus::Conflict),
            "failed" => Some(EventStatus::Failed),
            "aborted" => Some(EventStatus::Aborted),
            _ => None,
        }
    }
}

/// A normalized change produced by either collector and consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub direction: Direction,
    pub change_type: ChangeType,
    pub item_type: ItemType,
    /// Display-cased sync path with a leading `/`.
    pub path: String,
    /// Source path, set for moves only.
    pub path_from: Option<String>,
    pub rev: Option<String>,
    pub content_hash: Option<String>,
    pub size: u64,
    pub change_time: Option<i64>,
    pub timestamp: i64,
    pub completed: u64,
    pub status: EventStatus,
}

impl SyncEvent {
    pub fn new(
        direction: Direction,
        change_type: ChangeType,
        item_type: ItemType,
        path: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            change_type,
            item_type,
            path: path.into(),
            path_from: None,
            rev: None,
            content_hash: None,
            size: 0,
            change_time: None,
            timestamp: unix_now(),
            completed: 0,
            status: EventStatus::Queued,
        }
    }

    pub fn moved_from(mut self, from: impl Into<String>) -> Self {
        self.change_type = ChangeType::Moved;
        self.path_from = Some(from.into());
        self
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = hash;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn path_key(&self) -> String {
        paths::normalize(&self.path)
    }

    pub fn is_deletion(&self) -> bool {
        self.change_type == ChangeType::Removed
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }

    pub fn is_move(&self) -> bool {
        self.change_type == ChangeType::Moved
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Nanoseconds since the epoch. Sync times and local mtimes are compared in
/// this unit so that an edit in the same second as a sync is still newer.
pub fn unix_now_nanos() -> i64 {
    system_time_nanos(SystemTime::now())
}

pub fn system_time_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}
