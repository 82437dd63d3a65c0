use futures_util::TryStreamExt;
use tokio::sync::watch;

use super::event::{Direction, SyncEvent};
use super::ignore::IgnorePatterns;
use super::index::{ConflictRecord, IndexError, IndexStore, SyncErrorRecord};
use super::paths;
use super::queue::InFlight;

/// Sync state of one path as shown to the user. Folders aggregate their
/// contents: any activity or error below wins over up-to-date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Uploading,
    Downloading,
    UpToDate,
    Error,
    Unwatched,
}

impl PathStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathStatus::Uploading => "uploading",
            PathStatus::Downloading => "downloading",
            PathStatus::UpToDate => "up to date",
            PathStatus::Error => "error",
            PathStatus::Unwatched => "unwatched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineStatus {
    #[default]
    Idle,
    Syncing,
    Paused,
    Halted(String),
}

/// Read-only queries over the engine's state.
#[derive(Clone)]
pub struct StatusView {
    index: IndexStore,
    in_flight: InFlight,
    state: watch::Receiver<EngineStatus>,
}

impl StatusView {
    pub fn new(
        index: IndexStore,
        in_flight: InFlight,
        state: watch::Receiver<EngineStatus>,
    ) -> Self {
        Self {
            index,
            in_flight,
            state,
        }
    }

    pub fn engine_status(&self) -> EngineStatus {
        self.state.borrow().clone()
    }

    pub async fn path_status(
        &self,
        path: &str,
        ignore: &IgnorePatterns,
    ) -> Result<PathStatus, IndexError> {
        let indexed = self.index.get(path).await?;
        let is_dir = indexed.as_ref().is_some_and(|entry| entry.is_folder());
        if ignore.should_skip_local(path, is_dir) {
            return Ok(PathStatus::Unwatched);
        }

        if let Some(direction) = pick(self.in_flight.directions_under(path)) {
            return Ok(active(direction));
        }
        let errors = self.index.list_errors().await?;
        if errors
            .iter()
            .any(|err| paths::is_equal_or_child(&err.path, path))
        {
            return Ok(PathStatus::Error);
        }
        let pending = self
            .index
            .get_pending()
            .await?
            .into_iter()
            .filter(|pending| paths::is_equal_or_child(&pending.path, path))
            .map(|pending| pending.direction);
        if let Some(direction) = pick(pending) {
            return Ok(active(direction));
        }

        Ok(if indexed.is_some() {
            PathStatus::UpToDate
        } else {
            PathStatus::Unwatched
        })
    }

    /// The newest `limit` history entries, oldest first.
    pub async fn recent_history(&self, limit: usize) -> Result<Vec<SyncEvent>, IndexError> {
        let mut events: Vec<SyncEvent> = self.index.list_events(0).try_collect().await?;
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
        Ok(events)
    }

    pub async fn errors(&self) -> Result<Vec<SyncErrorRecord>, IndexError> {
        self.index.list_errors().await
    }

    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>, IndexError> {
        self.index.list_conflicts().await
    }
}

/// Uploads win when both directions are active below a folder.
fn pick(directions: impl IntoIterator<Item = Direction>) -> Option<Direction> {
    directions
        .into_iter()
        .max_by_key(|direction| *direction == Direction::Upload)
}

fn active(direction: Direction) -> PathStatus {
    match direction {
        Direction::Upload => PathStatus::Uploading,
        Direction::Download => PathStatus::Downloading,
    }
}
