use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use super::event::{Direction, SyncEvent};
use super::paths;

/// A batch split into the two phases of a cycle.
#[derive(Debug, Default)]
pub struct SortedBatch {
    /// Deletions, folders and moves, ancestors first. Applied one by one.
    pub sequential: Vec<SyncEvent>,
    /// File additions and modifications. Applied concurrently.
    pub parallel: Vec<SyncEvent>,
}

impl SortedBatch {
    pub fn len(&self) -> usize {
        self.sequential.len() + self.parallel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequential.is_empty() && self.parallel.is_empty()
    }
}

fn rank(event: &SyncEvent) -> u8 {
    if event.is_deletion() {
        0
    } else if event.is_folder() && !event.is_move() {
        1
    } else {
        2
    }
}

/// Orders a batch so that ancestors come before descendants and, at the same
/// depth, deletions and folders come before moves and files. Deletions below
/// another deleted folder are dropped, and so are other changes below it
/// unless the batch also brings the folder back.
pub fn sort_hierarchically(events: Vec<SyncEvent>) -> SortedBatch {
    let deleted_folders: Vec<String> = events
        .iter()
        .filter(|event| event.is_deletion() && event.is_folder())
        .map(SyncEvent::path_key)
        .collect();
    let recreated: HashSet<String> = events
        .iter()
        .filter(|event| !event.is_deletion())
        .map(SyncEvent::path_key)
        .filter(|key| deleted_folders.contains(key))
        .collect();

    let mut batch = SortedBatch::default();
    for event in events {
        let key = event.path_key();
        let under_deleted = deleted_folders.iter().any(|folder| {
            paths::is_child(&key, folder) && (event.is_deletion() || !recreated.contains(folder))
        });
        if under_deleted {
            if !event.is_deletion() {
                tracing::debug!(path = %event.path, "dropping change below a deleted folder");
            }
            continue;
        }

        if event.is_deletion() || event.is_folder() || event.is_move() {
            batch.sequential.push(event);
        } else {
            batch.parallel.push(event);
        }
    }

    batch.sequential.sort_by(|a, b| {
        paths::depth(&a.path)
            .cmp(&paths::depth(&b.path))
            .then_with(|| rank(a).cmp(&rank(b)))
            .then_with(|| a.path_key().cmp(&b.path_key()))
    });
    batch.parallel.sort_by(|a, b| {
        paths::depth(&a.path)
            .cmp(&paths::depth(&b.path))
            .then_with(|| a.path_key().cmp(&b.path_key()))
    });
    batch
}

/// Paths currently being worked on, with the direction of the work.
///
/// A claim fails when the path itself, an ancestor or a descendant is
/// already claimed.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashMap<String, Direction>>>,
}

pub struct InFlightGuard {
    inner: Arc<Mutex<HashMap<String, Direction>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&self.key);
        }
    }
}

impl InFlight {
    pub fn try_claim(&self, path: &str, direction: Direction) -> Option<InFlightGuard> {
        let key = paths::normalize(path);
        let mut map = self.inner.lock().ok()?;
        let overlaps = map
            .keys()
            .any(|held| {
                paths::is_equal_or_child(&key, held) || paths::is_equal_or_child(held, &key)
            });
        if overlaps {
            return None;
        }
        map.insert(key.clone(), direction);
        Some(InFlightGuard {
            inner: self.inner.clone(),
            key,
        })
    }

    pub fn direction_of(&self, path: &str) -> Option<Direction> {
        let key = paths::normalize(path);
        self.inner.lock().ok()?.get(&key).copied()
    }

    /// Directions of every claim at or below `path`.
    pub fn directions_under(&self, path: &str) -> Vec<Direction> {
        let Ok(map) = self.inner.lock() else {
            return Vec::new();
        };
        map.iter()
            .filter(|(key, _)| paths::is_equal_or_child(key, path))
            .map(|(_, direction)| *direction)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event::{ChangeType, ItemType};

    fn event(change: ChangeType, item: ItemType, path: &str) -> SyncEvent {
        SyncEvent::new(Direction::Download, change, item, path)
    }

    #[test]
    fn ancestors_before_descendants_and_deletions_first() {
        let batch = sort_hierarchically(vec![
            event(ChangeType::Added, ItemType::File, "/a/b/c.txt"),
            event(ChangeType::Added, ItemType::Folder, "/a/b"),
            event(ChangeType::Added, ItemType::Folder, "/a"),
            event(ChangeType::Removed, ItemType::File, "/z.txt"),
            event(ChangeType::Added, ItemType::File, "/y.txt"),
        ]);

        let sequential: Vec<&str> = batch.sequential.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(sequential, vec!["/z.txt", "/a", "/a/b"]);
        let parallel: Vec<&str> = batch.parallel.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(parallel, vec!["/y.txt", "/a/b/c.txt"]);
    }

    #[test]
    fn deletions_under_deleted_folder_collapse() {
        let batch = sort_hierarchically(vec![
            event(ChangeType::Removed, ItemType::File, "/Old/a.txt"),
            event(ChangeType::Removed, ItemType::Folder, "/old"),
            event(ChangeType::Removed, ItemType::Folder, "/Old/Sub"),
        ]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.sequential[0].path, "/old");
    }

    #[test]
    fn changes_below_deleted_folder_wait_for_it_to_return() {
        let batch = sort_hierarchically(vec![
            event(ChangeType::Modified, ItemType::File, "/F/a.txt"),
            event(ChangeType::Removed, ItemType::Folder, "/F"),
            event(ChangeType::Added, ItemType::Folder, "/G/Sub"),
            event(ChangeType::Removed, ItemType::Folder, "/G"),
            event(ChangeType::Added, ItemType::Folder, "/g"),
        ]);

        let sequential: Vec<&str> = batch.sequential.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(sequential, vec!["/F", "/G", "/g", "/G/Sub"]);
        assert!(batch.parallel.is_empty());
    }

    #[test]
    fn in_flight_blocks_ancestors_and_descendants() {
        let in_flight = InFlight::default();
        let guard = in_flight.try_claim("/Docs", Direction::Upload).unwrap();

        assert!(in_flight.try_claim("/docs/a.txt", Direction::Download).is_none());
        assert!(in_flight.try_claim("/", Direction::Download).is_none());
        assert!(in_flight.try_claim("/Other", Direction::Download).is_some());
        assert_eq!(in_flight.direction_of("/DOCS"), Some(Direction::Upload));

        drop(guard);
        assert!(in_flight.try_claim("/docs/a.txt", Direction::Download).is_some());
    }
}
