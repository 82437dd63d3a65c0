/// Depth-first order with sorted names: a parent sorts before its children
/// and comparing two sync paths component-wise matches walk order.
fn walk_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.split('/').cmp(b.split('/'))
}

fn walk_sorted(root: &Path, ignore: &IgnorePatterns) -> io::Result<Vec<(String, bool)>> {
    let mut out = Vec::new();
    walk_dir(root, root, ignore, &mut out)?;
    Ok(out)
}

/// Like the reindex walk, but only below `dir`.
pub(crate) fn walk_below(
    root: &Path,
    dir: &Path,
    ignore: &IgnorePatterns,
) -> io::Result<Vec<(String, bool)>> {
    let mut out = Vec::new();
    walk_dir(root, dir, ignore, &mut out)?;
    Ok(out)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    ignore: &IgnorePatterns,
    out: &mut Vec<(String, bool)>,
) -> io::Result<()> {
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        // Removed while walking; the watcher reports it.
        Err(err) if err.kind() == io::ErrorKind::NotFound && dir != root => return Ok(()),
        Err(err) => return Err(err),
    };
    let mut entries = read.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let Some(sync) = sync_path_for(root, &path) else {
            continue;
        };
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let is_dir = file_type.is_dir();
        if ignore.should_skip_local(&sync, is_dir) {
            continue;
        }
        out.push((sync, is_dir));
        if is_dir {
            walk_dir(root, &path, ignore, out)?;
        }
    }
    Ok(())
}

/// Marks the paths of `events` pending upload and records walk progress in
/// the same transaction. `position == None` completes the walk.
async fn save_reindex_progress(
    index: &IndexStore,
    events: &[SyncEvent],
    position: Option<&str>,
) -> Result<(), IndexError> {
    let mut txn = index.begin().await?;
    for event in events {
        txn.mark_pending(&event.path, Direction::Upload).await?;
    }
    match position {
        Some(position) => txn.set_state(STATE_REINDEX_POSITION, Some(position)).await?,
        None => {
            txn.set_state(STATE_REINDEX_POSITION, None).await?;
            txn.set_state(STATE_LAST_REINDEX, Some(&unix_now().to_string()))
                .await?;
        }
    }
    txn.commit().await
}

impl LocalWatcher {
    /// Compares the whole sync root with the index.
    ///
    /// Progress is saved every few hundred items together with the pending
    /// marks for what was found so far, so a walk interrupted by a crash
    /// resumes after `resume_from` without losing changes.
    pub async fn reindex(
        &self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
        resume_from: Option<&str>,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::RootUnavailable(self.root.clone()));
        }

        let root = self.root.clone();
        let walk_ignore = ignore.clone();
        let items = tokio::task::spawn_blocking(move || walk_sorted(&root, &walk_ignore))
            .await
            .map_err(io::Error::other)??;
        let start = match resume_from {
            Some(position) => items.partition_point(|(path, _)| {
                walk_order(path, position) != std::cmp::Ordering::Greater
            }),
            None => 0,
        };
        tracing::info!(items = items.len(), skipped = start, "local reindex started");

        let mut events = Vec::new();
        let mut unsaved = Vec::new();
        for (offset, (path, _)) in items[start..].iter().enumerate() {
            unsaved.extend(
                self.state_events(index, ignore, path, ChangeCheck::Reindex)
                    .await?,
            );
            if (offset + 1) % REINDEX_SAVE_EVERY == 0 {
                save_reindex_progress(index, &unsaved, Some(path)).await?;
                events.append(&mut unsaved);
            }
        }

        let on_disk: std::collections::HashSet<String> =
            items.iter().map(|(path, _)| paths::normalize(path)).collect();
        for entry in index.list_entries().await? {
            if ignore.should_skip_local(&entry.path, entry.is_folder()) {
                tracing::debug!(path = %entry.path, "forgetting newly excluded path");
                index.remove(&entry.path).await?;
                continue;
            }
            if on_disk.contains(&entry.path_key()) {
                continue;
            }
            unsaved.extend(
                self.state_events(index, ignore, &entry.path, ChangeCheck::Reindex)
                    .await?,
            );
        }

        save_reindex_progress(index, &unsaved, None).await?;
        events.append(&mut unsaved);
        tracing::info!(changes = events.len(), "local reindex finished");
        Ok(events)
    }

    /// Rebuilds upload events for paths left pending by an earlier cycle.
    pub async fn pending_upload_events(
        &self,
        index: &IndexStore,
        ignore: &IgnorePatterns,
    ) -> Result<Vec<SyncEvent>, WatcherError> {
        let mut events = Vec::new();
        for pending in index.get_pending().await? {
            if pending.direction != Direction::Upload {
                continue;
            }
            let found = self
                .state_events(index, ignore, &pending.path, ChangeCheck::Pending)
                .await?;
            if found.is_empty() {
                index.clear_pending(&pending.path, Direction::Upload).await?;
            }
            events.extend(found);
        }
        Ok(events)
    }
}
