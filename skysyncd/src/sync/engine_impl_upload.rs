impl SyncEngine {
    async fn apply_upload(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        match event.change_type {
            ChangeType::Removed => self.upload_deletion(event).await,
            ChangeType::Moved => self.upload_move(event, config).await,
            ChangeType::Added | ChangeType::Modified => self.upload_item(event, config).await,
        }
    }

    /// Deletes the remote item with the indexed rev as precondition. A remote
    /// that changed in the meantime wins and is downloaded again.
    async fn upload_deletion(&self, event: &SyncEvent) -> Result<EventStatus, EngineError> {
        let Some(entry) = self.index.get(&event.path).await? else {
            self.commit(event, None, Commit::default()).await?;
            return Ok(EventStatus::Skipped);
        };
        if transfer::snapshot(&local_path_for(&self.root, &entry.path)?)
            .await?
            .is_some()
        {
            // Recreated since; the upload of the new item replaces the remote one.
            self.commit(event, None, Commit::default()).await?;
            return Ok(EventStatus::Skipped);
        }

        let parent_rev = (!entry.is_folder()).then_some(entry.remote_version.as_str());
        match self.client.delete(&entry.path, parent_rev).await {
            Ok(_) => {}
            Err(err) if err.classification() == ApiErrorClass::NotFound => {
                tracing::debug!(path = %entry.path, "already deleted remotely");
            }
            Err(err) if err.classification() == ApiErrorClass::Conflict => {
                tracing::info!(
                    path = %entry.path,
                    "remote item changed since the last sync, keeping it"
                );
                let commit = Commit {
                    pending: vec![(entry.path.clone(), Direction::Download)],
                    ..Commit::default()
                };
                self.commit(event, Some(finished(event, EventStatus::Skipped)), commit)
                    .await?;
                return Ok(EventStatus::Skipped);
            }
            Err(err) => return Err(err.into()),
        }

        let commit = Commit {
            remove: vec![entry.path.clone()],
            ..Commit::default()
        };
        self.commit(event, Some(finished(event, EventStatus::Done)), commit)
            .await?;
        tracing::info!(path = %entry.path, "deleted remotely");
        Ok(EventStatus::Done)
    }

    async fn upload_move(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let Some(from) = event.path_from.as_deref() else {
            return self.upload_item(event, config).await;
        };
        let local = local_path_for(&self.root, &event.path)?;
        let Some(snap) = transfer::snapshot(&local).await? else {
            // Moved on again; recheck the source on the next requeue.
            let commit = Commit {
                pending: vec![(from.to_string(), Direction::Upload)],
                ..Commit::default()
            };
            self.commit(event, None, commit).await?;
            return Ok(EventStatus::Skipped);
        };
        let Some(source) = self.index.get(from).await? else {
            return self.upload_as_new(event, config).await;
        };

        let moved = match self.client.move_item(&source.path, &event.path, true).await {
            Ok(moved) => moved,
            Err(err) if err.classification() == ApiErrorClass::NotFound => {
                tracing::info!(
                    from,
                    path = %event.path,
                    "move source is gone remotely, uploading the destination"
                );
                return self.upload_as_new(event, config).await;
            }
            Err(err) => return Err(err.into()),
        };

        let mut commit = Commit::default();
        let mut dest = event.path.clone();
        if paths::normalize(moved.path_display()) != event.path_key() {
            dest = self.adopt_remote_name(&event.path, moved.path_display()).await?;
            commit.pending.push((event.path.clone(), Direction::Download));
        }
        commit.moves.push((source.path.clone(), dest.clone()));
        if let Metadata::File(file) = &moved {
            let mut entry = IndexEntry::file(&dest, file.rev.clone(), source.content_hash.clone());
            entry.inode = snap.inode;
            entry.last_sync = source.last_sync;
            commit.put.push(entry);
        }

        let mut history = finished(event, EventStatus::Done);
        history.path = dest.clone();
        self.commit(event, Some(history), commit).await?;
        tracing::info!(from = %source.path, path = %dest, "moved remotely");
        Ok(EventStatus::Done)
    }

    /// Uploads a move destination as a new item and forgets its source.
    async fn upload_as_new(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let mut added = event.clone();
        added.change_type = ChangeType::Added;
        added.path_from = None;
        let status = self.upload_item(&added, config).await?;
        if let Some(from) = &event.path_from {
            let commit = Commit {
                remove: vec![from.clone()],
                ..Commit::default()
            };
            self.commit(event, None, commit).await?;
        }
        Ok(status)
    }

    async fn upload_item(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let path = event.path.as_str();
        let local = local_path_for(&self.root, path)?;
        let Some(snap) = transfer::snapshot(&local).await? else {
            // Gone again; the removal arrives as its own change.
            self.commit(event, None, Commit::default()).await?;
            return Ok(EventStatus::Skipped);
        };
        let indexed = self.index.get(path).await?;
        let remote = self.client.get_metadata(path).await?;
        let state = self.local_state(&local, Some(snap), true, None).await?;
        let case_clash = self.case_clash(path, indexed.as_ref(), &snap).await?;

        let decision = decide_upload(UploadCheck {
            local: &state,
            indexed: indexed.as_ref(),
            remote: remote.as_ref(),
            excluded: config.ignore.is_excluded(path),
            case_clash,
        });
        match decision {
            UploadDecision::Skip => {
                self.commit(event, None, Commit::default()).await?;
                Ok(EventStatus::Skipped)
            }
            UploadDecision::SelectiveSyncConflict => {
                self.rename_aside(event, snap.is_dir, SELECTIVE_SYNC_SUFFIX).await
            }
            UploadDecision::CaseConflict => {
                self.rename_aside(event, snap.is_dir, CASE_CONFLICT_SUFFIX)
                    .await
            }
            UploadDecision::RefreshIndex { rev } => {
                let mut entry = IndexEntry::file(path, rev, state.hash.clone());
                entry.inode = snap.inode;
                entry.last_sync = Some(snap.mtime);
                let commit = Commit {
                    put: vec![entry],
                    ..Commit::default()
                };
                self.commit(event, None, commit).await?;
                tracing::debug!(path, "remote already has this content");
                Ok(EventStatus::Skipped)
            }
            UploadDecision::Upload { mode, swap } => {
                let aside = match swap {
                    Some(swap) => self.clear_remote_for_swap(path, swap, remote.as_ref()).await?,
                    None => None,
                };
                self.upload_file(event, &local, mode, aside).await
            }
            UploadDecision::CreateFolder { swap } => {
                let exists = swap.is_none() && matches!(remote, Some(Metadata::Folder(_)));
                let aside = match swap {
                    Some(swap) => self.clear_remote_for_swap(path, swap, remote.as_ref()).await?,
                    None => None,
                };
                self.create_remote_folder(event, &local, snap, exists, aside, config)
                    .await
            }
        }
    }

    /// A different local item, still on disk, is tracked under a name that
    /// differs from `path` only by case.
    async fn case_clash(
        &self,
        path: &str,
        indexed: Option<&IndexEntry>,
        snap: &FileSnapshot,
    ) -> Result<bool, EngineError> {
        let Some(entry) = indexed else {
            return Ok(false);
        };
        if entry.path == path {
            return Ok(false);
        }
        let tracked = transfer::snapshot(&local_path_for(&self.root, &entry.path)?).await?;
        Ok(tracked.is_some_and(|tracked| tracked.inode != snap.inode))
    }

    /// Clears the remote item of the old type. Returns where it was moved
    /// when it had changes this side never saw.
    async fn clear_remote_for_swap(
        &self,
        path: &str,
        swap: TypeSwap,
        remote: Option<&Metadata>,
    ) -> Result<Option<String>, EngineError> {
        match swap {
            TypeSwap::DeleteRemote { rev } => {
                match self.client.delete(path, rev.as_deref()).await {
                    Ok(_) => {}
                    Err(err) if err.classification() == ApiErrorClass::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(None)
            }
            TypeSwap::MoveRemoteAside => {
                let remote_is_dir = matches!(remote, Some(Metadata::Folder(_)));
                let user = self.user_name().await;
                let candidate = conflicting_copy_path(
                    path,
                    &user,
                    OffsetDateTime::now_utc().date(),
                    remote_is_dir,
                );
                let moved = self.client.move_item(path, &candidate, true).await?;
                tracing::warn!(
                    path,
                    aside = %moved.path_display(),
                    "moved unsynced remote item aside"
                );
                Ok(Some(moved.path_display().to_string()))
            }
        }
    }

    async fn upload_file(
        &self,
        event: &SyncEvent,
        local: &Path,
        mode: WriteMode,
        aside: Option<String>,
    ) -> Result<EventStatus, EngineError> {
        let path = event.path.as_str();
        let (content, snap) = transfer::stable_read(local).await?;
        let hash = transfer::hash_bytes(&content);
        let size = content.len() as u64;
        let meta = self.client.upload(path, content, mode, true).await?;

        let mut commit = Commit::default();
        let mut status = EventStatus::Done;
        let mut stored = path.to_string();
        if paths::normalize(&meta.path_display) != event.path_key() {
            // The remote changed under us and kept both versions.
            stored = self.adopt_remote_name(path, &meta.path_display).await?;
            commit.remove.push(path.to_string());
            commit.pending.push((path.to_string(), Direction::Download));
            commit.conflict = Some((
                path.to_string(),
                stored.clone(),
                "changed remotely during upload",
            ));
            status = EventStatus::Conflict;
        }
        if let Some(aside) = aside {
            commit.pending.push((aside.clone(), Direction::Download));
            commit.conflict = Some((
                path.to_string(),
                aside,
                "replaced by a local item of another type",
            ));
        }

        let stored_local = local_path_for(&self.root, &stored)?;
        self.index
            .put_hash(&HashCacheEntry {
                local_path: stored_local.to_string_lossy().into_owned(),
                inode: snap.inode,
                mtime: snap.mtime,
                size: snap.size,
                hash: hash.clone(),
            })
            .await?;
        let content_hash = meta.content_hash.clone().unwrap_or(hash);
        let mut entry = IndexEntry::file(&stored, meta.rev.clone(), Some(content_hash.clone()));
        entry.inode = snap.inode;
        entry.last_sync = Some(snap.mtime);
        commit.put.push(entry);

        let mut history = finished(event, status);
        history.path = stored.clone();
        history.rev = Some(meta.rev);
        history.content_hash = Some(content_hash);
        history.size = size;
        history.completed = size;
        self.commit(event, Some(history), commit).await?;
        tracing::info!(path = %stored, size, "uploaded");
        Ok(status)
    }

    async fn create_remote_folder(
        &self,
        event: &SyncEvent,
        local: &Path,
        snap: FileSnapshot,
        exists: bool,
        aside: Option<String>,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let path = event.path.as_str();
        if !exists {
            match self.client.create_folder(path).await {
                Ok(_) => {}
                Err(err) if err.classification() == ApiErrorClass::Conflict => {
                    if !matches!(self.client.get_metadata(path).await?, Some(Metadata::Folder(_))) {
                        return Err(err.into());
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        let newly_tracked = self
            .index
            .get(path)
            .await?
            .is_none_or(|entry| !entry.is_folder());
        let mut commit = Commit {
            put: vec![folder_entry(path, Some(snap))],
            ..Commit::default()
        };
        if newly_tracked {
            // Contents moved in together with the folder raise no events.
            for (child, _) in self.local_tree(local, &config.ignore).await? {
                if self.index.get(&child).await?.is_none() {
                    commit.pending.push((child, Direction::Upload));
                }
            }
        }
        if let Some(aside) = aside {
            commit.pending.push((aside.clone(), Direction::Download));
            commit.conflict = Some((
                path.to_string(),
                aside,
                "replaced by a local item of another type",
            ));
        }

        self.commit(event, Some(finished(event, EventStatus::Done)), commit)
            .await?;
        tracing::debug!(path, "created remote folder");
        Ok(EventStatus::Done)
    }

    /// Renames a local item aside and queues the new name for upload.
    async fn rename_aside(
        &self,
        event: &SyncEvent,
        is_dir: bool,
        label: &'static str,
    ) -> Result<EventStatus, EngineError> {
        let path = event.path.as_str();
        let renamed = self.free_local_name(&suffixed_path(path, label, is_dir), is_dir);
        let _from = self.expected.expect(path);
        let _to = self.expected.expect(&renamed);
        tokio::fs::rename(
            local_path_for(&self.root, path)?,
            local_path_for(&self.root, &renamed)?,
        )
        .await?;

        let commit = Commit {
            pending: vec![(renamed.clone(), Direction::Upload)],
            conflict: Some((path.to_string(), renamed.clone(), label)),
            ..Commit::default()
        };
        self.commit(event, Some(finished(event, EventStatus::Conflict)), commit)
            .await?;
        tracing::info!(path, renamed = %renamed, reason = label, "renamed local item aside");
        Ok(EventStatus::Conflict)
    }

    /// Follows a remote rename of `path` to `stored` on disk.
    async fn adopt_remote_name(&self, path: &str, stored: &str) -> Result<String, EngineError> {
        let _from = self.expected.expect(path);
        let _to = self.expected.expect(stored);
        tokio::fs::rename(
            local_path_for(&self.root, path)?,
            local_path_for(&self.root, stored)?,
        )
        .await?;
        tracing::info!(path, stored, "remote stored the item under a different name");
        Ok(stored.to_string())
    }
}
