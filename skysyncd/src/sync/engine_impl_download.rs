fn folder_entry(path: &str, snap: Option<FileSnapshot>) -> IndexEntry {
    let mut entry = IndexEntry::folder(path);
    entry.inode = snap.and_then(|snap| snap.inode);
    entry.last_sync = Some(unix_now_nanos());
    entry
}

impl SyncEngine {
    async fn apply_download(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        match (event.change_type, event.item_type) {
            (ChangeType::Removed, _) => self.download_deletion(event, config).await,
            (_, ItemType::Folder) => self.download_folder(event, config).await,
            (_, ItemType::File) => self.download_file(event, config).await,
        }
    }

    /// Index entry and local location for a remote path. A tracked item keeps
    /// the casing it already has on disk.
    async fn tracked(
        &self,
        path: &str,
    ) -> Result<(Option<IndexEntry>, String, PathBuf), EngineError> {
        let indexed = self.index.get(path).await?;
        let path = indexed
            .as_ref()
            .map_or_else(|| path.to_string(), |entry| entry.path.clone());
        let local = local_path_for(&self.root, &path)?;
        Ok((indexed, path, local))
    }

    /// `below` walks folders to find unsynced files; only deletions and type
    /// changes need that.
    async fn local_state(
        &self,
        local: &Path,
        snap: Option<FileSnapshot>,
        with_hash: bool,
        below: Option<&IgnorePatterns>,
    ) -> Result<LocalState, EngineError> {
        let Some(snap) = snap else {
            return Ok(LocalState::missing());
        };
        if snap.is_dir {
            let changed_below = match below {
                Some(ignore) => self.changed_below(local, ignore).await?,
                None => false,
            };
            return Ok(LocalState {
                exists: true,
                is_dir: true,
                newest_mtime: snap.mtime,
                hash: None,
                changed_below,
            });
        }
        let hash = if with_hash {
            Some(transfer::cached_hash(&self.index, local, &snap).await?)
        } else {
            None
        };
        Ok(LocalState {
            exists: true,
            is_dir: false,
            newest_mtime: snap.mtime,
            hash,
            changed_below: false,
        })
    }

    async fn changed_below(
        &self,
        local: &Path,
        ignore: &IgnorePatterns,
    ) -> Result<bool, EngineError> {
        for (path, is_dir) in self.local_tree(local, ignore).await? {
            let Some(entry) = self.index.get(&path).await? else {
                return Ok(true);
            };
            if entry.is_folder() != is_dir {
                return Ok(true);
            }
            if is_dir {
                continue;
            }
            let snap = transfer::snapshot(&local_path_for(&self.root, &path)?).await?;
            if snap.is_some_and(|snap| snap.mtime > entry.last_sync.unwrap_or(0)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn download_deletion(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let (indexed, path, local) = self.tracked(&event.path).await?;
        let snap = transfer::snapshot(&local).await?;
        let state = self
            .local_state(&local, snap, false, Some(&config.ignore))
            .await?;

        match decide_download(RemoteChange::Deleted, indexed.as_ref(), &state) {
            DownloadDecision::Apply => {
                let _expected = state
                    .exists
                    .then(|| self.expect_removal(&path, state.is_dir));
                if state.exists {
                    transfer::remove_local(&local, config.use_trash).await?;
                }
                let commit = Commit {
                    remove: vec![path.clone()],
                    ..Commit::default()
                };
                self.commit(event, Some(finished(event, EventStatus::Done)), commit)
                    .await?;
                tracing::info!(path = %path, "deleted locally");
                Ok(EventStatus::Done)
            }
            DownloadDecision::KeepLocal => {
                let mut pending = vec![(path.clone(), Direction::Upload)];
                if state.is_dir {
                    let tree = self.local_tree(&local, &config.ignore).await?;
                    pending.extend(tree.into_iter().map(|(path, _)| (path, Direction::Upload)));
                }
                let commit = Commit {
                    remove: vec![path.clone()],
                    pending,
                    ..Commit::default()
                };
                self.commit(event, Some(finished(event, EventStatus::Conflict)), commit)
                    .await?;
                tracing::info!(path = %path, "kept local changes to an item deleted remotely");
                Ok(EventStatus::Conflict)
            }
            // Not produced for deletions.
            DownloadDecision::NoOp
            | DownloadDecision::UpdateIndex
            | DownloadDecision::ConflictCopy
            | DownloadDecision::MoveLocalAside => {
                self.commit(event, None, Commit::default()).await?;
                Ok(EventStatus::Skipped)
            }
        }
    }

    async fn download_file(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let rev = event.rev.as_deref().unwrap_or_default();
        let (indexed, path, local) = self.tracked(&event.path).await?;
        let snap = transfer::snapshot(&local).await?;
        let same_rev = indexed
            .as_ref()
            .is_some_and(|entry| !entry.is_folder() && entry.remote_version == rev);
        let state = self
            .local_state(&local, snap, !same_rev, Some(&config.ignore))
            .await?;

        let remote = RemoteChange::File {
            rev,
            hash: event.content_hash.as_deref(),
        };
        match decide_download(remote, indexed.as_ref(), &state) {
            DownloadDecision::NoOp => {
                self.commit(event, None, Commit::default()).await?;
                Ok(EventStatus::Skipped)
            }
            DownloadDecision::UpdateIndex => {
                let mut entry = IndexEntry::file(&path, rev, event.content_hash.clone());
                if let Some(snap) = snap {
                    entry.inode = snap.inode;
                    entry.last_sync = Some(snap.mtime);
                }
                let commit = Commit {
                    put: vec![entry],
                    ..Commit::default()
                };
                self.commit(event, None, commit).await?;
                tracing::debug!(path = %path, rev, "local content already matches");
                Ok(EventStatus::Skipped)
            }
            DownloadDecision::Apply => {
                let _replaced = state.is_dir.then(|| self.expected.expect_tree(&path));
                let _expected = self.expected.expect(&path);
                if state.is_dir {
                    transfer::remove_local(&local, config.use_trash).await?;
                }
                let Some(entry) = self.fetch_file(&path, &path).await? else {
                    self.commit(event, None, Commit::default()).await?;
                    return Ok(EventStatus::Skipped);
                };
                let mut history = finished(event, EventStatus::Done);
                history.rev = Some(entry.remote_version.clone());
                tracing::info!(path = %path, rev = %entry.remote_version, "downloaded");
                let commit = Commit {
                    put: vec![entry],
                    ..Commit::default()
                };
                self.commit(event, Some(history), commit).await?;
                Ok(EventStatus::Done)
            }
            DownloadDecision::ConflictCopy => self.download_conflict_copy(event, &path, snap).await,
            DownloadDecision::MoveLocalAside | DownloadDecision::KeepLocal => {
                self.commit(event, None, Commit::default()).await?;
                Ok(EventStatus::Skipped)
            }
        }
    }

    fn expect_removal(&self, path: &str, is_dir: bool) -> Expected {
        if is_dir {
            self.expected.expect_tree(path)
        } else {
            self.expected.expect(path)
        }
    }

    /// Downloads `remote_path` into the local file for `target`. Returns the
    /// index entry for `target`, or `None` when the remote file is gone. The
    /// caller holds the expectation for `target`.
    async fn fetch_file(
        &self,
        remote_path: &str,
        target: &str,
    ) -> Result<Option<IndexEntry>, EngineError> {
        let (meta, content) = match self.client.download(remote_path).await {
            Ok(found) => found,
            Err(err) if err.classification() == ApiErrorClass::NotFound => {
                tracing::debug!(path = remote_path, "remote file vanished before download");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let local = local_path_for(&self.root, target)?;
        let hash = meta
            .content_hash
            .clone()
            .unwrap_or_else(|| transfer::hash_bytes(&content));

        transfer::write_atomic(&local, &content, meta.content_hash.as_deref()).await?;
        let snap = transfer::snapshot(&local)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "downloaded file vanished"))?;
        self.index
            .put_hash(&HashCacheEntry {
                local_path: local.to_string_lossy().into_owned(),
                inode: snap.inode,
                mtime: snap.mtime,
                size: snap.size,
                hash: hash.clone(),
            })
            .await?;

        let mut entry = IndexEntry::file(target, meta.rev, Some(hash));
        entry.inode = snap.inode;
        entry.last_sync = Some(snap.mtime);
        Ok(Some(entry))
    }

    /// Keeps the local edit in place and saves the remote version next to it.
    /// The original takes the remote rev, so its re-upload carries the right
    /// precondition, and has no sync time, so it counts as locally modified
    /// until then.
    async fn download_conflict_copy(
        &self,
        event: &SyncEvent,
        path: &str,
        snap: Option<FileSnapshot>,
    ) -> Result<EventStatus, EngineError> {
        let copy = self.conflict_copy_name(path, false).await;
        let _expected = self.expected.expect(&copy);
        let Some(fetched) = self.fetch_file(path, &copy).await? else {
            self.commit(event, None, Commit::default()).await?;
            return Ok(EventStatus::Skipped);
        };

        let mut original = IndexEntry::file(
            path,
            fetched.remote_version.clone(),
            fetched.content_hash.clone(),
        );
        original.inode = snap.and_then(|snap| snap.inode);
        let commit = Commit {
            put: vec![original],
            pending: vec![
                (path.to_string(), Direction::Upload),
                (copy.clone(), Direction::Upload),
            ],
            conflict: Some((path.to_string(), copy.clone(), "changed locally and remotely")),
            ..Commit::default()
        };
        let mut history = finished(event, EventStatus::Conflict);
        history.rev = Some(fetched.remote_version);
        self.commit(event, Some(history), commit).await?;

        tracing::warn!(
            path,
            copy = %copy,
            "remote change conflicts with local edits, saved as a copy"
        );
        Ok(EventStatus::Conflict)
    }

    async fn download_folder(
        &self,
        event: &SyncEvent,
        config: &CycleConfig,
    ) -> Result<EventStatus, EngineError> {
        let (indexed, path, local) = self.tracked(&event.path).await?;
        let snap = transfer::snapshot(&local).await?;
        let state = self.local_state(&local, snap, false, None).await?;

        match decide_download(RemoteChange::Folder, indexed.as_ref(), &state) {
            DownloadDecision::UpdateIndex => {
                let commit = Commit {
                    put: vec![folder_entry(&path, snap)],
                    ..Commit::default()
                };
                self.commit(event, None, commit).await?;
                Ok(EventStatus::Skipped)
            }
            DownloadDecision::Apply => {
                let _expected = self.expected.expect(&path);
                if state.exists {
                    transfer::remove_local(&local, config.use_trash).await?;
                }
                tokio::fs::create_dir_all(&local).await?;
                let snap = transfer::snapshot(&local).await?;
                let commit = Commit {
                    put: vec![folder_entry(&path, snap)],
                    ..Commit::default()
                };
                self.commit(event, Some(finished(event, EventStatus::Done)), commit)
                    .await?;
                tracing::debug!(path = %path, "created local folder");
                Ok(EventStatus::Done)
            }
            DownloadDecision::MoveLocalAside => {
                let aside = self.conflict_copy_name(&path, false).await;
                let _moved = self.expected.expect(&path);
                let _aside = self.expected.expect(&aside);
                tokio::fs::rename(&local, local_path_for(&self.root, &aside)?).await?;
                tokio::fs::create_dir_all(&local).await?;
                let snap = transfer::snapshot(&local).await?;

                let commit = Commit {
                    put: vec![folder_entry(&path, snap)],
                    pending: vec![(aside.clone(), Direction::Upload)],
                    conflict: Some((path.clone(), aside.clone(), "replaced by a remote folder")),
                    ..Commit::default()
                };
                self.commit(event, Some(finished(event, EventStatus::Conflict)), commit)
                    .await?;
                tracing::warn!(
                    path = %path,
                    aside = %aside,
                    "moved local file aside for a remote folder"
                );
                Ok(EventStatus::Conflict)
            }
            DownloadDecision::NoOp
            | DownloadDecision::ConflictCopy
            | DownloadDecision::KeepLocal => {
                self.commit(event, None, Commit::default()).await?;
                Ok(EventStatus::Skipped)
            }
        }
    }
}
