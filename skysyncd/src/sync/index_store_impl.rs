impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    /// Opens (creating if needed) a WAL-mode database file.
    pub async fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub fn default_path() -> Result<PathBuf, IndexError> {
        let data_dir = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
        Ok(data_dir.join("skysync").join("index.db"))
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        self.quick_check().await?;
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn quick_check(&self) -> Result<(), IndexError> {
        let result: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if result != "ok" {
            return Err(IndexError::Corrupted(result));
        }
        Ok(())
    }

    /// Starts a write transaction. Do not read through the store while holding
    /// one; read first, then begin.
    pub async fn begin(&self) -> Result<IndexTxn, IndexError> {
        let guard = self.write_lock.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(IndexTxn { tx, _guard: guard })
    }

    pub async fn get(&self, path: &str) -> Result<Option<IndexEntry>, IndexError> {
        let row = sqlx::query(
            "SELECT path, item_type, rev, content_hash, inode, last_sync
             FROM items WHERE path_key = ?1",
        )
        .bind(paths::normalize(path))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn put(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.put(entry).await?;
        txn.commit().await
    }

    pub async fn remove(&self, path: &str) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.remove(path).await?;
        txn.commit().await
    }

    /// Entries at `prefix` and below it, ordered by key.
    pub async fn list_entries_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<IndexEntry>, IndexError> {
        let key = paths::normalize(prefix);
        let below = descendant_prefix(&key);
        let rows = sqlx::query(
            "SELECT path, item_type, rev, content_hash, inode, last_sync
             FROM items
             WHERE path_key = ?1 OR substr(path_key, 1, length(?2)) = ?2
             ORDER BY path_key ASC",
        )
        .bind(&key)
        .bind(&below)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_entries(&self) -> Result<Vec<IndexEntry>, IndexError> {
        self.list_entries_by_prefix("/").await
    }

    pub async fn get_cursor(&self) -> Result<Option<String>, IndexError> {
        self.get_state(STATE_CURSOR).await
    }

    pub async fn set_cursor(&self, cursor: &str) -> Result<(), IndexError> {
        self.set_state(STATE_CURSOR, Some(cursor)).await
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("value")?),
            None => Ok(None),
        }
    }

    pub async fn set_state(&self, key: &str, value: Option<&str>) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.set_state(key, value).await?;
        txn.commit().await
    }

    pub async fn append_event(&self, event: &SyncEvent) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.append_event(event).await?;
        txn.commit().await
    }

    /// History newer than `since` (unix seconds), oldest first, fetched lazily.
    pub fn list_events(
        &self,
        since: i64,
    ) -> impl Stream<Item = Result<SyncEvent, IndexError>> + '_ {
        sqlx::query(
            "SELECT direction, item_type, change_type, status, path, path_from, rev,
                    content_hash, size, completed, change_time, sync_time
             FROM sync_events
             WHERE sync_time > ?1
             ORDER BY sync_time ASC, id ASC",
        )
        .bind(since)
        .fetch(&self.pool)
        .map(|row| {
            row.map_err(IndexError::from)
                .and_then(|row| event_from_row(&row))
        })
    }

    /// Drops history older than `max_age` and keeps at most `max_count` rows.
    pub async fn prune_events(&self, max_age: Duration, max_count: u32) -> Result<u64, IndexError> {
        let cutoff = unix_now() - max_age.as_secs() as i64;
        let mut txn = self.begin().await?;
        let aged = sqlx::query("DELETE FROM sync_events WHERE sync_time < ?1")
            .bind(cutoff)
            .execute(&mut *txn.tx)
            .await?
            .rows_affected();
        let overflow = sqlx::query(
            "DELETE FROM sync_events WHERE id NOT IN
                (SELECT id FROM sync_events ORDER BY sync_time DESC, id DESC LIMIT ?1)",
        )
        .bind(i64::from(max_count))
        .execute(&mut *txn.tx)
        .await?
        .rows_affected();
        txn.commit().await?;
        Ok(aged + overflow)
    }

    pub async fn get_pending(&self) -> Result<Vec<PendingEntry>, IndexError> {
        let rows = sqlx::query(
            "SELECT path, direction FROM pending ORDER BY created ASC, path_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let direction: String = row.try_get("direction")?;
            out.push(PendingEntry {
                path: row.try_get("path")?,
                direction: parse_field(&direction, Direction::parse)?,
            });
        }
        Ok(out)
    }

    pub async fn is_pending(&self, path: &str, direction: Direction) -> Result<bool, IndexError> {
        let row = sqlx::query("SELECT 1 FROM pending WHERE path_key = ?1 AND direction = ?2")
            .bind(paths::normalize(path))
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn mark_pending(&self, path: &str, direction: Direction) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.mark_pending(path, direction).await?;
        txn.commit().await
    }

    pub async fn clear_pending(&self, path: &str, direction: Direction) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.clear_pending(path, direction).await?;
        txn.commit().await
    }

    pub async fn get_hash(&self, local_path: &str) -> Result<Option<HashCacheEntry>, IndexError> {
        let row = sqlx::query(
            "SELECT local_path, inode, mtime, size, hash FROM hash_cache WHERE local_path = ?1",
        )
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let size: i64 = row.try_get("size")?;
        Ok(Some(HashCacheEntry {
            local_path: row.try_get("local_path")?,
            inode: inode_from_db(row.try_get("inode")?),
            mtime: row.try_get("mtime")?,
            size: size.max(0) as u64,
            hash: row.try_get("hash")?,
        }))
    }

    pub async fn put_hash(&self, entry: &HashCacheEntry) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO hash_cache (local_path, inode, mtime, size, hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(local_path) DO UPDATE SET
                inode = excluded.inode,
                mtime = excluded.mtime,
                size = excluded.size,
                hash = excluded.hash",
        )
        .bind(&entry.local_path)
        .bind(inode_to_db(entry.inode))
        .bind(entry.mtime)
        .bind(entry.size as i64)
        .bind(&entry.hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_error(&self, record: &SyncErrorRecord) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.record_error(record).await?;
        txn.commit().await
    }

    pub async fn clear_error(&self, path: &str, direction: Direction) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        txn.clear_error(path, direction).await?;
        txn.commit().await
    }

    pub async fn list_errors(&self) -> Result<Vec<SyncErrorRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT path, direction, title, message, created FROM sync_errors
             ORDER BY created ASC, path_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let direction: String = row.try_get("direction")?;
            out.push(SyncErrorRecord {
                path: row.try_get("path")?,
                direction: parse_field(&direction, Direction::parse)?,
                title: row.try_get("title")?,
                message: row.try_get("message")?,
                created: row.try_get("created")?,
            });
        }
        Ok(out)
    }

    /// Marks every path in the error set pending again in its direction.
    /// Returns how many paths were not pending already.
    pub async fn requeue_errors(&self) -> Result<u64, IndexError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO pending (path_key, path, direction, created)
             SELECT path_key, path, direction, ?1 FROM sync_errors WHERE true
             ON CONFLICT(path_key, direction) DO NOTHING",
        )
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drops error rows older than `max_age` whose path is no longer pending
    /// in that direction. Rows for paths still awaiting a retry are kept.
    pub async fn prune_stale_errors(&self, max_age: Duration) -> Result<u64, IndexError> {
        let cutoff = unix_now() - max_age.as_secs() as i64;
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM sync_errors WHERE created < ?1 AND NOT EXISTS
                (SELECT 1 FROM pending p
                 WHERE p.path_key = sync_errors.path_key AND p.direction = sync_errors.direction)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_conflict(
        &self,
        path: &str,
        copy_path: &str,
        reason: &str,
    ) -> Result<i64, IndexError> {
        let mut txn = self.begin().await?;
        let id = txn.record_conflict(path, copy_path, reason).await?;
        txn.commit().await?;
        Ok(id)
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, path, copy_path, reason, created FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConflictRecord {
                id: row.try_get("id")?,
                path: row.try_get("path")?,
                copy_path: row.try_get("copy_path")?,
                reason: row.try_get("reason")?,
                created: row.try_get("created")?,
            });
        }
        Ok(out)
    }

    /// Forgets everything learned about both sides so the next start runs a
    /// full listing and reindex. History and the conflict log are kept.
    pub async fn clear_all(&self) -> Result<(), IndexError> {
        let mut txn = self.begin().await?;
        for table in ["items", "hash_cache", "sync_state", "pending", "sync_errors"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *txn.tx)
                .await?;
        }
        txn.commit().await
    }

    pub async fn checkpoint(&self) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl IndexTxn {
    pub async fn put(&mut self, entry: &IndexEntry) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO items (path_key, path, item_type, rev, content_hash, inode, last_sync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path_key) DO UPDATE SET
                path = excluded.path,
                item_type = excluded.item_type,
                rev = excluded.rev,
                content_hash = excluded.content_hash,
                inode = excluded.inode,
                last_sync = excluded.last_sync",
        )
        .bind(entry.path_key())
        .bind(&entry.path)
        .bind(entry.item_type.as_str())
        .bind(&entry.remote_version)
        .bind(&entry.content_hash)
        .bind(inode_to_db(entry.inode))
        .bind(entry.last_sync)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Removes `path` and every entry below it.
    pub async fn remove(&mut self, path: &str) -> Result<(), IndexError> {
        let key = paths::normalize(path);
        let below = descendant_prefix(&key);
        sqlx::query("DELETE FROM items WHERE path_key = ?1 OR substr(path_key, 1, length(?2)) = ?2")
            .bind(&key)
            .bind(&below)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Re-keys `from` and its descendants under `to`.
    pub async fn move_entries(&mut self, from: &str, to: &str) -> Result<(), IndexError> {
        let from_key = paths::normalize(from);
        let below = descendant_prefix(&from_key);
        let rows = sqlx::query(
            "SELECT path, item_type, rev, content_hash, inode, last_sync
             FROM items WHERE path_key = ?1 OR substr(path_key, 1, length(?2)) = ?2",
        )
        .bind(&from_key)
        .bind(&below)
        .fetch_all(&mut *self.tx)
        .await?;
        let entries = rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?;

        self.remove(from).await?;
        for mut entry in entries {
            entry.path = paths::rebase(&entry.path, from, to);
            self.put(&entry).await?;
        }
        Ok(())
    }

    pub async fn set_state(&mut self, key: &str, value: Option<&str>) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn set_cursor(&mut self, cursor: &str) -> Result<(), IndexError> {
        self.set_state(STATE_CURSOR, Some(cursor)).await
    }

    pub async fn append_event(&mut self, event: &SyncEvent) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO sync_events
                (direction, item_type, change_type, status, path, path_from, rev,
                 content_hash, size, completed, change_time, sync_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(event.direction.as_str())
        .bind(event.item_type.as_str())
        .bind(event.change_type.as_str())
        .bind(event.status.as_str())
        .bind(&event.path)
        .bind(&event.path_from)
        .bind(&event.rev)
        .bind(&event.content_hash)
        .bind(event.size as i64)
        .bind(event.completed as i64)
        .bind(event.change_time)
        .bind(event.timestamp)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn mark_pending(
        &mut self,
        path: &str,
        direction: Direction,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO pending (path_key, path, direction, created) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path_key, direction) DO UPDATE SET path = excluded.path",
        )
        .bind(paths::normalize(path))
        .bind(path)
        .bind(direction.as_str())
        .bind(unix_now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn clear_pending(
        &mut self,
        path: &str,
        direction: Direction,
    ) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM pending WHERE path_key = ?1 AND direction = ?2")
            .bind(paths::normalize(path))
            .bind(direction.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn record_error(&mut self, record: &SyncErrorRecord) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO sync_errors (path_key, path, direction, title, message, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path_key, direction) DO UPDATE SET
                path = excluded.path,
                title = excluded.title,
                message = excluded.message,
                created = excluded.created",
        )
        .bind(paths::normalize(&record.path))
        .bind(&record.path)
        .bind(record.direction.as_str())
        .bind(&record.title)
        .bind(&record.message)
        .bind(record.created)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn clear_error(
        &mut self,
        path: &str,
        direction: Direction,
    ) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM sync_errors WHERE path_key = ?1 AND direction = ?2")
            .bind(paths::normalize(path))
            .bind(direction.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn record_conflict(
        &mut self,
        path: &str,
        copy_path: &str,
        reason: &str,
    ) -> Result<i64, IndexError> {
        let result = sqlx::query(
            "INSERT INTO conflicts (path, copy_path, reason, created) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(path)
        .bind(copy_path)
        .bind(reason)
        .bind(unix_now())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn commit(self) -> Result<(), IndexError> {
        self.tx.commit().await?;
        Ok(())
    }
}
