#[tokio::test]
async fn new_folder_and_file_are_uploaded() {
    let h = harness().await;
    h.write("/notes/a.txt", b"hello");

    let summary = h
        .push(vec![
            upload_event(ChangeType::Added, ItemType::File, "/notes/a.txt"),
            upload_event(ChangeType::Added, ItemType::Folder, "/notes"),
        ])
        .await;

    assert_eq!(summary.done, 2);
    assert!(h.remote.exists("/notes"));
    assert_eq!(h.remote.content("/notes/a.txt").unwrap(), b"hello");
    let entry = h.index.get("/notes/a.txt").await.unwrap().unwrap();
    assert_eq!(Some(entry.remote_version), h.remote.rev_of("/notes/a.txt"));
    assert!(h.index.get("/notes").await.unwrap().unwrap().is_folder());
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn local_edit_overwrites_the_synced_rev() {
    let h = harness().await;
    h.synced_file("/doc.txt", b"v1").await;
    h.edit("/doc.txt", b"v2");

    let summary = h
        .push(vec![upload_event(ChangeType::Modified, ItemType::File, "/doc.txt")])
        .await;

    assert_eq!(summary.done, 1);
    assert_eq!(h.remote.content("/doc.txt").unwrap(), b"v2");
    let entry = h.index.get("/doc.txt").await.unwrap().unwrap();
    assert_eq!(Some(entry.remote_version), h.remote.rev_of("/doc.txt"));
    assert_eq!(entry.content_hash, Some(transfer::hash_bytes(b"v2")));
}

#[tokio::test]
async fn remote_edit_during_upload_keeps_both_versions() {
    let h = harness().await;
    h.synced_file("/doc.txt", b"v1").await;
    h.remote.put_file("/doc.txt", b"theirs");
    h.edit("/doc.txt", b"mine");

    let summary = h
        .push(vec![upload_event(ChangeType::Modified, ItemType::File, "/doc.txt")])
        .await;

    assert_eq!(summary.conflicts, 1);
    let stored = "/doc (conflicted copy).txt";
    assert_eq!(h.remote.content("/doc.txt").unwrap(), b"theirs");
    assert_eq!(h.remote.content(stored).unwrap(), b"mine");
    assert_eq!(h.read(stored).unwrap(), b"mine");
    assert!(!h.exists("/doc.txt"));
    assert_eq!(h.pending().await, vec![("/doc.txt".to_string(), Direction::Download)]);

    h.pull(vec![h.remote_event(ChangeType::Modified, "/doc.txt")]).await;
    assert_eq!(h.read("/doc.txt").unwrap(), b"theirs");
}

#[tokio::test]
async fn content_already_remote_only_refreshes_the_index() {
    let h = harness().await;
    h.write("/same.txt", b"equal");
    let rev = h.remote.put_file("/same.txt", b"equal");

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/same.txt")])
        .await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(h.remote.upload_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.index.get("/same.txt").await.unwrap().unwrap().remote_version, rev);
}

#[tokio::test]
async fn local_deletion_deletes_remotely() {
    let h = harness().await;
    h.synced_file("/gone.txt", b"x").await;
    std::fs::remove_file(h.local("/gone.txt")).unwrap();

    let summary = h
        .push(vec![upload_event(ChangeType::Removed, ItemType::File, "/gone.txt")])
        .await;

    assert_eq!(summary.done, 1);
    assert!(!h.remote.exists("/gone.txt"));
    assert!(h.index.get("/gone.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn local_deletion_loses_to_a_newer_remote_edit() {
    let h = harness().await;
    h.synced_file("/kept.txt", b"v1").await;
    h.remote.put_file("/kept.txt", b"v2");
    std::fs::remove_file(h.local("/kept.txt")).unwrap();

    let summary = h
        .push(vec![upload_event(ChangeType::Removed, ItemType::File, "/kept.txt")])
        .await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(h.remote.content("/kept.txt").unwrap(), b"v2");
    assert_eq!(h.pending().await, vec![("/kept.txt".to_string(), Direction::Download)]);

    h.pull(vec![h.remote_event(ChangeType::Modified, "/kept.txt")]).await;
    assert_eq!(h.read("/kept.txt").unwrap(), b"v2");
}

#[tokio::test]
async fn local_deletion_of_remotely_missing_item_is_done() {
    let h = harness().await;
    h.synced_file("/twice.txt", b"x").await;
    h.remote.remove("/twice.txt");
    std::fs::remove_file(h.local("/twice.txt")).unwrap();

    let summary = h
        .push(vec![upload_event(ChangeType::Removed, ItemType::File, "/twice.txt")])
        .await;

    assert_eq!(summary.done, 1);
    assert!(h.index.get("/twice.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn local_move_is_mirrored_remotely() {
    let h = harness().await;
    h.synced_file("/a.txt", b"moved").await;
    std::fs::rename(h.local("/a.txt"), h.local("/b.txt")).unwrap();

    let summary = h
        .push(vec![
            upload_event(ChangeType::Added, ItemType::File, "/b.txt").moved_from("/a.txt"),
        ])
        .await;

    assert_eq!(summary.done, 1);
    assert!(!h.remote.exists("/a.txt"));
    assert_eq!(h.remote.content("/b.txt").unwrap(), b"moved");
    assert!(h.index.get("/a.txt").await.unwrap().is_none());
    assert!(h.index.get("/b.txt").await.unwrap().is_some());
    assert_eq!(h.remote.upload_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn move_without_remote_source_uploads_the_destination() {
    let h = harness().await;
    h.synced_file("/a.txt", b"orphan").await;
    h.remote.remove("/a.txt");
    std::fs::rename(h.local("/a.txt"), h.local("/b.txt")).unwrap();

    let summary = h
        .push(vec![
            upload_event(ChangeType::Added, ItemType::File, "/b.txt").moved_from("/a.txt"),
        ])
        .await;

    assert_eq!(summary.done, 1);
    assert_eq!(h.remote.content("/b.txt").unwrap(), b"orphan");
    assert!(h.index.get("/a.txt").await.unwrap().is_none());
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn existing_remote_folder_is_only_indexed() {
    let h = harness().await;
    h.remote.put_folder("/Photos");
    std::fs::create_dir_all(h.local("/Photos")).unwrap();

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::Folder, "/Photos")])
        .await;

    assert_eq!(summary.done, 1);
    assert!(h.index.get("/Photos").await.unwrap().unwrap().is_folder());
}

#[tokio::test]
async fn local_folder_over_excluded_remote_folder_is_renamed() {
    let mut h = harness().await;
    h.config.ignore = IgnorePatterns::new(&["/Archive".to_string()]);
    h.remote.put_file("/Archive/old.txt", b"remote only");
    h.write("/Archive/mine.txt", b"local");

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::Folder, "/Archive")])
        .await;

    assert_eq!(summary.conflicts, 1);
    let renamed = "/Archive (selective sync conflict)";
    assert!(!h.exists("/Archive"));
    assert_eq!(h.read(&format!("{renamed}/mine.txt")).unwrap(), b"local");
    assert_eq!(h.pending().await, vec![(renamed.to_string(), Direction::Upload)]);

    h.push(h.pending_uploads().await).await;
    h.push(h.pending_uploads().await).await;
    assert_eq!(h.remote.content(&format!("{renamed}/mine.txt")).unwrap(), b"local");
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn new_item_in_excluded_folder_without_remote_copy_stays_local() {
    let mut h = harness().await;
    h.config.ignore = IgnorePatterns::new(&["/Archive".to_string()]);
    h.write("/Archive/new.txt", b"local");

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/Archive/new.txt")])
        .await;

    assert_eq!(summary.skipped, 1);
    assert!(h.exists("/Archive/new.txt"));
    assert!(!h.remote.exists("/Archive/new.txt"));
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = harness().await;
    h.write("/flaky.txt", b"data");
    h.remote.fail_next(RemoteError::api(StatusCode::SERVICE_UNAVAILABLE, ""));
    h.remote.fail_next(RemoteError::api(StatusCode::TOO_MANY_REQUESTS, ""));

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/flaky.txt")])
        .await;

    assert_eq!(summary.done, 1);
    assert_eq!(h.remote.content("/flaky.txt").unwrap(), b"data");
    assert!(h.index.list_errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_stay_pending_with_an_error() {
    let h = harness().await;
    h.write("/down.txt", b"data");
    for _ in 0..MAX_RETRY_ATTEMPTS {
        h.remote.fail_next(RemoteError::api(StatusCode::SERVICE_UNAVAILABLE, ""));
    }

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/down.txt")])
        .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(h.pending().await, vec![("/down.txt".to_string(), Direction::Upload)]);
    let errors = h.index.list_errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].title, "Could not upload");

    let summary = h.push(h.pending_uploads().await).await;
    assert_eq!(summary.done, 1);
    assert!(h.index.list_errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn path_failure_is_recorded_without_retry() {
    let h = harness().await;
    h.write("/big.bin", b"too much");
    h.write("/small.txt", b"fits");
    h.remote
        .fail_next(RemoteError::api(StatusCode::CONFLICT, "path/insufficient_space/"));

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/big.bin")])
        .await;

    assert_eq!(summary.failed, 1);
    assert!(h.pending().await.is_empty());
    let errors = h.index.list_errors().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "/big.bin");
    assert!(!h.remote.exists("/big.bin"));

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/small.txt")])
        .await;
    assert_eq!(summary.done, 1);
}

#[tokio::test]
async fn expired_credentials_halt_the_batch() {
    let h = harness().await;
    h.write("/a.txt", b"a");
    h.remote
        .fail_next(RemoteError::api(StatusCode::UNAUTHORIZED, "expired_access_token/"));

    let err = h
        .engine
        .apply_local_changes(
            vec![upload_event(ChangeType::Added, ItemType::File, "/a.txt")],
            &h.config,
            &h.pool,
            &h.cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(h.pending().await, vec![("/a.txt".to_string(), Direction::Upload)]);
}
