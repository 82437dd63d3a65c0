#[tokio::test]
async fn remote_edit_replaces_unchanged_local_file() {
    let h = harness().await;
    h.synced_file("/doc.txt", b"first").await;
    let rev = h.remote.put_file("/doc.txt", b"second");

    let summary = h.pull(vec![h.remote_event(ChangeType::Modified, "/doc.txt")]).await;

    assert_eq!(summary.done, 1);
    assert_eq!(h.read("/doc.txt").unwrap(), b"second");
    let entry = h.index.get("/doc.txt").await.unwrap().unwrap();
    assert_eq!(entry.remote_version, rev);
    assert_eq!(entry.content_hash, Some(transfer::hash_bytes(b"second")));
    let snap = transfer::snapshot(&h.local("/doc.txt")).await.unwrap().unwrap();
    assert_eq!(entry.last_sync, Some(snap.mtime));
    assert!(h.pending().await.is_empty());
    assert_eq!(h.history().await.len(), 1);
}

#[tokio::test]
async fn concurrent_edits_keep_both_versions() {
    let h = harness().await;
    h.synced_file("/doc.txt", b"base").await;
    h.edit("/doc.txt", b"mine");
    let remote_rev = h.remote.put_file("/doc.txt", b"theirs");

    let summary = h.pull(vec![h.remote_event(ChangeType::Modified, "/doc.txt")]).await;

    assert_eq!(summary.conflicts, 1);
    let copy = copy_name("/doc.txt");
    assert_eq!(h.read("/doc.txt").unwrap(), b"mine");
    assert_eq!(h.read(&copy).unwrap(), b"theirs");
    let entry = h.index.get("/doc.txt").await.unwrap().unwrap();
    assert_eq!(entry.remote_version, remote_rev);
    assert_eq!(entry.last_sync, None);

    let mut pending = h.pending().await;
    pending.sort();
    let mut expected = vec![
        (copy.clone(), Direction::Upload),
        ("/doc.txt".to_string(), Direction::Upload),
    ];
    expected.sort();
    assert_eq!(pending, expected);
    let conflicts = h.index.list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].copy_path, copy);

    // The next upload cycle sends both versions up.
    let summary = h.push(h.pending_uploads().await).await;
    assert_eq!(summary.done, 2);
    assert_eq!(h.remote.content("/doc.txt").unwrap(), b"mine");
    assert_eq!(h.remote.content(&copy).unwrap(), b"theirs");
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn remote_deletion_removes_unchanged_local_file() {
    let h = harness().await;
    h.synced_file("/old.txt", b"bye").await;
    h.remote.remove("/old.txt");

    let summary = h.pull(vec![h.remote_event(ChangeType::Removed, "/old.txt")]).await;

    assert_eq!(summary.done, 1);
    assert!(!h.exists("/old.txt"));
    assert!(h.index.get("/old.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_deletion_keeps_locally_modified_file() {
    let h = harness().await;
    h.synced_file("/draft.txt", b"v1").await;
    h.edit("/draft.txt", b"v2");
    h.remote.remove("/draft.txt");

    let summary = h.pull(vec![h.remote_event(ChangeType::Removed, "/draft.txt")]).await;

    assert_eq!(summary.conflicts, 1);
    assert_eq!(h.read("/draft.txt").unwrap(), b"v2");
    assert!(h.index.get("/draft.txt").await.unwrap().is_none());
    assert_eq!(h.pending().await, vec![("/draft.txt".to_string(), Direction::Upload)]);

    h.push(h.pending_uploads().await).await;
    assert_eq!(h.remote.content("/draft.txt").unwrap(), b"v2");
}

#[tokio::test]
async fn remote_folder_deletion_removes_synced_tree() {
    let h = harness().await;
    h.synced_folder("/Old").await;
    h.synced_file("/Old/a.txt", b"a").await;
    h.remote.remove("/Old");

    let mut event = h.remote_event(ChangeType::Removed, "/Old");
    event.item_type = ItemType::Folder;
    let summary = h.pull(vec![event]).await;

    assert_eq!(summary.done, 1);
    assert!(!h.exists("/Old"));
    assert!(h.index.get("/Old/a.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_folder_moves_unsynced_local_file_aside() {
    let h = harness().await;
    h.write("/Reports", b"notes");
    h.remote.put_folder("/Reports");

    let summary = h.pull(vec![h.remote_event(ChangeType::Added, "/Reports")]).await;

    assert_eq!(summary.conflicts, 1);
    assert!(h.local("/Reports").is_dir());
    let aside = conflicting_copy_path("/Reports", "Alex", OffsetDateTime::now_utc().date(), false);
    assert_eq!(h.read(&aside).unwrap(), b"notes");
    assert!(h.index.get("/Reports").await.unwrap().unwrap().is_folder());
    assert_eq!(h.pending().await, vec![(aside, Direction::Upload)]);
}

#[tokio::test]
async fn identical_content_only_records_the_rev() {
    let h = harness().await;
    h.write("/same.txt", b"equal");
    let rev = h.remote.put_file("/same.txt", b"equal");
    let before = std::fs::metadata(h.local("/same.txt")).unwrap().modified().unwrap();

    let summary = h.pull(vec![h.remote_event(ChangeType::Added, "/same.txt")]).await;

    assert_eq!(summary.skipped, 1);
    let entry = h.index.get("/same.txt").await.unwrap().unwrap();
    assert_eq!(entry.remote_version, rev);
    let after = std::fs::metadata(h.local("/same.txt")).unwrap().modified().unwrap();
    assert_eq!(before, after);
    assert!(h.history().await.is_empty());
}

#[tokio::test]
async fn remote_folder_is_created_locally_before_its_files() {
    let h = harness().await;
    h.remote.put_folder("/Photos");
    h.remote.put_file("/Photos/cat.jpg", b"meow");

    let summary = h
        .pull(vec![
            h.remote_event(ChangeType::Added, "/Photos/cat.jpg"),
            h.remote_event(ChangeType::Added, "/Photos"),
        ])
        .await;

    assert_eq!(summary.done, 2);
    assert_eq!(h.read("/Photos/cat.jpg").unwrap(), b"meow");
    assert!(h.index.get("/Photos").await.unwrap().unwrap().is_folder());
}
