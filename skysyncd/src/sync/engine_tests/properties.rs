#[tokio::test]
async fn applying_the_same_remote_batch_twice_changes_nothing() {
    let h = harness().await;
    h.remote.put_file("/x.txt", b"x");
    h.remote.put_file("/D/y.txt", b"y");
    let events = vec![
        h.remote_event(ChangeType::Added, "/D"),
        h.remote_event(ChangeType::Added, "/x.txt"),
        h.remote_event(ChangeType::Added, "/D/y.txt"),
    ];

    let first = h.pull(events.clone()).await;
    let second = h.pull(events).await;

    assert_eq!(first.done, 3);
    assert_eq!(second.done, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(h.history().await.len(), 3);
    assert_eq!(h.read("/D/y.txt").unwrap(), b"y");
}

#[tokio::test]
async fn applying_the_same_local_batch_twice_uploads_once() {
    let h = harness().await;
    h.write("/u.txt", b"once");
    let events = vec![upload_event(ChangeType::Added, ItemType::File, "/u.txt")];

    assert_eq!(h.push(events.clone()).await.done, 1);
    assert_eq!(h.push(events).await.skipped, 1);
    assert_eq!(h.remote.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn both_replicas_converge() {
    let h = harness().await;
    h.remote.put_file("/docs/r.txt", b"remote");
    h.write("/notes/l.txt", b"local");

    h.pull(vec![
        h.remote_event(ChangeType::Added, "/docs"),
        h.remote_event(ChangeType::Added, "/docs/r.txt"),
    ])
    .await;
    h.push(vec![
        upload_event(ChangeType::Added, ItemType::Folder, "/notes"),
        upload_event(ChangeType::Added, ItemType::File, "/notes/l.txt"),
    ])
    .await;

    let mut remote = h.remote.files();
    remote.sort();
    assert_eq!(h.local_files(), remote);
    assert_eq!(remote.len(), 2);
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn deleted_folder_is_not_recreated_by_a_child_change() {
    let h = harness().await;
    h.synced_folder("/F").await;
    h.synced_file("/F/a.txt", b"a").await;
    let child = h.remote_event(ChangeType::Modified, "/F/a.txt");
    h.remote.remove("/F");
    let mut removed = h.remote_event(ChangeType::Removed, "/F");
    removed.item_type = ItemType::Folder;

    let summary = h.pull(vec![child, removed]).await;

    assert!(!h.exists("/F"));
    assert!(h.index.get("/F").await.unwrap().is_none());
    assert_eq!(summary.done, 1);
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn deleted_folder_stays_deleted_while_the_child_is_still_served() {
    let h = harness().await;
    h.synced_folder("/F").await;
    h.synced_file("/F/a.txt", b"a").await;
    h.remote.put_file("/F/a.txt", b"late edit");
    let child = h.remote_event(ChangeType::Modified, "/F/a.txt");
    let removed = SyncEvent::new(Direction::Download, ChangeType::Removed, ItemType::Folder, "/F");

    let summary = h.pull(vec![removed, child]).await;

    assert!(!h.exists("/F"));
    assert!(h.index.get("/F").await.unwrap().is_none());
    assert!(h.index.get("/F/a.txt").await.unwrap().is_none());
    assert_eq!(summary.done, 1);
    assert!(h.pending().await.is_empty());
}

#[tokio::test]
async fn local_delete_of_folder_then_file_keeps_order() {
    let h = harness().await;
    h.synced_folder("/F").await;
    h.synced_file("/F/a.txt", b"a").await;
    std::fs::remove_dir_all(h.local("/F")).unwrap();

    let summary = h
        .push(vec![
            upload_event(ChangeType::Removed, ItemType::File, "/F/a.txt"),
            upload_event(ChangeType::Removed, ItemType::Folder, "/F"),
        ])
        .await;

    assert_eq!(summary.done, 1);
    assert!(!h.remote.exists("/F"));
    assert!(h.index.list_entries().await.unwrap().is_empty());
    assert!(h.pending().await.is_empty());
}

fn case_sensitive(root: &Path) -> bool {
    let marker = root.join("CaseMarker");
    std::fs::write(&marker, b"").unwrap();
    let sensitive = !root.join("casemarker").exists();
    std::fs::remove_file(marker).unwrap();
    sensitive
}

#[tokio::test]
async fn names_differing_only_by_case_are_kept_apart() {
    let h = harness().await;
    if !case_sensitive(&h.root) {
        return;
    }
    h.synced_file("/Foo.txt", b"upper").await;
    h.write("/foo.txt", b"lower");

    let summary = h
        .push(vec![upload_event(ChangeType::Added, ItemType::File, "/foo.txt")])
        .await;

    assert_eq!(summary.conflicts, 1);
    let renamed = "/foo (case conflict).txt";
    assert_eq!(h.read(renamed).unwrap(), b"lower");
    assert_eq!(h.read("/Foo.txt").unwrap(), b"upper");
    assert_eq!(h.remote.content("/Foo.txt").unwrap(), b"upper");

    h.push(h.pending_uploads().await).await;
    assert_eq!(h.remote.content(renamed).unwrap(), b"lower");
}

#[tokio::test]
async fn interrupted_batch_resumes_without_losing_or_repeating_work() {
    let h = harness().await;
    for name in ["/a.txt", "/b.txt", "/c.txt"] {
        h.write(name, name.as_bytes());
    }
    h.remote.hang_uploads_after(Some(1));

    let events = ["/a.txt", "/b.txt", "/c.txt"]
        .into_iter()
        .map(|path| upload_event(ChangeType::Added, ItemType::File, path))
        .collect();
    let engine = h.engine.clone();
    let (config, pool, cancel) = (h.config.clone(), h.pool.clone(), h.cancel.clone());
    let run = tokio::spawn(async move {
        engine
            .apply_local_changes(events, &config, &pool, &cancel)
            .await
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        while h.remote.upload_calls.load(Ordering::SeqCst) < 3 || h.remote.files().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        while h.index.list_entries().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    h.cancel.cancel();
    let first = run.await.unwrap().unwrap();
    assert_eq!(first.done, 1);
    assert_eq!(first.aborted, 2);
    assert_eq!(h.pending().await.len(), 2);

    // A fresh engine over the same index, as after a restart.
    h.remote.hang_uploads_after(None);
    let engine = Arc::new(new_engine(&h.remote, &h.index, &h.root));
    let second = engine
        .apply_local_changes(
            h.pending_uploads().await,
            &h.config,
            &h.pool,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(second.done, 2);
    assert_eq!(first.done + second.done, 3);
    assert_eq!(h.remote.files().len(), 3);
    assert_eq!(h.index.list_entries().await.unwrap().len(), 3);
    assert!(h.pending().await.is_empty());
}
