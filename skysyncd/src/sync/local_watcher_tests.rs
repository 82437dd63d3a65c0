use super::*;
use crate::sync::index::IndexEntry;
use tempfile::TempDir;

fn rename_event(mode: RenameMode, paths: &[&str]) -> Event {
    Event {
        kind: EventKind::Modify(ModifyKind::Name(mode)),
        paths: paths.iter().map(PathBuf::from).collect(),
        attrs: Default::default(),
    }
}

#[test]
fn maps_modify_event() {
    let root = Path::new("/tmp/root");
    let event = Event {
        kind: EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
        paths: vec![PathBuf::from("/tmp/root/Docs/A.txt")],
        attrs: Default::default(),
    };
    assert_eq!(
        map_event(root, event),
        vec![RawChange::Modified("/Docs/A.txt".into())]
    );
}

#[test]
fn maps_paired_and_split_renames() {
    let root = Path::new("/tmp/root");
    assert_eq!(
        map_event(
            root,
            rename_event(RenameMode::Both, &["/tmp/root/A.txt", "/tmp/root/B.txt"])
        ),
        vec![RawChange::Moved {
            from: "/A.txt".into(),
            to: "/B.txt".into()
        }]
    );
    assert_eq!(
        map_event(root, rename_event(RenameMode::From, &["/tmp/root/A.txt"])),
        vec![RawChange::Removed("/A.txt".into())]
    );
    assert_eq!(
        map_event(root, rename_event(RenameMode::To, &["/tmp/root/B.txt"])),
        vec![RawChange::Created("/B.txt".into())]
    );
}

#[test]
fn ignores_events_outside_root_and_for_root() {
    let root = Path::new("/tmp/root");
    let event = Event {
        kind: EventKind::Create(notify::event::CreateKind::File),
        paths: vec![PathBuf::from("/elsewhere/x"), PathBuf::from("/tmp/root")],
        attrs: Default::default(),
    };
    assert!(map_event(root, event).is_empty());
}

fn collect(changes: Vec<RawChange>) -> Vec<LocalChange> {
    let mut collector = LocalChangeCollector::default();
    for change in changes {
        collector.push(change);
    }
    collector.drain()
}

#[test]
fn create_then_modify_is_added() {
    let out = collect(vec![
        RawChange::Created("/a.txt".into()),
        RawChange::Modified("/a.txt".into()),
        RawChange::Modified("/a.txt".into()),
    ]);
    assert_eq!(out, vec![LocalChange::Added("/a.txt".into())]);
}

#[test]
fn create_then_delete_cancels() {
    let out = collect(vec![
        RawChange::Created("/a.txt".into()),
        RawChange::Removed("/a.txt".into()),
    ]);
    assert!(out.is_empty());
}

#[test]
fn delete_then_create_is_modified() {
    let out = collect(vec![
        RawChange::Removed("/a.txt".into()),
        RawChange::Created("/a.txt".into()),
    ]);
    assert_eq!(out, vec![LocalChange::Modified("/a.txt".into())]);
}

#[test]
fn modify_then_delete_is_removed() {
    let out = collect(vec![
        RawChange::Modified("/a.txt".into()),
        RawChange::Removed("/a.txt".into()),
    ]);
    assert_eq!(out, vec![LocalChange::Removed("/a.txt".into())]);
}

#[test]
fn move_then_modify_keeps_both() {
    let out = collect(vec![
        RawChange::Moved {
            from: "/a.txt".into(),
            to: "/b.txt".into(),
        },
        RawChange::Modified("/b.txt".into()),
    ]);
    assert_eq!(
        out,
        vec![
            LocalChange::Moved {
                from: "/a.txt".into(),
                to: "/b.txt".into()
            },
            LocalChange::Modified("/b.txt".into()),
        ]
    );
}

#[test]
fn new_file_moved_is_added_at_destination() {
    let out = collect(vec![
        RawChange::Created("/tmp.txt".into()),
        RawChange::Moved {
            from: "/tmp.txt".into(),
            to: "/final.txt".into(),
        },
    ]);
    assert_eq!(out, vec![LocalChange::Added("/final.txt".into())]);
}

#[test]
fn chained_moves_collapse_and_round_trips_cancel() {
    let out = collect(vec![
        RawChange::Moved {
            from: "/a".into(),
            to: "/b".into(),
        },
        RawChange::Moved {
            from: "/b".into(),
            to: "/c".into(),
        },
    ]);
    assert_eq!(
        out,
        vec![LocalChange::Moved {
            from: "/a".into(),
            to: "/c".into()
        }]
    );

    let out = collect(vec![
        RawChange::Moved {
            from: "/a".into(),
            to: "/b".into(),
        },
        RawChange::Moved {
            from: "/b".into(),
            to: "/a".into(),
        },
    ]);
    assert!(out.is_empty());
}

#[test]
fn child_moves_under_moved_folder_are_dropped() {
    let out = collect(vec![
        RawChange::Moved {
            from: "/Old/x.txt".into(),
            to: "/New/x.txt".into(),
        },
        RawChange::Moved {
            from: "/Old".into(),
            to: "/New".into(),
        },
    ]);
    assert_eq!(
        out,
        vec![LocalChange::Moved {
            from: "/Old".into(),
            to: "/New".into()
        }]
    );
}

#[test]
fn deleting_a_move_target_removes_the_source() {
    let out = collect(vec![
        RawChange::Moved {
            from: "/a.txt".into(),
            to: "/b.txt".into(),
        },
        RawChange::Removed("/b.txt".into()),
    ]);
    assert_eq!(out, vec![LocalChange::Removed("/a.txt".into())]);
}

#[test]
fn expectations_match_once_and_only_removed_folders_cover_children() {
    let expected = ExpectedChanges::new(Duration::from_secs(60));
    let docs = expected.expect("/Docs");
    assert!(!expected.take("/docs/a.txt"));
    assert!(expected.take("/docs"));
    assert!(!expected.take("/Docs"));
    drop(docs);

    let removed = expected.expect_tree("/Old");
    assert!(expected.take("/old/a.txt"));
    assert!(expected.take("/Old/b/c.txt"));
    assert!(!expected.take("/Other"));
    drop(removed);
}

#[test]
fn expectations_expire_only_after_the_operation_ends() {
    let expected = ExpectedChanges::new(Duration::ZERO);
    let running = expected.expect("/a.txt");
    std::thread::sleep(Duration::from_millis(5));
    assert!(expected.take("/a.txt"));
    drop(running);

    let finished = expected.expect("/b.txt");
    drop(finished);
    assert!(!expected.take("/b.txt"));
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    index: IndexStore,
    watcher: LocalWatcher,
    expected: ExpectedChanges,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sync");
    std::fs::create_dir_all(&root).unwrap();
    let index = IndexStore::open(&dir.path().join("index.db")).await.unwrap();
    let expected = ExpectedChanges::new(Duration::from_secs(60));
    let watcher = LocalWatcher::detached(&root, expected.clone(), Duration::from_millis(20));
    Fixture {
        _dir: dir,
        root,
        index,
        watcher,
        expected,
    }
}

fn synced_file(path: &str, content: &[u8]) -> IndexEntry {
    let mut entry = IndexEntry::file(path, "r1", Some(transfer::hash_bytes(content)));
    entry.last_sync = Some(crate::sync::event::unix_now_nanos());
    entry
}

#[tokio::test]
async fn wait_times_out_without_changes_and_debounces_bursts() {
    let mut fx = fixture().await;
    assert!(!fx.watcher.wait_for_local_changes(Duration::from_millis(30)).await);

    let tx = fx.watcher.sender();
    tx.send(RawChange::Created("/a.txt".into())).await.unwrap();
    tx.send(RawChange::Modified("/a.txt".into())).await.unwrap();
    assert!(fx.watcher.wait_for_local_changes(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn lists_added_files_and_drops_ignored_and_expected() {
    let mut fx = fixture().await;
    std::fs::write(fx.root.join("new.txt"), b"hello").unwrap();
    std::fs::write(fx.root.join(".DS_Store"), b"x").unwrap();
    std::fs::write(fx.root.join("mine.txt"), b"x").unwrap();
    fx.index.put(&synced_file("/mine.txt", b"x")).await.unwrap();
    let _mine = fx.expected.expect("/mine.txt");

    let tx = fx.watcher.sender();
    for path in ["/new.txt", "/.DS_Store", "/mine.txt"] {
        tx.send(RawChange::Created(path.into())).await.unwrap();
    }

    let events = fx
        .watcher
        .list_local_changes(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "/new.txt");
    assert_eq!(events[0].change_type, ChangeType::Added);
    assert_eq!(events[0].direction, Direction::Upload);
    assert_eq!(events[0].size, 5);
}

#[tokio::test]
async fn user_edits_next_to_engine_writes_are_kept() {
    let mut fx = fixture().await;
    std::fs::create_dir_all(fx.root.join("docs")).unwrap();
    std::fs::write(fx.root.join("docs/r.txt"), b"edited by hand").unwrap();
    std::fs::write(fx.root.join("docs/mine.txt"), b"new").unwrap();
    fx.index.put(&IndexEntry::folder("/docs")).await.unwrap();
    fx.index.put(&synced_file("/docs/r.txt", b"downloaded")).await.unwrap();
    let _folder = fx.expected.expect("/docs");
    let _file = fx.expected.expect("/docs/r.txt");

    let tx = fx.watcher.sender();
    for path in ["/docs", "/docs/r.txt", "/docs/mine.txt"] {
        tx.send(RawChange::Created(path.into())).await.unwrap();
    }
    let mut events = fx
        .watcher
        .list_local_changes(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();
    events.sort_by(|a, b| a.path.cmp(&b.path));

    let found: Vec<(&str, ChangeType)> = events
        .iter()
        .map(|event| (event.path.as_str(), event.change_type))
        .collect();
    assert_eq!(
        found,
        vec![("/docs/mine.txt", ChangeType::Added), ("/docs/r.txt", ChangeType::Modified)]
    );

    // The expectation for r.txt is used up; the next edit is trusted as is.
    tx.send(RawChange::Modified("/docs/r.txt".into())).await.unwrap();
    let events = fx
        .watcher
        .list_local_changes(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_type, ChangeType::Modified);
}

#[tokio::test]
async fn move_to_excluded_destination_is_a_deletion() {
    let mut fx = fixture().await;
    fx.index.put(&synced_file("/a.txt", b"a")).await.unwrap();
    std::fs::write(fx.root.join("a.txt.partial"), b"a").unwrap();

    fx.watcher
        .sender()
        .send(RawChange::Moved {
            from: "/a.txt".into(),
            to: "/a.txt.partial".into(),
        })
        .await
        .unwrap();

    let events = fx
        .watcher
        .list_local_changes(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_type, ChangeType::Removed);
    assert_eq!(events[0].path, "/a.txt");
}

#[tokio::test]
async fn move_of_tracked_file_is_reported_as_move() {
    let mut fx = fixture().await;
    fx.index.put(&synced_file("/a.txt", b"a")).await.unwrap();
    std::fs::write(fx.root.join("b.txt"), b"a").unwrap();

    fx.watcher
        .sender()
        .send(RawChange::Moved {
            from: "/a.txt".into(),
            to: "/b.txt".into(),
        })
        .await
        .unwrap();

    let events = fx
        .watcher
        .list_local_changes(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_move());
    assert_eq!(events[0].path_from.as_deref(), Some("/a.txt"));
}

fn filesystem_is_case_sensitive(root: &Path) -> bool {
    let marker = root.join("CaseMarker");
    std::fs::write(&marker, b"").unwrap();
    let sensitive = !root.join("casemarker").exists();
    std::fs::remove_file(marker).unwrap();
    sensitive
}

#[tokio::test]
async fn case_clash_is_renamed_aside() {
    let mut fx = fixture().await;
    if !filesystem_is_case_sensitive(&fx.root) {
        return;
    }
    fx.index.put(&synced_file("/Doc.txt", b"one")).await.unwrap();
    std::fs::write(fx.root.join("Doc.txt"), b"one").unwrap();
    std::fs::write(fx.root.join("doc.txt"), b"two").unwrap();

    fx.watcher
        .sender()
        .send(RawChange::Created("/doc.txt".into()))
        .await
        .unwrap();
    let events = fx
        .watcher
        .list_local_changes(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "/doc (case conflict).txt");
    assert_eq!(events[0].change_type, ChangeType::Added);
    assert!(fx.root.join("doc (case conflict).txt").exists());
    assert!(!fx.root.join("doc.txt").exists());
}

#[tokio::test]
async fn reindex_finds_added_modified_and_removed() {
    let fx = fixture().await;
    std::fs::create_dir_all(fx.root.join("Docs")).unwrap();
    std::fs::write(fx.root.join("Docs/new.txt"), b"new").unwrap();
    std::fs::write(fx.root.join("same.txt"), b"same").unwrap();
    std::fs::write(fx.root.join("changed.txt"), b"changed").unwrap();

    let mut same = synced_file("/same.txt", b"same");
    same.last_sync = Some(0);
    fx.index.put(&same).await.unwrap();
    let mut changed = synced_file("/changed.txt", b"before");
    changed.last_sync = Some(0);
    fx.index.put(&changed).await.unwrap();
    fx.index.put(&synced_file("/gone.txt", b"gone")).await.unwrap();

    let events = fx
        .watcher
        .reindex(&fx.index, &IgnorePatterns::default(), None)
        .await
        .unwrap();

    let mut summary: Vec<(String, ChangeType)> = events
        .iter()
        .map(|event| (event.path.clone(), event.change_type))
        .collect();
    summary.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        summary,
        vec![
            ("/Docs".to_string(), ChangeType::Added),
            ("/Docs/new.txt".to_string(), ChangeType::Added),
            ("/changed.txt".to_string(), ChangeType::Modified),
            ("/gone.txt".to_string(), ChangeType::Removed),
        ]
    );

    assert!(fx.index.get_state(STATE_LAST_REINDEX).await.unwrap().is_some());
    assert_eq!(fx.index.get_state(STATE_REINDEX_POSITION).await.unwrap(), None);
    assert!(fx.index.is_pending("/changed.txt", Direction::Upload).await.unwrap());
}

#[tokio::test]
async fn reindex_resumes_after_saved_position() {
    let fx = fixture().await;
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(fx.root.join(name), name.as_bytes()).unwrap();
    }

    let events = fx
        .watcher
        .reindex(&fx.index, &IgnorePatterns::default(), Some("/b.txt"))
        .await
        .unwrap();
    let paths: Vec<&str> = events.iter().map(|event| event.path.as_str()).collect();
    assert_eq!(paths, vec!["/c.txt"]);
}

#[tokio::test]
async fn pending_uploads_are_rebuilt_from_disk() {
    let fx = fixture().await;
    std::fs::write(fx.root.join("doc.txt"), b"local edit").unwrap();
    let mut entry = synced_file("/doc.txt", b"remote version");
    entry.last_sync = Some(i64::MAX);
    fx.index.put(&entry).await.unwrap();
    fx.index.mark_pending("/doc.txt", Direction::Upload).await.unwrap();
    fx.index.mark_pending("/nothing.txt", Direction::Upload).await.unwrap();

    let events = fx
        .watcher
        .pending_upload_events(&fx.index, &IgnorePatterns::default())
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "/doc.txt");
    assert_eq!(events[0].change_type, ChangeType::Modified);
    assert!(!fx.index.is_pending("/nothing.txt", Direction::Upload).await.unwrap());
}

#[tokio::test]
async fn new_item_in_excluded_folder_is_handed_over_once() {
    let mut fx = fixture().await;
    let ignore = IgnorePatterns::new(&["/Archive".to_string()]);
    std::fs::create_dir_all(fx.root.join("Archive")).unwrap();
    std::fs::write(fx.root.join("Archive/a.txt"), b"a").unwrap();

    fx.watcher
        .sender()
        .send(RawChange::Created("/Archive".into()))
        .await
        .unwrap();
    let events = fx.watcher.list_local_changes(&fx.index, &ignore).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "/Archive");
    assert!(events[0].is_folder());

    let walked = fx.watcher.reindex(&fx.index, &ignore, None).await.unwrap();
    assert!(walked.is_empty());
}
