use super::*;
use futures_util::TryStreamExt;
use skysync_core::{RemoteError, StatusCode};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::sync::event::{ChangeType, ItemType};
use crate::sync::memory_remote::MemoryRemote;
use crate::sync::status::PathStatus;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    index: IndexStore,
    remote: Arc<MemoryRemote>,
    settings: watch::Sender<SyncSettings>,
}

type Running = (OrchestratorHandle, JoinHandle<Result<(), OrchestratorError>>);

fn quick_settings() -> SyncSettings {
    SyncSettings {
        max_cpu_percent: 0,
        upload_workers: 2,
        download_workers: 2,
        debounce: Duration::from_millis(50),
        min_poll_interval: Duration::from_millis(20),
        longpoll_timeout: Duration::from_millis(200),
        maintenance_interval: Duration::from_millis(100),
        use_trash: false,
        ..SyncSettings::default()
    }
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sync");
    std::fs::create_dir_all(&root).unwrap();
    let index = IndexStore::open(&dir.path().join("index.db")).await.unwrap();
    Fixture {
        _dir: dir,
        root,
        index,
        remote: Arc::new(MemoryRemote::default()),
        settings: watch::channel(quick_settings()).0,
    }
}

impl Fixture {
    fn start(&self) -> Running {
        let client: Arc<dyn RemoteClient> = self.remote.clone();
        let orchestrator = Orchestrator::new(
            client,
            self.index.clone(),
            self.root.clone(),
            self.settings.subscribe(),
        );
        let handle = orchestrator.handle();
        (handle, tokio::spawn(orchestrator.run()))
    }

    fn local(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn write(&self, path: &str, content: &[u8]) {
        let local = self.local(path);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(local, content).unwrap();
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.local(path)).ok()
    }

    /// Both replicas hold `path` with `content`.
    fn synced(&self, path: &str, content: &[u8]) -> bool {
        self.read(path).as_deref() == Some(content)
            && self.remote.content(path).as_deref() == Some(content)
    }
}

async fn eventually(what: &str, mut check: impl AsyncFnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn shutdown((handle, run): Running) -> Result<(), OrchestratorError> {
    handle.stop();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("orchestrator did not stop")
        .unwrap()
}

/// Starts with one file on each side and waits until both are everywhere.
async fn converged(fx: &Fixture) -> Running {
    fx.remote.put_file("/docs/r.txt", b"remote");
    fx.write("/l.txt", b"local");
    let running = fx.start();
    eventually("initial sync", async || {
        fx.synced("/docs/r.txt", b"remote") && fx.synced("/l.txt", b"local")
    })
    .await;
    running
}

#[tokio::test]
async fn context_reports_listing_and_reindex_needs() {
    let fx = fixture().await;
    let settings = quick_settings();
    let now = unix_now();

    let mut ctx = SyncContext::load(&fx.index, settings.clone()).await.unwrap();
    assert!(ctx.needs_initial_listing());
    assert!(ctx.reindex_due(now));

    ctx.advance_cursor(&fx.index, "c1".to_string()).await.unwrap();
    fx.index
        .set_state(STATE_LAST_REINDEX, Some(&now.to_string()))
        .await
        .unwrap();
    fx.index.mark_pending("/a.txt", Direction::Upload).await.unwrap();

    let ctx = SyncContext::load(&fx.index, settings.clone()).await.unwrap();
    assert_eq!(ctx.cursor.as_deref(), Some("c1"));
    assert_eq!(ctx.pending_uploads, vec!["/a.txt".to_string()]);
    assert!(ctx.pending_downloads.is_empty());
    assert!(!ctx.reindex_due(now));
    assert!(ctx.reindex_due(now + settings.reindex_interval.as_secs() as i64));

    fx.index
        .set_state(STATE_REINDEX_POSITION, Some("/b.txt"))
        .await
        .unwrap();
    let ctx = SyncContext::load(&fx.index, settings).await.unwrap();
    assert!(ctx.reindex_due(now));
}

#[test]
fn duplicate_events_collapse_to_the_first() {
    let first = SyncEvent::new(Direction::Upload, ChangeType::Added, ItemType::File, "/A.txt");
    let events = vec![
        first.clone(),
        SyncEvent::new(Direction::Upload, ChangeType::Added, ItemType::File, "/a.txt"),
        SyncEvent::new(Direction::Upload, ChangeType::Modified, ItemType::File, "/a.txt"),
    ];

    let deduped = dedup_events(events);

    assert_eq!(deduped.len(), 2);
    assert_eq!(deduped[0], first);
    assert_eq!(deduped[1].change_type, ChangeType::Modified);
}

#[test]
fn worker_pool_width_is_clamped() {
    let mut pool = WorkerPool::new(0);
    assert_eq!(pool.width, 1);

    let slots = pool.resize(64);
    assert_eq!(pool.width, MAX_WORKERS);
    assert_eq!(slots.available_permits(), MAX_WORKERS);
    assert!(default_workers() >= 1 && default_workers() <= MAX_WORKERS);
}

#[tokio::test]
async fn startup_converges_both_replicas() {
    let fx = fixture().await;
    let running = converged(&fx).await;

    eventually("reindex bookkeeping", async || {
        fx.index.get_state(STATE_LAST_REINDEX).await.unwrap().is_some()
    })
    .await;
    assert!(fx.index.get_cursor().await.unwrap().is_some());
    assert!(fx.index.get("/docs").await.unwrap().unwrap().is_folder());
    assert!(fx.index.list_conflicts().await.unwrap().is_empty());

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn live_changes_flow_both_ways() {
    let fx = fixture().await;
    let running = converged(&fx).await;

    fx.write("/later.txt", b"pushed");
    eventually("local change uploaded", async || fx.synced("/later.txt", b"pushed")).await;

    fx.remote.put_file("/docs/news.txt", b"pulled");
    eventually("remote change downloaded", async || {
        fx.synced("/docs/news.txt", b"pulled")
    })
    .await;

    fx.remote.remove("/l.txt");
    eventually("remote deletion applied", async || !fx.local("/l.txt").exists()).await;

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn user_edits_right_after_a_download_are_uploaded() {
    let fx = fixture().await;
    let running = converged(&fx).await;

    fx.write("/docs/mine.txt", b"written next to a download");
    eventually("new file in downloaded folder uploaded", async || {
        fx.synced("/docs/mine.txt", b"written next to a download")
    })
    .await;

    fx.write("/docs/r.txt", b"edited after download");
    eventually("edit of downloaded file uploaded", async || {
        fx.synced("/docs/r.txt", b"edited after download")
    })
    .await;
    assert!(fx.index.list_conflicts().await.unwrap().is_empty());

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn failed_downloads_are_retried_after_a_restart() {
    let fx = fixture().await;
    fx.remote.put_file("/stuck.txt", b"arrives later");
    fx.remote.fail_download(
        "/stuck.txt",
        RemoteError::api(StatusCode::BAD_REQUEST, "unsupported_file/"),
    );
    let running = fx.start();
    eventually("download failure recorded", async || {
        !fx.index.list_errors().await.unwrap().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.read("/stuck.txt").is_none());
    shutdown(running).await.unwrap();

    let running = fx.start();
    eventually("failed download retried", async || {
        fx.synced("/stuck.txt", b"arrives later")
            && fx.index.list_errors().await.unwrap().is_empty()
    })
    .await;

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn resume_retries_failed_downloads() {
    let fx = fixture().await;
    let running = converged(&fx).await;
    let handle = running.0.clone();

    fx.remote.fail_download(
        "/later.txt",
        RemoteError::api(StatusCode::BAD_REQUEST, "unsupported_file/"),
    );
    fx.remote.put_file("/later.txt", b"second try");
    eventually("download failure recorded", async || {
        !fx.index.list_errors().await.unwrap().is_empty()
    })
    .await;

    handle.pause();
    handle.resume();
    eventually("failed download retried", async || fx.synced("/later.txt", b"second try")).await;

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn pause_holds_remote_changes_until_resume() {
    let fx = fixture().await;
    let running = converged(&fx).await;
    let handle = running.0.clone();

    handle.pause();
    assert_eq!(handle.status(), EngineStatus::Paused);
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.remote.put_file("/held.txt", b"later");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.read("/held.txt").is_none());
    assert_eq!(handle.status(), EngineStatus::Paused);

    handle.resume();
    eventually("held change downloaded", async || fx.synced("/held.txt", b"later")).await;
    eventually("idle after resume", async || handle.status() == EngineStatus::Idle).await;

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn expired_credentials_halt_the_orchestrator() {
    let fx = fixture().await;
    fx.remote
        .fail_next(RemoteError::api(StatusCode::UNAUTHORIZED, "expired_access_token/"));
    let (handle, run) = fx.start();

    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(OrchestratorError::Halted(_))));
    assert!(matches!(handle.status(), EngineStatus::Halted(_)));
    assert!(fx.index.get_cursor().await.unwrap().is_none());

    // Halted stays halted.
    handle.pause();
    handle.resume();
    assert!(matches!(handle.status(), EngineStatus::Halted(_)));
}

#[tokio::test]
async fn rebuild_index_resyncs_without_conflicts() {
    let fx = fixture().await;
    let running = converged(&fx).await;

    running.0.rebuild_index().await.unwrap();

    eventually("index rebuilt", async || {
        fx.index.get_cursor().await.unwrap().is_some()
            && fx.index.get_state(STATE_LAST_REINDEX).await.unwrap().is_some()
            && fx.index.get("/docs/r.txt").await.unwrap().is_some()
            && fx.index.get("/l.txt").await.unwrap().is_some()
    })
    .await;
    assert!(fx.index.list_conflicts().await.unwrap().is_empty());
    let mut remote = fx.remote.files();
    remote.sort();
    assert_eq!(
        remote,
        vec![
            ("/docs/r.txt".to_string(), b"remote".to_vec()),
            ("/l.txt".to_string(), b"local".to_vec()),
        ]
    );

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn maintenance_prunes_history() {
    let fx = fixture().await;
    fx.settings.send_modify(|settings| settings.history_max_count = 1);
    let running = converged(&fx).await;

    eventually("history pruned", async || {
        let events: Vec<SyncEvent> = fx.index.list_events(0).try_collect().await.unwrap();
        events.len() <= 1
    })
    .await;

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn new_exclusions_apply_from_the_next_cycle() {
    let fx = fixture().await;
    let running = converged(&fx).await;

    fx.settings
        .send_modify(|settings| settings.excluded = vec!["/Skip".to_string()]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.remote.put_file("/Skip/x.txt", b"excluded");
    fx.remote.put_file("/ok.txt", b"included");

    eventually("included file downloaded", async || fx.synced("/ok.txt", b"included")).await;
    assert!(!fx.local("/Skip").exists());

    shutdown(running).await.unwrap();
}

#[tokio::test]
async fn restart_continues_from_the_stored_cursor() {
    let fx = fixture().await;
    let running = converged(&fx).await;
    shutdown(running).await.unwrap();
    let cursor = fx.index.get_cursor().await.unwrap();
    assert!(cursor.is_some());

    fx.remote.put_file("/while-off.txt", b"missed");
    fx.write("/offline-edit.txt", b"queued");
    let running = fx.start();

    eventually("changes made while stopped", async || {
        fx.synced("/while-off.txt", b"missed") && fx.synced("/offline-edit.txt", b"queued")
    })
    .await;
    let view = running.0.status_view();
    eventually("status settles", async || {
        view.path_status("/offline-edit.txt", &IgnorePatterns::default())
            .await
            .unwrap()
            == PathStatus::UpToDate
    })
    .await;

    shutdown(running).await.unwrap();
}
