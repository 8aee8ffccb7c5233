//! End-to-end sync of two replicas through the mock Gist server.
//!
//! Each replica has its own bookmarks file and state directory, exactly as
//! two installations of the daemon would.

use bookmark_sync_core::model::RemoteDocument;
use bookmark_sync_core::orchestrator::TreeEvent;
use bookmark_sync_core::snapshot::build_local;
use bookmark_sync_core::tree::{BookmarkTree, NewNode, RootRole, TreeNode};
use bookmark_sync_daemon::mock_server::{self, MockGists};
use bookmark_sync_core::orchestrator::SyncError;
use bookmark_sync_daemon::{Config, Daemon, JsonFileTree, Status};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const TOKEN: &str = "test-token";

async fn start_server() -> (String, Arc<MockGists>) {
    let state = Arc::new(MockGists::with_token(TOKEN));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mock_server::serve(
        listener,
        Arc::clone(&state),
        std::future::pending(),
    ));
    (format!("http://{}", addr), state)
}

/// A replica without a gist id is the one that creates the gist.
fn config(dir: &TempDir, api_url: &str, gist_id: Option<&str>, name: &str) -> Config {
    Config {
        bookmarks_file: dir.path().join("bookmarks.json"),
        state_dir: dir.path().join("state"),
        token: Some(TOKEN.into()),
        gist_id: gist_id.map(str::to_string),
        create_gist: gist_id.is_none(),
        api_url: api_url.into(),
        device_name: name.into(),
        auto_sync: true,
        sync_on_startup: false,
    }
}

fn root_id(roots: &[TreeNode], role: RootRole) -> String {
    roots
        .iter()
        .find(|r| r.role == Some(role))
        .map(|r| r.id.clone())
        .unwrap()
}

async fn add_bookmark(daemon: &Daemon, title: &str, url: &str) -> TreeNode {
    let tree = daemon.orchestrator().tree();
    let roots = tree.read_tree().await.unwrap();
    tree.create(NewNode {
        parent_id: root_id(&roots, RootRole::Toolbar),
        title: title.into(),
        url: Some(url.into()),
    })
    .await
    .unwrap()
}

fn find<'a>(roots: &'a [TreeNode], title: &str) -> &'a TreeNode {
    roots
        .iter()
        .flat_map(|r| r.children.iter())
        .find(|n| n.title == title)
        .unwrap()
}

async fn titles(daemon: &Daemon) -> Vec<String> {
    let roots = daemon.orchestrator().tree().read_tree().await.unwrap();
    let mut titles: Vec<String> = build_local(&roots).into_values().map(|i| i.title).collect();
    titles.sort();
    titles
}

/// Remove a node the way a user would, reporting it like the watcher does.
async fn delete_bookmark(daemon: &Daemon, node: &TreeNode) {
    let tree = daemon.orchestrator().tree();
    let before = build_local(&tree.read_tree().await.unwrap());
    tree.remove(&node.id).await.unwrap();

    let item = before
        .into_values()
        .find(|i| i.title == node.title)
        .unwrap();
    let schedule = daemon
        .orchestrator()
        .on_tree_event(&TreeEvent::Removed(item))
        .await
        .unwrap();
    assert!(schedule);
}

// ==================== convergence ====================

#[tokio::test]
async fn test_two_replicas_converge() {
    let (url, server) = start_server().await;
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = Daemon::open(config(&dir_a, &url, None, "laptop")).await.unwrap();
    add_bookmark(&a, "Rust", "https://rust-lang.org").await;
    let report = a.sync_now().await.unwrap();
    assert!(report.document_created);
    assert_eq!(report.published, 1);

    let gist_id = Status::load(&config(&dir_a, &url, None, "laptop")).await.unwrap().gist_id.unwrap();
    assert_eq!(server.gist_ids(), vec![gist_id.clone()]);

    let b = Daemon::open(config(&dir_b, &url, Some(&gist_id), "desktop"))
        .await
        .unwrap();
    add_bookmark(&b, "Tokio", "https://tokio.rs").await;
    let report = b.sync_now().await.unwrap();
    assert_eq!(report.created, 1);
    assert!(!report.document_created);

    a.sync_now().await.unwrap();
    assert_eq!(titles(&a).await, vec!["Rust", "Tokio"]);
    assert_eq!(titles(&b).await, vec!["Rust", "Tokio"]);

    let document = RemoteDocument::parse(&server.document(&gist_id).unwrap()).unwrap();
    assert_eq!(document.version, 3);
    assert_eq!(document.devices.len(), 2);
    assert_eq!(document.items.len(), 2);
}

#[tokio::test]
async fn test_deletion_propagates() {
    let (url, server) = start_server().await;
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = Daemon::open(config(&dir_a, &url, None, "laptop")).await.unwrap();
    add_bookmark(&a, "Keep", "https://keep.example").await;
    add_bookmark(&a, "Drop", "https://drop.example").await;
    a.sync_now().await.unwrap();
    let gist_id = server.gist_ids().remove(0);

    let b = Daemon::open(config(&dir_b, &url, Some(&gist_id), "desktop"))
        .await
        .unwrap();
    b.sync_now().await.unwrap();
    assert_eq!(titles(&b).await, vec!["Drop", "Keep"]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let roots = b.orchestrator().tree().read_tree().await.unwrap();
    delete_bookmark(&b, find(&roots, "Drop")).await;
    assert_eq!(Status::load(&config(&dir_b, &url, Some(&gist_id), "desktop")).await.unwrap().tombstones, 1);
    b.sync_now().await.unwrap();

    let report = a.sync_now().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(titles(&a).await, vec!["Keep"]);

    // Nothing resurrects on further cycles
    b.sync_now().await.unwrap();
    a.sync_now().await.unwrap();
    assert_eq!(titles(&a).await, vec!["Keep"]);
    assert_eq!(titles(&b).await, vec!["Keep"]);
}

#[tokio::test]
async fn test_deletion_while_stopped_propagates() {
    let (url, server) = start_server().await;
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = Daemon::open(config(&dir_a, &url, None, "laptop")).await.unwrap();
    add_bookmark(&a, "Keep", "https://keep.example").await;
    add_bookmark(&a, "Gone", "https://gone.example").await;
    a.sync_now().await.unwrap();
    let gist_id = server.gist_ids().remove(0);

    {
        let b = Daemon::open(config(&dir_b, &url, Some(&gist_id), "desktop"))
            .await
            .unwrap();
        b.sync_now().await.unwrap();
        assert_eq!(titles(&b).await, vec!["Gone", "Keep"]);
    }

    // The user edits the file while no daemon is running
    tokio::time::sleep(Duration::from_millis(10)).await;
    let file = JsonFileTree::new(dir_b.path().join("bookmarks.json"));
    let roots = file.read_tree().await.unwrap();
    file.remove(&find(&roots, "Gone").id).await.unwrap();

    let b = Daemon::open(config(&dir_b, &url, Some(&gist_id), "desktop"))
        .await
        .unwrap();
    let report = b.sync_now().await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(titles(&b).await, vec!["Keep"]);

    let report = a.sync_now().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(titles(&a).await, vec!["Keep"]);
}

#[tokio::test]
async fn test_replicas_without_gist_id_are_refused() {
    let (url, server) = start_server().await;
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &url, None, "laptop");
    config.create_gist = false;

    let daemon = Daemon::open(config).await.unwrap();
    let err = daemon.sync_now().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::Configuration(_))
    ));
    assert!(server.gist_ids().is_empty());
}

// ==================== restart ====================

#[tokio::test]
async fn test_adopted_gist_survives_restart() {
    let (url, server) = start_server().await;
    let dir = TempDir::new().unwrap();

    {
        let daemon = Daemon::open(config(&dir, &url, None, "laptop")).await.unwrap();
        add_bookmark(&daemon, "Rust", "https://rust-lang.org").await;
        daemon.sync_now().await.unwrap();
    }

    // The saved gist is used without asking to create one
    let mut restarted = config(&dir, &url, None, "laptop");
    restarted.create_gist = false;
    let daemon = Daemon::open(restarted).await.unwrap();
    assert!(!daemon.first_run());
    let report = daemon.sync_now().await.unwrap();

    assert!(!report.document_created);
    assert_eq!(server.gist_ids().len(), 1);
    assert!(Status::load(&config(&dir, &url, None, "laptop")).await.unwrap().last_sync.is_some());
}

#[tokio::test]
async fn test_manual_sync_next_to_running_daemon_is_refused() {
    let (url, _server) = start_server().await;
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::open(config(&dir, &url, None, "laptop")).await.unwrap();

    let err = Daemon::open(config(&dir, &url, None, "cli")).await.err().unwrap();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::AlreadyRunning)
    ));
    drop(daemon);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let (url, _server) = start_server().await;
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::open(config(&dir, &url, None, "laptop")).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), daemon.run(async {})).await;
    assert!(result.unwrap().is_ok());
}
