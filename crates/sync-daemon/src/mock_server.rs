//! In-memory stand-in for the Gist API, for local and integration testing.
//!
//! Speaks the subset of the API `GistStore` uses, plus a few helper routes:
//! - `POST /gists`, `GET /gists/{id}`, `PATCH /gists/{id}`
//! - `GET /raw/{id}/{file}` serves a file's full text, for truncated responses
//! - `POST /reset` forgets every gist and the debug log
//! - `POST /load/{id}` seeds a gist's document from the raw request body
//! - `GET /data/{id}` returns a gist's raw document
//! - `GET /debug` and `POST /debug/clear` read and clear the debug log that
//!   clients write as a `sync-debug.json` gist file
//!
//! With a data directory, gists and the debug log survive restarts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::gist::{Gist, GistFile, GistWrite, DOCUMENT_FILE};

type Files = BTreeMap<String, GistFile>;

/// Gist file clients use for diagnostics.
pub const DEBUG_FILE: &str = "sync-debug.json";

const GISTS_FILE: &str = "gists.json";

/// On-disk form of the gists.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stored {
    next_id: u64,
    gists: BTreeMap<String, Files>,
}

fn empty_debug() -> Map<String, Value> {
    let mut debug = Map::new();
    debug.insert("logs".into(), Value::Array(Vec::new()));
    debug
}

/// Shared server state.
#[derive(Default)]
pub struct MockGists {
    gists: RwLock<BTreeMap<String, Files>>,
    debug: RwLock<Map<String, Value>>,
    next_id: AtomicU64,
    /// When set, requests must carry `Authorization: token <this>`.
    token: Option<String>,
    data_dir: Option<PathBuf>,
    /// Files longer than this are served truncated, like GitHub does past 1 MB
    truncate_above: Option<usize>,
}

impl MockGists {
    pub fn new() -> Self {
        Self {
            debug: RwLock::new(empty_debug()),
            ..Self::default()
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::new()
        }
    }

    /// Load gists and the debug log from `dir`, and save them there after
    /// every change.
    pub fn open(dir: impl Into<PathBuf>, token: Option<String>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let stored: Stored = read_json(&dir.join(GISTS_FILE))?.unwrap_or_default();
        let debug = read_json(&dir.join(DEBUG_FILE))?.unwrap_or_else(empty_debug);
        info!(
            "Loaded {} gists from {}",
            stored.gists.len(),
            dir.display()
        );

        Ok(Self {
            gists: RwLock::new(stored.gists),
            debug: RwLock::new(debug),
            next_id: AtomicU64::new(stored.next_id),
            token,
            data_dir: Some(dir),
            truncate_above: None,
        })
    }

    pub fn with_truncation(mut self, limit: usize) -> Self {
        self.truncate_above = Some(limit);
        self
    }

    /// The stored document of a gist.
    pub fn document(&self, id: &str) -> Option<String> {
        self.file(id, DOCUMENT_FILE)
    }

    pub fn gist_ids(&self) -> Vec<String> {
        self.gists
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn file(&self, id: &str, name: &str) -> Option<String> {
        self.gists
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .and_then(|files| files.get(name))
            .and_then(|file| file.content.clone())
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = &self.token else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("token {}", token))
    }

    fn gist(&self, id: &str, files: &Files, headers: &HeaderMap) -> Gist {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        let files = files
            .iter()
            .map(|(name, file)| {
                let served = match (&file.content, self.truncate_above) {
                    (Some(content), Some(limit)) if content.len() > limit => GistFile {
                        content: Some(truncate(content, limit).to_string()),
                        truncated: true,
                        raw_url: Some(format!("http://{}/raw/{}/{}", host, id, name)),
                    },
                    _ => GistFile {
                        content: file.content.clone(),
                        ..GistFile::default()
                    },
                };
                (name.clone(), served)
            })
            .collect();
        Gist {
            id: id.to_string(),
            description: None,
            files,
        }
    }

    /// Fold a written `sync-debug.json` into the debug log.
    fn record_debug(&self, files: &Files) {
        let Some(content) = files.get(DEBUG_FILE).and_then(|f| f.content.as_deref()) else {
            return;
        };
        match serde_json::from_str::<Map<String, Value>>(content) {
            Ok(entries) => self
                .debug
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .extend(entries),
            Err(e) => warn!("Ignoring malformed {}: {}", DEBUG_FILE, e),
        }
    }

    fn persist(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let stored = Stored {
            next_id: self.next_id.load(Ordering::Relaxed),
            gists: self
                .gists
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        };
        let debug = Value::Object(self.debug.read().unwrap_or_else(|e| e.into_inner()).clone());
        for (name, result) in [
            (GISTS_FILE, write_json(&dir.join(GISTS_FILE), &stored)),
            (DEBUG_FILE, write_json(&dir.join(DEBUG_FILE), &debug)),
        ] {
            if let Err(e) = result {
                warn!("Failed to save {}: {}", name, e);
            }
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &FsPath) -> std::io::Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_json<T: Serialize>(path: &FsPath, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Longest prefix of at most `limit` bytes that ends on a char boundary.
fn truncate(content: &str, limit: usize) -> &str {
    let mut end = limit.min(content.len());
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn not_found() -> Response {
    message(StatusCode::NOT_FOUND, "Not Found")
}

fn unauthorized() -> Response {
    message(StatusCode::UNAUTHORIZED, "Requires authentication")
}

/// Overlay written files; a file with no content is deleted.
fn write_files(target: &mut Files, files: Files) {
    for (name, file) in files {
        if file.content.is_some() {
            target.insert(
                name,
                GistFile {
                    content: file.content,
                    ..GistFile::default()
                },
            );
        } else {
            target.remove(&name);
        }
    }
}

async fn create_gist(
    State(state): State<Arc<MockGists>>,
    headers: HeaderMap,
    Json(body): Json<GistWrite>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let id = format!("mock-gist-{}", state.next_id.fetch_add(1, Ordering::Relaxed) + 1);
    state.record_debug(&body.files);
    let mut files = Files::new();
    write_files(&mut files, body.files);

    let gist = state.gist(&id, &files, &headers);
    state
        .gists
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id.clone(), files);
    state.persist();
    info!("Created {}", id);
    (StatusCode::CREATED, Json(gist)).into_response()
}

async fn get_gist(
    State(state): State<Arc<MockGists>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let gists = state.gists.read().unwrap_or_else(|e| e.into_inner());
    match gists.get(&id) {
        Some(files) => Json(state.gist(&id, files, &headers)).into_response(),
        None => not_found(),
    }
}

async fn update_gist(
    State(state): State<Arc<MockGists>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<GistWrite>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let gist = {
        let mut gists = state.gists.write().unwrap_or_else(|e| e.into_inner());
        let Some(files) = gists.get_mut(&id) else {
            return not_found();
        };
        state.record_debug(&body.files);
        write_files(files, body.files);
        state.gist(&id, files, &headers)
    };
    state.persist();
    debug!("Updated {}", id);
    Json(gist).into_response()
}

async fn raw_file(
    State(state): State<Arc<MockGists>>,
    headers: HeaderMap,
    Path((id, name)): Path<(String, String)>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    match state.file(&id, &name) {
        Some(content) => ([(header::CONTENT_TYPE, "text/plain")], content).into_response(),
        None => not_found(),
    }
}

async fn reset(State(state): State<Arc<MockGists>>) -> Response {
    state
        .gists
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
    *state.debug.write().unwrap_or_else(|e| e.into_inner()) = empty_debug();
    state.persist();
    info!("Reset all gists");
    Json(json!({ "success": true })).into_response()
}

async fn load(
    State(state): State<Arc<MockGists>>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    if let Err(e) = serde_json::from_str::<Value>(&body) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response();
    }
    state
        .gists
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .entry(id.clone())
        .or_default()
        .insert(
            DOCUMENT_FILE.to_string(),
            GistFile {
                content: Some(body),
                ..GistFile::default()
            },
        );
    state.persist();
    info!("Loaded document into {}", id);
    Json(json!({ "success": true })).into_response()
}

async fn data(State(state): State<Arc<MockGists>>, Path(id): Path<String>) -> Response {
    match state.document(&id) {
        Some(content) => ([(header::CONTENT_TYPE, "application/json")], content).into_response(),
        None => not_found(),
    }
}

async fn debug_log(State(state): State<Arc<MockGists>>) -> Response {
    let debug = state.debug.read().unwrap_or_else(|e| e.into_inner()).clone();
    Json(Value::Object(debug)).into_response()
}

async fn clear_debug(State(state): State<Arc<MockGists>>) -> Response {
    *state.debug.write().unwrap_or_else(|e| e.into_inner()) = empty_debug();
    state.persist();
    info!("Cleared debug log");
    Json(json!({ "success": true })).into_response()
}

pub fn router(state: Arc<MockGists>) -> Router {
    Router::new()
        .route("/gists", post(create_gist))
        .route("/gists/{id}", get(get_gist).patch(update_gist))
        .route("/raw/{id}/{file}", get(raw_file))
        .route("/reset", post(reset))
        .route("/load/{id}", post(load))
        .route("/data/{id}", get(data))
        .route("/debug", get(debug_log))
        .route("/debug/clear", post(clear_debug))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<MockGists>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gist::GistStore;
    use bookmark_sync_core::remote::{RemoteError, RemoteStore};
    use tempfile::TempDir;

    async fn start(state: Arc<MockGists>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state, std::future::pending()));
        format!("http://{}", addr)
    }

    fn creating_store(url: &str, token: &str) -> GistStore {
        GistStore::new(url, Some(token.into()), None)
            .unwrap()
            .with_gist_creation(true)
    }

    async fn patch_debug(url: &str, id: &str, content: &str) {
        let body = json!({ "files": { DEBUG_FILE: { "content": content } } });
        let response = reqwest::Client::new()
            .patch(format!("{}/gists/{}", url, id))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    // ==================== Gist API ====================

    #[tokio::test]
    async fn test_create_then_update_round_trip() {
        let state = Arc::new(MockGists::new());
        let url = start(Arc::clone(&state)).await;
        let store = creating_store(&url, "t");

        assert_eq!(store.read().await.unwrap(), None);
        store.create("{\"v\":1}").await.unwrap();
        let id = store.gist_id().unwrap();
        assert_eq!(id, "mock-gist-1");

        store.update("{\"v\":2}").await.unwrap();
        assert_eq!(store.read().await.unwrap().as_deref(), Some("{\"v\":2}"));
        assert_eq!(state.document(&id).as_deref(), Some("{\"v\":2}"));
    }

    #[tokio::test]
    async fn test_unknown_gist_reads_absent_and_create_replaces_it() {
        let state = Arc::new(MockGists::new());
        let url = start(Arc::clone(&state)).await;
        let store = GistStore::new(&url, Some("t".into()), Some("gone".into()))
            .unwrap()
            .with_gist_creation(true);

        assert_eq!(store.read().await.unwrap(), None);
        let err = store.update("{}").await.unwrap_err();
        assert!(matches!(err, RemoteError::Http { status: 404, .. }));

        store.create("{}").await.unwrap();
        assert_eq!(store.gist_id().as_deref(), Some("mock-gist-1"));
    }

    #[tokio::test]
    async fn test_vanished_gist_is_not_replaced_without_creation() {
        let state = Arc::new(MockGists::new());
        let url = start(Arc::clone(&state)).await;
        let store = GistStore::new(&url, Some("t".into()), Some("gone".into())).unwrap();

        let err = store.create("{}").await.unwrap_err();
        assert!(matches!(err, RemoteError::Http { status: 404, .. }));
        assert!(state.gist_ids().is_empty());
        assert_eq!(store.gist_id().as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn test_load_seeds_existing_gist() {
        let state = Arc::new(MockGists::new());
        let url = start(Arc::clone(&state)).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/load/seeded", url))
            .body("{\"version\":3}")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let store = GistStore::new(&url, Some("t".into()), Some("seeded".into())).unwrap();
        assert_eq!(store.read().await.unwrap().as_deref(), Some("{\"version\":3}"));

        let bad = client
            .post(format!("{}/load/seeded", url))
            .body("nope")
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_token_is_enforced() {
        let state = Arc::new(MockGists::with_token("secret"));
        let url = start(Arc::clone(&state)).await;

        let wrong = creating_store(&url, "other");
        let err = wrong.create("{}").await.unwrap_err();
        assert!(matches!(err, RemoteError::Http { status: 401, ref message } if message == "Requires authentication"));

        let right = creating_store(&url, "secret");
        right.create("{}").await.unwrap();
        assert_eq!(state.gist_ids(), vec!["mock-gist-1".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_forgets_gists() {
        let state = Arc::new(MockGists::new());
        let url = start(Arc::clone(&state)).await;
        let store = creating_store(&url, "t");
        store.create("{}").await.unwrap();

        reqwest::Client::new()
            .post(format!("{}/reset", url))
            .send()
            .await
            .unwrap();

        assert!(state.gist_ids().is_empty());
        assert_eq!(store.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_document_is_fetched_in_full() {
        let state = Arc::new(MockGists::new().with_truncation(8));
        let url = start(Arc::clone(&state)).await;
        let store = creating_store(&url, "t");

        let document = "{\"version\":3,\"bookmarks\":[]}";
        store.create(document).await.unwrap();

        let gist: Gist = reqwest::Client::new()
            .get(format!("{}/gists/{}", url, store.gist_id().unwrap()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(gist.files[DOCUMENT_FILE].truncated);

        assert_eq!(store.read().await.unwrap().as_deref(), Some(document));
    }

    // ==================== Debug log ====================

    #[tokio::test]
    async fn test_debug_log_collects_and_clears() {
        let state = Arc::new(MockGists::new());
        let url = start(Arc::clone(&state)).await;
        let store = creating_store(&url, "t");
        store.create("{}").await.unwrap();
        let id = store.gist_id().unwrap();

        patch_debug(&url, &id, r#"{"logs":["cycle started"]}"#).await;

        let client = reqwest::Client::new();
        let log: Value = client
            .get(format!("{}/debug", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(log["logs"], json!(["cycle started"]));

        client
            .post(format!("{}/debug/clear", url))
            .send()
            .await
            .unwrap();
        let log: Value = client
            .get(format!("{}/debug", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(log, json!({ "logs": [] }));
    }

    // ==================== Data directory ====================

    #[tokio::test]
    async fn test_data_dir_survives_restart() {
        let dir = TempDir::new().unwrap();

        let first = Arc::new(MockGists::open(dir.path(), None).unwrap());
        let url = start(Arc::clone(&first)).await;
        let store = creating_store(&url, "t");
        store.create("{\"v\":1}").await.unwrap();
        patch_debug(&url, "mock-gist-1", r#"{"logs":["kept"]}"#).await;

        let second = MockGists::open(dir.path(), None).unwrap();
        assert_eq!(second.document("mock-gist-1").as_deref(), Some("{\"v\":1}"));
        assert_eq!(
            second.debug.read().unwrap().get("logs"),
            Some(&json!(["kept"]))
        );

        // Ids keep counting from where the previous run stopped
        let url = start(Arc::new(second)).await;
        let store = creating_store(&url, "t");
        store.create("{}").await.unwrap();
        assert_eq!(store.gist_id().as_deref(), Some("mock-gist-2"));
    }
}
