// content_server: A mock content origin serving files over HTTP.
//
// Files are registered in memory and served from /files/{name}. Per-file hit
// counters let tests assert that cached content is not fetched twice, and a
// per-file delay lets them hold a download open long enough to preempt it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;

#[derive(Clone)]
struct Entry {
    body: Vec<u8>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct Files {
    entries: Mutex<HashMap<String, Entry>>,
    hits: Mutex<HashMap<String, usize>>,
}

pub struct ContentServer {
    addr: SocketAddr,
    files: Arc<Files>,
    _task: tokio::task::JoinHandle<()>,
}

impl ContentServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let files = Arc::new(Files::default());

        let router = Router::new()
            .route("/files/{name}", get(serve_file))
            .with_state(files.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self {
            addr,
            files,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn put(&self, name: &str, body: impl Into<Vec<u8>>) {
        self.insert(name, body.into(), None);
    }

    /// Register a file whose response is held back for `delay`.
    pub fn put_slow(&self, name: &str, body: impl Into<Vec<u8>>, delay: Duration) {
        self.insert(name, body.into(), Some(delay));
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{name}", self.addr)
    }

    /// Requests seen for `name`, including ones for unregistered files.
    pub fn hits(&self, name: &str) -> usize {
        self.files
            .hits
            .lock()
            .ok()
            .and_then(|h| h.get(name).copied())
            .unwrap_or(0)
    }

    fn insert(&self, name: &str, body: Vec<u8>, delay: Option<Duration>) {
        if let Ok(mut entries) = self.files.entries.lock() {
            entries.insert(name.to_owned(), Entry { body, delay });
        }
    }
}

async fn serve_file(State(files): State<Arc<Files>>, Path(name): Path<String>) -> Response {
    if let Ok(mut hits) = files.hits.lock() {
        *hits.entry(name.clone()).or_default() += 1;
    }
    let entry = files
        .entries
        .lock()
        .ok()
        .and_then(|e| e.get(&name).cloned());
    let Some(entry) = entry else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(delay) = entry.delay {
        tokio::time::sleep(delay).await;
    }
    (StatusCode::OK, entry.body).into_response()
}
