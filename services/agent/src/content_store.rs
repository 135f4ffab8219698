//! Local content cache.
//!
//! Maps a content id to a verified file under the content directory,
//! downloading it when missing or stale. One file per id, named
//! `contenido_<id>.<ext>`. Nothing is evicted here; retention belongs to
//! whoever manages the directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ds_protocol::{ContentDescriptor, ContentKind};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::checksum::{self, Algorithm, Hasher};
use crate::events::AgentEvent;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("content {0} has no source url")]
    MissingUrl(String),
    #[error("download failed: {0}")]
    Transport(String),
    #[error("content server returned HTTP {0}")]
    Status(u16),
    #[error("content storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
}

/// A verified file in the content directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    pub id: String,
    pub path: PathBuf,
    /// Lower-case hex; SHA-256 unless the controller asked for MD5.
    pub digest: String,
    pub verified_at: DateTime<Utc>,
}

/// What a player should be pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayTarget {
    File(PathBuf),
    Url(String),
}

impl PlayTarget {
    pub fn as_arg(&self) -> String {
        match self {
            PlayTarget::File(path) => path.display().to_string(),
            PlayTarget::Url(url) => url.clone(),
        }
    }
}

pub struct ContentStore {
    dir: PathBuf,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CachedContent>>,
    events: broadcast::Sender<AgentEvent>,
}

impl ContentStore {
    /// Create the store, creating `dir` if needed.
    pub fn new(
        dir: impl Into<PathBuf>,
        download_timeout: Duration,
        events: broadcast::Sender<AgentEvent>,
    ) -> Result<Self, FetchError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let client = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            dir,
            client,
            cache: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Turn a descriptor into something a player can open.
    ///
    /// Web pages are passed through as URLs, inline HTML is staged to a file
    /// and everything else goes through [`resolve`](Self::resolve).
    pub async fn prepare(&self, content: &ContentDescriptor) -> Result<PlayTarget, FetchError> {
        match content.kind {
            ContentKind::WebPage => {
                let url = source_url(content)?;
                Ok(PlayTarget::Url(url.to_owned()))
            }
            ContentKind::InlineHtml => self.stage_inline_html(content).await.map(PlayTarget::File),
            _ => self.resolve(content).await.map(PlayTarget::File),
        }
    }

    /// Return a verified local path for `content`, downloading at most once.
    pub async fn resolve(&self, content: &ContentDescriptor) -> Result<PathBuf, FetchError> {
        let path = self.dir.join(file_name_for(content));
        let expected = content
            .checksum
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let algorithm = match expected {
            Some(digest) => {
                Algorithm::for_expected(digest).ok_or_else(|| FetchError::Integrity {
                    expected: digest.to_owned(),
                    actual: "unsupported digest format".to_owned(),
                })?
            }
            None => Algorithm::Sha256,
        };

        if let Some(hit) = self.check_cached(&content.id, &path, expected, algorithm).await? {
            debug!(content_id = %content.id, path = %hit.display(), "cache hit");
            return Ok(hit);
        }

        let url = source_url(content)?;
        info!(content_id = %content.id, url, "downloading content");

        let part = PartFile::new(path.with_extension(part_extension(&path)));
        let (size, actual) = self.download(url, part.path(), algorithm).await?;

        if let Some(expected) = expected {
            if !checksum::matches(expected, &actual) {
                warn!(content_id = %content.id, expected, actual, "downloaded content failed verification");
                return Err(FetchError::Integrity {
                    expected: expected.to_owned(),
                    actual,
                });
            }
        }

        tokio::fs::rename(part.path(), &path).await?;
        part.disarm();

        self.record(&content.id, &path, actual);
        info!(content_id = %content.id, size, "download complete");
        let _ = self.events.send(AgentEvent::DownloadComplete {
            content_id: content.id.clone(),
            size,
        });
        Ok(path)
    }

    /// Ids of every cached item, sorted.
    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cache
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn cached(&self, id: &str) -> Option<CachedContent> {
        self.cache.lock().ok()?.get(id).cloned()
    }

    // -- internal --

    /// Verify an indexed or already-present file. Stale files are deleted.
    async fn check_cached(
        &self,
        id: &str,
        path: &Path,
        expected: Option<&str>,
        algorithm: Algorithm,
    ) -> Result<Option<PathBuf>, FetchError> {
        let indexed = self.cached(id);
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            if indexed.is_some() {
                debug!(content_id = id, "cached file vanished from disk");
                self.forget(id);
            }
            return Ok(None);
        }

        // Indexed and nothing to check against: trust the earlier verification.
        if let (Some(entry), None) = (&indexed, expected) {
            if entry.path == path {
                return Ok(Some(path.to_path_buf()));
            }
        }

        let owned = path.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || checksum::digest_file(&owned, algorithm))
            .await
            .map_err(std::io::Error::other)??;

        match expected {
            Some(expected) if !checksum::matches(expected, &actual) => {
                warn!(content_id = id, expected, actual, "cached content is stale, re-downloading");
                self.forget(id);
                tokio::fs::remove_file(path).await?;
                Ok(None)
            }
            _ => {
                if indexed.is_none() {
                    debug!(content_id = id, "adopted existing file");
                }
                self.record(id, path, actual);
                Ok(Some(path.to_path_buf()))
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        part: &Path,
        algorithm: Algorithm,
    ) -> Result<(u64, String), FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut hasher = Hasher::new(algorithm);
        let mut size: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?
        {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size, hasher.finish()))
    }

    async fn stage_inline_html(&self, content: &ContentDescriptor) -> Result<PathBuf, FetchError> {
        let html = content
            .inline_html
            .as_deref()
            .or(content.url.as_deref())
            .ok_or_else(|| FetchError::MissingUrl(content.id.clone()))?;
        let path = self
            .dir
            .join(format!("inline_{}.html", sanitize_id(&content.id)));
        tokio::fs::write(&path, html).await?;
        debug!(content_id = %content.id, path = %path.display(), "staged inline html");
        Ok(path)
    }

    fn record(&self, id: &str, path: &Path, digest: String) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                id.to_owned(),
                CachedContent {
                    id: id.to_owned(),
                    path: path.to_path_buf(),
                    digest: digest.to_ascii_lowercase(),
                    verified_at: Utc::now(),
                },
            );
        }
    }

    fn forget(&self, id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(id);
        }
    }
}

fn source_url(content: &ContentDescriptor) -> Result<&str, FetchError> {
    content
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| FetchError::MissingUrl(content.id.clone()))
}

fn part_extension(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_owned(),
    }
}

/// Removes a partially written download unless disarmed, including when the
/// owning future is dropped mid-transfer.
struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

/// Deterministic local file name for a descriptor.
pub fn file_name_for(content: &ContentDescriptor) -> String {
    format!(
        "contenido_{}.{}",
        sanitize_id(&content.id),
        extension_for(content)
    )
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_for(content: &ContentDescriptor) -> String {
    content
        .url
        .as_deref()
        .and_then(url_extension)
        .unwrap_or_else(|| default_extension(&content.kind).to_owned())
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn default_extension(kind: &ContentKind) -> &'static str {
    match kind {
        ContentKind::Image => "jpg",
        ContentKind::Video => "mp4",
        ContentKind::WebPage | ContentKind::InlineHtml => "html",
        ContentKind::Unknown(_) => "bin",
    }
}
