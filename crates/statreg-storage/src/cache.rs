//! On-disk HTTP response cache with Last-Modified freshness heuristics.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, CACHE_CONTROL, DATE, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Upper bound for heuristic freshness when the server gives no explicit lifetime.
const MAX_HEURISTIC_FRESHNESS_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub date: Option<DateTime<Utc>>,
    pub max_age_secs: Option<i64>,
    pub stored_at: DateTime<Utc>,
    pub content_hash: String,
}

impl CacheMeta {
    /// Builds cache metadata from response headers, or `None` when the response forbids storing.
    pub fn from_headers(
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let cache_control = header_str(headers, CACHE_CONTROL.as_str()).unwrap_or_default();
        let directives = cache_control
            .split(',')
            .map(|d| d.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        if directives.iter().any(|d| d == "no-store") {
            return None;
        }
        let max_age_secs = directives
            .iter()
            .find_map(|d| d.strip_prefix("max-age="))
            .and_then(|v| v.trim_matches('"').parse().ok());

        Some(Self {
            url: url.to_string(),
            etag: header_str(headers, ETAG.as_str()).map(ToString::to_string),
            last_modified: header_str(headers, LAST_MODIFIED.as_str()).and_then(parse_http_date),
            date: header_str(headers, DATE.as_str()).and_then(parse_http_date),
            max_age_secs,
            stored_at: now,
            content_hash: ResponseCache::sha256_hex(body),
        })
    }

    /// How long the entry stays fresh after its `Date` (or storage time).
    ///
    /// An explicit `max-age` wins. Otherwise a `Last-Modified` response is fresh for a
    /// tenth of its age at fetch time, capped at a day.
    pub fn freshness_lifetime(&self) -> Option<ChronoDuration> {
        if let Some(max_age) = self.max_age_secs {
            return Some(ChronoDuration::seconds(max_age.max(0)));
        }
        let last_modified = self.last_modified?;
        let date = self.date.unwrap_or(self.stored_at);
        if date < last_modified {
            return None;
        }
        let lifetime = (date - last_modified) / 10;
        Some(lifetime.min(ChronoDuration::seconds(MAX_HEURISTIC_FRESHNESS_SECS)))
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let Some(lifetime) = self.freshness_lifetime() else {
            return false;
        };
        let origin = self.date.unwrap_or(self.stored_at);
        now < origin + lifetime
    }

    pub fn if_modified_since(&self) -> Option<String> {
        self.last_modified
            .map(|lm| lm.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub meta: CacheMeta,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Cache key for a request: method, URL and any form body all take part.
    pub fn request_key(method: &str, url: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let shard = key.get(..2).unwrap_or("00");
        let dir = self.root.join(shard);
        (dir.join(format!("{key}.json")), dir.join(format!("{key}.body")))
    }

    pub async fn load(&self, key: &str) -> anyhow::Result<Option<CachedResponse>> {
        let (meta_path, body_path) = self.entry_paths(key);
        if !fs::try_exists(&meta_path)
            .await
            .with_context(|| format!("checking cache entry {}", meta_path.display()))?
        {
            return Ok(None);
        }
        let meta_bytes = fs::read(&meta_path)
            .await
            .with_context(|| format!("reading cache metadata {}", meta_path.display()))?;
        let meta: CacheMeta = serde_json::from_slice(&meta_bytes)
            .with_context(|| format!("parsing cache metadata {}", meta_path.display()))?;
        let body = match fs::read(&body_path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading cache body {}", body_path.display()))
            }
        };
        if Self::sha256_hex(&body) != meta.content_hash {
            tracing::warn!(key, "cache body does not match recorded hash; ignoring entry");
            return Ok(None);
        }
        Ok(Some(CachedResponse { meta, body }))
    }

    /// Stores body first, then metadata, each via an atomic temp-file rename.
    pub async fn store(&self, key: &str, meta: &CacheMeta, body: &[u8]) -> anyhow::Result<()> {
        let (meta_path, body_path) = self.entry_paths(key);
        write_atomic(&body_path, body).await?;
        let meta_bytes = serde_json::to_vec_pretty(meta).context("serializing cache metadata")?;
        write_atomic(&meta_path, &meta_bytes).await
    }

    /// Records a successful revalidation (`304 Not Modified`).
    pub async fn refresh(
        &self,
        key: &str,
        entry: &mut CachedResponse,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        entry.meta.stored_at = now;
        entry.meta.date = header_str(headers, DATE.as_str())
            .and_then(parse_http_date)
            .or(Some(now));
        if let Some(etag) = header_str(headers, ETAG.as_str()) {
            entry.meta.etag = Some(etag.to_string());
        }
        let (meta_path, _) = self.entry_paths(key);
        let meta_bytes =
            serde_json::to_vec_pretty(&entry.meta).context("serializing cache metadata")?;
        write_atomic(&meta_path, &meta_bytes).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("cache path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating cache directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp cache file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
