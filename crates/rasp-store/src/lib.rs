//! Durable state for RASP: the reel ledger, per-cycle artifact capture,
//! and HTTP fetch utilities with retry classification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rasp_core::{ProfileRecord, ReelRecord};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rasp-store";

/// Durable mapping from reel link to processing record, persisted as one
/// pretty-printed JSON array. Every mutation is a full read-modify-write;
/// a crash between calls always leaves the previously committed state.
///
/// Single-writer only: concurrent processes would race the backing file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full collection. A missing file is an empty ledger; a
    /// malformed file is quarantined next to the original and treated as
    /// empty, so load never fails.
    pub async fn load(&self) -> Vec<ReelRecord> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&text) {
            Ok(records) => records,
            Err(err) => {
                let quarantine = self.quarantine_path();
                warn!(
                    path = %self.path.display(),
                    quarantine = %quarantine.display(),
                    error = %err,
                    "Ledger file is malformed; quarantining and starting empty"
                );
                if let Err(rename_err) = fs::rename(&self.path, &quarantine).await {
                    warn!(error = %rename_err, "Failed to quarantine malformed ledger");
                }
                Vec::new()
            }
        }
    }

    /// Find-or-create the record for `link_url`, apply `mutate`, stamp
    /// `last_updated`, and persist the whole collection before returning.
    pub async fn upsert<F>(&self, link_url: &str, mutate: F) -> anyhow::Result<ReelRecord>
    where
        F: FnOnce(&mut ReelRecord),
    {
        let mut records = self.load().await;
        let idx = match records.iter().position(|r| r.link_url == link_url) {
            Some(idx) => idx,
            None => {
                records.push(ReelRecord::new(link_url));
                records.len() - 1
            }
        };
        mutate(&mut records[idx]);
        records[idx].last_updated = Utc::now();
        let record = records[idx].clone();
        self.persist(&records).await?;
        Ok(record)
    }

    pub async fn find(&self, link_url: &str) -> Option<ReelRecord> {
        self.load()
            .await
            .into_iter()
            .find(|r| r.link_url == link_url)
    }

    /// Persist a full collection wholesale. Used by sweep stages that
    /// mutate many records before committing once.
    pub async fn persist(&self, records: &[ReelRecord]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(records).context("serializing ledger")?;
        write_atomic(&self.path, &bytes).await
    }

    fn quarantine_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ledger.json".to_string());
        self.path.with_file_name(format!("{name}.corrupt-{stamp}"))
    }
}

/// Write bytes via a temp file plus atomic rename so readers never observe
/// a partially written file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
                .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))
        }
    }
}

/// Per-cycle diagnostic artifacts: raw captured markup, per-username
/// profile JSON, and a combined-profiles JSON, all under one directory
/// named after the cycle start time.
#[derive(Debug, Clone)]
pub struct CycleArtifacts {
    dir: PathBuf,
}

impl CycleArtifacts {
    pub fn create(root: impl AsRef<Path>, started_at: DateTime<Utc>) -> Self {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        Self {
            dir: root.as_ref().join(stamp),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Capture raw page markup, hash-named so identical captures dedup.
    pub async fn store_markup(&self, label: &str, html: &str) -> anyhow::Result<PathBuf> {
        let hash = Self::sha256_hex(html.as_bytes());
        let path = self.dir.join(format!("{label}.{}.html", &hash[..16]));
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        write_atomic(&path, html.as_bytes()).await?;
        Ok(path)
    }

    pub async fn store_profile(&self, profile: &ProfileRecord) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(format!("{}.profile.json", profile.username));
        let bytes = serde_json::to_vec_pretty(profile)
            .with_context(|| format!("serializing profile {}", profile.username))?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    pub async fn store_combined(&self, profiles: &[ProfileRecord]) -> anyhow::Result<PathBuf> {
        let path = self.dir.join("profiles.json");
        let bytes = serde_json::to_vec_pretty(profiles).context("serializing combined profiles")?;
        write_atomic(&path, &bytes).await?;
        info!(path = %path.display(), profiles = profiles.len(), "Cycle artifacts written");
        Ok(path)
    }

    /// Read back a combined-profiles artifact for replay or back-fill.
    pub async fn load_combined(dir: impl AsRef<Path>) -> Vec<ProfileRecord> {
        let path = dir.as_ref().join("profiles.json");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        };
        serde_json::from_str(&text).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff. Shared by the HTTP fetcher and the browser
/// session acquisition boundary.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin GET client with retry-on-transient-failure. Used to refetch remote
/// profile pictures before re-uploading them to the backend.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, backoff })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasp_core::fill;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_ledger_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        assert!(ledger.load().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_twice_is_idempotent_apart_from_timestamp() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let link = "https://www.instagram.com/alice/reel/ABC/";

        let first = ledger
            .upsert(link, |r| r.caption = Some("hello".into()))
            .await
            .expect("first upsert");
        let second = ledger.upsert(link, |_| {}).await.expect("second upsert");

        let records = ledger.load().await;
        assert_eq!(records.len(), 1);
        assert_eq!(first.link_url, second.link_url);
        assert_eq!(second.caption.as_deref(), Some("hello"));
        assert!(second.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn upserts_accumulate_without_erasing_fields() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let link = "https://www.instagram.com/alice/reel/ABC/";

        ledger
            .upsert(link, |r| {
                r.downloaded = true;
                r.file_path = Some("/downloads/abc.mp4".into());
            })
            .await
            .expect("upsert");
        let record = ledger
            .upsert(link, |r| fill(&mut r.thumbnail_url, Some("https://cdn/th.jpg".into())))
            .await
            .expect("upsert");

        assert!(record.downloaded);
        assert_eq!(record.file_path.as_deref(), Some("/downloads/abc.mp4"));
        assert_eq!(record.thumbnail_url.as_deref(), Some("https://cdn/th.jpg"));
    }

    #[tokio::test]
    async fn malformed_ledger_is_quarantined_and_treated_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        fs::write(&path, b"{not json").await.expect("seed garbage");

        let ledger = Ledger::new(&path);
        assert!(ledger.load().await.is_empty());

        let mut quarantined = 0;
        let mut entries = fs::read_dir(dir.path()).await.expect("read_dir");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            if entry
                .file_name()
                .to_string_lossy()
                .contains(".corrupt-")
            {
                quarantined += 1;
            }
        }
        assert_eq!(quarantined, 1, "bad file preserved for recovery");
    }

    #[tokio::test]
    async fn cycle_artifacts_round_trip() {
        let dir = tempdir().expect("tempdir");
        let artifacts = CycleArtifacts::create(dir.path(), Utc::now());

        let profile = ProfileRecord {
            username: "alice".into(),
            url: "https://www.instagram.com/alice/".into(),
            stats: rasp_core::ProfileStats::absent(),
            profile_pic_url: None,
            profile_pic_path: None,
            links: vec![],
            hrefs: vec![],
            fetched_at: Utc::now(),
        };
        artifacts.store_markup("alice", "<html></html>").await.expect("markup");
        artifacts.store_profile(&profile).await.expect("profile");
        artifacts
            .store_combined(std::slice::from_ref(&profile))
            .await
            .expect("combined");

        let loaded = CycleArtifacts::load_combined(artifacts.dir()).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].username, "alice");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }
}
