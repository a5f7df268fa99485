//! Per-link download orchestration: ledger short-circuit, native-page
//! metadata scrape, redirector drive, download-directory inspection.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use rasp_core::fill;
use rasp_store::{BackoffPolicy, Ledger};

use crate::{close_quietly, open_session_with_backoff, Browser, PageSession};

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// The redirector web app that turns a reel link into a file.
    pub redirector_url: String,
    pub input_selector: String,
    pub submit_selector: String,
    /// Visible label of the download action on the redirector result page.
    pub download_label: String,
    /// Fixed settle interval after submit and after invoking the download.
    pub settle: Duration,
    /// Delay between sequential per-link launches.
    pub inter_link_delay: Duration,
    /// Well-known directory the browser downloads into.
    pub download_dir: PathBuf,
    /// A file counts as "ours" when modified within this window.
    pub detect_window: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            redirector_url: "https://snapins.ai/".to_string(),
            input_selector: "input[type=text], input[type=url]".to_string(),
            submit_selector: "button[type=submit]".to_string(),
            download_label: "download".to_string(),
            settle: Duration::from_secs(6),
            inter_link_delay: Duration::from_secs(3),
            download_dir: PathBuf::from("downloads"),
            detect_window: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Ledger already holds `downloaded = true` for this exact link.
    SkippedAlreadyDownloaded,
    /// The sequence ran to completion; the file is best-effort.
    Completed { file: Option<PathBuf> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub attempted: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct DownloadOrchestrator<'a> {
    browser: &'a dyn Browser,
    ledger: &'a Ledger,
    config: DownloadConfig,
}

impl<'a> DownloadOrchestrator<'a> {
    pub fn new(browser: &'a dyn Browser, ledger: &'a Ledger, config: DownloadConfig) -> Self {
        Self {
            browser,
            ledger,
            config,
        }
    }

    /// Sequential, failure-tolerant batch: each link is independently
    /// caught so one bad reel never aborts the cycle.
    pub async fn run_batch(&self, links: &[String]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (i, link) in links.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.inter_link_delay).await;
            }
            summary.attempted += 1;
            match self.process_link(link).await {
                Ok(DownloadOutcome::SkippedAlreadyDownloaded) => summary.skipped += 1,
                Ok(DownloadOutcome::Completed { .. }) => summary.completed += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(link = %link, error = %format!("{err:#}"), "Download attempt abandoned for this cycle");
                }
            }
        }
        info!(
            attempted = summary.attempted,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Download batch finished"
        );
        summary
    }

    pub async fn process_link(&self, link: &str) -> Result<DownloadOutcome> {
        if let Some(existing) = self.ledger.find(link).await {
            if existing.downloaded {
                return Ok(DownloadOutcome::SkippedAlreadyDownloaded);
            }
        }
        self.ledger.upsert(link, |r| r.downloaded = false).await?;

        self.scrape_native_metadata(link).await?;
        let file = self.drive_redirector(link).await?;

        // Optimistic: detection is heuristic, so an undetected file does
        // not fail the attempt.
        let file_string = file.as_ref().map(|f| f.display().to_string());
        self.ledger
            .upsert(link, |r| {
                r.downloaded = true;
                fill(&mut r.file_path, file_string.clone());
            })
            .await?;

        info!(link, file = ?file, "Reel download sequence complete");
        Ok(DownloadOutcome::Completed { file })
    }

    /// Open the reel's native page and pull caption, thumbnail, and precise
    /// counts out of its embedded structured data. Runs before the
    /// redirector so metadata lands even when the download later fails.
    async fn scrape_native_metadata(&self, link: &str) -> Result<()> {
        let mut session = open_session_with_backoff(self.browser, &self.config.backoff).await?;
        let result = async {
            session
                .navigate(link)
                .await
                .context("navigating to reel page")?;
            session.html().await.context("reading reel page DOM")
        }
        .await;
        close_quietly(session.as_mut()).await;
        let html = result?;

        let Some(meta) = media_meta_from_html(&html) else {
            warn!(link, "No recognizable media object embedded in reel page");
            return Ok(());
        };

        self.ledger
            .upsert(link, |r| {
                fill(&mut r.caption, meta.caption.clone());
                fill(&mut r.thumbnail_url, meta.thumbnail_url.clone());
                fill(&mut r.likes, meta.likes.map(|n| n.to_string()));
                fill(&mut r.comments, meta.comments.map(|n| n.to_string()));
                fill(&mut r.views, meta.views.map(|n| n.to_string()));
            })
            .await?;
        Ok(())
    }

    /// Submit the link into the redirector, invoke its download action if
    /// one rendered, and look for the resulting file.
    async fn drive_redirector(&self, link: &str) -> Result<Option<PathBuf>> {
        let mut session = open_session_with_backoff(self.browser, &self.config.backoff).await?;
        let result = async {
            session
                .navigate(&self.config.redirector_url)
                .await
                .context("navigating to redirector")?;
            session
                .fill(&self.config.input_selector, link)
                .await
                .context("filling redirector input")?;
            session
                .click(&self.config.submit_selector)
                .await
                .context("submitting redirector form")?;
            tokio::time::sleep(self.config.settle).await;

            let clicked = session
                .click_by_text(&self.config.download_label)
                .await
                .context("searching for download action")?;
            if !clicked {
                warn!(link, "Redirector rendered no download action");
            }
            tokio::time::sleep(self.config.settle).await;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        close_quietly(session.as_mut()).await;
        result?;

        Ok(newest_file_within(&self.config.download_dir, self.config.detect_window).await)
    }
}

/// Most recently modified regular file in `dir`, if it changed within
/// `window`. Absence is expected (detection is heuristic), never an error.
pub async fn newest_file_within(dir: &Path, window: Duration) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, entry.path()));
        }
    }
    let (modified, path) = newest?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    (age <= window).then_some(path)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MediaMeta {
    pub caption: Option<String>,
    pub thumbnail_url: Option<String>,
    pub likes: Option<u64>,
    pub comments: Option<u64>,
    pub views: Option<u64>,
}

/// Depth-first search of every embedded JSON block for a recognizable
/// media object. The exact nesting varies by locale and rollout, so the
/// search matches shapes, not paths.
pub fn media_meta_from_html(html: &str) -> Option<MediaMeta> {
    let doc = scraper::Html::parse_document(html);
    let script_sel = scraper::Selector::parse("script").expect("static selector parses");
    for script in doc.select(&script_sel) {
        let text: String = script.text().collect();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) else {
            continue;
        };
        if let Some(media) = find_media_object(&value) {
            return Some(media_meta_from_object(media));
        }
    }
    None
}

fn is_media_object(map: &serde_json::Map<String, JsonValue>) -> bool {
    let has_views = map.contains_key("video_view_count") || map.contains_key("play_count");
    let has_likes = map.contains_key("like_count") || map.contains_key("edge_media_preview_like");
    let has_visual = map.contains_key("display_url")
        || map.contains_key("thumbnail_src")
        || map.contains_key("thumbnail_url");
    has_views && (has_likes || has_visual)
}

fn find_media_object(value: &JsonValue) -> Option<&serde_json::Map<String, JsonValue>> {
    match value {
        JsonValue::Object(map) => {
            if is_media_object(map) {
                return Some(map);
            }
            map.values().find_map(find_media_object)
        }
        JsonValue::Array(items) => items.iter().find_map(find_media_object),
        _ => None,
    }
}

fn media_meta_from_object(map: &serde_json::Map<String, JsonValue>) -> MediaMeta {
    MediaMeta {
        caption: string_at(map, "caption")
            .or_else(|| map.get("caption").and_then(|c| c.get("text")).and_then(JsonValue::as_str).map(str::to_string))
            .or_else(|| {
                map.get("edge_media_to_caption")?
                    .get("edges")?
                    .get(0)?
                    .get("node")?
                    .get("text")?
                    .as_str()
                    .map(str::to_string)
            }),
        thumbnail_url: string_at(map, "thumbnail_url")
            .or_else(|| string_at(map, "display_url"))
            .or_else(|| string_at(map, "thumbnail_src")),
        likes: number_at(map, "like_count")
            .or_else(|| nested_count(map, "edge_media_preview_like")),
        comments: number_at(map, "comment_count")
            .or_else(|| nested_count(map, "edge_media_to_comment")),
        views: number_at(map, "video_view_count").or_else(|| number_at(map, "play_count")),
    }
}

fn string_at(map: &serde_json::Map<String, JsonValue>, key: &str) -> Option<String> {
    map.get(key)?.as_str().map(str::to_string)
}

fn number_at(map: &serde_json::Map<String, JsonValue>, key: &str) -> Option<u64> {
    map.get(key)?.as_u64()
}

fn nested_count(map: &serde_json::Map<String, JsonValue>, key: &str) -> Option<u64> {
    map.get(key)?.get("count")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBrowser;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    const REEL_PAGE: &str = r#"
    <html><body>
      <script type="application/json">
      {"items":[{"media":{
        "play_count": 88100,
        "like_count": 1200,
        "comment_count": 45,
        "display_url": "https://cdn.example/thumb.jpg",
        "caption": {"text": "beach day"}
      }}]}
      </script>
    </body></html>
    "#;

    fn config_for(dir: &Path) -> DownloadConfig {
        DownloadConfig {
            settle: Duration::from_millis(1),
            inter_link_delay: Duration::from_millis(1),
            download_dir: dir.to_path_buf(),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..DownloadConfig::default()
        }
    }

    #[test]
    fn media_object_found_regardless_of_nesting() {
        let meta = media_meta_from_html(REEL_PAGE).expect("media object");
        assert_eq!(meta.caption.as_deref(), Some("beach day"));
        assert_eq!(meta.thumbnail_url.as_deref(), Some("https://cdn.example/thumb.jpg"));
        assert_eq!(meta.likes, Some(1200));
        assert_eq!(meta.comments, Some(45));
        assert_eq!(meta.views, Some(88_100));
    }

    #[test]
    fn pages_without_media_objects_yield_none() {
        let html = r#"<html><script>{"config":{"locale":"en"}}</script></html>"#;
        assert_eq!(media_meta_from_html(html), None);
    }

    #[tokio::test]
    async fn already_downloaded_link_is_never_resubmitted() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let link = "https://www.instagram.com/alice/reel/AAA/";
        ledger
            .upsert(link, |r| r.downloaded = true)
            .await
            .expect("seed");

        let browser = FakeBrowser::default();
        let orchestrator = DownloadOrchestrator::new(&browser, &ledger, config_for(dir.path()));
        let outcome = orchestrator.process_link(link).await.expect("process");

        assert_eq!(outcome, DownloadOutcome::SkippedAlreadyDownloaded);
        assert!(browser.calls().is_empty(), "no browser work for a done link");
    }

    #[tokio::test]
    async fn full_sequence_marks_downloaded_and_records_metadata() {
        let dir = tempdir().expect("tempdir");
        let downloads = dir.path().join("downloads");
        tokio::fs::create_dir_all(&downloads).await.expect("mkdir");
        tokio::fs::write(downloads.join("reel.mp4"), b"video")
            .await
            .expect("seed download");

        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let link = "https://www.instagram.com/alice/reel/AAA/";
        let browser = FakeBrowser::default()
            .with_page(link, REEL_PAGE)
            .with_page("https://snapins.ai/", "<button>Download</button>");

        let orchestrator =
            DownloadOrchestrator::new(&browser, &ledger, config_for(&downloads));
        let outcome = orchestrator.process_link(link).await.expect("process");

        match outcome {
            DownloadOutcome::Completed { file } => {
                assert_eq!(file, Some(downloads.join("reel.mp4")));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let record = ledger.find(link).await.expect("record");
        assert!(record.downloaded);
        assert_eq!(record.file_path, Some(downloads.join("reel.mp4").display().to_string()));
        assert_eq!(record.caption.as_deref(), Some("beach day"));
        assert_eq!(record.likes.as_deref(), Some("1200"));
        assert_eq!(record.views.as_deref(), Some("88100"));

        // Metadata session + redirector session, both released.
        assert_eq!(browser.sessions_closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn undetected_file_still_marks_downloaded() {
        let dir = tempdir().expect("tempdir");
        let empty_downloads = dir.path().join("downloads");
        tokio::fs::create_dir_all(&empty_downloads).await.expect("mkdir");

        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let link = "https://www.instagram.com/alice/reel/BBB/";
        let browser = FakeBrowser::default()
            .with_page(link, REEL_PAGE)
            .with_page("https://snapins.ai/", "<p>no action here</p>");

        let orchestrator =
            DownloadOrchestrator::new(&browser, &ledger, config_for(&empty_downloads));
        let outcome = orchestrator.process_link(link).await.expect("process");

        assert_eq!(outcome, DownloadOutcome::Completed { file: None });
        let record = ledger.find(link).await.expect("record");
        assert!(record.downloaded, "optimistic completion");
        assert_eq!(record.file_path, None);
    }

    #[tokio::test]
    async fn batch_tolerates_per_link_failures() {
        let dir = tempdir().expect("tempdir");
        let downloads = dir.path().join("downloads");
        tokio::fs::create_dir_all(&downloads).await.expect("mkdir");

        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let good = "https://www.instagram.com/alice/reel/AAA/".to_string();
        let browser = FakeBrowser::default()
            .with_page(&good, REEL_PAGE)
            .with_page("https://snapins.ai/", "<button>Download</button>");
        // Second link's pages are unknown to the fake: metadata comes back
        // empty but the sequence still completes (soft behavior).
        let other = "https://www.instagram.com/bob/reel/XYZ/".to_string();

        let orchestrator = DownloadOrchestrator::new(&browser, &ledger, config_for(&downloads));
        let summary = orchestrator.run_batch(&[good, other]).await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 0);
    }
}
