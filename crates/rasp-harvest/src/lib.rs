//! Page-facing logic for RASP: the browser capability contract, the
//! profile/link extractor, the redirector download orchestrator, and the
//! camouflage cycle.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use rasp_core::ProfileRecord;
use rasp_store::{BackoffPolicy, CycleArtifacts};

pub mod browserless;
pub mod download;
pub mod extract;

pub use browserless::{BrowserlessBrowser, BrowserlessConfig};
pub use download::{BatchSummary, DownloadConfig, DownloadOrchestrator, DownloadOutcome};
pub use extract::{extract_profile, ExtractConfig};

pub const CRATE_NAME: &str = "rasp-harvest";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
}

/// One isolated browsing context. Implementations map onto whatever
/// automation driver hosts the real browser; the pipeline only needs
/// "render a page and act on its DOM".
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;
    /// Serialized HTML of the current rendered DOM.
    async fn html(&mut self) -> Result<String, BrowserError>;
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError>;
    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;
    /// Click the first element whose visible text contains `needle`
    /// (case-insensitive). Returns false when nothing matched; absence is
    /// expected, not an error.
    async fn click_by_text(&mut self, needle: &str) -> Result<bool, BrowserError>;
    async fn scroll_by(&mut self, pixels: i64) -> Result<(), BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a fresh isolated session. Every per-link attempt owns exactly
    /// one session and releases it on all exit paths.
    async fn open_session(&self) -> Result<Box<dyn PageSession>, BrowserError>;
}

/// Session acquisition is the one boundary that retries in place: a browser
/// that cannot produce a session is fatal once the backoff budget runs out.
pub async fn open_session_with_backoff(
    browser: &dyn Browser,
    backoff: &BackoffPolicy,
) -> Result<Box<dyn PageSession>, BrowserError> {
    let mut last_err: Option<BrowserError> = None;
    for attempt in 0..=backoff.max_retries {
        match browser.open_session().await {
            Ok(session) => return Ok(session),
            Err(err) => {
                if attempt < backoff.max_retries {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Browser session acquisition failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        BrowserError::SessionUnavailable("no session after retries".to_string())
    }))
}

/// Close a session, logging rather than propagating close failures so the
/// caller's own result survives.
pub async fn close_quietly(session: &mut dyn PageSession) {
    if let Err(err) = session.close().await {
        warn!(error = %err, "Failed to close browser session");
    }
}

/// Render one profile page, capture its raw markup into the cycle
/// artifacts, and run the extractor over it.
pub async fn harvest_profile(
    browser: &dyn Browser,
    backoff: &BackoffPolicy,
    username: &str,
    config: &ExtractConfig,
    artifacts: &CycleArtifacts,
) -> anyhow::Result<ProfileRecord> {
    let url = format!(
        "{}/{}/",
        config.platform_base_url.trim_end_matches('/'),
        username
    );
    let mut session = open_session_with_backoff(browser, backoff).await?;
    let result = async {
        session
            .navigate(&url)
            .await
            .context("navigating to profile page")?;
        session.html().await.context("reading profile DOM")
    }
    .await;
    close_quietly(session.as_mut()).await;
    let html = result?;

    if let Err(err) = artifacts.store_markup(username, &html).await {
        warn!(username, error = %format!("{err:#}"), "Failed to store raw profile markup");
    }

    let profile = extract_profile(username, &html, config, Utc::now());
    info!(
        username,
        links = profile.links.len(),
        stats_source = ?profile.stats.source,
        "Profile harvested"
    );
    Ok(profile)
}

#[derive(Debug, Clone)]
pub struct CamouflageConfig {
    /// Innocuous page to visit between harvesting cycles.
    pub search_url: String,
    pub scroll_px: i64,
    pub dwell: Duration,
}

impl Default for CamouflageConfig {
    fn default() -> Self {
        Self {
            search_url: "https://www.google.com/search?q=weather+today".to_string(),
            scroll_px: 900,
            dwell: Duration::from_secs(8),
        }
    }
}

/// One camouflage cycle: navigate somewhere ordinary, scroll, linger,
/// close. Keeps the session looking human between harvesting cycles.
pub async fn run_camouflage_cycle(
    browser: &dyn Browser,
    backoff: &BackoffPolicy,
    config: &CamouflageConfig,
) -> anyhow::Result<()> {
    let mut session = open_session_with_backoff(browser, backoff).await?;
    let result = async {
        session.navigate(&config.search_url).await?;
        session.scroll_by(config.scroll_px).await?;
        tokio::time::sleep(config.dwell).await;
        session.scroll_by(config.scroll_px).await?;
        Ok::<(), BrowserError>(())
    }
    .await;
    close_quietly(session.as_mut()).await;
    result?;
    info!(url = %config.search_url, "Camouflage cycle complete");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::FakeBrowser;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn session_acquisition_retries_with_backoff() {
        let browser = FakeBrowser::default();
        browser.open_failures_before_success.store(2, Ordering::SeqCst);
        let backoff = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let session = open_session_with_backoff(&browser, &backoff).await;
        assert!(session.is_ok());
        assert_eq!(browser.sessions_opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_acquisition_gives_up_after_budget() {
        let browser = FakeBrowser::default();
        browser.open_failures_before_success.store(100, Ordering::SeqCst);
        let backoff = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        assert!(open_session_with_backoff(&browser, &backoff).await.is_err());
    }

    #[tokio::test]
    async fn harvest_profile_captures_markup_and_extracts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifacts = CycleArtifacts::create(dir.path(), Utc::now());
        let page = r#"
        <html>
          <head><meta name="description" content="150 Followers, 12 Following, 34 Posts" /></head>
          <body><main><a href="/alice/reel/AAA/">338</a></main></body>
        </html>"#;
        let browser =
            FakeBrowser::default().with_page("https://www.instagram.com/alice/", page);

        let profile = harvest_profile(
            &browser,
            &BackoffPolicy::default(),
            "alice",
            &ExtractConfig::default(),
            &artifacts,
        )
        .await
        .expect("harvest");

        assert_eq!(profile.stats.followers, Some(150));
        assert_eq!(profile.links.len(), 1);
        assert_eq!(browser.sessions_closed.load(Ordering::SeqCst), 1);
        let mut saw_markup = false;
        for entry in std::fs::read_dir(artifacts.dir()).expect("artifact dir") {
            let name = entry.expect("entry").file_name();
            if name.to_string_lossy().starts_with("alice.") {
                saw_markup = true;
            }
        }
        assert!(saw_markup, "raw markup captured for diagnostics");
    }

    #[tokio::test]
    async fn camouflage_cycle_scrolls_and_closes() {
        let browser =
            FakeBrowser::default().with_page("https://search.example/?q=x", "<html></html>");
        let config = CamouflageConfig {
            search_url: "https://search.example/?q=x".to_string(),
            scroll_px: 500,
            dwell: Duration::from_millis(1),
        };
        run_camouflage_cycle(&browser, &BackoffPolicy::default(), &config)
            .await
            .expect("camouflage cycle");
        let calls = browser.calls();
        assert!(calls.contains(&"navigate:https://search.example/?q=x".to_string()));
        assert_eq!(calls.iter().filter(|c| c.starts_with("scroll:")).count(), 2);
        assert_eq!(browser.sessions_closed.load(Ordering::SeqCst), 1);
    }
}
