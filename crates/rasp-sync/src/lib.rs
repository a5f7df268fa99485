//! Harvesting-cycle pipeline: backend targets -> profile extraction ->
//! downloads -> conversion -> sync, plus the tick scheduler driving it.

pub mod api;
pub mod convert;
pub mod scheduler;
pub mod transcode;
pub mod uploader;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rasp_core::ProfileRecord;
use rasp_harvest::{
    harvest_profile, run_camouflage_cycle, Browser, BrowserError, CamouflageConfig,
    DownloadConfig, DownloadOrchestrator, ExtractConfig,
};
use rasp_store::{BackoffPolicy, CycleArtifacts, HttpFetcher, Ledger};
use serde::Deserialize;
use tracing::{info, warn};

pub use api::{ApiClient, ApiConfig, Backend, ContentPayload, ProfilePayload, ReelPayload};
pub use convert::{ConversionStage, ConversionSummary};
pub use scheduler::{
    plan_tick, run_scheduler, seeded_state, SchedulerState, TickAction, TickThresholds,
};
pub use transcode::{FfmpegTranscoder, Transcoder};
pub use uploader::{SyncUploader, SyncSummary};

pub const CRATE_NAME: &str = "rasp-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_base_url: String,
    pub api_token: String,
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub ledger_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub targets_file: PathBuf,
    pub transcoder_bin: PathBuf,
    pub transcode_timeout_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub tick_cron: String,
    pub thresholds: TickThresholds,
    pub extract: ExtractConfig,
    pub download: DownloadConfig,
    pub camouflage: CamouflageConfig,
    pub backoff: BackoffPolicy,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut download = DownloadConfig::default();
        if let Ok(url) = std::env::var("RASP_REDIRECTOR_URL") {
            download.redirector_url = url;
        }
        if let Ok(dir) = std::env::var("RASP_DOWNLOAD_DIR") {
            download.download_dir = PathBuf::from(dir);
        }
        let mut extract = ExtractConfig::default();
        if let Ok(max) = std::env::var("RASP_MAX_LINKS") {
            if let Ok(max) = max.parse() {
                extract.max_links = max;
            }
        }

        Self {
            api_base_url: std::env::var("RASP_API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/api".to_string()),
            api_token: std::env::var("RASP_API_TOKEN").unwrap_or_default(),
            browserless_url: std::env::var("RASP_BROWSERLESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            browserless_token: std::env::var("RASP_BROWSERLESS_TOKEN").ok(),
            ledger_path: env_path("RASP_LEDGER_PATH", "./data/reels.json"),
            artifacts_dir: env_path("RASP_ARTIFACTS_DIR", "./artifacts"),
            targets_file: env_path("RASP_TARGETS_FILE", "./targets.yaml"),
            transcoder_bin: env_path("RASP_FFMPEG_BIN", "ffmpeg"),
            transcode_timeout_secs: env_u64("RASP_TRANSCODE_TIMEOUT_SECS", 300),
            user_agent: std::env::var("RASP_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/124.0 Safari/537.36"
                    .to_string()
            }),
            http_timeout_secs: env_u64("RASP_HTTP_TIMEOUT_SECS", 20),
            tick_cron: std::env::var("RASP_TICK_CRON")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),
            thresholds: TickThresholds {
                harvest: env_u64("RASP_HARVEST_TICKS", 30) as u32,
                camouflage: env_u64("RASP_CAMOUFLAGE_TICKS", 7) as u32,
            },
            extract,
            download,
            camouflage: CamouflageConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// True when the error chain bottoms out in an exhausted session
/// acquisition. A browser service that cannot hand out sessions at all
/// will not recover by moving on to the next username, so callers treat
/// this as fatal rather than a per-item failure.
pub fn is_browser_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<BrowserError>(),
            Some(BrowserError::SessionUnavailable(_))
        )
    })
}

/// Static fallback list of usernames, used when the backend cannot
/// supply one.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetRegistry {
    #[serde(default)]
    pub targets: Vec<String>,
}

impl TargetRegistry {
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub usernames: usize,
    pub profiles_harvested: usize,
    pub links_queued: usize,
    pub downloads_completed: usize,
    pub downloads_skipped: usize,
    pub downloads_failed: usize,
    pub conversion: ConversionSummary,
    pub profile_puts: usize,
    pub content_puts: usize,
}

pub struct HarvestPipeline {
    config: PipelineConfig,
    browser: Box<dyn Browser>,
    transcoder: Box<dyn Transcoder>,
    backend: Box<dyn Backend>,
    fetcher: HttpFetcher,
    ledger: Ledger,
}

impl HarvestPipeline {
    pub fn new(config: PipelineConfig, browser: Box<dyn Browser>) -> Result<Self> {
        let backend = ApiClient::new(&ApiConfig {
            base_url: config.api_base_url.clone(),
            token: config.api_token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })
        .context("building backend client")?;
        let transcoder = FfmpegTranscoder::new(
            config.transcoder_bin.clone(),
            Duration::from_secs(config.transcode_timeout_secs),
        );
        let fetcher = HttpFetcher::new(
            Duration::from_secs(config.http_timeout_secs),
            &config.user_agent,
            config.backoff,
        )?;
        let ledger = Ledger::new(config.ledger_path.clone());
        Ok(Self {
            config,
            browser,
            transcoder: Box::new(transcoder),
            backend: Box::new(backend),
            fetcher,
            ledger,
        })
    }

    pub fn with_stages(
        mut self,
        transcoder: Box<dyn Transcoder>,
        backend: Box<dyn Backend>,
    ) -> Self {
        self.transcoder = transcoder;
        self.backend = backend;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// One full harvesting cycle over the current target usernames.
    /// Per-username and per-link failures are caught and logged; only
    /// infrastructure failures (an unavailable browser service, artifact
    /// directory, ledger persist) abort the cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let usernames = self.target_usernames().await;
        let artifacts = CycleArtifacts::create(&self.config.artifacts_dir, started_at);

        let mut profiles: Vec<ProfileRecord> = Vec::new();
        let mut downloads_completed = 0;
        let mut downloads_skipped = 0;
        let mut downloads_failed = 0;
        let mut links_queued = 0;

        for username in &usernames {
            let mut profile = match harvest_profile(
                self.browser.as_ref(),
                &self.config.backoff,
                username,
                &self.config.extract,
                &artifacts,
            )
            .await
            {
                Ok(profile) => profile,
                Err(err) if is_browser_unavailable(&err) => {
                    return Err(err.context("browser service unavailable, aborting cycle"));
                }
                Err(err) => {
                    warn!(
                        username = %username,
                        error = %format!("{err:#}"),
                        "profile harvest failed, skipping user this cycle"
                    );
                    continue;
                }
            };

            self.fetch_profile_picture(&mut profile, &artifacts).await;
            profile.hrefs = profile.links.iter().map(|l| l.href.clone()).collect();
            links_queued += profile.hrefs.len();
            if let Err(err) = artifacts.store_profile(&profile).await {
                warn!(username = %username, error = %format!("{err:#}"), "failed to store profile artifact");
            }

            let orchestrator = DownloadOrchestrator::new(
                self.browser.as_ref(),
                &self.ledger,
                self.config.download.clone(),
            );
            let batch = orchestrator.run_batch(&profile.hrefs).await;
            downloads_completed += batch.completed;
            downloads_skipped += batch.skipped;
            downloads_failed += batch.failed;

            profiles.push(profile);
        }

        artifacts
            .store_combined(&profiles)
            .await
            .context("storing combined profiles artifact")?;

        let conversion = ConversionStage::new(self.transcoder.as_ref(), self.backend.as_ref())
            .sweep(&self.ledger, &profiles)
            .await
            .context("conversion sweep")?;

        let (mut profile_puts, mut content_puts) = (0, 0);
        if conversion.changed {
            let uploader = SyncUploader::new(self.backend.as_ref(), &self.fetcher);
            profile_puts = uploader.sync_profiles(&profiles).await;
            content_puts = uploader.sync_content(&self.ledger.load().await).await;
        }

        let summary = CycleSummary {
            cycle_id: uuid::Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            usernames: usernames.len(),
            profiles_harvested: profiles.len(),
            links_queued,
            downloads_completed,
            downloads_skipped,
            downloads_failed,
            conversion,
            profile_puts,
            content_puts,
        };
        info!(
            cycle_id = %summary.cycle_id,
            usernames = summary.usernames,
            profiles = summary.profiles_harvested,
            links = summary.links_queued,
            completed = summary.downloads_completed,
            skipped = summary.downloads_skipped,
            failed = summary.downloads_failed,
            profile_puts = summary.profile_puts,
            content_puts = summary.content_puts,
            "harvesting cycle finished"
        );
        Ok(summary)
    }

    pub async fn run_camouflage(&self) -> Result<()> {
        run_camouflage_cycle(
            self.browser.as_ref(),
            &self.config.backoff,
            &self.config.camouflage,
        )
        .await
    }

    /// Backend list first; the YAML registry is the offline fallback.
    async fn target_usernames(&self) -> Vec<String> {
        match self.backend.fetch_username_list().await {
            Ok(list) if !list.is_empty() => return list,
            Ok(_) => warn!("backend returned an empty username list"),
            Err(err) => warn!(error = %err, "failed to fetch username list from backend"),
        }
        match TargetRegistry::load(&self.config.targets_file).await {
            Ok(registry) => registry.targets,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "no target registry available");
                Vec::new()
            }
        }
    }

    async fn fetch_profile_picture(&self, profile: &mut ProfileRecord, artifacts: &CycleArtifacts) {
        let Some(url) = profile.profile_pic_url.clone() else {
            return;
        };
        match self.fetcher.fetch_bytes(&url).await {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::create_dir_all(artifacts.dir()).await {
                    warn!(error = %err, "failed to create cycle artifact directory");
                    return;
                }
                let path = artifacts.dir().join(format!("{}.jpg", profile.username));
                match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => profile.profile_pic_path = Some(path.display().to_string()),
                    Err(err) => warn!(
                        username = %profile.username,
                        error = %err,
                        "failed to store profile picture"
                    ),
                }
            }
            Err(err) => warn!(
                username = %profile.username,
                error = %err,
                "failed to fetch profile picture"
            ),
        }
    }
}
