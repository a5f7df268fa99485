//! Conversion sweep: probe downloaded media, extract audio, push assets
//! to the backend, back-fill metadata from the cycle's profile records.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rasp_core::{ProfileRecord, ReelRecord};
use rasp_store::Ledger;
use tracing::{info, warn};

use crate::api::Backend;
use crate::transcode::Transcoder;

/// Partial-download suffixes a browser leaves on in-flight files.
const IN_PROGRESS_SUFFIXES: &[&str] = &[".crdownload", ".part", ".download", ".tmp"];

pub fn normalize_media_path(raw: &str) -> PathBuf {
    for suffix in IN_PROGRESS_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return PathBuf::from(stripped);
        }
    }
    PathBuf::from(raw)
}

fn audio_output_path(input: &Path) -> PathBuf {
    input.with_extension("mp3")
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media.bin".to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConversionSummary {
    pub swept: usize,
    pub converted: usize,
    pub uploaded_videos: usize,
    pub failed: usize,
    pub changed: bool,
}

pub struct ConversionStage<'a> {
    transcoder: &'a dyn Transcoder,
    backend: &'a dyn Backend,
}

impl<'a> ConversionStage<'a> {
    pub fn new(transcoder: &'a dyn Transcoder, backend: &'a dyn Backend) -> Self {
        Self {
            transcoder,
            backend,
        }
    }

    /// One full pass over the ledger. Candidates are records that were
    /// downloaded, have a file path, and were never converted. Each
    /// candidate is independently caught so one bad file cannot stall
    /// the sweep; failures stay eligible for the next cycle.
    pub async fn sweep(
        &self,
        ledger: &Ledger,
        profiles: &[ProfileRecord],
    ) -> Result<ConversionSummary> {
        let mut records = ledger.load().await;
        let mut summary = ConversionSummary::default();

        for record in &mut records {
            if !record.downloaded || record.is_converted || record.file_path.is_none() {
                continue;
            }
            summary.swept += 1;
            let before = record.clone();

            match self.convert_record(record, profiles).await {
                Ok(extracted_audio) => {
                    summary.uploaded_videos += 1;
                    if extracted_audio {
                        record.is_converted = true;
                        summary.converted += 1;
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        link = %record.link_url,
                        error = %format!("{err:#}"),
                        "conversion failed; record stays eligible"
                    );
                }
            }

            if *record != before {
                record.last_updated = Utc::now();
                summary.changed = true;
            }
        }

        if summary.changed {
            ledger.persist(&records).await?;
        }
        info!(
            swept = summary.swept,
            converted = summary.converted,
            uploaded_videos = summary.uploaded_videos,
            failed = summary.failed,
            "conversion sweep finished"
        );
        Ok(summary)
    }

    /// Returns whether an audio stream was found and extracted. The
    /// video upload happens either way; a missing stream is not an
    /// error, it just leaves the record unconverted.
    async fn convert_record(
        &self,
        record: &mut ReelRecord,
        profiles: &[ProfileRecord],
    ) -> Result<bool> {
        backfill_from_profiles(record, profiles);

        let raw_path = record
            .file_path
            .clone()
            .context("candidate record lost its file path")?;
        let path = normalize_media_path(&raw_path);
        anyhow::ensure!(
            tokio::fs::try_exists(&path).await.unwrap_or(false),
            "media file missing: {}",
            path.display()
        );

        let has_audio = self
            .transcoder
            .has_audio_stream(&path)
            .await
            .with_context(|| format!("probing {}", path.display()))?;
        let mp3_path = if has_audio {
            let output = audio_output_path(&path);
            self.transcoder
                .extract_audio(&path, &output)
                .await
                .with_context(|| format!("extracting audio from {}", path.display()))?;
            Some(output)
        } else {
            None
        };

        let video_bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let video_url = self
            .backend
            .upload_media(&file_name_of(&path), video_bytes)
            .await
            .context("uploading video")?;
        record.server_mp4_url = Some(video_url);

        if let Some(mp3) = &mp3_path {
            let audio_bytes = tokio::fs::read(mp3)
                .await
                .with_context(|| format!("reading {}", mp3.display()))?;
            let audio_url = self
                .backend
                .upload_media(&file_name_of(mp3), audio_bytes)
                .await
                .context("uploading audio")?;
            record.server_mp3_url = Some(audio_url);
            record.mp3_file_path = Some(mp3.display().to_string());
        }

        Ok(has_audio)
    }
}

/// Join the record against the cycle's extracted links by substring
/// match on href, filling only fields still missing.
fn backfill_from_profiles(record: &mut ReelRecord, profiles: &[ProfileRecord]) {
    let missing = record.thumbnail_url.is_none()
        || record.likes.is_none()
        || record.comments.is_none()
        || record.views.is_none();
    if !missing {
        return;
    }

    let matched = profiles.iter().flat_map(|p| p.links.iter()).find(|link| {
        link.href.contains(record.link_url.as_str()) || record.link_url.contains(link.href.as_str())
    });
    let Some(link) = matched else {
        return;
    };

    if record.thumbnail_url.is_none() {
        record.thumbnail_url = link.thumbnail.clone();
    }
    if record.likes.is_none() {
        record.likes = link.likes.clone();
    }
    if record.comments.is_none() {
        record.comments = link.comments.clone();
    }
    if record.views.is_none() {
        record.views = link.views.clone();
    }
}
