//! Idempotent profile/content upserts against the backend.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rasp_core::{
    media_id_from_shortcode, parse_count, shortcode_from_link, username_from_link, ProfileRecord,
    ReelRecord,
};
use rasp_store::HttpFetcher;
use tracing::{debug, info, warn};

use crate::api::{Backend, ContentPayload, ProfilePayload, ReelPayload};

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncSummary {
    pub profile_puts: usize,
    pub content_puts: usize,
}

pub struct SyncUploader<'a> {
    backend: &'a dyn Backend,
    fetcher: &'a HttpFetcher,
}

impl<'a> SyncUploader<'a> {
    pub fn new(backend: &'a dyn Backend, fetcher: &'a HttpFetcher) -> Self {
        Self { backend, fetcher }
    }

    /// One PUT per profile with a derivable picture. Failures are logged
    /// per profile and never abort the batch.
    pub async fn sync_profiles(&self, profiles: &[ProfileRecord]) -> usize {
        let mut puts = 0;
        for profile in profiles {
            match self.sync_profile(profile).await {
                Ok(true) => puts += 1,
                Ok(false) => {
                    debug!(username = %profile.username, "no picture source, profile skipped")
                }
                Err(err) => warn!(
                    username = %profile.username,
                    error = %format!("{err:#}"),
                    "profile sync failed"
                ),
            }
        }
        puts
    }

    async fn sync_profile(&self, profile: &ProfileRecord) -> Result<bool> {
        let Some(picture) = self.picture_bytes(profile).await? else {
            return Ok(false);
        };
        let picture_url = self
            .backend
            .upload_media(&format!("{}.jpg", profile.username), picture)
            .await
            .context("uploading profile picture")?;

        let payload = ProfilePayload {
            instagram_user_id: profile.username.clone(),
            full_name: profile.username.clone(),
            is_verified: false,
            biography: String::new(),
            profile_pic_url: Some(picture_url),
            follower_count: profile.stats.followers.unwrap_or(0),
            following_count: profile.stats.following.unwrap_or(0),
            media_count: profile.stats.posts.unwrap_or(0),
        };
        self.backend
            .put_profile(&profile.username, &payload)
            .await
            .context("upserting profile")?;
        Ok(true)
    }

    /// Local file first; the remote picture URL is re-fetched only when
    /// no downloaded copy exists.
    async fn picture_bytes(&self, profile: &ProfileRecord) -> Result<Option<Vec<u8>>> {
        if let Some(path) = &profile.profile_pic_path {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {path}"))?;
            return Ok(Some(bytes));
        }
        if let Some(url) = &profile.profile_pic_url {
            let bytes = self
                .fetcher
                .fetch_bytes(url)
                .await
                .with_context(|| format!("fetching {url}"))?;
            return Ok(Some(bytes));
        }
        Ok(None)
    }

    /// Group uploaded records by owning username, one PUT per group.
    pub async fn sync_content(&self, records: &[ReelRecord]) -> usize {
        let mut puts = 0;
        for (username, reels) in group_reels(records) {
            let count = reels.len();
            match self
                .backend
                .put_content(&username, &ContentPayload { reels })
                .await
            {
                Ok(()) => {
                    puts += 1;
                    info!(username = %username, reels = count, "content synced");
                }
                Err(err) => warn!(
                    username = %username,
                    error = %err,
                    "content sync failed"
                ),
            }
        }
        puts
    }
}

/// Only records with an uploaded media URL participate; records whose
/// link carries no username are excluded rather than misfiled.
pub fn group_reels(records: &[ReelRecord]) -> BTreeMap<String, Vec<ReelPayload>> {
    let mut groups: BTreeMap<String, Vec<ReelPayload>> = BTreeMap::new();
    for record in records {
        if record.server_mp4_url.is_none() {
            continue;
        }
        let Some(username) = username_from_link(&record.link_url) else {
            warn!(link = %record.link_url, "no username in link, excluded from content sync");
            continue;
        };
        let Some(payload) = reel_payload(record) else {
            continue;
        };
        groups.entry(username).or_default().push(payload);
    }
    groups
}

fn reel_payload(record: &ReelRecord) -> Option<ReelPayload> {
    let code = shortcode_from_link(&record.link_url)?;
    let video_url = record.server_mp4_url.clone()?;
    let instagram_media_id = media_id_from_shortcode(&code)
        .map(|id| id.to_string())
        .unwrap_or_else(|| code.clone());
    Some(ReelPayload {
        instagram_media_id,
        code,
        media_type: 2,
        like_count: count_or_zero(record.likes.as_deref()),
        play_count: count_or_zero(record.views.as_deref()),
        comment_count: count_or_zero(record.comments.as_deref()),
        caption_text: record.caption.clone().unwrap_or_default(),
        video_url,
        thumbnail_url: record.thumbnail_url.clone().unwrap_or_default(),
        audio_url: record.server_mp3_url.clone(),
        video_duration: 0.0,
        has_audio: record.server_mp3_url.is_some(),
        repost_count: record.repost_count.unwrap_or(0),
        reshare_count: record.reshare_count.unwrap_or(0),
    })
}

fn count_or_zero(token: Option<&str>) -> u64 {
    token.and_then(parse_count).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingBackend;
    use rasp_core::ProfileStats;
    use rasp_store::BackoffPolicy;
    use std::time::Duration;

    fn uploaded_record(link: &str) -> ReelRecord {
        let mut record = ReelRecord::new(link);
        record.downloaded = true;
        record.server_mp4_url = Some("https://cdn.example/clip.mp4".into());
        record
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(
            Duration::from_secs(5),
            "rasp-test/0.1",
            BackoffPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn content_groups_are_split_by_username() {
        let records = vec![
            uploaded_record("https://example.com/alice/reel/ABC/"),
            uploaded_record("https://example.com/bob/reel/XYZ/"),
            uploaded_record("https://example.com/alice/reel/DEF/"),
        ];
        let groups = group_reels(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["alice"].len(), 2);
        assert_eq!(groups["bob"].len(), 1);
        assert_eq!(groups["bob"][0].code, "XYZ");
    }

    #[test]
    fn records_without_an_uploaded_url_are_excluded() {
        let mut pending = ReelRecord::new("https://example.com/alice/reel/ABC/");
        pending.downloaded = true;
        let groups = group_reels(&[pending]);
        assert!(groups.is_empty());
    }

    #[test]
    fn payload_counts_coerce_absent_to_zero() {
        let mut record = uploaded_record("https://example.com/alice/reel/ABC/");
        record.likes = Some("12.3K".into());
        let payload = reel_payload(&record).unwrap();
        assert_eq!(payload.like_count, 12_300);
        assert_eq!(payload.comment_count, 0);
        assert_eq!(payload.play_count, 0);
        assert!(!payload.has_audio);
        assert_eq!(payload.instagram_media_id, media_id_from_shortcode("ABC").unwrap().to_string());
    }

    #[tokio::test]
    async fn content_sync_issues_one_put_per_username() {
        let records = vec![
            uploaded_record("https://example.com/alice/reel/ABC/"),
            uploaded_record("https://example.com/bob/reel/XYZ/"),
        ];
        let backend = RecordingBackend::default();
        let fetcher = fetcher();
        let uploader = SyncUploader::new(&backend, &fetcher);
        let puts = uploader.sync_content(&records).await;

        assert_eq!(puts, 2);
        let by_user = backend.content_puts();
        assert_eq!(by_user.len(), 2);
        assert_eq!(by_user[0].0, "alice");
        assert_eq!(by_user[0].1.reels.len(), 1);
        assert_eq!(by_user[1].0, "bob");
        assert_eq!(by_user[1].1.reels[0].code, "XYZ");
    }

    #[tokio::test]
    async fn profile_sync_uses_local_picture_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let pic = dir.path().join("alice.jpg");
        std::fs::write(&pic, b"jpg").unwrap();

        let profile = ProfileRecord {
            username: "alice".into(),
            url: "https://example.com/alice/".into(),
            stats: ProfileStats {
                followers: Some(150),
                ..ProfileStats::absent()
            },
            profile_pic_url: Some("https://example.com/alice.jpg".into()),
            profile_pic_path: Some(pic.display().to_string()),
            links: vec![],
            hrefs: vec![],
            fetched_at: chrono::Utc::now(),
        };

        let backend = RecordingBackend::default();
        let fetcher = fetcher();
        let uploader = SyncUploader::new(&backend, &fetcher);
        let puts = uploader.sync_profiles(&[profile]).await;

        assert_eq!(puts, 1);
        let recorded = backend.profile_puts();
        assert_eq!(recorded.len(), 1);
        let (username, payload) = &recorded[0];
        assert_eq!(username, "alice");
        assert_eq!(payload.follower_count, 150);
        assert_eq!(payload.following_count, 0);
        assert_eq!(payload.biography, "");
        assert!(payload.profile_pic_url.as_deref().unwrap().contains("alice.jpg"));
    }

    #[tokio::test]
    async fn profile_without_any_picture_source_is_skipped() {
        let profile = ProfileRecord {
            username: "ghost".into(),
            url: "https://example.com/ghost/".into(),
            stats: ProfileStats::absent(),
            profile_pic_url: None,
            profile_pic_path: None,
            links: vec![],
            hrefs: vec![],
            fetched_at: chrono::Utc::now(),
        };
        let backend = RecordingBackend::default();
        let fetcher = fetcher();
        let uploader = SyncUploader::new(&backend, &fetcher);
        assert_eq!(uploader.sync_profiles(&[profile]).await, 0);
        assert!(backend.profile_puts().is_empty());
    }
}
