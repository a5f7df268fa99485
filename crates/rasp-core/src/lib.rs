//! Core domain model and URL/count helpers for RASP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rasp-core";

/// Alphabet Instagram uses to encode media ids into shortcodes.
const SHORTCODE_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Per-reel processing record, keyed by `link_url`.
///
/// A record only moves forward: unknown -> downloaded -> converted -> synced.
/// Upserts add or replace fields, never delete them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReelRecord {
    pub link_url: String,
    pub downloaded: bool,
    pub file_path: Option<String>,
    #[serde(rename = "mp3FilePath")]
    pub mp3_file_path: Option<String>,
    #[serde(rename = "serverMP4Url")]
    pub server_mp4_url: Option<String>,
    #[serde(rename = "serverMP3Url")]
    pub server_mp3_url: Option<String>,
    pub is_converted: bool,
    pub caption: Option<String>,
    pub thumbnail_url: Option<String>,
    pub likes: Option<String>,
    pub comments: Option<String>,
    pub views: Option<String>,
    pub repost_count: Option<u64>,
    pub reshare_count: Option<u64>,
    pub last_updated: DateTime<Utc>,
}

impl ReelRecord {
    pub fn new(link_url: impl Into<String>) -> Self {
        Self {
            link_url: link_url.into(),
            downloaded: false,
            file_path: None,
            mp3_file_path: None,
            server_mp4_url: None,
            server_mp3_url: None,
            is_converted: false,
            caption: None,
            thumbnail_url: None,
            likes: None,
            comments: None,
            views: None,
            repost_count: None,
            reshare_count: None,
            last_updated: Utc::now(),
        }
    }
}

/// Write `value` into `slot` only when the new value is present.
/// Later pipeline stages back-fill fields without erasing earlier ones.
pub fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Which extraction tier produced the profile aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsSource {
    MetaDescription,
    DomText,
    Absent,
}

/// Follower/following/post aggregates for one profile page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStats {
    pub source: StatsSource,
    pub followers_raw: Option<String>,
    pub following_raw: Option<String>,
    pub posts_raw: Option<String>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub posts: Option<u64>,
}

impl ProfileStats {
    pub fn absent() -> Self {
        Self {
            source: StatsSource::Absent,
            followers_raw: None,
            following_raw: None,
            posts_raw: None,
            followers: None,
            following: None,
            posts: None,
        }
    }

    /// True when at least one of the three aggregates resolved.
    pub fn any_present(&self) -> bool {
        self.followers.is_some() || self.following.is_some() || self.posts.is_some()
    }
}

/// One extracted reel anchor with best-effort engagement tokens,
/// kept raw; the normalizer runs at sync time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReelLink {
    pub href: String,
    pub thumbnail: Option<String>,
    pub likes: Option<String>,
    pub comments: Option<String>,
    pub views: Option<String>,
}

/// Cycle-scoped extraction output for one username. Never merged across
/// cycles; each harvesting cycle writes a fresh set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub username: String,
    pub url: String,
    pub stats: ProfileStats,
    pub profile_pic_url: Option<String>,
    pub profile_pic_path: Option<String>,
    pub links: Vec<ReelLink>,
    /// Subset of `links` hrefs actually queued for download this cycle.
    pub hrefs: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Parse a human-readable magnitude token ("338", "1,234", "12.3K", "4.5M")
/// into an integer. Returns `None` for empty or non-matching input; callers
/// decide whether absence means null or zero.
pub fn parse_count(token: &str) -> Option<u64> {
    let token: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    if token.is_empty() {
        return None;
    }

    let last = token.chars().last()?;
    let (mantissa, multiplier) = match last.to_ascii_uppercase() {
        'K' => (&token[..token.len() - 1], 1e3),
        'M' => (&token[..token.len() - 1], 1e6),
        'B' => (&token[..token.len() - 1], 1e9),
        _ => (token.as_str(), 1.0),
    };

    let mantissa = normalize_mantissa(mantissa)?;
    let value: f64 = mantissa.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

/// Strip thousands separators, or reinterpret a lone comma as a decimal
/// point, so the mantissa parses as plain f64.
fn normalize_mantissa(raw: &str) -> Option<String> {
    if raw.is_empty()
        || !raw.chars().next()?.is_ascii_digit()
        || !raw.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
    {
        return None;
    }
    if !raw.contains(',') {
        return Some(raw.to_string());
    }

    let groups: Vec<&str> = raw.split(',').collect();
    let thousands_grouped = groups[1..]
        .iter()
        .all(|g| g.len() >= 3 && g.chars().take(3).all(|c| c.is_ascii_digit()));
    if thousands_grouped && !raw.contains('.') {
        return Some(raw.replace(',', ""));
    }
    if groups.len() == 2 && !raw.contains('.') {
        return Some(raw.replace(',', "."));
    }
    // Mixed separators: commas can only be grouping.
    Some(raw.replace(',', ""))
}

fn path_segments(link: &str) -> Vec<&str> {
    let after_scheme = match link.split_once("://") {
        Some((_, rest)) => match rest.split_once('/') {
            Some((_host, path)) => path,
            None => "",
        },
        None => link.trim_start_matches('/'),
    };
    after_scheme
        .split(['/', '?', '#'])
        .filter(|s| !s.is_empty())
        .collect()
}

/// Username embedded in a reel link path (`/{username}/reel/{code}/`).
pub fn username_from_link(link: &str) -> Option<String> {
    let segments = path_segments(link);
    let idx = segments
        .iter()
        .position(|s| matches!(*s, "reel" | "reels" | "p"))?;
    if idx == 0 {
        return None;
    }
    Some(segments[idx - 1].to_string())
}

/// Shortcode segment of a reel link (`/reel/{code}/` or `/{user}/reel/{code}/`).
pub fn shortcode_from_link(link: &str) -> Option<String> {
    let segments = path_segments(link);
    let idx = segments
        .iter()
        .position(|s| matches!(*s, "reel" | "reels" | "p"))?;
    segments.get(idx + 1).map(|s| s.to_string())
}

/// Stable synthetic media id derived from the platform's shortcode
/// (base-64-url positional decode, the inverse of how the platform
/// encodes numeric ids).
pub fn media_id_from_shortcode(shortcode: &str) -> Option<u128> {
    if shortcode.is_empty() || shortcode.len() > 20 {
        return None;
    }
    let mut id: u128 = 0;
    for ch in shortcode.chars() {
        let pos = SHORTCODE_ALPHABET.find(ch)? as u128;
        id = id.checked_mul(64)?.checked_add(pos)?;
    }
    Some(id)
}
