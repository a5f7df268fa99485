//! Profile & link extraction over rendered HTML.
//!
//! Pages vary by locale and A/B bucket, so every field comes out of an
//! ordered cascade of strategies; the first strategy returning a value
//! wins and the rest never run.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use rasp_core::{
    parse_count, shortcode_from_link, username_from_link, ProfileRecord, ProfileStats, ReelLink,
    StatsSource,
};

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub platform_base_url: String,
    /// Cap on extracted reel links per profile per cycle.
    pub max_links: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            platform_base_url: "https://www.instagram.com".to_string(),
            max_links: 12,
        }
    }
}

fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("static selector parses")
}

/// Extract everything the pipeline needs from one rendered profile page.
pub fn extract_profile(
    username: &str,
    html: &str,
    config: &ExtractConfig,
    fetched_at: DateTime<Utc>,
) -> ProfileRecord {
    let doc = Html::parse_document(html);
    let stats = extract_stats(&doc);
    let links = extract_reel_links(&doc, username, config);
    let profile_pic_url = extract_profile_pic(&doc);

    ProfileRecord {
        username: username.to_string(),
        url: format!("{}/{}/", config.platform_base_url.trim_end_matches('/'), username),
        stats,
        profile_pic_url,
        profile_pic_path: None,
        hrefs: Vec::new(),
        links,
        fetched_at,
    }
}

/// Two mutually exclusive tiers: the meta-description string, then the
/// visible text of the main content region. Tier 2 only runs when tier 1
/// resolved none of the three aggregates.
pub fn extract_stats(doc: &Html) -> ProfileStats {
    let strategies: [fn(&Html) -> Option<ProfileStats>; 2] =
        [meta_description_stats, dom_text_stats];
    for strategy in strategies {
        if let Some(stats) = strategy(doc) {
            return stats;
        }
    }
    ProfileStats::absent()
}

fn meta_description_stats(doc: &Html) -> Option<ProfileStats> {
    let meta_sel = sel("meta");
    for meta in doc.select(&meta_sel) {
        let is_description = meta
            .value()
            .attr("name")
            .or_else(|| meta.value().attr("property"))
            .map(|n| n.eq_ignore_ascii_case("description") || n.ends_with("description"))
            .unwrap_or(false);
        if !is_description {
            continue;
        }
        let Some(content) = meta.value().attr("content") else {
            continue;
        };
        if let Some(stats) = labeled_stats(content, StatsSource::MetaDescription) {
            return Some(stats);
        }
    }
    None
}

fn dom_text_stats(doc: &Html) -> Option<ProfileStats> {
    let main_sel = sel("main");
    let text: String = match doc.select(&main_sel).next() {
        Some(main) => main.text().collect::<Vec<_>>().join(" "),
        None => doc.root_element().text().collect::<Vec<_>>().join(" "),
    };
    labeled_stats(&text, StatsSource::DomText)
}

/// Scan text for "<count> followers", "<count> following", "<count> posts"
/// in any order and case. Returns None when no label resolved, so the next
/// tier gets its turn.
fn labeled_stats(text: &str, source: StatsSource) -> Option<ProfileStats> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut followers_raw = None;
    let mut following_raw = None;
    let mut posts_raw = None;

    for (i, word) in words.iter().enumerate() {
        if i == 0 {
            continue;
        }
        let label = trim_token(word).to_ascii_lowercase();
        let slot = match label.as_str() {
            "followers" | "follower" => &mut followers_raw,
            "following" => &mut following_raw,
            "posts" | "post" => &mut posts_raw,
            _ => continue,
        };
        if slot.is_some() {
            continue;
        }
        let candidate = trim_token(words[i - 1]);
        if is_count_token(candidate) {
            *slot = Some(candidate.to_string());
        }
    }

    if followers_raw.is_none() && following_raw.is_none() && posts_raw.is_none() {
        return None;
    }
    Some(ProfileStats {
        source,
        followers: followers_raw.as_deref().and_then(parse_count),
        following: following_raw.as_deref().and_then(parse_count),
        posts: posts_raw.as_deref().and_then(parse_count),
        followers_raw,
        following_raw,
        posts_raw,
    })
}

/// Anchors under the profile's reel-collection prefix, deduplicated by
/// href in first-seen order, capped, engagement filled by cascade.
fn extract_reel_links(doc: &Html, username: &str, config: &ExtractConfig) -> Vec<ReelLink> {
    let anchor_sel = sel("a[href]");
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for anchor in doc.select(&anchor_sel) {
        if links.len() >= config.max_links {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href_matches_reel(href, username) {
            continue;
        }
        let canonical = canonicalize_href(href, &config.platform_base_url);
        if !seen.insert(canonical.clone()) {
            continue;
        }
        let (likes, comments, views) = extract_engagement(anchor);
        links.push(ReelLink {
            href: canonical,
            thumbnail: anchor_thumbnail(anchor),
            likes,
            comments,
            views,
        });
    }
    links
}

fn anchor_thumbnail(anchor: ElementRef<'_>) -> Option<String> {
    let img_sel = sel("img[src]");
    anchor
        .select(&img_sel)
        .filter_map(|img| img.value().attr("src"))
        .map(str::to_string)
        .next()
}

fn href_matches_reel(href: &str, username: &str) -> bool {
    if shortcode_from_link(href).is_none() {
        return false;
    }
    match username_from_link(href) {
        Some(owner) => owner == username,
        // Bare `/reel/<code>/` links on the profile page belong to it.
        None => true,
    }
}

fn canonicalize_href(href: &str, base: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

/// Engagement cascade per anchor:
/// (a) two count tokens inside a nested list (likes, comments);
/// (b) a count token adjacent to a "views" marker;
/// (c) positional fallback over all text nodes in document order.
fn extract_engagement(
    anchor: ElementRef<'_>,
) -> (Option<String>, Option<String>, Option<String>) {
    let li_sel = sel("ul li");

    let mut list_counts = anchor
        .select(&li_sel)
        .filter_map(|li| first_count_token(&li.text().collect::<Vec<_>>().join(" ")));
    let mut likes = list_counts.next();
    let mut comments = list_counts.next();
    let mut views = count_near_views_marker(anchor);

    if likes.is_none() || comments.is_none() || views.is_none() {
        let tokens = all_count_tokens(anchor);
        if likes.is_none() {
            likes = tokens.first().cloned();
        }
        if comments.is_none() {
            comments = tokens.get(1).cloned();
        }
        if views.is_none() {
            views = tokens.get(2).cloned();
        }
    }

    (likes, comments, views)
}

fn count_near_views_marker(anchor: ElementRef<'_>) -> Option<String> {
    let nodes: Vec<&str> = anchor
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let marker = nodes
        .iter()
        .position(|n| n.to_ascii_lowercase().contains("view"))?;

    // Same node first ("1.2M views"), then the neighbours.
    if let Some(token) = first_count_token(nodes[marker]) {
        return Some(token);
    }
    if marker > 0 {
        if let Some(token) = first_count_token(nodes[marker - 1]) {
            return Some(token);
        }
    }
    nodes.get(marker + 1).and_then(|n| first_count_token(n))
}

fn all_count_tokens(anchor: ElementRef<'_>) -> Vec<String> {
    anchor
        .text()
        .flat_map(str::split_whitespace)
        .map(trim_token)
        .filter(|t| is_count_token(t))
        .map(str::to_string)
        .collect()
}

/// Image whose accessible label mentions "profile picture", re-resolved
/// against the main content region when one exists so unrelated images with
/// similar captions elsewhere on the page do not win.
fn extract_profile_pic(doc: &Html) -> Option<String> {
    let img_sel = sel("img");
    let main_sel = sel("main");
    let labeled = |img: &ElementRef<'_>| {
        img.value()
            .attr("alt")
            .map(|alt| alt.to_ascii_lowercase().contains("profile picture"))
            .unwrap_or(false)
    };

    doc.select(&img_sel).find(|img| labeled(img))?;
    if let Some(main) = doc.select(&main_sel).next() {
        return main
            .select(&img_sel)
            .find(|img| labeled(img))
            .and_then(|img| img.value().attr("src").map(str::to_string));
    }
    doc.select(&img_sel)
        .find(|img| labeled(img))
        .and_then(|img| img.value().attr("src").map(str::to_string))
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

/// `digits[.,digits]*[K|M|B]?` after whitespace stripping.
pub fn is_count_token(token: &str) -> bool {
    let token = token.trim();
    if token.is_empty() {
        return false;
    }
    let body = match token.chars().last() {
        Some(c) if matches!(c.to_ascii_uppercase(), 'K' | 'M' | 'B') => {
            &token[..token.len() - 1]
        }
        _ => token,
    };
    if body.is_empty() || !body.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    let mut seen_separator = false;
    for ch in body.chars() {
        match ch {
            '0'..='9' => {}
            '.' | ',' => {
                seen_separator = true;
            }
            _ => return false,
        }
    }
    // Separators must sit between digits.
    if seen_separator && !body.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    true
}

fn first_count_token(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(trim_token)
        .find(|t| is_count_token(t))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_PAGE: &str = r#"
    <html>
      <head>
        <meta name="description" content="150 Followers, 12 Following, 34 Posts - See photos and videos" />
      </head>
      <body>
        <main>
          <header>
            <img alt="alice's profile picture" src="https://cdn.example/alice.jpg" />
          </header>
          <section>
            <a href="/alice/reel/AAA111/">
              <ul><li><span>1.2K</span></li><li><span>45</span></li></ul>
              <span>88.1K views</span>
            </a>
            <a href="/alice/reel/BBB222/">
              <span>views</span><span>12.3K</span>
            </a>
            <a href="/alice/reel/AAA111/">duplicate</a>
            <a href="/alice/">not a reel</a>
            <a href="/bob/reel/CCC333/">someone else</a>
          </section>
        </main>
        <footer>
          <img alt="footer profile picture of someone" src="https://cdn.example/footer.jpg" />
        </footer>
      </body>
    </html>
    "#;

    fn cfg() -> ExtractConfig {
        ExtractConfig::default()
    }

    #[test]
    fn meta_description_tier_wins_over_dom_text() {
        let html = r#"
        <html>
          <head><meta name="description" content="150 Followers, 12 Following, 34 Posts" /></head>
          <body><main>999 followers 999 following 999 posts</main></body>
        </html>"#;
        let doc = Html::parse_document(html);
        let stats = extract_stats(&doc);
        assert_eq!(stats.source, StatsSource::MetaDescription);
        assert_eq!(stats.followers, Some(150));
        assert_eq!(stats.following, Some(12));
        assert_eq!(stats.posts, Some(34));
    }

    #[test]
    fn labels_match_in_any_order_and_case() {
        let stats = labeled_stats(
            "34 POSTS, 12 Following, 150 followers",
            StatsSource::MetaDescription,
        )
        .expect("stats");
        assert_eq!(stats.followers, Some(150));
        assert_eq!(stats.following, Some(12));
        assert_eq!(stats.posts, Some(34));
    }

    #[test]
    fn dom_text_tier_runs_only_when_meta_yields_nothing() {
        let html = r#"
        <html>
          <head><meta name="description" content="just a bio with no numbers" /></head>
          <body><main><span>4.5M</span> <span>followers</span> 7 following 12 posts</main></body>
        </html>"#;
        let doc = Html::parse_document(html);
        let stats = extract_stats(&doc);
        assert_eq!(stats.source, StatsSource::DomText);
        assert_eq!(stats.followers, Some(4_500_000));
        assert_eq!(stats.following, Some(7));
        assert_eq!(stats.posts, Some(12));
    }

    #[test]
    fn stats_absent_when_neither_tier_resolves() {
        let doc = Html::parse_document("<html><body><main>nothing here</main></body></html>");
        let stats = extract_stats(&doc);
        assert_eq!(stats.source, StatsSource::Absent);
        assert!(!stats.any_present());
    }

    #[test]
    fn reel_links_dedup_in_first_seen_order_and_exclude_foreign_profiles() {
        let profile = extract_profile("alice", PROFILE_PAGE, &cfg(), Utc::now());
        let hrefs: Vec<&str> = profile.links.iter().map(|l| l.href.as_str()).collect();
        assert_eq!(
            hrefs,
            vec![
                "https://www.instagram.com/alice/reel/AAA111/",
                "https://www.instagram.com/alice/reel/BBB222/",
            ]
        );
    }

    #[test]
    fn nested_list_tokens_become_likes_and_comments() {
        let profile = extract_profile("alice", PROFILE_PAGE, &cfg(), Utc::now());
        let first = &profile.links[0];
        assert_eq!(first.likes.as_deref(), Some("1.2K"));
        assert_eq!(first.comments.as_deref(), Some("45"));
        assert_eq!(first.views.as_deref(), Some("88.1K"));
    }

    #[test]
    fn views_marker_adjacency_beats_positional_fallback() {
        let profile = extract_profile("alice", PROFILE_PAGE, &cfg(), Utc::now());
        let second = &profile.links[1];
        assert_eq!(second.views.as_deref(), Some("12.3K"));
        // Positional fallback fills what the earlier strategies left empty.
        assert_eq!(second.likes.as_deref(), Some("12.3K"));
    }

    #[test]
    fn positional_fallback_assigns_first_three_tokens() {
        let html = r#"
        <html><body><main>
          <a href="/alice/reel/XYZ/"><div>338</div><div>12</div><div>4.5M</div></a>
        </main></body></html>"#;
        let profile = extract_profile("alice", html, &cfg(), Utc::now());
        let link = &profile.links[0];
        assert_eq!(link.likes.as_deref(), Some("338"));
        assert_eq!(link.comments.as_deref(), Some("12"));
        assert_eq!(link.views.as_deref(), Some("4.5M"));
    }

    #[test]
    fn link_cap_is_respected() {
        let mut body = String::from("<html><body><main>");
        for i in 0..30 {
            body.push_str(&format!("<a href=\"/alice/reel/C{i}/\">x</a>"));
        }
        body.push_str("</main></body></html>");
        let config = ExtractConfig {
            max_links: 5,
            ..ExtractConfig::default()
        };
        let profile = extract_profile("alice", &body, &config, Utc::now());
        assert_eq!(profile.links.len(), 5);
    }

    #[test]
    fn profile_pic_resolves_inside_main_region_only() {
        let profile = extract_profile("alice", PROFILE_PAGE, &cfg(), Utc::now());
        assert_eq!(
            profile.profile_pic_url.as_deref(),
            Some("https://cdn.example/alice.jpg")
        );
    }

    #[test]
    fn count_token_shapes() {
        for good in ["338", "1,234", "12.3K", "4.5m", "7b"] {
            assert!(is_count_token(good), "{good} should match");
        }
        for bad in ["", "K", "12.", "views", "1a2", "x12"] {
            assert!(!is_count_token(bad), "{bad} should not match");
        }
    }
}
