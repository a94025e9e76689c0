#![forbid(unsafe_code)]

//! Extracts the canonical video id from the YouTube URL shapes we accept.
//!
//! The fixed patterns are tried in order; they are mutually exclusive by URL
//! shape so the first match wins. Anything that slips past them falls back to
//! a generic `v` query parameter lookup on youtube.com hosts. Returning
//! `None` means the caller got unusable input, not that something failed.

use url::Url;

/// Resolves a URL to a video id, or `None` when no supported shape matches.
pub fn resolve_video_id(raw: &str) -> Option<String> {
    match_fixed_patterns(raw).or_else(|| fallback_query_lookup(raw))
}

fn match_fixed_patterns(raw: &str) -> Option<String> {
    let rest = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))?;

    // Short links carry the id as the first path segment.
    if let Some(tail) = rest.strip_prefix("youtu.be/") {
        return id_until(tail, &['?', '&', '/']);
    }

    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    let path = rest.strip_prefix("youtube.com/")?;

    if let Some(tail) = path.strip_prefix("watch?v=") {
        return id_until(tail, &['&']);
    }
    if let Some(tail) = path.strip_prefix("embed/") {
        return id_until(tail, &['?', '/']);
    }
    // Legacy flash-player embed form.
    if let Some(tail) = path.strip_prefix("v/") {
        return id_until(tail, &['?', '/']);
    }

    None
}

/// Last resort: any youtube.com URL with a `v` query parameter, whatever the
/// path looks like (`/watch?feature=share&v=ID` and friends).
fn fallback_query_lookup(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    match parsed.host_str()? {
        "youtube.com" | "www.youtube.com" => {}
        _ => return None,
    }
    parsed
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn id_until(tail: &str, separators: &[char]) -> Option<String> {
    let id: String = tail.chars().take_while(|c| !separators.contains(c)).collect();
    if id.is_empty() { None } else { Some(id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_watch_urls() {
        assert_eq!(
            resolve_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            resolve_video_id("http://youtube.com/watch?v=abc123").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn watch_url_drops_extra_query_params() {
        assert_eq!(
            resolve_video_id("https://www.youtube.com/watch?v=abc123&t=42s").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn resolves_short_links() {
        assert_eq!(
            resolve_video_id("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            resolve_video_id("https://youtu.be/abc123?si=share").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn resolves_embed_urls() {
        assert_eq!(
            resolve_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            resolve_video_id("https://www.youtube.com/embed/abc123?autoplay=1").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn resolves_legacy_v_urls() {
        assert_eq!(
            resolve_video_id("https://www.youtube.com/v/abc123?version=3").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn falls_back_to_query_parsing() {
        assert_eq!(
            resolve_video_id("https://www.youtube.com/watch?feature=share&v=abc123").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn rejects_non_youtube_hosts() {
        assert!(resolve_video_id("https://vimeo.com/123456").is_none());
        assert!(resolve_video_id("https://example.com/watch?v=abc123").is_none());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(resolve_video_id("not a url").is_none());
        assert!(resolve_video_id("").is_none());
        assert!(resolve_video_id("https://www.youtube.com/watch?v=").is_none());
        assert!(resolve_video_id("https://www.youtube.com/playlist?list=PL123").is_none());
    }
}
