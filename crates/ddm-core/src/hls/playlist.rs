//! Hand-rolled M3U8 master/media playlist parser (§4.1).
//!
//! No general-purpose M3U8 crate is used: the tag set this engine needs
//! (`EXT-X-STREAM-INF`, `EXTINF`, `EXT-X-KEY`, `EXT-X-DISCONTINUITY`) is
//! small and the scoping rules (a key tag applies to every following segment
//! until the next key tag or end of playlist) are easiest to get right with
//! a direct line-by-line scan.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use crate::error::DomainError;

/// One rendition advertised by a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct M3U8Stream {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
}

/// `EXT-X-KEY` for a media playlist segment range.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionDescriptor {
    pub method: String,
    pub uri: String,
    /// Explicit IV, hex-encoded, optionally `0x`-prefixed. When absent the
    /// IV is derived from the segment's media sequence number.
    pub iv: Option<String>,
}

/// One segment of a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct M3U8Segment {
    pub uri: String,
    pub duration: f64,
    pub media_sequence: u64,
    pub key: Option<EncryptionDescriptor>,
    pub discontinuity: bool,
}

/// Parse a master playlist, resolving stream URIs against `base_url`.
pub fn parse_master_playlist(text: &str, base_url: &str) -> Result<Vec<M3U8Stream>, DomainError> {
    let base = Url::parse(base_url).map_err(|e| DomainError::InvalidUrl(e.to_string()))?;
    let mut streams = Vec::new();
    let mut pending: Option<(u64, Option<(u32, u32)>, Option<String>)> = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let bandwidth = extract_attr_u64(rest, "BANDWIDTH").unwrap_or(0);
            let resolution = extract_attr(rest, "RESOLUTION").and_then(|v| parse_resolution(&v));
            let codecs = extract_attr(rest, "CODECS");
            pending = Some((bandwidth, resolution, codecs));
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some((bandwidth, resolution, codecs)) = pending.take() {
                let uri = resolve_url(&base, line)?;
                streams.push(M3U8Stream {
                    uri,
                    bandwidth,
                    resolution,
                    codecs,
                });
            }
        }
    }

    if streams.is_empty() {
        return Err(DomainError::PlaylistParse(
            "no EXT-X-STREAM-INF variants found".to_string(),
        ));
    }
    Ok(streams)
}

/// Parse a media playlist, resolving segment URIs and key URIs against
/// `base_url`, tracking `EXT-X-KEY` scope and `EXT-X-DISCONTINUITY` flags.
pub fn parse_media_playlist(text: &str, base_url: &str) -> Result<Vec<M3U8Segment>, DomainError> {
    let base = Url::parse(base_url).map_err(|e| DomainError::InvalidUrl(e.to_string()))?;
    let mut segments = Vec::new();
    let mut current_key: Option<EncryptionDescriptor> = None;
    let mut pending_duration: Option<f64> = None;
    let mut discontinuity_pending = false;
    let mut media_sequence = extract_media_sequence(text);

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            current_key = parse_key_tag(rest, &base)?;
        } else if line.starts_with("#EXT-X-DISCONTINUITY") {
            discontinuity_pending = true;
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration_str = rest.split(',').next().unwrap_or("0").trim();
            pending_duration = Some(duration_str.parse().unwrap_or(0.0));
        } else if !line.is_empty() && !line.starts_with('#') {
            let duration = pending_duration.take().unwrap_or(0.0);
            let uri = resolve_url(&base, line)?;
            segments.push(M3U8Segment {
                uri,
                duration,
                media_sequence,
                key: current_key.clone(),
                discontinuity: discontinuity_pending,
            });
            discontinuity_pending = false;
            media_sequence += 1;
        }
    }

    if segments.is_empty() {
        return Err(DomainError::PlaylistParse("no segments found in playlist".to_string()));
    }
    Ok(segments)
}

fn extract_media_sequence(text: &str) -> u64 {
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            if let Ok(n) = rest.trim().parse() {
                return n;
            }
        }
    }
    0
}

fn parse_key_tag(rest: &str, base: &Url) -> Result<Option<EncryptionDescriptor>, DomainError> {
    let method = extract_attr(rest, "METHOD").unwrap_or_else(|| "NONE".to_string());
    if method == "NONE" {
        return Ok(None);
    }
    let uri = extract_attr(rest, "URI")
        .ok_or_else(|| DomainError::PlaylistParse("EXT-X-KEY missing URI".to_string()))?;
    let uri = resolve_url(base, &uri)?;
    let iv = extract_attr(rest, "IV");
    Ok(Some(EncryptionDescriptor { method, uri, iv }))
}

fn resolve_url(base: &Url, reference: &str) -> Result<String, DomainError> {
    base.join(reference)
        .map(|u| u.to_string())
        .map_err(|e| DomainError::InvalidUrl(e.to_string()))
}

fn attr_regex(name: &str) -> Regex {
    Regex::new(&format!(r#"{name}=(?:"([^"]*)"|([^,]*))"#)).expect("valid attr regex")
}

fn extract_attr(attrs: &str, name: &str) -> Option<String> {
    let re = attr_regex(name);
    let caps = re.captures(attrs)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_attr_u64(attrs: &str, name: &str) -> Option<u64> {
    extract_attr(attrs, name)?.parse().ok()
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Pick the stream with the highest `bandwidth`.
pub fn select_best_quality(streams: &[M3U8Stream]) -> Option<&M3U8Stream> {
    streams.iter().max_by_key(|s| s.bandwidth)
}

/// Pick the stream with the lowest `bandwidth`.
pub fn select_lowest_quality(streams: &[M3U8Stream]) -> Option<&M3U8Stream> {
    streams.iter().min_by_key(|s| s.bandwidth)
}

fn m3u8_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"["']?(https?://[^\s"'<>]+\.m3u8[^\s"'<>]*)["']?"#).expect("valid m3u8 url regex")
    })
}

/// Scrape an `.m3u8` URL out of an HTML page when no playlist link is given
/// directly. Returns `None` if nothing matches, mirroring a best-effort
/// fallback rather than a hard failure.
pub fn extract_m3u8_url_from_page(html: &str) -> Option<String> {
    let caps = m3u8_url_regex().captures(html)?;
    let url = caps.get(1)?.as_str();
    Some(url.trim_end_matches(';').to_string())
}

fn trailing_digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid digits regex"))
}

/// Split a segment URL into `(prefix, suffix, width, index)` around the
/// last run of decimal digits in its path, so a downloader can substitute
/// `index + k` for any `k` and regenerate the presumed URL of a subsequent
/// segment without a playlist (§4.1 URL-pattern fallback). `width` is the
/// digit run's original length, so callers can zero-pad replacement indices
/// to the same width. Returns `None` when the path has no digits.
pub fn extract_url_pattern(url: &str) -> Option<(String, String, usize, u64)> {
    let parsed = Url::parse(url).ok()?;
    let path = parsed.path();
    let re = trailing_digits_regex();
    let last_match = re.find_iter(path).last()?;
    let index: u64 = last_match.as_str().parse().ok()?;
    let width = last_match.as_str().len();

    let scheme_and_host = &url[..url.len() - (parsed.path().len() + parsed.query().map(|q| q.len() + 1).unwrap_or(0))];
    let prefix = format!("{scheme_and_host}{}", &path[..last_match.start()]);
    let mut suffix = path[last_match.end()..].to_string();
    if let Some(query) = parsed.query() {
        suffix.push('?');
        suffix.push_str(query);
    }
    Some((prefix, suffix, width, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_master_playlist_variants() {
        let text = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1920x1080,CODECS=\"avc1.64001f\"\n\
high/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=640000,RESOLUTION=1280x720\n\
low/index.m3u8\n";
        let streams = parse_master_playlist(text, "https://cdn.example.com/video/master.m3u8").unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].bandwidth, 1_280_000);
        assert_eq!(streams[0].resolution, Some((1920, 1080)));
        assert_eq!(streams[0].codecs.as_deref(), Some("avc1.64001f"));
        assert_eq!(streams[0].uri, "https://cdn.example.com/video/high/index.m3u8");

        let best = select_best_quality(&streams).unwrap();
        assert_eq!(best.bandwidth, 1_280_000);
        let lowest = select_lowest_quality(&streams).unwrap();
        assert_eq!(lowest.bandwidth, 640_000);
    }

    #[test]
    fn parses_media_playlist_with_key_scope_and_discontinuity() {
        let text = "#EXTM3U\n\
#EXT-X-MEDIA-SEQUENCE:5\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key1.bin\",IV=0x0000000000000000000000000000abcd\n\
#EXTINF:10.0,\n\
seg0.ts\n\
#EXTINF:10.0,\n\
seg1.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key2.bin\"\n\
#EXTINF:10.0,\n\
seg2.ts\n";
        let segments = parse_media_playlist(text, "https://cdn.example.com/video/index.m3u8").unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].media_sequence, 5);
        assert_eq!(segments[0].key.as_ref().unwrap().uri, "https://cdn.example.com/video/key1.bin");
        assert_eq!(segments[1].key.as_ref().unwrap().uri, "https://cdn.example.com/video/key1.bin");
        assert!(!segments[1].discontinuity);
        assert!(segments[2].discontinuity);
        assert_eq!(segments[2].key.as_ref().unwrap().uri, "https://cdn.example.com/video/key2.bin");
    }

    #[test]
    fn extract_m3u8_url_from_page_plain_and_quoted() {
        let plain = "watch this: https://cdn.example.com/stream/playlist.m3u8 now";
        assert_eq!(
            extract_m3u8_url_from_page(plain).as_deref(),
            Some("https://cdn.example.com/stream/playlist.m3u8")
        );

        let quoted = r#"var src = "https://cdn.example.com/stream/playlist.m3u8?x=1";"#;
        assert_eq!(
            extract_m3u8_url_from_page(quoted).as_deref(),
            Some("https://cdn.example.com/stream/playlist.m3u8?x=1")
        );
    }

    #[test]
    fn extract_m3u8_url_from_page_no_match() {
        assert_eq!(extract_m3u8_url_from_page("nothing here"), None);
    }

    #[test]
    fn url_pattern_extraction_matches_last_digit_run_in_path() {
        let (prefix, suffix, width, index) =
            extract_url_pattern("https://cdn.example.com/video/segment1.ts").unwrap();
        assert_eq!(prefix, "https://cdn.example.com/video/segment");
        assert_eq!(suffix, ".ts");
        assert_eq!(width, 1);
        assert_eq!(index, 1);

        let (prefix, suffix, width, index) =
            extract_url_pattern("https://cdn.example.com/video-part-23.mp4?token=123").unwrap();
        assert_eq!(prefix, "https://cdn.example.com/video-part-");
        assert_eq!(suffix, ".mp4?token=123");
        assert_eq!(width, 2);
        assert_eq!(index, 23);
    }

    #[test]
    fn url_pattern_extraction_reconstructs_subsequent_segment_urls() {
        let (prefix, suffix, width, index) =
            extract_url_pattern("https://cdn.example.com/video/seg-0023.ts").unwrap();
        let next = format!("{prefix}{:0width$}{suffix}", index + 1, width = width);
        assert_eq!(next, "https://cdn.example.com/video/seg-0024.ts");
    }

    #[test]
    fn url_pattern_extraction_no_digits_returns_none() {
        assert_eq!(
            extract_url_pattern("https://cdn.example.com/video/segment.ts"),
            None
        );
    }
}
