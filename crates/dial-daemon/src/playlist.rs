//! Playlist and manifest helpers for stream acquisition.
//!
//! A station URL is either a direct audio stream, an HLS manifest, or an
//! indirect `.pls`/`.m3u` playlist whose first entry is the real stream.

use reqwest::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistFormat {
    Pls,
    M3u,
}

/// Acquisition strategy chosen from the URL alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Direct,
    /// `.m3u8`: HLS manifest unless its body turns out to be a plain m3u list.
    Hls,
    Playlist(PlaylistFormat),
}

pub fn classify_url(url: &str) -> StreamKind {
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| {
            url.split(|c: char| c == '?' || c == '#')
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase()
        });

    if path.ends_with(".m3u8") {
        StreamKind::Hls
    } else if path.ends_with(".m3u") {
        StreamKind::Playlist(PlaylistFormat::M3u)
    } else if path.ends_with(".pls") {
        StreamKind::Playlist(PlaylistFormat::Pls)
    } else {
        StreamKind::Direct
    }
}

/// HLS manifests carry `#EXT-X-` directives; plain m3u lists do not.
pub fn is_hls_manifest(body: &str) -> bool {
    body.lines().any(|l| l.trim_start().starts_with("#EXT-X-"))
}

/// First embedded stream URL, or `None` when nothing usable is listed.
pub fn extract_stream_url(format: PlaylistFormat, body: &str, base: &str) -> Option<String> {
    match format {
        PlaylistFormat::Pls => parse_pls(body, base),
        PlaylistFormat::M3u => parse_m3u(body),
    }
}

/// `File1=<url>` entry of a `.pls` file.  Relative entries resolve against
/// the playlist URL.
pub fn parse_pls(body: &str, base: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("file1") {
            return None;
        }
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        resolve_relative_url(base, value)
    })
}

/// First non-comment line starting with `http`.
pub fn parse_m3u(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .find(|l| l.to_ascii_lowercase().starts_with("http"))
        .map(str::to_string)
}

fn resolve_relative_url(base: &str, candidate: &str) -> Option<String> {
    let lower = candidate.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(candidate.to_string());
    }
    Url::parse(base)
        .ok()?
        .join(candidate)
        .ok()
        .map(|u| u.to_string())
}
