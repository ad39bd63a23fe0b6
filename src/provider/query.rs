//! Classification of user queries into search text, single URLs and
//! playlist URLs.

/// Hosts that mark a query as a URL even without a scheme.
const URL_HOSTS: &[&str] = &["youtube.com/", "youtu.be/", "soundcloud.com/", "vimeo.com/"];

/// Markers of a playlist-like URL.
const PLAYLIST_MARKERS: &[&str] = &["list=", "/playlist?", "/sets/", "music.youtube.com/playlist"];

/// Length of a YouTube video id.
const VIDEO_ID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Free text for a provider search.
    Text,
    /// A URL of one item.
    Single,
    /// A URL of a playlist, set or channel listing.
    Playlist,
}

pub fn is_url(query: &str) -> bool {
    let lower = query.to_lowercase();
    lower.starts_with("http") || URL_HOSTS.iter().any(|host| lower.contains(host))
}

/// Classify a trimmed query. Playlist markers win over single-item URLs,
/// so `watch?v=...&list=...` is a playlist.
pub fn classify(query: &str) -> QueryKind {
    if !is_url(query) {
        return QueryKind::Text;
    }
    let lower = query.to_lowercase();
    if PLAYLIST_MARKERS.iter().any(|marker| lower.contains(marker)) {
        QueryKind::Playlist
    } else {
        QueryKind::Single
    }
}

/// Extract the 11-character video id from anything that looks like a
/// YouTube watch, embed, `v/` or short link.
pub fn youtube_video_id(text: &str) -> Option<&str> {
    let lower = text.to_ascii_lowercase();
    for host in ["youtube.com/", "youtu.be/"] {
        let mut search_from = 0;
        while let Some(found) = lower[search_from..].find(host) {
            let start = search_from + found + host.len();
            if let Some(id) = video_id_after(&text[start..]) {
                return Some(id);
            }
            search_from = start;
        }
    }
    None
}

fn video_id_after(rest: &str) -> Option<&str> {
    let mut rest = rest;
    for prefix in ["watch?v=", "embed/", "v/"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    let id_len = rest
        .bytes()
        .take(VIDEO_ID_LEN)
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
        .count();
    (id_len == VIDEO_ID_LEN).then(|| &rest[..VIDEO_ID_LEN])
}

/// Canonical watch page for a video id.
pub fn youtube_watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}
