//! Track entity and migration of legacy persisted records.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// File extensions treated as playable local audio.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "ogg", "m4a", "webm", "opus"];

/// Fallback title when nothing better can be derived.
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Title carried by the sentinel produced for malformed records.
pub const INVALID_TITLE: &str = "Invalid Track Data";

/// A single playable item: local file, remote stream or page URL.
///
/// The persisted field names are kept compatible with existing
/// `playlist.json`/`history.json`/`favorites.json` files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Local path or stream URL handed to the engine
    #[serde(rename = "url")]
    pub locator: Option<String>,

    pub title: String,

    #[serde(rename = "thumbnail_url")]
    pub thumbnail: Option<String>,

    /// Duration in seconds, 0 when unknown
    #[serde(rename = "duration_sec", default)]
    pub duration_secs: u32,

    #[serde(default)]
    pub is_local: bool,

    /// Page URL (or the path itself for local files); preferred dedup key
    #[serde(rename = "webpage_url")]
    pub page_locator: Option<String>,
}

/// The three record shapes found in persisted lists over time.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTrack {
    /// Oldest shape: just a locator.
    Locator(String),
    /// `[stream, title, thumb, duration, page]`.
    Positional(Vec<Value>),
    /// Property mapping, current shape.
    Record(Map<String, Value>),
    /// Anything else.
    Malformed(Value),
}

impl From<Value> for RawTrack {
    fn from(value: Value) -> Self {
        match value {
            Value::String(locator) => Self::Locator(locator),
            Value::Array(items) => Self::Positional(items),
            Value::Object(map) => Self::Record(map),
            other => Self::Malformed(other),
        }
    }
}

/// Fields pulled out of a raw record before heuristics run.
#[derive(Debug, Default)]
struct Migrated {
    locator: Option<String>,
    title: Option<String>,
    thumbnail: Option<String>,
    duration_secs: u32,
    is_local: bool,
    page_locator: Option<String>,
    identifier: Option<String>,
}

impl Track {
    /// Create a track with no page locator. Local tracks get their path as identifier.
    pub fn new(locator: impl Into<String>, title: impl Into<String>, is_local: bool) -> Self {
        let locator = locator.into();
        Self {
            page_locator: is_local.then(|| locator.clone()),
            locator: Some(locator),
            title: title.into(),
            thumbnail: None,
            duration_secs: 0,
            is_local,
        }
    }

    /// Build a local track from an existing audio file.
    pub fn from_local_file(path: &Path) -> Option<Self> {
        if !path.is_file() || !has_audio_extension(path) {
            return None;
        }
        let resolved = std::fs::canonicalize(path).ok()?;
        let title = file_stem(&resolved).unwrap_or_else(|| UNKNOWN_TITLE.to_string());
        Some(Self::new(resolved.to_string_lossy(), title, true))
    }

    /// Sentinel returned for records that cannot be interpreted.
    pub fn invalid() -> Self {
        Self {
            locator: None,
            title: INVALID_TITLE.to_string(),
            thumbnail: None,
            duration_secs: 0,
            is_local: false,
            page_locator: None,
        }
    }

    /// Whether this is the sentinel produced by [`Track::invalid`].
    pub fn is_invalid(&self) -> bool {
        self.locator.is_none() && self.page_locator.is_none() && self.title == INVALID_TITLE
    }

    /// Whether the track can be kept in a list at all.
    pub fn is_usable(&self) -> bool {
        !self.is_invalid() && (self.locator.is_some() || !self.title.is_empty())
    }

    /// Stable dedup key shared by playlist, history and favorites.
    pub fn canonical_identifier(&self) -> Option<&str> {
        self.page_locator
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.locator.as_deref().filter(|s| !s.is_empty()))
    }

    /// Local path of this track, if it is a local file.
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.is_local {
            self.locator.as_deref().map(PathBuf::from)
        } else {
            None
        }
    }

    /// Normalize a legacy or current record into a canonical track.
    pub fn normalize(raw: RawTrack) -> Self {
        let migrated = match raw {
            RawTrack::Locator(locator) => Migrated {
                title: Some(locator.clone()),
                page_locator: Some(locator.clone()),
                identifier: Some(locator.clone()),
                locator: Some(locator),
                ..Default::default()
            },
            RawTrack::Positional(items) if items.len() >= 5 => {
                let page = string_value(&items[4]);
                Migrated {
                    locator: string_value(&items[0]),
                    title: string_value(&items[1]),
                    thumbnail: string_value(&items[2]),
                    duration_secs: seconds_value(&items[3]),
                    is_local: false,
                    identifier: page.clone(),
                    page_locator: page,
                }
            }
            RawTrack::Record(map) => {
                let locator = map.get("url").and_then(string_value);
                let page = map.get("webpage_url").and_then(string_value);
                Migrated {
                    identifier: page.clone().or_else(|| locator.clone()),
                    title: map.get("title").and_then(string_value),
                    thumbnail: map.get("thumbnail_url").and_then(string_value),
                    duration_secs: map.get("duration_sec").map(seconds_value).unwrap_or(0),
                    is_local: map.get("is_local").and_then(Value::as_bool).unwrap_or(false),
                    page_locator: page,
                    locator,
                }
            }
            RawTrack::Positional(items) => {
                tracing::warn!("Dropping positional record with {} fields", items.len());
                return Self::invalid();
            }
            RawTrack::Malformed(value) => {
                tracing::warn!("Dropping malformed track record: {}", value);
                return Self::invalid();
            }
        };

        Self::from_migrated(migrated)
    }

    fn from_migrated(m: Migrated) -> Self {
        let mut track = Track {
            title: m
                .title
                .clone()
                .or_else(|| m.identifier.clone())
                .unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            locator: m.locator,
            thumbnail: m.thumbnail,
            duration_secs: m.duration_secs,
            is_local: m.is_local,
            page_locator: m.page_locator,
        };

        // A title that is just the identifier is improved from the file name.
        if m.identifier.as_deref() == Some(track.title.as_str()) {
            if let Some(stem) = track
                .locator
                .as_deref()
                .map(Path::new)
                .filter(|p| p.is_file())
                .and_then(file_stem)
            {
                track.title = stem;
            }
        }
        if track.title.is_empty() {
            track.title = UNKNOWN_TITLE.to_string();
        }

        if !m.is_local {
            if let Some(resolved) = track.locator.as_deref().and_then(resolve_local_audio) {
                track.is_local = true;
                track.locator = Some(resolved.to_string_lossy().into_owned());
            }
        }

        let page_missing = track.page_locator.as_deref().map_or(true, str::is_empty);
        if track.is_local && page_missing {
            track.page_locator = track.locator.clone();
        } else if !track.is_local && track.page_locator.is_none() {
            if let Some(locator) = track.locator.as_deref().filter(|l| l.starts_with("http")) {
                track.page_locator = Some(locator.to_string());
            }
        }

        track
    }
}

/// Whether the path carries one of the known audio extensions.
pub fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Absolute path of an existing local audio file, if the locator is one.
fn resolve_local_audio(locator: &str) -> Option<PathBuf> {
    let path = Path::new(locator);
    if has_audio_extension(path) && path.exists() {
        std::fs::canonicalize(path).ok()
    } else {
        None
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
}

fn string_value(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn seconds_value(value: &Value) -> u32 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|v| v.min(u32::MAX as u64) as u32)
            .or_else(|| n.as_f64().filter(|v| *v > 0.0).map(|v| v as u32))
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(value: Value) -> Track {
        Track::normalize(RawTrack::from(value))
    }

    #[test]
    fn test_plain_url_locator() {
        let track = normalize(json!("https://www.youtube.com/watch?v=abcdefghijk"));

        assert_eq!(
            track.locator.as_deref(),
            Some("https://www.youtube.com/watch?v=abcdefghijk")
        );
        assert_eq!(track.title, "https://www.youtube.com/watch?v=abcdefghijk");
        assert!(!track.is_local);
        assert_eq!(
            track.canonical_identifier(),
            Some("https://www.youtube.com/watch?v=abcdefghijk")
        );
    }

    #[test]
    fn test_positional_record() {
        let track = normalize(json!([
            "https://cdn.example.com/stream.m4a",
            "Song",
            "https://i.example.com/t.jpg",
            215.7,
            "https://www.youtube.com/watch?v=abcdefghijk"
        ]));

        assert_eq!(track.title, "Song");
        assert_eq!(track.duration_secs, 215);
        assert_eq!(track.thumbnail.as_deref(), Some("https://i.example.com/t.jpg"));
        assert_eq!(
            track.canonical_identifier(),
            Some("https://www.youtube.com/watch?v=abcdefghijk")
        );
    }

    #[test]
    fn test_short_positional_record_is_invalid() {
        let track = normalize(json!(["a", "b"]));
        assert!(track.is_invalid());
        assert!(!track.is_usable());
    }

    #[test]
    fn test_record_with_null_duration() {
        let track = normalize(json!({
            "url": "https://cdn.example.com/a.mp3",
            "title": "A",
            "duration_sec": null
        }));
        assert_eq!(track.duration_secs, 0);
        assert_eq!(track.page_locator.as_deref(), Some("https://cdn.example.com/a.mp3"));
    }

    #[test]
    fn test_local_file_inference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("My Song.mp3");
        std::fs::write(&path, b"fake").unwrap();
        let resolved = std::fs::canonicalize(&path).unwrap();

        let track = normalize(json!({ "url": path.to_string_lossy() }));

        assert!(track.is_local);
        assert_eq!(track.title, "My Song");
        assert_eq!(track.locator.as_deref(), Some(&*resolved.to_string_lossy()));
        assert_eq!(track.page_locator, track.locator);
    }

    #[test]
    fn test_unknown_extension_stays_remote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"fake").unwrap();

        let track = normalize(json!({ "url": path.to_string_lossy(), "title": "Notes" }));
        assert!(!track.is_local);
        assert_eq!(track.page_locator, None);
    }

    #[test]
    fn test_missing_everything_gets_unknown_title() {
        let track = normalize(json!({}));
        assert_eq!(track.title, UNKNOWN_TITLE);
        assert!(track.locator.is_none());
    }

    #[test]
    fn test_malformed_value_is_sentinel() {
        assert!(normalize(json!(42)).is_invalid());
        assert!(normalize(json!(null)).is_invalid());
    }

    #[test]
    fn test_identifier_stable_across_reserialization() {
        let original = normalize(json!([
            "https://cdn.example.com/stream.m4a",
            "Song",
            null,
            10,
            "https://www.youtube.com/watch?v=abcdefghijk"
        ]));
        let value = serde_json::to_value(&original).unwrap();
        let reloaded = normalize(value);

        assert_eq!(reloaded, original);
        assert_eq!(reloaded.canonical_identifier(), original.canonical_identifier());
    }
}
