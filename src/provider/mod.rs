//! Content provider capability: turn a query or URL into track metadata,
//! optionally downloading the audio.

pub mod query;
pub mod ytdlp;

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::library::track::{Track, UNKNOWN_TITLE};

pub use query::QueryKind;
pub use ytdlp::YtDlp;

/// How the target is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveKind {
    /// Free-text search capped at `limit` results.
    Search { limit: usize },
    /// One item, even if the URL also names a playlist.
    Single,
    /// Every entry of a playlist. Flat extraction only lists entries.
    Playlist { flat: bool },
}

/// Where and how to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub output_dir: PathBuf,
    /// Convert to MP3 (requires ffmpeg).
    pub convert_to_mp3: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Search text or URL.
    pub query: String,
    pub kind: ResolveKind,
    pub download: Option<DownloadOptions>,
}

/// Progress reported while resolving.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// Provider stage, e.g. `download` or `ExtractAudio`.
    pub stage: String,
    pub percent: Option<f32>,
    pub message: String,
}

/// Receives progress and is asked for cancellation at safe points.
pub trait ResolveObserver {
    fn progress(&mut self, progress: Progress);

    fn is_cancelled(&self) -> bool;
}

/// One resolved item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    /// Lowercased extractor name, e.g. `youtube`.
    pub extractor: Option<String>,
    /// Best audio stream URL.
    pub stream_url: Option<String>,
    pub page_url: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_secs: u32,
    /// Downloaded file, when a download was requested and succeeded.
    pub local_file: Option<PathBuf>,
}

impl ProviderEntry {
    /// Build a track. A downloaded file wins over the stream URL, which
    /// wins over the page URL. Entries with none of these are dropped.
    pub fn into_track(self) -> Option<Track> {
        let mut page = self.page_url.filter(|p| !p.is_empty());
        if page.is_none() {
            if let (Some(id), Some("youtube" | "youtubetab")) =
                (self.id.as_deref(), self.extractor.as_deref())
            {
                page = Some(query::youtube_watch_url(id));
            }
        }

        let local = self
            .local_file
            .filter(|p| p.is_file())
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p));
        let (locator, is_local) = match local {
            Some(path) => (path.to_string_lossy().into_owned(), true),
            None => (
                self.stream_url
                    .filter(|s| !s.is_empty())
                    .or_else(|| page.clone())?,
                false,
            ),
        };

        Some(Track {
            page_locator: page.or_else(|| is_local.then(|| locator.clone())),
            locator: Some(locator),
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            thumbnail: self.thumbnail,
            duration_secs: self.duration_secs,
            is_local,
        })
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Cancelled")]
    Cancelled,

    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("Unreadable provider output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ProviderError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } => ErrorKind::ResourceUnavailable,
            _ => ErrorKind::Transient,
        }
    }
}

/// The external search/download engine.
pub trait ContentProvider: Send + Sync {
    fn resolve(
        &self,
        request: &ResolveRequest,
        observer: &mut dyn ResolveObserver,
    ) -> Result<Vec<ProviderEntry>, ProviderError>;

    /// Whether downloads can be converted to MP3.
    fn can_convert_audio(&self) -> bool;
}

#[cfg(test)]
pub mod testing {
    //! Scripted provider for orchestrator tests.

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    /// Replies with `entries` after `delay`, polling for cancellation.
    #[derive(Debug, Clone, Default)]
    pub struct FakeProvider {
        pub entries: Vec<ProviderEntry>,
        pub fail_with: Option<String>,
        pub delay: Duration,
        pub requests: Arc<Mutex<Vec<ResolveRequest>>>,
    }

    impl FakeProvider {
        pub fn returning(entries: Vec<ProviderEntry>) -> Self {
            Self {
                entries,
                ..Default::default()
            }
        }

        pub fn requests(&self) -> Vec<ResolveRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ContentProvider for FakeProvider {
        fn resolve(
            &self,
            request: &ResolveRequest,
            observer: &mut dyn ResolveObserver,
        ) -> Result<Vec<ProviderEntry>, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            observer.progress(Progress {
                stage: "info".into(),
                percent: None,
                message: format!("Resolving {}", request.query),
            });

            let step = Duration::from_millis(5);
            let mut waited = Duration::ZERO;
            while waited < self.delay {
                if observer.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                std::thread::sleep(step);
                waited += step;
            }
            if observer.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            match &self.fail_with {
                Some(message) => Err(ProviderError::Failed(message.clone())),
                None => Ok(self.entries.clone()),
            }
        }

        fn can_convert_audio(&self) -> bool {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ProviderEntry {
        ProviderEntry {
            id: Some("dQw4w9WgXcQ".into()),
            title: Some("Song".into()),
            extractor: Some("youtube".into()),
            stream_url: Some("https://cdn.example.com/audio.m4a".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_stream_entry_backfills_youtube_page() {
        let track = entry().into_track().unwrap();
        assert!(!track.is_local);
        assert_eq!(track.locator.as_deref(), Some("https://cdn.example.com/audio.m4a"));
        assert_eq!(
            track.canonical_identifier(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
    }

    #[test]
    fn test_page_url_is_last_resort_locator() {
        let track = ProviderEntry {
            stream_url: None,
            ..entry()
        }
        .into_track()
        .unwrap();
        assert_eq!(
            track.locator.as_deref(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
    }

    #[test]
    fn test_entry_without_locator_is_dropped() {
        let orphan = ProviderEntry {
            title: Some("Nothing".into()),
            extractor: Some("generic".into()),
            ..Default::default()
        };
        assert!(orphan.into_track().is_none());
    }

    #[test]
    fn test_downloaded_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("youtube_dQw4w9WgXcQ.mp3");
        std::fs::write(&path, b"fake").unwrap();

        let track = ProviderEntry {
            local_file: Some(path.clone()),
            ..entry()
        }
        .into_track()
        .unwrap();

        assert!(track.is_local);
        let canonical = std::fs::canonicalize(&path).unwrap();
        assert_eq!(track.locator.as_deref(), Some(&*canonical.to_string_lossy()));
        assert_eq!(
            track.page_locator.as_deref(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
    }

    #[test]
    fn test_missing_download_falls_back_to_stream() {
        let track = ProviderEntry {
            local_file: Some(PathBuf::from("/nonexistent/youtube_x.mp3")),
            ..entry()
        }
        .into_track()
        .unwrap();
        assert!(!track.is_local);
    }
}
