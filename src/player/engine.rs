//! Playback engine capability.
//!
//! The session drives exactly one engine from the control thread. Events
//! are pulled with [`Engine::poll_event`] rather than pushed, so nothing
//! from the playback thread ever runs inside the state machine.

use thiserror::Error;

/// Highest accepted volume, 100 being unity gain.
pub const MAX_VOLUME: u16 = 200;

/// Where a locator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Local,
    /// Remote stream, buffered for `caching_ms` before playback starts.
    Network { caching_ms: u32 },
}

/// What to load next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub locator: String,
    pub source: MediaSource,
}

impl MediaRequest {
    /// Classify a locator: http(s) URLs are network streams, anything else
    /// is opened as a file.
    pub fn for_locator(locator: impl Into<String>, is_local: bool, caching_ms: u32) -> Self {
        let locator = locator.into();
        let remote = !is_local && is_remote_locator(&locator);
        Self {
            locator,
            source: if remote {
                MediaSource::Network { caching_ms }
            } else {
                MediaSource::Local
            },
        }
    }

    pub fn network(locator: impl Into<String>, caching_ms: u32) -> Self {
        Self {
            locator: locator.into(),
            source: MediaSource::Network { caching_ms },
        }
    }
}

pub fn is_remote_locator(locator: &str) -> bool {
    let lower = locator.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Opening,
    Playing,
    Paused,
    Stopped,
    Ended,
    Error,
}

impl EngineState {
    /// Opening counts as playing: the engine has accepted the media.
    pub fn is_playing(self) -> bool {
        matches!(self, Self::Opening | Self::Playing)
    }
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    EndReached,
    Error(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No media loaded")]
    NoMedia,

    #[error("Media not found: {0}")]
    MediaNotFound(String),

    #[error("Audio output unavailable: {0}")]
    Output(String),

    #[error("Engine refused to play: {0}")]
    Refused(String),

    #[error("Player thread is gone")]
    Disconnected,
}

/// The playback engine as seen by the session.
pub trait Engine {
    /// Replace the current media. Does not start playback.
    fn set_media(&mut self, request: MediaRequest) -> Result<(), EngineError>;

    /// Start or resume playback of the current media.
    fn play(&mut self) -> Result<(), EngineError>;

    fn pause(&mut self);

    /// Whether the current media supports pausing.
    fn can_pause(&self) -> bool;

    fn stop(&mut self);

    fn is_playing(&self) -> bool {
        self.state().is_playing()
    }

    fn state(&self) -> EngineState;

    /// Current position.
    fn time_ms(&self) -> u64;

    /// Media length, `None` while unknown.
    fn length_ms(&self) -> Option<u64>;

    fn set_time(&mut self, ms: u64);

    /// 0..=[`MAX_VOLUME`].
    fn set_volume(&mut self, volume: u16);

    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<EngineEvent>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_request_classification() {
        let remote = MediaRequest::for_locator("https://cdn.example.com/a.mp3", false, 3000);
        assert_eq!(remote.source, MediaSource::Network { caching_ms: 3000 });

        let local = MediaRequest::for_locator("/music/a.mp3", true, 3000);
        assert_eq!(local.source, MediaSource::Local);

        let relative = MediaRequest::for_locator("a.mp3", false, 3000);
        assert_eq!(relative.source, MediaSource::Local);
    }

    #[test]
    fn test_opening_counts_as_playing() {
        assert!(EngineState::Opening.is_playing());
        assert!(EngineState::Playing.is_playing());
        assert!(!EngineState::Paused.is_playing());
        assert!(!EngineState::Ended.is_playing());
    }
}
