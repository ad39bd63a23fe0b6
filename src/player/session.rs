//! Playback state machine.
//!
//! `Session` owns the playlist, the engine and the intended playback state
//! (mode, current index, logical playing flag). Every mutation goes
//! through it on the control thread; the engine's own view is reconciled
//! on each status read.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::engine::{Engine, EngineError, EngineState, MediaRequest, MAX_VOLUME};
use crate::error::{Classify, ErrorKind};
use crate::library::{RadioStation, Track};

/// What the session is currently driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[default]
    None,
    Playlist,
    WebRadio,
}

/// Behavior of "previous" on the first track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviousAtStart {
    /// Jump to the last track.
    #[default]
    Wrap,
    /// Restart the first track.
    Restart,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Track index {index} is out of range for a playlist of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Volume {0} is outside 0-{MAX_VOLUME}")]
    InvalidVolume(i64),

    #[error("The playlist is empty")]
    EmptyPlaylist,

    #[error("Not playing from the playlist")]
    NotInPlaylist,

    #[error("Nothing is playing")]
    NotPlaying,

    #[error("Nothing to play")]
    NothingToPlay,

    #[error("Position {position_ms} ms is beyond the end of the track")]
    SeekOutOfRange { position_ms: u64 },

    #[error("'{title}' has no playable locator")]
    NoLocator { title: String },

    #[error("The player is not available")]
    EngineUnavailable,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl Classify for PlaybackError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::IndexOutOfRange { .. }
            | Self::InvalidVolume(_)
            | Self::EmptyPlaylist
            | Self::NotInPlaylist
            | Self::NotPlaying
            | Self::NothingToPlay
            | Self::SeekOutOfRange { .. } => ErrorKind::Validation,
            Self::NoLocator { .. } | Self::EngineUnavailable => ErrorKind::ResourceUnavailable,
            Self::Engine(EngineError::MediaNotFound(_)) => ErrorKind::ResourceUnavailable,
            Self::Engine(_) => ErrorKind::Transient,
        }
    }
}

/// Result of a successful play request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Played {
    /// A new playlist track was loaded.
    Started(usize),
    /// Paused media was resumed without reloading.
    Resumed,
    /// A station was (re)started.
    Radio,
    /// Already playing; nothing done.
    Unchanged,
}

/// Result of removing a playlist entry.
#[derive(Debug)]
pub struct Removed {
    pub track: Track,
    /// Set when the removed track was current and playback moved on.
    pub continued: Option<Result<Played, PlaybackError>>,
}

/// Point-in-time view returned by [`Session::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub mode: PlaybackMode,
    pub is_playing: bool,
    /// -1 when not playing from the playlist
    pub current_index: i64,
    pub current_track: Option<Track>,
    pub station: Option<RadioStation>,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub volume: u16,
    pub playlist_length: usize,
}

/// Session settings fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub volume: u16,
    pub previous_at_start: PreviousAtStart,
    pub network_caching_ms: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            volume: 80,
            previous_at_start: PreviousAtStart::Wrap,
            network_caching_ms: 3000,
        }
    }
}

/// The single playback session.
pub struct Session {
    /// `None` when the engine failed to initialize: the session is inert.
    engine: Option<Box<dyn Engine>>,
    playlist: Vec<Track>,
    mode: PlaybackMode,
    current_index: Option<usize>,
    /// Index of the last track that failed to start; next/previous step
    /// from here while there is no current track.
    failed_index: Option<usize>,
    logical_playing: bool,
    radio: Option<RadioStation>,
    volume: u16,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        engine: Option<Box<dyn Engine>>,
        playlist: Vec<Track>,
        options: SessionOptions,
    ) -> Self {
        let volume = options.volume.min(MAX_VOLUME);
        let mut session = Self {
            engine,
            playlist,
            mode: PlaybackMode::None,
            current_index: None,
            failed_index: None,
            logical_playing: false,
            radio: None,
            volume,
            options,
        };
        match session.engine.as_mut() {
            Some(engine) => engine.set_volume(volume),
            None => tracing::warn!("No playback engine; the session is read-only"),
        }
        session
    }

    /// Enter the initial state: play the first track when requested and
    /// the playlist is not empty.
    pub fn start(&mut self, autoplay: bool) -> Option<Result<Played, PlaybackError>> {
        if autoplay && !self.playlist.is_empty() {
            Some(self.play_at(0))
        } else {
            None
        }
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub fn playlist(&self) -> &[Track] {
        &self.playlist
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn is_logically_playing(&self) -> bool {
        self.logical_playing
    }

    pub fn radio(&self) -> Option<&RadioStation> {
        self.radio.as_ref()
    }

    pub fn volume(&self) -> u16 {
        self.volume
    }

    /// The playlist track currently selected, if in playlist mode.
    pub fn current_track(&self) -> Option<&Track> {
        match self.mode {
            PlaybackMode::Playlist => self.current_index.and_then(|i| self.playlist.get(i)),
            _ => None,
        }
    }

    /// Whether neither playing nor paused, i.e. new tracks may auto-start.
    pub fn is_idle(&self) -> bool {
        match self.engine.as_ref() {
            Some(engine) => !matches!(
                engine.state(),
                EngineState::Opening | EngineState::Playing | EngineState::Paused
            ),
            None => true,
        }
    }

    /// Whether the engine is actually producing audio.
    pub fn is_engine_playing(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.state() == EngineState::Playing)
    }

    /// Play the playlist track at `index`, resuming instead when that
    /// track is the paused current one.
    pub fn play_at(&mut self, index: usize) -> Result<Played, PlaybackError> {
        let len = self.playlist.len();
        if index >= len {
            return Err(PlaybackError::IndexOutOfRange { index, len });
        }
        let Some(engine) = self.engine.as_mut() else {
            self.logical_playing = false;
            return Err(PlaybackError::EngineUnavailable);
        };

        if self.mode == PlaybackMode::Playlist
            && self.current_index == Some(index)
            && engine.state() == EngineState::Paused
        {
            return match engine.play() {
                Ok(()) => {
                    self.logical_playing = true;
                    tracing::info!("Resuming track {}", index);
                    Ok(Played::Resumed)
                }
                Err(e) => {
                    self.logical_playing = false;
                    Err(e.into())
                }
            };
        }

        engine.stop();
        self.mode = PlaybackMode::Playlist;
        self.radio = None;

        let track = &self.playlist[index];
        let Some(locator) = track.locator.clone().filter(|l| !l.is_empty()) else {
            let title = track.title.clone();
            tracing::error!("Track '{}' has no locator", title);
            self.logical_playing = false;
            self.current_index = None;
            self.failed_index = Some(index);
            return Err(PlaybackError::NoLocator { title });
        };

        let request =
            MediaRequest::for_locator(locator, track.is_local, self.options.network_caching_ms);
        if let Err(e) = engine.set_media(request).and_then(|()| engine.play()) {
            tracing::error!("Failed to play track {} ('{}'): {}", index, track.title, e);
            self.logical_playing = false;
            self.current_index = None;
            self.failed_index = Some(index);
            return Err(e.into());
        }

        tracing::info!("Playing track {}: {}", index, track.title);
        self.current_index = Some(index);
        self.failed_index = None;
        self.logical_playing = true;
        Ok(Played::Started(index))
    }

    /// Advance to the next track, wrapping to the first.
    pub fn play_next(&mut self) -> Result<Played, PlaybackError> {
        self.ensure_playlist_mode()?;
        let len = self.playlist.len();
        let next = match self.current_index.or(self.failed_index) {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.play_at(next)
    }

    /// Go back one track; the first track restarts or wraps per options.
    pub fn play_previous(&mut self) -> Result<Played, PlaybackError> {
        self.ensure_playlist_mode()?;
        let last = self.playlist.len() - 1;
        let previous = match (
            self.current_index.or(self.failed_index),
            self.options.previous_at_start,
        ) {
            (Some(i), _) if i > 0 => (i - 1).min(last),
            (_, PreviousAtStart::Wrap) => last,
            (_, PreviousAtStart::Restart) => 0,
        };
        self.play_at(previous)
    }

    /// Shared guard for next/previous: outside playlist mode playback
    /// stops; an empty playlist is a failure without side effects.
    fn ensure_playlist_mode(&mut self) -> Result<(), PlaybackError> {
        if self.mode != PlaybackMode::Playlist {
            tracing::warn!("Skip requested outside playlist mode; stopping");
            if let Some(engine) = self.engine.as_mut() {
                engine.stop();
            }
            self.logical_playing = false;
            return Err(PlaybackError::NotInPlaylist);
        }
        if self.playlist.is_empty() {
            self.logical_playing = false;
            return Err(PlaybackError::EmptyPlaylist);
        }
        Ok(())
    }

    /// Switch to a web-radio stream.
    pub fn play_web_radio(&mut self, station: RadioStation) -> Result<Played, PlaybackError> {
        let Some(engine) = self.engine.as_mut() else {
            self.logical_playing = false;
            return Err(PlaybackError::EngineUnavailable);
        };
        engine.stop();

        let request = MediaRequest::network(&station.stream_url, self.options.network_caching_ms);
        if let Err(e) = engine.set_media(request).and_then(|()| engine.play()) {
            tracing::error!("Failed to play station '{}': {}", station.name, e);
            self.mode = PlaybackMode::None;
            self.radio = None;
            self.logical_playing = false;
            return Err(e.into());
        }

        tracing::info!("Playing web radio: {} - {}", station.name, station.stream_url);
        self.mode = PlaybackMode::WebRadio;
        self.radio = Some(station);
        self.current_index = None;
        self.failed_index = None;
        self.logical_playing = true;
        Ok(Played::Radio)
    }

    /// Play without an explicit index: resume paused media, otherwise
    /// continue the current context (station, current track or the first).
    pub fn resume_or_continue(&mut self) -> Result<Played, PlaybackError> {
        let Some(engine) = self.engine.as_mut() else {
            self.logical_playing = false;
            return Err(PlaybackError::EngineUnavailable);
        };

        match engine.state() {
            EngineState::Paused => {
                engine.play()?;
                self.logical_playing = true;
                Ok(Played::Resumed)
            }
            EngineState::Opening | EngineState::Playing => Ok(Played::Unchanged),
            _ => {
                if let (PlaybackMode::WebRadio, Some(station)) = (self.mode, self.radio.clone()) {
                    return self.play_web_radio(station);
                }
                match self.current_index {
                    Some(i) if i < self.playlist.len() => self.play_at(i),
                    _ if !self.playlist.is_empty() => self.play_at(0),
                    _ => Err(PlaybackError::NothingToPlay),
                }
            }
        }
    }

    /// Pause. Returns `Ok(false)` when the media cannot be paused.
    pub fn pause(&mut self) -> Result<bool, PlaybackError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(PlaybackError::EngineUnavailable);
        };
        if !engine.is_playing() {
            return Err(PlaybackError::NotPlaying);
        }
        if !engine.can_pause() {
            tracing::info!("Current media cannot be paused");
            return Ok(false);
        }
        engine.pause();
        self.logical_playing = false;
        Ok(true)
    }

    /// Set the volume, 0..=200.
    pub fn set_volume(&mut self, volume: i64) -> Result<u16, PlaybackError> {
        let volume = u16::try_from(volume)
            .ok()
            .filter(|v| *v <= MAX_VOLUME)
            .ok_or(PlaybackError::InvalidVolume(volume))?;
        let engine = self
            .engine
            .as_mut()
            .ok_or(PlaybackError::EngineUnavailable)?;
        engine.set_volume(volume);
        self.volume = volume;
        Ok(volume)
    }

    /// Seek within the current playlist track.
    pub fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError> {
        if self.current_track().is_none() {
            return Err(PlaybackError::NotInPlaylist);
        }
        let engine = self
            .engine
            .as_mut()
            .ok_or(PlaybackError::EngineUnavailable)?;
        if !matches!(
            engine.state(),
            EngineState::Opening | EngineState::Playing | EngineState::Paused
        ) {
            return Err(PlaybackError::NotPlaying);
        }
        if engine.length_ms().is_some_and(|len| len > 0 && position_ms > len) {
            return Err(PlaybackError::SeekOutOfRange { position_ms });
        }
        engine.set_time(position_ms);
        Ok(())
    }

    /// Stop everything and return to idle.
    pub fn stop(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.logical_playing = false;
    }

    /// Next pending engine event.
    pub fn poll_event(&mut self) -> Option<super::engine::EngineEvent> {
        self.engine.as_mut().and_then(|e| e.poll_event())
    }

    /// End of media. Radio streams are not restarted.
    pub fn handle_end_reached(&mut self) -> Result<Option<Played>, PlaybackError> {
        match self.mode {
            PlaybackMode::WebRadio => {
                tracing::info!("Web radio stream ended; not restarting");
                Ok(None)
            }
            PlaybackMode::Playlist => self.play_next().map(Some),
            PlaybackMode::None => {
                tracing::warn!("End of media with no active playback");
                Ok(None)
            }
        }
    }

    /// Engine error: stop playback. Returns whether a skip to the next
    /// track should follow.
    pub fn handle_engine_error(&mut self, message: &str) -> bool {
        tracing::error!("Playback error: {}", message);
        self.stop();
        self.mode == PlaybackMode::Playlist && !self.playlist.is_empty()
    }

    /// Reconcile with the engine and snapshot the state.
    pub fn status(&mut self) -> StatusSnapshot {
        let (engine_playing, position_ms, engine_length) = match self.engine.as_ref() {
            Some(engine) => (engine.is_playing(), engine.time_ms(), engine.length_ms()),
            None => (false, 0, None),
        };
        if self.logical_playing && !engine_playing {
            tracing::debug!("Engine stopped behind our back; clearing playing flag");
            self.logical_playing = false;
        }

        let (current_track, station, duration_ms) = match self.mode {
            PlaybackMode::WebRadio => {
                let track = self.radio.as_ref().map(|station| {
                    let mut track = Track::new(&station.stream_url, &station.name, false);
                    track.page_locator = Some(station.stream_url.clone());
                    track
                });
                (track, self.radio.clone(), 0)
            }
            PlaybackMode::Playlist => {
                let track = self.current_track().cloned();
                let duration = engine_length
                    .filter(|len| *len > 0)
                    .or_else(|| track.as_ref().map(|t| u64::from(t.duration_secs) * 1000))
                    .unwrap_or(0);
                (track, None, duration)
            }
            PlaybackMode::None => (None, None, 0),
        };

        StatusSnapshot {
            mode: self.mode,
            is_playing: self.logical_playing,
            current_index: match (self.mode, self.current_index) {
                (PlaybackMode::Playlist, Some(i)) => i as i64,
                _ => -1,
            },
            current_track,
            station,
            position_ms,
            duration_ms,
            volume: self.volume,
            playlist_length: self.playlist.len(),
        }
    }

    /// Append tracks. Returns the index of the first appended track.
    pub fn append(&mut self, tracks: impl IntoIterator<Item = Track>) -> Option<usize> {
        let first = self.playlist.len();
        self.playlist.extend(
            tracks
                .into_iter()
                .filter(|t| t.locator.is_some() || t.page_locator.is_some()),
        );
        (self.playlist.len() > first).then_some(first)
    }

    /// Remove the track at `index`, keeping the current index consistent.
    /// Removing the current track moves playback to the track now at the
    /// same position, or the new last one.
    pub fn remove_at(&mut self, index: usize) -> Result<Removed, PlaybackError> {
        let len = self.playlist.len();
        if index >= len {
            return Err(PlaybackError::IndexOutOfRange { index, len });
        }
        let track = self.playlist.remove(index);
        tracing::info!("Removed '{}' at {}", track.title, index);
        self.failed_index = None;

        let mut continued = None;
        let current_index = self.current_index;
        match current_index {
            Some(current) if current == index && self.mode == PlaybackMode::Playlist => {
                self.stop();
                self.current_index = None;
                if self.playlist.is_empty() {
                    self.mode = PlaybackMode::None;
                } else {
                    let next = index.min(self.playlist.len() - 1);
                    continued = Some(self.play_at(next));
                }
            }
            Some(current) if index < current => self.current_index = Some(current - 1),
            _ => {}
        }

        Ok(Removed { track, continued })
    }

    /// Apply a probed duration to the local track at `path`. Returns the
    /// track index when a duration actually changed.
    pub fn update_duration_for_path(&mut self, path: &std::path::Path, secs: u32) -> Option<usize> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let (index, track) = self.playlist.iter_mut().enumerate().find(|(_, t)| {
            t.local_path()
                .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
                .is_some_and(|p| p == target)
        })?;
        if track.duration_secs == secs {
            return None;
        }
        track.duration_secs = secs;
        tracing::info!("Duration of '{}' is now {}s", track.title, secs);
        Some(index)
    }

    /// Point the track with `identifier` at a downloaded local file.
    /// Returns its index.
    pub fn replace_with_local(&mut self, identifier: &str, downloaded: &Track) -> Option<usize> {
        let (index, track) = self
            .playlist
            .iter_mut()
            .enumerate()
            .find(|(_, t)| t.canonical_identifier() == Some(identifier))?;

        track.locator = downloaded.locator.clone();
        track.is_local = true;
        if track.duration_secs == 0 {
            track.duration_secs = downloaded.duration_secs;
        }
        if track.thumbnail.is_none() {
            track.thumbnail = downloaded.thumbnail.clone();
        }
        Some(index)
    }
}
