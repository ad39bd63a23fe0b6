//! Main application state and control loop logic.
//!
//! `App` lives on the control thread. It is the only owner of the session,
//! the library and the task slots; background work reaches it solely as
//! [`Action`]s from the channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Result;
use tokio::sync::mpsc;

use crate::action::Action;
use crate::command::{self, Command};
use crate::config::Config;
use crate::error::{Classify, ErrorKind};
use crate::library::{FavoriteAdded, Library, RadioStation, Track};
use crate::player::engine::{is_remote_locator, EngineEvent};
use crate::player::session::PlaybackMode;
use crate::player::{PlaybackError, Played, Session};
use crate::provider::query::{self, QueryKind};
use crate::provider::{DownloadOptions, Progress, ProviderError, ResolveKind, ResolveRequest};
use crate::reply::{Level, Notice, Reply, TrackList};
use crate::tasks::search::cached_download;
use crate::tasks::{CoverStart, SearchPurpose, TaskCategory, Tasks};

/// Main application state.
pub struct App {
    /// Whether the application should quit
    pub should_quit: bool,

    /// Application configuration
    config: Config,

    /// Playback session, owner of the playlist
    session: Session,

    /// History, favorites and stations
    library: Library,

    /// Background task slots
    tasks: Tasks,

    /// Current cover image, `None` for the placeholder
    cover: Option<PathBuf>,

    /// Latest progress of the running search
    search_progress: Option<Progress>,

    /// Consecutive tracks that failed to play; reset once audio flows
    failed_plays: usize,

    /// Replies waiting to be written
    replies: Vec<Reply>,

    /// Action sender for async operations
    action_tx: mpsc::UnboundedSender<Action>,
}

impl App {
    /// Create a new application instance.
    pub fn new(
        config: Config,
        session: Session,
        library: Library,
        tasks: Tasks,
        action_tx: mpsc::UnboundedSender<Action>,
    ) -> Self {
        Self {
            should_quit: false,
            config,
            session,
            library,
            tasks,
            cover: None,
            search_progress: None,
            failed_plays: 0,
            replies: Vec::new(),
            action_tx,
        }
    }

    /// Enter the initial playback state and probe local tracks with an
    /// unknown duration.
    pub fn init(&mut self) {
        let unknown: Vec<PathBuf> = self
            .session
            .playlist()
            .iter()
            .filter(|t| t.duration_secs == 0)
            .filter_map(Track::local_path)
            .collect();
        for path in unknown {
            self.start_probe(&path);
        }

        if let Some(result) = self.session.start(self.config.player.autoplay_on_start) {
            self.after_play(result);
        }
    }

    /// Replies produced since the last call.
    pub fn take_replies(&mut self) -> Vec<Reply> {
        std::mem::take(&mut self.replies)
    }

    /// Cancel background work, stop playback and persist the playlist.
    pub fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        self.tasks.cancel_all();
        self.session.stop();
        self.save_playlist();
    }

    /// Handle an action and update state.
    pub async fn handle_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Quit => {
                self.should_quit = true;
            }

            Action::Tick => {
                while let Some(event) = self.session.poll_event() {
                    self.handle_engine_event(event);
                }
                if self.session.is_engine_playing() {
                    self.failed_plays = 0;
                }
            }

            Action::Command(command) => self.handle_command(command),

            Action::InvalidCommand(e) => self.fail(&e),

            Action::SearchProgress { task, progress } => {
                tracing::trace!(task_id = task, "{:?}", progress);
                if self.tasks.is_searching() {
                    self.search_progress = Some(progress);
                }
            }

            Action::SearchCompleted {
                task,
                purpose,
                result,
            } => {
                tracing::debug!(task_id = task, "Applying search result");
                self.search_progress = None;
                self.apply_search_result(purpose, result);
            }

            Action::CoverCompleted { task, result } => {
                if !self.tasks.is_current_cover(task) {
                    tracing::debug!(task_id = task, "Ignoring superseded cover");
                    return Ok(());
                }
                match result {
                    Ok(path) => self.cover = Some(path),
                    Err(e) => {
                        tracing::warn!("Showing placeholder cover: {}", e);
                        self.cover = None;
                    }
                }
            }

            Action::ProbeCompleted { path, duration_ms } => {
                let secs = u32::try_from(duration_ms / 1000).unwrap_or(u32::MAX);
                if let Some(index) = self.session.update_duration_for_path(&path, secs) {
                    self.save_playlist();
                    if self.session.current_index() == Some(index) {
                        tracing::debug!("Duration of the current track is now {}s", secs);
                    }
                }
            }

            Action::TaskFinalized {
                id,
                category,
                target,
                state,
            } => {
                tracing::debug!(
                    task_id = id,
                    "{:?} task for {} ended: {:?}",
                    category,
                    target,
                    state
                );
                self.tasks.on_finalized(id, category, &target);
                if category == TaskCategory::SearchDownload && !self.tasks.is_searching() {
                    self.search_progress = None;
                }
            }

            Action::SkipAfterError => {
                if self.session.mode() == PlaybackMode::Playlist && self.session.is_idle() {
                    let result = self.session.play_next();
                    self.after_play(result);
                }
            }
        }

        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status => {
                let status = self.session.status();
                self.replies.push(Reply::Status {
                    status,
                    cover: self.cover.clone(),
                    searching: self.tasks.is_searching(),
                    search_progress: self.search_progress.clone(),
                    tasks: self.tasks.running(),
                });
            }
            Command::Playlist => self.reply_tracks(TrackList::Playlist),
            Command::History => self.reply_tracks(TrackList::History),
            Command::Favorites => self.reply_tracks(TrackList::Favorites),
            Command::Radios => self.replies.push(Reply::Stations {
                stations: self.library.stations().to_vec(),
            }),

            Command::Play(index) => {
                let result = match index {
                    Some(index) => self.session.play_at(index),
                    None => self.session.resume_or_continue(),
                };
                self.after_play(result);
            }
            Command::Pause => match self.session.pause() {
                Ok(true) => self.info("Paused"),
                Ok(false) => self.warn("The current stream cannot be paused"),
                Err(e) => self.fail(&e),
            },
            Command::Next => {
                let result = self.session.play_next();
                self.after_play(result);
            }
            Command::Previous => {
                let result = self.session.play_previous();
                self.after_play(result);
            }
            Command::Volume(volume) => match self.session.set_volume(volume) {
                Ok(volume) => self.info(format!("Volume {volume}")),
                Err(e) => self.fail(&e),
            },
            Command::Seek(secs) => match self.session.seek(secs.saturating_mul(1000)) {
                Ok(()) => self.info(format!("Seeked to {secs}s")),
                Err(e) => self.fail(&e),
            },

            Command::Radio(index) => match self.library.stations().get(index).cloned() {
                Some(station) => {
                    let result = self.session.play_web_radio(station);
                    self.after_play(result);
                }
                None => self.reject(format!("No station at index {index}")),
            },
            Command::AddRadio { url, name } => self.add_radio(url, name),

            Command::Import(paths) => self.import(&paths),
            Command::Search {
                query,
                results,
                download,
            } => self.search(&query, results, download),
            Command::Download(index) => self.download(index),
            Command::Remove(index) => self.remove(index),

            Command::Favorite => self.add_favorite(),
            Command::QueueHistory(index) => match self.library.history().get(index).cloned() {
                Some(track) => self.add_tracks(vec![track], "Queued"),
                None => self.reject(format!("No history entry at index {index}")),
            },
            Command::QueueFavorite(index) => match self.library.favorites().get(index).cloned() {
                Some(track) => self.add_tracks(vec![track], "Queued"),
                None => self.reject(format!("No favorite at index {index}")),
            },

            Command::Cancel => {
                if self.tasks.cancel_search() {
                    self.info("Cancelling search");
                } else {
                    self.info("No search is running");
                }
            }
            Command::Help => self.replies.push(Reply::Help {
                commands: command::HELP.to_vec(),
            }),
            Command::Quit => self.should_quit = true,
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::EndReached => match self.session.handle_end_reached() {
                Ok(Some(played)) => self.after_play(Ok(played)),
                Ok(None) => {}
                Err(e) => self.after_play(Err(e)),
            },
            EngineEvent::Error(message) => {
                let skip = self.session.handle_engine_error(&message);
                self.tasks.cancel_cover();
                self.cover = None;
                self.notice(
                    Level::Error,
                    Some(ErrorKind::Transient),
                    format!("Playback error: {message}"),
                );

                if skip {
                    self.schedule_skip();
                }
            }
        }
    }

    /// Queue a skip past a track that failed, giving up once every
    /// track in the playlist failed in a row.
    fn schedule_skip(&mut self) {
        self.failed_plays += 1;
        if self.failed_plays >= self.session.playlist().len() {
            self.failed_plays = 0;
            self.session.stop();
            self.warn("No track in the playlist could be played; stopping");
            return;
        }

        let tx = self.action_tx.clone();
        let delay = Duration::from_millis(self.config.player.error_skip_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Action::SkipAfterError);
        });
    }

    /// Side effects of a play request: history, cover and a notice.
    fn after_play(&mut self, result: Result<Played, PlaybackError>) {
        match result {
            Ok(Played::Started(index)) => {
                if let Some(track) = self.session.playlist().get(index).cloned() {
                    self.library.record_played(&track);
                    self.load_cover(track.thumbnail.as_deref());
                    self.info(format!("Playing {}: {}", index, track.title));
                }
            }
            Ok(Played::Radio) => {
                self.load_cover(None);
                let name = self.session.radio().map(|station| station.name.clone());
                if let Some(name) = name {
                    self.info(format!("Playing web radio {name}"));
                }
            }
            Ok(Played::Resumed) => self.info("Resumed"),
            Ok(Played::Unchanged) => self.info("Already playing"),
            Err(e) => {
                let recoverable = e.kind() != ErrorKind::Validation
                    && !matches!(e, PlaybackError::EngineUnavailable);
                if e.kind() != ErrorKind::Validation {
                    self.load_cover(None);
                }
                self.fail(&e);
                if recoverable && self.session.mode() == PlaybackMode::Playlist {
                    self.schedule_skip();
                }
            }
        }
    }

    fn load_cover(&mut self, thumbnail: Option<&str>) {
        match thumbnail {
            Some(locator) if is_remote_locator(locator) => {
                match self.tasks.start_cover_fetch(locator) {
                    CoverStart::CacheHit(path) => self.cover = Some(path),
                    CoverStart::Started(_) => self.cover = None,
                }
            }
            Some(path) if Path::new(path).is_file() => {
                self.tasks.cancel_cover();
                self.cover = Some(PathBuf::from(path));
            }
            _ => {
                self.tasks.cancel_cover();
                self.cover = None;
            }
        }
    }

    fn add_radio(&mut self, url: String, name: String) {
        if !is_remote_locator(&url) {
            self.reject("Station URL must start with http:// or https://");
            return;
        }
        let station = RadioStation::new(name, url);
        match self.library.add_station(station.clone()) {
            Ok(index) => self.info(format!("Saved station {index}: {}", station.name)),
            Err(e) => self.notice(Level::Error, None, e.to_string()),
        }
        let result = self.session.play_web_radio(station);
        self.after_play(result);
    }

    fn import(&mut self, paths: &[PathBuf]) {
        let mut tracks = Vec::new();
        let mut skipped = Vec::new();
        for path in paths {
            match Track::from_local_file(path) {
                Some(track) => tracks.push(track),
                None => skipped.push(path.display().to_string()),
            }
        }

        if !skipped.is_empty() {
            self.warn(format!(
                "Skipped missing or non-audio files: {}",
                skipped.join(", ")
            ));
        }
        if tracks.is_empty() {
            self.reject("No files to import");
            return;
        }
        self.add_tracks(tracks, "Imported");
    }

    /// Append to the playlist, persist, probe unknown local durations and
    /// start playing the first new track when idle.
    fn add_tracks(&mut self, tracks: Vec<Track>, verb: &str) {
        let Some(first) = self.session.append(tracks) else {
            self.warn("Nothing to add");
            return;
        };
        self.save_playlist();

        let added = &self.session.playlist()[first..];
        let count = added.len();
        let unknown: Vec<PathBuf> = added
            .iter()
            .filter(|t| t.duration_secs == 0)
            .filter_map(Track::local_path)
            .collect();
        for path in unknown {
            self.start_probe(&path);
        }

        self.info(format!("{verb} {count} track(s)"));
        if self.session.has_engine() && self.session.is_idle() {
            let result = self.session.play_at(first);
            self.after_play(result);
        }
    }

    fn start_probe(&mut self, path: &Path) {
        if self.tasks.is_probing(path) {
            return;
        }
        if let Err(e) = self.tasks.start_probe(path) {
            tracing::debug!("{}", e);
        }
    }

    fn search(&mut self, query: &str, results: Option<usize>, download: bool) {
        let query = query.trim();
        if query.is_empty() {
            self.reject("Empty search query");
            return;
        }
        if self.tasks.is_searching() {
            self.fail(&crate::tasks::TaskError::SearchBusy);
            return;
        }

        let download = download || self.config.search.download_audio;
        let downloads_dir = self.library.downloads_dir();
        let kind = query::classify(query);

        if kind == QueryKind::Single {
            if let Some(id) = query::youtube_video_id(query) {
                let mp3_only = self.tasks.can_convert_audio();
                if let Some(track) = cached_download(&downloads_dir, id, query, mp3_only) {
                    self.add_tracks(vec![track], "Added cached");
                    return;
                }
            }
        }

        let (kind, download) = match kind {
            QueryKind::Text => {
                if download {
                    self.warn("Only URLs can be downloaded; searching without download");
                }
                let limit = results.unwrap_or(self.config.search.default_results).max(1);
                (ResolveKind::Search { limit }, false)
            }
            QueryKind::Single => (ResolveKind::Single, download),
            QueryKind::Playlist => {
                let flat = !(download && query::youtube_video_id(query).is_some());
                (ResolveKind::Playlist { flat }, download)
            }
        };

        let request = ResolveRequest {
            query: query.to_string(),
            kind,
            download: download.then(|| DownloadOptions {
                output_dir: downloads_dir,
                convert_to_mp3: self.tasks.can_convert_audio(),
            }),
        };
        match self.tasks.start_search(request, SearchPurpose::Append) {
            Ok(_) => {
                self.search_progress = None;
                self.info(format!("Searching: {query}"));
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Download an existing playlist track from its YouTube page.
    fn download(&mut self, index: usize) {
        let Some(track) = self.session.playlist().get(index).cloned() else {
            self.reject(format!("No track at index {index}"));
            return;
        };
        if track.is_local {
            self.info(format!("'{}' is already a local file", track.title));
            return;
        }
        let Some(identifier) = track.canonical_identifier().map(str::to_string) else {
            self.reject(format!("'{}' has no page to download from", track.title));
            return;
        };
        let Some(video_id) = query::youtube_video_id(&identifier).map(str::to_string) else {
            self.reject("Only YouTube tracks can be downloaded");
            return;
        };
        if self.tasks.is_searching() {
            self.fail(&crate::tasks::TaskError::SearchBusy);
            return;
        }

        let downloads_dir = self.library.downloads_dir();
        let convert = self.tasks.can_convert_audio();
        if let Some(cached) = cached_download(&downloads_dir, &video_id, &identifier, convert) {
            self.apply_download(&identifier, cached);
            return;
        }

        let request = ResolveRequest {
            query: query::youtube_watch_url(&video_id),
            kind: ResolveKind::Single,
            download: Some(DownloadOptions {
                output_dir: downloads_dir,
                convert_to_mp3: convert,
            }),
        };
        match self
            .tasks
            .start_search(request, SearchPurpose::ReplaceLocal { identifier })
        {
            Ok(_) => self.info(format!("Downloading '{}'", track.title)),
            Err(e) => self.fail(&e),
        }
    }

    fn apply_search_result(
        &mut self,
        purpose: SearchPurpose,
        result: std::result::Result<Vec<Track>, ProviderError>,
    ) {
        match (purpose, result) {
            (_, Err(ProviderError::Cancelled)) => self.info("Search cancelled"),
            (_, Err(e)) => self.fail(&e),
            (SearchPurpose::Append, Ok(tracks)) if tracks.is_empty() => {
                self.warn("No results");
            }
            (SearchPurpose::Append, Ok(tracks)) => self.add_tracks(tracks, "Added"),
            (SearchPurpose::ReplaceLocal { identifier }, Ok(tracks)) => {
                match tracks.into_iter().find(|t| t.is_local) {
                    Some(downloaded) => self.apply_download(&identifier, downloaded),
                    None => self.warn("The download produced no local file"),
                }
            }
        }
    }

    fn apply_download(&mut self, identifier: &str, downloaded: Track) {
        let Some(index) = self.session.replace_with_local(identifier, &downloaded) else {
            self.warn("The downloaded track is no longer in the playlist");
            return;
        };
        self.save_playlist();

        let track = self.session.playlist()[index].clone();
        if track.duration_secs == 0 {
            if let Some(path) = track.local_path() {
                self.start_probe(&path);
            }
        }
        self.info(format!("Downloaded '{}'", track.title));
    }

    fn remove(&mut self, index: usize) {
        match self.session.remove_at(index) {
            Ok(removed) => {
                self.save_playlist();
                self.info(format!("Removed '{}'", removed.track.title));
                if let Some(result) = removed.continued {
                    self.after_play(result);
                } else if self.session.mode() == PlaybackMode::None {
                    self.load_cover(None);
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    fn add_favorite(&mut self) {
        let Some(track) = self.session.current_track().cloned() else {
            self.fail(&PlaybackError::NotPlaying);
            return;
        };
        match self.library.add_favorite(&track) {
            Ok(FavoriteAdded::Added) => self.info(format!("Added '{}' to favorites", track.title)),
            Ok(FavoriteAdded::Duplicate) => {
                self.info(format!("'{}' is already a favorite", track.title))
            }
            Ok(FavoriteAdded::NoIdentifier) => self.warn("This track cannot be saved"),
            Err(e) => self.notice(Level::Error, None, e.to_string()),
        }
    }

    fn reply_tracks(&mut self, list: TrackList) {
        let tracks = match list {
            TrackList::Playlist => self.session.playlist().to_vec(),
            TrackList::History => self.library.history().tracks().to_vec(),
            TrackList::Favorites => self.library.favorites().tracks().to_vec(),
        };
        self.replies.push(Reply::Tracks { list, tracks });
    }

    fn save_playlist(&mut self) {
        if let Err(e) = self.library.save_playlist(self.session.playlist()) {
            tracing::error!("Failed to save playlist: {}", e);
            self.notice(Level::Error, None, format!("Failed to save playlist: {e}"));
        }
    }

    fn notice(&mut self, level: Level, kind: Option<ErrorKind>, message: impl Into<String>) {
        let notice = Notice::new(level, kind, message);
        match level {
            Level::Info => tracing::info!("{}", notice.message),
            Level::Warning => tracing::warn!("{}", notice.message),
            Level::Error => tracing::error!("{}", notice.message),
        }
        self.replies.push(Reply::Notice(notice));
    }

    fn info(&mut self, message: impl Into<String>) {
        self.notice(Level::Info, None, message);
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.notice(Level::Warning, None, message);
    }

    /// Bad input: nothing changed.
    fn reject(&mut self, message: impl Into<String>) {
        self.notice(Level::Error, Some(ErrorKind::Validation), message);
    }

    fn fail<E: Classify + std::fmt::Display>(&mut self, error: &E) {
        self.notice(Level::Error, Some(error.kind()), error.to_string());
    }
}
