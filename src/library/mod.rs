//! Persisted collections: playlist, history, favorites and web radios.

pub mod history;
pub mod stations;
pub mod store;
pub mod track;

use std::path::PathBuf;

pub use history::{FavoriteAdded, Favorites, History};
pub use stations::RadioStation;
pub use store::{Store, StoreError};
pub use track::Track;

use store::{FAVORITES_FILE, HISTORY_FILE, PLAYLIST_FILE, WEBRADIOS_FILE};

/// Directory holding cached cover images.
const COVERS_DIR: &str = "covers";

/// Directory holding downloaded audio.
const DOWNLOADS_DIR: &str = "downloads";

/// Owner of every persisted list except the live playlist, which belongs
/// to the playback session and is only loaded/saved through here.
#[derive(Debug)]
pub struct Library {
    store: Store,
    history: History,
    favorites: Favorites,
    stations: Vec<RadioStation>,
}

impl Library {
    /// Open the library in `dir`, loading every list.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let store = Store::new(dir);
        let history = History::new(store.load_tracks(HISTORY_FILE));
        let favorites = Favorites::new(store.load_tracks(FAVORITES_FILE));
        let stations = Self::load_stations(&store);

        tracing::info!(
            "Library opened at {}: {} history, {} favorites, {} stations",
            store.dir().display(),
            history.len(),
            favorites.tracks().len(),
            stations.len()
        );

        Self {
            store,
            history,
            favorites,
            stations,
        }
    }

    fn load_stations(store: &Store) -> Vec<RadioStation> {
        if !store.exists(WEBRADIOS_FILE) {
            let defaults = stations::default_stations();
            if let Err(e) = store.save(WEBRADIOS_FILE, &defaults) {
                tracing::error!("Failed to write default stations: {}", e);
            }
            return defaults;
        }
        stations::sanitize(store.load(WEBRADIOS_FILE))
    }

    pub fn covers_dir(&self) -> PathBuf {
        self.store.path(COVERS_DIR)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.store.path(DOWNLOADS_DIR)
    }

    pub fn load_playlist(&self) -> Vec<Track> {
        self.store.load_tracks(PLAYLIST_FILE)
    }

    pub fn save_playlist(&self, tracks: &[Track]) -> Result<(), StoreError> {
        self.store.save(PLAYLIST_FILE, tracks)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn favorites(&self) -> &Favorites {
        &self.favorites
    }

    pub fn stations(&self) -> &[RadioStation] {
        &self.stations
    }

    /// Record a played track and persist the history.
    pub fn record_played(&mut self, track: &Track) {
        if self.history.record_played(track) {
            if let Err(e) = self.store.save(HISTORY_FILE, self.history.tracks()) {
                tracing::error!("Failed to save history: {}", e);
            }
        }
    }

    /// Add a favorite and persist on success.
    pub fn add_favorite(&mut self, track: &Track) -> Result<FavoriteAdded, StoreError> {
        let added = self.favorites.add(track);
        if added == FavoriteAdded::Added {
            self.store.save(FAVORITES_FILE, self.favorites.tracks())?;
        }
        Ok(added)
    }

    /// Append a station and persist the list. Returns its index.
    pub fn add_station(&mut self, station: RadioStation) -> Result<usize, StoreError> {
        self.stations.push(station);
        self.store.save(WEBRADIOS_FILE, &self.stations)?;
        Ok(self.stations.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_stations_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(dir.path());

        assert_eq!(library.stations(), stations::default_stations().as_slice());
        assert!(dir.path().join(WEBRADIOS_FILE).exists());
    }

    #[test]
    fn test_corrupt_stations_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WEBRADIOS_FILE), "{not json").unwrap();

        let library = Library::open(dir.path());
        assert_eq!(library.stations().len(), 2);
    }

    #[test]
    fn test_added_station_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut library = Library::open(dir.path());

        let index = library
            .add_station(RadioStation::new("Mine", "http://mine/stream"))
            .unwrap();
        assert_eq!(index, 2);

        let reopened = Library::open(dir.path());
        assert_eq!(reopened.stations()[2].name, "Mine");
    }

    #[test]
    fn test_history_and_favorites_persist() {
        let dir = tempfile::tempdir().unwrap();
        let track = Track::new("https://example.com/a.mp3", "A", false);

        let mut library = Library::open(dir.path());
        library.record_played(&track);
        assert_eq!(library.add_favorite(&track).unwrap(), FavoriteAdded::Added);
        assert_eq!(library.add_favorite(&track).unwrap(), FavoriteAdded::Duplicate);

        let reopened = Library::open(dir.path());
        assert_eq!(reopened.history().len(), 1);
        assert_eq!(reopened.favorites().tracks().len(), 1);
    }
}
