//! Recently-played history and favorites, both keyed by canonical identifier.

use super::track::Track;

/// Maximum number of history entries kept.
pub const MAX_HISTORY_SIZE: usize = 50;

/// Most-recent-first list of played tracks.
#[derive(Debug, Clone, Default)]
pub struct History {
    tracks: Vec<Track>,
}

impl History {
    pub fn new(mut tracks: Vec<Track>) -> Self {
        tracks.truncate(MAX_HISTORY_SIZE);
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Move (or insert) a track to the front. Returns false for tracks
    /// without any identifier, which cannot be recorded.
    pub fn record_played(&mut self, track: &Track) -> bool {
        let Some(id) = track.canonical_identifier() else {
            return false;
        };

        self.tracks
            .retain(|existing| existing.canonical_identifier() != Some(id));
        self.tracks.insert(0, track.clone());
        self.tracks.truncate(MAX_HISTORY_SIZE);
        true
    }
}

/// Outcome of adding a favorite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoriteAdded {
    Added,
    Duplicate,
    NoIdentifier,
}

/// Unbounded, deduplicated favorites list.
#[derive(Debug, Clone, Default)]
pub struct Favorites {
    tracks: Vec<Track>,
}

impl Favorites {
    pub fn new(tracks: Vec<Track>) -> Self {
        let mut favorites = Self::default();
        for track in tracks {
            favorites.add(&track);
        }
        favorites
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracks
            .iter()
            .any(|t| t.canonical_identifier() == Some(id))
    }

    pub fn add(&mut self, track: &Track) -> FavoriteAdded {
        let Some(id) = track.canonical_identifier() else {
            return FavoriteAdded::NoIdentifier;
        };
        if self.contains(id) {
            return FavoriteAdded::Duplicate;
        }
        self.tracks.push(track.clone());
        FavoriteAdded::Added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(n: usize) -> Track {
        Track::new(format!("https://example.com/{n}.mp3"), format!("Track {n}"), false)
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = History::default();
        for n in 0..(MAX_HISTORY_SIZE + 10) {
            history.record_played(&track(n));
        }

        assert_eq!(history.len(), MAX_HISTORY_SIZE);
        assert_eq!(history.tracks()[0].title, format!("Track {}", MAX_HISTORY_SIZE + 9));
    }

    #[test]
    fn test_replay_moves_to_front() {
        let mut history = History::default();
        history.record_played(&track(1));
        history.record_played(&track(2));
        history.record_played(&track(3));

        history.record_played(&track(1));

        assert_eq!(history.len(), 3);
        let titles: Vec<_> = history.tracks().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["Track 1", "Track 3", "Track 2"]);
    }

    #[test]
    fn test_history_dedup_uses_page_identifier() {
        let mut history = History::default();
        let mut a = track(1);
        a.page_locator = Some("https://www.youtube.com/watch?v=abcdefghijk".into());
        let mut b = track(2);
        b.page_locator = a.page_locator.clone();

        history.record_played(&a);
        history.record_played(&b);

        assert_eq!(history.len(), 1);
        assert_eq!(history.tracks()[0].title, "Track 2");
    }

    #[test]
    fn test_favorites_reject_duplicates() {
        let mut favorites = Favorites::default();
        assert_eq!(favorites.add(&track(1)), FavoriteAdded::Added);
        assert_eq!(favorites.add(&track(1)), FavoriteAdded::Duplicate);
        assert_eq!(favorites.add(&track(2)), FavoriteAdded::Added);
        assert_eq!(favorites.tracks().len(), 2);
    }

    #[test]
    fn test_favorites_loaded_with_duplicates_are_deduplicated() {
        let favorites = Favorites::new(vec![track(1), track(1), track(2)]);
        assert_eq!(favorites.tracks().len(), 2);
    }

    #[test]
    fn test_track_without_identifier_is_not_recorded() {
        let mut history = History::default();
        assert!(!history.record_played(&Track::invalid()));
        assert_eq!(
            Favorites::default().add(&Track::invalid()),
            FavoriteAdded::NoIdentifier
        );
    }
}
