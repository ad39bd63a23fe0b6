//! JSON-file persistence for named lists.
//!
//! Loading never fails: a missing, empty or corrupt file yields an empty
//! list and the problem is only logged. Saving overwrites the whole file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::track::{RawTrack, Track};

pub const PLAYLIST_FILE: &str = "playlist.json";
pub const HISTORY_FILE: &str = "history.json";
pub const FAVORITES_FILE: &str = "favorites.json";
pub const WEBRADIOS_FILE: &str = "webradios.json";

/// Persistence errors. Only returned from saves.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Directory-backed store of JSON arrays.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of a named list.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Load the raw array elements of a named list.
    pub fn load_raw(&self, name: &str) -> Vec<Value> {
        let path = self.path(name);
        if !path.exists() {
            return Vec::new();
        }

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::error!("Failed to read {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        if contents.trim().is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(map)) if map.len() == 1 => match map.into_iter().next() {
                Some((key, Value::Array(items))) => {
                    tracing::warn!("Recovered list from key '{}' in {}", key, name);
                    items
                }
                _ => {
                    tracing::error!("{} does not contain a JSON list", name);
                    Vec::new()
                }
            },
            Ok(other) => {
                tracing::error!("{} does not contain a JSON list: {}", name, type_name(&other));
                Vec::new()
            }
            Err(e) => {
                tracing::error!("Malformed JSON in {}: {}", name, e);
                Vec::new()
            }
        }
    }

    /// Load a named list, passing every element through `normalize`.
    /// Elements the normalizer rejects are skipped and counted.
    pub fn load_with<T>(&self, name: &str, normalize: impl Fn(Value) -> Option<T>) -> Vec<T> {
        let raw = self.load_raw(name);
        let total = raw.len();
        let items: Vec<T> = raw.into_iter().filter_map(normalize).collect();
        if items.len() < total {
            tracing::warn!(
                "Skipped {} invalid entries while loading {}",
                total - items.len(),
                name
            );
        }
        items
    }

    /// Load a named list of plain serde records.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Vec<T> {
        self.load_with(name, |value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::debug!("Invalid entry in {}: {}", name, e);
                None
            }
        })
    }

    /// Load a named list of tracks through migration.
    pub fn load_tracks(&self, name: &str) -> Vec<Track> {
        self.load_with(name, |value| {
            Some(Track::normalize(RawTrack::from(value))).filter(Track::is_usable)
        })
    }

    /// Overwrite a named list.
    pub fn save<T: Serialize>(&self, name: &str, items: &[T]) -> Result<(), StoreError> {
        let path = self.path(name);
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let contents =
            serde_json::to_string_pretty(items).map_err(|source| StoreError::Encode {
                name: name.to_string(),
                source,
            })?;
        std::fs::write(&path, contents).map_err(|source| StoreError::Io { path, source })?;

        tracing::debug!("Saved {} entries to {}", items.len(), name);
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
