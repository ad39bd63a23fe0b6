//! Replies written to stdout, one JSON object per line.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::ErrorKind;
use crate::library::{RadioStation, Track};
use crate::player::StatusSnapshot;
use crate::provider::Progress;
use crate::tasks::TaskSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// A user-visible message.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl Notice {
    pub fn new(level: Level, kind: Option<ErrorKind>, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackList {
    Playlist,
    History,
    Favorites,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Status {
        #[serde(flatten)]
        status: StatusSnapshot,
        /// Cached cover image; `None` shows the placeholder
        cover: Option<PathBuf>,
        searching: bool,
        search_progress: Option<Progress>,
        tasks: Vec<TaskSummary>,
    },
    Tracks {
        list: TrackList,
        tracks: Vec<Track>,
    },
    Stations {
        stations: Vec<RadioStation>,
    },
    Notice(Notice),
    Help {
        commands: Vec<&'static str>,
    },
}
