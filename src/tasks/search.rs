//! Search/download worker and the local download cache.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Finalizer, TaskId, TaskState};
use crate::action::Action;
use crate::library::track::{Track, AUDIO_EXTENSIONS, UNKNOWN_TITLE};
use crate::provider::{ContentProvider, Progress, ProviderError, ResolveObserver, ResolveRequest};

/// What to do with the produced tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPurpose {
    /// Append to the playlist.
    Append,
    /// Point the playlist track with this identifier at the download.
    ReplaceLocal { identifier: String },
}

/// Forwards provider progress to the control thread and exposes the
/// task's cancellation token.
struct ChannelObserver {
    task: TaskId,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Action>,
}

impl ResolveObserver for ChannelObserver {
    fn progress(&mut self, progress: Progress) {
        tracing::debug!(task_id = self.task, "[{}] {}", progress.stage, progress.message);
        let _ = self.tx.send(Action::SearchProgress {
            task: self.task,
            progress,
        });
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Worker body, run on a blocking thread.
pub(super) fn run(
    provider: Arc<dyn ContentProvider>,
    request: ResolveRequest,
    purpose: SearchPurpose,
    task: TaskId,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Action>,
    mut finalizer: Finalizer,
) {
    let mut observer = ChannelObserver {
        task,
        token: token.clone(),
        tx: tx.clone(),
    };

    let result = provider
        .resolve(&request, &mut observer)
        .and_then(|entries| {
            if token.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            Ok(entries
                .into_iter()
                .filter_map(|entry| entry.into_track())
                .collect::<Vec<_>>())
        });

    match &result {
        Ok(tracks) => {
            tracing::info!(
                task_id = task,
                "Search '{}' produced {} tracks",
                request.query,
                tracks.len()
            );
            finalizer.set_state(TaskState::Completed);
        }
        Err(ProviderError::Cancelled) => {
            tracing::info!(task_id = task, "Search '{}' cancelled", request.query);
            finalizer.set_state(TaskState::Cancelled);
        }
        Err(e) => {
            tracing::error!(task_id = task, "Search '{}' failed: {}", request.query, e);
        }
    }

    let _ = tx.send(Action::SearchCompleted {
        task,
        purpose,
        result,
    });
}

/// Look for an earlier download of YouTube video `video_id`. With MP3
/// conversion only the `.mp3` counts; otherwise any audio extension does.
/// Metadata comes from the sibling `.info.json` when present.
pub fn cached_download(
    downloads_dir: &Path,
    video_id: &str,
    page_locator: &str,
    mp3_only: bool,
) -> Option<Track> {
    let stem = format!("youtube_{video_id}");
    let extensions: &[&str] = if mp3_only { &["mp3"] } else { AUDIO_EXTENSIONS };
    let file = extensions
        .iter()
        .map(|ext| downloads_dir.join(format!("{stem}.{ext}")))
        .find(|path| path.is_file())?;
    let file = std::fs::canonicalize(&file).unwrap_or(file);

    let info = read_info_json(&downloads_dir.join(format!("{stem}.info.json")));
    let title = info
        .as_ref()
        .and_then(|v| v.get("title"))
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .or_else(|| file.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

    let mut track = Track::new(file.to_string_lossy(), title, true);
    track.page_locator = Some(page_locator.to_string());
    if let Some(info) = info {
        track.thumbnail = info
            .get("thumbnails")
            .and_then(Value::as_array)
            .and_then(|thumbs| thumbs.last())
            .and_then(|t| t.get("url"))
            .or_else(|| info.get("thumbnail"))
            .and_then(Value::as_str)
            .map(str::to_string);
        track.duration_secs = info
            .get("duration")
            .and_then(Value::as_f64)
            .filter(|d| *d > 0.0)
            .map_or(0, |d| d as u32);
    }

    tracing::info!("Using cached download {}", file.display());
    Some(track)
}

fn read_info_json(path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}
