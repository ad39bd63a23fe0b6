//! Actions consumed by the control loop: user commands, the periodic tick
//! and completions reported by background tasks.

use std::path::PathBuf;

use crate::command::Command;
use crate::library::Track;
use crate::provider::{Progress, ProviderError};
use crate::tasks::{CoverError, SearchPurpose, TaskCategory, TaskId, TaskState};

/// Everything that can change application state.
#[derive(Debug)]
pub enum Action {
    // Application lifecycle
    Quit,
    Tick,

    /// A parsed line from the command surface
    Command(Command),
    /// A line that failed to parse
    InvalidCommand(crate::command::CommandError),

    // Search/download
    SearchProgress {
        task: TaskId,
        progress: Progress,
    },
    SearchCompleted {
        task: TaskId,
        purpose: SearchPurpose,
        result: Result<Vec<Track>, ProviderError>,
    },

    // Covers
    CoverCompleted {
        task: TaskId,
        result: Result<PathBuf, CoverError>,
    },

    // Duration probes
    ProbeCompleted {
        path: PathBuf,
        duration_ms: u64,
    },

    /// Sent exactly once per task, after any completion it produced
    TaskFinalized {
        id: TaskId,
        category: TaskCategory,
        target: String,
        state: TaskState,
    },

    /// Delayed continuation after an engine error
    SkipAfterError,
}
