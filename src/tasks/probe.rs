//! Duration probe worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Finalizer, TaskId, TaskState};
use crate::action::Action;
use crate::player::probe::ParseState;
use crate::player::MediaProber;

pub(super) struct ProbeJob {
    pub prober: Arc<dyn MediaProber>,
    pub path: PathBuf,
    pub interval: Duration,
    pub max_polls: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Parsed(Option<u64>),
    Failed,
    TimedOut,
    Cancelled,
}

/// Poll a disposable probe until it is parsed, fails, times out or is
/// cancelled. The handle is dropped before anything is reported.
fn poll(job: &ProbeJob, token: &CancellationToken) -> Outcome {
    let mut handle = match job.prober.open(&job.path) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("{}", e);
            return Outcome::Failed;
        }
    };

    for _ in 0..job.max_polls {
        if token.is_cancelled() {
            return Outcome::Cancelled;
        }
        match handle.parse_state() {
            ParseState::Parsed => return Outcome::Parsed(handle.duration_ms()),
            ParseState::Failed => return Outcome::Failed,
            ParseState::Pending | ParseState::Parsing => std::thread::sleep(job.interval),
        }
    }
    Outcome::TimedOut
}

/// Worker body, run on a blocking thread.
pub(super) fn run(
    job: ProbeJob,
    task: TaskId,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Action>,
    mut finalizer: Finalizer,
) {
    match poll(&job, &token) {
        Outcome::Parsed(Some(duration_ms)) if duration_ms > 0 => {
            tracing::debug!(task_id = task, "{} lasts {} ms", job.path.display(), duration_ms);
            finalizer.set_state(TaskState::Completed);
            let _ = tx.send(Action::ProbeCompleted {
                path: job.path,
                duration_ms,
            });
        }
        Outcome::Parsed(_) => {
            tracing::info!(task_id = task, "No duration in {}", job.path.display());
            finalizer.set_state(TaskState::Completed);
        }
        Outcome::Cancelled => finalizer.set_state(TaskState::Cancelled),
        Outcome::TimedOut => {
            tracing::warn!(task_id = task, "Probe of {} timed out", job.path.display());
        }
        Outcome::Failed => {
            tracing::warn!(task_id = task, "Probe of {} failed", job.path.display());
        }
    }
}
