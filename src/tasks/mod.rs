//! Background task orchestration.
//!
//! Search/download and cover fetches are single-flight; duration probes
//! run concurrently, one per file. Workers never touch shared state: they
//! report through the action channel and the control thread applies the
//! results. Every task carries its own [`Finalizer`], which reports the
//! task's end exactly once whatever path the worker takes.

pub mod cover;
pub mod probe;
pub mod search;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::error::{Classify, ErrorKind};
use crate::player::MediaProber;
use crate::provider::{ContentProvider, ResolveRequest};

pub use cover::CoverError;
pub use search::SearchPurpose;

/// Identifier of one task instance.
pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    SearchDownload,
    CoverFetch,
    DurationProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("A search or download is already running")]
    SearchBusy,

    #[error("{} is already being probed", .0.display())]
    AlreadyProbing(PathBuf),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

impl Classify for TaskError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::SearchBusy | Self::AlreadyProbing(_) => ErrorKind::Validation,
            Self::Http(_) => ErrorKind::ResourceUnavailable,
        }
    }
}

/// The control thread's reference to a running task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
    pub category: TaskCategory,
    pub target: String,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Serializable view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub category: TaskCategory,
    pub target: String,
    pub state: TaskState,
}

/// Sends [`Action::TaskFinalized`] when dropped. Owned by the worker, so
/// it fires on success, failure, cancellation and panic alike.
pub(crate) struct Finalizer {
    id: TaskId,
    category: TaskCategory,
    target: String,
    state: TaskState,
    tx: mpsc::UnboundedSender<Action>,
}

impl Finalizer {
    fn new(handle: &TaskHandle, tx: mpsc::UnboundedSender<Action>) -> Self {
        Self {
            id: handle.id,
            category: handle.category,
            target: handle.target.clone(),
            state: TaskState::Failed,
            tx,
        }
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        let _ = self.tx.send(Action::TaskFinalized {
            id: self.id,
            category: self.category,
            target: std::mem::take(&mut self.target),
            state: self.state,
        });
    }
}

/// Knobs for the workers.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub covers_dir: PathBuf,
    pub cover_timeout: Duration,
    pub user_agent: String,
    pub probe_interval: Duration,
    pub probe_max_polls: u32,
}

/// Result of asking for a cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverStart {
    /// Already cached; no task was started.
    CacheHit(PathBuf),
    Started(TaskId),
}

/// Owner of the per-category task slots.
pub struct Tasks {
    action_tx: mpsc::UnboundedSender<Action>,
    provider: Arc<dyn ContentProvider>,
    prober: Arc<dyn MediaProber>,
    http: reqwest::Client,
    settings: TaskSettings,
    next_id: AtomicU64,
    search: Option<TaskHandle>,
    cover: Option<TaskHandle>,
    probes: HashMap<PathBuf, TaskHandle>,
}

impl Tasks {
    pub fn new(
        action_tx: mpsc::UnboundedSender<Action>,
        provider: Arc<dyn ContentProvider>,
        prober: Arc<dyn MediaProber>,
        settings: TaskSettings,
    ) -> Result<Self, TaskError> {
        let http = reqwest::Client::builder()
            .timeout(settings.cover_timeout)
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self {
            action_tx,
            provider,
            prober,
            http,
            settings,
            next_id: AtomicU64::new(1),
            search: None,
            cover: None,
            probes: HashMap::new(),
        })
    }

    pub fn can_convert_audio(&self) -> bool {
        self.provider.can_convert_audio()
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    pub fn is_current_cover(&self, id: TaskId) -> bool {
        self.cover.as_ref().is_some_and(|h| h.id == id)
    }

    pub fn is_probing(&self, path: &Path) -> bool {
        self.probes.contains_key(path)
    }

    /// Every task whose slot is still held.
    pub fn running(&self) -> Vec<TaskSummary> {
        let mut running: Vec<TaskSummary> = self
            .search
            .iter()
            .chain(self.cover.iter())
            .chain(self.probes.values())
            .map(|h| TaskSummary {
                id: h.id,
                category: h.category,
                target: h.target.clone(),
                state: TaskState::Running,
            })
            .collect();
        running.sort_by_key(|t| t.id);
        running
    }

    fn handle(&self, category: TaskCategory, target: impl Into<String>) -> TaskHandle {
        TaskHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            category,
            target: target.into(),
            token: CancellationToken::new(),
        }
    }

    /// Start a search or download. Rejected while one is running.
    pub fn start_search(
        &mut self,
        request: ResolveRequest,
        purpose: SearchPurpose,
    ) -> Result<TaskId, TaskError> {
        if self.search.is_some() {
            return Err(TaskError::SearchBusy);
        }

        let handle = self.handle(TaskCategory::SearchDownload, request.query.clone());
        let id = handle.id;
        tracing::info!(task_id = id, "Starting search: {}", request.query);

        let finalizer = Finalizer::new(&handle, self.action_tx.clone());
        let provider = Arc::clone(&self.provider);
        let token = handle.token.clone();
        let tx = self.action_tx.clone();
        tokio::task::spawn_blocking(move || {
            search::run(provider, request, purpose, id, token, tx, finalizer);
        });

        self.search = Some(handle);
        Ok(id)
    }

    /// Ask for the cover at `locator`. A newer request cancels the
    /// running fetch.
    pub fn start_cover_fetch(&mut self, locator: &str) -> CoverStart {
        if let Some(previous) = self.cover.take() {
            tracing::debug!(task_id = previous.id, "Superseding cover fetch");
            previous.cancel();
        }

        let dest = cover::cache_path(&self.settings.covers_dir, locator);
        if dest.is_file() {
            tracing::debug!("Cover cache hit for {}", locator);
            return CoverStart::CacheHit(dest);
        }

        let handle = self.handle(TaskCategory::CoverFetch, locator);
        let id = handle.id;
        tracing::info!(task_id = id, "Fetching cover {}", locator);

        let mut finalizer = Finalizer::new(&handle, self.action_tx.clone());
        let client = self.http.clone();
        let url = locator.to_string();
        let token = handle.token.clone();
        let tx = self.action_tx.clone();
        tokio::spawn(async move {
            let result = cover::fetch(&client, &url, &dest, &token).await;
            finalizer.set_state(match &result {
                Ok(_) => TaskState::Completed,
                Err(CoverError::Cancelled) => TaskState::Cancelled,
                Err(_) => TaskState::Failed,
            });
            if !matches!(result, Err(CoverError::Cancelled)) {
                let _ = tx.send(Action::CoverCompleted { task: id, result });
            }
        });

        self.cover = Some(handle);
        CoverStart::Started(id)
    }

    /// Probe the duration of a local file. One probe per path.
    pub fn start_probe(&mut self, path: &Path) -> Result<TaskId, TaskError> {
        if self.probes.contains_key(path) {
            return Err(TaskError::AlreadyProbing(path.to_path_buf()));
        }

        let handle = self.handle(TaskCategory::DurationProbe, path.to_string_lossy());
        let id = handle.id;
        tracing::debug!(task_id = id, "Probing {}", path.display());

        let finalizer = Finalizer::new(&handle, self.action_tx.clone());
        let job = probe::ProbeJob {
            prober: Arc::clone(&self.prober),
            path: path.to_path_buf(),
            interval: self.settings.probe_interval,
            max_polls: self.settings.probe_max_polls,
        };
        let token = handle.token.clone();
        let tx = self.action_tx.clone();
        tokio::task::spawn_blocking(move || {
            probe::run(job, id, token, tx, finalizer);
        });

        self.probes.insert(path.to_path_buf(), handle);
        Ok(id)
    }

    /// Request cancellation of the running search. The slot stays taken
    /// until the worker finalizes.
    pub fn cancel_search(&self) -> bool {
        match &self.search {
            Some(handle) => {
                tracing::info!(task_id = handle.id, "Cancelling search");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop interest in the running cover fetch, if any.
    pub fn cancel_cover(&mut self) {
        if let Some(handle) = self.cover.take() {
            handle.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for handle in self
            .search
            .iter()
            .chain(self.cover.iter())
            .chain(self.probes.values())
        {
            handle.cancel();
        }
    }

    /// Release the slot of a finished task, unless a newer task already
    /// holds it.
    pub fn on_finalized(&mut self, id: TaskId, category: TaskCategory, target: &str) {
        let slot = match category {
            TaskCategory::SearchDownload => &mut self.search,
            TaskCategory::CoverFetch => &mut self.cover,
            TaskCategory::DurationProbe => {
                // Matched by id: the target is a lossy rendering of the path
                self.probes.retain(|_, h| h.id != id);
                return;
            }
        };
        if slot.as_ref().is_some_and(|h| h.id == id) {
            *slot = None;
        } else {
            tracing::debug!(task_id = id, "Stale {:?} task for {} finished", category, target);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::player::probe::testing::FakeProber;
    use crate::provider::testing::FakeProvider;
    use crate::provider::{ProviderEntry, ProviderError, ResolveKind};

    fn settings(covers_dir: &Path) -> TaskSettings {
        TaskSettings {
            covers_dir: covers_dir.to_path_buf(),
            cover_timeout: Duration::from_secs(2),
            user_agent: "jukebox-test".into(),
            probe_interval: Duration::from_millis(2),
            probe_max_polls: 5,
        }
    }

    fn tasks_with(
        provider: FakeProvider,
        prober: FakeProber,
        covers_dir: &Path,
    ) -> (Tasks, UnboundedReceiver<Action>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = Tasks::new(tx, Arc::new(provider), Arc::new(prober), settings(covers_dir))
            .unwrap();
        (tasks, rx)
    }

    fn request(query: &str) -> ResolveRequest {
        ResolveRequest {
            query: query.into(),
            kind: ResolveKind::Search { limit: 3 },
            download: None,
        }
    }

    fn entry(n: usize) -> ProviderEntry {
        ProviderEntry {
            title: Some(format!("Result {n}")),
            stream_url: Some(format!("https://cdn.example.com/{n}.m4a")),
            ..Default::default()
        }
    }

    /// Receive until the finalization of `id`, returning everything seen.
    async fn until_finalized(rx: &mut UnboundedReceiver<Action>, id: TaskId) -> Vec<Action> {
        let mut seen = Vec::new();
        loop {
            let action = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for task")
                .expect("channel closed");
            let done = matches!(action, Action::TaskFinalized { id: done, .. } if done == id);
            seen.push(action);
            if done {
                return seen;
            }
        }
    }

    fn finalized_state(actions: &[Action]) -> TaskState {
        match actions.last() {
            Some(Action::TaskFinalized { state, .. }) => *state,
            other => panic!("expected finalization, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_search_is_rejected_until_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider {
            delay: Duration::from_millis(50),
            ..FakeProvider::returning(vec![entry(0), entry(1)])
        };
        let (mut tasks, mut rx) = tasks_with(provider, FakeProber::parsed(1000), dir.path());

        let id = tasks.start_search(request("first"), SearchPurpose::Append).unwrap();
        assert!(tasks.is_searching());
        assert!(matches!(
            tasks.start_search(request("second"), SearchPurpose::Append),
            Err(TaskError::SearchBusy)
        ));

        let actions = until_finalized(&mut rx, id).await;
        let completed = actions.iter().find_map(|a| match a {
            Action::SearchCompleted { task, result, .. } if *task == id => Some(result),
            _ => None,
        });
        assert_eq!(completed.unwrap().as_ref().unwrap().len(), 2);
        assert_eq!(finalized_state(&actions), TaskState::Completed);

        tasks.on_finalized(id, TaskCategory::SearchDownload, "first");
        assert!(!tasks.is_searching());
        assert!(tasks.start_search(request("second"), SearchPurpose::Append).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_search_finalizes_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider {
            delay: Duration::from_secs(10),
            ..FakeProvider::returning(vec![entry(0)])
        };
        let (mut tasks, mut rx) = tasks_with(provider, FakeProber::parsed(1000), dir.path());

        let id = tasks.start_search(request("slow"), SearchPurpose::Append).unwrap();
        assert!(tasks.cancel_search());

        let actions = until_finalized(&mut rx, id).await;
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SearchCompleted { result: Err(ProviderError::Cancelled), .. }
        )));
        assert_eq!(finalized_state(&actions), TaskState::Cancelled);
        let finalizations = actions
            .iter()
            .filter(|a| matches!(a, Action::TaskFinalized { .. }))
            .count();
        assert_eq!(finalizations, 1);
    }

    #[tokio::test]
    async fn test_failed_search_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider {
            fail_with: Some("HTTP Error 403".into()),
            ..Default::default()
        };
        let (mut tasks, mut rx) = tasks_with(provider, FakeProber::parsed(1000), dir.path());

        let id = tasks.start_search(request("blocked"), SearchPurpose::Append).unwrap();
        let actions = until_finalized(&mut rx, id).await;
        assert_eq!(finalized_state(&actions), TaskState::Failed);
    }

    struct PanickingProvider;

    impl ContentProvider for PanickingProvider {
        fn resolve(
            &self,
            _request: &ResolveRequest,
            _observer: &mut dyn crate::provider::ResolveObserver,
        ) -> Result<Vec<ProviderEntry>, ProviderError> {
            panic!("extractor crashed");
        }

        fn can_convert_audio(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_panicking_search_still_releases_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::new(
            tx,
            Arc::new(PanickingProvider),
            Arc::new(FakeProber::parsed(0)),
            settings(dir.path()),
        )
        .unwrap();

        let id = tasks.start_search(request("boom"), SearchPurpose::Append).unwrap();
        let actions = until_finalized(&mut rx, id).await;
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SearchCompleted { .. })));
        assert_eq!(finalized_state(&actions), TaskState::Failed);

        tasks.on_finalized(id, TaskCategory::SearchDownload, "boom");
        assert!(!tasks.is_searching());
    }

    #[tokio::test]
    async fn test_probe_reports_duration_and_releases_handle() {
        let dir = tempfile::tempdir().unwrap();
        let prober = FakeProber::parsed(183_000);
        let (mut tasks, mut rx) = tasks_with(FakeProvider::default(), prober.clone(), dir.path());
        let path = dir.path().join("song.mp3");

        let id = tasks.start_probe(&path).unwrap();
        assert!(matches!(
            tasks.start_probe(&path),
            Err(TaskError::AlreadyProbing(_))
        ));

        let actions = until_finalized(&mut rx, id).await;
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ProbeCompleted { path: p, duration_ms: 183_000 } if *p == path
        )));
        assert_eq!(finalized_state(&actions), TaskState::Completed);
        assert_eq!(prober.live_handles(), 0);

        tasks.on_finalized(id, TaskCategory::DurationProbe, &path.to_string_lossy());
        assert!(!tasks.is_probing(&path));
    }

    #[tokio::test]
    async fn test_probes_for_different_paths_run_together() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tasks, _rx) =
            tasks_with(FakeProvider::default(), FakeProber::stuck(), dir.path());

        let a = tasks.start_probe(&dir.path().join("a.mp3")).unwrap();
        let b = tasks.start_probe(&dir.path().join("b.mp3")).unwrap();
        let running = tasks.running();
        assert_eq!(
            running.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a, b]
        );
        assert!(running
            .iter()
            .all(|t| t.category == TaskCategory::DurationProbe && t.state == TaskState::Running));
        tasks.cancel_all();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_slots_for_non_utf8_paths_stay_apart() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let (mut tasks, _rx) =
            tasks_with(FakeProvider::default(), FakeProber::stuck(), dir.path());
        let a = dir.path().join(OsStr::from_bytes(b"song\xff.mp3"));
        let b = dir.path().join(OsStr::from_bytes(b"song\xfe.mp3"));
        assert_eq!(a.to_string_lossy(), b.to_string_lossy());

        let first = tasks.start_probe(&a).unwrap();
        tasks.start_probe(&b).unwrap();
        assert!(tasks.is_probing(&a) && tasks.is_probing(&b));

        tasks.on_finalized(first, TaskCategory::DurationProbe, &a.to_string_lossy());
        assert!(!tasks.is_probing(&a));
        assert!(tasks.is_probing(&b));
        tasks.cancel_all();
    }

    #[tokio::test]
    async fn test_cancelled_probe_reports_nothing_and_releases_handle() {
        let dir = tempfile::tempdir().unwrap();
        let prober = FakeProber::stuck();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::new(
            tx,
            Arc::new(FakeProvider::default()),
            Arc::new(prober.clone()),
            TaskSettings {
                probe_max_polls: 100_000,
                ..settings(dir.path())
            },
        )
        .unwrap();

        let id = tasks.start_probe(&dir.path().join("stuck.mp3")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tasks.cancel_all();

        let actions = until_finalized(&mut rx, id).await;
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ProbeCompleted { .. })));
        assert_eq!(finalized_state(&actions), TaskState::Cancelled);
        assert_eq!(prober.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_probe_gives_up_after_max_polls() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tasks, mut rx) =
            tasks_with(FakeProvider::default(), FakeProber::stuck(), dir.path());

        let id = tasks.start_probe(&dir.path().join("slow.mp3")).unwrap();
        let actions = until_finalized(&mut rx, id).await;
        assert_eq!(finalized_state(&actions), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_cached_cover_needs_no_task() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tasks, mut rx) =
            tasks_with(FakeProvider::default(), FakeProber::parsed(0), dir.path());
        let locator = "https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg";
        let cached = cover::cache_path(dir.path(), locator);
        std::fs::write(&cached, b"\xff\xd8\xff\xe0cached").unwrap();

        assert_eq!(tasks.start_cover_fetch(locator), CoverStart::CacheHit(cached));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_cover_fetch_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tasks, mut rx) =
            tasks_with(FakeProvider::default(), FakeProber::parsed(0), dir.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/cover.jpg", listener.local_addr().unwrap());
        tokio::spawn(async move {
            // Accept and never answer
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let CoverStart::Started(id) = tasks.start_cover_fetch(&url) else {
            panic!("expected a fetch task");
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tasks.cancel_cover();

        let actions = until_finalized(&mut rx, id).await;
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::CoverCompleted { .. })));
        assert_eq!(finalized_state(&actions), TaskState::Cancelled);
        assert!(!cover::cache_path(dir.path(), &url).exists());
    }

    #[tokio::test]
    async fn test_stale_cover_finalization_keeps_newer_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tasks, _rx) =
            tasks_with(FakeProvider::default(), FakeProber::parsed(0), dir.path());

        let CoverStart::Started(first) = tasks.start_cover_fetch("http://127.0.0.1:9/a.jpg")
        else {
            panic!("expected a fetch task");
        };
        let CoverStart::Started(second) = tasks.start_cover_fetch("http://127.0.0.1:9/b.jpg")
        else {
            panic!("expected a fetch task");
        };

        tasks.on_finalized(first, TaskCategory::CoverFetch, "http://127.0.0.1:9/a.jpg");
        assert!(!tasks.is_current_cover(first));
        assert!(tasks.is_current_cover(second));

        tasks.on_finalized(second, TaskCategory::CoverFetch, "http://127.0.0.1:9/b.jpg");
        assert!(!tasks.is_current_cover(second));
    }
}
