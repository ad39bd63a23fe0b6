//! Disposable metadata probes for local files.
//!
//! A probe is independent of the playback engine so several can run on
//! worker threads at once. Dropping a handle releases everything it holds.

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

/// Progress of a metadata parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Pending,
    Parsing,
    Parsed,
    Failed,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One in-progress parse of one file.
pub trait ProbeHandle: Send {
    /// Advance the parse if needed and report where it stands.
    fn parse_state(&mut self) -> ParseState;

    /// Duration once parsed, `None` when the container does not say.
    fn duration_ms(&self) -> Option<u64>;
}

/// Factory of probe handles.
pub trait MediaProber: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ProbeHandle>, ProbeError>;
}

/// Probe backed by symphonia's format readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaProber;

impl MediaProber for SymphoniaProber {
    fn open(&self, path: &Path) -> Result<Box<dyn ProbeHandle>, ProbeError> {
        let file = File::open(path).map_err(|source| ProbeError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Box::new(SymphoniaProbe {
            path: path.to_path_buf(),
            file: Some(file),
            state: ParseState::Pending,
            duration_ms: None,
        }))
    }
}

struct SymphoniaProbe {
    path: PathBuf,
    file: Option<File>,
    state: ParseState,
    duration_ms: Option<u64>,
}

impl SymphoniaProbe {
    fn parse(&mut self, file: File) -> ParseState {
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = match symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(probed) => probed,
            Err(e) => {
                tracing::debug!("Probe of {} failed: {}", self.path.display(), e);
                return ParseState::Failed;
            }
        };

        if let Some(track) = probed.format.default_track() {
            let params = &track.codec_params;
            if let (Some(time_base), Some(n_frames)) = (params.time_base, params.n_frames) {
                let time = time_base.calc_time(n_frames);
                self.duration_ms = Some(time.seconds * 1000 + (time.frac * 1000.0) as u64);
            }
        }
        ParseState::Parsed
    }
}

impl ProbeHandle for SymphoniaProbe {
    fn parse_state(&mut self) -> ParseState {
        if let Some(file) = self.file.take() {
            self.state = ParseState::Parsing;
            self.state = self.parse(file);
        }
        self.state
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted probes for orchestrator tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Every handle walks through `states` (repeating the last one) and
    /// reports `duration_ms` once parsed.
    #[derive(Debug, Clone)]
    pub struct FakeProber {
        pub states: Vec<ParseState>,
        pub duration_ms: Option<u64>,
        /// Handles currently alive.
        pub open_handles: Arc<AtomicUsize>,
    }

    impl FakeProber {
        pub fn parsed(duration_ms: u64) -> Self {
            Self {
                states: vec![ParseState::Parsing, ParseState::Parsed],
                duration_ms: Some(duration_ms),
                open_handles: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Never finishes parsing.
        pub fn stuck() -> Self {
            Self {
                states: vec![ParseState::Parsing],
                duration_ms: None,
                open_handles: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn live_handles(&self) -> usize {
            self.open_handles.load(Ordering::SeqCst)
        }
    }

    impl MediaProber for FakeProber {
        fn open(&self, _path: &Path) -> Result<Box<dyn ProbeHandle>, ProbeError> {
            self.open_handles.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                states: self.states.clone(),
                step: 0,
                duration_ms: self.duration_ms,
                open_handles: Arc::clone(&self.open_handles),
            }))
        }
    }

    struct FakeHandle {
        states: Vec<ParseState>,
        step: usize,
        duration_ms: Option<u64>,
        open_handles: Arc<AtomicUsize>,
    }

    impl ProbeHandle for FakeHandle {
        fn parse_state(&mut self) -> ParseState {
            let index = self.step.min(self.states.len().saturating_sub(1));
            self.step += 1;
            self.states.get(index).copied().unwrap_or(ParseState::Failed)
        }

        fn duration_ms(&self) -> Option<u64> {
            self.duration_ms
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
