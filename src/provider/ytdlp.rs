//! `yt-dlp` process adapter.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use serde_json::Value;

use super::{
    ContentProvider, DownloadOptions, Progress, ProviderEntry, ProviderError, ResolveKind,
    ResolveObserver, ResolveRequest,
};

/// How often cancellation is checked while the process is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Output file template inside the download directory.
const OUTPUT_TEMPLATE: &str = "%(extractor)s_%(id)s.%(ext)s";

/// stderr lines kept for error reports.
const STDERR_TAIL: usize = 20;

/// Runs `yt-dlp` once per request, reading the final JSON document from
/// stdout and progress lines from stderr.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    ffmpeg: String,
    has_ffmpeg: bool,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, ffmpeg: impl Into<String>) -> Self {
        let ffmpeg = ffmpeg.into();
        let has_ffmpeg = find_executable(&ffmpeg).is_some();
        if !has_ffmpeg {
            tracing::warn!("{} not found; downloads will keep their original format", ffmpeg);
        }
        Self {
            binary: binary.into(),
            ffmpeg,
            has_ffmpeg,
        }
    }

    fn args(&self, request: &ResolveRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--dump-single-json",
            "--no-warnings",
            "--ignore-errors",
            "--restrict-filenames",
            "--newline",
            "--format",
            "bestaudio/best",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        match request.kind {
            ResolveKind::Search { .. } | ResolveKind::Single => args.push("--no-playlist".into()),
            ResolveKind::Playlist { flat } => {
                args.push("--yes-playlist".into());
                if flat {
                    args.push("--flat-playlist".into());
                }
            }
        }

        if let Some(download) = &request.download {
            args.extend(
                ["--no-simulate", "--progress", "--write-thumbnail", "--write-info-json", "-o"]
                    .iter()
                    .map(OsString::from),
            );
            args.push(download.output_dir.join(OUTPUT_TEMPLATE).into_os_string());
            if download.convert_to_mp3 && self.has_ffmpeg {
                args.extend(
                    [
                        "--extract-audio",
                        "--audio-format",
                        "mp3",
                        "--audio-quality",
                        "192K",
                        "--embed-thumbnail",
                        "--ffmpeg-location",
                    ]
                    .iter()
                    .map(OsString::from),
                );
                args.push(self.ffmpeg.clone().into());
            }
        }

        args.push(target(request).into());
        args
    }
}

/// The positional argument: searches use the `ytsearchN:` prefix.
fn target(request: &ResolveRequest) -> String {
    match request.kind {
        ResolveKind::Search { limit } => format!("ytsearch{}:{}", limit, request.query),
        _ => request.query.clone(),
    }
}

impl ContentProvider for YtDlp {
    fn resolve(
        &self,
        request: &ResolveRequest,
        observer: &mut dyn ResolveObserver,
    ) -> Result<Vec<ProviderEntry>, ProviderError> {
        if let Some(download) = &request.download {
            std::fs::create_dir_all(&download.output_dir)?;
        }

        let args = self.args(request);
        tracing::debug!("Running {} {:?}", self.binary, args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProviderError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stdout_reader = std::thread::spawn(move || {
            let mut output = String::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_string(&mut output);
            }
            output
        });

        let (line_tx, line_rx) = mpsc::channel();
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        loop {
            if observer.is_cancelled() {
                tracing::info!("Cancelling {}", self.binary);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProviderError::Cancelled);
            }
            match line_rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => match parse_progress(&line) {
                    Some(progress) => observer.progress(progress),
                    None => {
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait()?;
        let output = stdout_reader.join().unwrap_or_default();
        if observer.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let trimmed = output.trim();
        if trimmed.is_empty() || trimmed == "null" {
            let detail = tail.into_iter().collect::<Vec<_>>().join("\n");
            return Err(ProviderError::Failed(if detail.is_empty() {
                format!("{} exited with {}", self.binary, status)
            } else {
                detail
            }));
        }
        if !status.success() {
            tracing::warn!("{} exited with {} but produced output", self.binary, status);
        }

        let info: Value = serde_json::from_str(trimmed)?;
        let convert = request
            .download
            .as_ref()
            .is_some_and(|d| d.convert_to_mp3 && self.has_ffmpeg);
        Ok(parse_entries(&info, request, convert))
    }

    fn can_convert_audio(&self) -> bool {
        self.has_ffmpeg
    }
}

/// Search `PATH` for an executable, or check an explicit path.
fn find_executable(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// Parse a `[stage] ...` progress line.
fn parse_progress(line: &str) -> Option<Progress> {
    let rest = line.strip_prefix('[')?;
    let (stage, message) = rest.split_once(']')?;
    let message = message.trim();
    let percent = (stage == "download")
        .then(|| {
            message
                .split_whitespace()
                .find_map(|token| token.strip_suffix('%')?.parse::<f32>().ok())
        })
        .flatten();
    Some(Progress {
        stage: stage.to_string(),
        percent,
        message: message.to_string(),
    })
}

/// Turn the provider's JSON document into entries.
fn parse_entries(info: &Value, request: &ResolveRequest, convert: bool) -> Vec<ProviderEntry> {
    let items: Vec<&Value> = match info.get("entries").and_then(Value::as_array) {
        Some(entries) => entries.iter().filter(|e| e.is_object()).collect(),
        None => vec![info],
    };
    let limit = match request.kind {
        ResolveKind::Search { limit } => limit,
        _ => usize::MAX,
    };

    items
        .into_iter()
        .take(limit)
        .map(|item| parse_entry(item, request.download.as_ref(), convert))
        .collect()
}

fn parse_entry(item: &Value, download: Option<&DownloadOptions>, convert: bool) -> ProviderEntry {
    let text = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let thumbnail = text("thumbnail").or_else(|| {
        item.get("thumbnails")
            .and_then(Value::as_array)
            .and_then(|thumbs| thumbs.first())
            .and_then(|thumb| thumb.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let duration_secs = item
        .get("duration")
        .and_then(Value::as_f64)
        .filter(|d| *d > 0.0)
        .map_or(0, |d| d as u32);

    ProviderEntry {
        id: text("id"),
        title: text("title"),
        extractor: text("extractor_key")
            .or_else(|| text("ie_key"))
            .map(|e| e.to_lowercase()),
        stream_url: text("url"),
        page_url: text("webpage_url").or_else(|| text("original_url")),
        thumbnail,
        duration_secs,
        local_file: download.and_then(|d| downloaded_file(item, &d.output_dir, convert)),
    }
}

/// Locate the file a download produced: the expected name first, then
/// what the provider reports.
fn downloaded_file(item: &Value, dir: &Path, convert: bool) -> Option<PathBuf> {
    let id = item.get("id").and_then(Value::as_str)?;
    let extractor = item
        .get("extractor")
        .and_then(Value::as_str)
        .unwrap_or("generic")
        .to_lowercase();
    let ext = if convert {
        "mp3".to_string()
    } else {
        item.get("ext")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };

    let expected = dir.join(format!("{extractor}_{id}.{ext}"));
    if expected.is_file() {
        return Some(expected);
    }

    let requested = item
        .get("requested_downloads")
        .and_then(Value::as_array)
        .and_then(|downloads| downloads.first())
        .and_then(|first| first.get("filepath"))
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .filter(|p| p.is_file());
    if requested.is_some() {
        return requested;
    }

    item.get("filepath")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(&ext))
        })
}
