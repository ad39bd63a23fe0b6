//! Audio playback backend using rodio.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use color_eyre::Result;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use tokio::sync::mpsc;

use super::engine::{
    Engine, EngineError, EngineEvent, EngineState, MediaRequest, MediaSource, MAX_VOLUME,
};

/// Bytes of stream data retained for replay while the decoder probes.
const STREAM_HEAD_LIMIT: usize = 1024 * 1024;

/// Rough byte rate used to turn a caching hint into a prefetch size.
const STREAM_BYTES_PER_MS: usize = 40;

/// Longest wait for response headers or for any single read of a stream.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Player thread poll interval.
const TICK: Duration = Duration::from_millis(50);

/// Messages sent to the player thread.
#[derive(Debug)]
enum PlayerCommand {
    Load(MediaRequest),
    Pause,
    Resume,
    Stop,
    SetVolume(f32),
    Seek(Duration),
}

/// Shared player state accessible from multiple threads.
struct PlayerStateShared {
    state: AtomicU8,
    position_ms: AtomicU64,
    /// 0 while unknown
    duration_ms: AtomicU64,
    /// Set when a network stream stopped delivering data
    stream_failed: Arc<AtomicBool>,
}

impl PlayerStateShared {
    fn state(&self) -> EngineState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(encode_state(state), Ordering::SeqCst);
    }
}

fn encode_state(state: EngineState) -> u8 {
    match state {
        EngineState::Idle => 0,
        EngineState::Opening => 1,
        EngineState::Playing => 2,
        EngineState::Paused => 3,
        EngineState::Stopped => 4,
        EngineState::Ended => 5,
        EngineState::Error => 6,
    }
}

fn decode_state(value: u8) -> EngineState {
    match value {
        1 => EngineState::Opening,
        2 => EngineState::Playing,
        3 => EngineState::Paused,
        4 => EngineState::Stopped,
        5 => EngineState::Ended,
        6 => EngineState::Error,
        _ => EngineState::Idle,
    }
}

/// Audio engine that decodes and plays on a dedicated thread.
pub struct RodioEngine {
    command_tx: mpsc::UnboundedSender<PlayerCommand>,
    event_rx: mpsc::UnboundedReceiver<EngineEvent>,
    state: Arc<PlayerStateShared>,
    media: Option<MediaRequest>,
}

impl RodioEngine {
    /// Start the player thread and open the default audio output.
    pub fn new(volume: u16) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let state = Arc::new(PlayerStateShared {
            state: AtomicU8::new(encode_state(EngineState::Idle)),
            position_ms: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
            stream_failed: Arc::new(AtomicBool::new(false)),
        });

        let state_clone = Arc::clone(&state);
        let initial_volume = volume_gain(volume);

        std::thread::Builder::new()
            .name("jukebox-player".into())
            .spawn(move || {
                // The output stream is not Send and has to live on this thread
                let (_stream, stream_handle) = match OutputStream::try_default() {
                    Ok(output) => {
                        let _ = ready_tx.send(Ok(()));
                        output
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = run_player_thread(
                    command_rx,
                    event_tx,
                    state_clone,
                    stream_handle,
                    initial_volume,
                ) {
                    tracing::error!("Player thread error: {}", e);
                }
            })
            .map_err(|e| EngineError::Output(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::Output(e)),
            Err(_) => return Err(EngineError::Disconnected),
        }

        tracing::info!("Audio output ready");
        Ok(Self {
            command_tx,
            event_rx,
            state,
            media: None,
        })
    }

    fn send(&self, command: PlayerCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::Disconnected)
    }
}

impl Engine for RodioEngine {
    fn set_media(&mut self, request: MediaRequest) -> Result<(), EngineError> {
        self.media = Some(request);
        Ok(())
    }

    fn play(&mut self) -> Result<(), EngineError> {
        if self.state.state() == EngineState::Paused {
            self.send(PlayerCommand::Resume)?;
            self.state.set_state(EngineState::Playing);
            return Ok(());
        }

        let media = self.media.clone().ok_or(EngineError::NoMedia)?;
        if media.source == MediaSource::Local && !std::path::Path::new(&media.locator).is_file() {
            self.state.set_state(EngineState::Error);
            return Err(EngineError::MediaNotFound(media.locator));
        }

        self.state.set_state(EngineState::Opening);
        self.state.position_ms.store(0, Ordering::SeqCst);
        self.state.duration_ms.store(0, Ordering::SeqCst);
        self.send(PlayerCommand::Load(media))
    }

    fn pause(&mut self) {
        if self.state.state().is_playing() && self.send(PlayerCommand::Pause).is_ok() {
            self.state.set_state(EngineState::Paused);
        }
    }

    fn can_pause(&self) -> bool {
        // Live streams of unknown length cannot be held open while paused
        match self.media.as_ref().map(|m| &m.source) {
            Some(MediaSource::Network { .. }) => self.state.duration_ms.load(Ordering::SeqCst) > 0,
            Some(MediaSource::Local) => true,
            None => false,
        }
    }

    fn stop(&mut self) {
        if self.send(PlayerCommand::Stop).is_ok() {
            self.state.set_state(EngineState::Stopped);
            self.state.position_ms.store(0, Ordering::SeqCst);
        }
    }

    fn state(&self) -> EngineState {
        self.state.state()
    }

    fn time_ms(&self) -> u64 {
        self.state.position_ms.load(Ordering::SeqCst)
    }

    fn length_ms(&self) -> Option<u64> {
        Some(self.state.duration_ms.load(Ordering::SeqCst)).filter(|d| *d > 0)
    }

    fn set_time(&mut self, ms: u64) {
        if self.send(PlayerCommand::Seek(Duration::from_millis(ms))).is_ok() {
            self.state.position_ms.store(ms, Ordering::SeqCst);
        }
    }

    fn set_volume(&mut self, volume: u16) {
        let _ = self.send(PlayerCommand::SetVolume(volume_gain(volume)));
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Map 0..=200 to a linear gain, 100 being unity.
fn volume_gain(volume: u16) -> f32 {
    f32::from(volume.min(MAX_VOLUME)) / 100.0
}

/// Run the player thread.
fn run_player_thread(
    mut command_rx: mpsc::UnboundedReceiver<PlayerCommand>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    state: Arc<PlayerStateShared>,
    stream_handle: OutputStreamHandle,
    mut volume: f32,
) -> Result<()> {
    let mut sink = Sink::try_new(&stream_handle)?;
    sink.set_volume(volume);

    loop {
        loop {
            let command = match command_rx.try_recv() {
                Ok(command) => command,
                Err(mpsc::error::TryRecvError::Empty) => break,
                // Engine dropped, exit thread
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            };

            match command {
                PlayerCommand::Load(request) => {
                    sink.stop();
                    sink = Sink::try_new(&stream_handle)?;
                    sink.set_volume(volume);
                    state.stream_failed.store(false, Ordering::SeqCst);

                    match load_media(&sink, &request, &state.stream_failed) {
                        Ok(duration) => {
                            let duration_ms = duration.map_or(0, |d| d.as_millis() as u64);
                            state.duration_ms.store(duration_ms, Ordering::SeqCst);
                            // A stop may have raced the load
                            if state.state() == EngineState::Opening {
                                sink.play();
                                state.set_state(EngineState::Playing);
                            }
                            tracing::debug!("Loaded {} ({} ms)", request.locator, duration_ms);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to open {}: {}", request.locator, e);
                            state.set_state(EngineState::Error);
                            let _ = event_tx.send(EngineEvent::Error(e.to_string()));
                        }
                    }
                }
                PlayerCommand::Pause => sink.pause(),
                PlayerCommand::Resume => sink.play(),
                PlayerCommand::Stop => {
                    sink.stop();
                    sink = Sink::try_new(&stream_handle)?;
                    sink.set_volume(volume);
                    state.position_ms.store(0, Ordering::SeqCst);
                }
                PlayerCommand::SetVolume(gain) => {
                    volume = gain;
                    sink.set_volume(gain);
                }
                PlayerCommand::Seek(position) => {
                    if let Err(e) = sink.try_seek(position) {
                        tracing::warn!("Seek to {:?} failed: {}", position, e);
                    }
                }
            }
        }

        match state.state() {
            EngineState::Playing if sink.empty() => {
                if state.stream_failed.swap(false, Ordering::SeqCst) {
                    state.set_state(EngineState::Error);
                    let _ = event_tx.send(EngineEvent::Error(
                        "The stream stopped delivering data".into(),
                    ));
                } else {
                    state.set_state(EngineState::Ended);
                    let _ = event_tx.send(EngineEvent::EndReached);
                }
            }
            EngineState::Playing | EngineState::Paused => {
                state
                    .position_ms
                    .store(sink.get_pos().as_millis() as u64, Ordering::SeqCst);
            }
            _ => {}
        }

        std::thread::sleep(TICK);
    }
}

/// Open and queue a media request. Returns its duration when known.
fn load_media(
    sink: &Sink,
    request: &MediaRequest,
    stream_failed: &Arc<AtomicBool>,
) -> Result<Option<Duration>> {
    match request.source {
        MediaSource::Local => {
            let file = File::open(&request.locator)?;
            append_decoded(sink, BufReader::new(file))
        }
        MediaSource::Network { caching_ms } => {
            let stream = HttpStream::open(
                &request.locator,
                caching_ms,
                STREAM_READ_TIMEOUT,
                Arc::clone(stream_failed),
            )?;
            append_decoded(sink, stream)
        }
    }
}

fn append_decoded<R>(sink: &Sink, reader: R) -> Result<Option<Duration>>
where
    R: Read + Seek + Send + Sync + 'static,
{
    let source = Decoder::new(reader)?;
    let duration = source.total_duration();
    sink.append(source);
    Ok(duration)
}

/// Forward-only HTTP body with a replayable head.
///
/// The first bytes of the stream are kept so the decoder can rewind while
/// probing the format; past the head only forward seeks work.
struct HttpStream {
    response: Mutex<reqwest::blocking::Response>,
    head: Vec<u8>,
    head_limit: usize,
    /// Bytes pulled from the network so far.
    fetched: u64,
    position: u64,
    /// Raised on a failed or timed-out read
    failed: Arc<AtomicBool>,
}

impl HttpStream {
    /// `read_timeout` bounds the wait for headers and for each read.
    fn open(
        url: &str,
        caching_ms: u32,
        read_timeout: Duration,
        failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(read_timeout)
            .build()?;
        let response = client.get(url).send()?.error_for_status()?;

        let prefetch = caching_ms as usize * STREAM_BYTES_PER_MS;
        let mut stream = Self {
            response: Mutex::new(response),
            head: Vec::with_capacity(prefetch),
            head_limit: prefetch.max(STREAM_HEAD_LIMIT),
            fetched: 0,
            position: 0,
            failed,
        };

        // Buffer up front so playback does not stall right away
        let mut chunk = [0u8; 8192];
        while stream.head.len() < prefetch {
            if stream.fetch(&mut chunk)? == 0 {
                break;
            }
        }
        tracing::debug!("Prefetched {} bytes from {}", stream.head.len(), url);
        Ok(stream)
    }

    /// Pull the next chunk from the network, retaining it while the head
    /// is still being recorded.
    fn fetch(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let response = self
            .response
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let n = match response.read(buf) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Stream read failed: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        if self.head.len() as u64 == self.fetched && self.head.len() < self.head_limit {
            self.head.extend_from_slice(&buf[..n]);
        }
        self.fetched += n as u64;
        Ok(n)
    }
}

impl Read for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = if (self.position as usize) < self.head.len() {
            let start = self.position as usize;
            let n = buf.len().min(self.head.len() - start);
            buf[..n].copy_from_slice(&self.head[start..start + n]);
            n
        } else {
            self.fetch(buf)?
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for HttpStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(_) => None,
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "unsupported stream seek"))?;

        // Everything before the live edge is replayable only while the
        // head still holds the whole stream.
        if target < self.fetched {
            if self.head.len() as u64 == self.fetched || target == self.position {
                self.position = target;
                return Ok(target);
            }
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot seek backwards in a live stream",
            ));
        }

        // Forward: jump to the live edge and discard up to the target
        self.position = self.fetched;
        let skip = target - self.position;
        io::copy(&mut self.by_ref().take(skip), &mut io::sink())?;
        Ok(self.position)
    }
}
