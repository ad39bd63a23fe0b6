//! jukebox - a personal media jukebox: playlist, web radio and background
//! search/download, driven by line commands on stdin.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::sync::mpsc;

mod action;
mod app;
mod command;
mod config;
mod error;
mod library;
mod player;
mod provider;
mod reply;
mod tasks;

use action::Action;
use app::App;
use config::Config;
use library::Library;
use player::engine::Engine;
use player::{RodioEngine, Session, SymphoniaProber};
use provider::YtDlp;
use tasks::{TaskSettings, Tasks};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "jukebox")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Initial volume, 0-200 (overrides config)
    #[arg(short, long)]
    volume: Option<u16>,

    /// Do not start the saved playlist on launch
    #[arg(long)]
    no_autoplay: bool,
}

/// Install color-eyre's panic and error report hooks.
fn install_hooks() -> Result<()> {
    color_eyre::config::HookBuilder::default()
        .panic_section(format!(
            "This is a bug. Please report it at: {}",
            env!("CARGO_PKG_REPOSITORY")
        ))
        .install()
}

#[tokio::main]
async fn main() -> Result<()> {
    install_hooks()?;

    // Initialize logging
    let log_file = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jukebox")
        .join("jukebox.log");

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = tracing_subscriber::fmt::layer()
        .with_writer(std::fs::File::create(&log_file)?)
        .with_ansi(false);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::sink) // stdout carries replies only
        .finish()
        .with(file_appender)
        .try_init()
        .ok();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!("Using default configuration: {}", e);
            Config::default()
        }),
    };

    // Apply command-line overrides
    if let Some(dir) = args.data_dir {
        config.library.data_dir = dir;
    }
    if let Some(volume) = args.volume {
        config.player.volume = volume.min(player::engine::MAX_VOLUME);
    }
    if args.no_autoplay {
        config.player.autoplay_on_start = false;
    }

    let library = Library::open(&config.library.data_dir);

    // A missing audio device leaves the player inert rather than fatal
    let engine: Option<Box<dyn Engine>> = match RodioEngine::new(config.player.volume) {
        Ok(engine) => Some(Box::new(engine)),
        Err(e) => {
            tracing::error!("Failed to initialize audio player: {}", e);
            None
        }
    };
    let session = Session::new(engine, library.load_playlist(), config.session_options());

    // Create action channel
    let (action_tx, mut action_rx) = mpsc::unbounded_channel::<Action>();

    let provider = YtDlp::new(
        config.search.provider_binary.clone(),
        config.search.ffmpeg_binary.clone(),
    );
    let tasks = Tasks::new(
        action_tx.clone(),
        Arc::new(provider),
        Arc::new(SymphoniaProber),
        TaskSettings {
            covers_dir: library.covers_dir(),
            cover_timeout: Duration::from_secs(config.covers.request_timeout_secs),
            user_agent: config.covers.user_agent.clone(),
            probe_interval: Duration::from_millis(config.probe.poll_interval_ms),
            probe_max_polls: config.probe.max_polls,
        },
    )?;

    // Create application
    let mut app = App::new(config, session, library, tasks, action_tx.clone());
    app.init();
    write_replies(&mut app)?;

    spawn_stdin_reader(action_tx);

    // Main event loop
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = ticker.tick() => app.handle_action(Action::Tick).await?,
            Some(action) = action_rx.recv() => app.handle_action(action).await?,
            _ = tokio::signal::ctrl_c() => app.should_quit = true,
        }

        write_replies(&mut app)?;

        // Check if we should quit
        if app.should_quit {
            break;
        }
    }

    app.shutdown();
    write_replies(&mut app)?;

    Ok(())
}

/// Read command lines on a dedicated thread. End of input quits.
fn spawn_stdin_reader(action_tx: mpsc::UnboundedSender<Action>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let action = match command::parse(&line) {
                Ok(command) => Action::Command(command),
                Err(e) => Action::InvalidCommand(e),
            };
            if action_tx.send(action).is_err() {
                return;
            }
        }
        let _ = action_tx.send(Action::Quit);
    });
}

/// Write pending replies to stdout as JSON lines.
fn write_replies(app: &mut App) -> Result<()> {
    let replies = app.take_replies();
    if replies.is_empty() {
        return Ok(());
    }

    let mut stdout = std::io::stdout().lock();
    for reply in replies {
        serde_json::to_writer(&mut stdout, &reply)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;
    Ok(())
}

use tracing_subscriber::prelude::*;
