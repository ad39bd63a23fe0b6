//! Playback: engine capability, rodio backend, metadata probes and the
//! session state machine.

pub mod backend;
pub mod engine;
pub mod probe;
pub mod session;

pub use backend::RodioEngine;
pub use engine::{Engine, EngineEvent};
pub use probe::{MediaProber, SymphoniaProber};
pub use session::{PlaybackError, Played, Session, SessionOptions, StatusSnapshot};
