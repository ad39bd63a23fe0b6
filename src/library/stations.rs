//! Web-radio station list.

use serde::{Deserialize, Serialize};

/// A named web-radio stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioStation {
    pub name: String,

    #[serde(rename = "url_stream", alias = "stream_locator")]
    pub stream_url: String,
}

impl RadioStation {
    pub fn new(name: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_url: stream_url.into(),
        }
    }

    fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.stream_url.trim().is_empty()
    }
}

/// Built-in stations used when no usable list exists.
pub fn default_stations() -> Vec<RadioStation> {
    vec![
        RadioStation::new("Radio Deejay (MP3)", "http://shoutcast.unitedradio.it/RadioDeejay"),
        RadioStation::new("Rai Radio 1 (MP3)", "http://icestreaming.rai.it/1.mp3"),
    ]
}

/// Drop entries with an empty name or stream, falling back to the
/// defaults when nothing usable remains.
pub fn sanitize(stations: Vec<RadioStation>) -> Vec<RadioStation> {
    let valid: Vec<_> = stations.into_iter().filter(RadioStation::is_valid).collect();
    if valid.is_empty() {
        default_stations()
    } else {
        valid
    }
}
