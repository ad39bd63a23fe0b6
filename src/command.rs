//! Line-oriented command surface.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// A request from the command surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Playlist,
    History,
    Favorites,
    Radios,
    /// Play the track at an index, or resume/continue without one
    Play(Option<usize>),
    Pause,
    Next,
    Previous,
    Volume(i64),
    /// Seek to a position in seconds
    Seek(u64),
    Radio(usize),
    AddRadio {
        url: String,
        name: String,
    },
    Import(Vec<PathBuf>),
    Search {
        query: String,
        results: Option<usize>,
        download: bool,
    },
    Download(usize),
    Remove(usize),
    Favorite,
    QueueHistory(usize),
    QueueFavorite(usize),
    Cancel,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command '{0}', try 'help'")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("'{0}' is not a number")]
    InvalidNumber(String),

    #[error("Unterminated quote")]
    UnterminatedQuote,
}

impl Classify for CommandError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Usage lines shown by `help`.
pub const HELP: &[&str] = &[
    "status                      playback status",
    "playlist | history | favorites | radios",
    "play [index]                play a track, or resume",
    "pause",
    "next | prev",
    "volume <0-200>",
    "seek <seconds>",
    "radio <index>               play a saved station",
    "radio add <url> <name...>   save and play a station",
    "import <path...>            add local audio files",
    "search [-n N] [-d] <query>  search or resolve a URL (-d downloads)",
    "download <index>            download a playlist track",
    "remove <index>",
    "fav                         add the current track to favorites",
    "queue history|fav <index>   append from history or favorites",
    "cancel                      cancel the running search",
    "quit",
];

/// Parse one input line.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let words = split_words(line)?;
    let Some((name, args)) = words.split_first() else {
        return Err(CommandError::Empty);
    };

    let command = match name.to_lowercase().as_str() {
        "status" => Command::Status,
        "playlist" | "ls" => Command::Playlist,
        "history" => Command::History,
        "favorites" | "favs" => Command::Favorites,
        "radios" | "stations" => Command::Radios,
        "play" => Command::Play(args.first().map(|a| index(a)).transpose()?),
        "pause" => Command::Pause,
        "next" => Command::Next,
        "prev" | "previous" => Command::Previous,
        "volume" | "vol" => {
            let value = args.first().ok_or(CommandError::Usage("volume <0-200>"))?;
            Command::Volume(
                value
                    .parse()
                    .map_err(|_| CommandError::InvalidNumber(value.clone()))?,
            )
        }
        "seek" => {
            let value = args.first().ok_or(CommandError::Usage("seek <seconds>"))?;
            Command::Seek(
                value
                    .parse()
                    .map_err(|_| CommandError::InvalidNumber(value.clone()))?,
            )
        }
        "radio" => parse_radio(args)?,
        "import" => {
            if args.is_empty() {
                return Err(CommandError::Usage("import <path...>"));
            }
            Command::Import(args.iter().map(PathBuf::from).collect())
        }
        "search" => parse_search(args)?,
        "download" => Command::Download(required_index(args, "download <index>")?),
        "remove" | "rm" => Command::Remove(required_index(args, "remove <index>")?),
        "fav" => Command::Favorite,
        "queue" => {
            const USAGE: &str = "queue history|fav <index>";
            let source = args.first().ok_or(CommandError::Usage(USAGE))?;
            let i = required_index(&args[1..], USAGE)?;
            match source.as_str() {
                "history" => Command::QueueHistory(i),
                "fav" | "favorites" => Command::QueueFavorite(i),
                _ => return Err(CommandError::Usage(USAGE)),
            }
        }
        "cancel" => Command::Cancel,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(command)
}

fn parse_radio(args: &[String]) -> Result<Command, CommandError> {
    const USAGE: &str = "radio <index> | radio add <url> <name...>";
    match args.first().map(String::as_str) {
        Some("add") => {
            let url = args.get(1).ok_or(CommandError::Usage(USAGE))?.clone();
            let name = if args.len() > 2 {
                args[2..].join(" ")
            } else {
                url.clone()
            };
            Ok(Command::AddRadio { url, name })
        }
        Some(value) => Ok(Command::Radio(index(value)?)),
        None => Err(CommandError::Usage(USAGE)),
    }
}

fn parse_search(args: &[String]) -> Result<Command, CommandError> {
    const USAGE: &str = "search [-n N] [-d] <query...>";
    let mut results = None;
    let mut download = false;
    let mut rest = args;
    while let Some((flag, tail)) = rest.split_first() {
        match flag.as_str() {
            "-d" | "--download" => {
                download = true;
                rest = tail;
            }
            "-n" | "--results" => {
                let value = tail.first().ok_or(CommandError::Usage(USAGE))?;
                results = Some(index(value)?);
                rest = &tail[1..];
            }
            "--" => {
                rest = tail;
                break;
            }
            _ => break,
        }
    }

    let query = rest.join(" ");
    if query.trim().is_empty() {
        return Err(CommandError::Usage(USAGE));
    }
    Ok(Command::Search {
        query,
        results,
        download,
    })
}

fn index(value: &str) -> Result<usize, CommandError> {
    value
        .parse()
        .map_err(|_| CommandError::InvalidNumber(value.to_string()))
}

fn required_index(args: &[String], usage: &'static str) -> Result<usize, CommandError> {
    index(args.first().ok_or(CommandError::Usage(usage))?)
}

/// Split on whitespace; double quotes group words.
fn split_words(line: &str) -> Result<Vec<String>, CommandError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err(CommandError::UnterminatedQuote);
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("status"), Ok(Command::Status));
        assert_eq!(parse("  PAUSE "), Ok(Command::Pause));
        assert_eq!(parse("prev"), Ok(Command::Previous));
        assert_eq!(parse("fav"), Ok(Command::Favorite));
        assert_eq!(parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_play_with_and_without_index() {
        assert_eq!(parse("play"), Ok(Command::Play(None)));
        assert_eq!(parse("play 3"), Ok(Command::Play(Some(3))));
        assert_eq!(
            parse("play x"),
            Err(CommandError::InvalidNumber("x".into()))
        );
    }

    #[test]
    fn test_volume_range_is_left_to_the_player() {
        assert_eq!(parse("volume 250"), Ok(Command::Volume(250)));
        assert_eq!(parse("volume -1"), Ok(Command::Volume(-1)));
        assert!(matches!(parse("volume"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_search_flags() {
        assert_eq!(
            parse("search -n 10 -d daft punk"),
            Ok(Command::Search {
                query: "daft punk".into(),
                results: Some(10),
                download: true,
            })
        );
        assert_eq!(
            parse("search -- -d is a song"),
            Ok(Command::Search {
                query: "-d is a song".into(),
                results: None,
                download: false,
            })
        );
        assert!(matches!(parse("search -d"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_radio_commands() {
        assert_eq!(parse("radio 1"), Ok(Command::Radio(1)));
        assert_eq!(
            parse("radio add http://stream.example.com/live Jazz FM"),
            Ok(Command::AddRadio {
                url: "http://stream.example.com/live".into(),
                name: "Jazz FM".into(),
            })
        );
        assert_eq!(
            parse("radio add http://s.example.com"),
            Ok(Command::AddRadio {
                url: "http://s.example.com".into(),
                name: "http://s.example.com".into(),
            })
        );
    }

    #[test]
    fn test_quoted_import_paths() {
        assert_eq!(
            parse(r#"import "/music/My Song.mp3" /music/other.flac"#),
            Ok(Command::Import(vec![
                PathBuf::from("/music/My Song.mp3"),
                PathBuf::from("/music/other.flac"),
            ]))
        );
        assert_eq!(parse(r#"import "/music"#), Err(CommandError::UnterminatedQuote));
    }

    #[test]
    fn test_queue_commands() {
        assert_eq!(parse("queue history 2"), Ok(Command::QueueHistory(2)));
        assert_eq!(parse("queue fav 0"), Ok(Command::QueueFavorite(0)));
        assert!(matches!(parse("queue later 1"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse("   "), Err(CommandError::Empty));
        assert_eq!(parse("dance"), Err(CommandError::Unknown("dance".into())));
        assert!(matches!(parse("remove"), Err(CommandError::Usage(_))));
    }
}
