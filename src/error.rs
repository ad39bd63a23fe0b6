//! Error classification shared by every surfaced failure.

use serde::Serialize;

/// How a failure is surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; nothing changed.
    Validation,
    /// Something needed is missing; state was forced to a safe value.
    ResourceUnavailable,
    /// Worth a notice and, where possible, an automatic correction.
    Transient,
}

/// Errors that know their own [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
