//! Error classification for audio sources.
//!
//! The decode pump only needs to tell "a frame was bad, keep going" apart from
//! "the source is gone". Everything else is detail for the log line.

use std::io;

use symphonia::core::errors::Error as SymphoniaError;
use thiserror::Error;

/// Failure raised while opening or reading an audio source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A single packet failed to decode; the stream may still recover.
    #[error("malformed frame: {0}")]
    Frame(String),
    /// The underlying reader failed or was closed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// HTTP request or connection failure.
    #[error("network error: {0}")]
    Network(String),
    /// Container, codec or file extension not handled.
    #[error("unsupported source: {0}")]
    Unsupported(String),
    /// Concatenated parts do not share one sample layout.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    /// Referenced file does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("seek failed: {0}")]
    Seek(String),
}

impl SourceError {
    /// `true` for errors counted by the consecutive-frame-error policy.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, SourceError::Frame(_))
    }
}

impl From<SymphoniaError> for SourceError {
    fn from(err: SymphoniaError) -> Self {
        match err {
            SymphoniaError::IoError(e) => SourceError::Io(e),
            SymphoniaError::DecodeError(msg) => SourceError::Frame(msg.to_string()),
            SymphoniaError::LimitError(msg) => SourceError::Frame(msg.to_string()),
            SymphoniaError::Unsupported(msg) => SourceError::Unsupported(msg.to_string()),
            SymphoniaError::SeekError(kind) => SourceError::Seek(format!("{kind:?}")),
            SymphoniaError::ResetRequired => SourceError::Frame("decoder reset required".into()),
        }
    }
}

impl From<ureq::Error> for SourceError {
    fn from(err: ureq::Error) -> Self {
        SourceError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_are_frame_errors() {
        let err: SourceError = SymphoniaError::DecodeError("bad sync").into();
        assert!(err.is_frame_error());
    }

    #[test]
    fn io_errors_are_not_frame_errors() {
        let err: SourceError =
            SymphoniaError::IoError(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).into();
        assert!(!err.is_frame_error());
        assert!(matches!(err, SourceError::Io(_)));
    }
}
