use std::{error::Error as StdError, fmt, io};

pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy shared by the store, logger, proxy and replay engine.
#[derive(Debug)]
pub enum Error {
    /// A required startup option is missing or invalid.
    Configuration(String),
    /// File open, write, flush, read or close failure.
    Io(io::Error),
    /// Connect, send, body read or timeout failure talking to a remote server.
    Network(BoxError),
    /// A stored line or URL could not be decoded.
    Protocol(String),
    /// A record is well-formed but cannot be used for the requested operation.
    Validation(String),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn network(err: impl Into<BoxError>) -> Self {
        Self::Network(err.into())
    }

    pub(crate) fn closed(what: &str) -> Self {
        Self::Io(io::Error::other(format!("{what} is closed")))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(message) => write!(f, "configuration error: {message}"),
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Network(err) => write!(f, "network error: {err}"),
            Self::Protocol(message) => write!(f, "protocol error: {message}"),
            Self::Validation(message) => write!(f, "validation error: {message}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Network(err) => Some(err.as_ref()),
            Self::Configuration(_) | Self::Protocol(_) | Self::Validation(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
