//! Error types reported through a connection's end callback.

use std::fmt;
use std::io;

/// Post-handshake trust failure.
///
/// Reported to the end callback before the connection is torn down. The
/// receiver may call [`TrustFailure::set_ignore`] to let the handshake proceed
/// anyway, e.g. for a pinned-certificate override prompt.
#[derive(Debug)]
pub struct TrustFailure {
    cause: rustls::Error,
    ignore: bool,
}

impl TrustFailure {
    pub fn new(cause: rustls::Error) -> Self {
        Self {
            cause,
            ignore: false,
        }
    }

    pub fn cause(&self) -> &rustls::Error {
        &self.cause
    }

    pub fn set_ignore(&mut self, ignore: bool) {
        self.ignore = ignore;
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore
    }
}

impl fmt::Display for TrustFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer not trusted: {}", self.cause)
    }
}

impl std::error::Error for TrustFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Failure while negotiating an HTTP CONNECT tunnel.
#[derive(Debug)]
pub enum TunnelError {
    /// The proxy's status line did not contain `200`.
    NonOkStatus(String),
    /// The proxy's status line exceeded the maximum accepted length.
    StatusLineTooLong(usize),
    /// The line following the status line was not blank.
    UnknownSecondStatusLine(String),
    /// The proxy closed the stream before sending both response lines.
    ClosedBeforeResponse,
    Io(io::Error),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::NonOkStatus(line) => write!(f, "non 200 status line: {line}"),
            TunnelError::StatusLineTooLong(len) => {
                write!(f, "non 200 status line: line too long ({len} chars)")
            }
            TunnelError::UnknownSecondStatusLine(line) => {
                write!(f, "unknown second status line: {line}")
            }
            TunnelError::ClosedBeforeResponse => {
                write!(f, "socket closed before proxy connect response")
            }
            TunnelError::Io(e) => write!(f, "proxy connect failed: {e}"),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunnelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(e: io::Error) -> Self {
        TunnelError::Io(e)
    }
}

impl From<TunnelError> for io::Error {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::Io(e) => e,
            TunnelError::ClosedBeforeResponse => {
                io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Everything a TLS connection can report through its end callback.
#[derive(Debug)]
pub enum SslError {
    /// The underlying transport failed; surfaced verbatim.
    Transport(io::Error),
    /// The handshake engine rejected a record or failed to produce one.
    Engine(io::Error),
    Trust(TrustFailure),
    Tunnel(TunnelError),
}

impl SslError {
    /// Marks a trust failure as ignorable. Has no effect on other errors.
    pub fn set_ignore(&mut self, ignore: bool) {
        if let SslError::Trust(failure) = self {
            failure.set_ignore(ignore);
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, SslError::Trust(failure) if failure.is_ignored())
    }

    pub fn is_trust_failure(&self) -> bool {
        matches!(self, SslError::Trust(_))
    }
}

impl fmt::Display for SslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SslError::Transport(e) => write!(f, "transport error: {e}"),
            SslError::Engine(e) => write!(f, "tls error: {e}"),
            SslError::Trust(e) => e.fmt(f),
            SslError::Tunnel(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for SslError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SslError::Transport(e) | SslError::Engine(e) => Some(e),
            SslError::Trust(e) => Some(e),
            SslError::Tunnel(e) => Some(e),
        }
    }
}

impl From<TunnelError> for SslError {
    fn from(e: TunnelError) -> Self {
        SslError::Tunnel(e)
    }
}

impl From<TrustFailure> for SslError {
    fn from(e: TrustFailure) -> Self {
        SslError::Trust(e)
    }
}

impl From<SslError> for io::Error {
    fn from(e: SslError) -> Self {
        match e {
            SslError::Transport(e) | SslError::Engine(e) => e,
            SslError::Trust(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            SslError::Tunnel(e) => e.into(),
        }
    }
}
