use std::io;

/// Failure categories a single connection can end up in. These are the keys
/// of the error counters in the final report; peer closes are not errors and
/// are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    ConnectTimeout,
    ConnectRefused,
    WriteTimeout,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectTimeout => "connect_timeout",
            Self::ConnectRefused => "connect_refused",
            Self::WriteTimeout => "write_timeout",
            Self::Io => "io",
        }
    }
}

/// How a peer close was observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Orderly FIN, seen as a zero-length read.
    Eof,
    /// RST or an aborted/broken pipe surfaced by a write.
    Reset,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("connect failed: {0}")]
    Io(io::Error),
}

impl ConnectError {
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::ConnectTimeout,
            Self::Refused => ErrorKind::ConnectRefused,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Errors that abort the whole run, as opposed to per-connection outcomes
/// which are folded into the report.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(io::Error),
}

// Linux errno values; io::ErrorKind maps neither to a stable variant.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// EMFILE/ENFILE mean the process cannot open further sockets; retrying
/// would only confound the measurement.
pub fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(ENFILE) | Some(EMFILE))
        || err.kind() == io::ErrorKind::OutOfMemory
}
