use std::io::ErrorKind;

/// Errors that can occur in MVLC transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the device.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking read or write hit its configured timeout.
    #[error("transport timeout")]
    Timeout,

    /// The remote side went away.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Fewer bytes than requested were written.
    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },

    /// A packet was too short to contain the ETH payload headers.
    #[error("short read ({len} bytes, need at least {min})")]
    ShortRead { len: usize, min: usize },

    /// The operation is not available on this kind of connection.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The requested pipe is not connected.
    #[error("pipe {0} is not connected")]
    PipeNotConnected(&'static str),
}

impl TransportError {
    /// Classify a raw I/O error into timeout / disconnect / other.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => TransportError::Disconnected(err.to_string()),
            _ => TransportError::Io(err),
        }
    }

    /// True for read/write timeouts. The command reader tolerates these.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// True when the connection is gone and further reads are pointless.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected(_) | TransportError::PipeNotConnected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
