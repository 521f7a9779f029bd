/// Errors from command encoding and frame I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The command exists only on the host side and has no wire form.
    #[error("stack command {0} cannot be encoded")]
    UnsupportedStackCommand(&'static str),

    /// A stack upload would write past the end of stack memory.
    #[error("stack memory exceeded (write address {address:#06x})")]
    StackMemoryExceeded { address: u16 },

    /// A super transaction is longer than the controller mirrors back.
    #[error("mirror transaction too long ({words} words, max {max})")]
    MirrorTransactionMaxWordsExceeded { words: usize, max: usize },

    /// Fewer bytes than requested reached the transport.
    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },

    /// An I/O error occurred while reading frame data from a file or stream.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] mvlc_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, FrameError>;
