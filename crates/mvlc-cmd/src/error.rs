use mvlc_frame::FrameError;
use mvlc_transport::TransportError;

/// Errors from command pipe transactions.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    /// The command pipe reader has stopped; no response can arrive.
    #[error("not connected")]
    IsDisconnected,

    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },

    /// A stack response without the reference word.
    #[error("mirror response too short")]
    MirrorShortResponse,

    #[error("unexpected response size ({got} words, expected {expected})")]
    UnexpectedResponseSize { expected: usize, got: usize },

    /// The VME transfer timed out on the bus.
    #[error("no VME response")]
    NoVmeResponse,

    #[error("VME bus error")]
    VmeBusError,

    #[error("stack memory exceeded (write address {address:#06x})")]
    StackMemoryExceeded { address: u16 },

    #[error("mirror transaction too long ({words} words, max {max})")]
    MirrorTransactionMaxWordsExceeded { words: usize, max: usize },

    #[error("address modifier {amod:#04x} is not a block transfer mode")]
    NonBlockAddressMode { amod: u8 },

    #[error("super command timeout")]
    SuperCommandTimeout,

    #[error("stack command timeout")]
    StackCommandTimeout,

    /// A super frame of length zero.
    #[error("short super frame")]
    ShortSuperFrame,

    /// A super frame or command list not starting with a reference word.
    #[error("super format error")]
    SuperFormatError,

    /// A stack not starting with a marker holding the reference.
    #[error("stack format error")]
    StackFormatError,

    #[error("super reference mismatch (expected {expected:#06x}, got {got:#06x})")]
    SuperReferenceMismatch { expected: u16, got: u16 },

    #[error("stack reference mismatch (expected {expected:#010x}, got {got:#010x})")]
    StackReferenceMismatch { expected: u32, got: u32 },

    #[error("failed to start command pipe reader: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(FrameError),
}

impl CmdError {
    pub fn is_timeout(&self) -> bool {
        match self {
            CmdError::SuperCommandTimeout | CmdError::StackCommandTimeout => true,
            CmdError::Transport(err) => err.is_timeout(),
            _ => false,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        match self {
            CmdError::IsDisconnected => true,
            CmdError::Transport(err) => err.is_disconnect(),
            _ => false,
        }
    }
}

impl From<FrameError> for CmdError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::StackMemoryExceeded { address } => CmdError::StackMemoryExceeded { address },
            FrameError::MirrorTransactionMaxWordsExceeded { words, max } => {
                CmdError::MirrorTransactionMaxWordsExceeded { words, max }
            }
            FrameError::ShortWrite { written, expected } => CmdError::ShortWrite { written, expected },
            FrameError::Transport(err) => CmdError::Transport(err),
            other => CmdError::Frame(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CmdError>;
