use std::fmt;
use std::io;

use mvlc_cmd::CmdError;
use mvlc_frame::FrameError;
use mvlc_readout::ReadoutError;
use mvlc_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        TransportError::Timeout => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Transport(err) => transport_error(context, err),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn readout_error(context: &str, err: ReadoutError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn cmd_error(context: &str, err: CmdError) -> CliError {
    match err {
        CmdError::Transport(err) => transport_error(context, err),
        CmdError::Frame(err) => frame_error(context, err),
        CmdError::Spawn(source) => io_error(context, source),
        err if err.is_timeout() => CliError::new(TIMEOUT, format!("{context}: {err}")),
        err if err.is_disconnect() => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        err @ (CmdError::NonBlockAddressMode { .. }
        | CmdError::StackMemoryExceeded { .. }
        | CmdError::MirrorTransactionMaxWordsExceeded { .. }) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn json_error(context: &str, err: serde_json::Error) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}
