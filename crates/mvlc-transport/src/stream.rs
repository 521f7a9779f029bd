use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{ConnectionType, Pipe, Transport};

/// Default read timeout. The command reader re-checks its stop flag at this interval.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeouts applied to both pipes of a stream connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
        }
    }
}

enum PipeStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl PipeStream {
    fn apply(&self, config: &StreamConfig) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(s) => {
                s.set_read_timeout(config.read_timeout)?;
                s.set_write_timeout(config.write_timeout)
            }
            PipeStream::Tcp(s) => {
                s.set_read_timeout(config.read_timeout)?;
                s.set_write_timeout(config.write_timeout)
            }
        }
    }

    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(s) => (&*s).read(buf),
            PipeStream::Tcp(s) => (&*s).read(buf),
        }
    }

    fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(s) => (&*s).write_all(data),
            PipeStream::Tcp(s) => (&*s).write_all(data),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(_) => "unix",
            PipeStream::Tcp(_) => "tcp",
        }
    }
}

/// Byte-stream connection to the controller (USB-style framing).
///
/// Readout buffers from a stream pipe always start on a frame header. The
/// data pipe is optional; command-only connections are enough for register
/// and VME access.
pub struct StreamTransport {
    command: PipeStream,
    data: Option<PipeStream>,
}

impl StreamTransport {
    /// Wrap already connected Unix stream sockets.
    #[cfg(unix)]
    pub fn from_unix(
        command: UnixStream,
        data: Option<UnixStream>,
        config: &StreamConfig,
    ) -> Result<Self> {
        Self::from_parts(PipeStream::Unix(command), data.map(PipeStream::Unix), config)
    }

    /// Connect to Unix stream sockets serving the command and data pipes.
    #[cfg(unix)]
    pub fn connect_unix(
        command_path: impl AsRef<Path>,
        data_path: Option<&Path>,
        config: &StreamConfig,
    ) -> Result<Self> {
        let command_path = command_path.as_ref();
        let command = UnixStream::connect(command_path).map_err(|e| TransportError::Connect {
            addr: command_path.display().to_string(),
            source: e,
        })?;

        let data = match data_path {
            Some(path) => Some(UnixStream::connect(path).map_err(|e| {
                TransportError::Connect {
                    addr: path.display().to_string(),
                    source: e,
                }
            })?),
            None => None,
        };

        info!(path = ?command_path, "connected stream transport");
        Self::from_unix(command, data, config)
    }

    /// Wrap already connected TCP streams.
    pub fn from_tcp(
        command: TcpStream,
        data: Option<TcpStream>,
        config: &StreamConfig,
    ) -> Result<Self> {
        Self::from_parts(PipeStream::Tcp(command), data.map(PipeStream::Tcp), config)
    }

    fn from_parts(
        command: PipeStream,
        data: Option<PipeStream>,
        config: &StreamConfig,
    ) -> Result<Self> {
        command.apply(config)?;
        if let Some(data) = &data {
            data.apply(config)?;
        }
        debug!(kind = command.kind(), has_data = data.is_some(), "stream transport ready");
        Ok(Self { command, data })
    }

    fn pipe(&self, pipe: Pipe) -> Result<&PipeStream> {
        match pipe {
            Pipe::Command => Ok(&self.command),
            Pipe::Data => self
                .data
                .as_ref()
                .ok_or(TransportError::PipeNotConnected(pipe.name())),
        }
    }
}

impl Transport for StreamTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize> {
        let stream = self.pipe(pipe)?;
        loop {
            match stream.read(buf) {
                Ok(0) if !buf.is_empty() => {
                    return Err(TransportError::Disconnected(format!(
                        "{} pipe closed",
                        pipe.name()
                    )))
                }
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::from_io(err)),
            }
        }
    }

    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize> {
        self.pipe(pipe)?
            .write_all(data)
            .map_err(TransportError::from_io)?;
        Ok(data.len())
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("type", &self.command.kind())
            .field("data_pipe", &self.data.is_some())
            .finish()
    }
}
