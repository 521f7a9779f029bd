use crate::error::{Result, TransportError};
use crate::eth::{PayloadHeaderInfo, HEADER_BYTES};
use crate::stream::StreamTransport;
use crate::udp::UdpTransport;

/// The two logical pipes of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    Command = 0,
    Data = 1,
}

impl Pipe {
    pub fn name(self) -> &'static str {
        match self {
            Pipe::Command => "command",
            Pipe::Data => "data",
        }
    }
}

/// How readout buffers are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Continuous byte stream, buffers always start on a frame header.
    Usb,
    /// UDP packets, each prefixed with two ETH payload header words.
    Eth,
}

/// Result of reading a single ETH packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReadResult {
    /// Bytes received including the two header words.
    pub bytes_transferred: usize,
    /// Packets lost on this pipe since the previous read.
    pub lost_packets: u32,
    pub header: PayloadHeaderInfo,
}

impl PacketReadResult {
    /// The payload bytes following the ETH headers.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let end = self.bytes_transferred.min(buf.len());
        &buf[HEADER_BYTES.min(end)..end]
    }
}

/// Capability interface every controller connection provides.
///
/// All methods take `&self`: the command reader thread reads while callers
/// write on the same connection.
pub trait Transport: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    /// Read raw bytes from a stream pipe (blocking, bounded by the read timeout).
    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize>;

    /// Read one ETH packet into `buf`.
    fn read_packet(&self, pipe: Pipe, buf: &mut [u8]) -> Result<PacketReadResult> {
        let _ = (pipe, buf);
        Err(TransportError::Unsupported("read_packet"))
    }

    /// Write bytes to a pipe. Returns the number of bytes written.
    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize>;
}

/// A connected controller, selected once at construction.
#[derive(Debug)]
pub enum Connection {
    Stream(StreamTransport),
    Udp(UdpTransport),
}

impl Transport for Connection {
    fn connection_type(&self) -> ConnectionType {
        match self {
            Connection::Stream(t) => t.connection_type(),
            Connection::Udp(t) => t.connection_type(),
        }
    }

    fn read(&self, pipe: Pipe, buf: &mut [u8]) -> Result<usize> {
        match self {
            Connection::Stream(t) => t.read(pipe, buf),
            Connection::Udp(t) => t.read(pipe, buf),
        }
    }

    fn read_packet(&self, pipe: Pipe, buf: &mut [u8]) -> Result<PacketReadResult> {
        match self {
            Connection::Stream(t) => t.read_packet(pipe, buf),
            Connection::Udp(t) => t.read_packet(pipe, buf),
        }
    }

    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize> {
        match self {
            Connection::Stream(t) => t.write(pipe, data),
            Connection::Udp(t) => t.write(pipe, data),
        }
    }
}

impl From<StreamTransport> for Connection {
    fn from(t: StreamTransport) -> Self {
        Connection::Stream(t)
    }
}

impl From<UdpTransport> for Connection {
    fn from(t: UdpTransport) -> Self {
        Connection::Udp(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_payload_skips_headers() {
        let buf = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let res = PacketReadResult {
            bytes_transferred: 12,
            lost_packets: 0,
            header: PayloadHeaderInfo::new(0, 0),
        };
        assert_eq!(res.payload(&buf), &[9, 10, 11, 12]);
    }

    #[test]
    fn packet_payload_clamps_to_buffer() {
        let buf = [0u8; 6];
        let res = PacketReadResult {
            bytes_transferred: 100,
            lost_packets: 0,
            header: PayloadHeaderInfo::new(0, 0),
        };
        assert!(res.payload(&buf).is_empty());
    }

    #[test]
    fn pipe_names() {
        assert_eq!(Pipe::Command.name(), "command");
        assert_eq!(Pipe::Data.name(), "data");
    }
}
