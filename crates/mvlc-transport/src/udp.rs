use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::eth::{calc_packet_loss, PayloadHeaderInfo, COMMAND_PORT, DATA_PORT, HEADER_BYTES};
use crate::stream::DEFAULT_READ_TIMEOUT;
use crate::traits::{ConnectionType, PacketReadResult, Pipe, Transport};

/// UDP connection settings.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub read_timeout: Option<Duration>,
    pub command_port: u16,
    pub data_port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            command_port: COMMAND_PORT,
            data_port: DATA_PORT,
        }
    }
}

/// Ethernet connection to the controller: one connected UDP socket per pipe.
///
/// Every packet carries the two ETH payload header words. Packet loss is
/// tracked per pipe from the 12-bit packet number.
pub struct UdpTransport {
    command: UdpSocket,
    data: UdpSocket,
    last_packet_numbers: Mutex<[Option<u16>; 2]>,
}

impl UdpTransport {
    /// Resolve `host` and connect both pipes using the configured ports.
    pub fn connect(host: &str, config: &UdpConfig) -> Result<Self> {
        let command = connect_socket(host, config.command_port)?;
        let data = connect_socket(host, config.data_port)?;
        info!(host, "connected udp transport");
        Self::from_sockets(command, data, config)
    }

    /// Wrap already connected sockets.
    pub fn from_sockets(command: UdpSocket, data: UdpSocket, config: &UdpConfig) -> Result<Self> {
        command.set_read_timeout(config.read_timeout)?;
        data.set_read_timeout(config.read_timeout)?;

        Ok(Self {
            command,
            data,
            last_packet_numbers: Mutex::new([None, None]),
        })
    }

    fn socket(&self, pipe: Pipe) -> &UdpSocket {
        match pipe {
            Pipe::Command => &self.command,
            Pipe::Data => &self.data,
        }
    }

    fn update_packet_loss(&self, pipe: Pipe, packet_number: u16) -> u32 {
        let mut last = match self.last_packet_numbers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = &mut last[pipe as usize];
        let loss = slot.map_or(0, |prev| calc_packet_loss(prev, packet_number));
        *slot = Some(packet_number);
        loss
    }
}

fn connect_socket(host: &str, port: u16) -> Result<UdpSocket> {
    let addr = format!("{host}:{port}");
    let map_err = |e: std::io::Error| TransportError::Connect {
        addr: addr.clone(),
        source: e,
    };

    let remote: SocketAddr = addr
        .to_socket_addrs()
        .map_err(map_err)?
        .next()
        .ok_or_else(|| map_err(std::io::Error::from(ErrorKind::AddrNotAvailable)))?;

    let local: SocketAddr = if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };

    let socket = UdpSocket::bind(local).map_err(map_err)?;
    socket.connect(remote).map_err(map_err)?;
    Ok(socket)
}

impl Transport for UdpTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Eth
    }

    fn read(&self, _pipe: Pipe, _buf: &mut [u8]) -> Result<usize> {
        Err(TransportError::Unsupported("stream read on udp transport"))
    }

    fn read_packet(&self, pipe: Pipe, buf: &mut [u8]) -> Result<PacketReadResult> {
        let n = loop {
            match self.socket(pipe).recv(buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::from_io(err)),
            }
        };

        if n < HEADER_BYTES {
            return Err(TransportError::ShortRead {
                len: n,
                min: HEADER_BYTES,
            });
        }

        let header = PayloadHeaderInfo::new(
            u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        );

        let lost_packets = self.update_packet_loss(pipe, header.packet_number());

        if lost_packets > 0 {
            debug!(
                pipe = pipe.name(),
                packet_number = header.packet_number(),
                lost_packets,
                "packet loss detected"
            );
        }

        Ok(PacketReadResult {
            bytes_transferred: n,
            lost_packets,
            header,
        })
    }

    fn write(&self, pipe: Pipe, data: &[u8]) -> Result<usize> {
        self.socket(pipe)
            .send(data)
            .map_err(TransportError::from_io)
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("command", &self.command.peer_addr().ok())
            .field("data", &self.data.peer_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_pair() -> (UdpTransport, UdpSocket, UdpSocket) {
        let device_cmd = UdpSocket::bind("127.0.0.1:0").unwrap();
        let device_data = UdpSocket::bind("127.0.0.1:0").unwrap();

        let cmd = UdpSocket::bind("127.0.0.1:0").unwrap();
        cmd.connect(device_cmd.local_addr().unwrap()).unwrap();
        let data = UdpSocket::bind("127.0.0.1:0").unwrap();
        data.connect(device_data.local_addr().unwrap()).unwrap();

        device_cmd.connect(cmd.local_addr().unwrap()).unwrap();
        device_data.connect(data.local_addr().unwrap()).unwrap();

        let transport = UdpTransport::from_sockets(cmd, data, &UdpConfig::default()).unwrap();
        (transport, device_cmd, device_data)
    }

    fn packet(number: u16, payload: &[u32]) -> Vec<u8> {
        let hdr = PayloadHeaderInfo::encode(0, number, payload.len() as u16, 0, 0);
        let mut out = Vec::new();
        out.extend_from_slice(&hdr.header0.to_le_bytes());
        out.extend_from_slice(&hdr.header1.to_le_bytes());
        for w in payload {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    #[test]
    fn reads_packet_headers_and_payload() {
        let (transport, device_cmd, _device_data) = loopback_pair();
        device_cmd.send(&packet(5, &[0xF1000001, 0x01010001])).unwrap();

        let mut buf = [0u8; 1500];
        let res = transport.read_packet(Pipe::Command, &mut buf).unwrap();
        assert_eq!(res.bytes_transferred, 16);
        assert_eq!(res.header.packet_number(), 5);
        assert_eq!(res.lost_packets, 0);
        assert_eq!(res.payload(&buf).len(), 8);
    }

    #[test]
    fn tracks_packet_loss_per_pipe() {
        let (transport, device_cmd, device_data) = loopback_pair();
        let mut buf = [0u8; 1500];

        device_data.send(&packet(1, &[])).unwrap();
        device_data.send(&packet(4, &[])).unwrap();
        device_cmd.send(&packet(100, &[])).unwrap();

        assert_eq!(transport.read_packet(Pipe::Data, &mut buf).unwrap().lost_packets, 0);
        assert_eq!(transport.read_packet(Pipe::Data, &mut buf).unwrap().lost_packets, 2);
        assert_eq!(transport.read_packet(Pipe::Command, &mut buf).unwrap().lost_packets, 0);
    }

    #[test]
    fn short_packet_is_an_error() {
        let (transport, device_cmd, _device_data) = loopback_pair();
        device_cmd.send(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 64];
        let err = transport.read_packet(Pipe::Command, &mut buf).unwrap_err();
        assert!(matches!(err, TransportError::ShortRead { len: 3, .. }));
    }

    #[test]
    fn write_sends_datagram() {
        let (transport, device_cmd, _device_data) = loopback_pair();
        transport.write(Pipe::Command, &[0xaa, 0xbb]).unwrap();

        let mut buf = [0u8; 16];
        let n = device_cmd.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xaa, 0xbb]);
        assert_eq!(transport.connection_type(), ConnectionType::Eth);
    }

    #[test]
    fn read_timeout_maps_to_timeout() {
        let (transport, _device_cmd, _device_data) = loopback_pair();
        let mut buf = [0u8; 64];
        let err = transport.read_packet(Pipe::Command, &mut buf).unwrap_err();
        assert!(err.is_timeout());
    }
}
