//! Transport abstraction for the MVLC VME controller.
//!
//! The controller exposes two logical pipes (command and data) over either a
//! USB bulk stream or a pair of UDP sockets. Everything above this crate talks
//! to the device through the [`Transport`] capability trait:
//! - [`StreamTransport`] for byte-stream connections (USB-like framing)
//! - [`UdpTransport`] for Ethernet connections with per-packet headers
//!
//! This is the lowest layer of the workspace.

pub mod error;
pub mod eth;
pub mod stream;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use eth::{calc_packet_loss, PacketChannel, PayloadHeaderInfo};
pub use stream::{StreamConfig, StreamTransport};
pub use traits::{Connection, ConnectionType, PacketReadResult, Pipe, Transport};
pub use udp::{UdpConfig, UdpTransport};
