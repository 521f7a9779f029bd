//! Command pipe transactions for the MVLC VME controller.
//!
//! The controller answers commands on the same pipe it receives them on.
//! [`CmdPipe`] runs a reader thread that matches every response to the
//! outstanding request by its reference word:
//!
//! - *super transactions* write a command buffer and wait for the mirrored
//!   super frame
//! - *stack transactions* upload an immediate stack, trigger it with a super
//!   transaction and then wait for the stack frame it produces
//!
//! Stack error notifications arriving on the command pipe are accumulated
//! in [`StackErrorCounters`](mvlc_frame::StackErrorCounters).
//!
//! ```no_run
//! use mvlc_cmd::{CmdPipe, CmdPipeConfig};
//! use mvlc_frame::{vme::amods, VmeDataWidth};
//! use mvlc_transport::{StreamConfig, StreamTransport};
//!
//! let transport = StreamTransport::connect_unix("/tmp/mvlc-cmd.sock", None, &StreamConfig::default())?;
//! let mvlc = CmdPipe::new(transport, CmdPipeConfig::default())?;
//!
//! let firmware = mvlc.read_register(0x6008)?;
//! let value = mvlc.vme_read(0xffff_0000 + 0x6008, amods::A32, VmeDataWidth::D16)?;
//! println!("{firmware:#06x} {value:#06x}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod pending;
mod reader;

pub use config::CmdPipeConfig;
pub use counters::CmdPipeCounters;
pub use engine::CmdPipe;
pub use error::{CmdError, Result};
pub use pending::PendingSlot;
