//! Framing protocol engine for the mesytec MVLC VME controller.
//!
//! The controller talks to the host over two pipes. The command pipe carries
//! request/response transactions; the data pipe carries readout data framed
//! into stack, block and system event frames. This crate bundles the layers:
//!
//! - [`transport`]: pipe I/O over byte streams or UDP with ETH packet headers
//! - [`frame`]: frame header codec, super and stack commands, stack errors
//! - [`readout`]: readout structure, readout parser and listfile framing
//! - [`cmd`]: the command pipe transaction engine and register/VME API

/// Re-export transport types.
pub mod transport {
    pub use mvlc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use mvlc_frame::*;
}

/// Re-export readout types.
pub mod readout {
    pub use mvlc_readout::*;
}

/// Re-export command pipe types.
pub mod cmd {
    pub use mvlc_cmd::*;
}
