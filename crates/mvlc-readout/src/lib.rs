//! Readout data handling for the MVLC VME controller.
//!
//! - [`structure`] derives the fixed shape of each module's readout data
//!   from the readout stacks.
//! - [`parser`] reassembles per-event module data from USB buffers or ETH
//!   packets, tolerating loss and resynchronizing on the next stack frame.
//! - [`listfile`] is the inverse of the parser: it frames module data the
//!   way the controller does, for storage and replay.

pub mod counters;
pub mod error;
pub mod listfile;
pub mod parser;
pub mod structure;

pub use counters::{PartSizeInfo, ReadoutParserCounters};
pub use error::{ReadoutError, Result};
pub use listfile::{write_event_data, write_system_event, GeneratorConfig, DEFAULT_FRAME_MAX_WORDS};
pub use parser::{
    calc_buffer_loss, callbacks_from_fn, parse_readout_buffer, parse_readout_buffer_eth,
    parse_readout_buffer_usb, FnCallbacks, ModuleData, ParseResult, ReadoutParserCallbacks,
    ReadoutParserState,
};
pub use structure::{
    build_readout_structure, module_readout_structure, ModuleReadoutStructure, ReadoutStructure,
};
