//! Frame codec and command encoding for the MVLC VME controller.
//!
//! Everything the controller sends is a sequence of 32-bit words grouped into
//! frames. A frame header carries the frame type, error/continue flags, a
//! stack number or controller id, and the number of following words:
//!
//! ```text
//! Type[31:24] | Flags[23:20] | Stack[19:16] | CtrlId[15:13] | Length[12:0]
//! ```
//!
//! This crate holds the pure header codec, the super and stack command
//! models with their wire encodings, stack error accounting, and a buffered
//! [`FrameReader`] that turns raw pipe reads into complete frames.

pub mod codec;
pub mod commands;
pub mod error;
pub mod reader;
pub mod stack;
pub mod stack_errors;
pub mod system_event;
pub mod vme;
pub mod writer;

pub use codec::{
    decode_frame, decode_frame_header, encode_frame_header, extract_frame_info, is_good_header,
    is_known_frame_header, Frame, FrameFlags, FrameInfo, FrameType,
};
pub use commands::{make_command_buffer, SuperCommand, SuperCommandBuilder, SuperCommandType};
pub use error::{FrameError, Result};
pub use reader::{FillResult, FrameReader};
pub use stack::{
    decode_stack, encode_stack, make_stack_upload_commands, StackCommand, StackCommandBuilder,
    StackGroup,
};
pub use stack_errors::{ErrorInfo, StackErrorCounters};
pub use vme::{Blk2eSstRate, VmeDataWidth};
pub use writer::write_words;
