//! System event header layout and subtypes.
//!
//! ```text
//! Type(0xFA)[31:24] | Continue[23] | CtrlId[22:20] | Subtype[19:13] | Length[12:0]
//! ```

use crate::codec::{FrameType, LENGTH_MASK, TYPE_SHIFT};

pub const CONTINUE_SHIFT: u32 = 23;
pub const CONTINUE_MASK: u32 = 0b1;
pub const CTRL_ID_SHIFT: u32 = 20;
pub const CTRL_ID_MASK: u32 = 0b111;
pub const SUBTYPE_SHIFT: u32 = 13;
pub const SUBTYPE_MASK: u32 = 0x7f;

/// Written as the only payload word of an EndianMarker event.
pub const ENDIAN_MARKER_VALUE: u32 = 0x12345678;

pub mod subtype {
    pub const ENDIAN_MARKER: u8 = 0x01;
    pub const BEGIN_RUN: u8 = 0x02;
    pub const END_RUN: u8 = 0x03;
    pub const MVME_CONFIG: u8 = 0x10;
    pub const UNIX_TIMETICK: u8 = 0x11;
    pub const PAUSE: u8 = 0x12;
    pub const RESUME: u8 = 0x13;
    pub const MVLC_CRATE_CONFIG: u8 = 0x14;
    /// Packed stack error counters, see [`crate::stack_errors`].
    pub const STACK_ERRORS: u8 = 0x15;
    pub const END_OF_FILE: u8 = 0x77;
    pub const SUBTYPE_MAX: u8 = 0x7f;
}

/// Number of distinct subtype values.
pub const SUBTYPE_COUNT: usize = subtype::SUBTYPE_MAX as usize + 1;

pub fn make_header(subtype: u8, ctrl_id: u8, continue_bit: bool, len: u16) -> u32 {
    ((FrameType::SystemEvent as u32) << TYPE_SHIFT)
        | ((continue_bit as u32 & CONTINUE_MASK) << CONTINUE_SHIFT)
        | ((ctrl_id as u32 & CTRL_ID_MASK) << CTRL_ID_SHIFT)
        | ((subtype as u32 & SUBTYPE_MASK) << SUBTYPE_SHIFT)
        | (len as u32 & LENGTH_MASK)
}

pub fn extract_subtype(header: u32) -> u8 {
    ((header >> SUBTYPE_SHIFT) & SUBTYPE_MASK) as u8
}

pub fn has_continue(header: u32) -> bool {
    (header >> CONTINUE_SHIFT) & CONTINUE_MASK != 0
}

pub fn subtype_name(subtype: u8) -> String {
    let name = match subtype {
        subtype::ENDIAN_MARKER => "EndianMarker",
        subtype::BEGIN_RUN => "BeginRun",
        subtype::END_RUN => "EndRun",
        subtype::MVME_CONFIG => "MVMEConfig",
        subtype::UNIX_TIMETICK => "UnixTimetick",
        subtype::PAUSE => "Pause",
        subtype::RESUME => "Resume",
        subtype::MVLC_CRATE_CONFIG => "MVLCCrateConfig",
        subtype::STACK_ERRORS => "MVLCStackErrors",
        subtype::END_OF_FILE => "EndOfFile",
        other => return format!("custom ({other:#04x})"),
    };
    name.to_string()
}
