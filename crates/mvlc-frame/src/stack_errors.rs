//! Stack error accounting.
//!
//! The controller reports errors during stack execution as two-word
//! StackError frames on the command pipe. The second word holds the stack
//! line that failed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::codec::{extract_frame_info, FrameType};

/// Number of command stacks on the controller.
pub const STACK_COUNT: usize = 8;

pub const STACK_LINE_MASK: u32 = 0xffff;

/// Identifies one kind of stack error: the failing line and the frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ErrorInfo {
    pub line: u16,
    pub flags: u8,
}

pub type ErrorInfoCounts = BTreeMap<ErrorInfo, usize>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackErrorCounters {
    pub stack_errors: [ErrorInfoCounts; STACK_COUNT],
    pub non_error_frames: usize,
    /// Header value -> count for frames that were not valid error frames.
    pub non_error_header_counts: BTreeMap<u32, usize>,
}

impl StackErrorCounters {
    /// Account for a single frame received where a stack error was expected.
    pub fn update(&mut self, frame: &[u32]) {
        let Some(&header) = frame.first() else {
            return;
        };

        let info = extract_frame_info(header);

        if frame.len() == 2
            && info.frame_type() == Some(FrameType::StackError)
            && (info.stack as usize) < STACK_COUNT
        {
            let line = (frame[1] & STACK_LINE_MASK) as u16;
            let key = ErrorInfo {
                line,
                flags: info.flags.bits(),
            };
            *self.stack_errors[info.stack as usize].entry(key).or_default() += 1;
        } else {
            self.non_error_frames += 1;
            *self.non_error_header_counts.entry(header).or_default() += 1;
        }
    }

    pub fn total_errors(&self) -> usize {
        self.stack_errors.iter().flat_map(|m| m.values()).sum()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Pack one counter entry: `stack[31:28] | flags[27:24] | line[23:16] | count[15:0]`.
///
/// Counts saturate at 0xffff.
pub fn stack_error_info_to_sysevent_data(stack_id: u8, info: &ErrorInfo, count: usize) -> u32 {
    let count = count.min(0xffff) as u32;

    ((stack_id as u32 & 0xf) << 28)
        | ((info.flags as u32 & 0xf) << 24)
        | ((info.line as u32 & 0xff) << 16)
        | count
}

/// Payload for a StackErrors system event, skipping zero counts.
pub fn stack_errors_to_sysevent_data(errors: &[ErrorInfoCounts; STACK_COUNT]) -> Vec<u32> {
    let mut out = Vec::new();
    for (stack_id, counts) in errors.iter().enumerate() {
        for (info, &count) in counts {
            if count > 0 {
                out.push(stack_error_info_to_sysevent_data(stack_id as u8, info, count));
            }
        }
    }
    out
}

pub fn decode_stack_errors_sysevent_data(data: &[u32]) -> [ErrorInfoCounts; STACK_COUNT] {
    let mut result: [ErrorInfoCounts; STACK_COUNT] = Default::default();

    for &word in data {
        let stack_id = ((word >> 28) & 0xf) as usize;
        let info = ErrorInfo {
            flags: ((word >> 24) & 0xf) as u8,
            line: ((word >> 16) & 0xff) as u16,
        };
        let count = (word & 0xffff) as usize;

        if let Some(counts) = result.get_mut(stack_id) {
            counts.insert(info, count);
        }
    }

    result
}
