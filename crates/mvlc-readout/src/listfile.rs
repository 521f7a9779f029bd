//! Listfile frame generator.
//!
//! Re-frames parsed module data the way the controller frames readout
//! output, so listfiles can be replayed through the readout parser. Frames
//! are split into continuation frames when they would exceed the
//! configured maximum length.

use mvlc_frame::codec::{
    CTRL_ID_SHIFT, FLAGS_SHIFT, LENGTH_MASK, MAX_FRAME_LENGTH, STACK_NUM_MASK, STACK_NUM_SHIFT,
    TYPE_SHIFT,
};
use mvlc_frame::system_event;
use mvlc_frame::{FrameFlags, FrameType};
use tracing::trace;

use crate::error::{ReadoutError, Result};
use crate::parser::ModuleData;

/// Largest frame length the header can express.
pub const DEFAULT_FRAME_MAX_WORDS: u32 = MAX_FRAME_LENGTH as u32;

const CONTINUE_BIT: u32 = (FrameFlags::CONTINUE.0 as u32) << FLAGS_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Maximum number of words following a frame header. Values below 2
    /// make the generator write nothing.
    pub frame_max_words: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            frame_max_words: DEFAULT_FRAME_MAX_WORDS,
        }
    }
}

/// An open frame: the index of its header in the output and its length so far.
#[derive(Debug, Clone, Copy, Default)]
struct FrameState {
    header_index: Option<usize>,
    words_written: u32,
}

impl FrameState {
    fn is_open(&self) -> bool {
        self.header_index.is_some()
    }

    fn push_header(&mut self, dest: &mut Vec<u32>, header: u32) {
        dest.push(header);
        self.header_index = Some(dest.len() - 1);
        self.words_written = 0;
    }

    fn set_continue(&self, dest: &mut [u32], bit: u32) {
        if let Some(index) = self.header_index {
            dest[index] |= bit;
        }
    }

    /// Write the final length into the header and close the frame.
    fn close(&mut self, dest: &mut [u32]) {
        if let Some(index) = self.header_index.take() {
            dest[index] = (dest[index] & !LENGTH_MASK) | (self.words_written & LENGTH_MASK);
        }
        self.words_written = 0;
    }
}

struct EventWriter<'a> {
    dest: &'a mut Vec<u32>,
    frame_max_words: u32,
    stack_header: u32,
    stack: FrameState,
    block: FrameState,
}

impl EventWriter<'_> {
    fn start_stack_frame(&mut self) {
        let header = self.stack_header | ((FrameType::StackFrame as u32) << TYPE_SHIFT);
        self.stack.push_header(self.dest, header);
    }

    /// Close the current stack frame (and block frame, if open) with the
    /// Continue flag set and open a continuation frame.
    fn continue_stack_frame(&mut self) {
        let reopen_block = self.block.is_open();

        if reopen_block {
            self.block.set_continue(self.dest, CONTINUE_BIT);
            self.block.close(self.dest);
        }

        self.stack.set_continue(self.dest, CONTINUE_BIT);
        self.stack.close(self.dest);

        let header = self.stack_header | ((FrameType::StackContinuation as u32) << TYPE_SHIFT);
        self.stack.push_header(self.dest, header);

        if reopen_block {
            self.start_block_frame();
        }
    }

    fn start_block_frame(&mut self) {
        // A block header as the last word of a stack frame would leave an
        // empty block frame with Continue set.
        if self.stack.words_written + 1 >= self.frame_max_words {
            self.continue_stack_frame();
        }

        self.block
            .push_header(self.dest, (FrameType::BlockRead as u32) << TYPE_SHIFT);
        self.stack.words_written += 1;
    }

    fn continue_block_frame(&mut self) {
        self.block.set_continue(self.dest, CONTINUE_BIT);
        self.block.close(self.dest);
        self.block
            .push_header(self.dest, (FrameType::BlockRead as u32) << TYPE_SHIFT);
        self.stack.words_written += 1;
    }

    fn push_data_word(&mut self, word: u32) {
        self.dest.push(word);
        if self.block.is_open() {
            self.block.words_written += 1;
        }
        self.stack.words_written += 1;
    }

    fn ensure_stack_space(&mut self) {
        if !self.stack.is_open() {
            self.start_stack_frame();
        } else if self.stack.words_written >= self.frame_max_words {
            self.continue_stack_frame();
        }
    }

    fn write_word(&mut self, word: u32) {
        self.ensure_stack_space();
        self.push_data_word(word);
    }

    fn write_block_word(&mut self, word: u32) {
        self.ensure_stack_space();

        if !self.block.is_open() {
            self.start_block_frame();
        } else if self.block.words_written >= self.frame_max_words {
            self.continue_block_frame();
        }

        self.push_data_word(word);
    }

    fn write_module(&mut self, module: &ModuleData<'_>) {
        for &word in module.prefix() {
            self.write_word(word);
        }

        // Modules with a dynamic part always get a block frame, even an empty one.
        if module.has_dynamic {
            self.start_block_frame();
            for &word in module.dynamic() {
                self.write_block_word(word);
            }
            self.block.close(self.dest);
        }

        for &word in module.suffix() {
            self.write_word(word);
        }
    }
}

/// Append the framed readout data of one event to `dest`.
///
/// A stack frame is written even if no module carries data. Nothing is
/// written for an empty module list or a frame limit below 2. Modules whose
/// part sizes disagree with their data are rejected before anything is
/// written.
pub fn write_event_data(
    dest: &mut Vec<u32>,
    crate_index: u8,
    event_index: usize,
    modules: &[ModuleData<'_>],
    frame_max_words: u32,
) -> Result<()> {
    // The readout stack of event 0 is stack 1.
    let max = STACK_NUM_MASK as usize - 1;
    if event_index > max {
        return Err(ReadoutError::StackIndexOutOfRange {
            index: event_index,
            max,
        });
    }

    if let Some(module) = modules
        .iter()
        .position(|m| !m.is_consistent() || (!m.has_dynamic && m.dynamic_size > 0))
    {
        return Err(ReadoutError::InconsistentModuleData { module });
    }

    if modules.is_empty() || frame_max_words <= 1 {
        return Ok(());
    }

    let stack_header = ((event_index as u32 + 1) << STACK_NUM_SHIFT)
        | ((crate_index as u32 & mvlc_frame::codec::CTRL_ID_MASK) << CTRL_ID_SHIFT);

    let start = dest.len();
    let mut writer = EventWriter {
        dest,
        frame_max_words: frame_max_words.min(DEFAULT_FRAME_MAX_WORDS),
        stack_header,
        stack: FrameState::default(),
        block: FrameState::default(),
    };

    writer.start_stack_frame();
    for module in modules {
        writer.write_module(module);
    }
    writer.stack.close(writer.dest);

    trace!(
        crate_index,
        event_index,
        words = writer.dest.len() - start,
        "wrote event data"
    );
    Ok(())
}

/// Append a system event to `dest`, adding `crate_index` to its header.
///
/// `header_and_data` starts with the system event header; its length field
/// is ignored. Payloads longer than `frame_max_words` are split into
/// sections linked by the header's continue bit.
pub fn write_system_event(
    dest: &mut Vec<u32>,
    crate_index: u8,
    header_and_data: &[u32],
    frame_max_words: u32,
) {
    let Some((&header, data)) = header_and_data.split_first() else {
        return;
    };

    if frame_max_words <= 1 {
        return;
    }
    let frame_max_words = frame_max_words.min(DEFAULT_FRAME_MAX_WORDS) as usize;

    let continue_bit = system_event::CONTINUE_MASK << system_event::CONTINUE_SHIFT;
    let header = (header & !(LENGTH_MASK | continue_bit))
        | ((crate_index as u32 & system_event::CTRL_ID_MASK) << system_event::CTRL_ID_SHIFT);

    let mut frame = FrameState::default();
    let mut chunks = data.chunks(frame_max_words).peekable();

    frame.push_header(dest, header);

    while let Some(chunk) = chunks.next() {
        dest.extend_from_slice(chunk);
        frame.words_written = chunk.len() as u32;

        if chunks.peek().is_some() {
            frame.set_continue(dest, continue_bit);
            frame.close(dest);
            frame.push_header(dest, header);
        }
    }

    frame.close(dest);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic_module(data: &[u32]) -> ModuleData<'_> {
        ModuleData {
            data,
            prefix_size: 0,
            dynamic_size: data.len(),
            suffix_size: 0,
            has_dynamic: true,
        }
    }

    #[test]
    fn frame_limit_three() {
        let m0 = [0x10000001, 0x10000002];
        let m1 = [0x20000001, 0x20000002];
        let mut dest = Vec::new();

        write_event_data(&mut dest, 1, 2, &[dynamic_module(&m0), dynamic_module(&m1)], 3).unwrap();

        assert_eq!(
            dest,
            vec![
                0xF3832003, 0xF5000002, 0x10000001, 0x10000002, 0xF9032003, 0xF5000002,
                0x20000001, 0x20000002
            ]
        );
    }

    #[test]
    fn empty_dynamic_part_gets_empty_block_frame() {
        let data = [0xa, 0xb];
        let module = ModuleData {
            data: &data,
            prefix_size: 1,
            dynamic_size: 0,
            suffix_size: 1,
            has_dynamic: true,
        };
        let mut dest = Vec::new();
        write_event_data(&mut dest, 0, 0, &[module], DEFAULT_FRAME_MAX_WORDS).unwrap();
        assert_eq!(dest, vec![0xF3010003, 0xa, 0xF5000000, 0xb]);
    }

    #[test]
    fn nothing_written_for_degenerate_input() {
        let mut dest = Vec::new();
        write_event_data(&mut dest, 0, 0, &[], 100).unwrap();
        write_event_data(&mut dest, 0, 0, &[dynamic_module(&[1])], 1).unwrap();
        write_system_event(&mut dest, 0, &[], 100);
        assert!(dest.is_empty());
    }

    #[test]
    fn event_index_must_fit_stack_number() {
        let mut dest = Vec::new();
        let err = write_event_data(&mut dest, 0, 15, &[dynamic_module(&[1])], 10).unwrap_err();
        assert!(matches!(err, ReadoutError::StackIndexOutOfRange { index: 15, max: 14 }));
    }

    #[test]
    fn inconsistent_modules_are_rejected() {
        let short = [0xa, 0xb];
        let oversized = ModuleData {
            data: &short,
            prefix_size: 1,
            dynamic_size: 5,
            suffix_size: 0,
            has_dynamic: true,
        };
        let mut dest = vec![0x1234];
        let err = write_event_data(
            &mut dest,
            0,
            0,
            &[dynamic_module(&[1]), oversized],
            DEFAULT_FRAME_MAX_WORDS,
        )
        .unwrap_err();
        assert!(matches!(err, ReadoutError::InconsistentModuleData { module: 1 }));
        assert_eq!(dest, vec![0x1234]);

        let data = [0xa, 0xb, 0xc];
        let hidden_dynamic = ModuleData {
            data: &data,
            prefix_size: 1,
            dynamic_size: 2,
            suffix_size: 0,
            has_dynamic: false,
        };
        let err = write_event_data(&mut dest, 0, 0, &[hidden_dynamic], DEFAULT_FRAME_MAX_WORDS)
            .unwrap_err();
        assert!(matches!(err, ReadoutError::InconsistentModuleData { module: 0 }));
        assert_eq!(dest, vec![0x1234]);
    }

    #[test]
    fn system_event_crate_index_and_length() {
        let header = system_event::make_header(system_event::subtype::UNIX_TIMETICK, 0, false, 0);
        let mut dest = Vec::new();
        write_system_event(&mut dest, 3, &[header, 7, 8], DEFAULT_FRAME_MAX_WORDS);

        let expected = system_event::make_header(system_event::subtype::UNIX_TIMETICK, 3, false, 2);
        assert_eq!(dest, vec![expected, 7, 8]);
    }
}
