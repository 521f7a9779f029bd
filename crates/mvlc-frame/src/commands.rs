//! Super commands: instructions executed directly by the controller.
//!
//! A command buffer is wrapped in `CmdBufferStart`/`CmdBufferEnd` words and
//! its response is mirrored back inside a single super frame.

use crate::error::{FrameError, Result};

pub const SUPER_CMD_SHIFT: u32 = 16;
pub const SUPER_CMD_MASK: u32 = 0xffff;
pub const SUPER_CMD_ARG_MASK: u32 = 0xffff;

/// Longest super transaction the controller mirrors in one response.
pub const MIRROR_TRANSACTION_MAX_WORDS: usize = 255;

/// Internal register and memory addresses.
pub mod registers {
    /// Write `1 << 8` (immediate) here to execute stack 0.
    pub const STACK0_TRIGGER: u16 = 0x1100;
    /// Stack 0 offset, relative to `STACK_MEMORY_BEGIN`.
    pub const STACK0_OFFSET: u16 = 0x1200;
    pub const STACK_MEMORY_BEGIN: u16 = 0x2000;
    pub const STACK_MEMORY_WORDS: u16 = 1024;
    pub const STACK_MEMORY_END: u16 = STACK_MEMORY_BEGIN + STACK_MEMORY_WORDS * 4;
    pub const ADDRESS_INCREMENT: u16 = 4;

    pub const IMMEDIATE_STACK_ID: u8 = 0;
    pub const IMMEDIATE_STACK_START_OFFSET_BYTES: u16 = 4;
    pub const IMMEDIATE_SHIFT: u32 = 8;

    pub fn stack_trigger_register(stack_id: u8) -> u16 {
        STACK0_TRIGGER + stack_id as u16 * ADDRESS_INCREMENT
    }

    pub fn stack_offset_register(stack_id: u8) -> u16 {
        STACK0_OFFSET + stack_id as u16 * ADDRESS_INCREMENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SuperCommandType {
    CmdBufferStart = 0xF100,
    CmdBufferEnd = 0xF200,
    /// Mirrored back verbatim; used to match responses to requests.
    ReferenceWord = 0x0101,
    ReadLocal = 0x0102,
    ReadLocalBlock = 0x0103,
    WriteLocal = 0x0204,
    WriteReset = 0x0206,
    /// Throttle delay in microseconds, sent to the ETH delay port only.
    EthDelay = 0x0207,
}

impl SuperCommandType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        use SuperCommandType::*;
        [
            CmdBufferStart,
            CmdBufferEnd,
            ReferenceWord,
            ReadLocal,
            ReadLocalBlock,
            WriteLocal,
            WriteReset,
            EthDelay,
        ]
        .into_iter()
        .find(|t| *t as u16 == raw)
    }

    pub fn from_word(word: u32) -> Option<Self> {
        Self::from_raw(((word >> SUPER_CMD_SHIFT) & SUPER_CMD_MASK) as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperCommand {
    ReferenceWord(u16),
    ReadLocal { address: u16 },
    ReadLocalBlock { address: u16, words: u32 },
    WriteLocal { address: u16, value: u32 },
    WriteReset,
    EthDelay(u16),
}

impl SuperCommand {
    pub fn command_type(&self) -> SuperCommandType {
        match self {
            SuperCommand::ReferenceWord(_) => SuperCommandType::ReferenceWord,
            SuperCommand::ReadLocal { .. } => SuperCommandType::ReadLocal,
            SuperCommand::ReadLocalBlock { .. } => SuperCommandType::ReadLocalBlock,
            SuperCommand::WriteLocal { .. } => SuperCommandType::WriteLocal,
            SuperCommand::WriteReset => SuperCommandType::WriteReset,
            SuperCommand::EthDelay(_) => SuperCommandType::EthDelay,
        }
    }

    /// Append the wire words of this command to `out`.
    pub fn encode_into(&self, out: &mut Vec<u32>) {
        let cmd = (self.command_type() as u32) << SUPER_CMD_SHIFT;
        match *self {
            SuperCommand::ReferenceWord(value) => out.push(cmd | value as u32),
            SuperCommand::ReadLocal { address } => out.push(cmd | address as u32),
            SuperCommand::ReadLocalBlock { address, words } => {
                out.push(cmd | address as u32);
                out.push(words);
            }
            SuperCommand::WriteLocal { address, value } => {
                out.push(cmd | address as u32);
                out.push(value);
            }
            SuperCommand::WriteReset => out.push(cmd),
            SuperCommand::EthDelay(delay) => out.push(cmd | delay as u32),
        }
    }
}

/// Ordered list of super commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperCommandBuilder {
    commands: Vec<SuperCommand>,
}

impl SuperCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference_word(&mut self, reference: u16) -> &mut Self {
        self.add(SuperCommand::ReferenceWord(reference))
    }

    pub fn add_read_local(&mut self, address: u16) -> &mut Self {
        self.add(SuperCommand::ReadLocal { address })
    }

    pub fn add_read_local_block(&mut self, address: u16, words: u32) -> &mut Self {
        self.add(SuperCommand::ReadLocalBlock { address, words })
    }

    pub fn add_write_local(&mut self, address: u16, value: u32) -> &mut Self {
        self.add(SuperCommand::WriteLocal { address, value })
    }

    pub fn add_write_reset(&mut self) -> &mut Self {
        self.add(SuperCommand::WriteReset)
    }

    pub fn add(&mut self, cmd: SuperCommand) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn add_commands(&mut self, cmds: impl IntoIterator<Item = SuperCommand>) -> &mut Self {
        self.commands.extend(cmds);
        self
    }

    pub fn commands(&self) -> &[SuperCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Encode `commands` into a complete command buffer.
pub fn make_command_buffer(commands: &[SuperCommand]) -> Vec<u32> {
    let mut out = Vec::with_capacity(commands.len() * 2 + 2);
    out.push((SuperCommandType::CmdBufferStart as u32) << SUPER_CMD_SHIFT);
    for cmd in commands {
        cmd.encode_into(&mut out);
    }
    out.push((SuperCommandType::CmdBufferEnd as u32) << SUPER_CMD_SHIFT);
    out
}

/// Decode a command buffer. Buffer markers are skipped, decoding stops at
/// the first word that is not a super command.
pub fn decode_command_buffer(buffer: &[u32]) -> Vec<SuperCommand> {
    let mut result = Vec::new();
    let mut iter = buffer.iter().copied();

    while let Some(word) = iter.next() {
        let Some(cmd_type) = SuperCommandType::from_word(word) else {
            break;
        };
        let arg = (word & SUPER_CMD_ARG_MASK) as u16;

        let cmd = match cmd_type {
            SuperCommandType::CmdBufferStart
            | SuperCommandType::CmdBufferEnd
            | SuperCommandType::EthDelay => continue,
            SuperCommandType::ReferenceWord => SuperCommand::ReferenceWord(arg),
            SuperCommandType::ReadLocal => SuperCommand::ReadLocal { address: arg },
            SuperCommandType::ReadLocalBlock => SuperCommand::ReadLocalBlock {
                address: arg,
                words: iter.next().unwrap_or(0),
            },
            SuperCommandType::WriteLocal => SuperCommand::WriteLocal {
                address: arg,
                value: iter.next().unwrap_or(0),
            },
            SuperCommandType::WriteReset => SuperCommand::WriteReset,
        };
        result.push(cmd);
    }

    result
}

/// Reject buffers the controller would not mirror completely.
pub fn check_mirror_size(buffer: &[u32]) -> Result<()> {
    if buffer.len() > MIRROR_TRANSACTION_MAX_WORDS {
        return Err(FrameError::MirrorTransactionMaxWordsExceeded {
            words: buffer.len(),
            max: MIRROR_TRANSACTION_MAX_WORDS,
        });
    }
    Ok(())
}
