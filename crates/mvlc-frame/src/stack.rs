//! Stack commands: small programs uploaded to the controller and executed
//! against the VME bus.
//!
//! Stack command words carry the command type in bits 31:24, a first
//! argument in bits 23:16 and a second argument in bits 15:0. Most commands
//! are followed by one or two argument words.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::commands::{registers, SuperCommand};
use crate::error::{FrameError, Result};
use crate::vme::{self, amods, Blk2eSstRate, VmeDataWidth, BLK2ESST_RATE_SHIFT};

pub const CMD_SHIFT: u32 = 24;
pub const CMD_MASK: u32 = 0xff;
pub const ARG0_SHIFT: u32 = 16;
pub const ARG0_MASK: u32 = 0xff;
pub const ARG1_MASK: u32 = 0xffff;
/// The late-read flag sits above the data width in arg1.
pub const LATE_READ_SHIFT: u32 = 2;

/// Maximum number of stack words uploaded per super transaction. Each word
/// costs two super command words, so start and end writes still fit.
pub const UPLOAD_PART_MAX_WORDS: usize = 125;

pub mod opcodes {
    pub const STACK_START: u8 = 0xF3;
    pub const STACK_END: u8 = 0xF4;
    pub const VME_READ: u8 = 0x12;
    pub const VME_MBLT_SWAPPED: u8 = 0x13;
    pub const VME_WRITE: u8 = 0x23;
    pub const WRITE_MARKER: u8 = 0xC2;
    pub const WRITE_SPECIAL: u8 = 0xC1;
    pub const SET_ADDRESS_INC_MODE: u8 = 0xC3;
    pub const WAIT: u8 = 0xC4;
    pub const MASK_SHIFT_ACCU: u8 = 0xC5;
    pub const SIGNAL_ACCU: u8 = 0xC6;
    pub const COMPARE_LOOP_ACCU: u8 = 0xC7;
    pub const SET_ACCU: u8 = 0xC8;
    pub const READ_TO_ACCU: u8 = 0x14;
}

/// A single stack command.
///
/// `SoftwareDelay` and `Custom` never reach the device as commands of their
/// own: the delay is host side only and custom blocks are emitted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackCommand {
    VmeRead {
        address: u32,
        amod: u8,
        #[serde(default)]
        data_width: VmeDataWidth,
        #[serde(default)]
        late_read: bool,
    },
    /// BLT or MBLT block read, depending on `amod`.
    VmeBlockRead {
        address: u32,
        amod: u8,
        max_transfers: u16,
    },
    #[serde(rename = "vme_block_read_2esst")]
    VmeBlockRead2eSst {
        address: u32,
        #[serde(default)]
        rate: Blk2eSstRate,
        max_transfers: u16,
    },
    /// MBLT or 2eSST block read with swapped 32-bit word order.
    VmeMbltSwapped {
        address: u32,
        amod: u8,
        #[serde(default)]
        rate: Blk2eSstRate,
        max_transfers: u16,
    },
    VmeWrite {
        address: u32,
        value: u32,
        amod: u8,
        #[serde(default)]
        data_width: VmeDataWidth,
    },
    WriteMarker {
        value: u32,
    },
    /// 0 = timestamp, 1 = accumulator.
    WriteSpecial {
        value: u32,
    },
    /// 0 = FIFO, 1 = memory.
    SetAddressIncMode {
        mode: u32,
    },
    Wait {
        clocks: u32,
    },
    SignalAccu,
    MaskShiftAccu {
        mask: u32,
        shift: u8,
    },
    SetAccu {
        value: u32,
    },
    ReadToAccu {
        address: u32,
        amod: u8,
        #[serde(default)]
        data_width: VmeDataWidth,
        #[serde(default)]
        late_read: bool,
    },
    /// 0 = eq, 1 = lt, 2 = gt. Loops to the previous command while false.
    CompareLoopAccu {
        comparator: u8,
        value: u32,
    },
    SoftwareDelay {
        ms: u32,
    },
    Custom {
        values: Vec<u32>,
        /// Number of data words the block produces in the readout output.
        #[serde(default)]
        output_words: u16,
    },
}

impl StackCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StackCommand::VmeRead { .. } => "vme_read",
            StackCommand::VmeBlockRead { .. } => "vme_block_read",
            StackCommand::VmeBlockRead2eSst { .. } => "vme_block_read_2esst",
            StackCommand::VmeMbltSwapped { .. } => "vme_mblt_swapped",
            StackCommand::VmeWrite { .. } => "vme_write",
            StackCommand::WriteMarker { .. } => "write_marker",
            StackCommand::WriteSpecial { .. } => "write_special",
            StackCommand::SetAddressIncMode { .. } => "set_address_inc_mode",
            StackCommand::Wait { .. } => "wait",
            StackCommand::SignalAccu => "signal_accu",
            StackCommand::MaskShiftAccu { .. } => "mask_shift_accu",
            StackCommand::SetAccu { .. } => "set_accu",
            StackCommand::ReadToAccu { .. } => "read_to_accu",
            StackCommand::CompareLoopAccu { .. } => "compare_loop_accu",
            StackCommand::SoftwareDelay { .. } => "software_delay",
            StackCommand::Custom { .. } => "custom",
        }
    }

    /// Append the wire words of this command to `out`.
    pub fn encode_into(&self, out: &mut Vec<u32>) -> Result<()> {
        use opcodes::*;

        match self {
            StackCommand::VmeRead {
                address,
                amod,
                data_width,
                late_read,
            } => {
                if vme::is_block_mode(*amod) {
                    out.push(block_read_word(VME_READ, *amod, Blk2eSstRate::default(), 0));
                } else {
                    out.push(single_read_word(VME_READ, *amod, *data_width, *late_read));
                }
                out.push(*address);
            }
            StackCommand::VmeBlockRead {
                address,
                amod,
                max_transfers,
            } => {
                out.push(block_read_word(
                    VME_READ,
                    *amod,
                    Blk2eSstRate::default(),
                    *max_transfers,
                ));
                out.push(*address);
            }
            StackCommand::VmeBlockRead2eSst {
                address,
                rate,
                max_transfers,
            } => {
                out.push(block_read_word(
                    VME_READ,
                    amods::BLK2ESST64,
                    *rate,
                    *max_transfers,
                ));
                out.push(*address);
            }
            StackCommand::VmeMbltSwapped {
                address,
                amod,
                rate,
                max_transfers,
            } => {
                out.push(block_read_word(VME_MBLT_SWAPPED, *amod, *rate, *max_transfers));
                out.push(*address);
            }
            StackCommand::VmeWrite {
                address,
                value,
                amod,
                data_width,
            } => {
                out.push(cmd_word(VME_WRITE) | arg0(*amod) | *data_width as u32);
                out.push(*address);
                out.push(*value);
            }
            StackCommand::WriteMarker { value } => {
                out.push(cmd_word(WRITE_MARKER));
                out.push(*value);
            }
            StackCommand::WriteSpecial { value } => {
                out.push(cmd_word(WRITE_SPECIAL) | (value & 0x00ff_ffff));
            }
            StackCommand::SetAddressIncMode { mode } => {
                out.push(cmd_word(SET_ADDRESS_INC_MODE) | (mode & 0x00ff_ffff));
            }
            StackCommand::Wait { clocks } => {
                out.push(cmd_word(WAIT) | (clocks & 0x00ff_ffff));
            }
            StackCommand::SignalAccu => out.push(cmd_word(SIGNAL_ACCU)),
            StackCommand::MaskShiftAccu { mask, shift } => {
                out.push(cmd_word(MASK_SHIFT_ACCU) | *shift as u32);
                out.push(*mask);
            }
            StackCommand::SetAccu { value } => {
                out.push(cmd_word(SET_ACCU));
                out.push(*value);
            }
            StackCommand::ReadToAccu {
                address,
                amod,
                data_width,
                late_read,
            } => {
                out.push(single_read_word(READ_TO_ACCU, *amod, *data_width, *late_read));
                out.push(*address);
            }
            StackCommand::CompareLoopAccu { comparator, value } => {
                out.push(cmd_word(COMPARE_LOOP_ACCU) | *comparator as u32);
                out.push(*value);
            }
            StackCommand::SoftwareDelay { .. } => {
                return Err(FrameError::UnsupportedStackCommand("software_delay"));
            }
            StackCommand::Custom { values, .. } => out.extend_from_slice(values),
        }

        Ok(())
    }
}

fn cmd_word(opcode: u8) -> u32 {
    (opcode as u32) << CMD_SHIFT
}

fn arg0(value: u8) -> u32 {
    (value as u32 & ARG0_MASK) << ARG0_SHIFT
}

fn single_read_word(opcode: u8, amod: u8, data_width: VmeDataWidth, late_read: bool) -> u32 {
    cmd_word(opcode) | arg0(amod) | data_width as u32 | ((late_read as u32) << LATE_READ_SHIFT)
}

fn block_read_word(opcode: u8, amod: u8, rate: Blk2eSstRate, transfers: u16) -> u32 {
    let arg = if vme::is_esst64_mode(amod) {
        amod | ((rate as u8) << BLK2ESST_RATE_SHIFT)
    } else {
        amod
    };
    cmd_word(opcode) | arg0(arg) | (transfers as u32 & ARG1_MASK)
}

/// A named group of commands, usually the readout of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackGroup {
    #[serde(default)]
    pub name: String,
    pub commands: Vec<StackCommand>,
}

/// A command stack organized into named groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCommandBuilder {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<StackGroup>,
}

impl StackCommandBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    pub fn from_commands(commands: Vec<StackCommand>) -> Self {
        Self {
            name: String::new(),
            groups: vec![StackGroup {
                name: String::new(),
                commands,
            }],
        }
    }

    /// Start a new group; subsequent `add_*` calls append to it.
    pub fn begin_group(&mut self, name: impl Into<String>) -> &mut Self {
        self.groups.push(StackGroup {
            name: name.into(),
            commands: Vec::new(),
        });
        self
    }

    /// Append to the open group, creating an unnamed one if needed.
    pub fn add_command(&mut self, cmd: StackCommand) -> &mut Self {
        if self.groups.is_empty() {
            self.begin_group("");
        }
        if let Some(group) = self.groups.last_mut() {
            group.commands.push(cmd);
        }
        self
    }

    pub fn add_vme_read(
        &mut self,
        address: u32,
        amod: u8,
        data_width: VmeDataWidth,
        late_read: bool,
    ) -> &mut Self {
        self.add_command(StackCommand::VmeRead {
            address,
            amod,
            data_width,
            late_read,
        })
    }

    pub fn add_vme_block_read(&mut self, address: u32, amod: u8, max_transfers: u16) -> &mut Self {
        self.add_command(StackCommand::VmeBlockRead {
            address,
            amod,
            max_transfers,
        })
    }

    pub fn add_vme_block_read_2esst(
        &mut self,
        address: u32,
        rate: Blk2eSstRate,
        max_transfers: u16,
    ) -> &mut Self {
        self.add_command(StackCommand::VmeBlockRead2eSst {
            address,
            rate,
            max_transfers,
        })
    }

    pub fn add_vme_write(
        &mut self,
        address: u32,
        value: u32,
        amod: u8,
        data_width: VmeDataWidth,
    ) -> &mut Self {
        self.add_command(StackCommand::VmeWrite {
            address,
            value,
            amod,
            data_width,
        })
    }

    pub fn add_write_marker(&mut self, value: u32) -> &mut Self {
        self.add_command(StackCommand::WriteMarker { value })
    }

    pub fn add_write_special(&mut self, value: u32) -> &mut Self {
        self.add_command(StackCommand::WriteSpecial { value })
    }

    pub fn add_wait(&mut self, clocks: u32) -> &mut Self {
        self.add_command(StackCommand::Wait { clocks })
    }

    pub fn add_signal_accu(&mut self) -> &mut Self {
        self.add_command(StackCommand::SignalAccu)
    }

    pub fn add_set_accu(&mut self, value: u32) -> &mut Self {
        self.add_command(StackCommand::SetAccu { value })
    }

    pub fn add_custom(&mut self, values: Vec<u32>, output_words: u16) -> &mut Self {
        self.add_command(StackCommand::Custom {
            values,
            output_words,
        })
    }

    /// All commands of all groups in order.
    pub fn commands(&self) -> impl Iterator<Item = &StackCommand> {
        self.groups.iter().flat_map(|g| g.commands.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.commands().next().is_none()
    }
}

/// Encode commands into stack words (without StackStart/StackEnd).
pub fn encode_stack<'a>(commands: impl IntoIterator<Item = &'a StackCommand>) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for cmd in commands {
        cmd.encode_into(&mut out)?;
    }
    Ok(out)
}

/// Decode stack words. Unknown words become single value `Custom` commands.
/// Missing argument words decode as zero.
pub fn decode_stack(words: &[u32]) -> Vec<StackCommand> {
    use opcodes::*;

    let mut result = Vec::new();
    let mut iter = words.iter().copied();

    while let Some(word) = iter.next() {
        let opcode = ((word >> CMD_SHIFT) & CMD_MASK) as u8;
        let a0 = ((word >> ARG0_SHIFT) & ARG0_MASK) as u8;
        let a1 = (word & ARG1_MASK) as u16;

        trace!(word = format_args!("{word:#010x}"), opcode, a0, a1, "decode stack word");

        let cmd = match opcode {
            STACK_START | STACK_END => continue,
            VME_READ | VME_MBLT_SWAPPED | READ_TO_ACCU => {
                let amod = a0 & amods::AMOD_MASK;
                let address = iter.next().unwrap_or(0);
                let data_width = VmeDataWidth::from_raw(a1 as u32 & 0b11).unwrap_or_default();
                let late_read = (a1 >> LATE_READ_SHIFT) & 0b1 != 0;
                let rate = Blk2eSstRate::from_raw(a0 >> BLK2ESST_RATE_SHIFT);

                match opcode {
                    READ_TO_ACCU => StackCommand::ReadToAccu {
                        address,
                        amod,
                        data_width,
                        late_read,
                    },
                    VME_MBLT_SWAPPED => StackCommand::VmeMbltSwapped {
                        address,
                        amod,
                        rate,
                        max_transfers: a1,
                    },
                    _ if vme::is_esst64_mode(amod) => StackCommand::VmeBlockRead2eSst {
                        address,
                        rate,
                        max_transfers: a1,
                    },
                    _ if vme::is_block_mode(amod) => StackCommand::VmeBlockRead {
                        address,
                        amod,
                        max_transfers: a1,
                    },
                    _ => StackCommand::VmeRead {
                        address,
                        amod,
                        data_width,
                        late_read,
                    },
                }
            }
            VME_WRITE => StackCommand::VmeWrite {
                amod: a0,
                data_width: VmeDataWidth::from_raw(a1 as u32 & 0b11).unwrap_or_default(),
                address: iter.next().unwrap_or(0),
                value: iter.next().unwrap_or(0),
            },
            WRITE_MARKER => StackCommand::WriteMarker {
                value: iter.next().unwrap_or(0),
            },
            WRITE_SPECIAL => StackCommand::WriteSpecial {
                value: word & 0x00ff_ffff,
            },
            SET_ADDRESS_INC_MODE => StackCommand::SetAddressIncMode { mode: a1 as u32 },
            WAIT => StackCommand::Wait {
                clocks: word & 0x00ff_ffff,
            },
            SIGNAL_ACCU => StackCommand::SignalAccu,
            MASK_SHIFT_ACCU => StackCommand::MaskShiftAccu {
                shift: (word & 0xff) as u8,
                mask: iter.next().unwrap_or(0),
            },
            SET_ACCU => StackCommand::SetAccu {
                value: iter.next().unwrap_or(0),
            },
            COMPARE_LOOP_ACCU => StackCommand::CompareLoopAccu {
                comparator: a1 as u8,
                value: iter.next().unwrap_or(0),
            },
            _ => StackCommand::Custom {
                values: vec![word],
                output_words: 0,
            },
        };

        result.push(cmd);
    }

    result
}

/// Split a stack upload into super command parts, one transaction each.
///
/// The first part writes StackStart (with the output pipe), the last part
/// writes StackEnd. Reference words are not included; every part needs its
/// own reference when it is submitted.
pub fn make_stack_upload_commands(
    output_pipe: u8,
    memory_offset: u16,
    stack_words: &[u32],
) -> Result<Vec<Vec<SuperCommand>>> {
    let mut address = registers::STACK_MEMORY_BEGIN as u32 + memory_offset as u32;
    let mut parts = Vec::new();

    let mut write = |part: &mut Vec<SuperCommand>, value: u32| -> Result<()> {
        if address >= registers::STACK_MEMORY_END as u32 {
            return Err(FrameError::StackMemoryExceeded {
                address: address.min(u16::MAX as u32) as u16,
            });
        }
        part.push(SuperCommand::WriteLocal {
            address: address as u16,
            value,
        });
        address += registers::ADDRESS_INCREMENT as u32;
        Ok(())
    };

    let mut chunks = stack_words.chunks(UPLOAD_PART_MAX_WORDS).peekable();
    let mut first = true;

    if chunks.peek().is_none() {
        let mut part = Vec::new();
        write(&mut part, cmd_word(opcodes::STACK_START) | arg0(output_pipe))?;
        write(&mut part, cmd_word(opcodes::STACK_END))?;
        parts.push(part);
        return Ok(parts);
    }

    while let Some(chunk) = chunks.next() {
        let mut part = Vec::with_capacity(chunk.len() + 2);

        if first {
            write(&mut part, cmd_word(opcodes::STACK_START) | arg0(output_pipe))?;
            first = false;
        }

        for &word in chunk {
            write(&mut part, word)?;
        }

        if chunks.peek().is_none() {
            write(&mut part, cmd_word(opcodes::STACK_END))?;
        }

        parts.push(part);
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commands() -> Vec<StackCommand> {
        vec![
            StackCommand::VmeRead {
                address: 0x6070,
                amod: amods::A32,
                data_width: VmeDataWidth::D16,
                late_read: true,
            },
            StackCommand::VmeBlockRead {
                address: 0x0000_0000,
                amod: amods::MBLT64,
                max_transfers: 0xffff,
            },
            StackCommand::VmeBlockRead {
                address: 0x1000_0000,
                amod: amods::BLT32,
                max_transfers: 100,
            },
            StackCommand::VmeBlockRead2eSst {
                address: 0x2000_0000,
                rate: Blk2eSstRate::Rate276MB,
                max_transfers: 50,
            },
            StackCommand::VmeMbltSwapped {
                address: 0x3000_0000,
                amod: amods::MBLT64,
                rate: Blk2eSstRate::Rate160MB,
                max_transfers: 10,
            },
            StackCommand::VmeWrite {
                address: 0x6034,
                value: 1,
                amod: amods::A24,
                data_width: VmeDataWidth::D32,
            },
            StackCommand::WriteMarker { value: 0x87654321 },
            StackCommand::WriteSpecial { value: 1 },
            StackCommand::SetAddressIncMode { mode: 1 },
            StackCommand::Wait { clocks: 0x123456 },
            StackCommand::SignalAccu,
            StackCommand::MaskShiftAccu {
                mask: 0xff00,
                shift: 8,
            },
            StackCommand::SetAccu { value: 42 },
            StackCommand::ReadToAccu {
                address: 0x600e,
                amod: amods::A32,
                data_width: VmeDataWidth::D32,
                late_read: false,
            },
            StackCommand::CompareLoopAccu {
                comparator: 1,
                value: 7,
            },
        ]
    }

    #[test]
    fn encode_decode_all_commands() {
        let cmds = sample_commands();
        let words = encode_stack(&cmds).unwrap();
        assert_eq!(decode_stack(&words), cmds);
    }

    #[test]
    fn encode_layout() {
        let words = encode_stack(&sample_commands()[..2]).unwrap();
        assert_eq!(words, vec![0x12090005, 0x6070, 0x1208ffff, 0]);

        let words = encode_stack(&[StackCommand::VmeBlockRead2eSst {
            address: 0,
            rate: Blk2eSstRate::Rate320MB,
            max_transfers: 1,
        }])
        .unwrap();
        assert_eq!(words[0], 0x12A00001);
    }

    #[test]
    fn software_delay_is_not_encodable() {
        let err = encode_stack(&[StackCommand::SoftwareDelay { ms: 10 }]).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedStackCommand(_)));
    }

    #[test]
    fn custom_values_emitted_verbatim_and_unknown_words_decode_as_custom() {
        let cmd = StackCommand::Custom {
            values: vec![0xAB000001],
            output_words: 1,
        };
        let words = encode_stack(&[cmd]).unwrap();
        assert_eq!(words, vec![0xAB000001]);
        assert_eq!(
            decode_stack(&words),
            vec![StackCommand::Custom {
                values: vec![0xAB000001],
                output_words: 0
            }]
        );
    }

    #[test]
    fn builder_groups() {
        let mut b = StackCommandBuilder::new("event0");
        b.add_write_marker(1);
        b.begin_group("mod1").add_vme_block_read(0, amods::MBLT64, 100);
        assert_eq!(b.groups.len(), 2);
        assert_eq!(b.groups[0].name, "");
        assert_eq!(b.groups[1].name, "mod1");
        assert_eq!(b.commands().count(), 2);
    }

    #[test]
    fn json_roundtrip() {
        let mut b = StackCommandBuilder::new("event0");
        b.begin_group("mdpp").add_vme_block_read(0, amods::MBLT64, 0xffff);
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"type\":\"vme_block_read\""));
        let back: StackCommandBuilder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn upload_single_part() {
        let parts = make_stack_upload_commands(1, 0, &[0x11, 0x22]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0],
            vec![
                SuperCommand::WriteLocal { address: 0x2000, value: 0xF3010000 },
                SuperCommand::WriteLocal { address: 0x2004, value: 0x11 },
                SuperCommand::WriteLocal { address: 0x2008, value: 0x22 },
                SuperCommand::WriteLocal { address: 0x200C, value: 0xF4000000 },
            ]
        );
    }

    #[test]
    fn upload_splits_into_parts() {
        let words: Vec<u32> = (0..300).collect();
        let parts = make_stack_upload_commands(0, 4, &words).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 126);
        assert_eq!(parts[1].len(), 125);
        assert_eq!(parts[2].len(), 51);
        assert_eq!(
            parts[0][0],
            SuperCommand::WriteLocal { address: 0x2004, value: 0xF3000000 }
        );
        assert_eq!(
            parts[2].last(),
            Some(&SuperCommand::WriteLocal {
                address: 0x2004 + 301 * 4,
                value: 0xF4000000
            })
        );
    }

    #[test]
    fn upload_exceeding_stack_memory() {
        let words = vec![0u32; 1024];
        let err = make_stack_upload_commands(0, 0, &words).unwrap_err();
        assert!(matches!(err, FrameError::StackMemoryExceeded { address: 0x3000 }));
    }
}
