//! Readout structure: the fixed shape of each module's readout data.
//!
//! Every module readout is a prefix of single-word reads, at most one
//! dynamically sized block read and a suffix of single-word reads. The
//! shape is derived once from the readout stacks and guides the parser.

use mvlc_frame::vme::is_block_mode;
use mvlc_frame::{StackCommand, StackCommandBuilder};
use serde::Serialize;
use tracing::debug;

use crate::error::{ReadoutError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleReadoutStructure {
    pub name: String,
    pub prefix_len: u8,
    pub suffix_len: u8,
    pub has_dynamic: bool,
}

impl ModuleReadoutStructure {
    /// A module producing no data at all.
    pub fn is_empty(&self) -> bool {
        self.prefix_len == 0 && self.suffix_len == 0 && !self.has_dynamic
    }
}

/// One row of module structures per event, indexed by event then module.
pub type ReadoutStructure = Vec<Vec<ModuleReadoutStructure>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Prefix,
    Dynamic,
    Suffix,
}

fn add_words(target: &mut u8, words: u16, module: &str, part: &'static str) -> Result<()> {
    let sum = *target as u16 + words;
    *target = u8::try_from(sum).map_err(|_| ReadoutError::PartTooLong {
        module: module.to_string(),
        part,
    })?;
    Ok(())
}

/// Derive the readout structure of a single module from its commands.
pub fn module_readout_structure(
    name: &str,
    commands: &[StackCommand],
) -> Result<ModuleReadoutStructure> {
    let mut part = Part::Prefix;
    let mut result = ModuleReadoutStructure {
        name: name.to_string(),
        ..Default::default()
    };

    // With the accumulator set, the next single read becomes a block
    // transfer: the device repeats it accu times and frames the output as a
    // block frame.
    let mut accu_active = false;

    for cmd in commands {
        let single_words = match cmd {
            StackCommand::VmeRead { amod, .. } if !is_block_mode(*amod) && !accu_active => Some(1),
            StackCommand::WriteMarker { .. } | StackCommand::WriteSpecial { .. } => Some(1),
            StackCommand::Custom { output_words, .. } => Some(*output_words),
            _ => None,
        };

        if let Some(words) = single_words {
            match part {
                Part::Prefix => add_words(&mut result.prefix_len, words, name, "prefix")?,
                Part::Dynamic | Part::Suffix => {
                    add_words(&mut result.suffix_len, words, name, "suffix")?;
                    part = Part::Suffix;
                }
            }
            continue;
        }

        match cmd {
            StackCommand::VmeRead { .. }
            | StackCommand::VmeBlockRead { .. }
            | StackCommand::VmeBlockRead2eSst { .. }
            | StackCommand::VmeMbltSwapped { .. } => {
                match part {
                    Part::Prefix => {
                        result.has_dynamic = true;
                        part = Part::Dynamic;
                    }
                    Part::Dynamic => {
                        return Err(ReadoutError::MultipleBlockReads {
                            module: name.to_string(),
                        })
                    }
                    Part::Suffix => {
                        return Err(ReadoutError::BlockReadInSuffix {
                            module: name.to_string(),
                        })
                    }
                }
                accu_active = false;
            }
            StackCommand::SetAccu { .. }
            | StackCommand::ReadToAccu { .. }
            | StackCommand::CompareLoopAccu { .. } => accu_active = true,
            StackCommand::SignalAccu => accu_active = false,
            other => {
                debug!(module = name, command = other.name(), "ignoring non-readout command");
            }
        }
    }

    Ok(result)
}

/// Derive the structure of every module of every readout stack.
///
/// Stack `i` holds the readout of event `i`; each group is one module.
pub fn build_readout_structure(stacks: &[StackCommandBuilder]) -> Result<ReadoutStructure> {
    stacks
        .iter()
        .map(|stack| {
            stack
                .groups
                .iter()
                .map(|group| module_readout_structure(&group.name, &group.commands))
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}
