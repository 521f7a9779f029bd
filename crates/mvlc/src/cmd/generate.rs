use std::time::{SystemTime, UNIX_EPOCH};

use mvlc_frame::codec::words_to_bytes;
use mvlc_frame::system_event::{self, subtype};
use mvlc_frame::vme::amods;
use mvlc_frame::{StackCommandBuilder, VmeDataWidth};
use mvlc_readout::{write_event_data, write_system_event, ModuleData};

use crate::cmd::GenerateArgs;
use crate::exit::{io_error, json_error, readout_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_fields, OutputFormat};

const MODULE_BASE: u32 = 0x0100_0000;
const MODULE_STRIDE: u32 = 0x0001_0000;

pub fn run(args: GenerateArgs, format: OutputFormat) -> CliResult<i32> {
    if args.modules == 0 {
        return Err(CliError::new(USAGE, "--modules must be at least 1"));
    }
    if args.timetick_every == Some(0) {
        return Err(CliError::new(USAGE, "--timetick-every must be greater than zero"));
    }

    let mut words = Vec::new();
    let frame_max = args.frame_max_words;

    write_system_event(
        &mut words,
        args.crate_index,
        &[system_event::make_header(subtype::BEGIN_RUN, 0, false, 0)],
        frame_max,
    );

    for event in 0..args.events {
        if let Some(every) = args.timetick_every {
            if event % every == 0 {
                write_system_event(&mut words, args.crate_index, &timetick(), frame_max);
            }
        }

        let data: Vec<Vec<u32>> = (0..args.modules)
            .map(|module| module_words(event, module, args.dynamic_words))
            .collect();
        let modules: Vec<ModuleData<'_>> = data
            .iter()
            .map(|d| ModuleData {
                data: d,
                prefix_size: 1,
                dynamic_size: args.dynamic_words,
                suffix_size: 1,
                has_dynamic: true,
            })
            .collect();

        write_event_data(&mut words, args.crate_index, 0, &modules, frame_max)
            .map_err(|err| readout_error("event framing failed", err))?;
    }

    write_system_event(
        &mut words,
        args.crate_index,
        &[system_event::make_header(subtype::END_RUN, 0, false, 0)],
        frame_max,
    );

    std::fs::write(&args.output, words_to_bytes(&words))
        .map_err(|err| io_error(&format!("write {}", args.output.display()), err))?;

    if let Some(path) = &args.stacks_out {
        let stacks = vec![readout_stack(args.modules, args.dynamic_words)];
        let json = serde_json::to_string_pretty(&stacks)
            .map_err(|err| json_error("serialize stacks", err))?;
        std::fs::write(path, json)
            .map_err(|err| io_error(&format!("write {}", path.display()), err))?;
    }

    tracing::info!(
        path = %args.output.display(),
        events = args.events,
        words = words.len(),
        "generated listfile data"
    );

    print_fields(
        &[
            ("output", args.output.display().to_string()),
            ("events", args.events.to_string()),
            ("words", words.len().to_string()),
        ],
        format,
    );

    Ok(SUCCESS)
}

/// Prefix word, `dynamic` block words, then a marker suffix.
fn module_words(event: usize, module: usize, dynamic: usize) -> Vec<u32> {
    let tag = ((event as u32 & 0xffff) << 16) | ((module as u32 & 0xff) << 8);
    let mut words = Vec::with_capacity(dynamic + 2);
    words.push(0xa000_0000 | tag);
    words.extend((0..dynamic as u32).map(|i| tag | (i & 0xff)));
    words.push(0xc000_0000 | tag);
    words
}

/// The readout stack whose output matches [`module_words`].
fn readout_stack(modules: usize, dynamic: usize) -> StackCommandBuilder {
    let mut stack = StackCommandBuilder::new("event0");
    for module in 0..modules {
        let base = MODULE_BASE + module as u32 * MODULE_STRIDE;
        stack
            .begin_group(format!("module{module}"))
            .add_vme_read(base + 0x6030, amods::A32, VmeDataWidth::D32, false)
            .add_vme_block_read(base, amods::BLT32, dynamic.min(u16::MAX as usize) as u16)
            .add_write_marker(0xc000_0000);
    }
    stack
}

fn timetick() -> Vec<u32> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    vec![
        system_event::make_header(subtype::UNIX_TIMETICK, 0, false, 0),
        secs as u32,
        (secs >> 32) as u32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvlc_readout::build_readout_structure;

    #[test]
    fn stack_matches_generated_layout() {
        let structure = build_readout_structure(&[readout_stack(3, 4)]).unwrap();
        assert_eq!(structure.len(), 1);
        assert_eq!(structure[0].len(), 3);
        for module in &structure[0] {
            assert_eq!(module.prefix_len, 1);
            assert!(module.has_dynamic);
            assert_eq!(module.suffix_len, 1);
        }
    }

    #[test]
    fn module_words_layout() {
        let words = module_words(2, 1, 3);
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], 0xa002_0100);
        assert_eq!(words[4], 0xc002_0100);
    }
}
