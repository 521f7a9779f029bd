use std::collections::BTreeMap;

use mvlc_frame::codec::{frame_length, is_known_frame_header};
use mvlc_frame::system_event;
use mvlc_readout::{
    callbacks_from_fn, parse_readout_buffer, ModuleData, ParseResult, ReadoutParserCounters,
    ReadoutParserState,
};
use mvlc_transport::eth::{self, PayloadHeaderInfo};
use mvlc_transport::ConnectionType;
use serde::Serialize;

use crate::cmd::{load_stacks, read_words, ParseArgs};
use crate::exit::{readout_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_json, print_table, OutputFormat};

/// Serializable view of the parser counters.
#[derive(Debug, Default, Serialize)]
pub struct ParseSummary {
    pub buffers: u64,
    pub bytes: u64,
    pub unused_bytes: u64,
    pub internal_buffer_loss: u64,
    pub eth_packets: u64,
    pub eth_packet_loss: u64,
    pub parser_exceptions: u64,
    pub events: BTreeMap<usize, u64>,
    pub system_events: BTreeMap<String, u64>,
    pub parse_results: BTreeMap<&'static str, u64>,
}

impl ParseSummary {
    pub fn from_counters(counters: &ReadoutParserCounters) -> Self {
        Self {
            buffers: counters.buffers_processed,
            bytes: counters.bytes_processed,
            unused_bytes: counters.unused_bytes,
            internal_buffer_loss: counters.internal_buffer_loss,
            eth_packets: counters.eth_packets_processed,
            eth_packet_loss: counters.eth_packet_loss,
            parser_exceptions: counters.parser_exceptions,
            events: counters.event_hits.clone(),
            system_events: counters
                .system_event_counts()
                .map(|(st, count)| (system_event::subtype_name(st), count))
                .collect(),
            parse_results: counters
                .parse_result_counts()
                .map(|(pr, count)| (pr.name(), count))
                .collect(),
        }
    }

    /// Any parse result outside the success class. Empty stack frames are
    /// tolerated and only counted.
    pub fn has_errors(&self) -> bool {
        ParseResult::ALL.iter().any(|pr| {
            !pr.is_success()
                && *pr != ParseResult::EmptyStackFrame
                && self.parse_results.contains_key(pr.name())
        })
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        let mut rows = vec![
            vec!["buffers".to_string(), self.buffers.to_string()],
            vec!["bytes".to_string(), self.bytes.to_string()],
            vec!["unused_bytes".to_string(), self.unused_bytes.to_string()],
            vec![
                "internal_buffer_loss".to_string(),
                self.internal_buffer_loss.to_string(),
            ],
            vec!["eth_packets".to_string(), self.eth_packets.to_string()],
            vec!["eth_packet_loss".to_string(), self.eth_packet_loss.to_string()],
            vec![
                "parser_exceptions".to_string(),
                self.parser_exceptions.to_string(),
            ],
        ];
        rows.extend(
            self.events
                .iter()
                .map(|(event, hits)| vec![format!("event[{event}]"), hits.to_string()]),
        );
        rows.extend(
            self.system_events
                .iter()
                .map(|(name, count)| vec![format!("system_event[{name}]"), count.to_string()]),
        );
        rows.extend(
            self.parse_results
                .iter()
                .map(|(name, count)| vec![format!("result[{name}]"), count.to_string()]),
        );
        rows
    }

    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Json => print_json(self),
            OutputFormat::Table => print_table(&["COUNTER", "VALUE"], self.rows()),
            OutputFormat::Pretty | OutputFormat::Raw => {
                for row in self.rows() {
                    println!("{}={}", row[0], row[1]);
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct EventRecord {
    event: usize,
    modules: Vec<ModuleRecord>,
}

#[derive(Debug, Serialize)]
struct ModuleRecord {
    prefix: Vec<u32>,
    dynamic: Vec<u32>,
    suffix: Vec<u32>,
}

pub fn print_event(event_index: usize, modules: &[ModuleData<'_>], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&EventRecord {
            event: event_index,
            modules: modules
                .iter()
                .map(|m| ModuleRecord {
                    prefix: m.prefix().to_vec(),
                    dynamic: m.dynamic().to_vec(),
                    suffix: m.suffix().to_vec(),
                })
                .collect(),
        }),
        _ => {
            let sizes: Vec<String> = modules
                .iter()
                .map(|m| format!("{}/{}/{}", m.prefix_size, m.dynamic_size, m.suffix_size))
                .collect();
            println!("event={event_index} modules=[{}]", sizes.join(" "));
        }
    }
}

pub fn run(args: ParseArgs, format: OutputFormat) -> CliResult<i32> {
    if args.buffer_words == 0 {
        return Err(CliError::new(USAGE, "--buffer-words must be greater than zero"));
    }

    let stacks = load_stacks(&args.stacks)?;
    let mut state = ReadoutParserState::from_stacks(&stacks, args.crate_index)
        .map_err(|err| readout_error("invalid readout stacks", err))?;
    let mut counters = ReadoutParserCounters::new();

    let words = read_words(&args.path)?;
    let connection: ConnectionType = args.connection.into();
    let buffers = match connection {
        ConnectionType::Usb => split_usb(&words, args.buffer_words),
        ConnectionType::Eth => split_eth(&words, args.buffer_words),
    };

    let print_events = args.events;
    let mut callbacks = callbacks_from_fn(
        |_crate_index: u8, event_index: usize, modules: &[ModuleData<'_>]| {
            if print_events {
                print_event(event_index, modules, format);
            }
        },
        |_crate_index: u8, _header_and_data: &[u32]| {},
    );

    for (number, buffer) in buffers.iter().enumerate() {
        let result = parse_readout_buffer(
            connection,
            &mut state,
            &mut callbacks,
            &mut counters,
            number as u32 + 1,
            buffer,
        );
        if !result.is_success() {
            tracing::warn!(buffer = number + 1, result = result.name(), "buffer parse failed");
        }
    }

    let summary = ParseSummary::from_counters(&counters);
    summary.print(format);

    if summary.has_errors() {
        return Err(CliError::new(DATA_INVALID, "readout data contained parse errors"));
    }
    Ok(SUCCESS)
}

/// Split at top-level frame boundaries. A frame larger than `max_words`
/// becomes a buffer of its own.
fn split_usb(words: &[u32], max_words: usize) -> Vec<&[u32]> {
    split_at_units(words, max_words, |rest| {
        if is_known_frame_header(rest[0]) {
            frame_length(rest[0]) as usize + 1
        } else {
            1
        }
    })
}

/// Split at packet boundaries.
fn split_eth(words: &[u32], max_words: usize) -> Vec<&[u32]> {
    split_at_units(words, max_words, |rest| {
        if rest.len() < eth::HEADER_WORDS {
            return rest.len();
        }
        let info = PayloadHeaderInfo::new(rest[0], rest[1]);
        eth::HEADER_WORDS + info.data_word_count() as usize
    })
}

fn split_at_units<F>(words: &[u32], max_words: usize, unit_len: F) -> Vec<&[u32]>
where
    F: Fn(&[u32]) -> usize,
{
    let mut buffers = Vec::new();
    let mut start = 0;
    let mut pos = 0;

    while pos < words.len() {
        let len = unit_len(&words[pos..]).clamp(1, words.len() - pos);
        if pos > start && pos + len - start > max_words {
            buffers.push(&words[start..pos]);
            start = pos;
        }
        pos += len;
    }
    if start < words.len() {
        buffers.push(&words[start..]);
    }
    buffers
}
