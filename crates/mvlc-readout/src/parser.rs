//! Readout data parser.
//!
//! Reassembles module data from the framed output of the readout stacks.
//! Input arrives in buffers (USB) or as concatenated UDP payloads including
//! their two header words (ETH). Frames and events may span buffers; the
//! parser state carries partially assembled events from one call to the
//! next.
//!
//! Completed events are handed to [`ReadoutParserCallbacks::event_data`] as
//! borrowed [`ModuleData`] views into the parser's work buffer. System
//! events found between stack frames go to
//! [`ReadoutParserCallbacks::system_event`].

use mvlc_frame::codec::{frame_length, frame_type_raw};
use mvlc_frame::system_event::extract_subtype;
use mvlc_frame::{extract_frame_info, FrameInfo, FrameType, StackCommandBuilder};
use mvlc_transport::eth::HEADER_WORDS;
use mvlc_transport::{calc_packet_loss, ConnectionType, PayloadHeaderInfo};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::counters::ReadoutParserCounters;
use crate::error::{ParserError, Result};
use crate::structure::{build_readout_structure, ReadoutStructure};

/// Initial work buffer size in words (1 MiB).
const INITIAL_WORK_BUFFER_WORDS: usize = 256 * 1024;

/// Outcome of a parse call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParseResult {
    Ok,
    /// ETH packet without a frame header pointer while no event is open.
    NoHeaderPresent,
    NoStackFrameFound,
    NotAStackFrame,
    NotABlockFrame,
    NotAStackContinuation,
    StackIndexChanged,
    StackIndexOutOfRange,
    GroupIndexOutOfRange,
    /// Zero length continuation inside an event. Tolerated and counted only.
    EmptyStackFrame,
    UnexpectedOpenBlockFrame,
    /// Non-empty stack frame for an event without modules.
    UnexpectedNonEmptyStackFrame,
    ParseReadoutContentsNotAdvancing,
    ParseEthBufferNotAdvancing,
    ParseEthPacketNotAdvancing,
    UnexpectedEndOfBuffer,
    UnhandledException,
    /// The buffer was consumed completely while an event is still open.
    /// Parsing resumes with the next buffer.
    NeedMoreInput,
}

impl ParseResult {
    pub const COUNT: usize = 18;

    pub const ALL: [ParseResult; Self::COUNT] = [
        ParseResult::Ok,
        ParseResult::NoHeaderPresent,
        ParseResult::NoStackFrameFound,
        ParseResult::NotAStackFrame,
        ParseResult::NotABlockFrame,
        ParseResult::NotAStackContinuation,
        ParseResult::StackIndexChanged,
        ParseResult::StackIndexOutOfRange,
        ParseResult::GroupIndexOutOfRange,
        ParseResult::EmptyStackFrame,
        ParseResult::UnexpectedOpenBlockFrame,
        ParseResult::UnexpectedNonEmptyStackFrame,
        ParseResult::ParseReadoutContentsNotAdvancing,
        ParseResult::ParseEthBufferNotAdvancing,
        ParseResult::ParseEthPacketNotAdvancing,
        ParseResult::UnexpectedEndOfBuffer,
        ParseResult::UnhandledException,
        ParseResult::NeedMoreInput,
    ];

    /// Position in [`ParseResult::ALL`] and the counters histogram.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ParseResult::Ok => "Ok",
            ParseResult::NoHeaderPresent => "NoHeaderPresent",
            ParseResult::NoStackFrameFound => "NoStackFrameFound",
            ParseResult::NotAStackFrame => "NotAStackFrame",
            ParseResult::NotABlockFrame => "NotABlockFrame",
            ParseResult::NotAStackContinuation => "NotAStackContinuation",
            ParseResult::StackIndexChanged => "StackIndexChanged",
            ParseResult::StackIndexOutOfRange => "StackIndexOutOfRange",
            ParseResult::GroupIndexOutOfRange => "GroupIndexOutOfRange",
            ParseResult::EmptyStackFrame => "EmptyStackFrame",
            ParseResult::UnexpectedOpenBlockFrame => "UnexpectedOpenBlockFrame",
            ParseResult::UnexpectedNonEmptyStackFrame => "UnexpectedNonEmptyStackFrame",
            ParseResult::ParseReadoutContentsNotAdvancing => "ParseReadoutContentsNotAdvancing",
            ParseResult::ParseEthBufferNotAdvancing => "ParseEthBufferNotAdvancing",
            ParseResult::ParseEthPacketNotAdvancing => "ParseEthPacketNotAdvancing",
            ParseResult::UnexpectedEndOfBuffer => "UnexpectedEndOfBuffer",
            ParseResult::UnhandledException => "UnhandledException",
            ParseResult::NeedMoreInput => "NeedMoreInput",
        }
    }

    /// `Ok` and `NeedMoreInput`; everything else discarded data.
    pub fn is_success(self) -> bool {
        matches!(self, ParseResult::Ok | ParseResult::NeedMoreInput)
    }
}

impl std::fmt::Display for ParseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Readout data of one module for one event.
///
/// `data` holds the prefix, dynamic and suffix words back to back. The view
/// borrows the parser's work buffer and is only valid inside the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleData<'a> {
    pub data: &'a [u32],
    pub prefix_size: usize,
    pub dynamic_size: usize,
    pub suffix_size: usize,
    pub has_dynamic: bool,
}

impl<'a> ModuleData<'a> {
    pub fn prefix(&self) -> &'a [u32] {
        &self.data[..self.prefix_size]
    }

    pub fn dynamic(&self) -> &'a [u32] {
        &self.data[self.prefix_size..self.prefix_size + self.dynamic_size]
    }

    pub fn suffix(&self) -> &'a [u32] {
        &self.data[self.prefix_size + self.dynamic_size..]
    }

    /// Part sizes add up to the data length.
    pub fn is_consistent(&self) -> bool {
        self.prefix_size + self.dynamic_size + self.suffix_size == self.data.len()
    }
}

/// Receives the parser output.
pub trait ReadoutParserCallbacks {
    fn event_data(&mut self, crate_index: u8, event_index: usize, modules: &[ModuleData<'_>]);

    /// `header_and_data` starts with the system event header word.
    fn system_event(&mut self, crate_index: u8, header_and_data: &[u32]);
}

/// Closure based [`ReadoutParserCallbacks`].
pub struct FnCallbacks<E, S> {
    event_data: E,
    system_event: S,
}

pub fn callbacks_from_fn<E, S>(event_data: E, system_event: S) -> FnCallbacks<E, S>
where
    E: FnMut(u8, usize, &[ModuleData<'_>]),
    S: FnMut(u8, &[u32]),
{
    FnCallbacks {
        event_data,
        system_event,
    }
}

impl<E, S> ReadoutParserCallbacks for FnCallbacks<E, S>
where
    E: FnMut(u8, usize, &[ModuleData<'_>]),
    S: FnMut(u8, &[u32]),
{
    fn event_data(&mut self, crate_index: u8, event_index: usize, modules: &[ModuleData<'_>]) {
        (self.event_data)(crate_index, event_index, modules)
    }

    fn system_event(&mut self, crate_index: u8, header_and_data: &[u32]) {
        (self.system_event)(crate_index, header_and_data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GroupParseState {
    #[default]
    Prefix,
    Dynamic,
    Suffix,
}

/// Offset and size of one module part inside the work buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Span {
    offset: usize,
    size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct ModuleReadoutSpans {
    prefix: Span,
    dynamic: Span,
    suffix: Span,
}

impl ModuleReadoutSpans {
    fn start_offset(&self) -> usize {
        [self.prefix, self.dynamic, self.suffix]
            .into_iter()
            .find(|span| span.size > 0)
            .map_or(0, |span| span.offset)
    }

    fn total_size(&self) -> usize {
        self.prefix.size + self.dynamic.size + self.suffix.size
    }
}

/// A frame being consumed: its header and the words still to come.
#[derive(Debug, Clone, Copy, Default)]
struct FrameParseState {
    header: u32,
    words_left: u16,
}

impl FrameParseState {
    fn new(header: u32) -> Self {
        Self {
            header,
            words_left: frame_length(header),
        }
    }

    fn is_open(&self) -> bool {
        self.words_left > 0
    }

    fn info(&self) -> FrameInfo {
        extract_frame_info(self.header)
    }

    fn consume_word(&mut self) -> std::result::Result<(), ParserError> {
        if self.words_left == 0 {
            return Err(ParserError::EndOfFrame);
        }
        self.words_left -= 1;
        Ok(())
    }
}

enum HeaderSearch {
    Found(u32),
    /// A system event header is next in line.
    SystemEvent,
    NotFound,
}

/// Parser state of one readout session.
pub struct ReadoutParserState {
    readout_structure: ReadoutStructure,
    crate_index: u8,

    work_buffer: Vec<u32>,
    spans: Vec<ModuleReadoutSpans>,

    /// `Some` while an event is in progress.
    event_index: Option<usize>,
    module_index: usize,
    group_parse_state: GroupParseState,
    cur_stack_frame: FrameParseState,
    cur_block_frame: FrameParseState,

    last_buffer_number: u32,
    last_packet_number: Option<u16>,
}

impl ReadoutParserState {
    pub fn new(readout_structure: ReadoutStructure, crate_index: u8) -> Self {
        let max_modules = readout_structure.iter().map(Vec::len).max().unwrap_or(0);

        Self {
            readout_structure,
            crate_index,
            work_buffer: Vec::with_capacity(INITIAL_WORK_BUFFER_WORDS),
            spans: vec![ModuleReadoutSpans::default(); max_modules],
            event_index: None,
            module_index: 0,
            group_parse_state: GroupParseState::Prefix,
            cur_stack_frame: FrameParseState::default(),
            cur_block_frame: FrameParseState::default(),
            last_buffer_number: 0,
            last_packet_number: None,
        }
    }

    /// Build the state from the readout stacks, one stack per event.
    pub fn from_stacks(stacks: &[StackCommandBuilder], crate_index: u8) -> Result<Self> {
        Ok(Self::new(build_readout_structure(stacks)?, crate_index))
    }

    pub fn readout_structure(&self) -> &ReadoutStructure {
        &self.readout_structure
    }

    pub fn crate_index(&self) -> u8 {
        self.crate_index
    }

    pub fn is_event_in_progress(&self) -> bool {
        self.event_index.is_some()
    }

    pub fn event_index(&self) -> Option<usize> {
        self.event_index
    }

    /// Drop the event in progress, if any.
    pub fn clear_event_state(&mut self) {
        self.event_index = None;
        self.module_index = 0;
        self.cur_stack_frame = FrameParseState::default();
        self.cur_block_frame = FrameParseState::default();
        self.group_parse_state = GroupParseState::Prefix;
    }

    fn begin_event(&mut self, header: u32) -> ParseResult {
        let info = extract_frame_info(header);

        if info.frame_type() != Some(FrameType::StackFrame) {
            warn!(header = format_args!("{header:#010x}"), "not a stack frame header");
            return ParseResult::NotAStackFrame;
        }

        let event_index = match (info.stack as usize).checked_sub(1) {
            Some(index) if index < self.readout_structure.len() => index,
            _ => {
                warn!(
                    stack = info.stack,
                    events = self.readout_structure.len(),
                    "stack index out of range"
                );
                return ParseResult::StackIndexOutOfRange;
            }
        };

        self.work_buffer.clear();
        self.spans.fill(ModuleReadoutSpans::default());
        self.event_index = Some(event_index);
        self.module_index = 0;
        self.group_parse_state = GroupParseState::Prefix;
        self.cur_stack_frame = FrameParseState::new(header);
        self.cur_block_frame = FrameParseState::default();

        trace!(event_index, header = format_args!("{header:#010x}"), "begin event");
        ParseResult::Ok
    }

    /// Copy `n` words from `input` into the work buffer, accounting for them
    /// in the current stack frame.
    fn copy_to_work_buffer(
        &mut self,
        input: &mut &[u32],
        n: usize,
    ) -> std::result::Result<(), ParserError> {
        if input.len() < n {
            return Err(ParserError::EndOfBuffer(format!(
                "copy of {n} words from {} available",
                input.len()
            )));
        }
        self.work_buffer.extend_from_slice(&input[..n]);
        *input = &input[n..];
        self.cur_stack_frame.words_left = self.cur_stack_frame.words_left.saturating_sub(n as u16);
        Ok(())
    }

    fn try_handle_system_event<C: ReadoutParserCallbacks + ?Sized>(
        &self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        input: &mut &[u32],
    ) -> std::result::Result<bool, ParserError> {
        let Some(&header) = input.first() else {
            return Ok(false);
        };

        if frame_type_raw(header) != FrameType::SystemEvent as u8 {
            return Ok(false);
        }

        let len = frame_length(header) as usize;
        if input.len() <= len {
            return Err(ParserError::EndOfBuffer(format!(
                "system event frame of {len} words, {} available",
                input.len() - 1
            )));
        }

        let subtype = extract_subtype(header);
        counters.system_events[subtype as usize] += 1;
        trace!(subtype, len, "system event");

        callbacks.system_event(self.crate_index, &input[..=len]);
        *input = &input[len + 1..];
        Ok(true)
    }

    /// Parse stack frame contents until `input` is exhausted or an error
    /// occurs. Returns `Ok` at the end of input even if an event is open.
    fn parse_readout_contents<C: ReadoutParserCallbacks + ?Sized>(
        &mut self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        input: &mut &[u32],
        is_eth: bool,
    ) -> std::result::Result<ParseResult, ParserError> {
        while !input.is_empty() {
            let words_before = input.len();

            if !self.cur_stack_frame.is_open() {
                if self.cur_block_frame.is_open() {
                    return Ok(ParseResult::UnexpectedOpenBlockFrame);
                }

                // ETH system events only appear between packets.
                if !is_eth && self.try_handle_system_event(callbacks, counters, input)? {
                    continue;
                }

                if let Some(event_index) = self.event_index {
                    let header = input.first().copied().ok_or_else(|| {
                        ParserError::EndOfBuffer("next stack frame header in event".to_string())
                    })?;
                    let info = extract_frame_info(header);

                    if info.frame_type() != Some(FrameType::StackContinuation) {
                        warn!(
                            event_index,
                            header = format_args!("{header:#010x}"),
                            "expected a stack continuation frame"
                        );
                        return Ok(ParseResult::NotAStackContinuation);
                    }

                    if info.stack as usize != event_index + 1 {
                        warn!(event_index, stack = info.stack, "stack index changed inside event");
                        return Ok(ParseResult::StackIndexChanged);
                    }

                    self.cur_stack_frame = FrameParseState::new(header);
                    *input = &input[1..];

                    if !self.cur_stack_frame.is_open() {
                        warn!(event_index, "empty stack continuation frame");
                        counters.empty_stack_frames += 1;
                        counters.count_result(ParseResult::EmptyStackFrame);
                        self.cur_block_frame = FrameParseState::default();
                    }
                } else {
                    let (search, skipped) = find_stack_frame_header(input, !is_eth);

                    if skipped > 0 {
                        counters.count_unused_words(skipped);
                        debug!(skipped, "skipped words searching for a stack frame header");
                    }

                    match search {
                        HeaderSearch::NotFound => return Ok(ParseResult::NoStackFrameFound),
                        HeaderSearch::SystemEvent => continue,
                        HeaderSearch::Found(header) => {
                            let result = self.begin_event(header);
                            if result != ParseResult::Ok {
                                return Ok(result);
                            }
                            *input = &input[1..];
                        }
                    }
                }
            }

            let Some(event_index) = self.event_index else {
                return Err(ParserError::NoEventInProgress);
            };

            let module_count = self.readout_structure[event_index].len();

            // Events without modules still produce an (empty) stack frame.
            if module_count == 0 {
                let len = frame_length(self.cur_stack_frame.header);
                self.clear_event_state();
                if len != 0 {
                    warn!(event_index, len, "no modules in event but got a non-empty stack frame");
                    return Ok(ParseResult::UnexpectedNonEmptyStackFrame);
                }
                return Ok(ParseResult::Ok);
            }

            if self.module_index >= module_count {
                return Ok(ParseResult::GroupIndexOutOfRange);
            }

            let mi = self.module_index;
            let module = &self.readout_structure[event_index][mi];
            let (prefix_len, suffix_len, has_dynamic, is_empty) = (
                module.prefix_len as usize,
                module.suffix_len as usize,
                module.has_dynamic,
                module.is_empty(),
            );

            if is_empty {
                self.module_index += 1;
            } else {
                match self.group_parse_state {
                    GroupParseState::Prefix => {
                        let span = self.spans[mi].prefix;
                        if span.size < prefix_len {
                            if span.size == 0 {
                                self.spans[mi].prefix.offset = self.work_buffer.len();
                            }
                            let n = (prefix_len - span.size)
                                .min(self.cur_stack_frame.words_left as usize)
                                .min(input.len());
                            self.copy_to_work_buffer(input, n)?;
                            self.spans[mi].prefix.size += n;
                        }

                        if self.spans[mi].prefix.size == prefix_len {
                            if has_dynamic {
                                self.group_parse_state = GroupParseState::Dynamic;
                                continue;
                            } else if suffix_len != 0 {
                                self.group_parse_state = GroupParseState::Suffix;
                                continue;
                            }
                            self.module_index += 1;
                            self.group_parse_state = GroupParseState::Prefix;
                        }
                    }

                    GroupParseState::Dynamic => {
                        if self.cur_stack_frame.is_open() && !self.cur_block_frame.is_open() {
                            let Some(&header) = input.first() else {
                                return Ok(ParseResult::Ok);
                            };

                            self.cur_block_frame = FrameParseState::new(header);
                            trace!(header = format_args!("{header:#010x}"), "block frame");

                            if self.cur_block_frame.info().frame_type() != Some(FrameType::BlockRead) {
                                warn!(
                                    event_index,
                                    module_index = mi,
                                    header = format_args!("{header:#010x}"),
                                    "NotABlockFrame"
                                );
                                self.clear_event_state();
                                return Ok(ParseResult::NotABlockFrame);
                            }

                            *input = &input[1..];
                            self.cur_stack_frame.consume_word()?;
                        }

                        if self.spans[mi].dynamic.size == 0 {
                            self.spans[mi].dynamic.offset = self.work_buffer.len();
                        }

                        // Block frames never extend past their stack frame.
                        let n = (self.cur_block_frame.words_left as usize)
                            .min(self.cur_stack_frame.words_left as usize)
                            .min(input.len());
                        self.copy_to_work_buffer(input, n)?;
                        self.spans[mi].dynamic.size += n;
                        self.cur_block_frame.words_left -= n as u16;

                        if !self.cur_block_frame.is_open()
                            && !self.cur_block_frame.info().flags.has_continue()
                        {
                            if suffix_len == 0 {
                                self.module_index += 1;
                                self.group_parse_state = GroupParseState::Prefix;
                            } else {
                                self.group_parse_state = GroupParseState::Suffix;
                                continue;
                            }
                        }
                    }

                    GroupParseState::Suffix => {
                        let span = self.spans[mi].suffix;
                        if span.size < suffix_len {
                            if span.size == 0 {
                                self.spans[mi].suffix.offset = self.work_buffer.len();
                            }
                            let n = (suffix_len - span.size)
                                .min(self.cur_stack_frame.words_left as usize)
                                .min(input.len());
                            self.copy_to_work_buffer(input, n)?;
                            self.spans[mi].suffix.size += n;
                        }

                        if self.spans[mi].suffix.size >= suffix_len {
                            self.module_index += 1;
                            self.group_parse_state = GroupParseState::Prefix;
                        }
                    }
                }
            }

            let modules = &self.readout_structure[event_index];
            while self.module_index < module_count && modules[self.module_index].is_empty() {
                self.module_index += 1;
            }

            if self.module_index >= module_count {
                self.flush_event(callbacks, counters, event_index);
            }

            if input.len() == words_before {
                return Ok(ParseResult::ParseReadoutContentsNotAdvancing);
            }
        }

        Ok(ParseResult::Ok)
    }

    /// Hand the completed event to the callback and reset the event state.
    fn flush_event<C: ReadoutParserCallbacks + ?Sized>(
        &mut self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        event_index: usize,
    ) {
        let modules = &self.readout_structure[event_index];
        let mut module_data = Vec::with_capacity(modules.len());

        for (mi, (module, spans)) in modules.iter().zip(&self.spans).enumerate() {
            let start = spans.start_offset();
            let size = spans.total_size();

            module_data.push(ModuleData {
                data: &self.work_buffer[start..start + size],
                prefix_size: spans.prefix.size,
                dynamic_size: spans.dynamic.size,
                suffix_size: spans.suffix.size,
                has_dynamic: module.has_dynamic,
            });

            if size > 0 {
                *counters.group_hits.entry((event_index, mi)).or_default() += 1;
                counters
                    .group_sizes
                    .entry((event_index, mi))
                    .or_default()
                    .update(size);
            }
        }

        trace!(event_index, modules = module_data.len(), "event complete");
        callbacks.event_data(self.crate_index, event_index, &module_data);
        *counters.event_hits.entry(event_index).or_default() += 1;
        drop(module_data);

        self.clear_event_state();
    }

    fn discard(&mut self, counters: &mut ReadoutParserCounters, remaining_words: usize) {
        self.clear_event_state();
        counters.count_unused_words(remaining_words);
    }

    fn parse_usb_buffer<C: ReadoutParserCallbacks + ?Sized>(
        &mut self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        buffer_number: u32,
        buffer: &[u32],
    ) -> std::result::Result<ParseResult, ParserError> {
        self.check_buffer_loss(counters, buffer_number);

        let mut input = buffer;

        while !input.is_empty() {
            match self.parse_readout_contents(callbacks, counters, &mut input, false) {
                Ok(result) => {
                    counters.count_result(result);
                    if result != ParseResult::Ok {
                        debug!(buffer_number, result = result.name(), "discarding rest of buffer");
                        self.discard(counters, input.len());
                        return Ok(result);
                    }
                }
                Err(err) => {
                    warn!(buffer_number, error = %err, "error parsing buffer");
                    self.discard(counters, input.len());
                    counters.parser_exceptions += 1;
                    return Err(err);
                }
            }
        }

        counters.buffers_processed += 1;
        counters.bytes_processed += (buffer.len() * mvlc_frame::codec::WORD_SIZE) as u64;
        Ok(ParseResult::Ok)
    }

    fn parse_eth_buffer<C: ReadoutParserCallbacks + ?Sized>(
        &mut self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        buffer_number: u32,
        buffer: &[u32],
    ) -> std::result::Result<ParseResult, ParserError> {
        self.check_buffer_loss(counters, buffer_number);

        let mut input = buffer;

        match self.parse_eth_packets(callbacks, counters, &mut input, buffer_number) {
            Ok(ParseResult::Ok) => {
                counters.buffers_processed += 1;
                counters.count_unused_words(input.len());
                counters.bytes_processed += (buffer.len() * mvlc_frame::codec::WORD_SIZE) as u64;
                Ok(ParseResult::Ok)
            }
            Ok(result) => {
                counters.count_result(result);
                self.discard(counters, input.len());
                Ok(result)
            }
            Err(err) => {
                warn!(buffer_number, error = %err, "error parsing ETH buffer");
                self.discard(counters, input.len());
                counters.parser_exceptions += 1;
                Err(err)
            }
        }
    }

    fn parse_eth_packets<C: ReadoutParserCallbacks + ?Sized>(
        &mut self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        input: &mut &[u32],
        buffer_number: u32,
    ) -> std::result::Result<ParseResult, ParserError> {
        while !input.is_empty() {
            let words_before = input.len();

            // The readout worker inserts system events between packets.
            if self.try_handle_system_event(callbacks, counters, input)? {
                continue;
            }

            if input.len() < HEADER_WORDS {
                return Err(ParserError::EndOfBuffer("ETH packet header words".to_string()));
            }

            let headers = PayloadHeaderInfo::new(input[0], input[1]);
            let packet_words = HEADER_WORDS + headers.data_word_count() as usize;

            if input.len() < packet_words {
                return Err(ParserError::EndOfBuffer(format!(
                    "ETH packet of {packet_words} words, {} available",
                    input.len()
                )));
            }

            if let Some(last) = self.last_packet_number {
                let loss = calc_packet_loss(last, headers.packet_number());
                if loss > 0 {
                    debug!(
                        buffer_number,
                        last,
                        current = headers.packet_number(),
                        loss,
                        "ETH packet loss"
                    );
                    self.clear_event_state();
                    counters.eth_packet_loss += loss as u64;
                }
            }
            self.last_packet_number = Some(headers.packet_number());

            let packet = &input[..packet_words];

            let failed = match self.parse_eth_packet(callbacks, counters, packet) {
                Ok(result) => {
                    counters.count_result(result);
                    result != ParseResult::Ok
                }
                Err(err) => {
                    warn!(
                        buffer_number,
                        packet_number = headers.packet_number(),
                        error = %err,
                        "error parsing ETH packet, skipping it"
                    );
                    counters.parser_exceptions += 1;
                    true
                }
            };

            counters.eth_packets_processed += 1;

            if failed {
                self.discard(counters, packet_words);
            }

            *input = &input[packet_words..];

            if input.len() == words_before {
                return Ok(ParseResult::ParseEthBufferNotAdvancing);
            }
        }

        Ok(ParseResult::Ok)
    }

    /// `packet` includes the two ETH header words.
    fn parse_eth_packet<C: ReadoutParserCallbacks + ?Sized>(
        &mut self,
        callbacks: &mut C,
        counters: &mut ReadoutParserCounters,
        packet: &[u32],
    ) -> std::result::Result<ParseResult, ParserError> {
        if packet.len() < HEADER_WORDS {
            return Err(ParserError::EndOfBuffer("ETH packet header words".to_string()));
        }

        let headers = PayloadHeaderInfo::new(packet[0], packet[1]);
        let mut input = &packet[HEADER_WORDS..];

        if !self.is_event_in_progress() {
            // Without an open event parsing can only start at a frame header.
            if !headers.is_next_header_pointer_present() {
                return Ok(ParseResult::NoHeaderPresent);
            }

            let nhp = headers.next_header_pointer() as usize;
            if input.len() < nhp {
                return Err(ParserError::EndOfBuffer(format!(
                    "next header pointer {nhp} beyond packet payload of {} words",
                    input.len()
                )));
            }

            if nhp > 0 {
                debug!(nhp, "skipping to the next frame header in packet");
                counters.count_unused_words(nhp);
            }
            input = &input[nhp..];
        }

        while !input.is_empty() {
            let words_before = input.len();
            let result = self.parse_readout_contents(callbacks, counters, &mut input, true)?;

            if result != ParseResult::Ok {
                return Ok(result);
            }

            if input.len() == words_before {
                return Ok(ParseResult::ParseEthPacketNotAdvancing);
            }
        }

        Ok(ParseResult::Ok)
    }

    fn check_buffer_loss(&mut self, counters: &mut ReadoutParserCounters, buffer_number: u32) {
        let loss = calc_buffer_loss(buffer_number, self.last_buffer_number);
        self.last_buffer_number = buffer_number;

        if loss != 0 {
            debug!(
                buffer_number,
                loss,
                event_in_progress = self.is_event_in_progress(),
                "internal buffer loss"
            );
            self.clear_event_state();
            counters.internal_buffer_loss += loss as u64;
            self.last_packet_number = None;
        }
    }

    /// Map the internal outcome of a buffer parse to its public result.
    fn finish(
        &mut self,
        counters: &mut ReadoutParserCounters,
        outcome: std::result::Result<ParseResult, ParserError>,
    ) -> ParseResult {
        let result = match outcome {
            Ok(result) => result,
            Err(ParserError::EndOfBuffer(_)) => ParseResult::UnexpectedEndOfBuffer,
            Err(_) => ParseResult::UnhandledException,
        };

        if !result.is_success() {
            self.clear_event_state();
            return result;
        }

        if self.is_event_in_progress() {
            counters.count_result(ParseResult::NeedMoreInput);
            return ParseResult::NeedMoreInput;
        }

        result
    }
}

impl std::fmt::Debug for ReadoutParserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutParserState")
            .field("crate_index", &self.crate_index)
            .field("events", &self.readout_structure.len())
            .field("event_index", &self.event_index)
            .field("module_index", &self.module_index)
            .field("group_parse_state", &self.group_parse_state)
            .field("work_buffer_words", &self.work_buffer.len())
            .field("last_buffer_number", &self.last_buffer_number)
            .field("last_packet_number", &self.last_packet_number)
            .finish()
    }
}

/// Search for the next StackFrame header.
///
/// Complete StackContinuation frames are skipped as a whole, any other word
/// is skipped on its own. Returns the outcome and the number of skipped
/// words. `input` is advanced past the skipped words.
fn find_stack_frame_header(input: &mut &[u32], stop_at_system_event: bool) -> (HeaderSearch, usize) {
    let mut skipped = 0;

    while let Some(&header) = input.first() {
        match FrameType::from_raw(frame_type_raw(header)) {
            Some(FrameType::StackFrame) => return (HeaderSearch::Found(header), skipped),
            Some(FrameType::StackContinuation) => {
                let len = frame_length(header) as usize;
                if input.len() <= len {
                    return (HeaderSearch::NotFound, skipped);
                }
                *input = &input[len + 1..];
                skipped += len + 1;
            }
            Some(FrameType::SystemEvent) if stop_at_system_event => {
                return (HeaderSearch::SystemEvent, skipped)
            }
            _ => {
                *input = &input[1..];
                skipped += 1;
            }
        }
    }

    (HeaderSearch::NotFound, skipped)
}

/// Number of buffers missing between `last` and `buffer_number`.
pub fn calc_buffer_loss(buffer_number: u32, last: u32) -> u32 {
    let diff = buffer_number as i64 - last as i64;

    if diff < 1 {
        (u32::MAX as i64 + diff) as u32
    } else {
        (diff - 1) as u32
    }
}

/// Parse one USB readout buffer.
pub fn parse_readout_buffer_usb<C: ReadoutParserCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    counters: &mut ReadoutParserCounters,
    buffer_number: u32,
    buffer: &[u32],
) -> ParseResult {
    trace!(buffer_number, words = buffer.len(), "parse USB buffer");
    let outcome = state.parse_usb_buffer(callbacks, counters, buffer_number, buffer);
    state.finish(counters, outcome)
}

/// Parse one ETH readout buffer: whole packets including their header words,
/// optionally interleaved with system event frames.
pub fn parse_readout_buffer_eth<C: ReadoutParserCallbacks + ?Sized>(
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    counters: &mut ReadoutParserCounters,
    buffer_number: u32,
    buffer: &[u32],
) -> ParseResult {
    trace!(buffer_number, words = buffer.len(), "parse ETH buffer");
    let outcome = state.parse_eth_buffer(callbacks, counters, buffer_number, buffer);
    state.finish(counters, outcome)
}

pub fn parse_readout_buffer<C: ReadoutParserCallbacks + ?Sized>(
    connection_type: ConnectionType,
    state: &mut ReadoutParserState,
    callbacks: &mut C,
    counters: &mut ReadoutParserCounters,
    buffer_number: u32,
    buffer: &[u32],
) -> ParseResult {
    match connection_type {
        ConnectionType::Usb => {
            parse_readout_buffer_usb(state, callbacks, counters, buffer_number, buffer)
        }
        ConnectionType::Eth => {
            parse_readout_buffer_eth(state, callbacks, counters, buffer_number, buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::ModuleReadoutStructure;

    #[derive(Default)]
    struct Collector {
        events: Vec<(usize, Vec<(Vec<u32>, Vec<u32>, Vec<u32>)>)>,
        system_events: Vec<Vec<u32>>,
    }

    impl ReadoutParserCallbacks for Collector {
        fn event_data(&mut self, _crate_index: u8, event_index: usize, modules: &[ModuleData<'_>]) {
            let modules = modules
                .iter()
                .map(|m| {
                    assert!(m.is_consistent());
                    (m.prefix().to_vec(), m.dynamic().to_vec(), m.suffix().to_vec())
                })
                .collect();
            self.events.push((event_index, modules));
        }

        fn system_event(&mut self, _crate_index: u8, header_and_data: &[u32]) {
            self.system_events.push(header_and_data.to_vec());
        }
    }

    fn module(prefix_len: u8, has_dynamic: bool, suffix_len: u8) -> ModuleReadoutStructure {
        ModuleReadoutStructure {
            name: String::new(),
            prefix_len,
            suffix_len,
            has_dynamic,
        }
    }

    #[test]
    fn buffer_loss_arithmetic() {
        assert_eq!(calc_buffer_loss(1, 0), 0);
        assert_eq!(calc_buffer_loss(5, 4), 0);
        assert_eq!(calc_buffer_loss(7, 4), 2);
        assert_eq!(calc_buffer_loss(0, u32::MAX), 0);
        assert_eq!(calc_buffer_loss(4, 4), u32::MAX);
    }

    #[test]
    fn result_names_and_indexes() {
        for (i, pr) in ParseResult::ALL.into_iter().enumerate() {
            assert_eq!(pr.index(), i);
        }
        assert_eq!(ParseResult::NotABlockFrame.name(), "NotABlockFrame");
        assert_eq!(ParseResult::NeedMoreInput.to_string(), "NeedMoreInput");
        assert!(ParseResult::NeedMoreInput.is_success());
        assert!(!ParseResult::UnexpectedEndOfBuffer.is_success());
    }

    #[test]
    fn prefix_dynamic_suffix_event() {
        let mut state = ReadoutParserState::new(vec![vec![module(1, true, 1)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let buffer = [0xF3010005, 0xa, 0xF5000002, 0xb, 0xc, 0xd];
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);

        assert_eq!(result, ParseResult::Ok);
        assert_eq!(
            cb.events,
            vec![(0, vec![(vec![0xa], vec![0xb, 0xc], vec![0xd])])]
        );
        assert_eq!(counters.event_hits[&0], 1);
        assert_eq!(counters.group_hits[&(0, 0)], 1);
        assert_eq!(counters.group_sizes[&(0, 0)].sum, 4);
        assert_eq!(counters.buffers_processed, 1);
        assert_eq!(counters.bytes_processed, 24);
        assert_eq!(counters.unused_bytes, 0);
    }

    #[test]
    fn event_spanning_buffers_needs_more_input() {
        let mut state = ReadoutParserState::new(vec![vec![module(3, false, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let first = [0xF3810002, 0x1, 0x2];
        let second = [0xF9010001, 0x3];

        assert_eq!(
            parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &first),
            ParseResult::NeedMoreInput
        );
        assert!(state.is_event_in_progress());
        assert!(cb.events.is_empty());

        assert_eq!(
            parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 2, &second),
            ParseResult::Ok
        );
        assert_eq!(cb.events, vec![(0, vec![(vec![1, 2, 3], vec![], vec![])])]);
        assert_eq!(counters.parse_result_count(ParseResult::NeedMoreInput), 1);
    }

    #[test]
    fn system_events_are_delivered_between_frames() {
        let mut state = ReadoutParserState::new(vec![vec![module(1, false, 0)]], 2);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let timetick = mvlc_frame::system_event::make_header(0x11, 0, false, 1);
        let buffer = [timetick, 0x1234, 0xF3010001, 0x42];

        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);
        assert_eq!(result, ParseResult::Ok);
        assert_eq!(cb.system_events, vec![vec![timetick, 0x1234]]);
        assert_eq!(counters.system_events[0x11], 1);
        assert_eq!(cb.events.len(), 1);
    }

    #[test]
    fn truncated_system_event_is_end_of_buffer() {
        let mut state = ReadoutParserState::new(vec![vec![module(1, false, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let header = mvlc_frame::system_event::make_header(0x11, 0, false, 4);
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &[header, 1]);

        assert_eq!(result, ParseResult::UnexpectedEndOfBuffer);
        assert_eq!(counters.parser_exceptions, 1);
        assert!(cb.system_events.is_empty());
    }

    #[test]
    fn not_a_block_frame_discards_event() {
        let mut state = ReadoutParserState::new(vec![vec![module(0, true, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &[0xF3010002, 0x1, 0x2]);

        assert_eq!(result, ParseResult::NotABlockFrame);
        assert!(!state.is_event_in_progress());
        assert!(cb.events.is_empty());
        assert_eq!(counters.parse_result_count(ParseResult::NotABlockFrame), 1);
        assert_eq!(counters.unused_bytes, 8);
    }

    #[test]
    fn stack_index_checks() {
        let mut state = ReadoutParserState::new(vec![vec![module(1, false, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        // stack 2 maps to event 1 which does not exist
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &[0xF3020001, 0x1]);
        assert_eq!(result, ParseResult::StackIndexOutOfRange);

        // continuation for a different stack
        let mut state = ReadoutParserState::new(vec![vec![module(2, false, 0)], vec![module(1, false, 0)]], 0);
        let buffer = [0xF3810001, 0x1, 0xF9020001, 0x2];
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);
        assert_eq!(result, ParseResult::StackIndexChanged);
        assert!(!state.is_event_in_progress());
    }

    #[test]
    fn events_without_modules() {
        let mut state = ReadoutParserState::new(vec![vec![]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        assert_eq!(
            parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &[0xF3010000]),
            ParseResult::Ok
        );
        assert_eq!(
            parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 2, &[0xF3010001, 0x5]),
            ParseResult::UnexpectedNonEmptyStackFrame
        );
        assert!(cb.events.is_empty());
    }

    #[test]
    fn empty_continuation_is_tolerated() {
        let mut state = ReadoutParserState::new(vec![vec![module(2, false, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let buffer = [0xF3810001, 0x1, 0xF9810000, 0xF9010001, 0x2];
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);

        assert_eq!(result, ParseResult::Ok);
        assert_eq!(counters.empty_stack_frames, 1);
        assert_eq!(counters.parse_result_count(ParseResult::EmptyStackFrame), 1);
        assert_eq!(cb.events, vec![(0, vec![(vec![1, 2], vec![], vec![])])]);
    }

    #[test]
    fn empty_modules_are_skipped() {
        let structure = vec![vec![module(0, false, 0), module(1, false, 0), module(0, false, 0)]];
        let mut state = ReadoutParserState::new(structure, 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &[0xF3010001, 0x7]);
        assert_eq!(result, ParseResult::Ok);
        assert_eq!(cb.events.len(), 1);
        let modules = &cb.events[0].1;
        assert_eq!(modules.len(), 3);
        assert_eq!(modules[1].0, vec![0x7]);
        assert!(modules[0].0.is_empty() && modules[2].0.is_empty());
        assert!(!counters.group_hits.contains_key(&(0, 0)));
    }

    /// Event 0 open with the module cursor resting on an empty module.
    fn stalled_state() -> ReadoutParserState {
        let mut state =
            ReadoutParserState::new(vec![vec![module(0, false, 0), module(1, false, 0)]], 0);
        state.event_index = Some(0);
        state.cur_stack_frame = FrameParseState::new(0xF3010002);
        state
    }

    #[test]
    fn block_frame_open_past_its_stack_frame() {
        let mut state = ReadoutParserState::new(vec![vec![module(0, true, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        // The block frame claims three words but the stack frame ends after one.
        let buffer = [0xF3010002, 0xF5000003, 0xa, 0xF9010002, 0xb, 0xc];
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);

        assert_eq!(result, ParseResult::UnexpectedOpenBlockFrame);
        assert!(!state.is_event_in_progress());
        assert!(cb.events.is_empty());
        assert_eq!(counters.parse_result_count(ParseResult::UnexpectedOpenBlockFrame), 1);
        assert_eq!(counters.unused_bytes, 12);

        let next = [0xF3010002, 0xF5000001, 0x7];
        assert_eq!(
            parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 2, &next),
            ParseResult::Ok
        );
        assert_eq!(cb.events, vec![(0, vec![(vec![], vec![0x7], vec![])])]);
    }

    #[test]
    fn stalled_usb_parse_is_reported_and_drops_the_event() {
        let mut state = stalled_state();
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let result =
            parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &[0x1234, 0x5678]);

        assert_eq!(result, ParseResult::ParseReadoutContentsNotAdvancing);
        assert!(!result.is_success());
        assert!(!state.is_event_in_progress());
        assert!(cb.events.is_empty());
        assert_eq!(
            counters.parse_result_count(ParseResult::ParseReadoutContentsNotAdvancing),
            1
        );
        assert_eq!(counters.unused_bytes, 8);
        assert_eq!(counters.buffers_processed, 0);
    }

    #[test]
    fn stalled_eth_packet_is_skipped() {
        let mut state = stalled_state();
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let hdr = PayloadHeaderInfo::encode(1, 0, 2, 0, 0);
        let buffer = [hdr.header0, hdr.header1, 0x1234, 0x5678];
        let result = parse_readout_buffer_eth(&mut state, &mut cb, &mut counters, 1, &buffer);

        // The packet is dropped, the buffer as a whole still parses.
        assert_eq!(result, ParseResult::Ok);
        assert!(!state.is_event_in_progress());
        assert!(cb.events.is_empty());
        assert_eq!(
            counters.parse_result_count(ParseResult::ParseReadoutContentsNotAdvancing),
            1
        );
        assert_eq!(counters.eth_packets_processed, 1);
        assert_eq!(counters.unused_bytes, 16);
    }

    #[test]
    fn closure_callbacks() {
        let mut state = ReadoutParserState::new(vec![vec![module(1, false, 0)]], 3);
        let mut counters = ReadoutParserCounters::new();
        let mut seen = Vec::new();

        {
            let mut cb = callbacks_from_fn(
                |crate_index, event_index, modules: &[ModuleData<'_>]| {
                    seen.push((crate_index, event_index, modules[0].data.to_vec()));
                },
                |_, _| {},
            );
            parse_readout_buffer(
                ConnectionType::Usb,
                &mut state,
                &mut cb,
                &mut counters,
                1,
                &[0xF3010001, 0x99],
            );
        }

        assert_eq!(seen, vec![(3, 0, vec![0x99])]);
    }
}
