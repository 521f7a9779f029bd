use std::collections::BTreeMap;

use mvlc_frame::system_event::SUBTYPE_COUNT;
use serde::Serialize;

use crate::parser::ParseResult;

/// Running min/max/sum of the data sizes seen for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartSizeInfo {
    pub min: usize,
    pub max: usize,
    pub sum: usize,
}

impl Default for PartSizeInfo {
    fn default() -> Self {
        Self {
            min: usize::MAX,
            max: 0,
            sum: 0,
        }
    }
}

impl PartSizeInfo {
    pub fn update(&mut self, size: usize) {
        self.min = self.min.min(size);
        self.max = self.max.max(size);
        self.sum += size;
    }
}

/// (event index, module index)
pub type GroupKey = (usize, usize);

/// Session statistics maintained by the readout parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadoutParserCounters {
    /// Buffers missing from the buffer number sequence.
    pub internal_buffer_loss: u64,
    pub buffers_processed: u64,
    pub bytes_processed: u64,
    /// Bytes skipped or discarded without contributing to an event.
    pub unused_bytes: u64,

    pub eth_packets_processed: u64,
    pub eth_packet_loss: u64,

    /// Indexed by system event subtype.
    pub system_events: [u64; SUBTYPE_COUNT],
    /// Indexed by [`ParseResult::index`].
    pub parse_results: [u64; ParseResult::COUNT],
    pub parser_exceptions: u64,
    pub empty_stack_frames: u64,

    pub event_hits: BTreeMap<usize, u64>,
    /// Modules that produced data, counted per event.
    pub group_hits: BTreeMap<GroupKey, u64>,
    pub group_sizes: BTreeMap<GroupKey, PartSizeInfo>,
}

impl Default for ReadoutParserCounters {
    fn default() -> Self {
        Self {
            internal_buffer_loss: 0,
            buffers_processed: 0,
            bytes_processed: 0,
            unused_bytes: 0,
            eth_packets_processed: 0,
            eth_packet_loss: 0,
            system_events: [0; SUBTYPE_COUNT],
            parse_results: [0; ParseResult::COUNT],
            parser_exceptions: 0,
            empty_stack_frames: 0,
            event_hits: BTreeMap::new(),
            group_hits: BTreeMap::new(),
            group_sizes: BTreeMap::new(),
        }
    }
}

impl ReadoutParserCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count_result(&mut self, result: ParseResult) {
        self.parse_results[result.index()] += 1;
    }

    pub(crate) fn count_unused_words(&mut self, words: usize) {
        self.unused_bytes += (words * mvlc_frame::codec::WORD_SIZE) as u64;
    }

    pub fn parse_result_count(&self, result: ParseResult) -> u64 {
        self.parse_results[result.index()]
    }

    /// Non-zero entries of the parse result histogram.
    pub fn parse_result_counts(&self) -> impl Iterator<Item = (ParseResult, u64)> + '_ {
        ParseResult::ALL
            .into_iter()
            .map(|pr| (pr, self.parse_result_count(pr)))
            .filter(|(_, count)| *count > 0)
    }

    /// Non-zero `(subtype, count)` pairs.
    pub fn system_event_counts(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.system_events
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(subtype, count)| (subtype as u8, *count))
    }

    pub fn total_events(&self) -> u64 {
        self.event_hits.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_size_info() {
        let mut info = PartSizeInfo::default();
        for size in [7, 3, 12] {
            info.update(size);
        }
        assert_eq!(info, PartSizeInfo { min: 3, max: 12, sum: 22 });
    }

    #[test]
    fn part_size_info_serializes_as_object() {
        let info = PartSizeInfo { min: 3, max: 12, sum: 22 };
        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json, serde_json::json!({ "min": 3, "max": 12, "sum": 22 }));

        assert_eq!(serde_json::to_value(ParseResult::NotABlockFrame).unwrap(), "NotABlockFrame");
    }

    #[test]
    fn histograms_skip_zero_entries() {
        let mut counters = ReadoutParserCounters::new();
        counters.count_result(ParseResult::Ok);
        counters.count_result(ParseResult::Ok);
        counters.count_result(ParseResult::NotABlockFrame);
        counters.system_events[0x11] = 4;

        let results: Vec<_> = counters.parse_result_counts().collect();
        assert_eq!(
            results,
            vec![(ParseResult::Ok, 2), (ParseResult::NotABlockFrame, 1)]
        );
        assert_eq!(counters.system_event_counts().collect::<Vec<_>>(), vec![(0x11, 4)]);
    }

    #[test]
    fn unused_words_are_counted_in_bytes() {
        let mut counters = ReadoutParserCounters::new();
        counters.count_unused_words(3);
        assert_eq!(counters.unused_bytes, 12);
    }
}
