use mvlc_frame::system_event::{self, subtype};
use mvlc_readout::{
    parse_readout_buffer_usb, write_event_data, write_system_event, ModuleData,
    ModuleReadoutStructure, ParseResult, ReadoutParserCallbacks, ReadoutParserCounters,
    ReadoutParserState, DEFAULT_FRAME_MAX_WORDS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnedModule {
    prefix: Vec<u32>,
    dynamic: Vec<u32>,
    suffix: Vec<u32>,
}

#[derive(Default)]
struct Collector {
    events: Vec<(usize, Vec<OwnedModule>)>,
    system_events: Vec<Vec<u32>>,
}

impl ReadoutParserCallbacks for Collector {
    fn event_data(&mut self, _crate_index: u8, event_index: usize, modules: &[ModuleData<'_>]) {
        let modules = modules
            .iter()
            .map(|m| {
                assert!(m.is_consistent());
                OwnedModule {
                    prefix: m.prefix().to_vec(),
                    dynamic: m.dynamic().to_vec(),
                    suffix: m.suffix().to_vec(),
                }
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

fn structure() -> Vec<Vec<ModuleReadoutStructure>> {
    vec![
        vec![
            module(2, true, 1),
            module(0, false, 3),
            module(1, true, 0),
            module(0, false, 0),
        ],
        vec![module(0, true, 0)],
    ]
}

/// Deterministic module data matching `structure()`.
fn make_event(event_index: usize, seed: u32) -> Vec<OwnedModule> {
    let words = |tag: u32, n: usize| -> Vec<u32> {
        (0..n as u32).map(|i| (tag << 24) | (seed << 12) | i).collect()
    };
    let dyn_len = [0usize, 1, 5, 20, 300][seed as usize % 5];

    structure()[event_index]
        .iter()
        .enumerate()
        .map(|(mi, m)| {
            let tag = 0x10 * (mi as u32 + 1);
            OwnedModule {
                prefix: words(tag + 1, m.prefix_len as usize),
                dynamic: if m.has_dynamic {
                    words(tag + 2, dyn_len + mi)
                } else {
                    Vec::new()
                },
                suffix: words(tag + 3, m.suffix_len as usize),
            }
        })
        .collect()
}

fn write_event(dest: &mut Vec<u32>, crate_index: u8, event_index: usize, modules: &[OwnedModule], max: u32) {
    let flat: Vec<Vec<u32>> = modules
        .iter()
        .map(|m| [m.prefix.clone(), m.dynamic.clone(), m.suffix.clone()].concat())
        .collect();
    let has_dynamic: Vec<bool> = structure()[event_index].iter().map(|m| m.has_dynamic).collect();

    let data: Vec<ModuleData<'_>> = modules
        .iter()
        .zip(&flat)
        .zip(has_dynamic)
        .map(|((m, data), has_dynamic)| ModuleData {
            data,
            prefix_size: m.prefix.len(),
            dynamic_size: m.dynamic.len(),
            suffix_size: m.suffix.len(),
            has_dynamic,
        })
        .collect();

    write_event_data(dest, crate_index, event_index, &data, max).unwrap();
}

fn generate(max: u32) -> (Vec<u32>, Vec<(usize, Vec<OwnedModule>)>) {
    let mut stream = Vec::new();
    let mut events = Vec::new();

    for seed in 0..12u32 {
        let event_index = (seed % 3 == 2) as usize;
        let modules = make_event(event_index, seed);
        write_event(&mut stream, 0, event_index, &modules, max);
        events.push((event_index, modules));
    }

    (stream, events)
}

#[test]
fn listfile_roundtrip_for_frame_limits() {
    for max in [2, 3, 4, 7, 64, DEFAULT_FRAME_MAX_WORDS] {
        let (stream, expected) = generate(max);

        let mut state = ReadoutParserState::new(structure(), 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &stream);

        assert_eq!(result, ParseResult::Ok, "frame limit {max}");
        assert_eq!(cb.events, expected, "frame limit {max}");
        assert_eq!(counters.unused_bytes, 0, "frame limit {max}");
        assert_eq!(counters.total_events(), expected.len() as u64);
    }
}

#[test]
fn roundtrip_across_arbitrary_buffer_boundaries() {
    let (stream, expected) = generate(5);

    let mut state = ReadoutParserState::new(structure(), 0);
    let mut counters = ReadoutParserCounters::new();
    let mut cb = Collector::default();

    for (i, chunk) in stream.chunks(7).enumerate() {
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, i as u32 + 1, chunk);
        assert!(result.is_success(), "chunk {i}: {result}");
    }

    assert_eq!(cb.events, expected);
    assert_eq!(counters.internal_buffer_loss, 0);
}

#[test]
fn two_module_scenario_with_frame_limit_two() {
    let m0 = [0x10000001, 0x10000002];
    let m1 = [0x20000001, 0x20000002];
    let modules = [
        ModuleData {
            data: &m0,
            prefix_size: 0,
            dynamic_size: 2,
            suffix_size: 0,
            has_dynamic: true,
        },
        ModuleData {
            data: &m1,
            prefix_size: 0,
            dynamic_size: 2,
            suffix_size: 0,
            has_dynamic: true,
        },
    ];

    let mut dest = Vec::new();
    write_event_data(&mut dest, 1, 2, &modules, 2).unwrap();

    assert_eq!(
        dest,
        vec![
            0xF3832002, 0xF5800001, 0x10000001, 0xF9832002, 0xF5000001, 0x10000002, 0xF9832002,
            0xF5800001, 0x20000001, 0xF9032002, 0xF5000001, 0x20000002,
        ]
    );

    // Readout stacks for events 0 and 1 are empty.
    let structure = vec![vec![], vec![], vec![module(0, true, 0), module(0, true, 0)]];
    let mut state = ReadoutParserState::new(structure, 1);
    let mut counters = ReadoutParserCounters::new();
    let mut cb = Collector::default();

    let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &dest);
    assert_eq!(result, ParseResult::Ok);
    assert_eq!(cb.events.len(), 1);

    let (event_index, modules) = &cb.events[0];
    assert_eq!(*event_index, 2);
    assert_eq!(modules[0].dynamic, m0.to_vec());
    assert_eq!(modules[1].dynamic, m1.to_vec());
    assert!(modules.iter().all(|m| m.prefix.is_empty() && m.suffix.is_empty()));
}

#[test]
fn system_event_split_scenario() {
    let header = system_event::make_header(subtype::MVME_CONFIG, 0, false, 3);
    let payload = [header, 0xa1, 0xa2, 0xa3];

    let mut dest = Vec::new();
    write_system_event(&mut dest, 0, &payload, 2);

    let first = system_event::make_header(subtype::MVME_CONFIG, 0, true, 2);
    let second = system_event::make_header(subtype::MVME_CONFIG, 0, false, 1);
    assert_eq!(dest, vec![first, 0xa1, 0xa2, second, 0xa3]);

    // Sections are delivered one by one, in between events.
    write_event(&mut dest, 0, 1, &make_event(1, 2), 16);
    let mut state = ReadoutParserState::new(structure(), 0);
    let mut counters = ReadoutParserCounters::new();
    let mut cb = Collector::default();

    let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &dest);
    assert_eq!(result, ParseResult::Ok);
    assert_eq!(cb.system_events, vec![vec![first, 0xa1, 0xa2], vec![second, 0xa3]]);
    assert_eq!(counters.system_events[subtype::MVME_CONFIG as usize], 2);
    assert_eq!(cb.events.len(), 1);
}

/// A complete event, then an event split across two buffers.
fn loss_buffers() -> Vec<Vec<u32>> {
    vec![
        vec![0xF3010004, 1, 2, 3, 4],
        vec![0xF3810002, 5, 6],
        vec![0xF9010002, 7, 8],
    ]
}

#[test]
fn buffer_loss_discards_partial_event() {
    let structure = || vec![vec![module(4, false, 0)]];
    let buffers = loss_buffers();

    // Contiguous numbering: both events are assembled.
    let mut state = ReadoutParserState::new(structure(), 0);
    let mut counters = ReadoutParserCounters::new();
    let mut cb = Collector::default();
    for (number, buffer) in [1u32, 2, 3].into_iter().zip(&buffers) {
        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, number, buffer);
        assert!(result.is_success());
    }
    assert_eq!(cb.events.len(), 2);
    assert_eq!(counters.internal_buffer_loss, 0);

    // The last buffer arrives as number 4: the event begun in buffer 2 is dropped.
    let mut state = ReadoutParserState::new(structure(), 0);
    let mut counters = ReadoutParserCounters::new();
    let mut cb = Collector::default();
    let mut results = Vec::new();
    for (number, buffer) in [1u32, 2, 4].into_iter().zip(&buffers) {
        results.push(parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, number, buffer));
    }

    assert_eq!(results[1], ParseResult::NeedMoreInput);
    assert_eq!(results[2], ParseResult::NoStackFrameFound);
    assert_eq!(counters.internal_buffer_loss, 1);
    assert_eq!(cb.events.len(), 1);
    assert_eq!(cb.events[0].1[0].prefix, vec![1, 2, 3, 4]);
    assert!(!state.is_event_in_progress());
}

#[test]
fn resync_skips_garbage_words() {
    for n in [1usize, 3, 17] {
        let mut buffer: Vec<u32> = (0..n as u32).map(|i| 0x00c0_ffee + i).collect();
        buffer.extend_from_slice(&[0xF3010002, 0xaa, 0xbb]);

        let mut state = ReadoutParserState::new(vec![vec![module(2, false, 0)]], 0);
        let mut counters = ReadoutParserCounters::new();
        let mut cb = Collector::default();

        let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);

        assert_eq!(result, ParseResult::Ok);
        assert_eq!(counters.unused_bytes, n as u64 * 4);
        assert_eq!(cb.events.len(), 1);
        assert_eq!(cb.events[0].1[0].prefix, vec![0xaa, 0xbb]);
    }
}

#[test]
fn resync_skips_orphaned_continuation() {
    let buffer = [0xF9010002, 0x1, 0x2, 0xF3010002, 0xaa, 0xbb];
    let mut state = ReadoutParserState::new(vec![vec![module(2, false, 0)]], 0);
    let mut counters = ReadoutParserCounters::new();
    let mut cb = Collector::default();

    let result = parse_readout_buffer_usb(&mut state, &mut cb, &mut counters, 1, &buffer);
    assert_eq!(result, ParseResult::Ok);
    assert_eq!(counters.unused_bytes, 12);
    assert_eq!(cb.events.len(), 1);
}
