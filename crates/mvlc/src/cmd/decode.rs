use mvlc_frame::codec::{decode_frame_header, frame_length, is_known_frame_header};
use mvlc_transport::eth::{self, PayloadHeaderInfo};
use serde::Serialize;

use crate::cmd::{read_words, ConnectionArg, DecodeArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{hex32, print_json, print_table, OutputFormat};

#[derive(Debug, Serialize)]
struct DecodedEntry {
    offset: usize,
    header: String,
    words: usize,
    description: String,
}

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let words = read_words(&args.path)?;

    let mut entries = match args.connection {
        ConnectionArg::Usb => decode_frames(&words, 0),
        ConnectionArg::Eth => decode_packets(&words),
    };
    if let Some(limit) = args.limit {
        entries.truncate(limit);
    }

    match format {
        OutputFormat::Json => {
            for entry in &entries {
                print_json(entry);
            }
        }
        OutputFormat::Table => print_table(
            &["OFFSET", "HEADER", "WORDS", "DESCRIPTION"],
            entries.iter().map(|e| {
                vec![
                    e.offset.to_string(),
                    e.header.clone(),
                    e.words.to_string(),
                    e.description.clone(),
                ]
            }),
        ),
        OutputFormat::Pretty | OutputFormat::Raw => {
            for e in &entries {
                println!("{:>8} {} {}", e.offset, e.header, e.description);
            }
        }
    }

    Ok(SUCCESS)
}

/// Top-level frames in `words`. Unknown words are reported one at a time.
fn decode_frames(words: &[u32], base: usize) -> Vec<DecodedEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < words.len() {
        let header = words[pos];
        let entry = if is_known_frame_header(header) {
            let len = (frame_length(header) as usize + 1).min(words.len() - pos);
            DecodedEntry {
                offset: base + pos,
                header: hex32(header),
                words: len,
                description: decode_frame_header(header),
            }
        } else {
            DecodedEntry {
                offset: base + pos,
                header: hex32(header),
                words: 1,
                description: "unknown".to_string(),
            }
        };
        pos += entry.words;
        entries.push(entry);
    }

    entries
}

fn decode_packets(words: &[u32]) -> Vec<DecodedEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos + eth::HEADER_WORDS <= words.len() {
        let info = PayloadHeaderInfo::new(words[pos], words[pos + 1]);
        let len = (eth::HEADER_WORDS + info.data_word_count() as usize).min(words.len() - pos);
        let pointer = if info.is_next_header_pointer_present() {
            info.next_header_pointer().to_string()
        } else {
            "none".to_string()
        };

        entries.push(DecodedEntry {
            offset: pos,
            header: hex32(info.header0),
            words: len,
            description: format!(
                "packet (channel={}, number={}, dataWords={}, nextHeader={})",
                info.packet_channel(),
                info.packet_number(),
                info.data_word_count(),
                pointer
            ),
        });

        // Frames are only decodable from the first header pointer onwards.
        if info.is_next_header_pointer_present() {
            let start = pos + eth::HEADER_WORDS + info.next_header_pointer() as usize;
            let end = pos + len;
            if start < end {
                entries.extend(decode_frames(&words[start..end], start));
            }
        }

        pos += len;
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvlc_frame::codec::encode_frame_header;
    use mvlc_frame::{FrameFlags, FrameType};

    #[test]
    fn walks_frames_and_unknown_words() {
        let words = [
            encode_frame_header(FrameType::StackFrame, FrameFlags::NONE, 1, 0, 2),
            1,
            2,
            0xdead_beef,
            encode_frame_header(FrameType::SuperFrame, FrameFlags::NONE, 0, 0, 0),
        ];
        let entries = decode_frames(&words, 0);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].words, 3);
        assert_eq!(entries[1].offset, 3);
        assert_eq!(entries[1].description, "unknown");
        assert_eq!(entries[2].offset, 4);
    }

    #[test]
    fn truncated_frame_is_clamped() {
        let words = [encode_frame_header(
            FrameType::BlockRead,
            FrameFlags::NONE,
            0,
            0,
            10,
        )];
        let entries = decode_frames(&words, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].words, 1);
    }

    #[test]
    fn packets_with_frames() {
        let frame = encode_frame_header(FrameType::StackFrame, FrameFlags::NONE, 1, 0, 1);
        let hdr = PayloadHeaderInfo::encode(2, 5, 2, 0, 0);
        let words = [hdr.header0, hdr.header1, frame, 42];
        let entries = decode_packets(&words);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].description.contains("number=5"));
        assert_eq!(entries[1].offset, 2);
        assert_eq!(entries[1].words, 2);
    }
}
