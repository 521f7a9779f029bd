use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use crate::system_event;

pub const TYPE_SHIFT: u32 = 24;
pub const TYPE_MASK: u32 = 0xff;
pub const FLAGS_SHIFT: u32 = 20;
pub const FLAGS_MASK: u32 = 0xf;
pub const STACK_NUM_SHIFT: u32 = 16;
pub const STACK_NUM_MASK: u32 = 0xf;
pub const CTRL_ID_SHIFT: u32 = 13;
pub const CTRL_ID_MASK: u32 = 0b111;
pub const LENGTH_MASK: u32 = 0x1fff;

/// Largest value the 13-bit length field can carry.
pub const MAX_FRAME_LENGTH: u16 = LENGTH_MASK as u16;

/// Size of one protocol word in bytes.
pub const WORD_SIZE: usize = 4;

/// Frame types carried in bits 31:24 of a header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Outermost frame of a command buffer response.
    SuperFrame = 0xF1,
    /// Outermost frame of data produced by a stack execution.
    StackFrame = 0xF3,
    /// Inner frame for block reads, always inside a stack frame.
    BlockRead = 0xF5,
    StackError = 0xF7,
    /// Follows a stack frame that had the Continue flag set.
    StackContinuation = 0xF9,
    /// Software generated frame (timestamps, configuration, ...).
    SystemEvent = 0xFA,
}

impl FrameType {
    pub const ALL: [FrameType; 6] = [
        FrameType::SuperFrame,
        FrameType::StackFrame,
        FrameType::BlockRead,
        FrameType::StackError,
        FrameType::StackContinuation,
        FrameType::SystemEvent,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::SuperFrame => "SuperFrame",
            FrameType::StackFrame => "StackResultFrame",
            FrameType::BlockRead => "BlockReadFrame",
            FrameType::StackError => "StackErrorFrame",
            FrameType::StackContinuation => "StackResultContinuation Frame",
            FrameType::SystemEvent => "SystemEvent",
        }
    }
}

/// The 4-bit flags field: Continue plus the three error flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    pub const TIMEOUT: FrameFlags = FrameFlags(1 << 0);
    pub const BUS_ERROR: FrameFlags = FrameFlags(1 << 1);
    pub const SYNTAX_ERROR: FrameFlags = FrameFlags(1 << 2);
    pub const CONTINUE: FrameFlags = FrameFlags(1 << 3);
    pub const ALL_ERRORS: FrameFlags = FrameFlags(0b0111);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn has_continue(self) -> bool {
        self.contains(Self::CONTINUE)
    }

    pub fn has_error(self) -> bool {
        self.0 & Self::ALL_ERRORS.0 != 0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FrameFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("none");
        }

        let names = [
            (Self::CONTINUE, "continue"),
            (Self::SYNTAX_ERROR, "syntax"),
            (Self::BUS_ERROR, "BERR"),
            (Self::TIMEOUT, "timeout"),
        ];

        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Decoded view over a single header word.
///
/// For system events `stack` is zero, `ctrl` comes from bits 22:20 and the
/// continue bit (23) is reported as [`FrameFlags::CONTINUE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub raw_type: u8,
    pub flags: FrameFlags,
    pub stack: u8,
    pub ctrl: u8,
    pub len: u16,
}

impl FrameInfo {
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_raw(self.raw_type)
    }
}

/// Split a header word into its fields. Never fails: unknown types are
/// reported through [`FrameInfo::frame_type`] returning `None`.
pub fn extract_frame_info(header: u32) -> FrameInfo {
    let raw_type = ((header >> TYPE_SHIFT) & TYPE_MASK) as u8;
    let len = (header & LENGTH_MASK) as u16;

    if raw_type == FrameType::SystemEvent as u8 {
        let cont = (header >> system_event::CONTINUE_SHIFT) & system_event::CONTINUE_MASK;
        return FrameInfo {
            raw_type,
            flags: if cont != 0 {
                FrameFlags::CONTINUE
            } else {
                FrameFlags::NONE
            },
            stack: 0,
            ctrl: ((header >> system_event::CTRL_ID_SHIFT) & system_event::CTRL_ID_MASK) as u8,
            len,
        };
    }

    FrameInfo {
        raw_type,
        flags: FrameFlags(((header >> FLAGS_SHIFT) & FLAGS_MASK) as u8),
        stack: ((header >> STACK_NUM_SHIFT) & STACK_NUM_MASK) as u8,
        ctrl: ((header >> CTRL_ID_SHIFT) & CTRL_ID_MASK) as u8,
        len,
    }
}

/// Build a generic (non system event) header word. Fields are masked to their widths.
pub fn encode_frame_header(
    frame_type: FrameType,
    flags: FrameFlags,
    stack: u8,
    ctrl: u8,
    len: u16,
) -> u32 {
    ((frame_type as u32 & TYPE_MASK) << TYPE_SHIFT)
        | ((flags.0 as u32 & FLAGS_MASK) << FLAGS_SHIFT)
        | ((stack as u32 & STACK_NUM_MASK) << STACK_NUM_SHIFT)
        | ((ctrl as u32 & CTRL_ID_MASK) << CTRL_ID_SHIFT)
        | (len as u32 & LENGTH_MASK)
}

pub fn frame_type_raw(header: u32) -> u8 {
    ((header >> TYPE_SHIFT) & TYPE_MASK) as u8
}

pub fn frame_length(header: u32) -> u16 {
    (header & LENGTH_MASK) as u16
}

pub fn frame_flags(header: u32) -> FrameFlags {
    extract_frame_info(header).flags
}

/// True for the headers the command pipe can resynchronize on.
pub fn is_good_header(header: u32) -> bool {
    matches!(
        FrameType::from_raw(frame_type_raw(header)),
        Some(FrameType::SuperFrame | FrameType::StackFrame | FrameType::StackError)
    )
}

pub fn is_known_frame_header(header: u32) -> bool {
    FrameType::from_raw(frame_type_raw(header)).is_some()
}

/// Human readable description of a header word.
pub fn decode_frame_header(header: u32) -> String {
    let info = extract_frame_info(header);

    let Some(frame_type) = info.frame_type() else {
        return format!("unknown frame header {header:#010x}");
    };

    let mut out = format!("{} (len={}", frame_type.name(), info.len);

    match frame_type {
        FrameType::StackFrame | FrameType::StackError | FrameType::StackContinuation => {
            out.push_str(&format!(", stackNum={}, ctrlId={}", info.stack, info.ctrl));
        }
        FrameType::SystemEvent => {
            let subtype = system_event::extract_subtype(header);
            out.push_str(&format!(
                ", subType={} ({}), ctrlId={}",
                subtype,
                system_event::subtype_name(subtype),
                info.ctrl
            ));
        }
        FrameType::BlockRead | FrameType::SuperFrame => {}
    }

    if frame_type == FrameType::SystemEvent {
        let flags = if info.flags.has_continue() {
            "Continue"
        } else {
            "none"
        };
        out.push_str(&format!(", frameFlags={flags})"));
    } else {
        out.push_str(&format!(", frameFlags={})", info.flags));
    }

    out
}

/// A complete frame including its continuation chain.
///
/// `payload` holds the raw little-endian words of every frame in the chain,
/// headers included, exactly as they arrived on the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn from_words(words: &[u32]) -> Self {
        Self::new(words_to_bytes(words))
    }

    pub fn header(&self) -> u32 {
        self.word(0).unwrap_or(0)
    }

    pub fn info(&self) -> FrameInfo {
        extract_frame_info(self.header())
    }

    pub fn len_words(&self) -> usize {
        self.payload.len() / WORD_SIZE
    }

    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(WORD_SIZE)?;
        let bytes = self.payload.get(start..start + WORD_SIZE)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn words(&self) -> Vec<u32> {
        bytes_to_words(&self.payload)
    }
}

/// Decode one complete frame chain from the front of `src`.
///
/// Returns `None` if more data is needed. Garbage in front of the frame is
/// not skipped here; see [`crate::FrameReader::skip_invalid`].
pub fn decode_frame(src: &mut BytesMut) -> Option<Frame> {
    let total = complete_frame_bytes(src)?;
    let payload = src.split_to(total).freeze();

    Some(Frame { payload })
}

/// Byte length of the complete frame chain at the front of `src`. Only the
/// chain's headers are read.
fn complete_frame_bytes(src: &[u8]) -> Option<usize> {
    let mut pos = 0usize;

    loop {
        let header = peek_word(src.get(pos..)?)?;
        let info = extract_frame_info(header);
        let end = pos + (1 + info.len as usize) * WORD_SIZE;

        if end > src.len() {
            return None;
        }

        pos = end;

        if !info.flags.has_continue() {
            return Some(pos);
        }
    }
}

/// Peek the first word of `src` without consuming it.
pub fn peek_word(src: &[u8]) -> Option<u32> {
    let bytes = src.get(..WORD_SIZE)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Drop `n` leading words from `src`.
pub fn skip_words(src: &mut BytesMut, n: usize) {
    let n = (n * WORD_SIZE).min(src.len());
    src.advance(n);
}

pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(WORD_SIZE)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * WORD_SIZE);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}
