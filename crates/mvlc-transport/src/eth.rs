//! ETH payload header layout.
//!
//! Every UDP packet sent by the controller starts with two 32-bit header
//! words followed by `data_word_count` payload words:
//!
//! ```text
//! header0: PacketChannel[29:28] | PacketNumber[27:16] | NumDataWords[12:0]
//! header1: Timestamp[31:12]     | NextHeaderPointer[11:0]
//! ```
//!
//! A next-header pointer of `0xFFF` means the packet payload contains no
//! frame header at all (it continues a frame started in an earlier packet).

/// Number of header words at the start of each packet.
pub const HEADER_WORDS: usize = 2;
/// Header size in bytes.
pub const HEADER_BYTES: usize = HEADER_WORDS * 4;

/// Largest packet the controller sends when jumbo frames are enabled.
pub const JUMBO_FRAME_MAX_SIZE: usize = 9000;

/// Command pipe UDP port. The data pipe uses the next port.
pub const COMMAND_PORT: u16 = 0x8000;
pub const DATA_PORT: u16 = COMMAND_PORT + 1;
pub const DELAY_PORT: u16 = COMMAND_PORT + 2;

pub const PACKET_CHANNEL_MASK: u32 = 0b11;
pub const PACKET_CHANNEL_SHIFT: u32 = 28;
pub const PACKET_NUMBER_MASK: u32 = 0xfff;
pub const PACKET_NUMBER_SHIFT: u32 = 16;
pub const DATA_WORD_COUNT_MASK: u32 = 0x1fff;

pub const TIMESTAMP_MASK: u32 = 0xfffff;
pub const TIMESTAMP_SHIFT: u32 = 12;
pub const HEADER_POINTER_MASK: u32 = 0xfff;
/// Sentinel value: no frame header inside this packet.
pub const NO_HEADER_POINTER_PRESENT: u16 = 0xfff;

/// Packet channel carried in header0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChannel {
    Command = 0,
    Stack = 1,
    Data = 2,
}

impl PacketChannel {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Command),
            1 => Some(Self::Stack),
            2 => Some(Self::Data),
            _ => None,
        }
    }
}

/// View over the two ETH payload header words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeaderInfo {
    pub header0: u32,
    pub header1: u32,
}

impl PayloadHeaderInfo {
    pub fn new(header0: u32, header1: u32) -> Self {
        Self { header0, header1 }
    }

    /// Build a header pair from its fields. Values are masked to their widths.
    pub fn encode(
        channel: u8,
        packet_number: u16,
        data_word_count: u16,
        timestamp: u32,
        next_header_pointer: u16,
    ) -> Self {
        let header0 = ((channel as u32 & PACKET_CHANNEL_MASK) << PACKET_CHANNEL_SHIFT)
            | ((packet_number as u32 & PACKET_NUMBER_MASK) << PACKET_NUMBER_SHIFT)
            | (data_word_count as u32 & DATA_WORD_COUNT_MASK);
        let header1 = ((timestamp & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
            | (next_header_pointer as u32 & HEADER_POINTER_MASK);
        Self { header0, header1 }
    }

    pub fn packet_channel(&self) -> u8 {
        ((self.header0 >> PACKET_CHANNEL_SHIFT) & PACKET_CHANNEL_MASK) as u8
    }

    pub fn packet_number(&self) -> u16 {
        ((self.header0 >> PACKET_NUMBER_SHIFT) & PACKET_NUMBER_MASK) as u16
    }

    pub fn data_word_count(&self) -> u16 {
        (self.header0 & DATA_WORD_COUNT_MASK) as u16
    }

    pub fn timestamp(&self) -> u32 {
        (self.header1 >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK
    }

    pub fn next_header_pointer(&self) -> u16 {
        (self.header1 & HEADER_POINTER_MASK) as u16
    }

    pub fn is_next_header_pointer_present(&self) -> bool {
        self.next_header_pointer() != NO_HEADER_POINTER_PRESENT
    }
}

/// Number of packets lost between `last` and `current` (12-bit counter).
pub fn calc_packet_loss(last: u16, current: u16) -> u32 {
    let diff = current as i32 - last as i32;

    if diff < 1 {
        (PACKET_NUMBER_MASK as i32 + diff) as u32
    } else {
        (diff - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let hdr = PayloadHeaderInfo::encode(2, 0x123, 42, 0xabcde, 7);
        assert_eq!(hdr.packet_channel(), 2);
        assert_eq!(PacketChannel::from_raw(hdr.packet_channel()), Some(PacketChannel::Data));
        assert_eq!(hdr.packet_number(), 0x123);
        assert_eq!(hdr.data_word_count(), 42);
        assert_eq!(hdr.timestamp(), 0xabcde);
        assert_eq!(hdr.next_header_pointer(), 7);
        assert!(hdr.is_next_header_pointer_present());
    }

    #[test]
    fn no_header_pointer_sentinel() {
        let hdr = PayloadHeaderInfo::encode(2, 1, 10, 0, NO_HEADER_POINTER_PRESENT);
        assert!(!hdr.is_next_header_pointer_present());
    }

    #[test]
    fn packet_loss_sequential() {
        assert_eq!(calc_packet_loss(0, 1), 0);
        assert_eq!(calc_packet_loss(10, 11), 0);
        assert_eq!(calc_packet_loss(10, 14), 3);
    }

    #[test]
    fn packet_loss_wraps_at_12_bits() {
        assert_eq!(calc_packet_loss(0xfff, 0), 0);
        assert_eq!(calc_packet_loss(0xffe, 1), 2);
    }
}
