use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use mvlc_transport::{ConnectionType, Pipe, Transport};
use tracing::trace;

use crate::codec::{decode_frame, is_good_header, peek_word, skip_words, Frame, WORD_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;
/// Large enough for a jumbo ETH packet.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Outcome of a single [`FrameReader::fill_from`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillResult {
    /// Bytes appended to the buffer (ETH headers excluded).
    pub bytes: usize,
    /// Raw bytes received from the transport.
    pub bytes_transferred: usize,
    /// ETH packets lost before this read.
    pub lost_packets: u32,
}

/// Accumulates raw pipe data and hands out complete frames.
///
/// Data arrives in arbitrary pieces; callers always get complete frame
/// chains (a frame plus every continuation it announces).
pub struct FrameReader {
    buf: BytesMut,
    chunk: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUFFER_CAPACITY)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(bytes),
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn extend_words(&mut self, words: &[u32]) {
        self.buf.reserve(words.len() * WORD_SIZE);
        for w in words {
            self.buf.extend_from_slice(&w.to_le_bytes());
        }
    }

    /// Number of complete words currently buffered.
    pub fn buffered_words(&self) -> usize {
        self.buf.len() / WORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.buffered_words() == 0
    }

    pub fn peek_header(&self) -> Option<u32> {
        peek_word(&self.buf)
    }

    /// Drop words until the buffer starts with a good header or runs dry.
    /// Returns the number of words skipped.
    pub fn skip_invalid(&mut self) -> usize {
        let mut skipped = 0;
        while let Some(word) = self.peek_header() {
            if is_good_header(word) {
                break;
            }
            skip_words(&mut self.buf, 1);
            skipped += 1;
        }
        skipped
    }

    /// Drop `n` words from the front of the buffer.
    pub fn skip(&mut self, n: usize) {
        skip_words(&mut self.buf, n);
    }

    /// Take the next complete frame chain, if fully buffered.
    pub fn take_frame(&mut self) -> Option<Frame> {
        let frame = decode_frame(&mut self.buf)?;
        trace!(header = format_args!("{:#010x}", frame.header()), words = frame.len_words(), "frame complete");
        Some(frame)
    }

    /// Perform one read on `pipe` and buffer the result.
    ///
    /// Stream connections append the raw bytes. ETH connections read one
    /// packet and append its payload, dropping the two header words.
    pub fn fill_from<T: Transport + ?Sized>(&mut self, transport: &T, pipe: Pipe) -> Result<FillResult> {
        match transport.connection_type() {
            ConnectionType::Usb => {
                let n = transport.read(pipe, &mut self.chunk)?;
                self.buf.extend_from_slice(&self.chunk[..n]);
                Ok(FillResult {
                    bytes: n,
                    bytes_transferred: n,
                    lost_packets: 0,
                })
            }
            ConnectionType::Eth => {
                let res = transport.read_packet(pipe, &mut self.chunk)?;
                let payload = res.payload(&self.chunk);
                let bytes = payload.len();
                self.buf.extend_from_slice(payload);
                Ok(FillResult {
                    bytes,
                    bytes_transferred: res.bytes_transferred,
                    lost_packets: res.lost_packets,
                })
            }
        }
    }

    /// Read once from `src`. Returns 0 at end of input.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<usize> {
        loop {
            match src.read(&mut self.chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&self.chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered_bytes", &self.buf.len())
            .finish()
    }
}
