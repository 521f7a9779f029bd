use mvlc_transport::{Pipe, Transport};
use tracing::trace;

use crate::codec::words_to_bytes;
use crate::error::{FrameError, Result};

/// Write a command buffer to `pipe` as little-endian words.
pub fn write_words<T: Transport + ?Sized>(transport: &T, pipe: Pipe, words: &[u32]) -> Result<()> {
    let bytes = words_to_bytes(words);
    trace!(pipe = pipe.name(), words = words.len(), "writing command buffer");

    let written = transport.write(pipe, &bytes)?;
    if written != bytes.len() {
        return Err(FrameError::ShortWrite {
            written,
            expected: bytes.len(),
        });
    }
    Ok(())
}
