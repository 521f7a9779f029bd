//! The command pipe reader loop.
//!
//! One thread owns the read side of the command pipe. It buffers whatever
//! arrives, resynchronizes on super, stack and stack error headers, and
//! routes every complete frame to the matching pending slot or to the stack
//! error counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mvlc_frame::codec::{is_good_header, WORD_SIZE};
use mvlc_frame::commands::{SuperCommandType, SUPER_CMD_ARG_MASK};
use mvlc_frame::{extract_frame_info, FrameError, FrameReader, FrameType, StackErrorCounters};
use mvlc_transport::{Pipe, Transport, TransportError};
use tracing::{debug, info, trace, warn};

use crate::counters::CmdPipeCounters;
use crate::error::CmdError;
use crate::pending::PendingSlot;

/// State shared between the reader thread and transaction callers.
pub(crate) struct ReaderContext<T> {
    pub(crate) transport: T,
    pub(crate) pending_super: PendingSlot,
    pub(crate) pending_stack: PendingSlot,
    pub(crate) counters: Mutex<CmdPipeCounters>,
    pub(crate) stack_errors: Mutex<StackErrorCounters>,
    pub(crate) quit: AtomicBool,
}

impl<T> ReaderContext<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self {
            transport,
            pending_super: PendingSlot::new(),
            pending_stack: PendingSlot::new(),
            counters: Mutex::new(CmdPipeCounters::default()),
            stack_errors: Mutex::new(StackErrorCounters::default()),
            quit: AtomicBool::new(false),
        }
    }

    pub(crate) fn counters(&self) -> MutexGuard<'_, CmdPipeCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stack_errors(&self) -> MutexGuard<'_, StackErrorCounters> {
        self.stack_errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_quit(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}

/// Run until the quit flag is set, the transport disconnects or a read
/// fails with anything but a timeout or a short packet. Both pending slots
/// are closed on exit.
pub(crate) fn run<T: Transport>(ctx: &ReaderContext<T>, initial_buffer_words: usize) {
    info!("command pipe reader starting");

    let mut reader = FrameReader::with_capacity(initial_buffer_words * WORD_SIZE);

    while !ctx.should_quit() {
        process_buffered(ctx, &mut reader);

        if ctx.should_quit() {
            break;
        }

        let result = reader.fill_from(&ctx.transport, Pipe::Command);
        let mut counters = ctx.counters();
        counters.reads += 1;

        match result {
            Ok(fill) => {
                counters.bytes_read += fill.bytes_transferred as u64;
                counters.lost_packets += fill.lost_packets as u64;

                if fill.lost_packets > 0 {
                    warn!(lost_packets = fill.lost_packets, "command pipe packet loss");
                }
                if fill.bytes_transferred > 0 {
                    trace!(bytes = fill.bytes_transferred, "command pipe read");
                }
            }
            Err(FrameError::Transport(err)) if err.is_timeout() => {
                counters.timeouts += 1;
            }
            Err(FrameError::Transport(err)) if err.is_disconnect() => {
                warn!(error = %err, "command pipe disconnected");
                ctx.quit.store(true, Ordering::Relaxed);
            }
            // A single malformed packet; the next one may be fine.
            Err(FrameError::Transport(err @ TransportError::ShortRead { .. })) => {
                counters.read_errors += 1;
                debug!(error = %err, "command pipe short read");
            }
            Err(err) => {
                counters.read_errors += 1;
                warn!(error = %err, "command pipe read failed, stopping reader");
                ctx.quit.store(true, Ordering::Relaxed);
            }
        }
    }

    ctx.pending_super.close();
    ctx.pending_stack.close();

    info!("command pipe reader exiting");
}

/// Handle every complete frame currently buffered.
fn process_buffered<T>(ctx: &ReaderContext<T>, reader: &mut FrameReader) {
    while !ctx.should_quit() {
        let mut skipped = 0u64;

        while let Some(word) = reader.peek_header() {
            if is_good_header(word) {
                break;
            }
            warn!(word = format_args!("{word:#010x}"), "skipping non-good header word");
            reader.skip(1);
            skipped += 1;
        }

        if skipped > 0 {
            let mut counters = ctx.counters();
            counters.invalid_headers += skipped;
            counters.words_skipped += skipped;
            warn!(
                skipped,
                words_left = reader.buffered_words(),
                "skipped non-good header words"
            );
        }

        let Some(frame) = reader.take_frame() else {
            break;
        };

        handle_frame(ctx, &frame.words());
    }
}

/// Route one complete frame chain.
pub(crate) fn handle_frame<T>(ctx: &ReaderContext<T>, words: &[u32]) {
    let Some(&header) = words.first() else {
        return;
    };

    let info = extract_frame_info(header);
    let len = info.len as usize;

    match info.frame_type() {
        Some(FrameType::StackError) => {
            ctx.counters().error_buffers += 1;
            let end = (len + 1).min(words.len());
            ctx.stack_errors().update(&words[..end]);
            debug!(
                stack = info.stack,
                line = words.get(1).copied().unwrap_or(0) & 0xffff,
                flags = %info.flags,
                "stack error notification"
            );
        }

        Some(FrameType::SuperFrame) => {
            ctx.counters().super_buffers += 1;
            handle_super_frame(ctx, words, len);
        }

        Some(FrameType::StackFrame) => {
            ctx.counters().stack_buffers += 1;
            handle_stack_frame(ctx, words, len);
        }

        _ => {
            warn!(
                header = format_args!("{header:#010x}"),
                "unexpected frame type on command pipe"
            );
            ctx.counters().words_skipped += words.len() as u64;
        }
    }
}

fn handle_super_frame<T>(ctx: &ReaderContext<T>, words: &[u32], len: usize) {
    let ref_cmd = match words.get(1) {
        Some(&word) if len > 0 => word,
        _ => {
            ctx.counters().short_super_buffers += 1;
            warn!("short super frame");
            ctx.pending_super.fulfill(Err(CmdError::ShortSuperFrame));
            return;
        }
    };

    if SuperCommandType::from_word(ref_cmd) != Some(SuperCommandType::ReferenceWord) {
        ctx.counters().super_format_errors += 1;
        warn!(
            word = format_args!("{ref_cmd:#010x}"),
            "super frame does not start with a reference word"
        );
        ctx.pending_super.fulfill(Err(CmdError::SuperFormatError));
        return;
    }

    let got = (ref_cmd & SUPER_CMD_ARG_MASK) as u16;

    match ctx.pending_super.pending_reference() {
        Some(expected) if expected == got as u32 => {
            trace!(reference = got, words = words.len(), "super response");
            ctx.pending_super.fulfill(Ok(words.to_vec()));
        }
        Some(expected) => {
            ctx.counters().super_ref_mismatches += 1;
            warn!(
                wanted = format_args!("{expected:#06x}"),
                got = format_args!("{got:#06x}"),
                "super reference mismatch"
            );
            ctx.pending_super.fulfill(Err(CmdError::SuperReferenceMismatch {
                expected: expected as u16,
                got,
            }));
        }
        None => {
            ctx.counters().super_ref_mismatches += 1;
            warn!(got = format_args!("{got:#06x}"), "super response without pending transaction");
        }
    }
}

fn handle_stack_frame<T>(ctx: &ReaderContext<T>, words: &[u32], len: usize) {
    let got = match words.get(1) {
        Some(&word) if len > 0 => word,
        _ => {
            warn!("stack response without reference word");
            ctx.pending_stack.fulfill(Err(CmdError::MirrorShortResponse));
            return;
        }
    };

    match ctx.pending_stack.pending_reference() {
        Some(expected) if expected == got => {
            trace!(reference = got, words = words.len(), "stack response");
            ctx.pending_stack.fulfill(Ok(words.to_vec()));
        }
        Some(expected) => {
            ctx.counters().stack_ref_mismatches += 1;
            warn!(
                wanted = format_args!("{expected:#010x}"),
                got = format_args!("{got:#010x}"),
                "stack reference mismatch"
            );
            ctx.pending_stack
                .fulfill(Err(CmdError::StackReferenceMismatch { expected, got }));
        }
        None => {
            ctx.counters().stack_ref_mismatches += 1;
            warn!(got = format_args!("{got:#010x}"), "stack response without pending transaction");
        }
    }
}
