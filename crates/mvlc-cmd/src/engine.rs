//! Command pipe transactions.
//!
//! [`CmdPipe`] serializes super and stack transactions on the command pipe
//! and builds the register and VME helpers on top of them.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use mvlc_frame::codec::frame_flags;
use mvlc_frame::commands::{check_mirror_size, registers};
use mvlc_frame::stack::make_stack_upload_commands;
use mvlc_frame::vme::{amods, is_block_mode};
use mvlc_frame::{
    encode_stack, make_command_buffer, write_words, Blk2eSstRate, FrameFlags, StackCommand,
    StackCommandBuilder, StackErrorCounters, SuperCommand, SuperCommandBuilder, VmeDataWidth,
};
use mvlc_transport::{Pipe, Transport};
use tracing::{debug, trace, warn};

use crate::config::CmdPipeConfig;
use crate::counters::CmdPipeCounters;
use crate::error::{CmdError, Result};
use crate::reader::{self, ReaderContext};

/// Synchronous request/response engine on the command pipe.
///
/// A dedicated reader thread consumes every response; callers block until
/// their response arrives or the configured timeout expires. At most one
/// super and one stack transaction are outstanding at any time.
pub struct CmdPipe<T: Transport + 'static> {
    ctx: Arc<ReaderContext<T>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cmd_lock: Mutex<()>,
    next_super_ref: AtomicU16,
    next_stack_ref: AtomicU32,
    config: CmdPipeConfig,
}

impl<T: Transport + 'static> CmdPipe<T> {
    /// Take ownership of `transport` and start the reader thread.
    pub fn new(transport: T, config: CmdPipeConfig) -> Result<Self> {
        let ctx = Arc::new(ReaderContext::new(transport));

        let reader = {
            let ctx = Arc::clone(&ctx);
            let initial_buffer_words = config.initial_buffer_words;
            thread::Builder::new()
                .name("cmd_pipe_reader".into())
                .spawn(move || reader::run(&ctx, initial_buffer_words))
                .map_err(CmdError::Spawn)?
        };

        debug!(
            super_timeout_ms = config.super_timeout.as_millis() as u64,
            stack_timeout_ms = config.stack_timeout.as_millis() as u64,
            "command pipe started"
        );

        Ok(Self {
            ctx,
            reader: Mutex::new(Some(reader)),
            cmd_lock: Mutex::new(()),
            next_super_ref: AtomicU16::new(1),
            next_stack_ref: AtomicU32::new(1),
            config,
        })
    }

    /// The underlying connection, e.g. for reading the data pipe.
    pub fn transport(&self) -> &T {
        &self.ctx.transport
    }

    pub fn config(&self) -> &CmdPipeConfig {
        &self.config
    }

    pub fn next_super_reference(&self) -> u16 {
        self.next_super_ref.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_stack_reference(&self) -> u32 {
        self.next_stack_ref.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        !self.ctx.pending_super.is_closed()
    }

    /// Send a super command list and return the mirrored response frame.
    ///
    /// The list must start with a reference word.
    pub fn super_transaction(&self, commands: &SuperCommandBuilder) -> Result<Vec<u32>> {
        let _guard = self.cmd_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.super_transaction_locked(commands.commands())
    }

    /// Upload `stack` as the immediate stack, run it and return the stack
    /// response frame chain.
    ///
    /// The stack must start with a marker carrying the stack reference.
    pub fn stack_transaction(&self, stack: &StackCommandBuilder) -> Result<Vec<u32>> {
        let _guard = self.cmd_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.stack_transaction_locked(stack)
    }

    /// Write `commands` to stack memory at `memory_offset` bytes, with
    /// StackStart selecting `output_pipe`.
    pub fn upload_stack(
        &self,
        output_pipe: u8,
        memory_offset: u16,
        commands: &[StackCommand],
    ) -> Result<()> {
        let words = encode_stack(commands)?;
        let _guard = self.cmd_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.upload_stack_locked(output_pipe, memory_offset, &words)
    }

    fn super_transaction_locked(&self, commands: &[SuperCommand]) -> Result<Vec<u32>> {
        let Some(&SuperCommand::ReferenceWord(reference)) = commands.first() else {
            return Err(CmdError::SuperFormatError);
        };

        let buffer = make_command_buffer(commands);
        check_mirror_size(&buffer)?;

        trace!(reference, words = buffer.len(), "super transaction");

        let ctx = &self.ctx;
        ctx.pending_super.install(reference as u32)?;

        if let Err(err) = write_words(&ctx.transport, Pipe::Command, &buffer) {
            ctx.pending_super.cancel();
            return Err(err.into());
        }

        ctx.pending_super
            .wait(self.config.super_timeout, || {
                warn!(reference, "super response not ready");
                CmdError::SuperCommandTimeout
            })
    }

    fn upload_stack_locked(&self, output_pipe: u8, memory_offset: u16, words: &[u32]) -> Result<()> {
        let parts = make_stack_upload_commands(output_pipe, memory_offset, words)?;

        trace!(
            output_pipe,
            memory_offset,
            words = words.len(),
            parts = parts.len(),
            "uploading stack"
        );

        for part in parts {
            let mut commands = Vec::with_capacity(part.len() + 1);
            commands.push(SuperCommand::ReferenceWord(self.next_super_reference()));
            commands.extend(part);
            self.super_transaction_locked(&commands)?;
        }

        Ok(())
    }

    fn stack_transaction_locked(&self, stack: &StackCommandBuilder) -> Result<Vec<u32>> {
        let Some(&StackCommand::WriteMarker { value: stack_ref }) = stack.commands().next() else {
            return Err(CmdError::StackFormatError);
        };

        let words = encode_stack(stack.commands())?;
        self.upload_stack_locked(
            Pipe::Command as u8,
            registers::IMMEDIATE_STACK_START_OFFSET_BYTES,
            &words,
        )?;

        let super_ref = self.next_super_reference();
        let mut exec = SuperCommandBuilder::new();
        exec.add_reference_word(super_ref)
            .add_write_local(
                registers::STACK0_OFFSET,
                registers::IMMEDIATE_STACK_START_OFFSET_BYTES as u32,
            )
            .add_write_local(registers::STACK0_TRIGGER, 1 << registers::IMMEDIATE_SHIFT);

        let ctx = &self.ctx;
        ctx.pending_stack.install(stack_ref)?;

        if let Err(err) = self.super_transaction_locked(exec.commands()) {
            ctx.pending_stack.cancel();
            return Err(err);
        }

        ctx.pending_stack.wait(self.config.stack_timeout, || {
            warn!(reference = stack_ref, "stack response not ready");
            CmdError::StackCommandTimeout
        })
    }

    pub fn read_register(&self, address: u16) -> Result<u32> {
        let mut commands = SuperCommandBuilder::new();
        commands
            .add_reference_word(self.next_super_reference())
            .add_read_local(address);

        let response = self.super_transaction(&commands)?;
        expect_size(&response, 4)?;
        Ok(response[3])
    }

    pub fn write_register(&self, address: u16, value: u32) -> Result<()> {
        let mut commands = SuperCommandBuilder::new();
        commands
            .add_reference_word(self.next_super_reference())
            .add_write_local(address, value);

        let response = self.super_transaction(&commands)?;
        expect_size(&response, 4)
    }

    /// Single-cycle VME read. D16 results are masked to 16 bits.
    pub fn vme_read(&self, address: u32, amod: u8, data_width: VmeDataWidth) -> Result<u32> {
        let mut stack = StackCommandBuilder::new("vme_read");
        stack
            .add_write_marker(self.next_stack_reference())
            .add_vme_read(address, amod, data_width, false);

        let response = self.stack_transaction(&stack)?;
        expect_size(&response, 3)?;
        check_vme_flags(response[0])?;

        let mask = match data_width {
            VmeDataWidth::D16 => 0x0000_ffff,
            VmeDataWidth::D32 => 0xffff_ffff,
        };
        Ok(response[2] & mask)
    }

    pub fn vme_write(&self, address: u32, value: u32, amod: u8, data_width: VmeDataWidth) -> Result<()> {
        let mut stack = StackCommandBuilder::new("vme_write");
        stack
            .add_write_marker(self.next_stack_reference())
            .add_vme_write(address, value, amod, data_width);

        let response = self.stack_transaction(&stack)?;
        expect_size(&response, 2)?;
        check_vme_flags(response[0])
    }

    /// BLT or MBLT read. Returns the raw stack response chain, frame headers
    /// included.
    pub fn vme_block_read(&self, address: u32, amod: u8, max_transfers: u16) -> Result<Vec<u32>> {
        if !is_block_mode(amod) {
            return Err(CmdError::NonBlockAddressMode { amod });
        }

        let mut stack = StackCommandBuilder::new("vme_block_read");
        stack
            .add_write_marker(self.next_stack_reference())
            .add_vme_block_read(address, amod, max_transfers);

        self.block_read_response(&stack)
    }

    pub fn vme_block_read_2esst(
        &self,
        address: u32,
        rate: Blk2eSstRate,
        max_transfers: u16,
    ) -> Result<Vec<u32>> {
        let mut stack = StackCommandBuilder::new("vme_block_read_2esst");
        stack
            .add_write_marker(self.next_stack_reference())
            .add_vme_block_read_2esst(address, rate, max_transfers);

        self.block_read_response(&stack)
    }

    /// MBLT read with the 32-bit halves of each 64-bit word swapped. Pass a
    /// rate to use 2eSST instead.
    pub fn vme_block_read_swapped(
        &self,
        address: u32,
        rate: Option<Blk2eSstRate>,
        max_transfers: u16,
    ) -> Result<Vec<u32>> {
        let (amod, rate) = match rate {
            Some(rate) => (amods::BLK2ESST64, rate),
            None => (amods::MBLT64, Blk2eSstRate::default()),
        };

        let mut stack = StackCommandBuilder::new("vme_block_read_swapped");
        stack
            .add_write_marker(self.next_stack_reference())
            .add_command(StackCommand::VmeMbltSwapped {
                address,
                amod,
                rate,
                max_transfers,
            });

        self.block_read_response(&stack)
    }

    fn block_read_response(&self, stack: &StackCommandBuilder) -> Result<Vec<u32>> {
        let response = self.stack_transaction(stack)?;
        if let Some(&header) = response.first() {
            check_vme_flags(header)?;
        }
        Ok(response)
    }

    pub fn counters(&self) -> CmdPipeCounters {
        self.ctx.counters().clone()
    }

    pub fn stack_error_counters(&self) -> StackErrorCounters {
        self.ctx.stack_errors().clone()
    }

    pub fn reset_stack_error_counters(&self) {
        self.ctx.stack_errors().clear();
    }

    /// Stop the reader thread. Outstanding and later transactions fail
    /// with [`CmdError::IsDisconnected`].
    ///
    /// Callable from any thread, including while another thread is blocked
    /// in a transaction on this pipe.
    pub fn shutdown(&self) {
        self.ctx.quit.store(true, Ordering::Relaxed);
        self.ctx.pending_super.close();
        self.ctx.pending_stack.close();

        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("command pipe reader panicked");
            }
            debug!("command pipe stopped");
        }
    }
}

impl<T: Transport + 'static> Drop for CmdPipe<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport + 'static> std::fmt::Debug for CmdPipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdPipe")
            .field("connection_type", &self.ctx.transport.connection_type())
            .field("connected", &self.is_connected())
            .field("config", &self.config)
            .finish()
    }
}

fn expect_size(response: &[u32], expected: usize) -> Result<()> {
    if response.len() != expected {
        return Err(CmdError::UnexpectedResponseSize {
            expected,
            got: response.len(),
        });
    }
    Ok(())
}

fn check_vme_flags(header: u32) -> Result<()> {
    let flags = frame_flags(header);

    if flags.contains(FrameFlags::TIMEOUT) {
        return Err(CmdError::NoVmeResponse);
    }
    if flags.contains(FrameFlags::BUS_ERROR) {
        return Err(CmdError::VmeBusError);
    }
    Ok(())
}
