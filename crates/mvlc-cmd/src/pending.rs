//! Single-slot rendezvous between a submitting thread and the reader loop.
//!
//! Each transaction kind has one slot. The submitter installs its reference,
//! writes the command and blocks on the slot. The reader loop is the only
//! producer of responses. A slot moves through
//! `Free -> Pending -> Fulfilled -> Free`; closing the slot makes every
//! current and future wait fail with [`CmdError::IsDisconnected`].

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{CmdError, Result};

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Free,
    Pending {
        reference: u32,
    },
    Fulfilled(Result<Vec<u32>>),
}

#[derive(Debug, Default)]
struct Slot {
    state: SlotState,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct PendingSlot {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the slot to become free, then mark it pending for `reference`.
    pub fn install(&self, reference: u32) -> Result<()> {
        let mut slot = self.lock();

        while !slot.closed && !matches!(slot.state, SlotState::Free) {
            slot = self
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if slot.closed {
            return Err(CmdError::IsDisconnected);
        }

        slot.state = SlotState::Pending { reference };
        Ok(())
    }

    /// Reference of the outstanding transaction, if any.
    pub fn pending_reference(&self) -> Option<u32> {
        match self.lock().state {
            SlotState::Pending { reference } => Some(reference),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_reference().is_some()
    }

    /// Complete the outstanding transaction. Returns false if nothing was pending.
    pub fn fulfill(&self, result: Result<Vec<u32>>) -> bool {
        let mut slot = self.lock();

        if !matches!(slot.state, SlotState::Pending { .. }) {
            return false;
        }

        slot.state = SlotState::Fulfilled(result);
        self.changed.notify_all();
        true
    }

    /// Block until the transaction completes or `timeout` elapses. The slot
    /// is free again when this returns.
    pub fn wait(&self, timeout: Duration, on_timeout: impl FnOnce() -> CmdError) -> Result<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();

        loop {
            if matches!(slot.state, SlotState::Fulfilled(_)) {
                let state = std::mem::take(&mut slot.state);
                self.changed.notify_all();
                return match state {
                    SlotState::Fulfilled(result) => result,
                    _ => Err(CmdError::IsDisconnected),
                };
            }

            if !matches!(slot.state, SlotState::Pending { .. }) {
                return Err(CmdError::IsDisconnected);
            }

            let now = Instant::now();
            if now >= deadline {
                slot.state = SlotState::Free;
                self.changed.notify_all();
                return Err(on_timeout());
            }

            slot = self
                .changed
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Abandon the outstanding transaction without waiting, e.g. after a
    /// failed write.
    pub fn cancel(&self) {
        let mut slot = self.lock();
        slot.state = SlotState::Free;
        self.changed.notify_all();
    }

    /// Fail the outstanding transaction and refuse new ones.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;

        if matches!(slot.state, SlotState::Pending { .. }) {
            slot.state = SlotState::Fulfilled(Err(CmdError::IsDisconnected));
        }
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
