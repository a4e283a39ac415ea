//! Process mailbox: ordered messages, out-of-band signals, and the
//! selective-receive cursor.
//!
//! The mailbox is split in two, following the producer/consumer contract:
//! senders append to a shared outer queue under the mailbox lock, and the
//! owning process drains the outer queue into its private inner queue at
//! reduction boundaries. Only the owner ever touches the inner queue or
//! the cursor, so ordinary receive operations take no lock at all.

use crate::error::Error;
use crate::globalcontext::Pid;
use crate::heap::{Heap, HeapFragment};
use crate::term::Term;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An out-of-band mailbox entry, drained ahead of ordinary messages.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Terminate the receiver with the given reason.
    Kill { reason: HeapFragment },
    /// Ask the receiver to report one process-info key back to `sender`.
    ProcessInfoRequest { sender: Pid, key: Term },
    /// Resume a trapped process with a result in `x[0]`.
    TrapAnswer { value: HeapFragment },
    /// Resume a trapped process with a failure atom.
    TrapException { reason: Term },
    /// Strip pending `DOWN` messages carrying this reference.
    FlushMonitor { ref_ticks: u64, info: bool },
    Link { sender: Pid },
    Unlink { sender: Pid },
    GarbageCollect,
}

#[derive(Debug, Default)]
struct Outer {
    messages: VecDeque<HeapFragment>,
    signals: VecDeque<Signal>,
}

/// Producer half of a mailbox; cheap to clone and safe to use from any
/// thread that holds the target's process slot.
#[derive(Debug, Clone)]
pub struct MailboxSender {
    outer: Arc<Mutex<Outer>>,
}

impl MailboxSender {
    pub fn post_message(&self, message: HeapFragment) {
        self.outer.lock().unwrap().messages.push_back(message);
    }

    pub fn post_signal(&self, signal: Signal) {
        self.outer.lock().unwrap().signals.push_back(signal);
    }
}

#[derive(Debug)]
pub struct Mailbox {
    outer: Arc<Mutex<Outer>>,
    inner: VecDeque<HeapFragment>,
    cursor: usize,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            outer: Arc::new(Mutex::new(Outer::default())),
            inner: VecDeque::new(),
            cursor: 0,
        }
    }

    pub fn sender(&self) -> MailboxSender {
        MailboxSender {
            outer: Arc::clone(&self.outer),
        }
    }

    /// Moves everything producers have appended into the consumer-private
    /// queue. Called by the owner at reduction boundaries.
    pub fn process_outer(&mut self) {
        let mut outer = self.outer.lock().unwrap();
        self.inner.extend(outer.messages.drain(..));
    }

    /// Takes all pending signals, in arrival order.
    pub fn take_signals(&mut self) -> Vec<Signal> {
        let mut outer = self.outer.lock().unwrap();
        outer.signals.drain(..).collect()
    }

    pub fn has_signals(&self) -> bool {
        !self.outer.lock().unwrap().signals.is_empty()
    }

    /// Message at the cursor, without removing it.
    pub fn peek(&self) -> Option<&HeapFragment> {
        self.inner.get(self.cursor)
    }

    /// Advances the cursor past the current message (selective-receive
    /// skip); the message stays queued.
    pub fn next(&mut self) {
        if self.cursor < self.inner.len() {
            self.cursor += 1;
        }
    }

    /// Removes and discards the message at the cursor without copying it
    /// anywhere; the cursor is left pointing at the following message.
    /// Used by the flush-monitor signal to strip stale `DOWN` messages.
    pub fn drop_message(&mut self) -> Option<HeapFragment> {
        self.inner.remove(self.cursor)
    }

    /// Removes the message at the cursor, copying it onto `heap`, and
    /// resets the cursor for the next receive. The caller must have
    /// reserved the envelope's cell count on `heap` first.
    pub fn remove_message(&mut self, heap: &mut Heap) -> Result<Option<Term>, Error> {
        let Some(fragment) = self.inner.remove(self.cursor) else {
            return Ok(None);
        };
        self.cursor = 0;
        let term = heap.import(fragment.cells(), fragment.term())?;
        Ok(Some(term))
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Number of queued messages, delivered or not.
    pub fn len(&self) -> usize {
        self.inner.len() + self.outer.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cells retained by queued envelopes.
    pub fn size(&self) -> usize {
        let outer = self.outer.lock().unwrap();
        self.inner.iter().map(HeapFragment::len).sum::<usize>()
            + outer.messages.iter().map(HeapFragment::len).sum::<usize>()
    }
}
