//! Node-wide shared state: the process table with its per-process locks,
//! the atom table, the reference counter, and the name registry.
//!
//! A process is reachable by pid through a `ProcessSlot`. The slot owns
//! the per-process lock and the producer half of the mailbox, and it
//! outlives the `Context` it guards: lookup and locking work with only a
//! pid in hand, even while the process is being torn down.

use crate::atom_table::AtomTable;
use crate::context::{self, Context};
use crate::heap::HeapFragment;
use crate::mailbox::{MailboxSender, Signal};
use crate::term::Term;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Local process id, unique within a node. Pid 0 is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

#[derive(Debug)]
pub struct ProcessSlot {
    pid: Pid,
    flags: Arc<AtomicU32>,
    mailbox: MailboxSender,
    context: Mutex<Option<Context>>,
}

impl ProcessSlot {
    /// `flags` is the same atomic the context updates from its own side.
    pub(crate) fn new(
        pid: Pid,
        flags: Arc<AtomicU32>,
        mailbox: MailboxSender,
        context: Context,
    ) -> Self {
        Self {
            pid,
            flags,
            mailbox,
            context: Mutex::new(Some(context)),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn mailbox(&self) -> &MailboxSender {
        &self.mailbox
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    /// Atomically applies `flags := (flags & mask) | value`.
    pub fn update_flags(&self, mask: u32, value: u32) {
        context::update_flag_word(&self.flags, mask, value);
    }

    /// Runs `f` under this process's lock. Returns `None` when the context
    /// has already been taken out for destruction.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Context) -> R) -> Option<R> {
        let mut guard = self.context.lock().unwrap();
        guard.as_mut().map(f)
    }

    pub(crate) fn take_context(&self) -> Option<Context> {
        self.context.lock().unwrap().take()
    }
}

#[derive(Debug)]
pub struct GlobalContext {
    processes: RwLock<HashMap<Pid, Arc<ProcessSlot>>>,
    registered: Mutex<HashMap<u32, Pid>>,
    atom_table: AtomTable,
    ref_ticks: AtomicU64,
    next_pid: AtomicU32,
}

impl GlobalContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            atom_table: AtomTable::new(),
            ref_ticks: AtomicU64::new(0),
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn atom_table(&self) -> &AtomTable {
        &self.atom_table
    }

    /// Mints a fresh monotonic reference value.
    pub fn next_ref_ticks(&self) -> u64 {
        self.ref_ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn init_process(&self, slot: Arc<ProcessSlot>) {
        let mut processes = self.processes.write().unwrap();
        processes.insert(slot.pid(), slot);
    }

    pub fn get_process_slot(&self, pid: Pid) -> Option<Arc<ProcessSlot>> {
        let processes = self.processes.read().unwrap();
        processes.get(&pid).cloned()
    }

    /// Locks the process identified by `pid` and runs `f` against it.
    /// Returns `None` when the process is gone; callers are expected to
    /// drop the operation silently in that case.
    pub fn with_locked_process<R>(&self, pid: Pid, f: impl FnOnce(&mut Context) -> R) -> Option<R> {
        let slot = self.get_process_slot(pid)?;
        slot.with_context(f)
    }

    pub(crate) fn remove_process(&self, pid: Pid) -> Option<Arc<ProcessSlot>> {
        let mut processes = self.processes.write().unwrap();
        processes.remove(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.read().unwrap().len()
    }

    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.read().unwrap().keys().copied().collect();
        pids.sort();
        pids
    }

    // Name registry

    pub fn register_name(&self, name: u32, pid: Pid) -> bool {
        let mut registered = self.registered.lock().unwrap();
        if registered.contains_key(&name) {
            return false;
        }
        registered.insert(name, pid);
        true
    }

    pub fn unregister_name(&self, name: u32) -> Option<Pid> {
        self.registered.lock().unwrap().remove(&name)
    }

    pub fn whereis(&self, name: u32) -> Option<Pid> {
        self.registered.lock().unwrap().get(&name).copied()
    }

    /// Drops any registered names still pointing at a dying process.
    pub(crate) fn maybe_unregister_process_id(&self, pid: Pid) {
        let mut registered = self.registered.lock().unwrap();
        registered.retain(|_, registered_pid| *registered_pid != pid);
    }

    /// Finds and removes the monitor identified by `ref_ticks`, searching
    /// every process except `exclude` (the caller, whose lock is already
    /// held and whose own records it can strip directly). Returns the
    /// watched pid when a record was removed.
    pub fn demonitor_by_ref(&self, ref_ticks: u64, exclude: Pid) -> Option<Pid> {
        let slots: Vec<Arc<ProcessSlot>> = {
            let processes = self.processes.read().unwrap();
            processes.values().cloned().collect()
        };
        for slot in slots {
            if slot.pid() == exclude {
                continue;
            }
            let removed = slot
                .with_context(|context| context.demonitor_by_ref(ref_ticks).is_some())
                .unwrap_or(false);
            if removed {
                return Some(slot.pid());
            }
        }
        None
    }

    // Message and signal routing

    /// Deep-copies `message` out of `src` into a fresh fragment and
    /// appends it to the target's mailbox. Returns false when the target
    /// is gone.
    pub fn send(&self, pid: Pid, src: &[u64], message: Term) -> bool {
        let Some(slot) = self.get_process_slot(pid) else {
            return false;
        };
        slot.mailbox().post_message(HeapFragment::copy_of(src, message));
        slot.update_flags(!0, context::MESSAGE_READY);
        true
    }

    /// Appends an out-of-band signal to the target's queue and raises the
    /// flags that go with its kind: `KILLED` for a kill signal, `TRAP`
    /// for the signals that resolve a trap (answer, exception, monitor
    /// flush), and `MESSAGE_READY` in every case so the target wakes.
    pub fn send_signal(&self, pid: Pid, signal: Signal) -> bool {
        let Some(slot) = self.get_process_slot(pid) else {
            return false;
        };
        let raised = match signal {
            Signal::Kill { .. } => context::MESSAGE_READY | context::KILLED,
            Signal::TrapAnswer { .. }
            | Signal::TrapException { .. }
            | Signal::FlushMonitor { .. } => context::MESSAGE_READY | context::TRAP,
            _ => context::MESSAGE_READY,
        };
        slot.mailbox().post_signal(signal);
        slot.update_flags(!0, raised);
        true
    }
}
