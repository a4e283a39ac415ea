//! Per-process execution context.
//!
//! A `Context` binds a heap, the register file, the mailbox, and the
//! monitor list under one process identity. It is mutated only by the
//! scheduler thread currently running it; other threads reach it through
//! the mailbox producer half and the atomic flag word shared with the
//! process slot.

use crate::atom_table::{
    BADARG_ATOM, DOWN_ATOM, EXIT_SIGNAL_ATOM, FALSE_ATOM, KILLED_ATOM, NORMAL_ATOM,
    OUT_OF_MEMORY_ATOM, PORT_ATOM, PROCESS_ATOM, TRUE_ATOM,
};
use crate::error::Error;
use crate::globalcontext::{GlobalContext, Pid, ProcessSlot};
use crate::heap::{Heap, HeapFragment, DEFAULT_HEAP_SIZE};
use crate::mailbox::{Mailbox, Signal};
use crate::scheduler::Scheduler;
use crate::term::{self, Term};
use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const NO_FLAGS: u32 = 0;
/// The mailbox outer queue has entries to drain.
pub const MESSAGE_READY: u32 = 1 << 0;
/// Suspended in a receive with a pending timer.
pub const WAITING_TIMEOUT: u32 = 1 << 1;
/// The pending timer fired before a matching message arrived.
pub const TIMED_OUT: u32 = 1 << 2;
/// Scheduler-internal: queued on a run queue.
pub const READY: u32 = 1 << 3;
/// Scheduler-internal: currently executing.
pub const RUNNING: u32 = 1 << 4;
/// A kill signal was processed; terminate at the next reduction boundary.
pub const KILLED: u32 = 1 << 5;
/// Suspended in a builtin awaiting a trap answer.
pub const TRAP: u32 = 1 << 6;

pub const MAX_REG: usize = 16;

/// Hook invoked by the scheduler instead of bytecode for port-like
/// processes.
pub type NativeHandler = fn(&mut Context) -> Result<(), Error>;

pub(crate) fn update_flag_word(flags: &AtomicU32, mask: u32, value: u32) {
    let mut expected = flags.load(Ordering::SeqCst);
    loop {
        let desired = (expected & mask) | value;
        match flags.compare_exchange_weak(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(actual) => expected = actual,
        }
    }
}

/// One outgoing death-watch record. `linked` distinguishes a bidirectional
/// link (both endpoints hold a record) from a unidirectional monitor;
/// links carry no meaningful reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Monitor {
    pub pid: Pid,
    pub ref_ticks: u64,
    pub linked: bool,
}

/// Outcome of draining the signal queue at a reduction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResult {
    Continue,
    /// The process must terminate with its `exit_reason`.
    Killed,
    /// A trapped builtin failed; the interpreter raises this reason.
    Exception(Term),
}

pub struct Context {
    pid: Pid,
    pub heap: Heap,
    /// Register file; slots past the live count hold the invalid sentinel.
    pub x: [Term; MAX_REG],
    pub cp: usize,
    /// Floating-point register bank, allocated on first use.
    pub fr: Option<Box<[f64]>>,
    /// Trap resumption state saved by builtins that suspend.
    pub saved_module: Option<usize>,
    pub saved_ip: Option<usize>,
    dictionary: Vec<(Term, Term)>,
    pub mailbox: Mailbox,
    monitors: Vec<Monitor>,
    pub group_leader: Term,
    pub exit_reason: Term,
    /// Binary match state; a GC root while a match is in progress.
    pub bs: Term,
    pub bs_offset: usize,
    flags: Arc<AtomicU32>,
    /// Owned by drivers; freed last during destruction, after the process
    /// is unreachable through the table.
    pub platform_data: Option<Box<dyn Any + Send>>,
    pub native_handler: Option<NativeHandler>,
    pub trap_exit: bool,
    global: Arc<GlobalContext>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("pid", &self.pid)
            .field("heap_capacity", &self.heap.capacity())
            .field("mailbox_len", &self.mailbox.len())
            .field("monitors", &self.monitors.len())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Context {
    /// Creates a process with a default-sized heap and registers it in the
    /// global process table. The new context is reachable through its slot.
    pub fn spawn(global: &Arc<GlobalContext>) -> Pid {
        Self::spawn_with_heap_size(global, DEFAULT_HEAP_SIZE)
    }

    pub fn spawn_with_heap_size(global: &Arc<GlobalContext>, heap_size: usize) -> Pid {
        let pid = global.next_pid();
        let mailbox = Mailbox::new();
        let sender = mailbox.sender();
        let flags = Arc::new(AtomicU32::new(NO_FLAGS));
        let context = Self {
            pid,
            heap: Heap::new(heap_size),
            x: [Term::INVALID; MAX_REG],
            cp: 0,
            fr: None,
            saved_module: None,
            saved_ip: None,
            dictionary: Vec::new(),
            mailbox,
            monitors: Vec::new(),
            group_leader: Term::from_local_process_id(Pid(0)),
            exit_reason: NORMAL_ATOM,
            bs: Term::INVALID,
            bs_offset: 0,
            flags: Arc::clone(&flags),
            platform_data: None,
            native_handler: None,
            trap_exit: false,
            global: Arc::clone(global),
        };
        global.init_process(Arc::new(ProcessSlot::new(pid, flags, sender, context)));
        pid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    /// Atomically applies `flags := (flags & mask) | value`.
    pub fn update_flags(&self, mask: u32, value: u32) {
        update_flag_word(&self.flags, mask, value);
    }

    /// Invalidates registers at and above the live count so a collection
    /// at this safe point roots only live terms.
    pub fn clean_registers(&mut self, live: usize) {
        for reg in self.x.iter_mut().skip(live) {
            *reg = Term::INVALID;
        }
    }

    pub fn set_heap_bounds(&mut self, min: Option<usize>, max: Option<usize>) {
        self.heap.set_heap_bounds(min, max);
    }

    // Memory

    /// Guarantees at least `need` contiguous free cells, collecting and
    /// resizing as required.
    pub fn ensure_free(&mut self, need: usize) -> Result<(), Error> {
        if self.heap.free() < need {
            self.garbage_collect(need)?;
        }
        Ok(())
    }

    /// Runs a collection at a safe point. Roots are the register file, the
    /// stack, the dictionary, the exit reason, the match state, and the
    /// group leader.
    pub fn garbage_collect(&mut self, need: usize) -> Result<(), Error> {
        let mut roots = Vec::with_capacity(MAX_REG + 2 * self.dictionary.len() + 3);
        roots.extend_from_slice(&self.x);
        for (key, value) in &self.dictionary {
            roots.push(*key);
            roots.push(*value);
        }
        roots.push(self.exit_reason);
        roots.push(self.bs);
        roots.push(self.group_leader);

        self.heap.collect(&mut roots, need)?;

        self.x.copy_from_slice(&roots[..MAX_REG]);
        let mut at = MAX_REG;
        for pair in self.dictionary.iter_mut() {
            pair.0 = roots[at];
            pair.1 = roots[at + 1];
            at += 2;
        }
        self.exit_reason = roots[at];
        self.bs = roots[at + 1];
        self.group_leader = roots[at + 2];
        Ok(())
    }

    // Process dictionary

    pub fn dictionary_put(&mut self, key: Term, value: Term) -> Option<Term> {
        let cells = self.heap.cells();
        for pair in self.dictionary.iter_mut() {
            if pair.0.structural_eq(key, cells) {
                let old = pair.1;
                pair.1 = value;
                return Some(old);
            }
        }
        self.dictionary.push((key, value));
        None
    }

    pub fn dictionary_get(&self, key: Term) -> Option<Term> {
        let cells = self.heap.cells();
        self.dictionary
            .iter()
            .find(|(k, _)| k.structural_eq(key, cells))
            .map(|(_, v)| *v)
    }

    pub fn dictionary_erase(&mut self, key: Term) -> Option<Term> {
        let cells = self.heap.cells();
        let index = self
            .dictionary
            .iter()
            .position(|(k, _)| k.structural_eq(key, cells))?;
        Some(self.dictionary.remove(index).1)
    }

    // Monitors and links

    /// Starts watching `peer`. Returns the minted reference; for links the
    /// reference is returned but carries no meaning.
    pub fn monitor(&mut self, peer: Pid, linked: bool) -> u64 {
        let ref_ticks = self.global.next_ref_ticks();
        self.monitors.push(Monitor {
            pid: peer,
            ref_ticks,
            linked,
        });
        ref_ticks
    }

    /// Removes the first matching record. Silent when none is found, so
    /// repeated calls are equivalent to one.
    pub fn demonitor(&mut self, peer: Pid, linked: bool) {
        if let Some(index) = self
            .monitors
            .iter()
            .position(|m| m.pid == peer && m.linked == linked)
        {
            self.monitors.remove(index);
        }
    }

    pub fn demonitor_by_ref(&mut self, ref_ticks: u64) -> Option<Monitor> {
        let index = self
            .monitors
            .iter()
            .position(|m| !m.linked && m.ref_ticks == ref_ticks)?;
        Some(self.monitors.remove(index))
    }

    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    // Observability

    pub fn message_queue_len(&self) -> usize {
        self.mailbox.len()
    }

    /// Process footprint in bytes: the control structure, queued envelopes,
    /// and the heap.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Context>() + 8 * self.mailbox.size() + 8 * self.heap.capacity()
    }

    /// Builds a `{key, value}` tuple on this heap for a process-info key.
    /// Unknown keys report `badarg`; allocation failure reports
    /// `out_of_memory`. Either failure atom is returned as the error.
    pub fn process_info(&mut self, key: Term) -> Result<Term, Term> {
        use crate::atom_table::{
            HEAP_SIZE_ATOM, MEMORY_ATOM, MESSAGE_QUEUE_LEN_ATOM, STACK_SIZE_ATOM,
        };
        if self.ensure_free(term::tuple_words(2)).is_err() {
            return Err(OUT_OF_MEMORY_ATOM);
        }
        let value = if key == HEAP_SIZE_ATOM {
            self.heap.capacity() - self.heap.stack_size()
        } else if key == STACK_SIZE_ATOM {
            self.heap.stack_size()
        } else if key == MESSAGE_QUEUE_LEN_ATOM {
            self.message_queue_len()
        } else if key == MEMORY_ATOM {
            self.size()
        } else {
            return Err(BADARG_ATOM);
        };
        let tuple = Term::alloc_tuple(2, &mut self.heap).map_err(|_| OUT_OF_MEMORY_ATOM)?;
        tuple.put_tuple_element(&mut self.heap, 0, key);
        tuple.put_tuple_element(&mut self.heap, 1, Term::from_int(value as i64));
        Ok(tuple)
    }

    // Mailbox, consumer side

    /// Copies the message at the cursor onto this heap and removes it,
    /// reserving space first.
    pub fn remove_message(&mut self) -> Result<Option<Term>, Error> {
        let Some(need) = self.mailbox.peek().map(HeapFragment::len) else {
            return Ok(None);
        };
        self.ensure_free(need)?;
        self.mailbox.remove_message(&mut self.heap)
    }

    // Signals

    /// Drains pending signals in order. Called at every reduction boundary
    /// before user code runs.
    pub fn process_signals(&mut self) -> SignalResult {
        let mut result = SignalResult::Continue;
        for signal in self.mailbox.take_signals() {
            match signal {
                Signal::Kill { reason } => self.process_kill_signal(&reason),
                Signal::ProcessInfoRequest { sender, key } => {
                    self.process_info_request_signal(sender, key)
                }
                Signal::TrapAnswer { value } => self.process_trap_answer_signal(&value),
                Signal::TrapException { reason } => {
                    self.update_flags(!TRAP, NO_FLAGS);
                    result = SignalResult::Exception(reason);
                }
                Signal::FlushMonitor { ref_ticks, info } => {
                    self.process_flush_monitor_signal(ref_ticks, info)
                }
                Signal::Link { sender } => {
                    if !self.monitors.iter().any(|m| m.linked && m.pid == sender) {
                        self.monitors.push(Monitor {
                            pid: sender,
                            ref_ticks: 0,
                            linked: true,
                        });
                    }
                }
                Signal::Unlink { sender } => self.demonitor(sender, true),
                Signal::GarbageCollect => {
                    let _ = self.garbage_collect(0);
                }
            }
        }
        if self.flags() & KILLED != 0 {
            SignalResult::Killed
        } else {
            result
        }
    }

    /// The exit reason is a GC root, so it must live on this heap; a copy
    /// that cannot be made degrades to the `killed` atom.
    fn process_kill_signal(&mut self, reason: &HeapFragment) {
        self.exit_reason = match self.ensure_free(reason.len()) {
            Ok(()) => self
                .heap
                .import(reason.cells(), reason.term())
                .unwrap_or(KILLED_ATOM),
            Err(_) => KILLED_ATOM,
        };
        self.update_flags(!NO_FLAGS, KILLED);
    }

    /// Answers a process-info request by replying to the requester with a
    /// trap answer, or a trap exception when the info cannot be built.
    fn process_info_request_signal(&mut self, sender: Pid, key: Term) {
        let global = Arc::clone(&self.global);
        match self.process_info(key) {
            Ok(tuple) => {
                let value = HeapFragment::copy_of(self.heap.cells(), tuple);
                global.send_signal(sender, Signal::TrapAnswer { value });
            }
            Err(reason) => {
                global.send_signal(sender, Signal::TrapException { reason });
            }
        }
    }

    fn process_trap_answer_signal(&mut self, value: &HeapFragment) {
        self.update_flags(!TRAP, NO_FLAGS);
        self.x[0] = match self.ensure_free(value.len()) {
            Ok(()) => self
                .heap
                .import(value.cells(), value.term())
                .unwrap_or(OUT_OF_MEMORY_ATOM),
            Err(_) => OUT_OF_MEMORY_ATOM,
        };
    }

    /// Strips every queued `{'DOWN', ref, _, _, _}` carrying the flushed
    /// reference. With the `info` option, `x[0]` reports whether a flush
    /// happened (false means at least one message was removed).
    fn process_flush_monitor_signal(&mut self, ref_ticks: u64, info: bool) {
        self.update_flags(!TRAP, NO_FLAGS);
        let mut result = true;
        self.mailbox.process_outer();
        self.mailbox.reset();
        loop {
            let matched = match self.mailbox.peek() {
                None => break,
                Some(fragment) => {
                    let cells = fragment.cells();
                    let message = fragment.term();
                    message.is_tuple(cells)
                        && message.tuple_arity(cells) == 5
                        && message.tuple_element(cells, 0) == DOWN_ATOM
                        && message.tuple_element(cells, 1).is_reference(cells)
                        && message.tuple_element(cells, 1).ref_ticks(cells) == ref_ticks
                }
            };
            if matched {
                self.mailbox.drop_message();
                if info {
                    result = false;
                }
            } else {
                self.mailbox.next();
            }
        }
        self.mailbox.reset();
        self.x[0] = if result { TRUE_ATOM } else { FALSE_ATOM };
    }

    // Termination

    /// Tears down the process identified by `pid`: removes it from the
    /// table so no new lookups succeed, unregisters its name, fires its
    /// monitors, cancels any pending timer, and frees its resources with
    /// platform data last. Returns false when the process was already gone.
    pub fn destroy(global: &GlobalContext, scheduler: &Scheduler, pid: Pid) -> bool {
        let Some(slot) = global.remove_process(pid) else {
            return false;
        };
        global.maybe_unregister_process_id(pid);
        let Some(mut context) = slot.take_context() else {
            return false;
        };
        // The process is out of the table: monitor notifications cannot
        // race a lookup of the dying pid.
        context.monitors_handle_terminate();
        scheduler.forget(pid);
        let Context {
            mailbox,
            heap,
            platform_data,
            ..
        } = context;
        drop(mailbox);
        drop(heap);
        // Platform data goes last: drivers synchronise on the process lock,
        // which can no longer be acquired at this point.
        drop(platform_data);
        true
    }

    /// Broadcasts this process's termination along its monitor list.
    /// Notifications are built on the dying heap and deep-copied into each
    /// peer's mailbox; failure to allocate one aborts the runtime, since a
    /// half-delivered exit would break the supervision invariants.
    fn monitors_handle_terminate(&mut self) {
        let monitors = std::mem::take(&mut self.monitors);
        let global = Arc::clone(&self.global);
        for monitor in monitors {
            let Some(slot) = global.get_process_slot(monitor.pid) else {
                continue;
            };
            // A peer that dies between lookup and lock leaves with_context
            // returning None; the record is simply dropped.
            if monitor.linked {
                slot.with_context(|peer| {
                    if self.exit_reason == NORMAL_ATOM && !peer.trap_exit {
                        return;
                    }
                    if peer.trap_exit {
                        let tuple = self.build_exit_tuple();
                        slot.mailbox()
                            .post_message(HeapFragment::copy_of(self.heap.cells(), tuple));
                        slot.update_flags(!NO_FLAGS, MESSAGE_READY);
                    } else {
                        let reason = HeapFragment::copy_of(self.heap.cells(), self.exit_reason);
                        slot.mailbox().post_signal(Signal::Kill { reason });
                        slot.update_flags(!NO_FLAGS, MESSAGE_READY | KILLED);
                    }
                });
            } else {
                slot.with_context(|_peer| {
                    let tuple = self.build_down_tuple(monitor.ref_ticks);
                    slot.mailbox()
                        .post_message(HeapFragment::copy_of(self.heap.cells(), tuple));
                    slot.update_flags(!NO_FLAGS, MESSAGE_READY);
                });
            }
        }
    }

    fn build_exit_tuple(&mut self) -> Term {
        if self.ensure_free(term::tuple_words(3)).is_err() {
            fatal_termination_oom();
        }
        let tuple = Term::alloc_tuple(3, &mut self.heap).unwrap_or_else(|_| fatal_termination_oom());
        tuple.put_tuple_element(&mut self.heap, 0, EXIT_SIGNAL_ATOM);
        tuple.put_tuple_element(&mut self.heap, 1, Term::from_local_process_id(self.pid));
        tuple.put_tuple_element(&mut self.heap, 2, self.exit_reason);
        tuple
    }

    fn build_down_tuple(&mut self, ref_ticks: u64) -> Term {
        if self
            .ensure_free(term::REF_WORDS + term::tuple_words(5))
            .is_err()
        {
            fatal_termination_oom();
        }
        let reference = Term::from_ref_ticks(ref_ticks, &mut self.heap)
            .unwrap_or_else(|_| fatal_termination_oom());
        let kind = if self.native_handler.is_some() {
            PORT_ATOM
        } else {
            PROCESS_ATOM
        };
        let tuple = Term::alloc_tuple(5, &mut self.heap).unwrap_or_else(|_| fatal_termination_oom());
        tuple.put_tuple_element(&mut self.heap, 0, DOWN_ATOM);
        tuple.put_tuple_element(&mut self.heap, 1, reference);
        tuple.put_tuple_element(&mut self.heap, 2, kind);
        tuple.put_tuple_element(&mut self.heap, 3, Term::from_local_process_id(self.pid));
        tuple.put_tuple_element(&mut self.heap, 4, self.exit_reason);
        tuple
    }
}

fn fatal_termination_oom() -> ! {
    eprintln!("cannot allocate an exit notification while terminating");
    std::process::abort()
}
