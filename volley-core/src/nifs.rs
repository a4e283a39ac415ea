//! Builtin-function registry.
//!
//! An external, read-only table mapping fully-qualified names
//! (`module:fun/arity`) to function pointers. The interpreter consults it
//! during bytecode resolution; the process builtins registered here also
//! double as the runtime's own exercise of the mailbox, monitor, and
//! process-info machinery.
//!
//! A builtin that suspends (traps) returns the invalid term after raising
//! the `TRAP` flag; the answer arrives in `x[0]` through a trap-answer
//! signal.

use crate::atom_table::{
    FLUSH_ATOM, INFO_ATOM, KILL_ATOM, PROCESS_ATOM, TRUE_ATOM, UNDEFINED_ATOM,
};
use crate::context::{Context, TRAP};
use crate::error::Error;
use crate::globalcontext::Pid;
use crate::heap::{HeapFragment, DEFAULT_HEAP_SIZE};
use crate::mailbox::Signal;
use crate::term::{self, Term};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Function signature for builtin implementations.
pub type NifFn = fn(&mut Context, &[Term]) -> Result<Term, Error>;

/// Helper to coerce function items to function pointers.
const fn coerce_nif(f: NifFn) -> NifFn {
    f
}

macro_rules! register_nif {
    ($functions:expr, $name:literal, $impl:path) => {
        $functions.insert($name, coerce_nif($impl));
    };
}

/// Registry of all available builtin functions.
pub struct NifRegistry {
    functions: HashMap<&'static str, NifFn>,
}

impl NifRegistry {
    /// Get the implementation for a fully-qualified `module:fun/arity`.
    pub fn get(&self, name: &str) -> Option<NifFn> {
        self.functions.get(name).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn create_nif_registry() -> NifRegistry {
    let mut functions = HashMap::new();
    register_nif!(functions, "erlang:self/0", nif_self);
    register_nif!(functions, "erlang:send/2", nif_send);
    register_nif!(functions, "erlang:spawn/1", nif_spawn);
    register_nif!(functions, "erlang:monitor/2", nif_monitor);
    register_nif!(functions, "erlang:demonitor/1", nif_demonitor);
    register_nif!(functions, "erlang:demonitor/2", nif_demonitor_opts);
    register_nif!(functions, "erlang:link/1", nif_link);
    register_nif!(functions, "erlang:unlink/1", nif_unlink);
    register_nif!(functions, "erlang:exit/2", nif_exit);
    register_nif!(functions, "erlang:process_info/2", nif_process_info);
    register_nif!(functions, "erlang:register/2", nif_register);
    register_nif!(functions, "erlang:unregister/1", nif_unregister);
    register_nif!(functions, "erlang:whereis/1", nif_whereis);
    register_nif!(functions, "erlang:put/2", nif_put);
    register_nif!(functions, "erlang:get/1", nif_get);
    register_nif!(functions, "erlang:erase/1", nif_erase);
    NifRegistry { functions }
}

pub static NIF_REGISTRY: LazyLock<NifRegistry> = LazyLock::new(create_nif_registry);

fn expect_args(args: &[Term], arity: usize) -> Result<(), Error> {
    if args.len() == arity {
        Ok(())
    } else {
        Err(Error::ArityMismatch {
            expected: arity,
            found: args.len(),
        })
    }
}

fn expect_pid(term: Term) -> Result<Pid, Error> {
    if term.is_pid() {
        Ok(term.to_local_process_id())
    } else {
        Err(Error::BadArg)
    }
}

fn nif_self(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 0)?;
    Ok(Term::from_local_process_id(ctx.pid()))
}

/// Sending to a pid that is gone succeeds silently.
fn nif_send(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    let target = expect_pid(args[0])?;
    let message = args[1];
    let global = Arc::clone(ctx.global());
    global.send(target, ctx.heap.cells(), message);
    Ok(message)
}

/// `spawn(Fun)`: creates a process with the closure copied into its
/// `x[0]` as the entry point and returns the new pid. The new heap is
/// sized to hold the copy; queueing the process is the embedder's
/// business.
fn nif_spawn(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    if !args[0].is_function(ctx.heap.cells()) {
        return Err(Error::BadArg);
    }
    let global = Arc::clone(ctx.global());
    let entry = HeapFragment::copy_of(ctx.heap.cells(), args[0]);
    let pid = Context::spawn_with_heap_size(&global, entry.len().max(DEFAULT_HEAP_SIZE));
    global
        .with_locked_process(pid, |spawned| -> Result<(), Error> {
            spawned.x[0] = spawned.heap.import(entry.cells(), entry.term())?;
            Ok(())
        })
        .unwrap_or(Ok(()))?;
    Ok(Term::from_local_process_id(pid))
}

/// `monitor(process, Pid)`. The record lands on the watched process; a
/// watched pid that is already gone is answered with an immediate
/// `{'DOWN', Ref, process, Pid, noproc}`.
fn nif_monitor(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    if args[0] != PROCESS_ATOM {
        return Err(Error::BadArg);
    }
    let target = expect_pid(args[1])?;
    let self_pid = ctx.pid();
    let global = Arc::clone(ctx.global());

    // The caller's own lock is already held; watching yourself must not
    // take it again.
    let ticks = if target == self_pid {
        Some(ctx.monitor(self_pid, false))
    } else {
        global.with_locked_process(target, |watched| watched.monitor(self_pid, false))
    };
    match ticks {
        Some(ticks) => {
            ctx.ensure_free(term::REF_WORDS)?;
            Term::from_ref_ticks(ticks, &mut ctx.heap)
        }
        None => {
            let ticks = global.next_ref_ticks();
            let noproc = global.atom_table().atom("noproc");
            ctx.ensure_free(term::REF_WORDS + term::tuple_words(5))?;
            let reference = Term::from_ref_ticks(ticks, &mut ctx.heap)?;
            let down = Term::alloc_tuple(5, &mut ctx.heap)?;
            down.put_tuple_element(&mut ctx.heap, 0, crate::atom_table::DOWN_ATOM);
            down.put_tuple_element(&mut ctx.heap, 1, reference);
            down.put_tuple_element(&mut ctx.heap, 2, PROCESS_ATOM);
            down.put_tuple_element(&mut ctx.heap, 3, args[1]);
            down.put_tuple_element(&mut ctx.heap, 4, noproc);
            global.send(self_pid, ctx.heap.cells(), down);
            Ok(reference)
        }
    }
}

fn demonitor_ref_ticks(ctx: &Context, term: Term) -> Result<u64, Error> {
    if term.is_reference(ctx.heap.cells()) {
        Ok(term.ref_ticks(ctx.heap.cells()))
    } else {
        Err(Error::BadArg)
    }
}

fn remove_monitor(ctx: &mut Context, ref_ticks: u64) -> bool {
    if ctx.demonitor_by_ref(ref_ticks).is_some() {
        return true;
    }
    let global = Arc::clone(ctx.global());
    global.demonitor_by_ref(ref_ticks, ctx.pid()).is_some()
}

fn nif_demonitor(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    let ref_ticks = demonitor_ref_ticks(ctx, args[0])?;
    remove_monitor(ctx, ref_ticks);
    Ok(TRUE_ATOM)
}

/// `demonitor(Ref, Options)` with `flush` and `info` options. Flushing is
/// delegated to a flush-monitor signal to self, so the result lands in
/// `x[0]` once signals are drained.
fn nif_demonitor_opts(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    let ref_ticks = demonitor_ref_ticks(ctx, args[0])?;
    let mut flush = false;
    let mut info = false;
    let mut options = args[1];
    let cells = ctx.heap.cells();
    while !options.is_nil() {
        if !options.is_cons() {
            return Err(Error::BadArg);
        }
        let option = options.list_head(cells);
        if option == FLUSH_ATOM {
            flush = true;
        } else if option == INFO_ATOM {
            info = true;
        } else {
            return Err(Error::BadArg);
        }
        options = options.list_tail(cells);
    }

    let found = remove_monitor(ctx, ref_ticks);
    if flush {
        let self_pid = ctx.pid();
        let global = Arc::clone(ctx.global());
        ctx.update_flags(!0, TRAP);
        global.send_signal(self_pid, Signal::FlushMonitor { ref_ticks, info });
        return Ok(Term::INVALID);
    }
    Ok(if info && !found { crate::atom_table::FALSE_ATOM } else { TRUE_ATOM })
}

/// Links are symmetric: a record on each endpoint. The remote half is
/// installed through a link signal.
fn nif_link(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    let target = expect_pid(args[0])?;
    let self_pid = ctx.pid();
    if target == self_pid {
        return Ok(TRUE_ATOM);
    }
    let global = Arc::clone(ctx.global());
    if global.get_process_slot(target).is_none() {
        return Err(Error::NoProcess(target));
    }
    if !ctx.monitors().iter().any(|m| m.linked && m.pid == target) {
        ctx.monitor(target, true);
    }
    global.send_signal(target, Signal::Link { sender: self_pid });
    Ok(TRUE_ATOM)
}

fn nif_unlink(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    let target = expect_pid(args[0])?;
    let self_pid = ctx.pid();
    ctx.demonitor(target, true);
    let global = Arc::clone(ctx.global());
    global.send_signal(target, Signal::Unlink { sender: self_pid });
    Ok(TRUE_ATOM)
}

/// `exit(Pid, Reason)`: a trapping target gets `{'EXIT', Self, Reason}` as
/// a message unless the reason is `kill`; anything else is a kill signal.
fn nif_exit(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    let target = expect_pid(args[0])?;
    let reason = args[1];
    let self_pid = ctx.pid();
    let global = Arc::clone(ctx.global());

    if target == self_pid {
        ctx.exit_reason = reason;
        ctx.update_flags(!0, crate::context::KILLED);
        return Ok(TRUE_ATOM);
    }

    let traps = global
        .with_locked_process(target, |peer| peer.trap_exit)
        .unwrap_or(false);
    if traps && reason != KILL_ATOM {
        ctx.ensure_free(term::tuple_words(3))?;
        let tuple = Term::alloc_tuple(3, &mut ctx.heap)?;
        tuple.put_tuple_element(&mut ctx.heap, 0, crate::atom_table::EXIT_SIGNAL_ATOM);
        tuple.put_tuple_element(&mut ctx.heap, 1, Term::from_local_process_id(self_pid));
        tuple.put_tuple_element(&mut ctx.heap, 2, reason);
        global.send(target, ctx.heap.cells(), tuple);
    } else {
        let reason = HeapFragment::copy_of(ctx.heap.cells(), reason);
        global.send_signal(target, Signal::Kill { reason });
    }
    Ok(TRUE_ATOM)
}

/// Local queries answer directly; remote ones trap and are answered by the
/// target through a process-info request signal.
fn nif_process_info(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    let target = expect_pid(args[0])?;
    let key = args[1];
    if !key.is_atom() {
        return Err(Error::BadArg);
    }
    if target == ctx.pid() {
        return ctx.process_info(key).map_err(|reason| {
            if reason == crate::atom_table::OUT_OF_MEMORY_ATOM {
                Error::OutOfMemory
            } else {
                Error::BadArg
            }
        });
    }
    let self_pid = ctx.pid();
    let global = Arc::clone(ctx.global());
    if !global.send_signal(
        target,
        Signal::ProcessInfoRequest {
            sender: self_pid,
            key,
        },
    ) {
        return Err(Error::NoProcess(target));
    }
    ctx.update_flags(!0, TRAP);
    Ok(Term::INVALID)
}

fn nif_register(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    if !args[0].is_atom() {
        return Err(Error::BadArg);
    }
    let pid = expect_pid(args[1])?;
    let global = Arc::clone(ctx.global());
    if global.get_process_slot(pid).is_none() {
        return Err(Error::BadArg);
    }
    if global.register_name(args[0].atom_index(), pid) {
        Ok(TRUE_ATOM)
    } else {
        Err(Error::AlreadyRegistered)
    }
}

fn nif_unregister(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    if !args[0].is_atom() {
        return Err(Error::BadArg);
    }
    let global = Arc::clone(ctx.global());
    match global.unregister_name(args[0].atom_index()) {
        Some(_) => Ok(TRUE_ATOM),
        None => Err(Error::BadArg),
    }
}

fn nif_whereis(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    if !args[0].is_atom() {
        return Err(Error::BadArg);
    }
    let global = Arc::clone(ctx.global());
    Ok(match global.whereis(args[0].atom_index()) {
        Some(pid) => Term::from_local_process_id(pid),
        None => UNDEFINED_ATOM,
    })
}

fn nif_put(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 2)?;
    Ok(ctx.dictionary_put(args[0], args[1]).unwrap_or(UNDEFINED_ATOM))
}

fn nif_get(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    Ok(ctx.dictionary_get(args[0]).unwrap_or(UNDEFINED_ATOM))
}

fn nif_erase(ctx: &mut Context, args: &[Term]) -> Result<Term, Error> {
    expect_args(args, 1)?;
    Ok(ctx.dictionary_erase(args[0]).unwrap_or(UNDEFINED_ATOM))
}
