//! Global atom table.
//!
//! Append-only interning table shared by every process. Atom terms carry
//! an index into this table; equality between atoms reduces to index
//! equality. A fixed set of well-known atoms is interned at construction
//! so their indexes are compile-time constants.

use crate::term::Term;
use std::sync::RwLock;
use string_interner::{DefaultBackend, StringInterner, Symbol};

/// Seeded in order at table construction; keep in sync with the constants
/// below.
const WELL_KNOWN: &[&str] = &[
    "false",
    "true",
    "normal",
    "kill",
    "killed",
    "badarg",
    "badarith",
    "out_of_memory",
    "undef",
    "function_clause",
    "case_clause",
    "if_clause",
    "nocatch",
    "throw",
    "error",
    "exit",
    "EXIT",
    "DOWN",
    "process",
    "port",
    "heap_size",
    "stack_size",
    "message_queue_len",
    "memory",
    "undefined",
    "infinity",
    "flush",
    "info",
];

pub const FALSE_ATOM: Term = Term::from_atom_index(0);
pub const TRUE_ATOM: Term = Term::from_atom_index(1);
pub const NORMAL_ATOM: Term = Term::from_atom_index(2);
pub const KILL_ATOM: Term = Term::from_atom_index(3);
pub const KILLED_ATOM: Term = Term::from_atom_index(4);
pub const BADARG_ATOM: Term = Term::from_atom_index(5);
pub const BADARITH_ATOM: Term = Term::from_atom_index(6);
pub const OUT_OF_MEMORY_ATOM: Term = Term::from_atom_index(7);
pub const UNDEF_ATOM: Term = Term::from_atom_index(8);
pub const FUNCTION_CLAUSE_ATOM: Term = Term::from_atom_index(9);
pub const CASE_CLAUSE_ATOM: Term = Term::from_atom_index(10);
pub const IF_CLAUSE_ATOM: Term = Term::from_atom_index(11);
pub const NOCATCH_ATOM: Term = Term::from_atom_index(12);
pub const THROW_ATOM: Term = Term::from_atom_index(13);
pub const ERROR_ATOM: Term = Term::from_atom_index(14);
pub const EXIT_ATOM: Term = Term::from_atom_index(15);
/// The `'EXIT'` atom used in trap-exit tuples.
pub const EXIT_SIGNAL_ATOM: Term = Term::from_atom_index(16);
pub const DOWN_ATOM: Term = Term::from_atom_index(17);
pub const PROCESS_ATOM: Term = Term::from_atom_index(18);
pub const PORT_ATOM: Term = Term::from_atom_index(19);
pub const HEAP_SIZE_ATOM: Term = Term::from_atom_index(20);
pub const STACK_SIZE_ATOM: Term = Term::from_atom_index(21);
pub const MESSAGE_QUEUE_LEN_ATOM: Term = Term::from_atom_index(22);
pub const MEMORY_ATOM: Term = Term::from_atom_index(23);
pub const UNDEFINED_ATOM: Term = Term::from_atom_index(24);
pub const INFINITY_ATOM: Term = Term::from_atom_index(25);
pub const FLUSH_ATOM: Term = Term::from_atom_index(26);
pub const INFO_ATOM: Term = Term::from_atom_index(27);

#[derive(Debug)]
pub struct AtomTable {
    inner: RwLock<StringInterner<DefaultBackend>>,
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomTable {
    pub fn new() -> Self {
        let mut interner = StringInterner::new();
        for name in WELL_KNOWN {
            interner.get_or_intern_static(*name);
        }
        Self {
            inner: RwLock::new(interner),
        }
    }

    /// Interns `name`, returning its stable index.
    pub fn intern(&self, name: &str) -> u32 {
        let mut interner = self.inner.write().unwrap();
        interner.get_or_intern(name).to_usize() as u32
    }

    /// Index of an already-interned atom.
    pub fn get(&self, name: &str) -> Option<u32> {
        let interner = self.inner.read().unwrap();
        interner.get(name).map(|s| s.to_usize() as u32)
    }

    pub fn name(&self, index: u32) -> Option<String> {
        let interner = self.inner.read().unwrap();
        let symbol = string_interner::DefaultSymbol::try_from_usize(index as usize)?;
        interner.resolve(symbol).map(str::to_string)
    }

    /// Interns `name` and wraps the index as an atom term.
    pub fn atom(&self, name: &str) -> Term {
        Term::from_atom_index(self.intern(name))
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}
