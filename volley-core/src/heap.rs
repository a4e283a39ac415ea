//! Per-process heap with an embedded stack and a copying collector.
//!
//! The heap is one cell vector: the allocation pointer grows up from zero,
//! the stack pointer `e` grows down from the end, and the gap between them
//! is the free space. Collection is Cheney-style: live objects are
//! evacuated into a fresh vector, forwarding offsets are written into the
//! old headers, and the scan pointer chases references until it catches up
//! with the allocation front. Because terms address the heap by offset
//! rather than by pointer, relocation is a pure transformation over the
//! offset space.

use crate::error::Error;
use crate::term::{
    self, Term, KIND_BINARY, KIND_CLOSURE, KIND_CONS, KIND_FLOAT, KIND_INT64, KIND_MAP, KIND_MOVED,
    KIND_REF, KIND_TUPLE,
};
use std::collections::HashMap;

/// Default heap capacity for a fresh process, in cells.
pub const DEFAULT_HEAP_SIZE: usize = 64;

#[derive(Debug)]
pub struct Heap {
    cells: Vec<u64>,
    heap_top: usize,
    e: usize,
    min_heap_size: Option<usize>,
    max_heap_size: Option<usize>,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(DEFAULT_HEAP_SIZE);
        Self {
            cells: vec![0; capacity],
            heap_top: 0,
            e: capacity,
            min_heap_size: None,
            max_heap_size: None,
        }
    }

    pub fn set_heap_bounds(&mut self, min: Option<usize>, max: Option<usize>) {
        self.min_heap_size = min;
        self.max_heap_size = max;
    }

    /// Total capacity in cells, stack included.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Free cells between the allocation pointer and the stack.
    pub fn free(&self) -> usize {
        self.e - self.heap_top
    }

    pub fn used(&self) -> usize {
        self.heap_top
    }

    pub fn stack_size(&self) -> usize {
        self.cells.len() - self.e
    }

    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    pub(crate) fn set_cell(&mut self, offset: usize, raw: u64) {
        self.cells[offset] = raw;
    }

    /// Bump-allocates `words` cells. The caller is expected to have
    /// guaranteed space via `Context::ensure_free`.
    pub fn alloc(&mut self, words: usize) -> Result<usize, Error> {
        if self.free() < words {
            return Err(Error::OutOfMemory);
        }
        let offset = self.heap_top;
        self.heap_top += words;
        Ok(offset)
    }

    // Stack operations. The stack shares the cell vector and is walked as
    // a root set by the collector.

    pub fn stack_push(&mut self, term: Term) -> Result<(), Error> {
        if self.free() == 0 {
            return Err(Error::OutOfMemory);
        }
        self.e -= 1;
        self.cells[self.e] = term.raw();
        Ok(())
    }

    pub fn stack_pop(&mut self) -> Result<Term, Error> {
        if self.e == self.cells.len() {
            return Err(Error::StackUnderflow);
        }
        let term = Term::from_raw(self.cells[self.e]);
        self.e += 1;
        Ok(term)
    }

    pub fn stack_get(&self, slot: usize) -> Option<Term> {
        if slot < self.stack_size() {
            Some(Term::from_raw(self.cells[self.e + slot]))
        } else {
            None
        }
    }

    /// Copies a term rooted in another cell region onto this heap.
    /// Requires `free() >= fragment length`; `remove_message` and signal
    /// handlers establish that with `ensure_free` first.
    pub fn import(&mut self, src: &[u64], term: Term) -> Result<Term, Error> {
        let mut copied = Vec::new();
        let mut seen = HashMap::new();
        let root = copy_term_into(src, term, &mut copied, self.heap_top, &mut seen);
        if copied.len() > self.free() {
            return Err(Error::OutOfMemory);
        }
        self.cells[self.heap_top..self.heap_top + copied.len()].copy_from_slice(&copied);
        self.heap_top += copied.len();
        Ok(root)
    }

    /// Runs a collection with the given extra roots (registers, dictionary,
    /// exit reason, match state), then resizes so at least `need` free
    /// cells remain. Stack cells are always roots. Root slots are updated
    /// in place.
    pub fn collect(&mut self, roots: &mut [Term], need: usize) -> Result<(), Error> {
        let stack_len = self.stack_size();
        let mut to: Vec<u64> = Vec::with_capacity(self.heap_top);

        for slot in roots.iter_mut() {
            *slot = evacuate(&mut self.cells, &mut to, *slot);
        }

        let mut stack: Vec<u64> = self.cells[self.e..].to_vec();
        for cell in stack.iter_mut() {
            *cell = evacuate(&mut self.cells, &mut to, Term::from_raw(*cell)).raw();
        }

        let mut scan = 0;
        while scan < to.len() {
            let header = to[scan];
            let kind = term::header_kind(header);
            let size = term::header_size(header);
            let (first, last) = match kind {
                KIND_TUPLE | KIND_MAP | KIND_CONS => (scan + 1, scan + 1 + size),
                KIND_CLOSURE => (scan + 2, scan + 1 + size),
                KIND_REF | KIND_FLOAT | KIND_INT64 | KIND_BINARY => (0, 0),
                _ => unreachable!("scanned an object with kind {kind}"),
            };
            for i in first..last {
                let term = Term::from_raw(to[i]);
                let moved = evacuate(&mut self.cells, &mut to, term);
                to[i] = moved.raw();
            }
            scan += 1 + size;
        }

        let live = to.len();
        let required = live + stack_len + need;
        let new_capacity = self.next_capacity(required)?;

        let mut cells = vec![0; new_capacity];
        cells[..live].copy_from_slice(&to);
        let e = new_capacity - stack_len;
        cells[e..].copy_from_slice(&stack);
        self.cells = cells;
        self.heap_top = live;
        self.e = e;
        Ok(())
    }

    /// Growth doubles until the requirement fits; a heap holding less than
    /// a quarter of its capacity live is sized down for the next region.
    fn next_capacity(&self, required: usize) -> Result<usize, Error> {
        let mut capacity = self.cells.len();
        if required > capacity {
            while capacity < required {
                capacity *= 2;
            }
            if let Some(max) = self.max_heap_size {
                if capacity > max {
                    if required > max {
                        return Err(Error::OutOfMemory);
                    }
                    capacity = max;
                }
            }
        } else {
            let floor = self.min_heap_size.unwrap_or(0).max(DEFAULT_HEAP_SIZE);
            if required * 4 <= capacity && capacity / 2 >= floor {
                capacity /= 2;
            }
        }
        Ok(capacity)
    }
}

/// Moves one object from `from` into `to` unless it was already moved, and
/// returns the relocated term. Forwarding is recorded in the old header.
fn evacuate(from: &mut [u64], to: &mut Vec<u64>, term: Term) -> Term {
    if !term.is_heap_bound() {
        return term;
    }
    let offset = term.heap_offset();
    let header = from[offset];
    if term::header_kind(header) == KIND_MOVED {
        return term.with_heap_offset(term::header_size(header));
    }
    let size = term::header_size(header);
    let new_offset = to.len();
    to.push(header);
    to.extend_from_slice(&from[offset + 1..offset + 1 + size]);
    from[offset] = term::make_header(KIND_MOVED, new_offset);
    term.with_heap_offset(new_offset)
}

/// A detached allocation owning one deep-copied term; mailbox envelopes
/// and signal payloads travel between processes as fragments.
#[derive(Debug, Clone)]
pub struct HeapFragment {
    cells: Vec<u64>,
    term: Term,
}

impl HeapFragment {
    /// Deep-copies `term` out of `src` into a fresh self-contained region.
    pub fn copy_of(src: &[u64], term: Term) -> Self {
        let mut cells = Vec::new();
        let mut seen = HashMap::new();
        let term = copy_term_into(src, term, &mut cells, 0, &mut seen);
        Self { cells, term }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Structural copy of `term` from `src` into `dst`, producing offsets
/// rebased by `base`. Shared substructure is copied once; `seen` maps old
/// offsets to their copies.
fn copy_term_into(
    src: &[u64],
    term: Term,
    dst: &mut Vec<u64>,
    base: usize,
    seen: &mut HashMap<usize, usize>,
) -> Term {
    if !term.is_heap_bound() {
        return term;
    }
    let offset = term.heap_offset();
    if let Some(&copied) = seen.get(&offset) {
        return term.with_heap_offset(copied);
    }
    let header = src[offset];
    let kind = term::header_kind(header);
    let size = term::header_size(header);
    let new_offset = base + dst.len();
    seen.insert(offset, new_offset);
    dst.push(header);
    let first_term_cell = match kind {
        KIND_TUPLE | KIND_MAP | KIND_CONS => 0,
        KIND_CLOSURE => 1,
        _ => {
            // Raw payloads copy verbatim
            dst.extend_from_slice(&src[offset + 1..offset + 1 + size]);
            return term.with_heap_offset(new_offset);
        }
    };
    let payload_start = dst.len();
    dst.extend_from_slice(&src[offset + 1..offset + 1 + size]);
    for i in payload_start + first_term_cell..payload_start + size {
        let child = copy_term_into(src, Term::from_raw(dst[i]), dst, base, seen);
        dst[i] = child.raw();
    }
    term.with_heap_offset(new_offset)
}
