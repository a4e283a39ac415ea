//! Term rendering for diagnostics and tests.

use crate::atom_table::AtomTable;
use crate::term::Term;

/// Helper to format binary payloads as a string when they are printable
/// UTF-8 text.
fn try_format_as_string(bytes: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(bytes).ok()?;
    if s.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(format!("<<\"{}\">>", s))
}

/// Renders a term rooted in `cells` in Erlang-ish syntax.
pub fn format_term(cells: &[u64], term: Term, atoms: &AtomTable) -> String {
    if term.is_small_int() {
        return term.to_int().to_string();
    }
    if term.is_atom() {
        return atoms
            .name(term.atom_index())
            .unwrap_or_else(|| format!("#atom<{}>", term.atom_index()));
    }
    if term.is_pid() {
        return format!("<0.{}.0>", term.to_local_process_id().0);
    }
    if term.is_port() {
        return format!("#Port<0.{}>", term.to_local_process_id().0);
    }
    if term.is_nil() {
        return "[]".to_string();
    }
    if term.is_invalid() {
        return "#invalid".to_string();
    }
    if term.is_cons() {
        let mut parts = Vec::new();
        let mut walk = term;
        loop {
            parts.push(format_term(cells, walk.list_head(cells), atoms));
            let tail = walk.list_tail(cells);
            if tail.is_nil() {
                return format!("[{}]", parts.join(","));
            }
            if !tail.is_cons() {
                let improper = format_term(cells, tail, atoms);
                return format!("[{}|{}]", parts.join(","), improper);
            }
            walk = tail;
        }
    }
    if term.is_integer(cells) {
        return term.to_int64(cells).to_string();
    }
    if term.is_float(cells) {
        return format!("{:?}", term.to_float(cells));
    }
    if term.is_reference(cells) {
        return format!("#Ref<0.{}>", term.ref_ticks(cells));
    }
    if term.is_function(cells) {
        return format!("#Fun<{}>", term.closure_function_id(cells));
    }
    if term.is_tuple(cells) {
        let parts: Vec<String> = (0..term.tuple_arity(cells))
            .map(|i| format_term(cells, term.tuple_element(cells, i), atoms))
            .collect();
        return format!("{{{}}}", parts.join(","));
    }
    if term.is_map(cells) {
        let pairs: Vec<String> = (0..term.map_arity(cells))
            .map(|i| {
                format!(
                    "{} => {}",
                    format_term(cells, term.map_key(cells, i), atoms),
                    format_term(cells, term.map_value(cells, i), atoms)
                )
            })
            .collect();
        return format!("#{{{}}}", pairs.join(","));
    }
    if term.is_binary(cells) {
        let bytes = term.binary_bytes(cells);
        if let Some(text) = try_format_as_string(&bytes) {
            return text;
        }
        let parts: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
        return format!("<<{}>>", parts.join(","));
    }
    format!("#term<{:#x}>", term.raw())
}
