use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::globalcontext::Pid;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum Error {
    // Allocation errors
    #[error("out of memory")]
    OutOfMemory,

    // Argument and type errors
    #[error("bad argument")]
    BadArg,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("arity mismatch: expected {expected}, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    // Process errors
    #[error("no such process: {0:?}")]
    NoProcess(Pid),
    #[error("name already registered")]
    AlreadyRegistered,

    // Stack and register errors
    #[error("stack underflow")]
    StackUnderflow,
    #[error("register index out of range: {0}")]
    RegisterOutOfRange(usize),

    // Builtin resolution errors
    #[error("undefined builtin: {0}")]
    UndefinedBuiltin(String),
}
