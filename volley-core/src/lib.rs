pub mod atom_table;
pub mod context;
pub mod error;
pub mod format;
pub mod globalcontext;
pub mod heap;
pub mod mailbox;
pub mod nifs;
pub mod scheduler;
pub mod term;

pub use context::{Context, Monitor, SignalResult, MAX_REG};
pub use error::Error;
pub use globalcontext::{GlobalContext, Pid, ProcessSlot};
pub use heap::{Heap, HeapFragment, DEFAULT_HEAP_SIZE};
pub use mailbox::{Mailbox, MailboxSender, Signal};
pub use scheduler::{ProcessStatus, Scheduler};
pub use term::Term;
