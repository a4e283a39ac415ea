use std::sync::Arc;
use volley_core::context::Context;
use volley_core::globalcontext::{GlobalContext, Pid};
use volley_core::scheduler::Scheduler;
use volley_core::term::Term;

#[allow(dead_code)]
pub struct TestNode {
    pub global: Arc<GlobalContext>,
    pub scheduler: Scheduler,
}

#[allow(dead_code)]
impl TestNode {
    pub fn spawn(&self) -> Pid {
        Context::spawn(&self.global)
    }

    pub fn spawn_with_heap_size(&self, cells: usize) -> Pid {
        Context::spawn_with_heap_size(&self.global, cells)
    }

    /// Runs `f` under the process lock, panicking if the process is gone.
    pub fn with_ctx<R>(&self, pid: Pid, f: impl FnOnce(&mut Context) -> R) -> R {
        self.global
            .with_locked_process(pid, f)
            .expect("process is gone")
    }

    pub fn atom(&self, name: &str) -> Term {
        self.global.atom_table().atom(name)
    }

    pub fn destroy(&self, pid: Pid) -> bool {
        Context::destroy(&self.global, &self.scheduler, pid)
    }

    /// Sends an immediate term (atom, small int, pid) to a process.
    pub fn send_immediate(&self, to: Pid, message: Term) -> bool {
        self.global.send(to, &[], message)
    }
}

#[allow(dead_code)]
pub fn node() -> TestNode {
    TestNode {
        global: GlobalContext::new(),
        scheduler: Scheduler::new(),
    }
}
