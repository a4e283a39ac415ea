//! Ready queue and timer hooks.
//!
//! The scheduling policy itself lives with the embedder; this module owns
//! the pieces the runtime contract names: a ready queue with the
//! `READY`/`RUNNING` flag protocol, and the per-scheduler timer list that
//! backs receive timeouts. Time is a plain millisecond value supplied by
//! the caller, so tests can drive a virtual clock.

use crate::context;
use crate::globalcontext::{GlobalContext, Pid};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Running,
    Queued,
    Waiting,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline_ms: u64,
    pid: Pid,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    run_queue: Mutex<VecDeque<Pid>>,
    timers: Mutex<Vec<TimerEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a process for execution. Idempotent while already queued.
    pub fn make_ready(&self, global: &GlobalContext, pid: Pid) {
        let Some(slot) = global.get_process_slot(pid) else {
            return;
        };
        let mut queue = self.run_queue.lock().unwrap();
        if !queue.contains(&pid) {
            queue.push_back(pid);
        }
        slot.update_flags(!0, context::READY);
    }

    /// Pops the next runnable process and marks it running.
    pub fn next_ready(&self, global: &GlobalContext) -> Option<Pid> {
        let pid = self.run_queue.lock().unwrap().pop_front()?;
        if let Some(slot) = global.get_process_slot(pid) {
            slot.update_flags(!context::READY, context::RUNNING);
        }
        Some(pid)
    }

    /// Returns a process to the waiting state after a suspension point.
    pub fn suspend(&self, global: &GlobalContext, pid: Pid) {
        self.run_queue.lock().unwrap().retain(|p| *p != pid);
        if let Some(slot) = global.get_process_slot(pid) {
            slot.update_flags(!(context::READY | context::RUNNING), context::NO_FLAGS);
        }
    }

    pub fn run_queue_len(&self) -> usize {
        self.run_queue.lock().unwrap().len()
    }

    pub fn status(&self, global: &GlobalContext, pid: Pid) -> ProcessStatus {
        let Some(slot) = global.get_process_slot(pid) else {
            return ProcessStatus::Terminated;
        };
        if slot.flags() & context::RUNNING != 0 {
            ProcessStatus::Running
        } else if self.run_queue.lock().unwrap().contains(&pid) {
            ProcessStatus::Queued
        } else {
            ProcessStatus::Waiting
        }
    }

    // Timers

    /// Registers a receive timeout at `now_ms + timeout_ms`.
    pub fn set_timeout(&self, global: &GlobalContext, pid: Pid, timeout_ms: u64, now_ms: u64) {
        let Some(slot) = global.get_process_slot(pid) else {
            return;
        };
        self.timers.lock().unwrap().push(TimerEntry {
            deadline_ms: now_ms + timeout_ms,
            pid,
        });
        slot.update_flags(!0, context::WAITING_TIMEOUT);
    }

    /// Removes a pending timer, e.g. when a matching message arrived or
    /// the process is terminating.
    pub fn cancel_timeout(&self, global: &GlobalContext, pid: Pid) {
        self.timers.lock().unwrap().retain(|t| t.pid != pid);
        if let Some(slot) = global.get_process_slot(pid) {
            slot.update_flags(
                !(context::WAITING_TIMEOUT | context::TIMED_OUT),
                context::NO_FLAGS,
            );
        }
    }

    /// Fires every timer due at `now_ms`: the owner gets
    /// `MESSAGE_READY | TIMED_OUT` and is requeued. Returns the number of
    /// timers fired.
    pub fn process_timeouts(&self, global: &GlobalContext, now_ms: u64) -> usize {
        let due: Vec<TimerEntry> = {
            let mut timers = self.timers.lock().unwrap();
            let mut due = Vec::new();
            timers.retain(|t| {
                if t.deadline_ms <= now_ms {
                    due.push(*t);
                    false
                } else {
                    true
                }
            });
            due
        };
        for timer in &due {
            if let Some(slot) = global.get_process_slot(timer.pid) {
                slot.update_flags(
                    !context::WAITING_TIMEOUT,
                    context::MESSAGE_READY | context::TIMED_OUT,
                );
            }
            self.make_ready(global, timer.pid);
        }
        due.len()
    }

    /// Earliest pending deadline, for the embedder's sleep decision.
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.deadline_ms)
            .min()
    }

    /// Drops every trace of a terminating process.
    pub(crate) fn forget(&self, pid: Pid) {
        self.run_queue.lock().unwrap().retain(|p| *p != pid);
        self.timers.lock().unwrap().retain(|t| t.pid != pid);
    }
}
