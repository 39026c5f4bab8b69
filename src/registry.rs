// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide state: the thread arena, the current-thread pointer, and the
//! termination/waiter bookkeeping, all confined to the hosting OS thread.
//!
//! Everything here is reached through [`Registry::with`], which borrows a
//! single [`thread_local!`] [`RefCell`]. Callers that are about to perform a
//! context switch must finish all bookkeeping and extract whatever raw
//! [`RegisterFile`] pointers they need *inside* the `with` closure, then let
//! it return before calling [`crate::context::swap`]: holding the `RefCell`
//! borrow across a switch would deadlock (panic) the first time the resumed
//! side tries to touch the registry itself, since as far as `RefCell` is
//! concerned it's the same call stack re-entering, not a different thread.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::context::RegisterFile;
use crate::scheduler::{RoundRobin, Scheduler};
use crate::stack::Stack;
use crate::thread::ThreadRecord;
use crate::tid::{Status, Tid};

thread_local! {
    static STATE: RefCell<Registry> = RefCell::new(Registry::new());
}

pub(crate) struct Registry {
    arena: Vec<Option<Box<ThreadRecord>>>,
    current: Tid,
    system_tid: Tid,
    next_id: u64,
    scheduler: Option<Box<dyn Scheduler>>,
    terminated: VecDeque<Tid>,
    waiters: VecDeque<Tid>,
}

impl Registry {
    fn new() -> Self {
        Self {
            arena: Vec::new(),
            current: Tid::NO_THREAD,
            system_tid: Tid::NO_THREAD,
            next_id: 0,
            scheduler: None,
            terminated: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    /// Runs `f` against this OS thread's registry.
    pub(crate) fn with<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
        STATE.with(|cell| f(&mut cell.borrow_mut()))
    }

    fn slot(tid: Tid) -> usize {
        tid.index() - 1
    }

    fn next_tid(&mut self) -> Tid {
        self.next_id += 1;
        Tid(self.next_id)
    }

    pub(crate) fn get(&self, tid: Tid) -> Option<&ThreadRecord> {
        self.arena.get(Self::slot(tid))?.as_deref()
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> Option<&mut ThreadRecord> {
        self.arena.get_mut(Self::slot(tid))?.as_deref_mut()
    }

    /// Raw pointer to `tid`'s saved register file, for use as the `old` or
    /// `new` argument of [`crate::context::swap`] once this borrow has
    /// ended. Panics if `tid` is unknown -- a caller-side bug, never a
    /// recoverable condition this deep in the lifecycle core.
    pub(crate) fn regs_ptr(&mut self, tid: Tid) -> *mut RegisterFile {
        &mut self
            .get_mut(tid)
            .expect("regs_ptr: unknown tid")
            .regs as *mut RegisterFile
    }

    /// Inserts the system-thread record and remembers its `Tid`. Must be
    /// called at most once per process.
    pub(crate) fn insert_system(&mut self) -> Tid {
        let tid = self.next_tid();
        self.arena.push(Some(Box::new(ThreadRecord::system(tid))));
        debug_assert_eq!(Self::slot(tid), self.arena.len() - 1);
        self.system_tid = tid;
        self.current = tid;
        tid
    }

    pub(crate) fn insert_worker(&mut self, stack: Stack, regs: RegisterFile) -> Tid {
        let tid = self.next_tid();
        self.arena
            .push(Some(Box::new(ThreadRecord::worker(tid, stack, regs))));
        debug_assert_eq!(Self::slot(tid), self.arena.len() - 1);
        tid
    }

    /// Clears the identity slot and hands back the boxed record, e.g. for
    /// `wait` to unmap its stack.
    pub(crate) fn take(&mut self, tid: Tid) -> Option<Box<ThreadRecord>> {
        self.arena.get_mut(Self::slot(tid))?.take()
    }

    pub(crate) fn current(&self) -> Tid {
        self.current
    }

    pub(crate) fn set_current(&mut self, tid: Tid) {
        self.current = tid;
    }

    pub(crate) fn system_tid(&self) -> Tid {
        self.system_tid
    }

    pub(crate) fn is_started(&self) -> bool {
        !self.system_tid.is_none()
    }

    pub(crate) fn scheduler(&mut self) -> &mut dyn Scheduler {
        if self.scheduler.is_none() {
            let mut rr = Box::new(RoundRobin::new());
            rr.init();
            self.scheduler = Some(rr);
        }
        self.scheduler.as_deref_mut().unwrap()
    }

    /// Replaces the scheduler, draining the old one's ready set into the new
    /// one via repeated `next()`/`admit()` calls, per `set_scheduler`'s
    /// migration contract. `new_sched` of `None` substitutes round-robin.
    pub(crate) fn set_scheduler(&mut self, new_sched: Option<Box<dyn Scheduler>>) {
        let mut new_sched = new_sched.unwrap_or_else(|| Box::new(RoundRobin::new()));
        new_sched.init();

        if let Some(mut old) = self.scheduler.take() {
            while let Some(tid) = old.next() {
                let live_non_system = self
                    .get(tid)
                    .is_some_and(|rec| !rec.status.is_terminated() && !rec.is_system);
                if live_non_system {
                    new_sched.admit(tid);
                }
            }
            old.shutdown();
        }

        self.scheduler = Some(new_sched);
    }

    pub(crate) fn terminated_pop(&mut self) -> Option<Tid> {
        self.terminated.pop_front()
    }

    pub(crate) fn terminated_push(&mut self, tid: Tid) {
        self.terminated.push_back(tid);
    }

    pub(crate) fn terminated_is_empty(&self) -> bool {
        self.terminated.is_empty()
    }

    pub(crate) fn waiters_pop(&mut self) -> Option<Tid> {
        self.waiters.pop_front()
    }

    pub(crate) fn waiters_push(&mut self, tid: Tid) {
        self.waiters.push_back(tid);
    }

    pub(crate) fn mark_terminated(&mut self, tid: Tid, code: u8) {
        if let Some(rec) = self.get_mut(tid) {
            rec.status = Status::terminated(code);
        }
    }
}
