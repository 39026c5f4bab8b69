// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `create` / `exit` / `yield_now` / `start` / `wait` and the scheduler
//! accessors: the public lifecycle surface.

use log::{debug, trace, warn};

use crate::context;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::stack::{self, Stack};
use crate::tid::{Status, Tid};

/// A read-only snapshot of a thread record, returned by [`tid2thread`].
///
/// The original hands out a raw pointer to the live record; a safe Rust API
/// cannot, since the record can be reaped (and its memory freed) by any
/// `wait` call the instant this function returns. A small `Copy` snapshot
/// sidesteps the aliasing problem entirely instead of threading a lifetime
/// through the thread-local registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadView {
    pub tid: Tid,
    pub status: Status,
}

/// Creates a new LWP running `f(arg)` on a default-sized stack.
///
/// Returns `Tid::NO_THREAD` if the stack could not be mapped.
pub fn create<F, A>(f: F, arg: A) -> Tid
where
    F: FnOnce(A) -> i32 + 'static,
    A: 'static,
{
    create_with_stack_size(f, arg, stack::DEFAULT_STACK_SIZE)
}

/// As [`create`], but with an explicit stack size (rounded up to at least
/// [`stack::MIN_STACK_SIZE`] and a whole number of pages).
pub fn create_with_stack_size<F, A>(f: F, arg: A, stack_size: usize) -> Tid
where
    F: FnOnce(A) -> i32 + 'static,
    A: 'static,
{
    // Type erasure: `f` and `arg` are boxed together, and the boot frame
    // carries only two plain `usize`s -- a monomorphized function pointer
    // and the boxed thunk's address -- so the shared, non-generic
    // `trampoline` never needs to know `F` or `A`.
    struct Thunk<F, A> {
        f: F,
        arg: A,
    }

    unsafe fn call_and_drop<F, A>(thunk: usize) -> i32
    where
        F: FnOnce(A) -> i32 + 'static,
        A: 'static,
    {
        // Safety: `thunk` is always a pointer produced by `Box::into_raw`
        // below, handed to us exactly once by `trampoline`.
        let thunk = unsafe { Box::from_raw(thunk as *mut Thunk<F, A>) };
        (thunk.f)(thunk.arg)
    }

    let thunk = Box::into_raw(Box::new(Thunk { f, arg })) as usize;
    let call_fn = call_and_drop::<F, A> as usize;

    let stack = match Stack::new(stack_size) {
        Ok(stack) => stack,
        Err(err) => {
            warn!("failed to map lwp stack: {err}");
            // Safety: `thunk` was boxed just above and has not been handed
            // to any trampoline, so reclaiming it here is the only way `F`
            // and `A` ever get dropped.
            drop(unsafe { Box::from_raw(thunk as *mut Thunk<F, A>) });
            return Tid::NO_THREAD;
        }
    };

    let top = stack.top();
    // Safety: `top` is one past the end of `stack`'s writable region, which
    // is at least `stack::MIN_STACK_SIZE` bytes.
    let regs = unsafe { context::init_stack(top, call_fn, thunk) };

    let tid = Registry::with(|r| r.insert_worker(stack, regs));
    Registry::with(|r| r.scheduler().admit(tid));
    debug!("created thread {tid}");
    tid
}

/// The architecture-independent half of the boot trampoline: invokes the
/// worker and routes its return value through [`exit`]. Never returns.
///
/// # Safety
///
/// Must only ever be reached via a context switch into a register file
/// produced by [`context::init_stack`]; `f` must be a `call_and_drop::<F,
/// A>` function pointer and `arg` the matching boxed thunk.
pub(crate) unsafe extern "C" fn trampoline(f: usize, arg: usize) -> ! {
    // Safety: forwarded from the caller's obligations above.
    let call: unsafe fn(usize) -> i32 = unsafe { core::mem::transmute(f) };
    let code = unsafe { call(arg) };
    exit(code)
}

/// The current LWP's identity, or `Tid::NO_THREAD` if called before
/// [`start`].
#[must_use]
pub fn gettid() -> Tid {
    Registry::with(|r| r.current())
}

/// The single cooperative suspension point.
///
/// A worker re-admits itself to the scheduler (if still live) and bounces
/// to the system thread. The system thread instead pulls the next ready
/// worker from the scheduler and switches into it, or returns immediately
/// if none is ready.
pub fn yield_now() {
    debug_assert!(
        Registry::with(|r| r.is_started()),
        "yield_now called before start()"
    );

    let me = Registry::with(|r| r.current());
    let system = Registry::with(|r| r.system_tid());

    if me == system {
        let next = Registry::with(|r| r.scheduler().next());
        if let Some(target) = next {
            switch_to(target);
        }
    } else {
        Registry::with(|r| {
            let still_live = r
                .get(me)
                .is_some_and(|rec| !rec.status.is_terminated());
            if still_live {
                r.scheduler().admit(me);
            }
        });
        switch_to(system);
    }
}

/// Terminates the current LWP with the low 8 bits of `code`. Never returns.
///
/// Calling `exit` with no current thread, or from the system thread itself,
/// terminates the whole process instead -- both are programming errors the
/// original treats the same way.
pub fn exit(code: i32) -> ! {
    debug_assert!(
        Registry::with(|r| r.is_started()),
        "exit called before start()"
    );

    let masked = (code & 0xFF) as u8;
    let me = Registry::with(|r| r.current());
    let system = Registry::with(|r| r.system_tid());

    if me.is_none() || me == system {
        std::process::exit(i32::from(masked));
    }

    debug!("thread {me} exiting with code {masked}");

    Registry::with(|r| {
        r.mark_terminated(me, masked);
        r.scheduler().remove(me);

        if let Some(waiter) = r.waiters_pop() {
            if let Some(rec) = r.get_mut(waiter) {
                rec.rendezvous = Some(me);
            }
            r.scheduler().admit(waiter);
        } else {
            r.terminated_push(me);
        }
    });

    switch_to(system);
    unreachable!("exit: control returned to a terminated thread")
}

/// Reaps one terminated LWP, oldest-first, writing its status to
/// `out_status` if given.
///
/// Returns `Tid::NO_THREAD` once nothing is running and nothing remains to
/// reap. Blocks (yielding to the system thread) if workers are still
/// runnable but none have terminated yet.
pub fn wait(out_status: Option<&mut Status>) -> Tid {
    debug_assert!(
        Registry::with(|r| r.is_started()),
        "wait called before start()"
    );

    let mut out_status = out_status;
    loop {
        if let Some(tid) = Registry::with(|r| r.terminated_pop()) {
            return finish_reap(tid, out_status);
        }

        let (qlen, term_empty) =
            Registry::with(|r| (r.scheduler().qlen(), r.terminated_is_empty()));
        if qlen == 0 && term_empty {
            return Tid::NO_THREAD;
        }

        let me = Registry::with(|r| r.current());
        Registry::with(|r| {
            r.scheduler().remove(me);
            r.waiters_push(me);
        });

        let system = Registry::with(|r| r.system_tid());
        switch_to(system);

        let rendezvous = Registry::with(|r| r.get_mut(me).and_then(|rec| rec.rendezvous.take()));
        if let Some(tid) = rendezvous {
            return finish_reap(tid, out_status.take());
        }
        // Rendezvous slot unset: a spurious wake. Loop and re-check.
    }
}

fn finish_reap(tid: Tid, out_status: Option<&mut Status>) -> Tid {
    let record = Registry::with(|r| r.take(tid)).expect("finish_reap: tid missing from arena");

    if let Some(slot) = out_status {
        *slot = record.status;
    }

    debug!("reaped thread {tid}");

    if !record.is_system {
        if let Some(stack) = record.stack {
            // Safety: the record has just been removed from the arena and
            // is terminated, so this stack is no longer any context's
            // active stack.
            unsafe { stack.unmap() };
        }
    }

    tid
}

/// Installs `s` as the active scheduler, draining the current one's ready
/// set into it first (preserving the drained order). `None` substitutes the
/// round-robin default.
pub fn set_scheduler(s: Option<Box<dyn Scheduler>>) {
    Registry::with(|r| r.set_scheduler(s));

    // Only re-yield if we're the system thread idling post-`start()`; before
    // `start()` has run, `current()`/`system_tid()` are both `Tid::NO_THREAD`
    // and would otherwise make this spuriously true.
    let idling_system = Registry::with(|r| r.is_started() && r.current() == r.system_tid());
    if idling_system {
        yield_now();
    }
}

/// Runs `f` against the active scheduler, lazily installing the
/// round-robin default first if none is set.
///
/// A guard closure stands in for the `&'static mut dyn Scheduler` the
/// distilled interface names: the scheduler lives behind a thread-local
/// `RefCell`, so handing out a bare `'static` reference would not be sound.
pub fn get_scheduler<R>(f: impl FnOnce(&mut dyn Scheduler) -> R) -> R {
    Registry::with(|r| f(r.scheduler()))
}

/// Starts hosting LWPs on the calling OS thread. Re-entrant: a second call
/// is a silent no-op.
///
/// Captures the caller as the *system thread* and drives the scheduler,
/// switching into ready workers one at a time, until none remain ready.
pub fn start() {
    if Registry::with(|r| r.is_started()) {
        return;
    }

    let system = Registry::with(|r| {
        r.scheduler();
        r.insert_system()
    });

    debug!("system thread {system} starting");

    let old_ptr = Registry::with(|r| r.regs_ptr(system));
    // Safety: `old_ptr` points at the freshly inserted system record's
    // register file, valid and exclusively ours until the next switch.
    unsafe { context::save_only(old_ptr) };

    loop {
        let qlen = Registry::with(|r| r.scheduler().qlen());
        if qlen == 0 {
            break;
        }
        yield_now();
    }

    debug!("system thread {system} returning, all lwps terminated");
}

/// Looks up a thread's current snapshot, or `None` if `tid` is unknown
/// (never created, or already reaped).
#[must_use]
pub fn tid2thread(tid: Tid) -> Option<ThreadView> {
    Registry::with(|r| {
        r.get(tid).map(|rec| ThreadView {
            tid: rec.tid,
            status: rec.status,
        })
    })
}

fn switch_to(target: Tid) {
    let me = Registry::with(|r| r.current());
    let (old_ptr, new_ptr) = Registry::with(|r| {
        r.set_current(target);
        let old = r.regs_ptr(me);
        let new = r.regs_ptr(target).cast_const();
        (old, new)
    });

    trace!("context switch {me} -> {target}");

    // Safety: `me` and `target` are both live registry entries (`regs_ptr`
    // panics otherwise), and no `RefCell` borrow from the block above is
    // held across this call.
    unsafe { context::swap(old_ptr, new_ptr) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_distinct_and_increasing() {
        let a = create(|_: ()| 0, ());
        let b = create(|_: ()| 0, ());
        let c = create(|_: ()| 0, ());

        assert_ne!(a, Tid::NO_THREAD);
        assert_ne!(b, Tid::NO_THREAD);
        assert_ne!(c, Tid::NO_THREAD);
        assert!(a < b && b < c);

        start();
        let mut status = Status::LIVE;
        while wait(Some(&mut status)) != Tid::NO_THREAD {}
    }

    #[test]
    fn gettid_is_no_thread_before_start() {
        assert_eq!(gettid(), Tid::NO_THREAD);
    }
}
