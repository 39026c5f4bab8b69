// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread stack allocation.
//!
//! Mirrors `fiber::stack::unix::DefaultFiberStack`: a guard page followed by
//! a read/write region, obtained from an anonymous `mmap`. Unlike a
//! [`Drop`]-based stack, [`Stack`] is unmapped exactly once, explicitly, by
//! `wait`'s reap -- never implicitly -- matching the data-model invariant
//! that a record's stack is mapped at creation and unmapped exactly once.

use std::io;
use std::mem::ManuallyDrop;
use std::ptr;

use crate::valgrind::ValgrindStackRegistration;

/// Minimum size of a stack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 4096;

/// Default stack size used by [`crate::create`].
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

pub struct Stack {
    base: *mut u8,
    mmap_len: usize,
    valgrind: ManuallyDrop<ValgrindStackRegistration>,
}

impl Stack {
    /// Maps a new stack of at least `size` bytes, rounded up to a page
    /// boundary, with a leading guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let mmap_len = size
            .checked_add(2 * page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // Safety: standard anonymous private mapping, checked below.
        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let out = Self {
                base: mmap.cast(),
                mmap_len,
                valgrind: ManuallyDrop::new(ValgrindStackRegistration::new(
                    mmap.cast(),
                    mmap_len,
                )),
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(mmap, mmap_len);
                return Err(err);
            }

            Ok(out)
        }
    }

    /// The one-past-the-end address of the writable region: where boot
    /// frame synthesis starts laying down its initial stack image.
    #[must_use]
    pub fn top(&self) -> usize {
        self.base as usize + self.mmap_len
    }

    /// Unmaps the stack. Must be called exactly once; this is `wait`'s job,
    /// not `Drop`'s, per the data-model invariant that stacks are unmapped
    /// exactly once, at reap.
    ///
    /// # Safety
    ///
    /// The stack must not still be the active stack of any context.
    pub unsafe fn unmap(self) {
        // Safety: de-registering before unmapping, matching `fiber`'s
        // ordering in `DefaultFiberStack::drop`.
        unsafe {
            drop(ManuallyDrop::into_inner(self.valgrind));
            let ret = libc::munmap(self.base.cast(), self.mmap_len);
            debug_assert_eq!(ret, 0, "munmap of lwp stack failed");
        }
    }
}

fn page_size() -> usize {
    // Safety: `sysconf` with a valid name is always sound.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(page_size.is_power_of_two());
    page_size
}
