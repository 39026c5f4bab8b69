// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The raw context-swap primitive, isolated behind a narrow interface.
//!
//! Everything outside this module treats [`RegisterFile`] and
//! [`context_swap`] as opaque: a fixed-layout register file, and a function
//! that atomically stores the active one and loads another. The only
//! architecture-specific code in the crate lives here and in the `x86_64`/
//! `aarch64` submodules it dispatches to.

use std::sync::OnceLock;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("lwp currently supports only x86_64 and aarch64 targets");
    }
}

static FPU_INIT: OnceLock<FpuArea> = OnceLock::new();

/// The canonical initial FPU/SIMD state copied into every freshly created
/// thread's register file.
///
/// Captured lazily, once per process, by resetting the FPU and saving
/// whatever clean state that produces. Subsequent callers get a cheap copy.
pub fn fpu_init() -> FpuArea {
    *FPU_INIT.get_or_init(|| unsafe { capture_fpu_init() })
}

/// Transfers control from the calling context into `new`, after saving the
/// calling context's register file into `old`.
///
/// # Safety
///
/// `old` must be a valid, writable pointer to a [`RegisterFile`]. `new` must
/// either be null (meaning "save only, then return to the caller") or a
/// valid pointer to a [`RegisterFile`] previously populated by
/// [`init_stack`] or by a prior call to `context_swap` that saved into it.
pub unsafe fn swap(old: *mut RegisterFile, new: *const RegisterFile) {
    // Safety: forwarded to the caller's obligations.
    unsafe { context_swap(old, new) }
}

/// Captures the calling context's register file into `old` without
/// transferring control anywhere; used by `start()` to capture the system
/// thread's context once, up front.
///
/// # Safety
///
/// `old` must be a valid, writable pointer to a [`RegisterFile`].
pub unsafe fn save_only(old: *mut RegisterFile) {
    // Safety: forwarded to the caller's obligations; `new = null` is the
    // documented "save only" signal for `context_swap`.
    unsafe { context_swap(old, std::ptr::null()) }
}
