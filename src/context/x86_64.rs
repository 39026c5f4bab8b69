// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86-64 register file layout and context swap.
//!
//! The boot frame is built so that `context_swap`'s restore half, which
//! always ends in `leave; ret`, lands in [`crate::lifecycle::trampoline`]
//! with the stack aligned the way a normal function call would leave it.
//! See the diagram on [`init_stack`].

use core::mem::offset_of;

pub const STACK_ALIGNMENT: usize = 16;

/// fxsave/fxrstor legacy save area: 512 bytes, must be 16-byte aligned.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuArea(pub [u8; 512]);

/// The sixteen architecturally-visible general purpose registers plus the
/// FPU/SSE save area. Field order matches the `rfile` layout this crate is
/// grounded on; only `fpu`'s offset is load-bearing (it must be a multiple
/// of 16 for `fxsave`/`fxrstor`).
#[repr(C)]
pub struct RegisterFile {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub fpu: FpuArea,
}

static_assertions::const_assert_eq!(offset_of!(RegisterFile, fpu) % 16, 0);

const OFF_RAX: usize = offset_of!(RegisterFile, rax);
const OFF_RBX: usize = offset_of!(RegisterFile, rbx);
const OFF_RCX: usize = offset_of!(RegisterFile, rcx);
const OFF_RDX: usize = offset_of!(RegisterFile, rdx);
const OFF_RSI: usize = offset_of!(RegisterFile, rsi);
const OFF_RDI: usize = offset_of!(RegisterFile, rdi);
const OFF_RBP: usize = offset_of!(RegisterFile, rbp);
const OFF_RSP: usize = offset_of!(RegisterFile, rsp);
const OFF_R8: usize = offset_of!(RegisterFile, r8);
const OFF_R9: usize = offset_of!(RegisterFile, r9);
const OFF_R10: usize = offset_of!(RegisterFile, r10);
const OFF_R11: usize = offset_of!(RegisterFile, r11);
const OFF_R12: usize = offset_of!(RegisterFile, r12);
const OFF_R13: usize = offset_of!(RegisterFile, r13);
const OFF_R14: usize = offset_of!(RegisterFile, r14);
const OFF_R15: usize = offset_of!(RegisterFile, r15);
const OFF_FPU: usize = offset_of!(RegisterFile, fpu);

impl RegisterFile {
    pub(crate) fn blank() -> Self {
        // Safety: an all-zero bit pattern is valid for sixteen u64 fields
        // and a 512-byte fxsave area.
        unsafe { core::mem::zeroed() }
    }
}

/// # Safety
///
/// Must be called exactly once per process before any thread is created.
pub(crate) unsafe fn capture_fpu_init() -> FpuArea {
    let mut area = FpuArea([0u8; 512]);
    // Safety: `fninit` takes no memory operands; `fxsave` writes exactly
    // the 512-byte area we just allocated, which is 16-byte aligned.
    unsafe {
        core::arch::asm!("fninit", options(nostack, nomem, preserves_flags));
        core::arch::asm!("fxsave [{0}]", in(reg) area.0.as_mut_ptr(), options(nostack));
    }
    area
}

/// Builds the boot frame for a freshly allocated stack.
///
/// ```text
///            top  ----------------------------
///                 |           ...            |
///     frame + 8   | trampoline address       |  <- consumed by `ret`
///     frame + 0   | 0  (sentinel old rbp)     |  <- consumed by `pop rbp`
///                 ----------------------------  <- rbp == rsp == frame
/// ```
///
/// `frame` is the highest 16-byte-aligned address at or below `top - 24`,
/// plus 8 — chosen so that after `leave; ret` the stack pointer lands at
/// `frame + 16 ≡ 8 (mod 16)`, matching what the SysV ABI requires on entry
/// to [`crate::lifecycle::trampoline`].
///
/// # Safety
///
/// `stack_top` must be the top (highest address, one past the end) of a
/// writable region of at least 24 bytes.
pub unsafe fn init_stack(stack_top: usize, f: usize, arg: usize) -> RegisterFile {
    let mut rf = RegisterFile::blank();

    let aligned = (stack_top - 24) & !(STACK_ALIGNMENT - 1);
    let frame = aligned + 8;

    // Safety: `frame` and `frame + 8` fall within the caller-guaranteed
    // writable region below `stack_top`.
    unsafe {
        *(frame as *mut u64) = 0;
        *((frame + 8) as *mut u64) = crate::lifecycle::trampoline as usize as u64;
    }

    // The SysV ABI passes the first two integer arguments in rdi/rsi, which
    // is exactly where `boot_trampoline` (and, underneath it,
    // `crate::lifecycle::trampoline`) expects to find them.
    rf.rdi = f as u64;
    rf.rsi = arg as u64;
    rf.rbp = frame as u64;
    rf.rsp = frame as u64;
    rf.fpu = super::fpu_init();

    rf
}

/// Saves the active register file into `old` and, unless `new` is null,
/// loads `new` and transfers control there.
///
/// # Safety
///
/// See [`super::swap`] and [`super::save_only`].
#[unsafe(naked)]
pub unsafe extern "C" fn context_swap(_old: *mut RegisterFile, _new: *const RegisterFile) {
    core::arch::naked_asm!(
        // Build a standard frame so that, on resume, `leave; ret` undoes
        // exactly this prologue -- whether "resume" means returning here
        // normally or landing in a synthesized boot frame.
        "push rbp",
        "mov rbp, rsp",

        "mov [rdi + {off_rax}], rax",
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_rcx}], rcx",
        "mov [rdi + {off_rdx}], rdx",
        "mov [rdi + {off_rsi}], rsi",
        "mov [rdi + {off_rdi}], rdi",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",
        "mov [rdi + {off_r8}],  r8",
        "mov [rdi + {off_r9}],  r9",
        "mov [rdi + {off_r10}], r10",
        "mov [rdi + {off_r11}], r11",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "fxsave [rdi + {off_fpu}]",

        // `new == null` means "save only": undo our own prologue and return
        // to the caller like an ordinary function.
        "test rsi, rsi",
        "jnz 2f",
        "pop rbp",
        "ret",

        "2:",
        "mov rax, [rsi + {off_rax}]",
        "mov rbx, [rsi + {off_rbx}]",
        "mov rcx, [rsi + {off_rcx}]",
        "mov rdx, [rsi + {off_rdx}]",
        "mov rdi, [rsi + {off_rdi}]",
        "mov rbp, [rsi + {off_rbp}]",
        "mov r8,  [rsi + {off_r8}]",
        "mov r9,  [rsi + {off_r9}]",
        "mov r10, [rsi + {off_r10}]",
        "mov r11, [rsi + {off_r11}]",
        "mov r12, [rsi + {off_r12}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r15, [rsi + {off_r15}]",
        "fxrstor [rsi + {off_fpu}]",
        // rsp and rsi are restored last: rsp switches us onto the target
        // stack, and rsi is the final read through the (about to be
        // overwritten) `new` pointer.
        "mov rsp, [rsi + {off_rsp}]",
        "mov rsi, [rsi + {off_rsi}]",
        "leave",
        "ret",

        off_rax = const OFF_RAX,
        off_rbx = const OFF_RBX,
        off_rcx = const OFF_RCX,
        off_rdx = const OFF_RDX,
        off_rsi = const OFF_RSI,
        off_rdi = const OFF_RDI,
        off_rbp = const OFF_RBP,
        off_rsp = const OFF_RSP,
        off_r8  = const OFF_R8,
        off_r9  = const OFF_R9,
        off_r10 = const OFF_R10,
        off_r11 = const OFF_R11,
        off_r12 = const OFF_R12,
        off_r13 = const OFF_R13,
        off_r14 = const OFF_R14,
        off_r15 = const OFF_R15,
        off_fpu = const OFF_FPU,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_frame_matches_the_precise_contract() {
        let mut buf = [0u8; 128];
        let top = buf.as_mut_ptr() as usize + buf.len();

        // Safety: `top` is the one-past-the-end address of a 128-byte local
        // array, far more than the 24 bytes `init_stack` needs.
        let rf = unsafe { init_stack(top, 0xAAAA_AAAA, 0xDEAD_BEEF) };

        assert_eq!(rf.rdi, 0xAAAA_AAAA, "f is threaded through rdi");
        assert_eq!(rf.rsi, 0xDEAD_BEEF, "arg is threaded through rsi");
        assert_eq!(rf.rbp, rf.rsp, "frame is both the saved bp and sp");
        // The precise contract offsets `frame` by 8 from a 16-aligned
        // address, not to 16-aligned itself: `leave; ret` consumes 16 bytes
        // total, landing `trampoline` at `frame + 16 ≡ frame (mod 16)`.
        assert_eq!(rf.rsp % 16, 8);

        let frame = rf.rsp as *const u64;
        // Safety: `frame` and `frame + 8` fall within `buf`.
        unsafe {
            assert_eq!(*frame, 0, "sentinel old base pointer");
            assert_ne!(*frame.add(1), 0, "trampoline address");
        }
    }
}
