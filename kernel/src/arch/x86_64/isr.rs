//! Trap entry/exit. Every vector the kernel installs gets its own tiny
//! stub (see the `stub!` invocations below) rather than one generic
//! dispatcher indexed by vector at runtime — the level of indirection the
//! callback registry in `crate::interrupts` already provides is enough;
//! duplicating it again inside the trap path would just cost cycles on
//! every interrupt. All stubs funnel into the same two backends: one for
//! vectors that carry a CPU-pushed error code, one for those that don't.
//! Both backends save every GPR (so a task switch can resume into any of
//! them later), hand a `&mut TrapFrame` to Rust, and — if the Rust side
//! decided a different task should run next — swap `rsp`/`cr3` before the
//! shared `iretq` tail.

use core::arch::global_asm;

use super::pic;
use crate::interrupts;

/// GPRs in push order, followed by the CPU-pushed frame (and, for the
/// vectors that have one, the error code just below it). Used for every
/// trap, interrupt, and syscall: whichever task's `rsp` points into one of
/// these is where it'll resume.
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub vector: u64,
    pub error_code: u64,

    // CPU-pushed frame (ring3 -> ring0, or ring0 re-entrant): RIP, CS,
    // RFLAGS, RSP, SS.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

extern "C" {
    pub fn mantra_trap_return() -> !;
}

global_asm!(
    r#"
.intel_syntax noprefix
.global mantra_trap_return
.type mantra_trap_return, @function
mantra_trap_return:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rsi
    pop rdi
    pop rbp
    pop rdx
    pop rcx
    pop rbx
    pop rax
    // Drop the vector/error_code pair pushed by the stub.
    add rsp, 16
    iretq

.global mantra_common_entry
.type mantra_common_entry, @function
mantra_common_entry:
    push rax
    push rbx
    push rcx
    push rdx
    push rbp
    push rdi
    push rsi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, rsp
    mov rbx, rsp
    and rsp, -16
    call mantra_dispatch_rust
    mov rsp, rbx

    test rax, rax
    jz 1f
    mov rsp, rax
    mov rcx, qword ptr [rip + MANTRA_NEXT_CR3]
    mov cr3, rcx
1:
    jmp mantra_trap_return
.att_syntax
"#
);

/// Emits one tiny stub per vector: push the (possibly synthetic) error
/// code, push the vector number, jump to the shared backend. Each stub is
/// a distinct symbol so the IDT can point straight at it with no runtime
/// vector-to-handler indirection inside the trap path itself.
macro_rules! stub {
    ($name:ident, $vec:expr, err) => {
        global_asm!(concat!(
            ".intel_syntax noprefix\n",
            ".global ", stringify!($name), "\n",
            ".type ", stringify!($name), ", @function\n",
            stringify!($name), ":\n",
            "push ", stringify!($vec), "\n",
            "jmp mantra_common_entry\n",
            ".att_syntax\n"
        ));
    };
    ($name:ident, $vec:expr, noerr) => {
        global_asm!(concat!(
            ".intel_syntax noprefix\n",
            ".global ", stringify!($name), "\n",
            ".type ", stringify!($name), ", @function\n",
            stringify!($name), ":\n",
            "push 0\n",
            "push ", stringify!($vec), "\n",
            "jmp mantra_common_entry\n",
            ".att_syntax\n"
        ));
    };
}

macro_rules! declare_stubs {
    ($( ($name:ident, $vec:expr, $kind:tt) ),* $(,)?) => {
        $( stub!($name, $vec, $kind); )*
        extern "C" {
            $( pub fn $name(); )*
        }
        pub fn stub_for_vector(vector: u8) -> Option<unsafe extern "C" fn()> {
            match vector {
                $( $vec => Some($name as unsafe extern "C" fn()), )*
                _ => None,
            }
        }
    };
}

declare_stubs!(
    (mantra_stub_00, 0, noerr),
    (mantra_stub_01, 1, noerr),
    (mantra_stub_02, 2, noerr),
    (mantra_stub_03, 3, noerr),
    (mantra_stub_04, 4, noerr),
    (mantra_stub_05, 5, noerr),
    (mantra_stub_06, 6, noerr),
    (mantra_stub_07, 7, noerr),
    (mantra_stub_08, 8, err),
    (mantra_stub_09, 9, noerr),
    (mantra_stub_10, 10, err),
    (mantra_stub_11, 11, err),
    (mantra_stub_12, 12, err),
    (mantra_stub_13, 13, err),
    (mantra_stub_14, 14, err),
    (mantra_stub_15, 15, noerr),
    (mantra_stub_16, 16, noerr),
    (mantra_stub_17, 17, err),
    (mantra_stub_18, 18, noerr),
    (mantra_stub_19, 19, noerr),
    (mantra_stub_20, 20, noerr),
    (mantra_stub_21, 21, err),
    (mantra_stub_22, 22, noerr),
    (mantra_stub_23, 23, noerr),
    (mantra_stub_24, 24, noerr),
    (mantra_stub_25, 25, noerr),
    (mantra_stub_26, 26, noerr),
    (mantra_stub_27, 27, noerr),
    (mantra_stub_28, 28, noerr),
    (mantra_stub_29, 29, err),
    (mantra_stub_30, 30, err),
    (mantra_stub_31, 31, noerr),
    (mantra_stub_32, 32, noerr), // IRQ0: PIT
    (mantra_stub_33, 33, noerr), // IRQ1: keyboard
    (mantra_stub_34, 34, noerr),
    (mantra_stub_35, 35, noerr),
    (mantra_stub_36, 36, noerr),
    (mantra_stub_37, 37, noerr),
    (mantra_stub_38, 38, noerr),
    (mantra_stub_39, 39, noerr),
    (mantra_stub_40, 40, noerr),
    (mantra_stub_41, 41, noerr),
    (mantra_stub_42, 42, noerr),
    (mantra_stub_43, 43, noerr),
    (mantra_stub_44, 44, noerr),
    (mantra_stub_45, 45, noerr),
    (mantra_stub_46, 46, noerr),
    (mantra_stub_47, 47, noerr),
    (mantra_stub_80, 0x80, noerr),
    (mantra_stub_unhandled, 0xff, noerr),
);

/// Single entry point every stub funnels into. Looks the vector up in the
/// callback registry and acts on its tag, then — if the vector is an IRQ —
/// sends end-of-interrupt only after the registry has run, not before.
#[no_mangle]
pub extern "C" fn mantra_dispatch_rust(tf: *mut TrapFrame) -> u64 {
    let tf = unsafe { &mut *tf };
    let vector = tf.vector as u8;

    let ret = interrupts::dispatch(vector, tf);

    if (32..48).contains(&vector) {
        pic::eoi(vector - 32);
    }

    ret
}
