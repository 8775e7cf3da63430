//! Kernel-level callback registry sitting between the IDT and everything
//! that cares about a vector firing. Every vector is tagged with exactly
//! one of three dispositions; `idt::init` walks the table once at boot and
//! installs a gate for every vector that has one.

use crate::arch::x86_64::isr::TrapFrame;
use crate::{log_error, log_warn, process, task};

pub type Callback = fn(&mut TrapFrame) -> u64;

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum VectorKind {
    /// Nothing to do on this vector; the trap entry still sends EOI for it
    /// afterwards since it's an IRQ (used for IRQs nobody has registered
    /// for yet).
    IgnoreAndEoi,
    /// A CPU exception that this kernel cannot resolve. Ring-3 faults kill
    /// the owning task and reschedule; ring-0 faults are unrecoverable.
    FatalException,
    /// Hand the frame to a registered callback.
    Dispatch,
}

#[derive(Copy, Clone)]
struct Slot {
    kind: VectorKind,
    callback: Option<Callback>,
}

const EMPTY_SLOT: Slot = Slot {
    kind: VectorKind::IgnoreAndEoi,
    callback: None,
};

static mut TABLE: [Slot; 256] = [EMPTY_SLOT; 256];

fn table() -> &'static mut [Slot; 256] {
    unsafe { &mut *core::ptr::addr_of_mut!(TABLE) }
}

/// Tags `vector` and, for `Dispatch`, installs the callback invoked when it
/// fires. Re-registering a vector replaces its previous entry.
pub fn register_callback(vector: u8, kind: VectorKind, callback: Option<Callback>) {
    table()[vector as usize] = Slot { kind, callback };
}

pub fn kind_of(vector: u8) -> VectorKind {
    table()[vector as usize].kind
}

const MAX_SYSCALLS: usize = 16;
static mut SYSCALL_TABLE: [Option<(u64, fn(&mut TrapFrame) -> u64)>; MAX_SYSCALLS] =
    [None; MAX_SYSCALLS];

fn syscall_table() -> &'static mut [Option<(u64, fn(&mut TrapFrame) -> u64)>; MAX_SYSCALLS] {
    unsafe { &mut *core::ptr::addr_of_mut!(SYSCALL_TABLE) }
}

/// Registers one command of the syscall catalogue (keyed by `rax` on
/// entry). Called once per command during boot. A duplicate `id` is a
/// programming bug, not a runtime condition a caller can recover from, so
/// this panics rather than silently keeping the first registration.
pub fn register_syscall(id: u64, handler: fn(&mut TrapFrame) -> u64) {
    let t = syscall_table();
    if t.iter().flatten().any(|slot| slot.0 == id) {
        panic!("duplicate syscall registration for id {}", id);
    }
    let slot = t
        .iter_mut()
        .find(|s| s.is_none())
        .expect("syscall table full");
    *slot = Some((id, handler));
}

fn dispatch_syscall(tf: &mut TrapFrame) -> u64 {
    let id = tf.rax;
    for slot in syscall_table().iter().flatten() {
        if slot.0 == id {
            return (slot.1)(tf);
        }
    }
    tf.rax = crate::error::to_user_errno(crate::error::KernelError::NotImplemented) as u64;
    0
}

/// Kills the task that triggered a fatal exception and hands control to
/// whatever runs next, or halts if nothing does.
fn kill_current_and_reschedule(vector: u8, tf: &TrapFrame) -> u64 {
    let in_user_mode = tf.cs & 3 == 3;
    if !in_user_mode {
        log_error!(
            "fatal exception {} in ring0 at rip={:#x}, halting",
            vector,
            tf.rip
        );
        unsafe { core::arch::asm!("cli", "2:", "hlt", "jmp 2b", options(noreturn)) };
    }

    log_warn!(
        "task {:?} killed by vector {} at rip={:#x}",
        task::current(),
        vector,
        tf.rip
    );

    if let Some(task_idx) = task::current() {
        if let Some(proc_idx) = task::current_process() {
            let pml4 = process::pml4_of(proc_idx);
            let dir = crate::arch::x86_64::paging::Directory::from_existing(pml4);
            process::terminate(proc_idx, dir);
        }
        task::reap(task_idx);
    }

    match task::switch_from(0, task::TaskState::Zombie) {
        Some((next_rsp, _cr3)) => next_rsp,
        None => {
            log_error!("run queue empty, halting");
            unsafe { core::arch::asm!("cli", "2:", "hlt", "jmp 2b", options(noreturn)) };
        }
    }
}

/// Called by `isr::mantra_dispatch_rust` for every vector before its EOI (if
/// any) is sent.
pub fn dispatch(vector: u8, tf: &mut TrapFrame) -> u64 {
    match kind_of(vector) {
        VectorKind::IgnoreAndEoi => 0,
        VectorKind::FatalException => kill_current_and_reschedule(vector, tf),
        VectorKind::Dispatch => {
            if vector == 0x80 {
                dispatch_syscall(tf)
            } else if let Some(cb) = table()[vector as usize].callback {
                cb(tf)
            } else {
                0
            }
        }
    }
}

/// Ticks the PIT counter. Deliberately does not reschedule: timer-driven
/// preemption is out of scope, the PIT exists only so `pit::ticks()` keeps
/// moving.
pub fn timer_tick(_tf: &mut TrapFrame) -> u64 {
    crate::arch::x86_64::pit::tick();
    0
}
