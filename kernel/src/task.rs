//! Cooperative task core: a fixed arena of task records threaded into one
//! circular, doubly-linked FIFO run queue. Nothing here ever runs a task
//! uninvited — the queue only advances when a task exits, execs, or faults
//! fatally; the timer IRQ ticks a counter and EOIs, nothing more.

use core::sync::atomic::{AtomicU64, Ordering};

pub const MAX_TASKS: usize = 16;
pub const NONE: usize = usize::MAX;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskState {
    Free,
    Runnable,
    Zombie,
}

#[derive(Copy, Clone)]
struct Task {
    state: TaskState,
    process: usize,
    /// Saved kernel-stack pointer; on the first switch into a task this
    /// points at a frame built by the loader, afterwards at wherever the
    /// trap trampoline left it.
    tf_rsp: u64,
    cr3: u64,
    /// Top of this task's dedicated kernel stack. Installed into the TSS's
    /// `rsp0` every time this task becomes current, so the next ring3->ring0
    /// transition it takes builds its trap frame on its own stack rather
    /// than whatever the previously-running task left `rsp0` pointing at.
    kstack_top: u64,
    next: usize,
    prev: usize,
}

const EMPTY_TASK: Task = Task {
    state: TaskState::Free,
    process: NONE,
    tf_rsp: 0,
    cr3: 0,
    kstack_top: 0,
    next: NONE,
    prev: NONE,
};

struct RunQueue {
    tasks: [Task; MAX_TASKS],
    head: usize,
    tail: usize,
    current: usize,
}

static mut QUEUE: RunQueue = RunQueue {
    tasks: [EMPTY_TASK; MAX_TASKS],
    head: NONE,
    tail: NONE,
    current: NONE,
};

/// Read by the trap-return trampoline after a switch decides a new task is
/// current; set only from within `switch_from`/`spawn_first`.
#[no_mangle]
pub static MANTRA_NEXT_CR3: AtomicU64 = AtomicU64::new(0);

fn q() -> &'static mut RunQueue {
    unsafe { &mut *core::ptr::addr_of_mut!(QUEUE) }
}

fn alloc_slot() -> Option<usize> {
    let q = q();
    for i in 0..MAX_TASKS {
        if q.tasks[i].state == TaskState::Free {
            return Some(i);
        }
    }
    None
}

fn enqueue_tail(idx: usize) {
    let q = q();
    if q.head == NONE {
        q.tasks[idx].next = idx;
        q.tasks[idx].prev = idx;
        q.head = idx;
        q.tail = idx;
    } else {
        let head = q.head;
        let tail = q.tail;
        q.tasks[tail].next = idx;
        q.tasks[idx].prev = tail;
        q.tasks[idx].next = head;
        q.tasks[head].prev = idx;
        q.tail = idx;
    }
}

/// Unlinks `idx` from the ring. Safe to call on the last remaining task.
fn unlink(idx: usize) {
    let q = q();
    let next = q.tasks[idx].next;
    let prev = q.tasks[idx].prev;
    if next == idx {
        q.head = NONE;
        q.tail = NONE;
    } else {
        q.tasks[prev].next = next;
        q.tasks[next].prev = prev;
        if q.head == idx {
            q.head = next;
        }
        if q.tail == idx {
            q.tail = prev;
        }
    }
    q.tasks[idx].next = NONE;
    q.tasks[idx].prev = NONE;
}

/// Creates a new runnable task bound to `process`, appended at the tail of
/// the run queue.
pub fn spawn(process: usize, cr3: u64, tf_rsp: u64, kstack_top: u64) -> Option<usize> {
    let idx = alloc_slot()?;
    {
        let q = q();
        q.tasks[idx] = Task {
            state: TaskState::Runnable,
            process,
            tf_rsp,
            cr3,
            kstack_top,
            next: NONE,
            prev: NONE,
        };
    }
    enqueue_tail(idx);
    Some(idx)
}

/// Installs `idx` as the only and current task, without touching the ring
/// (used once at boot for the first task).
pub fn install_first(idx: usize) {
    let q = q();
    q.current = idx;
    MANTRA_NEXT_CR3.store(q.tasks[idx].cr3, Ordering::Release);
    crate::arch::x86_64::gdt::set_rsp0(q.tasks[idx].kstack_top);
}

/// Jumps into `current`'s saved frame, never to return. Used exactly once,
/// right after the first call to `install_first`.
pub fn enter_first() -> ! {
    let idx = current().expect("enter_first: no current task installed");
    let q = q();
    let tf_rsp = q.tasks[idx].tf_rsp;
    let cr3 = q.tasks[idx].cr3;
    unsafe {
        core::arch::asm!(
            "mov cr3, {cr3}",
            "mov rsp, {tf_rsp}",
            "jmp {entry}",
            cr3 = in(reg) cr3,
            tf_rsp = in(reg) tf_rsp,
            entry = in(reg) (crate::arch::x86_64::isr::mantra_trap_return as *const () as usize),
            options(noreturn)
        );
    }
}

pub fn current() -> Option<usize> {
    let c = q().current;
    if c == NONE {
        None
    } else {
        Some(c)
    }
}

pub fn current_process() -> Option<usize> {
    current().map(|idx| q().tasks[idx].process)
}

pub fn has_other_runnable() -> bool {
    let q = q();
    if q.current == NONE {
        return q.head != NONE;
    }
    let mut n = q.tasks[q.current].next;
    while n != q.current {
        if q.tasks[n].state == TaskState::Runnable {
            return true;
        }
        n = q.tasks[n].next;
    }
    false
}

/// Saves the outgoing task's `tf_rsp`, marks it `next_state`, and advances
/// `current` to the next runnable task in ring order. Returns the incoming
/// task's `(tf_rsp, cr3)`, or `None` if no other task is runnable (caller
/// should idle).
pub fn switch_from(outgoing_tf_rsp: u64, next_state: TaskState) -> Option<(u64, u64)> {
    let q = q();
    let out = q.current;
    if out != NONE {
        q.tasks[out].tf_rsp = outgoing_tf_rsp;
        q.tasks[out].state = next_state;
        if next_state != TaskState::Runnable {
            unlink(out);
        }
    }

    let start = if out != NONE && q.tasks[out].state == TaskState::Runnable {
        q.tasks[out].next
    } else {
        q.head
    };
    if start == NONE {
        q.current = NONE;
        return None;
    }

    let mut idx = start;
    loop {
        if q.tasks[idx].state == TaskState::Runnable {
            q.current = idx;
            MANTRA_NEXT_CR3.store(q.tasks[idx].cr3, Ordering::Release);
            crate::arch::x86_64::gdt::set_rsp0(q.tasks[idx].kstack_top);
            return Some((q.tasks[idx].tf_rsp, q.tasks[idx].cr3));
        }
        idx = q.tasks[idx].next;
        if idx == start {
            q.current = NONE;
            return None;
        }
    }
}

/// Frees a zombie task's arena slot once its exit status has been observed.
pub fn reap(idx: usize) {
    let q = q();
    q.tasks[idx].state = TaskState::Free;
    q.tasks[idx].process = NONE;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        let q = q();
        q.tasks = [EMPTY_TASK; MAX_TASKS];
        q.head = NONE;
        q.tail = NONE;
        q.current = NONE;
    }

    #[test_case]
    fn spawn_and_install_first_makes_it_current() {
        reset();
        let a = spawn(0, 0x1000, 0x2000, 0x9000).expect("slot");
        install_first(a);
        assert_eq!(current(), Some(a));
    }

    #[test_case]
    fn switch_from_round_robins_two_tasks() {
        reset();
        let a = spawn(0, 0x1000, 0x2000, 0x9000).expect("slot a");
        let b = spawn(1, 0x3000, 0x4000, 0xa000).expect("slot b");
        install_first(a);

        let (rsp, cr3) = switch_from(0xdead, TaskState::Runnable).expect("switch to b");
        assert_eq!(cr3, 0x3000);
        assert_eq!(rsp, 0x4000);
        assert_eq!(current(), Some(b));

        let (rsp2, cr3_2) = switch_from(0xbeef, TaskState::Runnable).expect("switch back to a");
        assert_eq!(cr3_2, 0x1000);
        assert_eq!(rsp2, 0xdead);
        assert_eq!(current(), Some(a));
    }

    #[test_case]
    fn switch_from_zombie_removes_task_from_ring() {
        reset();
        let a = spawn(0, 0x1000, 0x2000, 0x9000).expect("slot a");
        let b = spawn(1, 0x3000, 0x4000, 0xa000).expect("slot b");
        install_first(a);

        let (_, cr3) = switch_from(0xdead, TaskState::Zombie).expect("switch to b");
        assert_eq!(cr3, 0x3000);
        assert!(!has_other_runnable());
    }

    #[test_case]
    fn switch_from_last_task_returns_none() {
        reset();
        let a = spawn(0, 0x1000, 0x2000, 0x9000).expect("slot a");
        install_first(a);
        assert_eq!(switch_from(0xdead, TaskState::Zombie), None);
        assert_eq!(current(), None);
    }
}
