//! The nine commands user programs may issue over `int 0x80`. Registered
//! into `crate::interrupts`'s command table once at boot; see
//! `mantra_sys::syscall` for the shared id constants both sides compile
//! against.

use crate::arch::x86_64::isr::TrapFrame;
use crate::arch::x86_64::paging::{self, Directory};
use crate::error::to_user_errno;
use crate::error::KernelError;
use crate::{keyboard, loader, process, task};
use mantra_sys::syscall as id;

const MAX_STRING: usize = 256;

fn current_dir() -> Directory {
    Directory::from_existing(paging::current_pml4())
}

fn read_byte(dir: &Directory, addr: u64) -> Option<u8> {
    let phys = dir.translate(addr).ok()?;
    Some(unsafe { core::ptr::read_volatile(paging::phys_to_virt_ptr::<u8>(phys)) })
}

fn write_byte(dir: &Directory, addr: u64, value: u8) -> Option<()> {
    let phys = dir.translate(addr).ok()?;
    unsafe { core::ptr::write_volatile(paging::phys_to_virt_ptr::<u8>(phys), value) };
    Some(())
}

/// Reads a NUL-terminated string out of user memory, up to `MAX_STRING`
/// bytes. `None` if any byte along the way is unmapped.
fn read_cstr(dir: &Directory, ptr: u64) -> Option<([u8; MAX_STRING], usize)> {
    let mut buf = [0u8; MAX_STRING];
    for i in 0..MAX_STRING {
        let b = read_byte(dir, ptr + i as u64)?;
        if b == 0 {
            return Some((buf, i));
        }
        buf[i] = b;
    }
    Some((buf, MAX_STRING))
}

fn fail(tf: &mut TrapFrame, err: KernelError) -> u64 {
    tf.rax = to_user_errno(err) as u64;
    0
}

fn sys_print(tf: &mut TrapFrame) -> u64 {
    let dir = current_dir();
    let Some((buf, len)) = read_cstr(&dir, tf.rdi) else {
        return fail(tf, KernelError::InvalidArgument);
    };
    for &b in &buf[..len] {
        crate::fb::write_byte(b);
        crate::serial::write_byte(b);
    }
    tf.rax = 0;
    0
}

fn sys_getkey(tf: &mut TrapFrame) -> u64 {
    // Busy-wait: cooperative scheduling means we can't block this task
    // without another one to run, and the catalogue promises a scancode,
    // not an error, on return.
    loop {
        if let Some(k) = keyboard::pop() {
            tf.rax = k as u64;
            return 0;
        }
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

fn sys_putchar(tf: &mut TrapFrame) -> u64 {
    let b = tf.rdi as u8;
    crate::fb::write_byte(b);
    crate::serial::write_byte(b);
    tf.rax = 0;
    0
}

fn sys_malloc(tf: &mut TrapFrame) -> u64 {
    let Some(proc_idx) = task::current_process() else {
        return fail(tf, KernelError::NotFound);
    };
    let mut dir = current_dir();
    tf.rax = process::process_malloc(proc_idx, &mut dir, tf.rdi);
    0
}

fn sys_free(tf: &mut TrapFrame) -> u64 {
    let Some(proc_idx) = task::current_process() else {
        return fail(tf, KernelError::NotFound);
    };
    let mut dir = current_dir();
    process::process_free(proc_idx, &mut dir, tf.rdi);
    tf.rax = 0;
    0
}

/// Loads `argv[0]` as a new process and switches to it immediately,
/// leaving the caller enqueued to resume once the run queue comes back
/// around to it. There is no synchronous wait: the catalogue's `status`
/// return is the spawned task's arena index, not an exit code.
fn sys_exec(tf: &mut TrapFrame) -> u64 {
    let dir = current_dir();
    let Some((argv0, len)) = read_cstr(&dir, tf.rdi) else {
        return fail(tf, KernelError::InvalidArgument);
    };

    match loader::spawn_by_path(&argv0[..len]) {
        Ok((_proc_idx, _task_idx)) => match task::switch_from(tf as *mut _ as u64, task::TaskState::Runnable) {
            Some((next_rsp, _cr3)) => next_rsp,
            None => {
                tf.rax = 0;
                0
            }
        },
        Err(e) => fail(tf, e),
    }
}

fn sys_argv(tf: &mut TrapFrame) -> u64 {
    let Some(proc_idx) = task::current_process() else {
        return fail(tf, KernelError::NotFound);
    };
    let argv = process::argv_of(proc_idx);
    let dir = current_dir();
    let out_ptr = tf.rdi;
    let out_len = (tf.rsi as usize).min(argv.len());
    for i in 0..out_len {
        if write_byte(&dir, out_ptr + i as u64, argv[i]).is_none() {
            return fail(tf, KernelError::InvalidArgument);
        }
    }
    tf.rax = out_len as u64;
    0
}

fn sys_exit(tf: &mut TrapFrame) -> u64 {
    let code = tf.rdi as i64;
    if let Some(proc_idx) = task::current_process() {
        process::set_exit_code(proc_idx, code);
        let pml4 = process::pml4_of(proc_idx);
        process::terminate(proc_idx, Directory::from_existing(pml4));
    }
    if let Some(task_idx) = task::current() {
        task::reap(task_idx);
    }
    match task::switch_from(0, task::TaskState::Zombie) {
        Some((next_rsp, _cr3)) => next_rsp,
        None => unsafe { core::arch::asm!("cli", "2:", "hlt", "jmp 2b", options(noreturn)) },
    }
}

fn sys_sum(tf: &mut TrapFrame) -> u64 {
    tf.rax = tf.rdi.wrapping_add(tf.rsi);
    0
}

/// Registers every command in the catalogue. Call once during boot.
pub fn init() {
    crate::interrupts::register_syscall(id::PRINT, sys_print);
    crate::interrupts::register_syscall(id::GETKEY, sys_getkey);
    crate::interrupts::register_syscall(id::PUTCHAR, sys_putchar);
    crate::interrupts::register_syscall(id::MALLOC, sys_malloc);
    crate::interrupts::register_syscall(id::FREE, sys_free);
    crate::interrupts::register_syscall(id::EXEC, sys_exec);
    crate::interrupts::register_syscall(id::ARGV, sys_argv);
    crate::interrupts::register_syscall(id::EXIT, sys_exit);
    crate::interrupts::register_syscall(id::SUM, sys_sum);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_tf() -> TrapFrame {
        unsafe { core::mem::zeroed() }
    }

    #[test_case]
    fn sum_adds_its_two_arguments() {
        let mut tf = blank_tf();
        tf.rdi = 2;
        tf.rsi = 40;
        sys_sum(&mut tf);
        assert_eq!(tf.rax, 42);
    }
}
