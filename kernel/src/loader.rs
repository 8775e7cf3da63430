//! Program loader: turns a byte buffer into a runnable task. Two paths
//! exist side by side on purpose (see module docs in `collab`): a real
//! ELF64 loader for when a filesystem produced bytes, and a four-byte raw
//! machine-code fallback for when boot couldn't find one. Which path a
//! given boot takes is intentionally left for `main` to decide, not hidden
//! inside this module.

use crate::arch::x86_64::gdt;
use crate::arch::x86_64::isr::TrapFrame;
use crate::arch::x86_64::paging::{
    Directory, PTE_NO_EXECUTE, PTE_PRESENT, PTE_USER, PTE_WRITABLE,
};
use crate::error::{KResult, KernelError};
use crate::{pmm, process, task};
use alloc::boxed::Box;
use alloc::vec;

const PAGE_SIZE: u64 = 4096;
const KSTACK_SIZE: usize = 16 * 1024;
const USER_STACK_TOP: u64 = 0x0000_0000_2000_0000;
const USER_STACK_PAGES: u64 = 4;
const USER_CODE_FALLBACK_VA: u64 = 0x0000_0000_1000_0000;

fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

fn align_up(x: u64, a: u64) -> u64 {
    (x + (a - 1)) & !(a - 1)
}

#[repr(C)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

/// True when `image` starts with a well-formed, little-endian, x86-64 ELF64
/// header, i.e. it's worth trying [`load_elf`] rather than falling back.
pub fn looks_like_elf(image: &[u8]) -> bool {
    image.len() >= core::mem::size_of::<Elf64Ehdr>()
        && image[0..4] == [0x7f, b'E', b'L', b'F']
        && image[4] == 2 // ELFCLASS64
        && image[5] == 1 // little endian
}

/// Maps every `PT_LOAD` segment of `image` into `dir` and returns the
/// entry point. Validates the header and every program-header offset
/// against `image`'s bounds before touching memory.
pub fn load_elf(dir: &mut Directory, image: &[u8]) -> KResult<u64> {
    if !looks_like_elf(image) {
        return Err(KernelError::BadFormat);
    }
    let eh = unsafe { &*(image.as_ptr() as *const Elf64Ehdr) };
    if eh.e_machine != 0x3e {
        return Err(KernelError::BadFormat);
    }
    if eh.e_phentsize as usize != core::mem::size_of::<Elf64Phdr>() {
        return Err(KernelError::BadFormat);
    }

    let phoff = eh.e_phoff as usize;
    let phnum = eh.e_phnum as usize;
    let phsz = core::mem::size_of::<Elf64Phdr>();
    let phend = phoff
        .checked_add(phnum.checked_mul(phsz).ok_or(KernelError::BadFormat)?)
        .ok_or(KernelError::BadFormat)?;
    if phend > image.len() {
        return Err(KernelError::BadFormat);
    }

    for i in 0..phnum {
        let ph = unsafe { &*(image.as_ptr().add(phoff + i * phsz) as *const Elf64Phdr) };
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let seg_start = align_down(ph.p_vaddr, PAGE_SIZE);
        let seg_end = align_up(ph.p_vaddr.saturating_add(ph.p_memsz), PAGE_SIZE);

        let mut flags = PTE_PRESENT | PTE_USER | PTE_NO_EXECUTE;
        if ph.p_flags & PF_W != 0 {
            flags |= PTE_WRITABLE;
        }

        let mut v = seg_start;
        while v < seg_end {
            let p = pmm::alloc_frame().ok_or(KernelError::OutOfMemory)?;
            dir.map_one(v, p, flags)?;
            v += PAGE_SIZE;
        }

        if ph.p_filesz != 0 {
            let foff = ph.p_offset as usize;
            let fsz = ph.p_filesz as usize;
            let fend = foff.checked_add(fsz).ok_or(KernelError::BadFormat)?;
            if fend > image.len() {
                return Err(KernelError::BadFormat);
            }
            for off in 0..fsz {
                let va = ph.p_vaddr + off as u64;
                let pa = dir.translate(va)?;
                unsafe {
                    *crate::arch::x86_64::paging::phys_to_virt_ptr::<u8>(pa) = image[foff + off];
                }
            }
        }

        if ph.p_memsz > ph.p_filesz {
            for off in ph.p_filesz..ph.p_memsz {
                let va = ph.p_vaddr + off;
                let pa = dir.translate(va)?;
                unsafe {
                    *crate::arch::x86_64::paging::phys_to_virt_ptr::<u8>(pa) = 0;
                }
            }
        }
    }

    Ok(eh.e_entry)
}

/// Maps a fixed two-instruction program (`int 0x80; jmp $`) when no real
/// image is available — used for the degraded "no filesystem found" boot
/// path so the kernel still has something runnable to hand off to.
pub fn load_raw_fallback(dir: &mut Directory) -> KResult<u64> {
    let code_phys = pmm::alloc_frame().ok_or(KernelError::OutOfMemory)?;
    dir.map_one(
        USER_CODE_FALLBACK_VA,
        code_phys,
        PTE_PRESENT | PTE_USER,
    )?;
    let code = [0xCDu8, 0x80, 0xEBu8, 0xFE];
    unsafe {
        let dst = crate::arch::x86_64::paging::phys_to_virt_ptr::<u8>(code_phys);
        core::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
    }
    Ok(USER_CODE_FALLBACK_VA)
}

fn setup_user_stack(dir: &mut Directory) -> KResult<u64> {
    let stack_base = USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE;
    for i in 0..USER_STACK_PAGES {
        let p = pmm::alloc_frame().ok_or(KernelError::OutOfMemory)?;
        dir.map_one(
            stack_base + i * PAGE_SIZE,
            p,
            PTE_PRESENT | PTE_WRITABLE | PTE_USER | PTE_NO_EXECUTE,
        )?;
    }
    // iretq (not `call`) enters userspace, so emulate the post-call %rsp
    // alignment the SysV ABI expects at function entry.
    Ok(USER_STACK_TOP - 8)
}

fn kstack_alloc_top() -> u64 {
    let b: Box<[u8; KSTACK_SIZE]> = Box::new([0; KSTACK_SIZE]);
    Box::into_raw(b) as *mut u8 as u64 + KSTACK_SIZE as u64
}

fn build_initial_tf(kstack_top: u64, entry: u64, user_rsp: u64) -> u64 {
    unsafe {
        let tf_ptr = (kstack_top - core::mem::size_of::<TrapFrame>() as u64) as *mut TrapFrame;
        core::ptr::write_bytes(tf_ptr as *mut u8, 0, core::mem::size_of::<TrapFrame>());
        (*tf_ptr).rip = entry;
        (*tf_ptr).cs = (gdt::UCODE_SEL as u64) | 3;
        (*tf_ptr).rflags = 0x202;
        (*tf_ptr).rsp = user_rsp;
        (*tf_ptr).ss = (gdt::UDATA_SEL as u64) | 3;
        tf_ptr as u64
    }
}

/// Resolves `path` against the registered filesystem (if any) and spawns
/// it; falls back to [`load_raw_fallback`] when no filesystem is
/// registered, the path isn't found, or the bytes don't parse as ELF. This
/// is the one loader entry point driven by a user-supplied path, shared by
/// the boot-time init spawn and the `exec` syscall.
pub fn spawn_by_path(path: &[u8]) -> KResult<(usize, usize)> {
    let path_str = core::str::from_utf8(path).map_err(|_| KernelError::BadPath)?;
    if let Some(fs) = crate::collab::registry().filesystem() {
        if let Ok(len) = fs.file_len(path_str) {
            let mut buf = alloc::vec![0u8; len];
            if fs.read_file(path_str, &mut buf).is_ok() {
                return spawn(path, Some(&buf));
            }
        }
    }
    spawn(path, None)
}

/// Builds a fresh address space, loads `image` into it (or the raw
/// fallback if `image` is `None`), registers a process and a task for it,
/// and returns both arena indices.
pub fn spawn(argv: &[u8], image: Option<&[u8]>) -> KResult<(usize, usize)> {
    let mut dir = Directory::new(PTE_WRITABLE)?;

    let entry = match image {
        Some(bytes) => load_elf(&mut dir, bytes)?,
        None => load_raw_fallback(&mut dir)?,
    };
    let user_rsp = setup_user_stack(&mut dir)?;

    let process_idx = process::create(&dir, argv)?;
    let kstack_top = kstack_alloc_top();
    let tf_rsp = build_initial_tf(kstack_top, entry, user_rsp);
    let cr3 = dir.root_phys();
    let task_idx =
        task::spawn(process_idx, cr3, tf_rsp, kstack_top).ok_or(KernelError::OutOfMemory)?;

    Ok((process_idx, task_idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn looks_like_elf_rejects_short_or_bad_magic_buffers() {
        assert!(!looks_like_elf(&[0u8; 4]));
        assert!(!looks_like_elf(&[0xCD, 0x80, 0xEB, 0xFE]));
    }

    #[test_case]
    fn raw_fallback_spawn_produces_a_runnable_task() {
        let (proc_idx, task_idx) = spawn(b"fallback", None).expect("spawn");
        assert_eq!(task::current_process(), None);
        assert_ne!(proc_idx, usize::MAX);
        assert_ne!(task_idx, usize::MAX);
    }
}
