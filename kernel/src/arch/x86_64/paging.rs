//! Address-space manager: four-level (PML4->PDPT->PD->PT) page tables.
//!
//! Every `Directory` is a fully independent tree: nothing is shared between
//! two directories except the physical frames they happen to both map. A
//! freshly created directory direct-maps all physical RAM known to the
//! kernel at [`HHDM_BASE`], plus (for bootstrap reasons) identity-maps the
//! kernel's own low-memory image, so code can keep running across a `cr3`
//! reload before the scheduler hands control back to a task running out of
//! its own mappings.

use crate::error::{KResult, KernelError};
use crate::pmm;
use core::sync::atomic::{AtomicU64, Ordering};

const PAGE_SIZE: u64 = 4096;
const HUGE_2M: u64 = 2 * 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Higher-half direct map: virt = HHDM_BASE + phys. PML4 index 256 covers
/// 0xffff_8000_0000_0000..0xffff_ffff_ffff_ffff.
pub const HHDM_BASE: u64 = 0xffff_8000_0000_0000;
const HHDM_PML4_INDEX: usize = 256;

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_NO_EXECUTE: u64 = 1 << 63;
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Kernel's own directory, installed by [`init`]; every task directory is
/// built fresh by [`Directory::new`].
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);
static CURRENT_PML4: AtomicU64 = AtomicU64::new(0);
static KERNEL_IDENT_BASE: AtomicU64 = AtomicU64::new(0);
static KERNEL_IDENT_END: AtomicU64 = AtomicU64::new(0);
static MAX_PHYS: AtomicU64 = AtomicU64::new(0);

fn align_up(x: u64, a: u64) -> u64 {
    if a == 0 {
        return x;
    }
    (x + (a - 1)) & !(a - 1)
}

fn align_down(x: u64, a: u64) -> u64 {
    if a == 0 {
        return x;
    }
    x & !(a - 1)
}

fn is_aligned(x: u64, a: u64) -> bool {
    a != 0 && x & (a - 1) == 0
}

unsafe fn zero_page(p: u64) {
    core::ptr::write_bytes(phys_to_virt_ptr::<u8>(p), 0, PAGE_SIZE as usize);
}

unsafe fn alloc_table() -> KResult<u64> {
    let p = pmm::alloc_pages(1).ok_or(KernelError::OutOfMemory)?;
    zero_page(p);
    Ok(p)
}

unsafe fn load_cr3(pml4_phys: u64) {
    core::arch::asm!(
        "mov cr3, {}",
        in(reg) pml4_phys,
        options(nomem, nostack, preserves_flags)
    );
}

unsafe fn invlpg(addr: u64) {
    core::arch::asm!("invlpg [{}]", in(reg) addr, options(nomem, nostack, preserves_flags));
}

#[inline]
pub fn phys_to_virt(phys: u64) -> u64 {
    HHDM_BASE.wrapping_add(phys)
}

#[inline]
pub fn phys_to_virt_ptr<T>(phys: u64) -> *mut T {
    phys_to_virt(phys) as *mut T
}

unsafe fn table_entry_mut(table_phys: u64, idx: usize) -> *mut u64 {
    phys_to_virt_ptr::<u64>(table_phys).add(idx)
}

unsafe fn get_or_alloc_table(entry: *mut u64, flags: u64) -> KResult<u64> {
    let mut v = core::ptr::read_volatile(entry);
    if (v & PTE_PRESENT) != 0 {
        if (flags & PTE_USER) != 0 && (v & PTE_USER) == 0 {
            v |= PTE_USER;
            core::ptr::write_volatile(entry, v);
        }
        return Ok(v & PTE_ADDR_MASK);
    }
    let t = alloc_table()?;
    let mut e = t | PTE_PRESENT | PTE_WRITABLE;
    if (flags & PTE_USER) != 0 {
        e |= PTE_USER;
    }
    core::ptr::write_volatile(entry, e);
    Ok(t)
}

fn indices(virt: u64) -> (usize, usize, usize, usize, u64) {
    (
        ((virt >> 39) & 0x1ff) as usize,
        ((virt >> 30) & 0x1ff) as usize,
        ((virt >> 21) & 0x1ff) as usize,
        ((virt >> 12) & 0x1ff) as usize,
        virt & 0xfff,
    )
}

/// The root of one task's (or the kernel's) page-table tree.
pub struct Directory {
    pml4: u64,
}

impl Directory {
    /// Wrap an already-built PML4 root (used for the kernel directory).
    fn from_raw(pml4: u64) -> Self {
        Self { pml4 }
    }

    /// Wraps an already-built PML4 root owned by some existing process
    /// record, so it can be passed to `map_one`/`translate`/`destroy`
    /// again later (e.g. when tearing down a killed task).
    pub fn from_existing(pml4_phys: u64) -> Self {
        Self { pml4: pml4_phys }
    }

    pub fn root_phys(&self) -> u64 {
        self.pml4
    }

    /// Creates a directory that direct-maps all detected physical RAM at
    /// [`HHDM_BASE`] and identity-maps the kernel's own image, both with
    /// `flags`. See module docs for why the identity map is necessary.
    pub fn new(flags: u64) -> KResult<Self> {
        unsafe {
            let pml4 = alloc_table()?;
            let dir = Directory::from_raw(pml4);

            let kb = KERNEL_IDENT_BASE.load(Ordering::Acquire);
            let ke = KERNEL_IDENT_END.load(Ordering::Acquire);
            if ke > kb {
                let mut p = align_down(kb, PAGE_SIZE);
                let end = align_up(ke, PAGE_SIZE);
                while p < end {
                    dir.map_4k_raw(p, p, flags)?;
                    p += PAGE_SIZE;
                }
            }

            let max_phys = MAX_PHYS.load(Ordering::Acquire);
            dir.build_hhdm(max_phys, flags)?;

            Ok(dir)
        }
    }

    unsafe fn build_hhdm(&self, max_phys_inclusive: u64, flags: u64) -> KResult<()> {
        let max_end = align_up(max_phys_inclusive.saturating_add(1), GIB);
        let pdpt_entries = ((max_end + (GIB - 1)) / GIB).min(512) as usize;
        if pdpt_entries == 0 {
            return Ok(());
        }

        let pml4e = table_entry_mut(self.pml4, HHDM_PML4_INDEX);
        let pdpt = get_or_alloc_table(pml4e, flags)?;

        for i in 0..pdpt_entries {
            let pd = alloc_table()?;
            *table_entry_mut(pdpt, i) = pd | PTE_PRESENT | PTE_WRITABLE;

            let chunk_base = (i as u64) * GIB;
            for j in 0..512usize {
                let phys = chunk_base + (j as u64) * HUGE_2M;
                *table_entry_mut(pd, j) = phys | PTE_PRESENT | PTE_HUGE | (flags & !PTE_USER);
            }
        }
        Ok(())
    }

    unsafe fn map_4k_raw(&self, virt: u64, phys: u64, flags: u64) -> KResult<()> {
        let (pml4_i, pdpt_i, pd_i, pt_i, _off) = indices(virt);

        let pml4e = table_entry_mut(self.pml4, pml4_i);
        let pdpt = get_or_alloc_table(pml4e, flags)?;

        let pdpte = table_entry_mut(pdpt, pdpt_i);
        let pd = get_or_alloc_table(pdpte, flags)?;

        let pde = table_entry_mut(pd, pd_i);
        let pt = get_or_alloc_table(pde, flags)?;

        let pte = table_entry_mut(pt, pt_i);
        core::ptr::write_volatile(pte, (phys & PTE_ADDR_MASK) | PTE_PRESENT | flags);
        invlpg(virt);
        Ok(())
    }

    /// Maps a single page. Both addresses must be 4 KiB aligned.
    pub fn map_one(&mut self, virt: u64, phys: u64, flags: u64) -> KResult<()> {
        if !is_aligned(virt, PAGE_SIZE) || !is_aligned(phys, PAGE_SIZE) {
            return Err(KernelError::InvalidArgument);
        }
        unsafe { self.map_4k_raw(virt, phys, flags) }
    }

    /// Maps `count` consecutive pages starting at `virt`/`phys`.
    pub fn map_range(&mut self, virt: u64, phys: u64, count: u64, flags: u64) -> KResult<()> {
        for i in 0..count {
            self.map_one(
                virt + i * PAGE_SIZE,
                phys + i * PAGE_SIZE,
                flags,
            )?;
        }
        Ok(())
    }

    /// Maps the physical span `[phys_start, phys_end)` at `virt`.
    pub fn map_to(&mut self, virt: u64, phys_start: u64, phys_end: u64, flags: u64) -> KResult<()> {
        if !is_aligned(virt, PAGE_SIZE)
            || !is_aligned(phys_start, PAGE_SIZE)
            || !is_aligned(phys_end, PAGE_SIZE)
            || phys_end < phys_start
        {
            return Err(KernelError::InvalidArgument);
        }
        let count = (phys_end - phys_start) / PAGE_SIZE;
        self.map_range(virt, phys_start, count, flags)
    }

    /// Clears the leaf entry for `virt`, if any (used by `process_free`).
    pub fn unmap_one(&mut self, virt: u64) {
        let virt = align_down(virt, PAGE_SIZE);
        unsafe {
            let (pml4_i, pdpt_i, pd_i, pt_i, _off) = indices(virt);
            let pml4e = core::ptr::read_volatile(table_entry_mut(self.pml4, pml4_i));
            if pml4e & PTE_PRESENT == 0 {
                return;
            }
            let pdpte = core::ptr::read_volatile(table_entry_mut(pml4e & PTE_ADDR_MASK, pdpt_i));
            if pdpte & PTE_PRESENT == 0 {
                return;
            }
            let pde = core::ptr::read_volatile(table_entry_mut(pdpte & PTE_ADDR_MASK, pd_i));
            if pde & PTE_PRESENT == 0 || pde & PTE_HUGE != 0 {
                return;
            }
            let pt = pde & PTE_ADDR_MASK;
            core::ptr::write_volatile(table_entry_mut(pt, pt_i), 0);
            invlpg(virt);
        }
    }

    /// Rounds `virt` down, walks the tables, and adds the in-page offset
    /// back onto the resolved physical frame.
    pub fn translate(&self, virt: u64) -> KResult<u64> {
        let (pml4_i, pdpt_i, pd_i, pt_i, off) = indices(virt);
        unsafe {
            let pml4e = core::ptr::read_volatile(table_entry_mut(self.pml4, pml4_i));
            if pml4e & PTE_PRESENT == 0 {
                return Err(KernelError::InvalidArgument);
            }
            let pdpte = core::ptr::read_volatile(table_entry_mut(pml4e & PTE_ADDR_MASK, pdpt_i));
            if pdpte & PTE_PRESENT == 0 {
                return Err(KernelError::InvalidArgument);
            }
            let pde = core::ptr::read_volatile(table_entry_mut(pdpte & PTE_ADDR_MASK, pd_i));
            if pde & PTE_PRESENT == 0 {
                return Err(KernelError::InvalidArgument);
            }
            if pde & PTE_HUGE != 0 {
                let base = pde & PTE_ADDR_MASK;
                let huge_off = virt & (HUGE_2M - 1);
                return Ok(base + huge_off);
            }
            let pte = core::ptr::read_volatile(table_entry_mut(pde & PTE_ADDR_MASK, pt_i));
            if pte & PTE_PRESENT == 0 {
                return Err(KernelError::InvalidArgument);
            }
            Ok((pte & PTE_ADDR_MASK) + off)
        }
    }

    /// Installs this directory as the active one (`cr3`).
    pub fn switch(&self) {
        unsafe { load_cr3(self.pml4) };
        CURRENT_PML4.store(self.pml4, Ordering::Release);
    }

    /// Frees every leaf data frame mapped under this directory, then every
    /// sub-table referenced from it (post-order), then the root itself.
    /// Best-effort: the physical frame allocator has no free list, so frames
    /// that aren't the allocator's current top are leaked rather than
    /// corrupted (see `pmm::free_pages_if_top`). Frames that belong to the
    /// kernel's own identity-mapped image (present in every directory) were
    /// already excluded from pmm's free ranges at boot, so freeing them here
    /// is a no-op rather than a double-free.
    pub fn destroy(self) {
        unsafe {
            for pml4_i in 0..512usize {
                let pml4e = core::ptr::read_volatile(table_entry_mut(self.pml4, pml4_i));
                if pml4e & PTE_PRESENT == 0 {
                    continue;
                }
                let pdpt = pml4e & PTE_ADDR_MASK;
                for pdpt_i in 0..512usize {
                    let pdpte = core::ptr::read_volatile(table_entry_mut(pdpt, pdpt_i));
                    if pdpte & PTE_PRESENT == 0 {
                        continue;
                    }
                    let pd = pdpte & PTE_ADDR_MASK;
                    for pd_i in 0..512usize {
                        let pde = core::ptr::read_volatile(table_entry_mut(pd, pd_i));
                        if pde & PTE_PRESENT == 0 || pde & PTE_HUGE != 0 {
                            continue;
                        }
                        let pt = pde & PTE_ADDR_MASK;
                        for pt_i in 0..512usize {
                            let pte = core::ptr::read_volatile(table_entry_mut(pt, pt_i));
                            if pte & PTE_PRESENT == 0 {
                                continue;
                            }
                            pmm::free_pages_if_top(pte & PTE_ADDR_MASK, 1);
                        }
                        pmm::free_pages_if_top(pt, 1);
                    }
                    pmm::free_pages_if_top(pd, 1);
                }
                pmm::free_pages_if_top(pdpt, 1);
            }
            pmm::free_pages_if_top(self.pml4, 1);
        }
    }
}

/// Records the kernel image's physical span and the detected RAM ceiling so
/// every later `Directory::new` can reproduce the kernel's bootstrap
/// mappings. Must run before the first `Directory::new` call.
pub fn set_bootstrap_ranges(kernel_phys_base: u64, kernel_phys_end: u64, max_phys_inclusive: u64) {
    KERNEL_IDENT_BASE.store(kernel_phys_base, Ordering::Release);
    KERNEL_IDENT_END.store(kernel_phys_end, Ordering::Release);
    MAX_PHYS.store(max_phys_inclusive, Ordering::Release);
}

/// Builds the kernel's own directory and switches to it. Must run after
/// [`set_bootstrap_ranges`].
pub fn init() -> KResult<()> {
    let dir = Directory::new(PTE_WRITABLE)?;
    let pml4 = dir.root_phys();
    dir.switch();
    KERNEL_PML4.store(pml4, Ordering::Release);
    crate::log_info!(
        "paging: kernel directory installed pml4={:#x}",
        pml4
    );
    Ok(())
}

pub fn kernel_pml4() -> u64 {
    KERNEL_PML4.load(Ordering::Acquire)
}

pub fn current_pml4() -> u64 {
    CURRENT_PML4.load(Ordering::Acquire)
}

/// Switches back to the kernel's own directory (used at syscall entry/exit).
pub fn switch_to_kernel() {
    let pml4 = kernel_pml4();
    unsafe { load_cr3(pml4) };
    CURRENT_PML4.store(pml4, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn map_one_round_trips_through_translate() {
        let mut dir = Directory::new(PTE_WRITABLE).expect("directory");
        let phys = pmm::alloc_frame().expect("frame");
        let virt = 0x0000_7000_0000_0000u64;
        dir.map_one(virt, phys, PTE_WRITABLE).expect("map_one");
        assert_eq!(dir.translate(virt).expect("translate"), phys);
        assert_eq!(dir.translate(virt + 0x123).expect("translate"), phys + 0x123);
    }

    #[test_case]
    fn map_one_rejects_unaligned_addresses() {
        let mut dir = Directory::new(PTE_WRITABLE).expect("directory");
        let phys = pmm::alloc_frame().expect("frame");
        assert_eq!(
            dir.map_one(0x1001, phys, PTE_WRITABLE),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            dir.map_one(0x2000, phys + 1, PTE_WRITABLE),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test_case]
    fn map_to_maps_a_span() {
        let mut dir = Directory::new(PTE_WRITABLE).expect("directory");
        let p0 = pmm::alloc_pages(4).expect("frames");
        let virt = 0x0000_7100_0000_0000u64;
        dir.map_to(virt, p0, p0 + 4 * PAGE_SIZE, PTE_WRITABLE)
            .expect("map_to");
        for i in 0..4u64 {
            assert_eq!(
                dir.translate(virt + i * PAGE_SIZE).expect("translate"),
                p0 + i * PAGE_SIZE
            );
        }
    }

    #[test_case]
    fn fresh_directory_direct_maps_physical_range() {
        let dir = Directory::new(PTE_WRITABLE).expect("directory");
        let phys = pmm::alloc_frame().expect("frame");
        assert_eq!(dir.translate(HHDM_BASE + phys).expect("translate"), phys);
    }
}
