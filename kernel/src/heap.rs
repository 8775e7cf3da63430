//! Block-table heap allocator.
//!
//! A fixed-size region is carved into `BLOCK_SIZE` blocks, with one byte per
//! block in a parallel table recording each block's state. A run of blocks
//! backing a single allocation is marked with `TAKEN` on every entry,
//! `IS_FIRST` on the first, and `HAS_NEXT` on every entry but the last — the
//! free path walks forward from the start block and stops right after
//! clearing the entry that does not have `HAS_NEXT` set.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr;

use crate::arch::x86_64::paging;
use crate::error::{KResult, KernelError};
use crate::pmm;
use crate::serial;

pub const BLOCK_SIZE: u64 = 4096;

const ENTRY_TAKEN: u8 = 0x01;
const ENTRY_FREE: u8 = 0x00;
const ENTRY_HAS_NEXT: u8 = 0x80;
const ENTRY_IS_FIRST: u8 = 0x40;

fn is_taken(entry: u8) -> bool {
    entry & 0x01 == ENTRY_TAKEN
}

fn has_next(entry: u8) -> bool {
    entry & ENTRY_HAS_NEXT != 0
}

fn is_first(entry: u8) -> bool {
    entry & ENTRY_IS_FIRST != 0
}

/// A block-table region: `table[i]` describes the block starting at
/// `region_start + i * BLOCK_SIZE`.
struct Table {
    region_start: u64,
    total_blocks: usize,
    entries: &'static mut [u8],
}

impl Table {
    fn align_to_upper(&self, size: u64) -> u64 {
        if size % BLOCK_SIZE == 0 {
            return size;
        }
        (size - (size % BLOCK_SIZE)) + BLOCK_SIZE
    }

    fn blocks_for(&self, size: u64) -> usize {
        (self.align_to_upper(size) / BLOCK_SIZE) as usize
    }

    fn block_to_address(&self, block: usize) -> u64 {
        self.region_start + (block as u64) * BLOCK_SIZE
    }

    fn address_to_block(&self, addr: u64) -> usize {
        ((addr - self.region_start) / BLOCK_SIZE) as usize
    }

    /// First-fit scan for `n` consecutive free blocks. Returns the starting
    /// index, or `None` if no run is long enough.
    fn find_start_block(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let mut run = 0usize;
        let mut run_start = 0usize;
        for i in 0..self.total_blocks {
            if is_taken(self.entries[i]) {
                run = 0;
                continue;
            }
            if run == 0 {
                run_start = i;
            }
            run += 1;
            if run == n {
                return Some(run_start);
            }
        }
        None
    }

    fn mark_taken(&mut self, start: usize, n: usize) {
        for i in 0..n {
            let mut e = ENTRY_TAKEN;
            if i == 0 {
                e |= ENTRY_IS_FIRST;
            }
            if i != n - 1 {
                e |= ENTRY_HAS_NEXT;
            }
            self.entries[start + i] = e;
        }
    }

    fn mark_free_from(&mut self, start: usize) {
        let mut i = start;
        loop {
            if i >= self.total_blocks {
                break;
            }
            let e = self.entries[i];
            self.entries[i] = ENTRY_FREE;
            if !has_next(e) {
                break;
            }
            i += 1;
        }
    }

    fn alloc(&mut self, size: u64) -> Option<u64> {
        let n = self.blocks_for(size);
        if n == 0 {
            return None;
        }
        let start = self.find_start_block(n)?;
        self.mark_taken(start, n);
        Some(self.block_to_address(start))
    }

    fn free(&mut self, addr: u64) {
        if addr < self.region_start {
            return;
        }
        let block = self.address_to_block(addr);
        if block >= self.total_blocks {
            return;
        }
        if !is_first(self.entries[block]) {
            // Not a run start: ignore foreign/garbage pointers rather than
            // corrupting a neighbouring allocation.
            return;
        }
        self.mark_free_from(block);
    }
}

struct Heap {
    table: Option<Table>,
}

struct LockedHeap {
    inner: UnsafeCell<Heap>,
}

unsafe impl Sync for LockedHeap {}

impl LockedHeap {
    const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Heap { table: None }),
        }
    }

    unsafe fn heap(&self) -> &mut Heap {
        &mut *self.inner.get()
    }
}

#[global_allocator]
static ALLOC: KernelAlloc = KernelAlloc {};

static HEAP: LockedHeap = LockedHeap::new();

/// Size of the kernel heap region, in blocks. 16 MiB / 4 KiB.
const HEAP_PAGES: u64 = 4096;

pub fn init() -> KResult<()> {
    let mut pages = HEAP_PAGES;
    let mut base: Option<u64> = None;
    while pages >= 128 {
        if let Some(p) = pmm::alloc_pages(pages) {
            base = Some(p);
            break;
        }
        pages /= 2;
    }
    let Some(base) = base else {
        serial::write_str("heap: init failed (no pages)\n");
        return Err(KernelError::OutOfMemory);
    };

    let size = pages * BLOCK_SIZE;
    let base_v = paging::phys_to_virt(base);
    let total_blocks = (size / BLOCK_SIZE) as usize;

    // The table itself lives just past the usable region inside the same
    // mapped span, one byte per block, so it needs no separate allocation.
    // To keep this simple and matching the reference `heap_create` contract
    // (a pre-sized table array), we carve the table out of the front of the
    // region and back the rest with data blocks.
    let table_bytes = total_blocks;
    let table_blocks = ((table_bytes as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize;
    let data_blocks = total_blocks.saturating_sub(table_blocks);
    if data_blocks == 0 {
        return Err(KernelError::InvalidArgument);
    }

    let table_ptr = base_v as *mut u8;
    let entries: &'static mut [u8] =
        unsafe { core::slice::from_raw_parts_mut(table_ptr, data_blocks) };
    for e in entries.iter_mut() {
        *e = ENTRY_FREE;
    }

    let region_start = base_v + (table_blocks as u64) * BLOCK_SIZE;

    unsafe {
        HEAP.heap().table = Some(Table {
            region_start,
            total_blocks: data_blocks,
            entries,
        });
    }

    serial::write_str("heap: initialized base(v)=");
    serial::write_hex_u64(region_start);
    serial::write_str(" blocks=");
    serial::write_dec_u64(data_blocks as u64);
    serial::write_str("\n");
    Ok(())
}

pub fn alloc(size: u64) -> Option<u64> {
    unsafe { HEAP.heap().table.as_mut()?.alloc(size) }
}

pub fn free(addr: u64) {
    if addr == 0 {
        return;
    }
    unsafe {
        if let Some(t) = HEAP.heap().table.as_mut() {
            t.free(addr);
        }
    }
}

/// Kernel-virtual address of the heap's first block. Lets callers that map
/// a heap allocation into a second address space (`process::process_malloc`)
/// turn a heap pointer into a small, deterministic offset rather than one
/// tied to wherever physical memory happened to start.
pub fn base() -> u64 {
    unsafe {
        HEAP.heap()
            .table
            .as_ref()
            .map(|t| t.region_start)
            .unwrap_or(0)
    }
}

pub struct KernelAlloc;

unsafe impl GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // The block table hands out block-aligned (4 KiB) memory; any
        // alignment request at or below that is automatically satisfied.
        if layout.align() as u64 > BLOCK_SIZE {
            return ptr::null_mut();
        }
        match alloc(layout.size() as u64) {
            Some(p) => p as *mut u8,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn make_table(total_blocks: usize) -> Table {
        let storage = vec![0u8; total_blocks].leak();
        Table {
            region_start: 0x1000,
            total_blocks,
            entries: storage,
        }
    }

    #[test_case]
    fn alloc_then_free_reuses_blocks() {
        let mut t = make_table(8);
        let p1 = t.alloc(70).unwrap(); // 2 blocks: 0,1
        assert_eq!(p1, t.region_start);
        assert!(is_first(t.entries[0]));
        assert!(has_next(t.entries[0]));
        assert!(is_taken(t.entries[1]));
        assert!(!has_next(t.entries[1]));

        let p2 = t.alloc(BLOCK_SIZE).unwrap(); // block 2
        assert_eq!(p2, t.block_to_address(2));

        t.free(p1);
        assert!(!is_taken(t.entries[0]));
        assert!(!is_taken(t.entries[1]));
        assert!(is_taken(t.entries[2]));

        let p3 = t.alloc(BLOCK_SIZE).unwrap();
        assert_eq!(p3, t.region_start); // reuses block 0
    }

    #[test_case]
    fn zero_size_allocates_nothing() {
        let mut t = make_table(4);
        assert!(t.alloc(0).is_none());
    }

    #[test_case]
    fn out_of_space_returns_none() {
        let mut t = make_table(2);
        assert!(t.alloc(3 * BLOCK_SIZE).is_none());
    }

    #[test_case]
    fn deterministic_placement() {
        let mut t1 = make_table(8);
        let mut t2 = make_table(8);
        assert_eq!(t1.alloc(100), t2.alloc(100));
        assert_eq!(t1.alloc(200), t2.alloc(200));
    }
}
