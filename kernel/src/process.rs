//! Process records: one per loaded program image. A process owns an address
//! space (`Directory`) and a fixed-capacity ledger of the heap allocations
//! it has outstanding, so `exit`/a fatal fault can unwind every `malloc` a
//! process forgot to `free`.

use crate::arch::x86_64::paging::{self, Directory, PTE_NO_EXECUTE, PTE_PRESENT, PTE_USER, PTE_WRITABLE};
use crate::error::{KResult, KernelError};
use crate::heap;

pub const MAX_PROCESSES: usize = 16;
const MAX_HEAP_ALLOCS: usize = 32;
const NONE: usize = usize::MAX;

/// Window a process's heap allocations are mapped into. The backing memory
/// is the kernel's own block-table heap (`crate::heap`); each ledger entry
/// just adds a second, user-accessible mapping of the kernel-heap block at
/// `USER_HEAP_BASE + (kernel_addr - heap::base())`, so the same kernel block
/// always lands at the same user address and a free-then-realloc of the
/// same size reuses it (the block table's first-fit prefers the lowest free
/// run every time).
const USER_HEAP_BASE: u64 = 0x0000_0000_4000_0000;
const PAGE_SIZE: u64 = 4096;

#[derive(Copy, Clone)]
struct HeapAlloc {
    kernel_ptr: u64,
    user_ptr: u64,
    size: u64,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Slot {
    Free,
    InUse,
}

struct ProcessEntry {
    slot: Slot,
    pml4: u64,
    allocs: [HeapAlloc; MAX_HEAP_ALLOCS],
    alloc_count: usize,
    argv_bytes: [u8; 256],
    argv_len: usize,
    exit_code: i64,
}

const EMPTY: ProcessEntry = ProcessEntry {
    slot: Slot::Free,
    pml4: 0,
    allocs: [HeapAlloc { kernel_ptr: 0, user_ptr: 0, size: 0 }; MAX_HEAP_ALLOCS],
    alloc_count: 0,
    argv_bytes: [0; 256],
    argv_len: 0,
    exit_code: 0,
};

static mut TABLE: [ProcessEntry; MAX_PROCESSES] = [EMPTY; MAX_PROCESSES];

fn table() -> &'static mut [ProcessEntry; MAX_PROCESSES] {
    unsafe { &mut *core::ptr::addr_of_mut!(TABLE) }
}

/// Registers a freshly built address space as a new process. Returns its
/// arena index, used as the process handle everywhere else in the kernel.
pub fn create(dir: &Directory, argv_bytes: &[u8]) -> KResult<usize> {
    let t = table();
    let idx = t
        .iter()
        .position(|e| e.slot == Slot::Free)
        .ok_or(KernelError::OutOfMemory)?;

    let mut entry = EMPTY;
    entry.slot = Slot::InUse;
    entry.pml4 = dir.root_phys();
    let n = argv_bytes.len().min(entry.argv_bytes.len());
    entry.argv_bytes[..n].copy_from_slice(&argv_bytes[..n]);
    entry.argv_len = n;
    t[idx] = entry;
    Ok(idx)
}

pub fn pml4_of(idx: usize) -> u64 {
    table()[idx].pml4
}

pub fn argv_of(idx: usize) -> &'static [u8] {
    let e = &table()[idx];
    &e.argv_bytes[..e.argv_len]
}

pub fn set_exit_code(idx: usize, code: i64) {
    table()[idx].exit_code = code;
}

pub fn exit_code(idx: usize) -> i64 {
    table()[idx].exit_code
}

/// Allocates `size` bytes from the kernel heap on behalf of process `idx`,
/// maps the backing block into its address space at a derived user address,
/// and records the allocation in its ledger. Returns the user-visible
/// virtual address, or 0 on failure (ledger full, kernel heap exhausted, or
/// the mapping fails) per the `malloc` contract.
pub fn process_malloc(idx: usize, dir: &mut Directory, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    let t = table();
    let e = &mut t[idx];
    if e.alloc_count >= MAX_HEAP_ALLOCS {
        return 0;
    }

    let Some(kernel_ptr) = heap::alloc(size) else {
        return 0;
    };

    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let bytes = pages * PAGE_SIZE;
    let user_ptr = USER_HEAP_BASE + (kernel_ptr - heap::base());

    for i in 0..pages {
        let phys = (kernel_ptr + i * PAGE_SIZE) - paging::HHDM_BASE;
        let virt = user_ptr + i * PAGE_SIZE;
        if dir
            .map_one(virt, phys, PTE_PRESENT | PTE_WRITABLE | PTE_USER | PTE_NO_EXECUTE)
            .is_err()
        {
            heap::free(kernel_ptr);
            return 0;
        }
    }

    e.allocs[e.alloc_count] = HeapAlloc { kernel_ptr, user_ptr, size: bytes };
    e.alloc_count += 1;
    user_ptr
}

/// Removes `ptr` from the process's ledger, unmaps its user-visible pages,
/// and frees the backing kernel-heap block. A `ptr` that `process_malloc`
/// never handed out (double free / bogus pointer) is silently ignored
/// rather than reported, hardening against user-space misuse rather than
/// trusting it to only ever free what it was given.
pub fn process_free(idx: usize, dir: &mut Directory, ptr: u64) {
    let t = table();
    let e = &mut t[idx];
    let Some(pos) = e.allocs[..e.alloc_count].iter().position(|a| a.user_ptr == ptr) else {
        return;
    };

    let alloc = e.allocs[pos];
    let pages = alloc.size / PAGE_SIZE;
    for i in 0..pages {
        dir.unmap_one(alloc.user_ptr + i * PAGE_SIZE);
    }
    heap::free(alloc.kernel_ptr);

    e.allocs[pos] = e.allocs[e.alloc_count - 1];
    e.alloc_count -= 1;
}

/// Tears down a process: frees every outstanding heap allocation (unmapping
/// it and returning its block to the kernel heap), destroys its address
/// space — which frees the program image and user stack along with every
/// other mapped data frame — and frees its arena slot. Called from `exit`
/// and from the fatal-exception path.
pub fn terminate(idx: usize, dir: Directory) {
    let mut dir = dir;
    {
        let t = table();
        let e = &mut t[idx];
        while e.alloc_count > 0 {
            let alloc = e.allocs[e.alloc_count - 1];
            let pages = alloc.size / PAGE_SIZE;
            for i in 0..pages {
                dir.unmap_one(alloc.user_ptr + i * PAGE_SIZE);
            }
            heap::free(alloc.kernel_ptr);
            e.alloc_count -= 1;
        }
        e.slot = Slot::Free;
    }
    // The program image and user stack are ordinary data frames mapped by
    // the loader directly into `dir`; `destroy` walks every leaf PTE still
    // present (everything but the heap allocations just unmapped above) and
    // returns them to `pmm`.
    dir.destroy();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn malloc_then_free_allows_reuse_of_ledger_slot() {
        let mut dir = Directory::new(PTE_WRITABLE).expect("directory");
        let idx = create(&dir, b"test").expect("process");

        let p = process_malloc(idx, &mut dir, 64);
        assert_ne!(p, 0);
        process_free(idx, &mut dir, p);

        let p2 = process_malloc(idx, &mut dir, 64);
        assert_eq!(p2, p);
    }

    #[test_case]
    fn free_of_unknown_pointer_is_silently_ignored() {
        let mut dir = Directory::new(PTE_WRITABLE).expect("directory");
        let idx = create(&dir, b"").expect("process");
        let p = process_malloc(idx, &mut dir, 64);
        process_free(idx, &mut dir, 0x1234);
        // The real allocation is still live: the bogus free touched nothing.
        process_free(idx, &mut dir, p);
        assert_eq!(process_malloc(idx, &mut dir, 64), p);
    }

    #[test_case]
    fn zero_size_malloc_returns_null() {
        let mut dir = Directory::new(PTE_WRITABLE).expect("directory");
        let idx = create(&dir, b"").expect("process");
        assert_eq!(process_malloc(idx, &mut dir, 0), 0);
    }
}
