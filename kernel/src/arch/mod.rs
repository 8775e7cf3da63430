pub mod x86_64;

pub fn init() {
    // Single-arch for now.
    x86_64::init();
}

pub fn enable_interrupts() {
    x86_64::enable_interrupts();
}

pub fn init_paging(
    kernel_phys_base: u64,
    kernel_phys_end: u64,
    max_phys_inclusive: u64,
) -> Result<(), crate::error::KernelError> {
    x86_64::init_paging(kernel_phys_base, kernel_phys_end, max_phys_inclusive)
}

pub fn unmask_keyboard() {
    x86_64::unmask_keyboard();
}
