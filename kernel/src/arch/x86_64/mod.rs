pub mod gdt;
mod idt;
pub mod isr;
pub mod paging;
pub mod pic;
pub mod pit;
mod port;

pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    pit::init(100); // 100 Hz
    // Only the vectors idt::init just registered handlers for are safe to
    // unmask; keyboard (IRQ1) is unmasked later once a key decoder exists.
    pic::unmask_irq(0);
}

pub fn enable_interrupts() {
    idt::enable_interrupts();
}

/// Unmasks IRQ1 once `keyboard::init` has registered a decoder.
pub fn unmask_keyboard() {
    pic::unmask_irq(1);
}

pub fn init_paging(kernel_phys_base: u64, kernel_phys_end: u64, max_phys_inclusive: u64) -> Result<(), crate::error::KernelError> {
    paging::set_bootstrap_ranges(kernel_phys_base, kernel_phys_end, max_phys_inclusive);
    paging::init()
}
