//! 256-entry IDT. Each installed vector points at its own stub (see
//! `isr::declare_stubs!`); this module's job is wiring the gate table and
//! tagging each vector's disposition in `crate::interrupts`.

use super::gdt;
use super::isr;
use crate::interrupts::{self, VectorKind};
use crate::serial;

#[repr(C)]
#[derive(Copy, Clone)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    zero: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            zero: 0,
        }
    }

    fn set_handler(&mut self, handler: unsafe extern "C" fn(), dpl: u8) {
        let addr = handler as usize as u64;
        self.offset_low = addr as u16;
        self.offset_mid = (addr >> 16) as u16;
        self.offset_high = (addr >> 32) as u32;
        self.zero = 0;
        self.selector = gdt::KCODE_SEL;
        self.ist = 0;
        self.type_attr = 0x8E | ((dpl & 0x3) << 5); // present, 64-bit interrupt gate
    }

    fn set_ist(&mut self, ist: u8) {
        self.ist = ist & 0x7;
    }
}

#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u64,
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

fn lidt(idt: &'static [IdtEntry; 256]) {
    let idtr = Idtr {
        limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: idt.as_ptr() as u64,
    };
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &idtr, options(nostack, preserves_flags));
    }
}

const DOUBLE_FAULT_VECTOR: usize = 8;

/// Builds the gate table (one stub per vector 0-47 plus 0x80) and tags
/// every vector's disposition: exceptions are fatal, IRQs default to
/// ignore-and-eoi until something below registers interest, and the
/// syscall gate always dispatches into the command catalogue.
pub fn init() {
    unsafe {
        for vector in 0usize..=47 {
            if let Some(stub) = isr::stub_for_vector(vector as u8) {
                IDT[vector].set_handler(stub, 0);
            }
        }
        IDT[DOUBLE_FAULT_VECTOR].set_ist(gdt::df_ist_index());

        if let Some(stub) = isr::stub_for_vector(0x80) {
            IDT[0x80].set_handler(stub, 3);
        }

        let idt: &'static [IdtEntry; 256] = &*(&raw const IDT);
        lidt(idt);
    }

    for vector in 0u8..32 {
        interrupts::register_callback(vector, VectorKind::FatalException, None);
    }
    interrupts::register_callback(
        3,
        VectorKind::Dispatch,
        Some(|tf| {
            crate::log_info!("breakpoint at rip={:#x}", tf.rip);
            0
        }),
    );
    for vector in 32u8..48 {
        interrupts::register_callback(vector, VectorKind::IgnoreAndEoi, None);
    }
    interrupts::register_callback(32, VectorKind::Dispatch, Some(interrupts::timer_tick));
    interrupts::register_callback(33, VectorKind::Dispatch, Some(crate::keyboard::on_irq1));
    interrupts::register_callback(0x80, VectorKind::Dispatch, None);

    serial::write_str("mantracore: idt initialized (256 gates, 49 vectors tagged)\n");
}

pub fn enable_interrupts() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
    serial::write_str("mantracore: interrupts enabled\n");
}
