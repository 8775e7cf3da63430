#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::fmt::Write;
use core::panic::PanicInfo;
use mantra_bootinfo::{BootInfo, MemoryRegion, PixelFormat, RegionKind};

mod arch;
mod collab;
mod error;
mod fb;
mod heap;
mod interrupts;
mod keyboard;
mod loader;
mod pmm;
mod process;
mod serial;
mod syscall;
mod task;

/// Name the loader tries first when a filesystem got registered; the raw
/// fallback image is used when it isn't found under this name either.
const INIT_PATH: &str = "/init";
const INITRD_BLOCK_SIZE: usize = 512;

fn halt_loop() -> ! {
    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}

/// Validates the hand-off from the bootloader, halting rather than guessing
/// at a malformed or absent `BootInfo`.
fn validate_boot_info(boot_info: *const BootInfo) -> &'static BootInfo {
    let Some(bi) = (unsafe { boot_info.as_ref() }) else {
        serial::write_str("mantracore: boot_info null\n");
        halt_loop();
    };
    if bi.magic != BootInfo::MAGIC || bi.version != BootInfo::VERSION {
        serial::write_str("mantracore: boot_info magic/version mismatch\n");
        halt_loop();
    }
    bi
}

fn regions_of(bi: &BootInfo) -> &'static [MemoryRegion] {
    if bi.regions_ptr != 0 && bi.regions_len != 0 {
        unsafe {
            core::slice::from_raw_parts(
                bi.regions_ptr as *const MemoryRegion,
                bi.regions_len as usize,
            )
        }
    } else {
        &[]
    }
}

fn setup_console(bi: &BootInfo) -> fb::Console {
    let format = match bi.fb_format {
        x if x == PixelFormat::Rgb as u32 => PixelFormat::Rgb,
        x if x == PixelFormat::Bgr as u32 => PixelFormat::Bgr,
        _ => PixelFormat::Unknown,
    };

    let mut con = fb::Console::new(fb::FrameBuffer {
        base: bi.fb_base as *mut u8,
        size: bi.fb_size as usize,
        width: bi.fb_width as usize,
        height: bi.fb_height as usize,
        stride: bi.fb_stride as usize,
        format,
    });

    con.clear(fb::Rgb {
        r: 0x08,
        g: 0x0b,
        b: 0x10,
    });
    con.set_colors(
        fb::Rgb {
            r: 0xe8,
            g: 0xef,
            b: 0xff,
        },
        fb::Rgb {
            r: 0x08,
            g: 0x0b,
            b: 0x10,
        },
    );
    writeln!(&mut con, "MantraOS").ok();
    writeln!(&mut con, "BootInfo v{} OK", bi.version).ok();
    con
}

/// Wraps whatever the bootloader staged as an initrd in a `RamdiskBlockDevice`
/// plus a one-entry `FlatFileSystem` naming the whole blob `/init`. Returns
/// `false` (and registers nothing) when boot found no initrd at all.
fn register_initrd(bi: &BootInfo) -> bool {
    if bi.initrd_base == 0 || bi.initrd_len == 0 {
        return false;
    }
    let base = crate::arch::x86_64::paging::phys_to_virt_ptr::<u8>(bi.initrd_base);
    let len = bi.initrd_len as usize;
    let dev = unsafe { collab::RamdiskBlockDevice::new(base, len, INITRD_BLOCK_SIZE) };
    collab::registry().register_block_device(dev);

    let mut fs = collab::FlatFileSystem::new();
    if fs.add_entry(INIT_PATH, 0, len).is_err() {
        crate::log_warn!("initrd present but rejected by the flat filesystem");
        return false;
    }
    collab::registry().register_filesystem(fs);
    true
}

/// Pulls the init program out of a registered filesystem when one exists;
/// otherwise falls back to the raw two-instruction image. Both paths are
/// deliberate, see `loader` module docs.
fn spawn_init() -> (usize, usize) {
    match loader::spawn_by_path(INIT_PATH.as_bytes()) {
        Ok(ids) => ids,
        Err(e) => {
            crate::log_warn!("failed loading {}: {}", INIT_PATH, e);
            loader::spawn(b"init", None).expect("raw fallback spawn must succeed")
        }
    }
}

#[no_mangle]
pub extern "sysv64" fn _start(boot_info: *const BootInfo) -> ! {
    serial::init();
    crate::log_info!("entered kernel");

    // Firmware may leave IF=1. Keep interrupts masked until the IDT/PIC/PIT
    // and the first task are fully wired up.
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) };

    arch::init();

    let bi = validate_boot_info(boot_info);
    let regions = regions_of(bi);
    let usable = regions
        .iter()
        .filter(|r| r.kind == RegionKind::Usable as u32)
        .count();
    crate::log_info!("regions={} usable={}", regions.len(), usable);

    let mut con = setup_console(bi);
    writeln!(&mut con, "Regions: {} (usable {})", regions.len(), usable).ok();
    writeln!(
        &mut con,
        "FB {}x{} stride={}",
        bi.fb_width, bi.fb_height, bi.fb_stride
    )
    .ok();
    writeln!(
        &mut con,
        "Kernel {:#x}-{:#x}",
        bi.kernel_phys_base, bi.kernel_phys_end
    )
    .ok();

    let stats = match pmm::init(regions) {
        Ok(stats) => stats,
        Err(()) => {
            serial::write_str("mantracore: pmm init failed\n");
            writeln!(&mut con, "PMM init failed").ok();
            halt_loop();
        }
    };
    writeln!(
        &mut con,
        "PMM usable={}MiB free={}MiB ranges={}",
        stats.usable_bytes / (1024 * 1024),
        stats.free_bytes / (1024 * 1024),
        stats.range_count
    )
    .ok();

    // Identity-map enough low RAM for the kernel, the framebuffer and any
    // initrd, with headroom for the page tables the rest of boot allocates.
    let mut max_phys = bi.kernel_phys_end;
    max_phys = max_phys.max(bi.fb_base.saturating_add(bi.fb_size));
    max_phys = max_phys.max(bi.initrd_base.saturating_add(bi.initrd_len));
    max_phys = max_phys.saturating_add(512 * 1024 * 1024);

    if let Err(e) = arch::init_paging(bi.kernel_phys_base, bi.kernel_phys_end, max_phys) {
        crate::log_error!("paging init failed: {}", e);
        halt_loop();
    }

    // The framebuffer pointer the console was built with is a raw physical
    // address; now that the kernel directory is live, route it through the
    // higher-half direct map instead.
    con.fb.base = crate::arch::x86_64::paging::phys_to_virt_ptr(bi.fb_base);

    if let Err(e) = heap::init() {
        crate::log_error!("heap init failed: {}", e);
        halt_loop();
    }
    crate::log_info!("heap ready");

    let has_initrd = register_initrd(bi);
    writeln!(
        &mut con,
        "initrd: {}",
        if has_initrd { "present" } else { "none" }
    )
    .ok();

    keyboard::init();
    syscall::init();

    #[cfg(test)]
    test_main();

    let (_proc_idx, task_idx) = spawn_init();
    task::install_first(task_idx);

    arch::enable_interrupts();

    writeln!(&mut con, "handing off to init").ok();
    // Publish the console globally only now: every `writeln!` above ran
    // against this same `con` directly, and nothing before this point reads
    // it back through `fb::write_byte`. From here on, `print`/`putchar`
    // syscalls are the only writers, and they only know the global slot.
    fb::install(con);

    task::enter_first();
}

#[cfg(test)]
fn test_runner(tests: &[&dyn Fn()]) {
    serial::write_str("running ");
    serial::write_dec_u64(tests.len() as u64);
    serial::write_str(" tests\n");
    for test in tests {
        test();
    }
    serial::write_str("all tests passed\n");
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::log_error!("panic: {}", info);
    halt_loop()
}

#[alloc_error_handler]
fn oom(layout: core::alloc::Layout) -> ! {
    crate::log_error!("out of memory: {:?}", layout);
    halt_loop()
}
