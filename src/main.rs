#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rsos32::test_runner)]
#![reexport_test_harness_main = "test_main"]

//! The production kernel binary. `boot.rs`'s Multiboot trampoline (built
//! as part of the library and linked into this binary) calls `kmain`
//! directly after loading a flat GDT — this is where the whole boot
//! sequence actually runs, grounded on `original_source/kernel.cpp`'s
//! `kernelMain`.

use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rsos32::vga_buffer::blue_screen(|writer| {
        use core::fmt::Write;
        let _ = writeln!(writer, "KERNEL PANIC");
        let _ = writeln!(writer, "{info}");
    });
    log::error!("panic: {info}");
    rsos32::hlt();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rsos32::test_panic_handler(info);
}

/// # Safety
/// Called exactly once, by `boot.rs`'s assembly trampoline, immediately
/// after the CPU has a flat GDT and a temporary stack. `magic` and
/// `mb_info_addr` are whatever the Multiboot loader left in `eax`/`ebx`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kmain(magic: u32, mb_info_addr: usize) -> ! {
    let _ctx = unsafe { rsos32::kernel::KernelContext::boot(magic, mb_info_addr) };

    log::info!("Welcome to rsos32!");
    rsos32::sync::enable_interrupts();

    #[cfg(test)]
    test_main();

    rsos32::hlt();
}
