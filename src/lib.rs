// `cargo test --lib` compiles this crate as its own host-target test
// binary (see `.cargo/config.toml`), distinct from the no_std kernel image
// built via `--target i686-rsos32.json`. Keeping these five attributes
// active there would hand test collection to `test_runner` (which only
// gathers `#[test_case]` items, not the `#[test]` fns every module's
// `#[cfg(test)] mod tests` actually uses) and leave the harness binary with
// no entry point at all. Dropping them under `cfg(test)` reverts the crate
// to an ordinary std-linked crate with the standard libtest harness.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), feature(custom_test_frameworks))]
#![cfg_attr(not(test), test_runner(crate::test_runner))]
#![cfg_attr(not(test), reexport_test_harness_main = "test_main")]

//! Library half of the kernel. Every other crate-type `["staticlib"]`
//! target in this package (the production binary in `main.rs`, and each
//! integration test under `tests/`) links against this and supplies its
//! own `kmain` — the symbol `boot.rs`'s Multiboot trampoline calls into.
//! Splitting it this way, rather than one `kmain` here every binary
//! shares, is what lets each integration test boot as its own minimal
//! kernel image under the test harness.

extern crate alloc;

pub mod boot;
pub mod config;
pub mod data_structures;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod globals;
pub mod interrupts;
pub mod io_port;
pub mod kernel;
pub mod logger;
pub mod memory;
pub mod multiboot;
pub mod scheduler;
pub mod serial;
pub mod sync;
pub mod symbols;
pub mod syscalls;
pub mod vga_buffer;

pub mod macros {
    pub mod serial;
}

use core::arch::asm;
use core::panic::PanicInfo;

/// Halts the calling CPU forever. Used by the idle thread, a fatal
/// exception once its stack trace has been rendered, and a
/// syscall-triggered restart once the reset intent has been recorded.
pub fn hlt() -> ! {
    loop {
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }
}

/// A Rust-level panic (an index out of bounds, an `unwrap` on `None`, a
/// failed assertion inside kernel code) is exactly as fatal as a CPU
/// exception, so it gets the same blue-screen panel treatment rather
/// than a bare serial line and a silent hang.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    vga_buffer::blue_screen(|writer| {
        use core::fmt::Write;
        let _ = writeln!(writer, "KERNEL PANIC");
        let _ = writeln!(writer, "{info}");
    });
    log::error!("panic: {info}");
    hlt();
}

/// Runs every `#[test_case]` an integration test binary's `test_main()`
/// collects, in the boot environment that binary's own `kmain` already
/// brought up.
pub fn test_runner(tests: &[&dyn Fn()]) {
    log::info!("running {} test(s)", tests.len());
    for test in tests {
        test();
    }
    log::info!("all tests passed");
}

/// `#[panic_handler]` for integration test binaries: a failing assertion
/// inside a test is a test failure, not grounds for the full blue-screen
/// panel, so this just reports it over serial and halts.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    log::error!("test failed: {info}");
    hlt()
}
