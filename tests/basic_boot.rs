#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rsos32::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rsos32::test_panic_handler(info);
}

/// # Safety
/// Called exactly once, by `boot.rs`'s assembly trampoline.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kmain(magic: u32, mb_info_addr: usize) -> ! {
    let _ctx = unsafe { rsos32::kernel::KernelContext::boot(magic, mb_info_addr) };
    test_main();
    rsos32::hlt();
}

#[test_case]
fn basic_assert() {
    assert_eq!(1, 1);
}

#[test_case]
fn pmm_reports_free_frames_after_boot() {
    assert!(rsos32::globals::PMM.max_blocks() > rsos32::globals::PMM.used_blocks());
}
