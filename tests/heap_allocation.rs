#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rsos32::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rsos32::test_panic_handler(info);
}

#[derive(Debug)]
#[repr(align(16))]
struct Aligned16(u64);

/// # Safety
/// Called exactly once, by `boot.rs`'s assembly trampoline.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kmain(magic: u32, mb_info_addr: usize) -> ! {
    let _ctx = unsafe { rsos32::kernel::KernelContext::boot(magic, mb_info_addr) };
    test_main();
    rsos32::hlt();
}

#[test_case]
fn simple_allocation() {
    let a = Box::new(42);
    let b = String::from("Hello, World!");
    assert_eq!(*a, 42);
    assert_eq!(b, "Hello, World!");
}

#[test_case]
fn large_vector() {
    let n = 1000;
    let mut vec = Vec::new();
    for i in 0..n {
        vec.push(i);
    }

    assert_eq!(vec.len(), n);
    for (i, &item) in vec.iter().enumerate() {
        assert_eq!(item, i);
    }

    assert_eq!(vec.iter().sum::<usize>(), (n - 1) * n / 2);
}

#[test_case]
fn bigger_alignment() {
    let a = Box::new(Aligned16(13));
    assert_eq!((*a).0, 13);
}

#[test_case]
fn deallocation() {
    let addr: *const u64;
    {
        let a: Box<u64> = Box::new(42);
        addr = &*a;
    }

    // a same-size allocation after the first one is freed should reuse its
    // block rather than bumping the heap further
    let b: Box<u64> = Box::new(13);
    assert_eq!(addr, &*b as *const u64);
}

#[test_case]
fn big_struct_small_align() {
    // the TSS struct has a unique combination of size and alignment that
    // has historically tripped up custom allocators' size/align rounding
    let _tss = Box::new(rsos32::interrupts::tss::Tss::new());
}
