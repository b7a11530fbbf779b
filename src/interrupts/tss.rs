//! Classic 32-bit Task State Segment (`spec.md §4.1`, §5). The CPU only
//! ever reads `ss0`/`esp0` from it (on a ring-3→ring-0 interrupt, to find
//! the kernel stack); every other field is vestigial on a kernel that never
//! uses hardware task-switching. Grounded on `original_source/core/tss.cpp`'s
//! `set_tss_entry`/`tss_init`/`tss_set_stack`; reshaped from the teacher's
//! 64-bit `rsp0..rsp2`/`ist[7]` layout to the 32-bit field set.
use crate::interrupts::gdt::KERNEL_DATA_SELECTOR;

#[repr(C, packed)]
pub struct Tss {
    previous_task_link: u16,
    reserved_0: u16,
    pub esp0: u32,
    ss0: u16,
    reserved_1: u16,
    esp1: u32,
    ss1: u16,
    reserved_2: u16,
    esp2: u32,
    ss2: u16,
    reserved_3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    reserved_4: u16,
    cs: u16,
    reserved_5: u16,
    ss: u16,
    reserved_6: u16,
    ds: u16,
    reserved_7: u16,
    fs: u16,
    reserved_8: u16,
    gs: u16,
    reserved_9: u16,
    ldt_selector: u16,
    reserved_10: u16,
    trap: u16,
    iomap_base: u16,
}

impl Tss {
    /// A fresh TSS with `ss0` already pinned to the kernel data segment;
    /// `esp0` starts at `0` and must be set (via [`Tss::set_stack`]) before
    /// any ring transition can safely use it.
    pub const fn new() -> Self {
        Tss {
            previous_task_link: 0,
            reserved_0: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR,
            reserved_1: 0,
            esp1: 0,
            ss1: 0,
            reserved_2: 0,
            esp2: 0,
            ss2: 0,
            reserved_3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            reserved_4: 0,
            cs: 0,
            reserved_5: 0,
            ss: 0,
            reserved_6: 0,
            ds: 0,
            reserved_7: 0,
            fs: 0,
            reserved_8: 0,
            gs: 0,
            reserved_9: 0,
            ldt_selector: 0,
            reserved_10: 0,
            trap: 0,
            // a value >= the TSS limit disables the I/O permission bitmap entirely.
            iomap_base: core::mem::size_of::<Tss>() as u16,
        }
    }

    /// Points `esp0` at the top of the kernel stack the next ring-3→ring-0
    /// transition should use. Called by the scheduler on every dispatch
    /// that hands control to a user-mode thread.
    pub fn set_stack(&mut self, esp0: u32) {
        self.esp0 = esp0;
    }
}
