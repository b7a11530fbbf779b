//! 32-bit flat Global Descriptor Table (`spec.md §4.1`). Six 8-byte
//! descriptors: null, kernel code/data, user code/data, and the one TSS
//! descriptor the scheduler updates `esp0` through. Grounded on
//! `original_source/core/gdt.cpp`'s `gdt_set_entry` bit-packing; reshaped
//! from the teacher's generic `SegmentDescriptor<T: SegmentDescriptorType>`
//! (sized for 64-bit long-mode system descriptors) down to the classic
//! 32-bit 8-byte layout used by every entry, normal or system.
use crate::interrupts::tss::Tss;
use bitflags::bitflags;
use core::arch::asm;

bitflags! {
    /// The access byte shared by every GDT entry, normal or system.
    #[derive(Clone, Copy)]
    pub struct AccessByte: u8 {
        const ACCESSED        = 1 << 0;
        const RW              = 1 << 1; // readable (code) / writable (data)
        const DC              = 1 << 2; // direction/conforming
        const EXECUTABLE      = 1 << 3;
        const DESCRIPTOR_TYPE = 1 << 4; // 1 = code/data, 0 = system
        const DPL_RING3       = 0b011 << 5;
        const PRESENT         = 1 << 7;
    }
}

bitflags! {
    /// Granularity/size nibble packed into the top of the limit byte.
    #[derive(Clone, Copy)]
    pub struct Flags: u8 {
        const SIZE_32BIT  = 1 << 6;
        const GRANULARITY = 1 << 7; // limit scaled by 4 KiB
    }
}

/// A single classic 32-bit GDT descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Descriptor {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    limit_high_and_flags: u8,
    base_high: u8,
}

impl Descriptor {
    const fn new(base: u32, limit: u32, access: AccessByte, flags: Flags) -> Self {
        Descriptor {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: access.bits(),
            limit_high_and_flags: (((limit >> 16) & 0x0F) as u8) | (flags.bits() & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    const fn null() -> Self {
        Descriptor { limit_low: 0, base_low: 0, base_mid: 0, access: 0, limit_high_and_flags: 0, base_high: 0 }
    }
}

/// Selector values, fixed by entry order: `index * 8 | rpl`.
pub const KERNEL_CODE_SELECTOR: u16 = 1 * 8;
pub const KERNEL_DATA_SELECTOR: u16 = 2 * 8;
pub const USER_CODE_SELECTOR: u16 = 3 * 8 | 3;
pub const USER_DATA_SELECTOR: u16 = 4 * 8 | 3;
pub const TSS_SELECTOR: u16 = 5 * 8;

#[repr(C, packed)]
struct Gdt {
    null: Descriptor,
    kernel_code: Descriptor,
    kernel_data: Descriptor,
    user_code: Descriptor,
    user_data: Descriptor,
    tss: Descriptor,
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

static mut GDT: Gdt = Gdt {
    null: Descriptor::null(),
    kernel_code: Descriptor::null(),
    kernel_data: Descriptor::null(),
    user_code: Descriptor::null(),
    user_data: Descriptor::null(),
    tss: Descriptor::null(),
};

/// Builds all six descriptors and loads `GDTR`. `tss` must already be
/// initialised (its `ss0`/`esp0` are set later, per-dispatch, by the
/// scheduler — only its address and size matter here). Reloads every
/// segment register and `TR`.
///
/// # Safety
/// Must run exactly once, before interrupts are enabled, and the `tss`
/// reference must outlive the GDT (it is `'static` in practice: the kernel
/// never frees its TSS).
pub unsafe fn init(tss: &'static Tss) {
    let flat_flags = Flags::SIZE_32BIT | Flags::GRANULARITY;
    let code_access = AccessByte::PRESENT | AccessByte::DESCRIPTOR_TYPE | AccessByte::EXECUTABLE | AccessByte::RW;
    let data_access = AccessByte::PRESENT | AccessByte::DESCRIPTOR_TYPE | AccessByte::RW;
    let user_code_access = code_access | AccessByte::DPL_RING3;
    let user_data_access = data_access | AccessByte::DPL_RING3;

    // present, ring 0, 32-bit TSS (available, not busy): type = 0x9.
    let tss_access = AccessByte::from_bits_truncate(0x89);
    let tss_base = tss as *const Tss as u32;
    let tss_limit = (core::mem::size_of::<Tss>() - 1) as u32;

    unsafe {
        GDT = Gdt {
            null: Descriptor::null(),
            kernel_code: Descriptor::new(0, 0xFFFFF, code_access, flat_flags),
            kernel_data: Descriptor::new(0, 0xFFFFF, data_access, flat_flags),
            user_code: Descriptor::new(0, 0xFFFFF, user_code_access, flat_flags),
            user_data: Descriptor::new(0, 0xFFFFF, user_data_access, flat_flags),
            tss: Descriptor::new(tss_base, tss_limit, tss_access, Flags::empty()),
        };

        let ptr = GdtPointer {
            limit: (core::mem::size_of::<Gdt>() - 1) as u16,
            base: &raw const GDT as u32,
        };

        asm!(
            "lgdt [{ptr}]",
            "mov ax, {kdata:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push {kcode}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {tss_sel:x}",
            "ltr ax",
            ptr = in(reg) &ptr,
            kdata = in(reg) KERNEL_DATA_SELECTOR,
            kcode = in(reg) KERNEL_CODE_SELECTOR as u32,
            tss_sel = in(reg) TSS_SELECTOR,
            out("eax") _,
            options(nostack),
        );
    }
}
