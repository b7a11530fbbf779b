//! Multiboot v1 header and the protected-mode entry trampoline.
//!
//! The loader (GRUB or compatible) has already switched the CPU to 32-bit
//! protected mode with paging disabled and handed control to the ELF entry
//! point named in `linker.ld` (`multiboot_entry`), with `eax` holding the
//! Multiboot magic (`0x2BADB002`) and `ebx` a pointer to the `multiboot_info`
//! structure (see `crate::multiboot`). Unlike a PSE/4 MiB-page early-paging
//! bootstrap, this kernel builds its real page directory in Rust
//! (`crate::paging::Paging::activate`), so the only job here is: set up a
//! stack, load a minimal flat GDT so the segment registers don't depend on
//! whatever the loader left behind, and call into `kmain` with the two
//! boot-time values preserved.
use core::arch::global_asm;

/// Size of the temporary stack used before the scheduler creates the first
/// kernel thread's own stack.
pub const BOOT_STACK_SIZE: usize = 16 * 1024;

const MULTIBOOT_MAGIC: u32 = 0x1BADB002;
const MULTIBOOT_FLAG_ALIGN: u32 = 1 << 0;
const MULTIBOOT_FLAG_MEMINFO: u32 = 1 << 1;
const MULTIBOOT_FLAGS: u32 = MULTIBOOT_FLAG_ALIGN | MULTIBOOT_FLAG_MEMINFO;
const MULTIBOOT_CHECKSUM: u32 = (0u32)
    .wrapping_sub(MULTIBOOT_MAGIC)
    .wrapping_sub(MULTIBOOT_FLAGS);

global_asm!(
    r#"
.section .multiboot.header, "a"
.align 4
    .long {magic}
    .long {flags}
    .long {checksum}

.section .boot.stack, "aw", @nobits
.align 16
boot_stack_bottom:
    .skip {stack_size}
boot_stack_top:

.section .boot.text, "ax"
.global multiboot_entry
.type multiboot_entry, @function
multiboot_entry:
    mov esp, offset boot_stack_top
    xor ebp, ebp

    # preserve the loader-supplied magic (eax) and info pointer (ebx)
    # across the GDT reload, then pass them as kmain(magic, info_ptr)
    push ebx
    push eax

    lgdt [boot_gdt_ptr]

    push 0x08 # flat kernel code segment
    mov eax, offset .Lreload_cs
    push eax
    retf
.Lreload_cs:
    mov ax, 0x10 # flat kernel data segment
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax

    call kmain
    # kmain never returns
    ud2

.section .boot.data, "aw"
.align 8
boot_gdt:
    .quad 0                   # null
    .quad 0x00cf9a000000ffff  # 0x08: flat code, ring 0
    .quad 0x00cf92000000ffff  # 0x10: flat data, ring 0
boot_gdt_ptr:
    .word . - boot_gdt - 1
    .long boot_gdt
"#,
    magic = const MULTIBOOT_MAGIC,
    flags = const MULTIBOOT_FLAGS,
    checksum = const MULTIBOOT_CHECKSUM,
    stack_size = const BOOT_STACK_SIZE,
);

unsafe extern "C" {
    pub static KERNEL_START: u8;
    pub static KERNEL_END: u8;
    pub static KERNEL_TEXT_START: u8;
    pub static KERNEL_TEXT_END: u8;
    pub static KERNEL_RODATA_START: u8;
    pub static KERNEL_RODATA_END: u8;
    pub static KERNEL_DATA_START: u8;
    pub static KERNEL_DATA_END: u8;
    pub static KERNEL_BSS_START: u8;
    pub static KERNEL_BSS_END: u8;
}

/// Physical address of the first byte of the kernel image, as placed by the linker.
pub fn kernel_start() -> usize {
    unsafe { &KERNEL_START as *const u8 as usize }
}

/// Physical address one past the last byte of the kernel image.
pub fn kernel_end() -> usize {
    unsafe { &KERNEL_END as *const u8 as usize }
}
