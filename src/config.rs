//! Build-time constants shared across the kernel. Centralised here rather
//! than scattered as magic numbers at each call site.

/// Size in bytes of a frame/page on IA-32 with 4 KiB paging.
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in a page directory or page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Upper bound (exclusive) of the kernel window identity map: `[0, 256 MiB)`.
pub const KERNEL_WINDOW_END: usize = 256 * 1024 * 1024;

/// Lower bound (inclusive) of the hardware window identity map: `[3 GiB, 4 GiB)`.
pub const HARDWARE_WINDOW_START: usize = 3 * 1024 * 1024 * 1024;

/// Upper bound (exclusive) of the hardware window.
pub const HARDWARE_WINDOW_END: usize = 0usize.wrapping_sub(1) - (PAGE_SIZE - 1);

/// PIT frequency: a 1 kHz preemption tick.
pub const TIMER_HZ: u32 = 1000;

/// Base I/O port of the first PC16550-compatible serial port.
pub const SERIAL_COM1: u16 = 0x3F8;

/// Maximum number of registered kernel symbols (`spec.md §4.7`).
pub const MAX_KERNEL_SYMBOLS: usize = 1024;

/// Maximum length, in bytes, compared during a kernel symbol lookup.
pub const MAX_SYMBOL_NAME_LEN: usize = 64;

/// Number of pages carved for a freshly loaded ELF executable's initial heap.
pub const ELF_INITIAL_HEAP_PAGES: usize = 64;

/// Maximum growth, in bytes, a process heap may reach via `sbrk` above its
/// initial end, per `spec.md §4.9`.
pub const ELF_HEAP_MAX_GROWTH: usize = 16 * 1024 * 1024;

/// Number of device slots in a driver manifest (`spec.md §3`).
pub const DRIVER_MANIFEST_DEVICE_SLOTS: usize = 4;

/// Expected magic value of a driver manifest section.
pub const DRIVER_INFO_MAGIC: u32 = 0xD12_1E40;

/// Name of the factory symbol every relocatable driver object must export.
pub const DRIVER_FACTORY_SYMBOL: &str = "CreateDriverInstance";

/// Bound used by the stack-trace walk: frame pointers outside
/// `[STACK_WALK_LOW, STACK_WALK_HIGH)` terminate the walk.
pub const STACK_WALK_LOW: usize = 0x1000;
pub const STACK_WALK_HIGH: usize = KERNEL_WINDOW_END;

/// Symbol resolution rejects an `eip - symbol.address` offset larger than this.
pub const SYMBOL_OFFSET_SANITY_BOUND: usize = 1024 * 1024;

/// Maximum bytes `sys_debug` (`spec.md §4.6`) scans looking for a
/// terminating NUL before giving up, so a caller can't make the kernel
/// scan unbounded memory for one.
pub const DEBUG_STRING_MAX_LEN: usize = 256;

/// The only byte widths `sys_peek_memory` (`spec.md §4.6`) accepts.
pub const PEEK_MEMORY_VALID_SIZES: [usize; 3] = [1, 2, 4];
