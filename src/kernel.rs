//! The kernel context root aggregate. Per the Design Note in `spec.md §9`
//! ("global singletons reached through mutable static pointers... replace
//! with a boot-time constructed root object"), this is the typed
//! replacement for `original_source/core/globals.cpp`'s `g_paging`/
//! `g_scheduler`/`g_driverManager`/... raw pointers: one object, built once
//! in `kmain`, that owns the handful of boot-time-only values (the kernel
//! image's physical bounds, the parsed Multiboot info, the TSS the GDT
//! needs a `'static` reference to) that have nowhere else to live. Every
//! other subsystem is already its own `'static` singleton
//! (`crate::globals::{PMM, PAGING, KERNEL_HEAP}`, `crate::scheduler::SCHEDULER`,
//! `crate::symbols::SYMBOLS`) for exactly the same reason `original_source/`
//! gives for its globals — a single-CPU kernel has exactly one of each —
//! but reached through a typed, interior-mutable reference instead of a
//! bare pointer anyone could null out or alias incorrectly.
use crate::interrupts::tss::Tss;
use crate::multiboot::{MbBootInfo, MemoryRegionType, MULTIBOOT_BOOTLOADER_MAGIC};

/// Physical memory owned by the running kernel image, as the linker script
/// placed it (`spec.md §3`).
#[derive(Clone, Copy, Debug)]
pub struct KernelImage {
    pub start: usize,
    pub end: usize,
}

/// Everything `KernelContext::boot` learns once, during boot, that no
/// other subsystem is a natural home for.
pub struct KernelContext {
    pub image: KernelImage,
    pub mb_info: MbBootInfo,
}

/// The kernel's own Task State Segment. The GDT needs a `'static`
/// reference to it before any ring-3→ring-0 transition can safely use
/// `esp0`; there is exactly one, so it lives here rather than inside
/// `KernelContext` itself (which is only ever reached by value, once,
/// from `kmain`).
static mut TSS: Tss = Tss::new();

/// Bytes of headroom left between the kernel image's BSS end and the
/// frame bitmap `Pmm::init` places there, matching
/// `original_source/kernel.cpp`'s `init_memory` padding before the first
/// frame is considered free.
const BITMAP_PLACEMENT_PADDING: usize = 4 * 1024 * 1024;

impl KernelContext {
    /// Runs the entire boot sequence and returns the assembled context.
    /// Order: serial + logging first (so every later step can report what
    /// it is doing), GDT/TSS, the frame bitmap and kernel heap sized from
    /// the Multiboot memory map, paging, the interrupt/exception dispatch
    /// core, the scheduler's idle thread, and finally a handful of
    /// well-known symbols registered for the panic-screen stack trace.
    /// Interrupts are left disabled throughout — the caller enables them
    /// with a single `sti` once every subsystem above is live, mirroring
    /// `original_source/kernel.cpp`'s `g_interrupts->Activate()` right
    /// before its idle loop.
    ///
    /// # Safety
    /// Must run exactly once, immediately after the boot trampoline hands
    /// control to Rust, with interrupts still disabled and `mb_info_addr`
    /// still pointing at the loader-supplied Multiboot info structure.
    pub unsafe fn boot(magic: u32, mb_info_addr: usize) -> Self {
        crate::serial::init();
        crate::logger::init();

        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            log::warn!("unexpected multiboot magic {:#x}, continuing anyway", magic);
        }

        let mb_info = unsafe { MbBootInfo::new(mb_info_addr) };
        let image = KernelImage { start: crate::boot::kernel_start(), end: crate::boot::kernel_end() };
        log::info!("kernel image: {:#x}-{:#x}", image.start, image.end);

        unsafe { crate::interrupts::gdt::init(&*core::ptr::addr_of!(TSS)) };

        let ram_end = ram_end_from_memory_map(&mb_info, image);
        Self::init_memory(image, ram_end);

        let dir = unsafe { crate::globals::PAGING.activate(&crate::globals::PMM) }.expect("paging activation must succeed");

        unsafe { crate::interrupts::init() };

        crate::scheduler::SCHEDULER.init(dir);

        let _ = crate::symbols::SYMBOLS.register("kmain", crate::boot::kernel_start());

        log::info!(
            "boot complete: {} KiB RAM, {} frames free",
            ram_end / 1024,
            crate::globals::PMM.max_blocks() - crate::globals::PMM.used_blocks()
        );

        KernelContext { image, mb_info }
    }

    /// Places the frame bitmap just past the kernel image (with a
    /// `BITMAP_PLACEMENT_PADDING` safety margin), reclaims every frame of
    /// RAM above it as free, then carves the kernel heap out of the
    /// remainder — capped at the identity-mapped kernel window ceiling,
    /// since nothing past it is addressable until a process maps it
    /// explicitly. Grounded on `original_source/kernel.cpp`'s
    /// `init_memory`.
    fn init_memory(image: KernelImage, ram_end: usize) {
        let bitmap_base = page_align_up(image.end + BITMAP_PLACEMENT_PADDING);
        unsafe { crate::globals::PMM.init(bitmap_base, ram_end) };

        let bitmap_bytes = (ram_end / crate::config::PAGE_SIZE).div_ceil(8);
        let usable_start = page_align_up(bitmap_base + bitmap_bytes);
        crate::globals::PMM.init_region(usable_start, ram_end - usable_start);

        let window_ceiling = crate::globals::PAGING.kernel_window_end() - crate::config::PAGE_SIZE;
        let safe_limit = ram_end.min(window_ceiling);
        assert!(safe_limit > usable_start, "not enough memory left for a kernel heap");

        let heap_blocks = (safe_limit - usable_start) / crate::config::PAGE_SIZE;
        let heap_start = crate::globals::PMM.alloc_blocks(heap_blocks).expect("heap region must be free");
        let heap_size = heap_blocks * crate::config::PAGE_SIZE;

        log::info!("kernel heap: {:#x}-{:#x} ({} MiB)", heap_start, heap_start + heap_size, heap_size / (1024 * 1024));
        crate::globals::KERNEL_HEAP.init(heap_start, heap_size);
    }
}

fn page_align_up(addr: usize) -> usize {
    (addr + crate::config::PAGE_SIZE - 1) & !(crate::config::PAGE_SIZE - 1)
}

/// Finds the Multiboot memory-map entry the kernel image was loaded into
/// and returns its end address, matching
/// `original_source/kernel.cpp`'s `get_kernel_memory_map` search. Falls
/// back to the widest `Available` entry, then to `basic_memory_bytes`,
/// if no entry happens to contain the image (e.g. a loader that reports
/// the kernel's region split across two map entries).
fn ram_end_from_memory_map(mb_info: &MbBootInfo, image: KernelImage) -> usize {
    if let Some(entries) = mb_info.memory_map() {
        let mut widest_end = 0usize;
        for entry in entries {
            if entry.region_type != MemoryRegionType::Available {
                continue;
            }
            let start = entry.base_addr as usize;
            let end = start.saturating_add(entry.length as usize);
            if start <= image.start && image.start < end {
                return end;
            }
            widest_end = widest_end.max(end);
        }
        if widest_end > 0 {
            return widest_end;
        }
    }

    mb_info
        .basic_memory_bytes()
        .map(|bytes| bytes as usize)
        .unwrap_or(image.end + 16 * 1024 * 1024)
}
