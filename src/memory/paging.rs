//! Two-level IA-32 paging (`spec.md §4.3`). Builds the master kernel page
//! directory identity-mapping the kernel window `[0, 256 MiB)` and the
//! hardware window `[3 GiB, 4 GiB)`; clones the shared entries into every
//! process directory; maps/unmaps arbitrary pages; answers
//! virtual-to-physical lookups. Grounded on `original_source/core/paging.cpp`
//! for the exact bit-shift and flag semantics; the directory/table types
//! follow the value-wrapper Design Note in `spec.md §9` rather than exposing
//! raw pointers, adapted from the teacher's `memory/pages/page_table/` idiom
//! (reshaped from four x86_64 levels down to the two IA-32 uses).
use crate::config::{HARDWARE_WINDOW_START, KERNEL_WINDOW_END, PAGE_SIZE, PAGE_TABLE_ENTRIES};
use crate::error::{KernelError, KernelResult};
use crate::memory::pmm::Pmm;
use core::arch::asm;
use spin::Mutex;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
    }
}

const DIR_FIRST_KERNEL_ENTRY: usize = 0;
const DIR_LAST_KERNEL_ENTRY: usize = KERNEL_WINDOW_END / (PAGE_SIZE * PAGE_TABLE_ENTRIES) - 1; // 63
const DIR_FIRST_HW_ENTRY: usize = HARDWARE_WINDOW_START / (PAGE_SIZE * PAGE_TABLE_ENTRIES); // 768
const DIR_LAST_HW_ENTRY: usize = PAGE_TABLE_ENTRIES - 1; // 1023

/// A page directory, identified only by the physical (== identity-mapped
/// virtual, while still inside the kernel window) address of its frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory(pub usize);

impl PageDirectory {
    fn entry_addr(&self, index: usize) -> *mut u32 {
        (self.0 + index * 4) as *mut u32
    }

    fn entry(&self, index: usize) -> u32 {
        unsafe { self.entry_addr(index).read() }
    }

    unsafe fn set_entry(&self, index: usize, value: u32) {
        unsafe { self.entry_addr(index).write(value) };
    }

    fn zero(&self) {
        for i in 0..PAGE_TABLE_ENTRIES {
            unsafe { self.set_entry(i, 0) };
        }
    }
}

pub struct Paging {
    master: Mutex<Option<PageDirectory>>,
}

impl Paging {
    pub const fn new() -> Self {
        Paging { master: Mutex::new(None) }
    }

    /// Builds the master directory: allocates it below the kernel window
    /// ceiling (so the kernel can still address it once paging is on),
    /// fills entries `0..=63` with an identity map of `[0, 256 MiB)` and
    /// entries `768..=1023` with an identity map of `[3 GiB, 4 GiB)`, both
    /// {Present, Writable}, no user bit, loads it into CR3 and sets the
    /// paging-enable bit in CR0.
    ///
    /// # Safety
    /// Must run exactly once, with `pmm` already initialised, and before
    /// anything depends on paging being off. Touches `cr3`/`cr0` directly —
    /// only meaningful from kernel (ring 0) code; never call this from a
    /// hosted test.
    pub unsafe fn activate(&self, pmm: &Pmm) -> KernelResult<PageDirectory> {
        let dir = self.build_master_directory(pmm)?;
        unsafe {
            Self::load_directory(dir);
            Self::enable_paging_bit();
        }
        Ok(dir)
    }

    /// The pure, hardware-free half of [`Paging::activate`]: builds and
    /// registers the master directory without touching `cr3`/`cr0`. Split
    /// out so host-run unit tests can exercise the identity-map bitmap
    /// logic without attempting a privileged instruction as an unprivileged
    /// process.
    pub fn build_master_directory(&self, pmm: &Pmm) -> KernelResult<PageDirectory> {
        let dir_addr = pmm.alloc_block_low(KERNEL_WINDOW_END)?;
        let dir = PageDirectory(dir_addr);
        dir.zero();

        Self::identity_map_range(&dir, pmm, DIR_FIRST_KERNEL_ENTRY, DIR_LAST_KERNEL_ENTRY)?;
        Self::identity_map_range(&dir, pmm, DIR_FIRST_HW_ENTRY, DIR_LAST_HW_ENTRY)?;

        *self.master.lock() = Some(dir);
        Ok(dir)
    }

    fn identity_map_range(
        dir: &PageDirectory,
        pmm: &Pmm,
        first_entry: usize,
        last_entry: usize,
    ) -> KernelResult<()> {
        for pd_idx in first_entry..=last_entry {
            let table_addr = pmm.alloc_block_low(KERNEL_WINDOW_END)?;
            let table = PageDirectory(table_addr); // reuse the zero/entry helpers; it's just a 1024-u32 array
            table.zero();

            for pt_idx in 0..PAGE_TABLE_ENTRIES {
                let vaddr = pd_idx * PAGE_SIZE * PAGE_TABLE_ENTRIES + pt_idx * PAGE_SIZE;
                let leaf = (vaddr as u32) | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
                unsafe { table.set_entry(pt_idx, leaf) };
            }

            let dir_entry = (table_addr as u32)
                | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
            unsafe { dir.set_entry(pd_idx, dir_entry) };
        }
        Ok(())
    }

    /// Allocates a fresh directory, zeroes it, and copies the master
    /// entries for both windows. User space (entries 64..767) is left
    /// empty. The returned directory is aliased with the master only by
    /// entry value: later mutations of either do not propagate.
    pub fn create_process_directory(&self, pmm: &Pmm) -> KernelResult<PageDirectory> {
        let master = self.master.lock().expect("Paging::activate must run first");
        let dir_addr = pmm.alloc_block_low(KERNEL_WINDOW_END)?;
        let dir = PageDirectory(dir_addr);
        dir.zero();

        for i in DIR_FIRST_KERNEL_ENTRY..=DIR_LAST_KERNEL_ENTRY {
            unsafe { dir.set_entry(i, master.entry(i)) };
        }
        for i in DIR_FIRST_HW_ENTRY..=DIR_LAST_HW_ENTRY {
            unsafe { dir.set_entry(i, master.entry(i)) };
        }

        Ok(dir)
    }

    /// Frees every leaf frame mapped by a process's own page tables, the
    /// tables themselves, and the directory frame. Does not touch
    /// kernel/hardware-window entries — those tables and frames belong to
    /// the master directory, not this one.
    pub fn destroy_process_directory(&self, pmm: &Pmm, dir: PageDirectory) {
        for pd_idx in DIR_LAST_KERNEL_ENTRY + 1..DIR_FIRST_HW_ENTRY {
            let entry = dir.entry(pd_idx);
            if entry & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let table = PageDirectory((entry & !0xFFF) as usize);
            for pt_idx in 0..PAGE_TABLE_ENTRIES {
                let leaf = table.entry(pt_idx);
                if leaf & PageFlags::PRESENT.bits() != 0 {
                    pmm.free_block((leaf & !0xFFF) as usize);
                }
            }
            pmm.free_block(table.0);
        }
        pmm.free_block(dir.0);
    }

    /// Splits `vaddr` into a directory index (top 10 bits) and table index
    /// (middle 10 bits). Lazily allocates a page table, below the kernel
    /// window ceiling, if the directory slot is empty. Writes the leaf
    /// entry and invalidates the TLB entry for `vaddr`.
    pub fn map_page(&self, dir: PageDirectory, vaddr: usize, paddr: usize, flags: PageFlags, pmm: &Pmm) -> KernelResult<()> {
        let pd_idx = vaddr >> 22;
        let pt_idx = (vaddr >> 12) & 0x3FF;

        let mut dir_entry = dir.entry(pd_idx);
        if dir_entry & PageFlags::PRESENT.bits() == 0 {
            let table_addr = pmm.alloc_block_low(KERNEL_WINDOW_END)?;
            let table = PageDirectory(table_addr);
            table.zero();
            dir_entry = (table_addr as u32)
                | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
            unsafe { dir.set_entry(pd_idx, dir_entry) };
        }

        let table = PageDirectory((dir_entry & !0xFFF) as usize);
        let leaf = (paddr as u32) | flags.bits();
        unsafe { table.set_entry(pt_idx, leaf) };

        unsafe { invalidate_page(vaddr) };
        Ok(())
    }

    pub fn unmap_page(&self, dir: PageDirectory, vaddr: usize) {
        let pd_idx = vaddr >> 22;
        let pt_idx = (vaddr >> 12) & 0x3FF;

        let dir_entry = dir.entry(pd_idx);
        if dir_entry & PageFlags::PRESENT.bits() == 0 {
            return;
        }
        let table = PageDirectory((dir_entry & !0xFFF) as usize);
        unsafe { table.set_entry(pt_idx, 0) };
        unsafe { invalidate_page(vaddr) };
    }

    /// Walks `dir`; returns `0` when any level along the path is not present.
    pub fn get_physical(&self, dir: PageDirectory, vaddr: usize) -> usize {
        let pd_idx = vaddr >> 22;
        let pt_idx = (vaddr >> 12) & 0x3FF;

        let dir_entry = dir.entry(pd_idx);
        if dir_entry & PageFlags::PRESENT.bits() == 0 {
            return 0;
        }
        let table = PageDirectory((dir_entry & !0xFFF) as usize);
        let leaf = table.entry(pt_idx);
        if leaf & PageFlags::PRESENT.bits() == 0 {
            return 0;
        }

        (leaf as usize & !0xFFF) | (vaddr & 0xFFF)
    }

    pub fn master_directory(&self) -> PageDirectory {
        self.master.lock().expect("Paging::activate must run first")
    }

    /// The actual ceiling of the kernel window's identity map, as built at
    /// boot. Used by `sys_peek_memory` instead of a hardcoded constant
    /// (resolves the Open Question in `spec.md §9`).
    pub fn kernel_window_end(&self) -> usize {
        KERNEL_WINDOW_END
    }

    unsafe fn load_directory(dir: PageDirectory) {
        unsafe {
            asm!("mov cr3, {0}", in(reg) dir.0, options(nostack, preserves_flags));
        }
    }

    unsafe fn enable_paging_bit() {
        unsafe {
            asm!(
                "mov {tmp}, cr0",
                "or {tmp}, 0x80000000",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags),
            );
        }
    }

    pub fn switch_directory(dir: PageDirectory) {
        unsafe { Self::load_directory(dir) };
    }
}

unsafe fn invalidate_page(vaddr: usize) {
    unsafe {
        asm!("invlpg [{0}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}

/// Checked `map_page` entry point returning `MapFault`-adjacent information
/// is intentionally not part of the public API: `spec.md §7` specifies
/// `MapFault` is only observed indirectly via a CPU page-fault exception,
/// never as a `Result` from `map_page` itself.
pub fn null_frame_error() -> KernelError {
    KernelError::OutOfMemory
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;

    // These tests run on the host's own default target (see
    // `.cargo/config.toml`), where `std` is available; `no_std` applies only
    // to the real kernel binary. They build the master directory through
    // `build_master_directory` rather than `activate`, since the latter's
    // `cr3`/`cr0` writes are privileged instructions this process cannot
    // issue.
    fn new_paging_with_identity(ram_end: usize) -> (Pmm, Paging, std::vec::Vec<u8>) {
        let pmm = Pmm::new();
        let bitmap_bytes = (ram_end / PAGE_SIZE).div_ceil(8);
        let mut storage = std::vec![0u8; bitmap_bytes];
        unsafe { pmm.init(storage.as_mut_ptr() as usize, ram_end) };
        pmm.init_region(0, ram_end);
        let paging = Paging::new();
        (pmm, paging, storage)
    }

    #[test]
    fn paging_identity_scenario() {
        let (pmm, paging, _storage) = new_paging_with_identity(512 * 1024 * 1024);
        let dir = paging.build_master_directory(&pmm).unwrap();

        for vaddr in [0usize, 1024 * 1024, 200 * 1024 * 1024] {
            assert_eq!(paging.get_physical(dir, vaddr), vaddr, "vaddr={vaddr:#x}");
        }
    }

    #[test]
    fn process_directory_shares_kernel_and_hardware_entries() {
        let (pmm, paging, _storage) = new_paging_with_identity(512 * 1024 * 1024);
        let master = paging.build_master_directory(&pmm).unwrap();
        let proc_dir = paging.create_process_directory(&pmm).unwrap();

        for i in DIR_FIRST_KERNEL_ENTRY..=DIR_LAST_KERNEL_ENTRY {
            assert_eq!(proc_dir.entry(i), master.entry(i));
        }
        for i in DIR_FIRST_HW_ENTRY..=DIR_LAST_HW_ENTRY {
            assert_eq!(proc_dir.entry(i), master.entry(i));
        }
        for i in (DIR_LAST_KERNEL_ENTRY + 1)..DIR_FIRST_HW_ENTRY {
            assert_eq!(proc_dir.entry(i), 0);
        }
    }

    #[test]
    fn destroy_process_directory_frees_leaf_frames() {
        let (pmm, paging, _storage) = new_paging_with_identity(64 * 1024 * 1024);
        paging.build_master_directory(&pmm).unwrap();
        let used_before = pmm.used_blocks();

        let dir = paging.create_process_directory(&pmm).unwrap();
        let vaddr = 300 * 1024 * 1024;
        let paddr = pmm.alloc_block().unwrap();
        paging.map_page(dir, vaddr, paddr, PageFlags::PRESENT | PageFlags::WRITABLE, &pmm).unwrap();
        assert!(pmm.used_blocks() > used_before);

        paging.destroy_process_directory(&pmm, dir);
        assert_eq!(pmm.used_blocks(), used_before);
    }

    #[test]
    fn map_page_then_get_physical_round_trips() {
        let (pmm, paging, _storage) = new_paging_with_identity(64 * 1024 * 1024);
        let dir = paging.build_master_directory(&pmm).unwrap();

        let vaddr = 300 * 1024 * 1024; // outside the identity-mapped window
        let paddr = pmm.alloc_block().unwrap();
        paging.map_page(dir, vaddr, paddr, PageFlags::PRESENT | PageFlags::WRITABLE, &pmm).unwrap();

        assert_eq!(paging.get_physical(dir, vaddr + 0x10), (paddr & !0xFFF) | 0x10);
    }
}
