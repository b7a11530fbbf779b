//! ELF32 executable loader (`spec.md §4.10`). Validates the header, maps
//! each `PT_LOAD` segment into a fresh process directory, zero-fills BSS,
//! carves a fixed initial heap, and hands the process to the scheduler.
//! Grounded on `original_source/core/elf.cpp`.
use crate::config::{ELF_HEAP_MAX_GROWTH, ELF_INITIAL_HEAP_PAGES, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::memory::paging::{PageFlags, Paging};
use crate::scheduler::Pid;
use alloc::collections::BTreeMap;
use spin::Mutex;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32ProgramHeader {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

struct HeapSpan {
    start: usize,
    end: usize,
    max: usize,
}

static PROCESS_HEAPS: Mutex<BTreeMap<Pid, HeapSpan>> = Mutex::new(BTreeMap::new());

fn read_header(image: &[u8]) -> KernelResult<Elf32Header> {
    if image.len() < core::mem::size_of::<Elf32Header>() {
        return Err(KernelError::InvalidImage);
    }
    let header = unsafe { (image.as_ptr() as *const Elf32Header).read_unaligned() };
    if header.e_ident[0..4] != ELF_MAGIC || header.e_ident[4] != 1 /* ELFCLASS32 */ {
        return Err(KernelError::InvalidImage);
    }
    if header.e_type != ET_EXEC || header.e_machine != EM_386 {
        return Err(KernelError::InvalidImage);
    }
    Ok(header)
}

fn program_headers<'a>(image: &'a [u8], header: &Elf32Header) -> KernelResult<&'a [Elf32ProgramHeader]> {
    let count = header.e_phnum as usize;
    let entsize = header.e_phentsize as usize;
    if entsize != core::mem::size_of::<Elf32ProgramHeader>() {
        return Err(KernelError::InvalidImage);
    }
    let start = header.e_phoff as usize;
    let bytes_needed = count * entsize;
    if start.checked_add(bytes_needed).ok_or(KernelError::InvalidImage)? > image.len() {
        return Err(KernelError::InvalidImage);
    }
    Ok(unsafe { core::slice::from_raw_parts(image.as_ptr().add(start) as *const Elf32ProgramHeader, count) })
}

/// The page-aligned `[start, end)` virtual range a segment's mapping
/// spans, given its (possibly unaligned) `vaddr` and `memsz`. Split out
/// from [`load_executable`] so invariant #10 and the *ELF load* concrete
/// scenario (`spec.md §8`) can be checked without a live `Paging`/`Pmm`
/// singleton.
fn segment_page_range(vaddr: usize, memsz: usize) -> (usize, usize) {
    let start = vaddr & !(PAGE_SIZE - 1);
    let end = (vaddr + memsz).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    (start, end)
}

fn segment_flags(p_flags: u32) -> PageFlags {
    const PF_W: u32 = 1 << 1;
    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if p_flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }
    flags
}

/// Loads `image` as a fresh process: builds its page directory, maps every
/// `PT_LOAD` segment page-aligned (zero-filling the BSS tail), carves a
/// `ELF_INITIAL_HEAP_PAGES`-page initial heap capped at `ELF_HEAP_MAX_GROWTH`
/// bytes of later `sbrk` growth, and spawns its entry thread. Resolves the
/// fail-closed-on-unmapped-read Open Question (`spec.md §9`): a segment
/// whose `p_filesz` would require reading past `image`'s actual length
/// fails the whole load instead of reading through a bogus pointer.
pub fn load_executable(image: &[u8]) -> KernelResult<Pid> {
    let header = read_header(image)?;
    let phdrs = program_headers(image, &header)?;

    let dir = crate::globals::PAGING.create_process_directory(&crate::globals::PMM)?;
    let pid = crate::scheduler::SCHEDULER.create_process(dir);

    let mut image_end = 0usize;

    for ph in phdrs {
        if ph.p_type != PT_LOAD {
            continue;
        }

        let file_start = ph.p_offset as usize;
        let file_len = ph.p_filesz as usize;
        if file_start.checked_add(file_len).ok_or(KernelError::InvalidImage)? > image.len() {
            // fail closed: never read past what's actually backed by the image
            return Err(KernelError::InvalidImage);
        }

        let (vaddr_start, vaddr_end) = segment_page_range(ph.p_vaddr as usize, ph.p_memsz as usize);
        let flags = segment_flags(ph.p_flags);

        let mut vaddr = vaddr_start;
        while vaddr < vaddr_end {
            let frame = crate::globals::PMM.alloc_block()?;
            crate::globals::PAGING.map_page(dir, vaddr, frame, flags, &crate::globals::PMM)?;
            vaddr += PAGE_SIZE;
        }

        // Copy the file bytes, then zero the BSS tail (memsz - filesz), one
        // page at a time through the physical address `dir` maps each
        // virtual byte cursor to. `dir` is not the active directory (the
        // loader runs under the caller's own address space), so the target
        // pages are not reachable by dereferencing `p_vaddr` directly — only
        // `get_physical` resolves to something this side can dereference.
        // Resolves the fail-closed Open Question in `spec.md §9`: a lookup
        // miss abandons the load instead of writing through a bogus address.
        let mut cursor = ph.p_vaddr as usize;
        let mut remaining = file_len;
        let mut file_cursor = file_start;
        while remaining > 0 {
            let phys = crate::globals::PAGING.get_physical(dir, cursor);
            if phys == 0 {
                return Err(KernelError::InvalidImage);
            }
            let offset_in_page = cursor % PAGE_SIZE;
            let chunk = remaining.min(PAGE_SIZE - offset_in_page);
            let src = unsafe { image.as_ptr().add(file_cursor) };
            unsafe { core::ptr::copy_nonoverlapping(src, phys as *mut u8, chunk) };
            cursor += chunk;
            file_cursor += chunk;
            remaining -= chunk;
        }

        let mut bss_remaining = ph.p_memsz as usize - file_len;
        while bss_remaining > 0 {
            let phys = crate::globals::PAGING.get_physical(dir, cursor);
            if phys == 0 {
                return Err(KernelError::InvalidImage);
            }
            let offset_in_page = cursor % PAGE_SIZE;
            let chunk = bss_remaining.min(PAGE_SIZE - offset_in_page);
            unsafe { core::ptr::write_bytes(phys as *mut u8, 0, chunk) };
            cursor += chunk;
            bss_remaining -= chunk;
        }

        image_end = image_end.max(vaddr_end);
    }

    let heap_start = image_end;
    for i in 0..ELF_INITIAL_HEAP_PAGES {
        let frame = crate::globals::PMM.alloc_block()?;
        // Zero fresh heap pages up front so user code never reads stale
        // physical memory through a freshly `sbrk`-like-grown pointer.
        unsafe { core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE) };
        crate::globals::PAGING.map_page(
            dir,
            heap_start + i * PAGE_SIZE,
            frame,
            crate::syscalls::USER_HEAP_PAGE_FLAGS,
            &crate::globals::PMM,
        )?;
    }
    let heap_end = heap_start + ELF_INITIAL_HEAP_PAGES * PAGE_SIZE;

    PROCESS_HEAPS.lock().insert(pid, HeapSpan { start: heap_start, end: heap_end, max: heap_end + ELF_HEAP_MAX_GROWTH });

    crate::scheduler::SCHEDULER.spawn_thread(pid, header.e_entry as usize, 0);
    Ok(pid)
}

/// Grows the current process's heap by `increment` bytes, mapping fresh
/// frames as needed. Fails with `OutOfMemory` if the growth would cross
/// the process's `heap.max`.
pub fn grow_current_process_heap(increment: usize) -> KernelResult<usize> {
    let pid = crate::scheduler::SCHEDULER.current_pid().ok_or(KernelError::SyscallContractViolation)?;
    let dir = crate::scheduler::SCHEDULER.current_directory().ok_or(KernelError::SyscallContractViolation)?;

    let mut heaps = PROCESS_HEAPS.lock();
    let span = heaps.get_mut(&pid).ok_or(KernelError::SyscallContractViolation)?;

    let (new_end, old_end_page, new_end_page) = heap_growth_plan(span.end, increment, span.max)?;
    let mut vaddr = old_end_page;
    while vaddr < new_end_page {
        let frame = crate::globals::PMM.alloc_block()?;
        unsafe { core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE) };
        crate::globals::PAGING.map_page(dir, vaddr, frame, crate::syscalls::USER_HEAP_PAGE_FLAGS, &crate::globals::PMM)?;
        vaddr += PAGE_SIZE;
    }

    span.end = new_end;
    Ok(new_end)
}

pub fn current_process_heap_end() -> Option<usize> {
    let pid = crate::scheduler::SCHEDULER.current_pid()?;
    PROCESS_HEAPS.lock().get(&pid).map(|s| s.end)
}

/// Whether growing a heap span of `[_, end)` by `increment` stays within
/// `max` (`spec.md §4.9`), and if so the page-aligned `[old_end_page,
/// new_end_page)` range of fresh frames that growth requires. Split out
/// from [`grow_current_process_heap`] so it is unit-testable without a
/// live `Scheduler`/`Paging`/`Pmm` singleton.
fn heap_growth_plan(end: usize, increment: usize, max: usize) -> KernelResult<(usize, usize, usize)> {
    let new_end = end + increment;
    if new_end > max {
        return Err(KernelError::OutOfMemory);
    }
    let old_end_page = end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let new_end_page = new_end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    Ok((new_end, old_end_page, new_end_page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_page_range_matches_the_elf_load_scenario() {
        // spec.md §8's *ELF load* concrete scenario: vaddr=0x400000,
        // mem_size=4196 maps exactly two pages, ending at 0x402000.
        let (start, end) = segment_page_range(0x400000, 4196);
        assert_eq!(start, 0x400000);
        assert_eq!(end, 0x402000);
        assert_eq!((end - start) / PAGE_SIZE, 2);
    }

    #[test]
    fn segment_page_range_aligns_an_unaligned_vaddr_down() {
        let (start, end) = segment_page_range(0x400010, 10);
        assert_eq!(start, 0x400000);
        assert_eq!(end, 0x401000);
    }

    #[test]
    fn segment_page_range_exact_multiple_does_not_overallocate() {
        let (start, end) = segment_page_range(0x400000, 2 * PAGE_SIZE);
        assert_eq!(end - start, 2 * PAGE_SIZE);
    }

    /// Invariant #10 (`spec.md §8`): for `p_filesz <= p_memsz`, the
    /// loader's output has exactly `p_memsz` bytes mapped per segment,
    /// with `[0, p_filesz)` equal to the file content and `[p_filesz,
    /// p_memsz)` all zero. Modeled here as a pure oracle over the same
    /// file-copy-then-zero-fill contract `load_executable` applies
    /// page-by-page through physical pointers, since a live `Paging`/`Pmm`
    /// singleton is not available in a host-run test.
    fn mapped_segment_bytes(image: &[u8], file_start: usize, file_size: usize, vaddr: usize, memsz: usize) -> alloc::vec::Vec<u8> {
        let (start, end) = segment_page_range(vaddr, memsz);
        let offset = vaddr - start;
        let mut out = alloc::vec![0u8; end - start];
        out[offset..offset + file_size].copy_from_slice(&image[file_start..file_start + file_size]);
        out
    }

    #[test]
    fn invariant_10_holds_across_a_range_of_filesz_memsz_pairs() {
        let image: alloc::vec::Vec<u8> = (0..4096u32).map(|b| (b % 251) as u8).collect();
        for (file_size, memsz) in [(0usize, 1usize), (1, 1), (10, 4096), (100, 4196), (4096, 4096), (0, 8192)] {
            let mapped = mapped_segment_bytes(&image, 0, file_size, 0x400000, memsz);
            assert_eq!(mapped.len() % PAGE_SIZE, 0, "mapping must be a whole number of pages");
            assert!(mapped.len() >= memsz, "at least memsz bytes must be mapped");
            assert_eq!(&mapped[..file_size], &image[..file_size], "[0, p_filesz) must equal the file content");
            assert!(mapped[file_size..memsz].iter().all(|&b| b == 0), "[p_filesz, p_memsz) must be zero");
        }
    }

    #[test]
    fn elf_load_scenario_bytes_match_file_then_zero() {
        let mut image = alloc::vec![0u8; 100];
        for (i, b) in image.iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        let mapped = mapped_segment_bytes(&image, 0, 100, 0x400000, 4196);
        assert_eq!(&mapped[0..100], &image[..]);
        assert!(mapped[100..4196].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncated_header_is_rejected_as_invalid_image() {
        let short = alloc::vec![0u8; core::mem::size_of::<Elf32Header>() - 1];
        assert_eq!(read_header(&short), Err(KernelError::InvalidImage));
    }

    #[test]
    fn header_with_wrong_magic_is_rejected() {
        let mut image = alloc::vec![0u8; core::mem::size_of::<Elf32Header>()];
        image[0..4].copy_from_slice(b"\x7fELG"); // wrong fourth byte
        assert_eq!(read_header(&image), Err(KernelError::InvalidImage));
    }

    #[test]
    fn heap_growth_plan_rejects_growth_past_max() {
        assert_eq!(heap_growth_plan(0x1000, 0x2000, 0x2000), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn heap_growth_plan_maps_exactly_the_new_pages_needed() {
        let (new_end, old_end_page, new_end_page) = heap_growth_plan(0x1000, PAGE_SIZE, 1 << 20).unwrap();
        assert_eq!(new_end, 0x1000 + PAGE_SIZE);
        assert_eq!(old_end_page, PAGE_SIZE);
        assert_eq!(new_end_page, 2 * PAGE_SIZE);
    }

    #[test]
    fn heap_growth_plan_within_the_same_page_needs_no_new_frames() {
        // `end` sits mid-page (already mapped through the next boundary);
        // growing by a few bytes must not require a fresh page.
        let (_, old_end_page, new_end_page) = heap_growth_plan(0x1008, 8, 1 << 20).unwrap();
        assert_eq!(old_end_page, new_end_page, "growth that stays inside the current page maps nothing new");
    }
}
