//! Physical Memory Manager (`spec.md §4.1`). A bitmap over every 4 KiB
//! frame of RAM, one bit per frame, `0` = free. Grounded on
//! `original_source/core/pmm.cpp`'s `pmm_mmap_*`/`pmm_alloc_*`/`pmm_free_*`
//! family; the bitmap storage itself reuses the teacher's
//! `data_structures::BitmapRefMut` borrowed-bitmap type.
use crate::config::PAGE_SIZE;
use crate::data_structures::bitmap_ref_mut::BitmapRefMut;
use crate::error::{KernelError, KernelResult};
use spin::Mutex;

pub struct Pmm(Mutex<PmmInner>);

struct PmmInner {
    bitmap: Option<BitmapRefMut<'static>>,
    max_blocks: usize,
    used_blocks: usize,
}

unsafe impl Send for Pmm {}
unsafe impl Sync for Pmm {}

impl Pmm {
    pub const fn new() -> Self {
        Pmm(Mutex::new(PmmInner {
            bitmap: None,
            max_blocks: 0,
            used_blocks: 0,
        }))
    }

    /// Places the frame bitmap at `bitmap_base` and declares every frame in
    /// `[0, ram_end)` used by default. Callers reclaim specific ranges with
    /// [`Pmm::init_region`]. `bitmap_base` must be page-aligned and point at
    /// memory the caller already knows is safe to write (typically just
    /// above the kernel image).
    ///
    /// # Safety
    /// `bitmap_base` must be valid for writes of `ram_end / 4096 / 8` bytes
    /// and must outlive the `Pmm`.
    pub unsafe fn init(&self, bitmap_base: usize, ram_end: usize) {
        let max_blocks = ram_end / PAGE_SIZE;
        let bitmap_bytes = max_blocks.div_ceil(8);

        let mut bitmap = unsafe {
            BitmapRefMut::from_raw_parts_mut(bitmap_base as *mut u8, bitmap_bytes, Some(max_blocks))
        };
        bitmap.fill(true);

        let mut inner = self.0.lock();
        inner.bitmap = Some(bitmap);
        inner.max_blocks = max_blocks;
        inner.used_blocks = max_blocks;
    }

    /// Marks `⌊len/4096⌋` frames starting at `base` free, making them
    /// available to [`Pmm::alloc_block`].
    pub fn init_region(&self, base: usize, len: usize) {
        let mut inner = self.0.lock();
        let start_block = base / PAGE_SIZE;
        let count = len / PAGE_SIZE;
        for i in 0..count {
            let block = start_block + i;
            if inner.bitmap.as_mut().unwrap().get(block) == Some(true) {
                inner.bitmap.as_mut().unwrap().set(block, false);
                inner.used_blocks -= 1;
            }
        }
    }

    /// Marks `⌊len/4096⌋` frames starting at `base` used again, undoing the
    /// effect of [`Pmm::init_region`] without touching `used_blocks`'
    /// accounting for frames already used.
    pub fn deinit_region(&self, base: usize, len: usize) {
        let mut inner = self.0.lock();
        let start_block = base / PAGE_SIZE;
        let count = len / PAGE_SIZE;
        for i in 0..count {
            let block = start_block + i;
            if inner.bitmap.as_mut().unwrap().get(block) == Some(false) {
                inner.bitmap.as_mut().unwrap().set(block, true);
                inner.used_blocks += 1;
            }
        }
    }

    fn first_free(inner: &PmmInner) -> Option<usize> {
        let bitmap = inner.bitmap.as_ref()?;
        (0..inner.max_blocks).find(|&b| bitmap.get(b) == Some(false))
    }

    fn first_free_run(inner: &PmmInner, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let bitmap = inner.bitmap.as_ref()?;
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for b in 0..inner.max_blocks {
            if bitmap.get(b) == Some(false) {
                if run_len == 0 {
                    run_start = b;
                }
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Allocates a single free frame. Fails with [`KernelError::OutOfMemory`]
    /// when every bit is set.
    pub fn alloc_block(&self) -> KernelResult<usize> {
        let mut inner = self.0.lock();
        let block = Self::first_free(&inner).ok_or(KernelError::OutOfMemory)?;
        inner.bitmap.as_mut().unwrap().set(block, true);
        inner.used_blocks += 1;
        Ok(block * PAGE_SIZE)
    }

    /// Allocates a single free frame whose address is strictly below `limit`.
    /// Used by paging to keep page-table frames inside the identity-mapped
    /// kernel window even before the rest of the directory is built.
    pub fn alloc_block_low(&self, limit: usize) -> KernelResult<usize> {
        let mut inner = self.0.lock();
        let bound = limit / PAGE_SIZE;
        let bitmap = inner.bitmap.as_ref().ok_or(KernelError::OutOfMemory)?;
        let block = (0..bound.min(inner.max_blocks))
            .find(|&b| bitmap.get(b) == Some(false))
            .ok_or(KernelError::OutOfMemory)?;
        inner.bitmap.as_mut().unwrap().set(block, true);
        inner.used_blocks += 1;
        Ok(block * PAGE_SIZE)
    }

    /// Allocates `n` contiguous free frames. `n == 0` returns `0` (the null
    /// sentinel from `spec.md §4.1`) without touching the bitmap.
    pub fn alloc_blocks(&self, n: usize) -> KernelResult<usize> {
        if n == 0 {
            return Ok(0);
        }
        let mut inner = self.0.lock();
        let start = Self::first_free_run(&inner, n).ok_or(KernelError::OutOfMemory)?;
        for b in start..start + n {
            inner.bitmap.as_mut().unwrap().set(b, true);
        }
        inner.used_blocks += n;
        Ok(start * PAGE_SIZE)
    }

    pub fn free_block(&self, addr: usize) {
        self.free_blocks(addr, 1);
    }

    pub fn free_blocks(&self, addr: usize, n: usize) {
        if n == 0 {
            return;
        }
        let mut inner = self.0.lock();
        let start = addr / PAGE_SIZE;
        for b in start..start + n {
            if inner.bitmap.as_mut().unwrap().get(b) == Some(true) {
                inner.bitmap.as_mut().unwrap().set(b, false);
                inner.used_blocks -= 1;
            }
        }
    }

    pub fn used_blocks(&self) -> usize {
        self.0.lock().used_blocks
    }

    pub fn max_blocks(&self) -> usize {
        self.0.lock().max_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pmm(bytes: &mut [u8], ram_end: usize) -> Pmm {
        let pmm = Pmm::new();
        unsafe { pmm.init(bytes.as_mut_ptr() as usize, ram_end) };
        pmm
    }

    #[test]
    fn wraparound_scenario() {
        // init(4 MiB, 16 MiB): region [4MiB, 16MiB) is reclaimed, the rest
        // stays used by default, matching the concrete scenario in spec.md §8.
        let ram_end = 16 * 1024 * 1024;
        let mut bitmap_storage = [0u8; (16 * 1024 * 1024 / 4096) / 8];
        let pmm = new_pmm(&mut bitmap_storage, ram_end);
        pmm.init_region(4 * 1024 * 1024, 12 * 1024 * 1024);

        let a = pmm.alloc_block().unwrap();
        let b = pmm.alloc_block().unwrap();
        let c = pmm.alloc_block().unwrap();
        let d = pmm.alloc_block().unwrap();

        let base = 4 * 1024 * 1024;
        assert_eq!([a, b, c, d], [base, base + 4096, base + 8192, base + 12288]);

        pmm.free_block(b);
        let e = pmm.alloc_block().unwrap();
        assert_eq!(e, b);
    }

    #[test]
    fn used_blocks_matches_popcount() {
        let ram_end = 4 * 1024 * 1024;
        let mut bitmap_storage = [0u8; (4 * 1024 * 1024 / 4096) / 8];
        let pmm = new_pmm(&mut bitmap_storage, ram_end);
        pmm.init_region(0, ram_end);

        assert_eq!(pmm.used_blocks(), 0);
        let a = pmm.alloc_blocks(3).unwrap();
        assert_eq!(pmm.used_blocks(), 3);
        pmm.free_blocks(a, 3);
        assert_eq!(pmm.used_blocks(), 0);
    }

    #[test]
    fn alloc_blocks_runs_are_disjoint() {
        let ram_end = 4 * 1024 * 1024;
        let mut bitmap_storage = [0u8; (4 * 1024 * 1024 / 4096) / 8];
        let pmm = new_pmm(&mut bitmap_storage, ram_end);
        pmm.init_region(0, ram_end);

        let a = pmm.alloc_blocks(4).unwrap();
        let b = pmm.alloc_blocks(4).unwrap();
        assert!(a + 4 * 4096 <= b || b + 4 * 4096 <= a);
    }

    #[test]
    fn zero_length_alloc_returns_null_sentinel() {
        let ram_end = 1024 * 1024;
        let mut bitmap_storage = [0u8; (1024 * 1024 / 4096) / 8];
        let pmm = new_pmm(&mut bitmap_storage, ram_end);
        assert_eq!(pmm.alloc_blocks(0).unwrap(), 0);
    }

    #[test]
    fn out_of_memory_does_not_mutate_bitmap() {
        let ram_end = 64 * 1024;
        let mut bitmap_storage = [0u8; (64 * 1024 / 4096) / 8];
        let pmm = new_pmm(&mut bitmap_storage, ram_end);
        pmm.init_region(0, ram_end);

        let used_before = pmm.used_blocks();
        assert!(pmm.alloc_blocks(100).is_err());
        assert_eq!(pmm.used_blocks(), used_before);
    }
}
