//! The kernel's singleton collaborators. Built once at boot by `kmain` and
//! referenced by every other subsystem for the rest of the kernel's life —
//! replaces the C++ original's `activeInstance`-style raw pointers
//! (`original_source/core/globals.cpp`) with plain `'static` references to
//! statically allocated, interior-mutable objects.
use crate::memory::heap::KernelHeap;
use crate::memory::paging::Paging;
use crate::memory::pmm::Pmm;

pub static PMM: Pmm = Pmm::new();
pub static PAGING: Paging = Paging::new();

// Unit tests (`cfg(test)`) build against the host's default target with
// `std` linked in, so the host's own allocator stays active there; only the
// real no_std kernel build registers this as the global allocator.
#[cfg_attr(not(test), global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();
