//! Software-interrupt syscall gates (`spec.md §4.8`). Register-passed ABI:
//! `eax` selects the call, `ebx`/`ecx` carry up to two arguments, `edx`
//! points at a caller-owned return slot the kernel writes through rather
//! than returning a value in `eax` (keeps `eax` free of a second meaning
//! and matches `original_source/core/syscalls.cpp`'s `DoSyscall`
//! dispatch). Gate `0x80` is the general table below; gate `0x81` is the
//! external GUI/window-system collaborator's gate, stubbed here since that
//! collaborator is out of scope.
use crate::error::KernelError;
use crate::interrupts::CpuContext;
use crate::memory::paging::PageFlags;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallId {
    Restart = 0,
    Exit = 1,
    Sleep = 2,
    Clone = 3,
    PeekMemory = 4,
    Sbrk = 5,
    Debug = 6,
    Hcall = 7,
}

impl SyscallId {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => SyscallId::Restart,
            1 => SyscallId::Exit,
            2 => SyscallId::Sleep,
            3 => SyscallId::Clone,
            4 => SyscallId::PeekMemory,
            5 => SyscallId::Sbrk,
            6 => SyscallId::Debug,
            7 => SyscallId::Hcall,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcallId {
    /// Returns the caller's current heap span end in the return slot.
    GetHeap = 0,
    /// Registers the calling thread to receive GUI events; the actual
    /// event delivery is the external GUI collaborator's job, but thread
    /// registration (so the scheduler knows to route events to it) is
    /// implemented here.
    RegisterEventHandler = 1,
}

/// Writes `value` through the caller-supplied return-slot pointer in
/// `edx`, or drops it silently if the pointer is null (`spec.md §4.8`
/// allows fire-and-forget calls like `exit` to pass a null slot).
fn write_return(ctx: &CpuContext, value: u32) {
    let slot = ctx.edx as *mut u32;
    if !slot.is_null() {
        unsafe { slot.write(value) };
    }
}

fn error_code(err: KernelError) -> u32 {
    match err {
        KernelError::OutOfMemory => 1,
        KernelError::InvalidImage => 2,
        KernelError::UndefinedSymbol => 3,
        KernelError::SyscallContractViolation => 4,
    }
}

/// Called by `interrupts::interrupt_dispatch` for gate `0x80`.
pub fn dispatch(ctx: &mut CpuContext) -> *mut CpuContext {
    let Some(id) = SyscallId::from_u32(ctx.eax) else {
        write_return(ctx, error_code(KernelError::SyscallContractViolation));
        return ctx as *mut CpuContext;
    };

    match id {
        SyscallId::Restart => sys_restart(ctx),
        SyscallId::Exit => sys_exit(ctx),
        SyscallId::Sleep => sys_sleep(ctx),
        SyscallId::Clone => sys_clone(ctx),
        SyscallId::PeekMemory => sys_peek_memory(ctx),
        SyscallId::Sbrk => sys_sbrk(ctx),
        SyscallId::Debug => sys_debug(ctx),
        SyscallId::Hcall => sys_hcall(ctx),
    }
}

/// Called for gate `0x81`. The GUI/window-system collaborator itself is
/// external (`spec.md` Non-goals); this only validates the contract and
/// hands off, so a driver registering via `Handler::GuiSyscall` has
/// somewhere real to plug in.
pub fn dispatch_gui(ctx: &mut CpuContext) -> *mut CpuContext {
    write_return(ctx, error_code(KernelError::SyscallContractViolation));
    ctx as *mut CpuContext
}

fn sys_restart(_ctx: &mut CpuContext) -> *mut CpuContext {
    log::warn!("sys_restart: rebooting via keyboard controller");
    // Never returns: this is a hard reset, not a normal syscall return,
    // using the same keyboard-controller pulse the fatal-exception path
    // falls back to (`spec.md §4.6`: restart is a triple-fault-style reset).
    crate::interrupts::reboot_via_keyboard_controller();
}

fn sys_exit(ctx: &mut CpuContext) -> *mut CpuContext {
    crate::scheduler::SCHEDULER.exit_current();
    crate::scheduler::on_timer_tick(ctx)
}

fn sys_sleep(ctx: &mut CpuContext) -> *mut CpuContext {
    let ticks = ctx.ebx as u64;
    crate::scheduler::SCHEDULER.sleep_current(ticks);
    crate::scheduler::on_timer_tick(ctx)
}

fn sys_clone(ctx: &mut CpuContext) -> *mut CpuContext {
    let entry = ctx.ebx as usize;
    let arg = ctx.ecx;
    let pid = crate::scheduler::SCHEDULER.current_pid().unwrap_or(0);
    let tid = crate::scheduler::SCHEDULER.spawn_thread(pid, entry, arg);
    write_return(ctx, tid);
    ctx as *mut CpuContext
}

/// Whether `addr`/`len` are a legal `peek_memory` request: `len` must be
/// one of `spec.md §4.6`'s three allowed widths (`{1,2,4}`), and the whole
/// `[addr, addr+len)` range must fall inside the kernel window. Split out
/// from [`sys_peek_memory`] so it can be unit-tested without a live `Paging`
/// singleton.
fn validate_peek_memory(addr: usize, len: usize, ceiling: usize) -> bool {
    crate::config::PEEK_MEMORY_VALID_SIZES.contains(&len) && addr < ceiling && addr.saturating_add(len) <= ceiling
}

/// Reads exactly `ecx` bytes (`ecx ∈ {1,2,4}`) at `ebx` into the return
/// slot's pointee, bounded against the *actual* identity-mapped kernel
/// window ceiling (Open Question resolution, `spec.md §9`) rather than a
/// hardcoded `256 MiB`, so it is safe on a system with less RAM than that.
fn sys_peek_memory(ctx: &mut CpuContext) -> *mut CpuContext {
    let addr = ctx.ebx as usize;
    let len = ctx.ecx as usize;
    let ceiling = crate::globals::PAGING.kernel_window_end();

    if !validate_peek_memory(addr, len, ceiling) {
        write_return(ctx, error_code(KernelError::SyscallContractViolation));
        return ctx as *mut CpuContext;
    }

    let slot = ctx.edx as *mut u8;
    if !slot.is_null() {
        unsafe { core::ptr::copy_nonoverlapping(addr as *const u8, slot, len) };
    }
    ctx as *mut CpuContext
}

/// Grows the caller's heap by `ebx` bytes, mapping fresh frames as needed,
/// capped at `ELF_HEAP_MAX_GROWTH` bytes past the process's initial heap
/// end. `original_source/core/syscalls.cpp` has no direct `sbrk` handler;
/// this is implemented fresh against the PCB heap-span data model and the
/// existing PMM/paging APIs, per `spec.md §4.9`'s explicit requirement.
fn sys_sbrk(ctx: &mut CpuContext) -> *mut CpuContext {
    let increment = ctx.ebx as usize;
    match crate::elf::grow_current_process_heap(increment) {
        Ok(new_end) => write_return(ctx, new_end as u32),
        Err(err) => write_return(ctx, error_code(err)),
    }
    ctx as *mut CpuContext
}

/// Finds the length of the NUL-terminated string at `ptr`, scanning at
/// most `max_len` bytes and never past `ceiling`. Returns `None` if no NUL
/// is found within those bounds. Split out from [`sys_debug`] so it can be
/// unit-tested against ordinary host memory instead of a live kernel
/// window.
fn debug_string_len(ptr: usize, ceiling: usize, max_len: usize) -> Option<usize> {
    if ptr >= ceiling {
        return None;
    }
    let scan_len = max_len.min(ceiling - ptr);
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, scan_len) };
    bytes.iter().position(|&b| b == 0)
}

/// Prints the kernel-side NUL-terminated string `ebx` points at
/// (`spec.md §4.6`), bounded against the kernel window ceiling and
/// `DEBUG_STRING_MAX_LEN` so a missing terminator can't make the kernel
/// scan unbounded memory.
fn sys_debug(ctx: &mut CpuContext) -> *mut CpuContext {
    let ptr = ctx.ebx as usize;
    let ceiling = crate::globals::PAGING.kernel_window_end();

    match debug_string_len(ptr, ceiling, crate::config::DEBUG_STRING_MAX_LEN) {
        Some(len) => {
            let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
            match core::str::from_utf8(bytes) {
                Ok(s) => log::info!("sys_debug: {s}"),
                Err(_) => log::warn!("sys_debug: non-utf8 string at {ptr:#x}"),
            }
        }
        None => {
            write_return(ctx, error_code(KernelError::SyscallContractViolation));
        }
    }
    ctx as *mut CpuContext
}

fn sys_hcall(ctx: &mut CpuContext) -> *mut CpuContext {
    match ctx.ebx {
        x if x == HcallId::GetHeap as u32 => {
            let end = crate::elf::current_process_heap_end().unwrap_or(0);
            write_return(ctx, end as u32);
        }
        x if x == HcallId::RegisterEventHandler as u32 => {
            let pid = crate::scheduler::SCHEDULER.current_pid().unwrap_or(0);
            let entry = ctx.ecx as usize;
            let tid = crate::scheduler::SCHEDULER.spawn_thread(pid, entry, 0);
            write_return(ctx, tid);
        }
        _ => write_return(ctx, error_code(KernelError::SyscallContractViolation)),
    }
    ctx as *mut CpuContext
}

/// Flags a freshly `sbrk`-grown page gets: present, writable, user-mode.
pub(crate) const USER_HEAP_PAGE_FLAGS: PageFlags =
    PageFlags::from_bits_truncate(PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits() | PageFlags::USER.bits());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_memory_rejects_sizes_outside_one_two_four() {
        for len in [0usize, 3, 5, 4096] {
            assert!(!validate_peek_memory(0x1000, len, 0x10000), "len={len} must be rejected");
        }
        for len in [1usize, 2, 4] {
            assert!(validate_peek_memory(0x1000, len, 0x10000), "len={len} must be accepted");
        }
    }

    #[test]
    fn peek_memory_rejects_ranges_crossing_the_ceiling() {
        let ceiling = 0x10000;
        assert!(!validate_peek_memory(ceiling, 1, ceiling), "addr at the ceiling itself is out of range");
        assert!(!validate_peek_memory(ceiling - 2, 4, ceiling), "addr+len must not cross the ceiling");
        assert!(validate_peek_memory(ceiling - 4, 4, ceiling), "a range ending exactly at the ceiling is legal");
    }

    #[test]
    fn peek_memory_rejects_addr_overflowing_with_len() {
        assert!(!validate_peek_memory(usize::MAX - 1, 4, 0x10000));
    }

    #[test]
    fn debug_string_len_finds_the_nul_terminator() {
        let s = b"hello\0trailing garbage";
        let ptr = s.as_ptr() as usize;
        assert_eq!(debug_string_len(ptr, ptr + s.len(), 256), Some(5));
    }

    #[test]
    fn debug_string_len_gives_up_past_max_len() {
        let s = b"no nul in here at all...";
        let ptr = s.as_ptr() as usize;
        assert_eq!(debug_string_len(ptr, ptr + s.len(), 4), None);
    }

    #[test]
    fn debug_string_len_never_scans_past_the_ceiling() {
        let s = b"abc\0";
        let ptr = s.as_ptr() as usize;
        // The ceiling sits one byte before the NUL: the scan must stop
        // there and report no terminator rather than reading past it.
        assert_eq!(debug_string_len(ptr, ptr + 3, 256), None);
    }

    #[test]
    fn debug_string_len_rejects_a_pointer_at_or_past_the_ceiling() {
        assert_eq!(debug_string_len(0x2000, 0x2000, 256), None);
    }

    #[test]
    fn clone_creates_a_distinct_ready_thread_under_the_caller_s_process() {
        // `sys_clone` is a thin wrapper around `Scheduler::spawn_thread`
        // (spec.md §4.6: clone spawns a new thread in the caller's own
        // process); exercised here against a fresh, local `Scheduler`
        // rather than the real `SCHEDULER` static, which this host-run
        // test cannot initialize (see scheduler.rs's own test module).
        use crate::memory::paging::PageDirectory;
        use crate::scheduler::Scheduler;

        extern "C" fn dummy_entry() -> ! {
            loop {}
        }

        let scheduler = Scheduler::new();
        scheduler.init(PageDirectory(0x1000));
        let pid = scheduler.current_pid().unwrap();

        let tid_a = scheduler.spawn_thread(pid, dummy_entry as usize, 0xAAAA);
        let tid_b = scheduler.spawn_thread(pid, dummy_entry as usize, 0xBBBB);

        assert_ne!(tid_a, tid_b, "each clone must produce a distinct tid");
    }
}
