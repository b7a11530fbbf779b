//! Crate-wide error type. Every fallible core operation returns
//! `Result<T, KernelError>` instead of C-style null sentinels; `CPUException`
//! from `spec.md §7` has no variant here because it is a divergent panic
//! path (`crate::interrupts::exception`), not a value a caller can recover.
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The PMM, the kernel heap, or paging could not satisfy a request.
    OutOfMemory,
    /// A relocatable driver object or ELF executable failed header/segment validation.
    InvalidImage,
    /// A driver's relocation referenced a kernel symbol that was never registered.
    UndefinedSymbol,
    /// A syscall's argument contract was violated (bad size, null where forbidden, etc).
    SyscallContractViolation,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::InvalidImage => "invalid image",
            KernelError::UndefinedSymbol => "undefined symbol",
            KernelError::SyscallContractViolation => "syscall contract violation",
        };
        f.write_str(msg)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
