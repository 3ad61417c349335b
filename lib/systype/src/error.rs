//! Errors the VM core's own operations can raise.
//!
//! This is deliberately a small, closed set: it is not a general errno
//! surface (this crate implements no syscalls), only the failure modes the
//! frame table, swap store, address space and fault handler can actually
//! produce. Recoverable user faults (bad address, write to a read-only page)
//! are *not* represented here -- they are an expected outcome of `vm_fault`,
//! not a failure of the VM core's own operation, and are carried by
//! `vm::fault::FaultOutcome` instead.

use core::fmt::{self, Display};

/// Type alias for result of VM-core operations.
pub type VmResult<T> = Result<T, VmError>;

/// A failure of a VM-core operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum VmError {
    /// The frame table and swap store are both exhausted; teaching-grade
    /// kernels treat this as fatal (see `spec.md` §7).
    OutOfFrames = 1,
    /// The swap table has no free slot for an eviction.
    OutOfSwap = 2,
    /// `as_define_region` was called a third time for one address space.
    InvalidRegionCount = 3,
    /// A stack or heap operation would make `stack_vbase < heap_vtop`.
    StackHeapCollision = 4,
    /// `sbrk` was asked to shrink the heap below `heap_vstart`.
    Einval = 5,
    /// `sbrk` was asked to grow the heap past `USER_HEAP_MAX` or into the stack.
    Enomem = 6,
    /// The ELF image is malformed or not executable.
    Enoexec = 7,
}

impl VmError {
    /// Returns a short description, used in log output.
    pub const fn as_str(self) -> &'static str {
        match self {
            VmError::OutOfFrames => "out of physical frames",
            VmError::OutOfSwap => "swap table exhausted",
            VmError::InvalidRegionCount => "more than two load regions defined",
            VmError::StackHeapCollision => "stack and heap regions would collide",
            VmError::Einval => "invalid argument",
            VmError::Enomem => "out of memory",
            VmError::Enoexec => "malformed executable",
        }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
