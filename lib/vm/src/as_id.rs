//! Address-space identifiers.
//!
//! The coremap and swap table key their per-process state off this id rather
//! than a raw pointer to an [`crate::addr_space::AddrSpace`] -- Rust's
//! aliasing rules make a shared mutable pointer awkward where the original
//! C kernel just stored `struct addrspace *`. [`crate::system::VmSystem`]
//! keeps a small registry from `AsId` back to the address space (see
//! DESIGN.md).

use core::fmt;

/// Identifies one address space for the lifetime of the process it backs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(usize);

impl AsId {
    pub const fn from_raw(id: usize) -> Self {
        AsId(id)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsId({})", self.0)
    }
}
