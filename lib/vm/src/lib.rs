//! The virtual memory core of a teaching-grade OS: a physical frame
//! allocator with eviction, a swap store backed by a raw block device, a
//! per-process two-level demand-paged address space with a bounded
//! resident page-table cache, and the page-fault handler tying them to a
//! software-refilled TLB.
//!
//! Builds `no_std` for the embedding kernel; its own test suite runs under
//! `std` (`cfg_attr(not(test), no_std)`, grounded on the pattern already
//! present in the retrieval pack's `sunsided-os` kernel-vmem crate) so
//! `cargo test` can use `std::vec`/collections directly in test bodies
//! while production code still only reaches for `alloc`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr_space;
pub mod address;
pub mod as_id;
pub mod elf;
pub mod fault;
pub mod frame;
pub mod swap;
pub mod system;
pub mod tlb;

pub use addr_space::{AddrSpace, Classify, LoadRegion};
pub use address::{PhysAddr, VirtAddr, Vpn};
pub use as_id::AsId;
pub use elf::{ExecFile, load_elf};
pub use fault::{FaultOutcome, FaultType};
pub use frame::{CoreMap, FrameOwner};
pub use swap::{BlockDevice, SwapTable};
pub use system::{AsHandle, VmSystem};
pub use tlb::{SoftwareTlb, TlbEntry};
