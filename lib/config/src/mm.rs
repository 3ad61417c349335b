//! Memory layout for the dumbvm-style 32-bit address space.
//!
//! Word size and endianness are fixed: 32-bit addresses, big-endian, one page
//! directory per address space covering the full 4 GiB range.

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of low bits of a virtual/physical address that index within a page.
pub const PAGE_SHIFT: u32 = 12;

/// Number of bits a page directory index occupies; each directory slot covers
/// `1 << PGDIR_SHIFT` bytes (4 MiB).
pub const PGDIR_SHIFT: u32 = 22;
/// Entries in a page directory, and in each page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Resident page tables kept directly addressable per address space.
pub const NUM_PTABLES_IN_MEM: usize = 3;

/// Maximum number of pages the user stack may grow to.
pub const DUMBVM_STACKPAGES: usize = 24;

/// Fixed top of the user stack; the stack grows downward from here.
pub const USERSTACK: u32 = 0x8000_0000;

/// Maximum size in bytes the user heap may grow to via `sbrk`.
pub const USER_HEAP_MAX: usize = 1_048_576;

/// The frame table bootstrap aborts if fewer than this many frames can be managed.
pub const MIN_COREMAP_PAGES: usize = 10;

/// Number of slots in the swap table, i.e. the maximum number of evicted
/// pages the raw swap device can hold at once.
pub const SWAP_SLOTS: usize = 1280;

/// Number of entries in the software-refilled TLB.
pub const NUM_TLB_ENTRIES: usize = 64;

/// Width in bits of the contiguous-run-length field of a kernel frame-table
/// entry. A kernel allocation of more than `(1 << KERNEL_RUN_LENGTH_BITS) - 1`
/// contiguous frames cannot be represented and is rejected rather than
/// silently mis-freed (see DESIGN.md).
pub const KERNEL_RUN_LENGTH_BITS: u32 = 8;
/// Maximum number of contiguous frames a single kernel allocation may request.
pub const MAX_KERNEL_RUN: usize = (1usize << KERNEL_RUN_LENGTH_BITS) - 1;

/// At most this many `PT_LOAD` regions (code, data) are supported per executable.
pub const MAX_LOAD_REGIONS: usize = 2;

/// Maximum length, in bytes, of a stored executable path.
pub const MAX_EXEC_PATH_LEN: usize = 64;
