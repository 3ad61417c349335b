//! Page directories and page tables.
//!
//! See `spec.md` §3: a directory has 1024 entries, one per 4 MiB slot of the
//! 32-bit address space; each slot's page table is a 4 KiB array of 1024
//! entries packing a frame number plus `VALID`/`L`/R/W/X bits.

use alloc::boxed::Box;

use bitflags::bitflags;

use config::mm::ENTRIES_PER_TABLE;
use systype::memory_flags::MappingFlags;

use crate::address::PhysAddr;

bitflags! {
    /// Flags carried by a page-table entry.
    ///
    /// `VALID`: a live virtual-to-physical mapping exists right now.
    /// `L`: the page's content has been materialised at least once -- it
    /// exists logically even if currently swapped out or not yet faulted in.
    /// `R`/`W`/`X`: the region's permission bits, copied onto every entry in
    /// the region so a fault can check permissions without consulting the
    /// address space's region table.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const VALID = 1 << 0;
        const L     = 1 << 1;
        const R     = 1 << 2;
        const W     = 1 << 3;
        const X     = 1 << 4;
    }
}

impl From<MappingFlags> for PteFlags {
    fn from(perm: MappingFlags) -> Self {
        let mut flags = PteFlags::empty();
        if perm.contains(MappingFlags::R) {
            flags |= PteFlags::R;
        }
        if perm.contains(MappingFlags::W) {
            flags |= PteFlags::W;
        }
        if perm.contains(MappingFlags::X) {
            flags |= PteFlags::X;
        }
        flags
    }
}

/// One page-table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Physical frame number (address >> `PAGE_SHIFT`), meaningful only
    /// while `VALID` is set.
    pfn: u32,
    flags: PteFlags,
}

impl PageTableEntry {
    pub fn empty() -> Self {
        PageTableEntry::default()
    }

    pub fn flags(self) -> PteFlags {
        self.flags
    }

    pub fn is_valid(self) -> bool {
        self.flags.contains(PteFlags::VALID)
    }

    pub fn is_loaded(self) -> bool {
        self.flags.contains(PteFlags::L)
    }

    pub fn perm(self) -> MappingFlags {
        let mut perm = MappingFlags::empty();
        if self.flags.contains(PteFlags::R) {
            perm |= MappingFlags::R;
        }
        if self.flags.contains(PteFlags::W) {
            perm |= MappingFlags::W;
        }
        if self.flags.contains(PteFlags::X) {
            perm |= MappingFlags::X;
        }
        perm
    }

    pub fn frame(self) -> Option<PhysAddr> {
        self.flags
            .contains(PteFlags::VALID)
            .then(|| PhysAddr::new(self.pfn << config::mm::PAGE_SHIFT))
    }

    /// Installs a live mapping to `frame` with the given region permission
    /// bits, setting both `VALID` and `L`.
    pub fn install(&mut self, frame: PhysAddr, perm: MappingFlags) {
        self.pfn = frame.as_u32() >> config::mm::PAGE_SHIFT;
        self.flags = PteFlags::VALID | PteFlags::L | PteFlags::from(perm);
    }

    /// Clears `VALID`, keeping `L` and the permission bits -- the page still
    /// exists logically (in swap, or re-demandable from the executable) but
    /// has no resident frame right now.
    pub fn clear_valid(&mut self) {
        self.flags.remove(PteFlags::VALID);
        self.pfn = 0;
    }

    pub fn set_loaded(&mut self) {
        self.flags.insert(PteFlags::L);
    }
}

/// A 4 KiB, 1024-entry page table for one directory slot.
#[derive(Debug, Clone)]
pub struct PageTable {
    entries: Box<[PageTableEntry; ENTRIES_PER_TABLE]>,
}

impl PageTable {
    pub fn zeroed() -> Self {
        PageTable {
            entries: Box::new([PageTableEntry::empty(); ENTRIES_PER_TABLE]),
        }
    }

    pub fn entry(&self, idx: usize) -> PageTableEntry {
        self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut PageTableEntry {
        &mut self.entries[idx]
    }

    /// Serializes the table to raw bytes for a swap-out, one `u32` per entry
    /// in big-endian order (the spec's fixed 32-bit big-endian word model).
    pub fn to_bytes(&self, out: &mut [u8; config::mm::PAGE_SIZE]) {
        for (i, e) in self.entries.iter().enumerate() {
            let word = (e.pfn << 8) | e.flags.bits() as u32;
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
    }

    /// Reconstructs a table from bytes previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8; config::mm::PAGE_SIZE]) -> Self {
        let mut table = PageTable::zeroed();
        for (i, entry) in table.entries.iter_mut().enumerate() {
            let word = u32::from_be_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            entry.pfn = word >> 8;
            entry.flags = PteFlags::from_bits_truncate(word as u8);
        }
        table
    }
}

/// One slot of a process's 1024-entry page directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirEntry {
    /// This slot has ever been touched -- a page table exists for it,
    /// possibly only in swap.
    pub loaded: bool,
    /// The page table for this slot is currently resident (see the
    /// page-table cache, `ptbl_cache.rs`).
    pub present: bool,
}

/// A process's 1024-entry page directory.
#[derive(Debug, Clone)]
pub struct PageDirectory {
    entries: Box<[DirEntry; ENTRIES_PER_TABLE]>,
}

impl PageDirectory {
    pub fn zeroed() -> Self {
        PageDirectory {
            entries: Box::new([DirEntry::default(); ENTRIES_PER_TABLE]),
        }
    }

    pub fn entry(&self, idx: usize) -> DirEntry {
        self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut DirEntry {
        &mut self.entries[idx]
    }
}
