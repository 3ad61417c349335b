//! The bounded page-table cache kept per address space.
//!
//! See `spec.md` §3 and §4.3: each address space keeps
//! [`config::mm::NUM_PTABLES_IN_MEM`] page tables directly resident. A flag
//! word per slot packs the owning directory index, an `EXECUTABLE` marker,
//! and a 21-bit access counter; a flag word of zero means the slot is free.

use config::mm::NUM_PTABLES_IN_MEM;
use systype::error::{VmError, VmResult};

use super::page_table::{DirEntry, PageDirectory, PageTable};
use crate::address::Vpn;
use crate::as_id::AsId;
use crate::swap::{BlockDevice, SwapTable};

const EXEC_BIT: u32 = 1 << 21;
const COUNTER_MASK: u32 = (1 << 21) - 1;
const DIR_SHIFT: u32 = 22;

/// A resident page-table slot's bookkeeping. A `flags` value of `0` means
/// the slot is free (no page table loaded).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SlotFlags(u32);

impl SlotFlags {
    fn new(dir_index: usize, executable: bool, counter: u32) -> Self {
        let mut bits = (dir_index as u32) << DIR_SHIFT;
        if executable {
            bits |= EXEC_BIT;
        }
        bits |= counter & COUNTER_MASK;
        // A all-zero encoding would be indistinguishable from "free", which
        // can only happen for directory index 0, non-executable, counter 0.
        // Directory index 0 is reserved for the first code page of every
        // executable, so the counter is bumped to 1 at minimum below.
        SlotFlags(bits.max(1))
    }

    fn is_free(self) -> bool {
        self.0 == 0
    }

    fn dir_index(self) -> usize {
        (self.0 >> DIR_SHIFT) as usize
    }

    fn is_executable(self) -> bool {
        self.0 & EXEC_BIT != 0
    }

    fn counter(self) -> u32 {
        self.0 & COUNTER_MASK
    }

    fn bump(self) -> Self {
        SlotFlags::new(self.dir_index(), self.is_executable(), self.counter() + 1)
    }
}

struct ResidentSlot {
    flags: SlotFlags,
    table: PageTable,
}

impl ResidentSlot {
    fn free() -> Self {
        ResidentSlot {
            flags: SlotFlags::default(),
            table: PageTable::zeroed(),
        }
    }
}

/// The fixed-size resident page-table cache for one address space.
pub struct PtblCache {
    slots: [ResidentSlot; NUM_PTABLES_IN_MEM],
    next_counter: u32,
}

/// A handle identifying which resident slot backs a directory's page table,
/// returned by [`PtblCache::get`] so the caller can read/write entries
/// without re-resolving the slot on every access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotHandle(usize);

impl PtblCache {
    pub fn new() -> Self {
        PtblCache {
            slots: [ResidentSlot::free(), ResidentSlot::free(), ResidentSlot::free()],
            next_counter: 1,
        }
    }

    fn tick(&mut self) -> u32 {
        self.next_counter += 1;
        self.next_counter
    }

    pub fn table(&self, handle: SlotHandle) -> &PageTable {
        &self.slots[handle.0].table
    }

    pub fn table_mut(&mut self, handle: SlotHandle) -> &mut PageTable {
        &mut self.slots[handle.0].table
    }

    fn find_by_dir(&self, dir_index: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.flags.is_free() && s.flags.dir_index() == dir_index)
    }

    fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.flags.is_free())
    }

    /// Slot-allocation policy from `spec.md` §4.3: use a free slot if one
    /// exists; otherwise evict according to the executable-preservation
    /// rule. Returns the index to (re)use -- the caller is responsible for
    /// persisting the evicted slot's contents before overwriting it.
    ///
    /// `target_dir_index` is the directory index the *requester* wants to
    /// load, used only for the data-victim tie-break.
    fn pick_slot_to_reuse(&self, want_executable: bool, target_dir_index: usize) -> usize {
        if want_executable {
            // There is typically at most one executable slot; victim is the
            // executable slot with the lowest counter.
            return self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.flags.is_executable())
                .min_by_key(|(_, s)| s.flags.counter())
                .map(|(i, _)| i)
                .unwrap_or(0);
        }
        // Requester is data: victim is the lowest-counter non-executable
        // slot, tie-broken towards a slot whose directory index already
        // equals the requester's target (keeps stack and data directories
        // in the cache together).
        let min_counter = self
            .slots
            .iter()
            .filter(|s| !s.flags.is_executable())
            .map(|s| s.flags.counter())
            .min();
        if let Some(min_counter) = min_counter {
            let candidates = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.flags.is_executable() && s.flags.counter() == min_counter);
            let mut fallback = None;
            for (i, s) in candidates {
                if fallback.is_none() {
                    fallback = Some(i);
                }
                if s.flags.dir_index() == target_dir_index {
                    return i;
                }
            }
            return fallback.expect("at least one non-executable slot matched min_counter");
        }
        // Only executable slots exist: evict the *second* one if any, never
        // the first, to avoid livelock on the instruction stream.
        let mut exec_slots = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.flags.is_executable())
            .map(|(i, _)| i);
        let first = exec_slots.next();
        exec_slots.next().or(first).unwrap_or(0)
    }

    /// Resolves the resident page table for `vpn`'s directory, allocating or
    /// evicting a slot as needed (`get_ptbl` in `spec.md` §4.3). Returns the
    /// handle to use with [`Self::table`] / [`Self::table_mut`].
    pub fn get<D: BlockDevice>(
        &mut self,
        dir: &mut PageDirectory,
        swap: &mut SwapTable<D>,
        as_id: AsId,
        vpn: Vpn,
        is_executable: bool,
    ) -> VmResult<SlotHandle> {
        let dir_index = vpn.dir_index();
        let entry: DirEntry = dir.entry(dir_index);

        if entry.present {
            let idx = self
                .find_by_dir(dir_index)
                .expect("PRESENT directory entry with no matching resident slot");
            let counter = self.tick();
            self.slots[idx].flags = SlotFlags::new(dir_index, is_executable, counter);
            return Ok(SlotHandle(idx));
        }

        let idx = self.reuse_for(dir, swap, as_id, dir_index, is_executable)?;

        if entry.loaded {
            let mut bytes = [0u8; config::mm::PAGE_SIZE];
            swap.swap_in(as_id, Vpn::new(dir_table_vpn(dir_index)), &mut bytes)?;
            self.slots[idx].table = PageTable::from_bytes(&bytes);
        } else {
            self.slots[idx].table = PageTable::zeroed();
            dir.entry_mut(dir_index).loaded = true;
        }

        let counter = self.tick();
        self.slots[idx].flags = SlotFlags::new(dir_index, is_executable, counter);
        dir.entry_mut(dir_index).present = true;
        Ok(SlotHandle(idx))
    }

    /// Picks a slot to reuse for `dir_index`, evicting whatever was resident
    /// there first if necessary.
    fn reuse_for<D: BlockDevice>(
        &mut self,
        dir: &mut PageDirectory,
        swap: &mut SwapTable<D>,
        as_id: AsId,
        dir_index: usize,
        is_executable: bool,
    ) -> VmResult<usize> {
        if let Some(i) = self.find_free() {
            return Ok(i);
        }
        let idx = self.pick_slot_to_reuse(is_executable, dir_index);
        self.evict_slot(dir, swap, as_id, idx)?;
        Ok(idx)
    }

    fn evict_slot<D: BlockDevice>(
        &mut self,
        dir: &mut PageDirectory,
        swap: &mut SwapTable<D>,
        as_id: AsId,
        idx: usize,
    ) -> VmResult<()> {
        let flags = self.slots[idx].flags;
        if flags.is_free() {
            return Ok(());
        }
        let victim_dir = flags.dir_index();
        let mut bytes = [0u8; config::mm::PAGE_SIZE];
        self.slots[idx].table.to_bytes(&mut bytes);
        swap.swap_out(as_id, Vpn::new(dir_table_vpn(victim_dir)), &bytes)?;
        dir.entry_mut(victim_dir).present = false;
        simdebug::when_debug!({
            log::trace!(
                "ptbl_cache: evicted slot {} (dir {}, executable={}) for {:?}",
                idx,
                victim_dir,
                flags.is_executable(),
                as_id
            );
        });
        self.slots[idx] = ResidentSlot::free();
        Ok(())
    }

    /// Evicts every resident slot, e.g. during address-space teardown once
    /// its frames have already been released. Swap slots keyed by table
    /// virtual address are freed separately via `swap_free`.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = ResidentSlot::free();
        }
    }

    pub fn resident_dir_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .filter(|s| !s.flags.is_free())
            .map(|s| s.flags.dir_index())
    }
}

impl Default for PtblCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The swap store keys table slots by the directory-index-as-virtual-address
/// (`spec.md` §4.3: "swapped and its most recent contents live in the swap
/// store keyed by the directory-index virtual address"). A real 32-bit user
/// address only ever has a 20-bit page number, so setting the top bit marks
/// this as a page-table blob rather than a data/code/heap/stack page and
/// rules out any collision with a real per-page swap key.
fn dir_table_vpn(dir_index: usize) -> u32 {
    0x8000_0000 | dir_index as u32
}
