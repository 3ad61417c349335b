//! Swap store: persists evicted user pages to a raw block device.
//!
//! See `spec.md` §4.2. Slots are identified by `(AsId, Vpn)`; at most one
//! slot may hold a given pair at a time (checked with `debug_assert!`,
//! mirroring the original's `assert()` -- this is an invariant violation,
//! not a user-facing error, see `spec.md` §7).

use alloc::vec;
use alloc::vec::Vec;

use config::mm::{PAGE_SIZE, SWAP_SLOTS};
use systype::error::{VmError, VmResult};

use crate::address::Vpn;
use crate::as_id::AsId;

/// The raw block device the swap store is handed, exposed as the spec names
/// it: "a raw block device exposed as a file" (`lhd0raw:`). A real backend
/// is an external collaborator; wiring one up is out of scope here.
pub trait BlockDevice {
    /// Reads the 4 KiB page at `slot` into `buf`.
    fn read_page(&mut self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> VmResult<()>;
    /// Writes `buf` as the 4 KiB page at `slot`.
    fn write_page(&mut self, slot: usize, buf: &[u8; PAGE_SIZE]) -> VmResult<()>;
}

/// An in-memory stand-in for the raw swap device, used by this crate's own
/// tests and as a template for a real backend.
#[derive(Debug)]
pub struct MemBlockDevice {
    storage: Vec<[u8; PAGE_SIZE]>,
}

impl MemBlockDevice {
    pub fn new(slots: usize) -> Self {
        MemBlockDevice {
            storage: vec![[0u8; PAGE_SIZE]; slots],
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_page(&mut self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> VmResult<()> {
        buf.copy_from_slice(&self.storage[slot]);
        Ok(())
    }

    fn write_page(&mut self, slot: usize, buf: &[u8; PAGE_SIZE]) -> VmResult<()> {
        self.storage[slot].copy_from_slice(buf);
        Ok(())
    }
}

/// Maps `(AsId, Vpn)` pairs onto slots of the raw device.
#[derive(Debug)]
pub struct SwapTable<D: BlockDevice> {
    device: D,
    slots: Vec<Option<(AsId, Vpn)>>,
}

impl<D: BlockDevice> SwapTable<D> {
    pub fn new(device: D) -> Self {
        Self::with_capacity(device, SWAP_SLOTS)
    }

    /// Like [`SwapTable::new`] but with an explicit slot count, for tests
    /// that want to exercise exhaustion without allocating all 1280 slots.
    pub fn with_capacity(device: D, capacity: usize) -> Self {
        SwapTable {
            device,
            slots: vec![None; capacity],
        }
    }

    /// Finds the first free slot, writes `page` to it, and records the
    /// `(as_id, vpn)` pair as in-use there. Returns [`VmError::OutOfSwap`] if
    /// the table is exhausted.
    pub fn swap_out(&mut self, as_id: AsId, vpn: Vpn, page: &[u8; PAGE_SIZE]) -> VmResult<()> {
        debug_assert!(
            !self.slots.iter().any(|s| *s == Some((as_id, vpn))),
            "swap_out: {:?}/{:?} already has a slot",
            as_id,
            vpn
        );
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(VmError::OutOfSwap)?;
        self.device.write_page(slot, page)?;
        self.slots[slot] = Some((as_id, vpn));
        log::trace!("swap_out: {:?}/{:?} -> slot {}", as_id, vpn, slot);
        Ok(())
    }

    /// Locates the slot for `(as_id, vpn)`, copies its contents into `page`,
    /// and marks the slot free.
    pub fn swap_in(&mut self, as_id: AsId, vpn: Vpn, page: &mut [u8; PAGE_SIZE]) -> VmResult<()> {
        let slot = self.find_slot(as_id, vpn);
        self.device.read_page(slot, page)?;
        self.slots[slot] = None;
        log::trace!("swap_in: {:?}/{:?} <- slot {}", as_id, vpn, slot);
        Ok(())
    }

    /// Like [`SwapTable::swap_in`] but leaves the slot allocated -- used by
    /// fork when the parent's page lives in swap and the child needs its own
    /// copy while the parent keeps its own slot.
    pub fn swap_copy_in(
        &mut self,
        as_id: AsId,
        vpn: Vpn,
        page: &mut [u8; PAGE_SIZE],
    ) -> VmResult<()> {
        let slot = self.find_slot(as_id, vpn);
        self.device.read_page(slot, page)?;
        Ok(())
    }

    pub fn contains(&self, as_id: AsId, vpn: Vpn) -> bool {
        self.slots.iter().any(|s| *s == Some((as_id, vpn)))
    }

    /// Marks every slot owned by `as_id` free.
    pub fn swap_free(&mut self, as_id: AsId) {
        for s in self.slots.iter_mut() {
            if matches!(s, Some((owner, _)) if *owner == as_id) {
                *s = None;
            }
        }
    }

    /// Zeroes the entire swap table, used on user-program teardown.
    pub fn swap_reclaim_all(&mut self) {
        for s in self.slots.iter_mut() {
            *s = None;
        }
    }

    fn find_slot(&self, as_id: AsId, vpn: Vpn) -> usize {
        self.slots
            .iter()
            .position(|s| *s == Some((as_id, vpn)))
            .unwrap_or_else(|| panic!("swap: no slot recorded for {:?}/{:?}", as_id, vpn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_of(byte: u8) -> [u8; PAGE_SIZE] {
        [byte; PAGE_SIZE]
    }

    #[test]
    fn round_trip_restores_byte_exact_contents() {
        let mut swap = SwapTable::new(MemBlockDevice::new(SWAP_SLOTS));
        let a = AsId::from_raw(1);
        let vpn = Vpn::new(42);
        swap.swap_out(a, vpn, &page_of(0xAA)).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        swap.swap_in(a, vpn, &mut buf).unwrap();
        assert_eq!(buf, page_of(0xAA));
        assert!(!swap.contains(a, vpn));
    }

    #[test]
    fn copy_in_leaves_slot_allocated() {
        let mut swap = SwapTable::new(MemBlockDevice::new(SWAP_SLOTS));
        let a = AsId::from_raw(1);
        let vpn = Vpn::new(7);
        swap.swap_out(a, vpn, &page_of(0x55)).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        swap.swap_copy_in(a, vpn, &mut buf).unwrap();
        assert_eq!(buf, page_of(0x55));
        assert!(swap.contains(a, vpn));
    }

    #[test]
    fn swap_free_releases_only_owned_slots() {
        let mut swap = SwapTable::new(MemBlockDevice::new(SWAP_SLOTS));
        let a = AsId::from_raw(1);
        let b = AsId::from_raw(2);
        swap.swap_out(a, Vpn::new(1), &page_of(1)).unwrap();
        swap.swap_out(b, Vpn::new(1), &page_of(2)).unwrap();
        swap.swap_free(a);
        assert!(!swap.contains(a, Vpn::new(1)));
        assert!(swap.contains(b, Vpn::new(1)));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut swap = SwapTable::with_capacity(MemBlockDevice::new(2), 2);
        let a = AsId::from_raw(1);
        swap.swap_out(a, Vpn::new(0), &page_of(0)).unwrap();
        swap.swap_out(a, Vpn::new(1), &page_of(0)).unwrap();
        assert_eq!(
            swap.swap_out(a, Vpn::new(2), &page_of(0)).unwrap_err(),
            VmError::OutOfSwap
        );
    }
}
