//! Software-refilled TLB.
//!
//! The spec's hardware model (MIPS-style, `spec.md` §4.4) has no page-table
//! walker: every miss traps to the fault handler, which installs a
//! translation directly with `TLB_Probe` / `TLB_Random` / `TLB_Write`. This
//! module is that primitive set, modeled as a fixed-size array of entries
//! rather than bound to any real CPU's TLB registers.

use rand::Rng;

use config::mm::NUM_TLB_ENTRIES;

use crate::address::{PhysAddr, Vpn};

/// One TLB entry: a virtual-to-physical translation plus the dirty bit the
/// fault handler sets on a writable access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpn: Vpn,
    pub pfn: PhysAddr,
    pub dirty: bool,
}

/// A fixed-size software TLB.
#[derive(Debug)]
pub struct SoftwareTlb {
    entries: [Option<TlbEntry>; NUM_TLB_ENTRIES],
}

impl SoftwareTlb {
    pub fn new() -> Self {
        SoftwareTlb {
            entries: [None; NUM_TLB_ENTRIES],
        }
    }

    /// `TLB_Probe`: the index of the entry mapping `vpn`, if any.
    pub fn probe(&self, vpn: Vpn) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.vpn == vpn))
    }

    /// The index of any currently-invalid (empty) slot.
    pub fn find_invalid(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.is_none())
    }

    pub fn write(&mut self, idx: usize, entry: TlbEntry) {
        self.entries[idx] = Some(entry);
    }

    /// `TLB_Random`: installs `entry` into a randomly chosen slot.
    pub fn write_random(&mut self, entry: TlbEntry, rng: &mut impl Rng) {
        let idx = rng.gen_range(0..NUM_TLB_ENTRIES);
        self.entries[idx] = Some(entry);
    }

    /// Installs `entry`, following the fault handler's policy (`spec.md`
    /// §4.4 step 4): overwrite an existing mapping for the same page if one
    /// exists, else use a free slot, else evict a random slot.
    pub fn install(&mut self, entry: TlbEntry, rng: &mut impl Rng) {
        if let Some(idx) = self.probe(entry.vpn) {
            self.write(idx, entry);
        } else if let Some(idx) = self.find_invalid() {
            self.write(idx, entry);
        } else {
            self.write_random(entry, rng);
        }
    }

    /// Invalidates any entry mapping `vpn`, e.g. when its frame is evicted.
    pub fn invalidate(&mut self, vpn: Vpn) {
        if let Some(idx) = self.probe(vpn) {
            self.entries[idx] = None;
        }
    }

    /// Flushes every entry. Called on `as_activate` when switching the
    /// current address space.
    pub fn flush(&mut self) {
        self.entries = [None; NUM_TLB_ENTRIES];
    }
}

impl Default for SoftwareTlb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    #[test]
    fn install_overwrites_existing_mapping() {
        let mut tlb = SoftwareTlb::new();
        let mut rng = SmallRng::seed_from_u64(1);
        let vpn = Vpn::new(3);
        tlb.install(
            TlbEntry { vpn, pfn: PhysAddr::new(0x1000), dirty: false },
            &mut rng,
        );
        tlb.install(
            TlbEntry { vpn, pfn: PhysAddr::new(0x2000), dirty: true },
            &mut rng,
        );
        let idx = tlb.probe(vpn).unwrap();
        assert_eq!(tlb.entries[idx].unwrap().pfn, PhysAddr::new(0x2000));
        // Overwriting in place must not create a second entry for `vpn`.
        assert_eq!(tlb.entries.iter().filter(|e| matches!(e, Some(e) if e.vpn == vpn)).count(), 1);
    }

    #[test]
    fn invalidate_clears_entry() {
        let mut tlb = SoftwareTlb::new();
        let mut rng = SmallRng::seed_from_u64(1);
        let vpn = Vpn::new(3);
        tlb.install(
            TlbEntry { vpn, pfn: PhysAddr::new(0x1000), dirty: false },
            &mut rng,
        );
        tlb.invalidate(vpn);
        assert!(tlb.probe(vpn).is_none());
    }

    #[test]
    fn flush_clears_everything() {
        let mut tlb = SoftwareTlb::new();
        let mut rng = SmallRng::seed_from_u64(1);
        for i in 0..4 {
            tlb.install(
                TlbEntry { vpn: Vpn::new(i), pfn: PhysAddr::new(i * 0x1000), dirty: false },
                &mut rng,
            );
        }
        tlb.flush();
        assert!((0..4).all(|i| tlb.probe(Vpn::new(i)).is_none()));
    }
}
