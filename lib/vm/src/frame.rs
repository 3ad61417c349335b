//! Physical frame table (coremap).
//!
//! See `spec.md` §4.1. Owns the array of physical frames, hands them out to
//! the kernel and to user address spaces, and picks eviction victims when
//! none are free.
//!
//! Per the Design Note in `spec.md` §9, ownership is a tagged enum rather
//! than a nullable owner plus magic flag bits -- an invalid state (`USED`
//! clear but an owner present) is simply not representable.

use alloc::vec;
use alloc::vec::Vec;

use config::mm::{MAX_KERNEL_RUN, MIN_COREMAP_PAGES, PAGE_SIZE};
use systype::error::{VmError, VmResult};

use crate::address::{PhysAddr, Vpn};
use crate::as_id::AsId;

/// Who owns a physical frame right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOwner {
    /// Not currently allocated.
    Free,
    /// Owned by the kernel. `run_length` is non-zero only on the first frame
    /// of a contiguous allocation; it records how many frames to release
    /// together when the base address is freed.
    Kernel { run_length: u8 },
    /// Owned by a user address space, mapping the given virtual page.
    User { as_id: AsId, vpn: Vpn },
}

impl FrameOwner {
    fn is_free(self) -> bool {
        matches!(self, FrameOwner::Free)
    }
}

/// The physical frame table.
///
/// Indices are frame numbers relative to [`CoreMap::base`]; frame `i` covers
/// physical bytes `[base + i*PAGE_SIZE, base + (i+1)*PAGE_SIZE)`.
#[derive(Debug)]
pub struct CoreMap {
    base: PhysAddr,
    entries: Vec<FrameOwner>,
    /// Byte content of each managed frame.
    ///
    /// The original kernel reaches physical RAM directly through a
    /// direct-mapped kernel segment (`PADDR_TO_KVADDR`); this library has no
    /// such mapping available, so the coremap carries the content
    /// alongside the ownership array instead. Indices line up with
    /// `entries` -- frame `i`'s bytes live at `bytes[i]`.
    bytes: Vec<[u8; PAGE_SIZE]>,
}

impl CoreMap {
    /// Builds the frame table over `num_frames` frames starting at `base`.
    ///
    /// Mirrors the bootstrap in `spec.md` §4.1: the platform has already
    /// carved off storage for the table itself and handed us the base
    /// address of the first managed frame. Aborts (returns
    /// [`VmError::OutOfFrames`]) if fewer than [`MIN_COREMAP_PAGES`] frames
    /// can be managed.
    pub fn bootstrap(base: PhysAddr, num_frames: usize) -> VmResult<Self> {
        if num_frames < MIN_COREMAP_PAGES {
            log::warn!(
                "coremap: only {} frames available, need at least {}",
                num_frames,
                MIN_COREMAP_PAGES
            );
            return Err(VmError::OutOfFrames);
        }
        log::debug!(
            "coremap: bootstrap base={:?} frames={}",
            base,
            num_frames
        );
        Ok(CoreMap {
            base,
            entries: vec![FrameOwner::Free; num_frames],
            bytes: vec![[0u8; PAGE_SIZE]; num_frames],
        })
    }

    /// Reads the content of the frame at `addr`.
    pub fn read(&self, addr: PhysAddr) -> [u8; PAGE_SIZE] {
        self.bytes[self.index_of(addr)]
    }

    /// Overwrites the content of the frame at `addr`.
    pub fn write(&mut self, addr: PhysAddr, data: &[u8; PAGE_SIZE]) {
        self.bytes[self.index_of(addr)] = *data;
    }

    /// Zeroes the frame at `addr`. Called on every allocation handed to a
    /// user address space (`spec.md` §9 Open Question: a conforming
    /// implementation must zero a newly-allocated frame before first use,
    /// resolved here by zeroing unconditionally on allocation rather than
    /// only for the heap/stack paths -- see DESIGN.md).
    pub fn zero(&mut self, addr: PhysAddr) {
        self.bytes[self.index_of(addr)] = [0u8; PAGE_SIZE];
    }

    pub fn num_frames(&self) -> usize {
        self.entries.len()
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    fn index_of(&self, addr: PhysAddr) -> usize {
        ((addr.as_u32() - self.base.as_u32()) as usize) / PAGE_SIZE
    }

    fn addr_of(&self, idx: usize) -> PhysAddr {
        self.base.offset_pages(idx as u32)
    }

    pub fn owner(&self, addr: PhysAddr) -> FrameOwner {
        self.entries[self.index_of(addr)]
    }

    /// Finds `n` consecutive free frames, without marking them used.
    fn find_contiguous_free(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let mut run = 0usize;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_free() {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// `alloc_kpages` step 2: scan for a run of `n` free frames and mark them
    /// used. Does not evict; the caller retries after eviction on failure.
    pub fn alloc_kpages_scan(&mut self, n: usize) -> VmResult<PhysAddr> {
        if n == 0 || n > MAX_KERNEL_RUN {
            return Err(VmError::OutOfFrames);
        }
        let start = self.find_contiguous_free(n).ok_or(VmError::OutOfFrames)?;
        for i in 0..n {
            self.entries[start + i] = FrameOwner::Kernel {
                run_length: if i == 0 { n as u8 } else { 0 },
            };
        }
        Ok(self.addr_of(start))
    }

    /// Releases a kernel run previously returned by `alloc_kpages_scan`.
    /// `addr` must be the base of the run.
    pub fn free_kpages(&mut self, addr: PhysAddr) {
        let idx = self.index_of(addr);
        let FrameOwner::Kernel { run_length } = self.entries[idx] else {
            debug_assert!(false, "free_kpages: {:?} is not a kernel run base", addr);
            return;
        };
        for i in 0..run_length as usize {
            self.entries[idx + i] = FrameOwner::Free;
        }
    }

    /// Returns the address of any single free frame, without allocating it.
    pub fn find_free(&self) -> Option<PhysAddr> {
        self.entries
            .iter()
            .position(|e| e.is_free())
            .map(|i| self.addr_of(i))
    }

    /// Marks `addr` as owned by `(as_id, vpn)`. `addr` must currently be free.
    pub fn claim_user(&mut self, addr: PhysAddr, as_id: AsId, vpn: Vpn) {
        let idx = self.index_of(addr);
        debug_assert!(self.entries[idx].is_free(), "claim_user: frame not free");
        self.entries[idx] = FrameOwner::User { as_id, vpn };
    }

    /// Marks a user-owned frame free. Asserts it was in fact user-owned.
    pub fn free_user(&mut self, addr: PhysAddr) {
        let idx = self.index_of(addr);
        debug_assert!(
            matches!(self.entries[idx], FrameOwner::User { .. }),
            "free_user: {:?} is not user-owned",
            addr
        );
        self.entries[idx] = FrameOwner::Free;
    }

    /// Releases every frame owned by `as_id`. Used by address-space teardown.
    pub fn free_all_owned_by(&mut self, as_id: AsId) {
        for e in self.entries.iter_mut() {
            if matches!(e, FrameOwner::User { as_id: owner, .. } if *owner == as_id) {
                *e = FrameOwner::Free;
            }
        }
    }

    /// Counts frames currently owned by `as_id`. Used by tests to check the
    /// idempotent-destroy law.
    pub fn count_owned_by(&self, as_id: AsId) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, FrameOwner::User { as_id: owner, .. } if *owner == as_id))
            .count()
    }

    /// Snapshots every currently user-owned frame as `(addr, as_id, vpn)`
    /// triples. Used by `reclaim_all_user_pages` / `evict_all_my_pages_if_necessary`
    /// (`spec.md` §10 supplemented features) to decide what to evict without
    /// holding the coremap lock across each individual eviction.
    pub fn snapshot_user_owned(&self) -> Vec<(PhysAddr, AsId, Vpn)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                FrameOwner::User { as_id, vpn } => Some((self.addr_of(i), *as_id, *vpn)),
                _ => None,
            })
            .collect()
    }

    /// `make_frame_available`'s victim search: starting at `start`, scan
    /// forward then backward (`spec.md` §4.1). A free frame wins
    /// immediately; failing that, a frame owned by `preferred_as` -- the
    /// faulting address space evicting one of its own pages -- is the only
    /// other victim this ever picks. A frame owned by any other address
    /// space is never touched, matching `make_pg_available` in the original
    /// (`pages[i].as == as`), which never evicts a foreign process's page.
    /// Kernel frames are never picked. Returns `None` if the table holds no
    /// free frame and no frame of `preferred_as`'s own -- the caller must
    /// yield and retry (`spec.md` §5, suspension point (a)).
    pub fn pick_victim(&self, start: usize, preferred_as: AsId) -> Option<Victim> {
        let n = self.entries.len();
        if n == 0 {
            return None;
        }
        let start = start % n;
        let mut own_victim: Option<(usize, Vpn)> = None;
        for step in 0..n {
            for idx in [(start + step) % n, (start + n - step) % n] {
                match self.entries[idx] {
                    FrameOwner::Free => return Some(Victim::Free(self.addr_of(idx))),
                    FrameOwner::User { as_id, vpn } if as_id == preferred_as => {
                        if own_victim.is_none() {
                            own_victim = Some((idx, vpn));
                        }
                    }
                    FrameOwner::User { .. } | FrameOwner::Kernel { .. } => {}
                }
            }
        }
        own_victim.map(|(idx, vpn)| Victim::User {
            addr: self.addr_of(idx),
            as_id: preferred_as,
            vpn,
        })
    }
}

/// The outcome of a victim search: either an already-free frame (no eviction
/// needed) or a user frame that must be evicted before reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Victim {
    Free(PhysAddr),
    User {
        addr: PhysAddr,
        as_id: AsId,
        vpn: Vpn,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_rejects_too_few_frames() {
        assert_eq!(
            CoreMap::bootstrap(PhysAddr::new(0), MIN_COREMAP_PAGES - 1).unwrap_err(),
            VmError::OutOfFrames
        );
    }

    #[test]
    fn kernel_run_alloc_and_free() {
        let mut cm = CoreMap::bootstrap(PhysAddr::new(0), 16).unwrap();
        let base = cm.alloc_kpages_scan(4).unwrap();
        for i in 0..4u32 {
            assert!(matches!(
                cm.owner(base.offset_pages(i)),
                FrameOwner::Kernel { .. }
            ));
        }
        cm.free_kpages(base);
        for i in 0..4u32 {
            assert!(cm.owner(base.offset_pages(i)).is_free());
        }
    }

    #[test]
    fn user_claim_and_free() {
        let mut cm = CoreMap::bootstrap(PhysAddr::new(0), 16).unwrap();
        let a = AsId::from_raw(1);
        let addr = cm.find_free().unwrap();
        cm.claim_user(addr, a, Vpn::new(5));
        assert_eq!(cm.owner(addr), FrameOwner::User { as_id: a, vpn: Vpn::new(5) });
        assert_eq!(cm.count_owned_by(a), 1);
        cm.free_user(addr);
        assert!(cm.owner(addr).is_free());
        assert_eq!(cm.count_owned_by(a), 0);
    }

    #[test]
    fn pick_victim_prefers_free_then_same_as() {
        let mut cm = CoreMap::bootstrap(PhysAddr::new(0), 4).unwrap();
        let a = AsId::from_raw(1);
        let b = AsId::from_raw(2);
        // Fill every frame with `b`'s pages except index 2, which stays free.
        for i in [0u32, 1, 3] {
            cm.claim_user(cm.addr_of(i as usize), b, Vpn::new(i));
        }
        match cm.pick_victim(0, a) {
            Some(Victim::Free(addr)) => assert_eq!(addr, cm.addr_of(2)),
            other => panic!("expected the free frame, got {other:?}"),
        }

        // Once nothing is free, a frame owned by the preferred address space
        // ranks above frames owned by anyone else.
        cm.claim_user(cm.addr_of(2), a, Vpn::new(9));
        match cm.pick_victim(0, a) {
            Some(Victim::User { as_id, .. }) => assert_eq!(as_id, a),
            other => panic!("expected a victim owned by `a`, got {other:?}"),
        }
    }

    #[test]
    fn pick_victim_never_touches_a_foreign_address_space() {
        // Every frame is owned by `b`; none are free and none belong to the
        // faulting address space `a`. The only correct answer is "no
        // victim" -- the caller must yield and retry, never evict `b`'s page.
        let mut cm = CoreMap::bootstrap(PhysAddr::new(0), 4).unwrap();
        let a = AsId::from_raw(1);
        let b = AsId::from_raw(2);
        for i in 0..4u32 {
            cm.claim_user(cm.addr_of(i as usize), b, Vpn::new(i));
        }
        assert_eq!(cm.pick_victim(0, a), None);
    }

    #[test]
    fn free_all_owned_by_is_idempotent_destroy() {
        let mut cm = CoreMap::bootstrap(PhysAddr::new(0), 8).unwrap();
        let a = AsId::from_raw(7);
        for i in 0..4u32 {
            cm.claim_user(cm.addr_of(i as usize), a, Vpn::new(i));
        }
        cm.free_all_owned_by(a);
        assert_eq!(cm.count_owned_by(a), 0);
    }
}
