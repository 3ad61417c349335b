//! `VmSystem`: the entry point bundling the frame table, swap store and
//! address-space registry that the original kernel kept as file-scope
//! statics guarded by a single global lock (`spec.md` §9 Design Note).
//!
//! Lock ordering is fixed throughout this module: frame table, then a
//! per-address-space lock, then the swap table. A per-address-space lock is
//! this crate's own addition -- the original relies on a single coarse
//! `core_map_lock` plus raw `struct addrspace *` dereferences across
//! processes, which safe Rust has no equivalent for (see DESIGN.md).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;

use config::mm::{ENTRIES_PER_TABLE, PAGE_SIZE};
use id_allocator::{IdAllocator, VecIdAllocator};
use mutex::{MutexGuard, SpinLock};
use systype::error::VmResult;

use crate::addr_space::AddrSpace;
use crate::address::{PhysAddr, Vpn};
use crate::as_id::AsId;
use crate::elf::ExecFile;
use crate::frame::{CoreMap, Victim};
use crate::swap::{BlockDevice, SwapTable};
use crate::tlb::SoftwareTlb;

/// A reference-counted handle to one live address space, keyed by its
/// `AsId`. Takes the place of the original's raw `struct addrspace *`: safe
/// to hold across calls into `VmSystem`, and cheap to clone.
#[derive(Clone)]
pub struct AsHandle {
    as_id: AsId,
    inner: Arc<SpinLock<AddrSpace>>,
}

impl AsHandle {
    pub fn as_id(&self) -> AsId {
        self.as_id
    }

    pub fn lock(&self) -> MutexGuard<'_, AddrSpace> {
        self.inner.lock()
    }
}

/// Hook called when `make_frame_available` scans the whole frame table and
/// finds only kernel-owned frames. A no-op placeholder here; the embedding
/// scheduler is an external collaborator expected to supply a real
/// preemption point (`spec.md` §5, suspension points).
fn yield_now() {}

/// Bundles every piece of global VM state behind its own lock.
pub struct VmSystem<D: BlockDevice> {
    core_map: SpinLock<CoreMap>,
    swap: SpinLock<SwapTable<D>>,
    spaces: SpinLock<BTreeMap<usize, Arc<SpinLock<AddrSpace>>>>,
    /// Mints and recycles `AsId`s, the same generic allocator the original
    /// kernel uses for PIDs (`spec.md` §1's "generic list and PID
    /// allocator" external collaborator), applied here to the narrower
    /// address-space-id space this crate owns.
    ids: SpinLock<VecIdAllocator>,
    rng: SpinLock<SmallRng>,
}

impl<D: BlockDevice> VmSystem<D> {
    /// `vm_bootstrap`: builds the frame table over `num_frames` frames
    /// starting at `base`, and the swap table over `device`.
    pub fn bootstrap(base: PhysAddr, num_frames: usize, device: D, rng_seed: u64) -> VmResult<Self> {
        let core_map = CoreMap::bootstrap(base, num_frames)?;
        Ok(VmSystem {
            core_map: SpinLock::new(core_map),
            swap: SpinLock::new(SwapTable::new(device)),
            spaces: SpinLock::new(BTreeMap::new()),
            ids: SpinLock::new(VecIdAllocator::new(0, usize::MAX)),
            rng: SpinLock::new(SmallRng::seed_from_u64(rng_seed)),
        })
    }

    fn mint_as_id(&self) -> AsId {
        AsId::from_raw(
            self.ids
                .lock()
                .alloc()
                .expect("address-space id space exhausted"),
        )
    }

    fn lookup(&self, as_id: AsId) -> Option<AsHandle> {
        self.spaces
            .lock()
            .get(&as_id.raw())
            .cloned()
            .map(|inner| AsHandle { as_id, inner })
    }

    /// `alloc_kpages`: a contiguous run of `n` kernel frames. Tries a direct
    /// scan first; if none is free, evicts every user page once (mirroring
    /// `reclaim_all_user_pages`) and retries exactly once more.
    pub fn alloc_kpages(&self, n: usize) -> VmResult<PhysAddr> {
        if let Ok(addr) = self.core_map.lock().alloc_kpages_scan(n) {
            return Ok(addr);
        }
        self.reclaim_all_user_frames();
        self.core_map.lock().alloc_kpages_scan(n)
    }

    pub fn free_kpages(&self, addr: PhysAddr) {
        self.core_map.lock().free_kpages(addr);
    }

    /// `as_create`: allocates a fresh `AsId` and an empty address space.
    pub fn as_create(&self, exec_path: &str, exec: Arc<dyn ExecFile + Send + Sync>) -> AsHandle {
        let as_id = self.mint_as_id();
        let space = Arc::new(SpinLock::new(AddrSpace::new(as_id, exec_path, exec)));
        self.spaces.lock().insert(as_id.raw(), space.clone());
        log::debug!("as_create: {:?} exec={:?}", as_id, exec_path);
        AsHandle { as_id, inner: space }
    }

    /// `as_destroy`: releases every frame and swap slot owned by `handle`,
    /// then drops it from the registry. Idempotent: calling it twice, or
    /// checking `count_owned_by` afterwards, is always safe (`spec.md` §6
    /// testable property).
    pub fn as_destroy(&self, handle: AsHandle) {
        let as_id = handle.as_id;
        self.core_map.lock().free_all_owned_by(as_id);
        self.swap.lock().swap_free(as_id);
        handle.inner.lock().reset_caches();
        // Only the call that actually removes the registry entry recycles
        // the id -- a second `as_destroy` on the same handle (the
        // idempotent-destroy law, `spec.md` §6) must not double-free it.
        if self.spaces.lock().remove(&as_id.raw()).is_some() {
            // SAFETY: `as_id` was allocated by `mint_as_id` and has not been
            // deallocated since -- the registry entry we just removed was
            // its only live reference.
            unsafe {
                self.ids.lock().dealloc(as_id.raw());
            }
        }
        log::debug!("as_destroy: {:?}", as_id);
    }

    /// `as_activate`: flushes the calling thread's TLB. The original also
    /// swaps which `struct addrspace *` the current thread points at; this
    /// library leaves "which address space is current" to the caller, who
    /// already holds `handle`.
    pub fn as_activate(&self, tlb: &mut SoftwareTlb) {
        tlb.flush();
    }

    /// Claims a physical frame for `(as_id, vpn)`, evicting a victim first
    /// if none is free, but does not zero it. Shared by [`Self::alloc_frame`]
    /// and [`Self::as_copy`], which have different ideas of what the frame's
    /// initial content should be.
    fn claim_frame(
        &self,
        as_id: AsId,
        vpn: Vpn,
        current: &mut AddrSpace,
        tlb: Option<&mut SoftwareTlb>,
    ) -> VmResult<PhysAddr> {
        {
            let mut cm = self.core_map.lock();
            if let Some(addr) = cm.find_free() {
                cm.claim_user(addr, as_id, vpn);
                return Ok(addr);
            }
        }
        let addr = self.make_frame_available(as_id, current, tlb)?;
        self.core_map.lock().claim_user(addr, as_id, vpn);
        Ok(addr)
    }

    /// Allocates and zeroes a physical frame for `(as_id, vpn)`. Zeroing
    /// unconditionally, rather than only for anonymous (heap/stack) pages,
    /// resolves `spec.md` §9's Open Question: a reused frame must never
    /// leak a previous address space's content (see DESIGN.md).
    pub fn alloc_frame(
        &self,
        as_id: AsId,
        vpn: Vpn,
        current: &mut AddrSpace,
        tlb: Option<&mut SoftwareTlb>,
    ) -> VmResult<PhysAddr> {
        let addr = self.claim_frame(as_id, vpn, current, tlb)?;
        self.core_map.lock().zero(addr);
        Ok(addr)
    }

    pub(crate) fn release_frame(&self, addr: PhysAddr) {
        self.core_map.lock().free_user(addr);
    }

    /// `make_frame_available` (`spec.md` §4.1 / §9 Open Question): picks a
    /// victim with [`CoreMap::pick_victim`] starting from a random index,
    /// evicts it if it is user-owned, and returns the now-free frame.
    /// [`CoreMap::pick_victim`] never names an address space other than
    /// `as_id` itself, so every `Victim::User` here is `current`'s own page
    /// -- there is no foreign address space to look up or lock. Loops
    /// (yielding between attempts) whenever no free frame and no frame of
    /// `as_id`'s own exists yet (`spec.md` §5, suspension point (a)).
    fn make_frame_available(
        &self,
        as_id: AsId,
        current: &mut AddrSpace,
        tlb: Option<&mut SoftwareTlb>,
    ) -> VmResult<PhysAddr> {
        loop {
            let num_frames = self.core_map.lock().num_frames();
            let start = self.rng.lock().gen_range(0..num_frames.max(1));
            let mut cm = self.core_map.lock();
            match cm.pick_victim(start, as_id) {
                Some(Victim::Free(addr)) => return Ok(addr),
                Some(Victim::User { addr, as_id: victim_as, vpn: victim_vpn }) => {
                    debug_assert_eq!(victim_as, as_id, "pick_victim must only return our own pages");
                    self.evict_from(&mut cm, current, victim_vpn, addr, tlb)?;
                    cm.free_user(addr);
                    return Ok(addr);
                }
                None => {
                    drop(cm);
                    yield_now();
                }
            }
        }
    }

    /// Evicts the page at `vpn` within `space`, whose resident frame is
    /// `addr`: persists it to swap unless it is backed by a still-readable
    /// executable region, clears `VALID` in its page-table entry, and
    /// invalidates `tlb` if given (only ever the calling thread's own TLB,
    /// and only when `space` is that thread's own address space -- cross-
    /// process TLB shootdown is an external collaborator's responsibility,
    /// see DESIGN.md).
    fn evict_from(
        &self,
        cm: &mut CoreMap,
        space: &mut AddrSpace,
        vpn: Vpn,
        addr: PhysAddr,
        tlb: Option<&mut SoftwareTlb>,
    ) -> VmResult<()> {
        let as_id = space.as_id();
        let is_executable = space.region_is_executable(vpn);
        let slot = space.get_ptbl(&mut self.swap.lock(), vpn, is_executable)?;

        if !is_executable {
            let bytes = cm.read(addr);
            self.swap.lock().swap_out(as_id, vpn, &bytes)?;
        }

        space
            .ptbl_cache_mut()
            .table_mut(slot)
            .entry_mut(vpn.table_index())
            .clear_valid();

        if let Some(tlb) = tlb {
            tlb.invalidate(vpn);
        }

        log::trace!(
            "evict_from: {:?}/{:?} executable={} addr={:?}",
            as_id,
            vpn,
            is_executable,
            addr
        );
        Ok(())
    }

    /// `reclaim_all_user_pages`: evicts and frees every user-owned frame in
    /// the system, e.g. to satisfy a kernel allocation that needs more
    /// contiguous frames than are currently free.
    pub fn reclaim_all_user_frames(&self) {
        let mut cm = self.core_map.lock();
        let victims = cm.snapshot_user_owned();
        for (addr, as_id, vpn) in victims {
            if let Some(handle) = self.lookup(as_id) {
                let mut space = handle.lock();
                self.evict_from(&mut cm, &mut space, vpn, addr, None)
                    .expect("reclaim_all_user_frames: swap exhausted while reclaiming for the kernel");
            }
            cm.free_user(addr);
        }
        log::debug!("reclaim_all_user_frames: done");
    }

    /// `evict_all_my_pages_if_necessary`: if the frame table is already
    /// full, evicts every frame owned by `handle`'s own address space. A
    /// no-op when free frames remain (`spec.md` §9 supplemented feature).
    pub fn evict_all(&self, handle: &AsHandle) {
        let as_id = handle.as_id();
        let mut cm = self.core_map.lock();
        if cm.find_free().is_some() {
            return;
        }
        let victims: alloc::vec::Vec<(PhysAddr, Vpn)> = cm
            .snapshot_user_owned()
            .into_iter()
            .filter(|(_, owner, _)| *owner == as_id)
            .map(|(addr, _, vpn)| (addr, vpn))
            .collect();
        let mut space = handle.lock();
        for (addr, vpn) in victims {
            self.evict_from(&mut cm, &mut space, vpn, addr, None)
                .expect("evict_all: swap exhausted while evicting our own pages");
            cm.free_user(addr);
        }
    }

    /// Zeroes the entire swap table. Used on full system teardown in tests.
    pub fn swap_reclaim_all(&self) {
        self.swap.lock().swap_reclaim_all();
    }

    /// `as_copy` (fork): clones `src`'s regions, heap/stack bounds and exec
    /// metadata into a freshly-minted address space, then walks every
    /// resident directory and copies each valid or swapped page into a
    /// frame of its own so subsequent writes in either address space are
    /// invisible to the other (`spec.md` §6 testable property).
    pub fn as_copy(&self, src: &AsHandle) -> VmResult<AsHandle> {
        let mut src_space = src.lock();
        let dest_id = self.mint_as_id();
        let mut dest_space = AddrSpace::new(dest_id, src_space.exec_path(), src_space.exec().clone());

        for (i, region) in src_space.regions().iter().enumerate() {
            if let Some(region) = region {
                dest_space.set_region(i, *region);
            }
        }
        dest_space.set_heap_stack(src_space.heap_vstart(), src_space.heap_vtop(), src_space.stack_vbase());

        for dir_index in 0..ENTRIES_PER_TABLE {
            if !src_space.dir_loaded(dir_index) {
                continue;
            }
            let rep_vpn = Vpn::new((dir_index as u32) << 10);
            let is_executable = src_space.region_is_executable(rep_vpn);

            let src_slot = src_space.get_ptbl(&mut self.swap.lock(), rep_vpn, is_executable)?;
            let dest_slot = dest_space.get_ptbl(&mut self.swap.lock(), rep_vpn, is_executable)?;

            for table_idx in 0..ENTRIES_PER_TABLE {
                let src_entry = src_space.ptbl_cache().table(src_slot).entry(table_idx);
                if !src_entry.is_loaded() {
                    continue;
                }
                let vpn = Vpn::new(((dir_index as u32) << 10) | table_idx as u32);

                // Holds the frame-table lock across the validity check and
                // the read so the source frame cannot be evicted in
                // between (`spec.md` §4.3).
                let mut cm = self.core_map.lock();
                let bytes = match src_entry.frame() {
                    Some(src_addr) => cm.read(src_addr),
                    None => {
                        drop(cm);
                        let mut buf = [0u8; PAGE_SIZE];
                        self.swap.lock().swap_copy_in(src_space.as_id(), vpn, &mut buf)?;
                        buf
                    }
                };

                let dest_addr = self.claim_frame(dest_id, vpn, &mut dest_space, None)?;
                self.core_map.lock().write(dest_addr, &bytes);

                dest_space
                    .ptbl_cache_mut()
                    .table_mut(dest_slot)
                    .entry_mut(table_idx)
                    .install(dest_addr, src_entry.perm());
            }
        }

        let handle = Arc::new(SpinLock::new(dest_space));
        self.spaces.lock().insert(dest_id.raw(), handle.clone());
        log::debug!("as_copy: {:?} -> {:?}", src.as_id(), dest_id);
        Ok(AsHandle { as_id: dest_id, inner: handle })
    }

    pub(crate) fn swap_lock(&self) -> MutexGuard<'_, SwapTable<D>> {
        self.swap.lock()
    }

    pub(crate) fn core_map_lock(&self) -> MutexGuard<'_, CoreMap> {
        self.core_map.lock()
    }

    pub(crate) fn rng_lock(&self) -> MutexGuard<'_, SmallRng> {
        self.rng.lock()
    }
}
