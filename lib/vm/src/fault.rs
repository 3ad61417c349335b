//! The page-fault handler: classifies the faulting address, resolves or
//! demand-loads the backing page, and installs a TLB translation.
//!
//! Grounded on `vm_fault` and `load_segment_if_required` /
//! `find_pte_not_swapped_out` in
//! `examples/original_source/kern/arch/mips/mips/dumbvm.c`.

use config::mm::PAGE_SIZE;
use systype::memory_flags::MappingFlags;

use crate::addr_space::{AddrSpace, Classify, LoadRegion};
use crate::address::{VirtAddr, Vpn};
use crate::as_id::AsId;
use crate::elf::load_region_page;
use crate::swap::BlockDevice;
use crate::system::{AsHandle, VmSystem};
use crate::tlb::{SoftwareTlb, TlbEntry};

/// The kind of memory access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
    /// A write against a TLB entry that was valid but not dirty.
    ReadOnly,
}

/// The outcome of handling a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was resolved; the faulting instruction may be retried.
    Ok,
    /// The access was not legal for this address space (unbacked address,
    /// or a write to a read-only region). The caller should terminate the
    /// offending user process.
    User,
    /// No address space is installed, or an internal VM failure occurred
    /// (out of frames/swap). The caller should treat this as a kernel fault.
    Kernel,
}

impl core::fmt::Display for FaultOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FaultOutcome::Ok => "resolved",
            FaultOutcome::User => "bad user access",
            FaultOutcome::Kernel => "kernel-level fault",
        };
        write!(f, "{}", s)
    }
}

/// What kind of content, if any, a not-yet-valid page needs loaded before
/// its mapping can be installed.
enum FaultKind {
    /// The instruction stream: always reloaded from the executable,
    /// regardless of whether it was previously loaded (`spec.md` §4.4 --
    /// code pages are never dirtied, so re-reading from the ELF image is
    /// always correct and cheaper than a round trip through swap).
    Code(LoadRegion),
    /// A data segment page: reloaded from the executable only the first
    /// time it is touched; every subsequent fault goes through swap.
    Data(LoadRegion),
    /// Heap or stack: no executable backing. First touch is pre-zeroed by
    /// the frame allocator; later faults come from swap.
    Anon,
}

impl<D: BlockDevice> VmSystem<D> {
    /// `vm_fault` (`spec.md` §4.4): the entry point the embedding kernel
    /// calls on every TLB miss or TLB-modify exception.
    pub fn vm_fault(
        &self,
        current: Option<(&AsHandle, &mut AddrSpace)>,
        tlb: &mut SoftwareTlb,
        fault_type: FaultType,
        fault_address: u32,
    ) -> FaultOutcome {
        let Some((handle, space)) = current else {
            log::warn!("vm_fault: no address space installed for {:#x}", fault_address);
            return FaultOutcome::Kernel;
        };
        let as_id = handle.as_id();
        let addr = VirtAddr::new(fault_address).page_floor();
        let vpn = addr.vpn();

        let (perm, kind) = match space.classify(addr.as_u32()) {
            Classify::Region { index, perm } => {
                let region = space.regions()[index].expect("classified into this region");
                let kind = if perm.contains(MappingFlags::X) {
                    FaultKind::Code(region)
                } else {
                    FaultKind::Data(region)
                };
                (perm, kind)
            }
            Classify::Stack => (MappingFlags::R | MappingFlags::W, FaultKind::Anon),
            Classify::GrowStack => {
                let new_base = space.stack_vbase() - PAGE_SIZE as u32;
                space.set_stack_vbase(new_base);
                (MappingFlags::R | MappingFlags::W, FaultKind::Anon)
            }
            Classify::Heap => (MappingFlags::R | MappingFlags::W, FaultKind::Anon),
            Classify::Invalid => {
                log::debug!("vm_fault: {:#x} is not backed by any region", fault_address);
                return FaultOutcome::User;
            }
        };

        if fault_type == FaultType::ReadOnly && !perm.contains(MappingFlags::W) {
            log::debug!("vm_fault: write to read-only page at {:#x}", fault_address);
            return FaultOutcome::User;
        }

        let is_executable = matches!(kind, FaultKind::Code(_));
        let slot = match space.get_ptbl(&mut self.swap_lock(), vpn, is_executable) {
            Ok(slot) => slot,
            Err(e) => {
                log::warn!("vm_fault: get_ptbl failed at {:#x}: {}", fault_address, e);
                return FaultOutcome::Kernel;
            }
        };

        if !space.ptbl_cache().table(slot).entry(vpn.table_index()).is_valid() {
            if let Err(outcome) = self.fill_page(as_id, vpn, space, slot, kind, tlb) {
                return outcome;
            }
        }

        let paddr = space
            .ptbl_cache()
            .table(slot)
            .entry(vpn.table_index())
            .frame()
            .expect("just installed a valid mapping");

        let dirty = match fault_type {
            FaultType::Write | FaultType::ReadOnly => true,
            FaultType::Read => perm.contains(MappingFlags::W),
        };

        tlb.install(TlbEntry { vpn, pfn: paddr, dirty }, &mut *self.rng_lock());
        FaultOutcome::Ok
    }

    /// Allocates a frame for `vpn` and fills it per `kind`, installing the
    /// resulting mapping into `slot`. On any failure the frame is released
    /// before returning, so the fault handler never leaves a half-installed
    /// mapping behind (`spec.md` §7).
    fn fill_page(
        &self,
        as_id: AsId,
        vpn: Vpn,
        space: &mut AddrSpace,
        slot: crate::addr_space::ptbl_cache::SlotHandle,
        kind: FaultKind,
        tlb: &mut SoftwareTlb,
    ) -> Result<(), FaultOutcome> {
        let paddr = self
            .alloc_frame(as_id, vpn, space, Some(tlb))
            .map_err(|e| {
                log::warn!("vm_fault: alloc_frame failed for {:?}: {}", vpn, e);
                FaultOutcome::Kernel
            })?;

        let already_loaded = space.ptbl_cache().table(slot).entry(vpn.table_index()).is_loaded();
        let result = match kind {
            FaultKind::Code(region) => self.demand_load(&region, vpn, paddr, space),
            FaultKind::Data(region) if !already_loaded => self.demand_load(&region, vpn, paddr, space),
            FaultKind::Data(_) => self.swap_in_to(as_id, vpn, paddr),
            FaultKind::Anon if !already_loaded => Ok(()),
            FaultKind::Anon => self.swap_in_to(as_id, vpn, paddr),
        };

        if let Err(e) = result {
            log::warn!("vm_fault: failed to fill {:?}: {}", vpn, e);
            self.release_frame(paddr);
            return Err(FaultOutcome::Kernel);
        }

        let perm = space
            .regions()
            .iter()
            .flatten()
            .find(|r| r.contains(vpn))
            .map(|r| r.perm)
            .unwrap_or(MappingFlags::R | MappingFlags::W);

        space
            .ptbl_cache_mut()
            .table_mut(slot)
            .entry_mut(vpn.table_index())
            .install(paddr, perm);
        Ok(())
    }

    fn demand_load(
        &self,
        region: &LoadRegion,
        vpn: Vpn,
        paddr: crate::address::PhysAddr,
        space: &AddrSpace,
    ) -> systype::error::VmResult<()> {
        let mut buf = [0u8; PAGE_SIZE];
        load_region_page(space.exec().as_ref(), region, vpn, &mut buf)?;
        self.core_map_lock().write(paddr, &buf);
        Ok(())
    }

    fn swap_in_to(&self, as_id: AsId, vpn: Vpn, paddr: crate::address::PhysAddr) -> systype::error::VmResult<()> {
        let mut buf = [0u8; PAGE_SIZE];
        self.swap_lock().swap_in(as_id, vpn, &mut buf)?;
        self.core_map_lock().write(paddr, &buf);
        Ok(())
    }
}

/// End-to-end scenarios (`spec.md` §8, S1-S6), each building a real
/// `VmSystem` over a fake ELF image and driving it purely through
/// `vm_fault`, the way the original exercises `dumbvm.c` from userspace
/// trap handlers.
#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::address::PhysAddr;
    use crate::elf::test_support::{fake_elf_one_segment, fake_elf_two_segments};
    use crate::elf::{ExecFile, InMemoryExecFile, load_elf};
    use crate::swap::MemBlockDevice;
    use crate::system::VmSystem;

    fn fresh_system(num_frames: usize) -> VmSystem<MemBlockDevice> {
        VmSystem::bootstrap(
            PhysAddr::new(0),
            num_frames,
            MemBlockDevice::new(config::mm::SWAP_SLOTS),
            1,
        )
        .unwrap()
    }

    /// Resolves the frame backing `vpn` (which must already be valid) and
    /// reads its current content, the way a test double for physical memory
    /// would without a CPU in between.
    fn read_mapped_page<D: BlockDevice>(
        vm: &VmSystem<D>,
        space: &mut AddrSpace,
        vpn: Vpn,
        is_executable: bool,
    ) -> [u8; PAGE_SIZE] {
        let slot = space.get_ptbl(&mut vm.swap_lock(), vpn, is_executable).unwrap();
        let paddr = space
            .ptbl_cache()
            .table(slot)
            .entry(vpn.table_index())
            .frame()
            .expect("vpn should already be mapped");
        vm.core_map_lock().read(paddr)
    }

    /// S1: a fresh process touches its own entry point for the first time.
    /// The fault handler must demand-load the code page straight from the
    /// ELF image and resolve with `FaultOutcome::Ok`.
    #[test]
    fn s1_demand_loads_code_page_from_elf() {
        let vm = fresh_system(8);
        let code = [0x11u8; PAGE_SIZE];
        let raw = fake_elf_one_segment(0x1000, &code);
        let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(raw.clone()));
        let handle = vm.as_create("prog", exec);

        {
            let mut space = handle.lock();
            load_elf(&mut space, &raw).unwrap();
            space.complete_load().unwrap();
            space.define_stack().unwrap();
        }

        let mut tlb = SoftwareTlb::new();
        let outcome = {
            let mut space = handle.lock();
            vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Read, 0x1000)
        };
        assert_eq!(outcome, FaultOutcome::Ok);

        let mut space = handle.lock();
        let vpn = VirtAddr::new(0x1000).vpn();
        assert_eq!(&read_mapped_page(&vm, &mut space, vpn, true)[..], &code[..]);
        assert!(tlb.probe(vpn).is_some());
    }

    /// S2: a fault one page below the current stack base, inside the
    /// single-page grow-stack probe zone, grows the stack by one page and
    /// resolves instead of killing the process.
    #[test]
    fn s2_stack_probe_grows_the_stack() {
        let vm = fresh_system(8);
        let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(alloc::vec![0u8; 16]));
        let handle = vm.as_create("prog", exec);
        let stack_top = {
            let mut space = handle.lock();
            space.complete_load().unwrap();
            space.define_stack().unwrap()
        };

        let probe_addr = {
            let space = handle.lock();
            space.stack_vbase() - PAGE_SIZE as u32
        };

        let mut tlb = SoftwareTlb::new();
        let outcome = {
            let mut space = handle.lock();
            vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Write, probe_addr)
        };
        assert_eq!(outcome, FaultOutcome::Ok);

        let space = handle.lock();
        assert_eq!(space.stack_vbase(), probe_addr);
        assert_eq!(stack_top, config::mm::USERSTACK);
    }

    /// S3: growing the heap with `sbrk` and then touching the newly granted
    /// range demand-zeroes it rather than serving stale frame content.
    #[test]
    fn s3_heap_grown_by_sbrk_is_zero_filled_on_first_touch() {
        let vm = fresh_system(8);
        let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(alloc::vec![0u8; 16]));
        let handle = vm.as_create("prog", exec);
        let heap_start = {
            let mut space = handle.lock();
            space.complete_load().unwrap();
            space.define_stack().unwrap();
            space.sbrk(PAGE_SIZE as i32).unwrap();
            space.heap_vstart()
        };

        let mut tlb = SoftwareTlb::new();
        let outcome = {
            let mut space = handle.lock();
            vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Write, heap_start)
        };
        assert_eq!(outcome, FaultOutcome::Ok);

        let mut space = handle.lock();
        let vpn = VirtAddr::new(heap_start).vpn();
        assert_eq!(read_mapped_page(&vm, &mut space, vpn, false), [0u8; PAGE_SIZE]);
    }

    /// Supporting unit check for S4: under frame pressure, a page evicted
    /// to swap comes back with its exact content on the next fault that
    /// touches it. See `s4_swap_pressure_across_two_address_spaces` below
    /// for the literal spec.md §8 scenario (two address spaces alternating).
    #[test]
    fn s4_evicted_data_page_round_trips_through_swap() {
        // One frame total forces every second page-in to evict the page
        // already resident for this same address space.
        let vm = fresh_system(1);
        let code_vaddr = 0x1000u32;
        let data_vaddr = 0x10_0000u32;
        let raw = fake_elf_two_segments(code_vaddr, 1, data_vaddr, 1);
        let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(raw.clone()));
        let handle = vm.as_create("prog", exec);
        {
            let mut space = handle.lock();
            load_elf(&mut space, &raw).unwrap();
            space.complete_load().unwrap();
            space.define_stack().unwrap();
        }

        let mut tlb = SoftwareTlb::new();

        // Fault in the data page, then dirty it so the evicted copy must be
        // read back from swap, not silently re-demand-loaded from the ELF.
        {
            let mut space = handle.lock();
            let outcome = vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Write, data_vaddr);
            assert_eq!(outcome, FaultOutcome::Ok);
            let vpn = VirtAddr::new(data_vaddr).vpn();
            let slot = space.get_ptbl(&mut vm.swap_lock(), vpn, false).unwrap();
            let paddr = space.ptbl_cache().table(slot).entry(vpn.table_index()).frame().unwrap();
            vm.core_map_lock().write(paddr, &[0x5Au8; PAGE_SIZE]);
        }

        // Faulting the code page forces eviction of the sole frame, which
        // must carry the data page's dirtied content out to swap.
        {
            let mut space = handle.lock();
            let outcome = vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Read, code_vaddr);
            assert_eq!(outcome, FaultOutcome::Ok);
        }
        assert!(vm.swap_lock().contains(handle.as_id(), VirtAddr::new(data_vaddr).vpn()));

        // Touching the data page again must fault it back in from swap with
        // the exact bytes written above, not fresh zeroes or ELF content.
        {
            let mut space = handle.lock();
            let outcome = vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Read, data_vaddr);
            assert_eq!(outcome, FaultOutcome::Ok);
            let vpn = VirtAddr::new(data_vaddr).vpn();
            assert_eq!(&read_mapped_page(&vm, &mut space, vpn, false)[..], &[0x5Au8; PAGE_SIZE][..]);
        }
    }

    /// S4: on a system with N frames, allocate N+5 pages across two address
    /// spaces alternately; every page's recorded write value must be
    /// recoverable by reading it back, with no `USER_FAULT` and no abort.
    /// With eviction restricted to same-address-space frames only
    /// (`spec.md` §4.1), each address space evicts solely its own prior
    /// page on this alternating pattern -- this is the test that would have
    /// caught a `pick_victim` that reached across address spaces instead.
    #[test]
    fn s4_swap_pressure_across_two_address_spaces() {
        let vm = fresh_system(2);
        let make_space = |name: &str| -> AsHandle {
            let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(alloc::vec![0u8; 16]));
            let handle = vm.as_create(name, exec);
            {
                let mut space = handle.lock();
                space.complete_load().unwrap();
                space.define_stack().unwrap();
                space.sbrk(4 * PAGE_SIZE as i32).unwrap();
            }
            handle
        };
        let a = make_space("a");
        let b = make_space("b");

        let mut tlb = SoftwareTlb::new();
        let mut expected: alloc::vec::Vec<(bool, u32, u8)> = alloc::vec::Vec::new();

        // N + 5 = 7 faults, alternating address space on every fault.
        for i in 0u32..7 {
            let is_a = i % 2 == 0;
            let handle = if is_a { &a } else { &b };
            let page_idx = i / 2;
            let value = 0x10 + i as u8;
            let vaddr = {
                let space = handle.lock();
                space.heap_vstart() + page_idx * PAGE_SIZE as u32
            };

            let outcome = {
                let mut space = handle.lock();
                vm.vm_fault(Some((handle, &mut space)), &mut tlb, FaultType::Write, vaddr)
            };
            assert_eq!(outcome, FaultOutcome::Ok, "fault {} must not be rejected", i);

            {
                let mut space = handle.lock();
                let vpn = VirtAddr::new(vaddr).vpn();
                let slot = space.get_ptbl(&mut vm.swap_lock(), vpn, false).unwrap();
                let paddr = space.ptbl_cache().table(slot).entry(vpn.table_index()).frame().unwrap();
                vm.core_map_lock().write(paddr, &[value; PAGE_SIZE]);
            }

            expected.push((is_a, vaddr, value));
        }

        // Every one of the seven pages' recorded value must be recoverable,
        // even though only two physical frames ever backed all of them.
        for (is_a, vaddr, value) in expected {
            let handle = if is_a { &a } else { &b };
            let outcome = {
                let mut space = handle.lock();
                vm.vm_fault(Some((handle, &mut space)), &mut tlb, FaultType::Read, vaddr)
            };
            assert_eq!(outcome, FaultOutcome::Ok);

            let mut space = handle.lock();
            let vpn = VirtAddr::new(vaddr).vpn();
            assert_eq!(read_mapped_page(&vm, &mut space, vpn, false), [value; PAGE_SIZE]);
        }
    }

    /// S5: after `as_copy`, writing a page in the parent must not be
    /// visible to the child -- each holds its own physical frame, per the
    /// no-COW fork contract.
    #[test]
    fn s5_fork_then_diverge_keeps_frames_independent() {
        let vm = fresh_system(8);
        let data_vaddr = 0x10_0000u32;
        let raw = fake_elf_two_segments(0x1000, 1, data_vaddr, 1);
        let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(raw.clone()));
        let parent = vm.as_create("prog", exec);
        {
            let mut space = parent.lock();
            load_elf(&mut space, &raw).unwrap();
            space.complete_load().unwrap();
            space.define_stack().unwrap();
        }

        let mut tlb = SoftwareTlb::new();
        {
            let mut space = parent.lock();
            let outcome = vm.vm_fault(Some((&parent, &mut space)), &mut tlb, FaultType::Write, data_vaddr);
            assert_eq!(outcome, FaultOutcome::Ok);
        }

        let child = vm.as_copy(&parent).unwrap();

        {
            let mut space = parent.lock();
            let vpn = VirtAddr::new(data_vaddr).vpn();
            let slot = space.get_ptbl(&mut vm.swap_lock(), vpn, false).unwrap();
            let paddr = space.ptbl_cache().table(slot).entry(vpn.table_index()).frame().unwrap();
            vm.core_map_lock().write(paddr, &[0x7Eu8; PAGE_SIZE]);
        }

        let mut child_space = child.lock();
        let vpn = VirtAddr::new(data_vaddr).vpn();
        let child_bytes = read_mapped_page(&vm, &mut child_space, vpn, false);
        // `as_copy` must have copied the page's content as it stood at fork
        // time (the ELF-backed 0xD0 fill pattern); the parent's later write
        // of 0x7E must not have reached the child's own frame.
        assert_eq!(child_bytes, [0xD0u8; PAGE_SIZE]);
    }

    /// S6: a store to a region mapped R|X only -- reported the way a CPU
    /// reports a dirty-bit trap against an already-valid, read-only TLB
    /// entry -- is rejected as a user fault rather than silently allowed.
    #[test]
    fn s6_write_to_read_only_region_is_a_user_fault() {
        let vm = fresh_system(8);
        let code = [0x11u8; PAGE_SIZE];
        let raw = fake_elf_one_segment(0x1000, &code);
        let exec: Arc<dyn ExecFile + Send + Sync> = Arc::new(InMemoryExecFile::new(raw.clone()));
        let handle = vm.as_create("prog", exec);
        {
            let mut space = handle.lock();
            load_elf(&mut space, &raw).unwrap();
            space.complete_load().unwrap();
            space.define_stack().unwrap();
        }

        let mut tlb = SoftwareTlb::new();
        // First reference is a plain read, establishing a valid mapping.
        {
            let mut space = handle.lock();
            let outcome = vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::Read, 0x1000);
            assert_eq!(outcome, FaultOutcome::Ok);
        }

        // A later store to the same page traps as VM_FAULT_READONLY
        // (valid-but-not-dirty TLB entry); the region has no W permission,
        // so this must be rejected rather than silently marked dirty.
        let mut space = handle.lock();
        let outcome = vm.vm_fault(Some((&handle, &mut space)), &mut tlb, FaultType::ReadOnly, 0x1000);
        assert_eq!(outcome, FaultOutcome::User);
    }
}
