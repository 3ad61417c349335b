//! Per-process address space: load regions, heap/stack bounds, and the
//! two-level demand-paged page table (directory + bounded resident cache).
//!
//! See `spec.md` §3-4.3.

pub mod page_table;
pub mod ptbl_cache;

use alloc::string::String;
use alloc::sync::Arc;

use config::mm::{MAX_LOAD_REGIONS, PAGE_SIZE, USER_HEAP_MAX, USERSTACK};
use systype::error::{VmError, VmResult};
use systype::memory_flags::MappingFlags;

use crate::address::{VirtAddr, Vpn};
use crate::as_id::AsId;
use crate::elf::ExecFile;
use crate::swap::{BlockDevice, SwapTable};
use page_table::PageDirectory;
use ptbl_cache::{PtblCache, SlotHandle};

/// One `PT_LOAD` region: the code segment (region 0) or the data segment
/// (region 1). At most [`MAX_LOAD_REGIONS`] may be defined.
#[derive(Debug, Clone, Copy)]
pub struct LoadRegion {
    pub base_vpn: Vpn,
    pub npages: u32,
    pub perm: MappingFlags,
    pub file_offset: u32,
    pub filesize: u32,
    pub memsize: u32,
}

impl LoadRegion {
    pub fn contains(&self, vpn: Vpn) -> bool {
        let start = self.base_vpn.as_u32();
        vpn.as_u32() >= start && vpn.as_u32() < start + self.npages
    }

    fn top_addr(&self) -> u32 {
        self.base_vpn.addr().as_u32() + self.npages * PAGE_SIZE as u32
    }
}

/// Classification of a faulting address against the regions of an address
/// space, per `spec.md` §4.4 step 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classify {
    /// Falls in load region `index` (0 = code, 1 = data).
    Region { index: usize, perm: MappingFlags },
    /// Falls in the current stack band; grows no further.
    Stack,
    /// Falls in the single-page probe zone just below the stack; growing the
    /// stack by one page will satisfy this access.
    GrowStack,
    /// Falls in the heap.
    Heap,
    /// Not backed by anything: the caller should terminate the process.
    Invalid,
}

/// A process's virtual address space.
pub struct AddrSpace {
    as_id: AsId,
    regions: [Option<LoadRegion>; MAX_LOAD_REGIONS],
    exec_path: String,
    exec: Arc<dyn ExecFile + Send + Sync>,
    heap_vstart: u32,
    heap_vtop: u32,
    stack_vbase: u32,
    directory: PageDirectory,
    ptbl_cache: PtblCache,
}

impl AddrSpace {
    pub(crate) fn new(as_id: AsId, exec_path: &str, exec: Arc<dyn ExecFile + Send + Sync>) -> Self {
        let mut path = String::from(exec_path);
        path.truncate(config::mm::MAX_EXEC_PATH_LEN);
        AddrSpace {
            as_id,
            regions: [None, None],
            exec_path: path,
            exec,
            heap_vstart: 0,
            heap_vtop: 0,
            stack_vbase: USERSTACK,
            directory: PageDirectory::zeroed(),
            ptbl_cache: PtblCache::new(),
        }
    }

    pub fn as_id(&self) -> AsId {
        self.as_id
    }

    pub fn exec_path(&self) -> &str {
        &self.exec_path
    }

    pub fn exec(&self) -> &Arc<dyn ExecFile + Send + Sync> {
        &self.exec
    }

    pub fn regions(&self) -> &[Option<LoadRegion>; MAX_LOAD_REGIONS] {
        &self.regions
    }

    pub fn heap_vstart(&self) -> u32 {
        self.heap_vstart
    }

    pub fn heap_vtop(&self) -> u32 {
        self.heap_vtop
    }

    pub fn stack_vbase(&self) -> u32 {
        self.stack_vbase
    }

    pub(crate) fn set_stack_vbase(&mut self, v: u32) {
        self.stack_vbase = v;
    }

    pub(crate) fn directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.directory
    }

    pub(crate) fn ptbl_cache_mut(&mut self) -> &mut PtblCache {
        &mut self.ptbl_cache
    }

    pub(crate) fn ptbl_cache(&self) -> &PtblCache {
        &self.ptbl_cache
    }

    /// `as_define_region` (`spec.md` §6): aligns base down and size up to
    /// the page, fills region 0 if empty else region 1, rejects a third.
    /// Returns the index the region was stored at, so the ELF loader can
    /// follow up with [`Self::set_region_file_info`].
    pub fn define_region(&mut self, vaddr: u32, size: u32, perm: MappingFlags) -> VmResult<usize> {
        let base = VirtAddr::new(vaddr).page_floor();
        let top = VirtAddr::new(vaddr.saturating_add(size)).page_ceil();
        let npages = (top.as_u32() - base.as_u32()) / PAGE_SIZE as u32;
        let region = LoadRegion {
            base_vpn: base.vpn(),
            npages,
            perm,
            file_offset: 0,
            filesize: 0,
            memsize: 0,
        };
        let (index, slot) = self
            .regions
            .iter_mut()
            .enumerate()
            .find(|(_, r)| r.is_none())
            .ok_or(VmError::InvalidRegionCount)?;
        *slot = Some(region);
        Ok(index)
    }

    /// Directly installs region `index`, used by `as_copy` (fork) to clone a
    /// parent's regions into a freshly-created child address space.
    pub(crate) fn set_region(&mut self, index: usize, region: LoadRegion) {
        self.regions[index] = Some(region);
    }

    /// Directly installs the heap and stack bounds, used by `as_copy`.
    pub(crate) fn set_heap_stack(&mut self, heap_vstart: u32, heap_vtop: u32, stack_vbase: u32) {
        self.heap_vstart = heap_vstart;
        self.heap_vtop = heap_vtop;
        self.stack_vbase = stack_vbase;
    }

    /// Whether the region backing `vpn` (if any) is executable. Anonymous
    /// pages (heap, stack) are never executable.
    pub(crate) fn region_is_executable(&self, vpn: Vpn) -> bool {
        self.regions
            .iter()
            .flatten()
            .any(|r| r.contains(vpn) && r.perm.contains(MappingFlags::X))
    }

    /// Whether directory slot `dir_index` has ever been touched (`spec.md`
    /// §4.3's `LOADED` bit on the directory entry, not the page-table cache's
    /// own residency).
    pub(crate) fn dir_loaded(&self, dir_index: usize) -> bool {
        self.directory.entry(dir_index).loaded
    }

    /// Resolves the resident page table backing `vpn`, allocating or
    /// evicting a page-table cache slot as needed. Thin wrapper around
    /// [`PtblCache::get`] that supplies this address space's own directory
    /// and id -- kept here so callers outside this module never need to
    /// borrow `directory` and `ptbl_cache` separately.
    pub(crate) fn get_ptbl<D: BlockDevice>(
        &mut self,
        swap: &mut SwapTable<D>,
        vpn: Vpn,
        is_executable: bool,
    ) -> VmResult<SlotHandle> {
        self.ptbl_cache
            .get(&mut self.directory, swap, self.as_id, vpn, is_executable)
    }

    /// Records the file offset/filesize/memsize the loader read for region
    /// `index` (0 = code, 1 = data). Called once per region right after
    /// `define_region`.
    pub fn set_region_file_info(&mut self, index: usize, file_offset: u32, filesize: u32, memsize: u32) {
        if let Some(region) = self.regions[index].as_mut() {
            region.file_offset = file_offset;
            region.filesize = filesize;
            region.memsize = memsize;
        }
    }

    /// `as_prepare_load`. A no-op placeholder mirroring the original, kept
    /// as a named step so loader code has a place to hook into in the
    /// future without changing the external interface.
    pub fn prepare_load(&mut self) -> VmResult<()> {
        Ok(())
    }

    /// `as_complete_load`: sets `heap_vstart = heap_vtop = max(region_tops)`.
    pub fn complete_load(&mut self) -> VmResult<()> {
        let max_top = self
            .regions
            .iter()
            .flatten()
            .map(LoadRegion::top_addr)
            .max()
            .unwrap_or(0);
        self.heap_vstart = max_top;
        self.heap_vtop = max_top;
        Ok(())
    }

    /// `as_define_stack`: sets the initial one-page stack and returns
    /// `USERSTACK`. Fails if the stack's initial base would already collide
    /// with the heap top.
    pub fn define_stack(&mut self) -> VmResult<u32> {
        let initial_base = USERSTACK - PAGE_SIZE as u32;
        if initial_base < self.heap_vtop {
            return Err(VmError::StackHeapCollision);
        }
        self.stack_vbase = initial_base;
        Ok(USERSTACK)
    }

    /// `sbrk`: adjusts `heap_vtop` by `amount`, returning the previous top.
    pub fn sbrk(&mut self, amount: i32) -> Result<u32, VmError> {
        if amount == 0 {
            return Ok(self.heap_vtop);
        }
        let old_top = self.heap_vtop;
        let new_top = old_top as i64 + amount as i64;
        if new_top < self.heap_vstart as i64 {
            return Err(VmError::Einval);
        }
        if new_top > self.stack_vbase as i64 {
            return Err(VmError::StackHeapCollision);
        }
        if (new_top - self.heap_vstart as i64) as usize > USER_HEAP_MAX {
            return Err(VmError::Enomem);
        }
        self.heap_vtop = new_top as u32;
        Ok(old_top)
    }

    /// Classifies a faulting address per `spec.md` §4.4 step 1.
    pub fn classify(&self, addr: u32) -> Classify {
        let vpn = VirtAddr::new(addr).vpn();
        for (index, region) in self.regions.iter().enumerate() {
            if let Some(region) = region {
                if region.contains(vpn) {
                    return Classify::Region {
                        index,
                        perm: region.perm,
                    };
                }
            }
        }
        if addr >= self.stack_vbase && addr < USERSTACK {
            return Classify::Stack;
        }
        let min_stack_base = USERSTACK - (config::mm::DUMBVM_STACKPAGES as u32) * PAGE_SIZE as u32;
        if addr < self.stack_vbase
            && addr >= self.stack_vbase.saturating_sub(PAGE_SIZE as u32)
            && addr >= self.heap_vtop
            && self.stack_vbase > min_stack_base
        {
            return Classify::GrowStack;
        }
        if addr >= self.heap_vstart && addr < self.heap_vtop {
            return Classify::Heap;
        }
        Classify::Invalid
    }

    /// Releases every swap slot and ptbl-cache slot owned by this address
    /// space, in preparation for `as_destroy` (which also needs to walk the
    /// frame table -- that part lives in `VmSystem::as_destroy`).
    pub(crate) fn reset_caches(&mut self) {
        self.directory = PageDirectory::zeroed();
        self.ptbl_cache.clear();
    }
}
