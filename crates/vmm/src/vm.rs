//! The VM context: one object owning the page tables, the VMA registry and
//! the allocators, with the syscall and page fault entry points on top.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{RwLock, RwLockWriteGuard};

use crate::address::{AddrRange, align_down, align_up};
use crate::boot::usable_extents;
use crate::file::{FileBackend, FileMode, ShmFile};
use crate::memory::PhysicalMemory;
use crate::ops::{DirtyCleaner, DirtyPageSync, LinearPageMapper, Populate, Protection, Unpopulate, VirtToPhysMap};
use crate::page_range::MAX_ORDER;
use crate::pool::Pools;
use crate::provider::Backing;
use crate::range_index::{LinearMapping, MemAttr, RangeEntry, RangeIndex};
use crate::reclaimer::{Shrinker, ShrinkerId};
use crate::sched::Scheduler;
use crate::stats::{HumanSize, MemoryStats, OrderStats};
use crate::vma::{MmapFlags, MsyncFlags, Perm, Vma, VmaList};
use crate::walker::{map_range, operate_range};
use crate::{BootMemoryRegion, Fault, PhysicalAddress, VirtualAddress, VmConfig, VmError, arch};

/// What a new mapping is backed by.
#[derive(Clone)]
pub enum MapSource {
    Anonymous,
    File(Arc<dyn FileBackend>),
    Shm(Arc<ShmFile>),
}

/// The access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

impl Access {
    fn perm(self) -> Perm {
        match self {
            Access::Read => Perm::READ,
            Access::Write => Perm::WRITE,
            Access::Exec => Perm::EXEC,
        }
    }
}

pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) memory: PhysicalMemory,
    pub(crate) pools: Pools,
    root: PhysicalAddress,
    vmas: RwLock<VmaList>,
    linear: RwLock<Vec<LinearMapping>>,
    index: RangeIndex,
}

fn check_file_perm(file: &dyn FileBackend, perm: Perm, flags: MmapFlags) -> Result<(), VmError> {
    let mode = file.mode();
    if !mode.contains(FileMode::READ) {
        return Err(VmError::AccessDenied);
    }
    if flags.contains(MmapFlags::SHARED) && perm.contains(Perm::WRITE) && !mode.contains(FileMode::WRITE) {
        return Err(VmError::AccessDenied);
    }
    if perm.contains(Perm::EXEC) && mode.contains(FileMode::NOEXEC) {
        return Err(VmError::NotPermitted);
    }
    Ok(())
}

/// `[addr, addr + len)` rounded out to pages, if it fits the address space.
fn page_span(addr: usize, len: usize) -> Result<AddrRange, VmError> {
    let end = addr
        .checked_add(len)
        .filter(|end| *end <= arch::UPPER_VMA_LIMIT)
        .ok_or(VmError::InvalidArgument)?;
    Ok(AddrRange::new(addr, align_up(end, arch::PAGE_SIZE)))
}

impl Vm {
    /// Builds the VM over the usable memory of `boot_map` and allocates the root
    /// page table.
    pub fn new<R: BootMemoryRegion>(config: VmConfig, sched: Arc<dyn Scheduler>, boot_map: &[R]) -> Result<Self, VmError> {
        let memory = PhysicalMemory::new(&config, sched.clone());
        memory.add_boot_memory(&usable_extents(boot_map));
        let root = memory.alloc_zeroed_page().ok_or(VmError::OutOfMemory)?;
        let pools = Pools::new(sched.cpu_count(), config.gc_signal_threshold);
        log::debug!("page table root at {}", root);

        Ok(Self {
            config,
            memory,
            pools,
            root,
            vmas: RwLock::new(VmaList::new()),
            linear: RwLock::new(Vec::new()),
            index: RangeIndex::new(),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Loads this VM's page table on the current CPU.
    ///
    /// # Safety
    ///
    /// Everything the CPU is executing from must be mapped in it.
    pub unsafe fn activate(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { arch::activate(self.root) };
    }

    /// Takes the registry for write.
    ///
    /// A fault on our own stack while holding it would wait for the read lock
    /// forever, so the stack is made resident first.
    fn write_vmas(&self) -> RwLockWriteGuard<'_, VmaList> {
        self.memory.sched.ensure_stack_pages(self.config.stack_prefault_pages);
        self.vmas.write()
    }

    /// Maps `len` bytes and returns the start of the mapping.
    ///
    /// Without `FIXED` or `FIXED_NOREPLACE`, `addr` is only a hint.
    pub fn mmap(
        &self,
        addr: usize,
        len: usize,
        perm: Perm,
        flags: MmapFlags,
        source: MapSource,
        offset: usize,
    ) -> Result<VirtualAddress, VmError> {
        if len == 0 || offset % arch::PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if flags.contains(MmapFlags::SHARED) == flags.contains(MmapFlags::PRIVATE) {
            return Err(VmError::InvalidArgument);
        }
        if len > arch::UPPER_VMA_LIMIT {
            return Err(VmError::OutOfMemory);
        }
        let size = align_up(len, arch::PAGE_SIZE);
        let fixed = flags.intersects(MmapFlags::FIXED | MmapFlags::FIXED_NOREPLACE);
        if fixed && addr % arch::PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }

        let mut flags = flags;
        let backing = match source {
            MapSource::Anonymous => {
                flags |= MmapFlags::ANONYMOUS;
                Backing::Anonymous {
                    zero: !flags.contains(MmapFlags::UNINITIALIZED),
                }
            }
            MapSource::File(file) => {
                check_file_perm(&*file, perm, flags)?;
                flags |= MmapFlags::FILE;
                Backing::File { file, offset }
            }
            MapSource::Shm(shm) => {
                flags |= MmapFlags::FILE;
                Backing::Shm { shm, offset }
            }
        };

        let mut vmas = self.write_vmas();
        let start = if fixed {
            if addr < arch::PAGE_SIZE {
                return Err(VmError::NotPermitted);
            }
            let range = page_span(addr, size)?;
            if vmas.intersecting(range).next().is_some() {
                if flags.contains(MmapFlags::FIXED_NOREPLACE) {
                    return Err(VmError::AlreadyExists);
                }
                self.evacuate(&mut vmas, range)?;
            }
            addr
        } else {
            vmas.find_hole(align_down(addr, arch::PAGE_SIZE), size)?
        };

        let range = AddrRange::new(start, start + size);
        vmas.insert(Vma::new(range, perm, flags, backing));
        self.index.resync(&vmas, range);
        log::trace!("mmap {} {} {:?}", range, perm, flags);

        if flags.contains(MmapFlags::POPULATE) {
            if let Some(vma) = vmas.find(start) {
                let end = vma
                    .backing
                    .available()
                    .map_or(range.end(), |available| range.end().min(start + available));
                if end > start {
                    let populated = AddrRange::new(start, end);
                    if let Err(err) = self.populate(vma, populated, false) {
                        if let Err(cleanup) = self.evacuate(&mut vmas, range) {
                            log::error!("cannot undo mapping {}: {}", range, cleanup);
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(VirtualAddress::new(start))
    }

    /// Unmaps `[addr, addr + len)`, which must be mapped in full.
    ///
    /// Dirty pages of shared file mappings are written back first.
    pub fn munmap(&self, addr: usize, len: usize) -> Result<(), VmError> {
        if addr % arch::PAGE_SIZE != 0 || len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let range = page_span(addr, len)?;
        let mut vmas = self.write_vmas();
        if !vmas.ismapped(range) {
            return Err(VmError::InvalidArgument);
        }
        for vma in vmas.intersecting(range) {
            if vma.is_shared() && vma.backing.file().is_some() {
                self.write_back(vma, vma.range.intersection(&range))?;
            }
        }
        self.evacuate(&mut vmas, range)?;
        log::trace!("munmap {}", range);
        Ok(())
    }

    /// Changes the permissions of `[addr, addr + len)`, which must be mapped in full.
    pub fn mprotect(&self, addr: usize, len: usize, perm: Perm) -> Result<(), VmError> {
        if addr % arch::PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if len == 0 {
            return Ok(());
        }
        let range = page_span(addr, len)?;
        let mut vmas = self.write_vmas();
        if !vmas.ismapped(range) {
            return Err(VmError::OutOfMemory);
        }
        for vma in vmas.intersecting(range) {
            if let Some(file) = vma.backing.file() {
                check_file_perm(&**file, perm, vma.flags)?;
            }
        }

        vmas.split(range.start());
        vmas.split(range.end());
        for vma in vmas.inside_mut(range) {
            vma.perm = perm;
        }
        self.index.resync(&vmas, range);
        operate_range(self.root, &self.memory, Protection::new(perm), range.start(), range.start(), range.size())?;
        log::trace!("mprotect {} {}", range, perm);
        Ok(())
    }

    /// Writes dirty pages of shared file mappings in the range back to their
    /// files. Private and anonymous mappings have nothing to write.
    pub fn msync(&self, addr: usize, len: usize, flags: MsyncFlags) -> Result<(), VmError> {
        if addr % arch::PAGE_SIZE != 0 || flags.contains(MsyncFlags::ASYNC | MsyncFlags::SYNC) {
            return Err(VmError::InvalidArgument);
        }
        let range = page_span(addr, len)?;
        let vmas = self.vmas.read();
        if !vmas.ismapped(range) {
            return Err(VmError::OutOfMemory);
        }
        for vma in vmas.intersecting(range) {
            if vma.is_shared() && vma.backing.file().is_some() {
                self.write_back(vma, vma.range.intersection(&range))?;
            }
        }
        Ok(())
    }

    /// One entry per page of the range: whether it is backed by memory now.
    pub fn mincore(&self, addr: usize, len: usize) -> Result<Vec<bool>, VmError> {
        if addr % arch::PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        let range = page_span(addr, len)?;
        let vmas = self.vmas.read();
        if !vmas.ismapped(range) {
            return Err(VmError::OutOfMemory);
        }
        Ok((range.start()..range.end())
            .step_by(arch::PAGE_SIZE)
            .map(|page| self.lookup(page).is_some_and(|(entry, _)| !entry.is_empty()))
            .collect())
    }

    /// Resolves a fault at `addr`.
    ///
    /// A whole large page is populated when its aligned span lies inside the
    /// mapping (and inside the file, for file mappings).
    pub fn fault(&self, addr: usize, access: Access) -> Result<(), Fault> {
        let vmas = self.vmas.read();
        let vma = vmas.find(addr).ok_or(Fault::Segv)?;
        if !vma.perm.contains(access.perm()) {
            log::trace!("{:?} fault at {:#x} denied by {}", access, addr, vma.perm);
            return Err(Fault::Segv);
        }

        let page = align_down(addr, arch::PAGE_SIZE);
        let available = vma.backing.available();
        if available.is_some_and(|available| page - vma.range.start() >= available) {
            return Err(Fault::Bus);
        }

        let huge = align_down(addr, arch::HUGE_PAGE_SIZE);
        let huge_range = AddrRange::new(huge, huge + arch::HUGE_PAGE_SIZE);
        let large = !vma.flags.contains(MmapFlags::SMALL)
            && vma.range.contains_range(&huge_range)
            && available.is_none_or(|available| huge_range.end() - vma.range.start() <= available);
        let range = if large {
            huge_range
        } else {
            AddrRange::new(page, page + arch::PAGE_SIZE)
        };

        self.populate(vma, range, access == Access::Write).map_err(|err| {
            log::debug!("fault at {:#x} cannot be backed: {}", addr, err);
            Fault::Bus
        })?;
        Ok(())
    }

    /// Maps `[virt, virt + size)` to `[phys, phys + size)` for good.
    ///
    /// Large pages are used where alignment allows, if `slop` is at least a
    /// large page.
    pub fn linear_map(
        &self,
        virt: usize,
        phys: PhysicalAddress,
        size: usize,
        name: &str,
        slop: usize,
        attr: MemAttr,
    ) -> Result<(), VmError> {
        if virt % arch::PAGE_SIZE != 0 || !phys.is_aligned(arch::PAGE_SIZE) || size == 0 || size % arch::PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !slop.is_power_of_two() {
            return Err(VmError::InvalidArgument);
        }
        let end = virt.checked_add(size).ok_or(VmError::InvalidArgument)?;

        let range = AddrRange::new(virt, end);
        let vmas = self.write_vmas();
        let overlaps_linear = self
            .linear
            .read()
            .iter()
            .any(|other| range.intersects(&AddrRange::new(other.virt, other.virt + other.size)));
        if overlaps_linear || vmas.intersecting(range).next().is_some() {
            return Err(VmError::AlreadyExists);
        }
        let mut op = LinearPageMapper::new(phys, slop >= arch::HUGE_PAGE_SIZE);
        map_range(self.root, &self.memory, virt, virt, size, &mut op, arch::PAGE_SIZE)?;
        arch::flush_tlb_all();

        let mapping = LinearMapping {
            virt,
            phys,
            size,
            name: String::from(name),
            attr,
        };
        self.index.insert_linear(&mapping);
        let mut linear = self.linear.write();
        let at = linear.partition_point(|other| other.virt < virt);
        linear.insert(at, mapping);
        drop(vmas);

        log::debug!("linear map {:#x} -> {} ({}) {}", virt, phys, HumanSize(size), name);
        Ok(())
    }

    pub fn virt_to_phys(&self, addr: usize) -> Option<PhysicalAddress> {
        let _vmas = self.vmas.read();
        let (entry, level) = self.lookup(addr)?;
        if !entry.is_present() {
            return None;
        }
        Some(entry.address() + (addr & arch::level_offset_mask(level)))
    }

    /// Who owns `addr`, without taking the registry lock.
    pub fn find_range(&self, addr: usize) -> Option<RangeEntry> {
        self.index.find(addr)
    }

    /// The mappings in the format of Linux's `/proc/<pid>/maps`.
    pub fn procfs_maps(&self) -> String {
        let vmas = self.vmas.read();
        let mut out = String::new();
        for vma in vmas.iter() {
            let kind = if vma.is_shared() { 's' } else { 'p' };
            out.push_str(&alloc::format!("{:x}-{:x} {}{} ", vma.range.start(), vma.range.end(), vma.perm, kind));
            match vma.backing.identity() {
                Some(id) => out.push_str(&alloc::format!(
                    "{:08x} {:02x}:{:02x} {} {}\n",
                    vma.backing.offset(),
                    id.major(),
                    id.minor(),
                    id.inode,
                    id.path
                )),
                None => out.push_str("00000000 00:00 0\n"),
            }
        }
        out
    }

    /// The linear mappings, one per line.
    pub fn linear_maps(&self) -> String {
        let linear = self.linear.read();
        let mut out = String::new();
        for mapping in linear.iter() {
            out.push_str(&alloc::format!("{mapping}\n"));
        }
        out
    }

    pub fn create_shm(&self, name: &str, size: usize) -> Arc<ShmFile> {
        Arc::new(ShmFile::new(name, size))
    }

    /// Gives back the pages of a shared-memory file that nothing maps any more.
    pub fn close_shm(&self, shm: &Arc<ShmFile>) -> Result<(), VmError> {
        let vmas = self.vmas.read();
        let mapped = vmas
            .iter()
            .any(|vma| matches!(&vma.backing, Backing::Shm { shm: other, .. } if Arc::ptr_eq(other, shm)));
        if mapped {
            return Err(VmError::InvalidArgument);
        }
        shm.close(&self.memory);
        Ok(())
    }

    pub fn register_shrinker(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId {
        self.memory.reclaimer.register(shrinker)
    }

    pub fn activate_shrinker(&self, id: ShrinkerId) {
        self.memory.reclaimer.activate(id);
    }

    pub fn deactivate_shrinker(&self, id: ShrinkerId) {
        self.memory.reclaimer.deactivate(id);
    }

    /// One reclaimer pass; see [`PhysicalMemory::reclaim`].
    pub fn reclaim(&self) -> usize {
        self.memory.reclaim()
    }

    pub fn reclaimer_main(&self) -> ! {
        self.memory.reclaimer_main()
    }

    /// Body of the garbage collector worker of the current CPU.
    pub fn collect_garbage(&self) {
        self.pools.collect_garbage(&self.memory);
    }

    pub fn stats(&self) -> &MemoryStats {
        self.memory.stats()
    }

    pub fn order_stats(&self) -> [OrderStats; MAX_ORDER + 1] {
        self.memory.order_stats()
    }

    fn lookup(&self, addr: usize) -> Option<(arch::PageEntry, usize)> {
        let mut op = VirtToPhysMap::new();
        map_range(
            self.root,
            &self.memory,
            0,
            align_down(addr, arch::PAGE_SIZE),
            arch::PAGE_SIZE,
            &mut op,
            arch::PAGE_SIZE,
        )
        .ok()?;
        op.found()
    }

    fn populate(&self, vma: &Vma, range: AddrRange, write: bool) -> Result<usize, VmError> {
        let large = !vma.flags.contains(MmapFlags::SMALL);
        let op = Populate::new(&self.memory, &vma.backing, vma.perm, write, large);
        operate_range(self.root, &self.memory, op, vma.range.start(), range.start(), range.size())
    }

    fn write_back(&self, vma: &Vma, range: AddrRange) -> Result<usize, VmError> {
        let op = DirtyCleaner::new(DirtyPageSync::new(&vma.backing));
        operate_range(self.root, &self.memory, op, vma.range.start(), range.start(), range.size())
    }

    /// Removes every mapping in `range` and frees what backed it.
    ///
    /// Pages are unmapped before the registry changes. Splitting a large page
    /// needs a table page; if none can be had, the mappings stay registered and
    /// keep whatever is still mapped, so nothing is left without an owner.
    fn evacuate(&self, vmas: &mut VmaList, range: AddrRange) -> Result<(), VmError> {
        for vma in vmas.intersecting(range) {
            let part = vma.range.intersection(&range);
            let op = Unpopulate::new(&self.memory, &vma.backing);
            operate_range(self.root, &self.memory, op, vma.range.start(), part.start(), part.size())
                .inspect_err(|err| log::debug!("cannot unmap {}: {}", part, err))?;
        }
        vmas.remove_range(range);
        self.index.resync(vmas, range);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileMode;
    use crate::range_index::RangeOwner;
    use crate::testing::{FakeFile, TestScheduler, setup_vm};
    use crate::AddressTranslator;
    use std::thread;

    const P: usize = arch::PAGE_SIZE;
    const HUGE: usize = arch::HUGE_PAGE_SIZE;
    const RW: Perm = Perm::READ.union(Perm::WRITE);

    fn setup() -> (Arc<TestScheduler>, Vm) {
        setup_vm(1)
    }

    fn anon(vm: &Vm, len: usize, perm: Perm) -> usize {
        vm.mmap(0, len, perm, MmapFlags::PRIVATE, MapSource::Anonymous, 0)
            .unwrap()
            .as_usize()
    }

    fn fixed(vm: &Vm, addr: usize, len: usize, perm: Perm, flags: MmapFlags) -> Result<VirtualAddress, VmError> {
        vm.mmap(addr, len, perm, MmapFlags::PRIVATE | flags, MapSource::Anonymous, 0)
    }

    fn read_byte(vm: &Vm, addr: usize) -> u8 {
        let phys = vm.virt_to_phys(addr).unwrap();
        // SAFETY: mapped memory of this VM.
        unsafe { *phys.to_ptr::<u8>() }
    }

    fn write_byte(vm: &Vm, addr: usize, value: u8) {
        vm.fault(addr, Access::Write).unwrap();
        let phys = vm.virt_to_phys(addr).unwrap();
        // SAFETY: as above.
        unsafe { *phys.to_ptr::<u8>() = value };
    }

    fn vma_ranges(vm: &Vm) -> Vec<AddrRange> {
        vm.vmas.read().iter().map(|vma| vma.range).collect()
    }

    #[test]
    fn demand_paging_populates_only_the_touched_page() {
        let (_, vm) = setup();
        let addr = anon(&vm, 3 * P, RW);
        vm.fault(addr, Access::Read).unwrap();
        assert_eq!(vm.mincore(addr, 3 * P).unwrap(), [true, false, false]);

        vm.munmap(addr, 3 * P).unwrap();
        assert_eq!(vm.mincore(addr, P), Err(VmError::OutOfMemory));
        assert_eq!(vm.mincore(addr + P, 2 * P), Err(VmError::OutOfMemory));
    }

    #[test]
    fn untouched_mapping_costs_nothing() {
        let (_, vm) = setup();
        let free = vm.stats().free();
        let addr = anon(&vm, 8 * P, RW);
        vm.munmap(addr, 8 * P).unwrap();
        assert_eq!(vm.stats().free(), free);
    }

    #[test]
    fn anonymous_memory_starts_zeroed() {
        let (_, vm) = setup();
        let addr = anon(&vm, 2 * P, RW);
        write_byte(&vm, addr + P + 7, 42);
        assert_eq!(read_byte(&vm, addr + P + 7), 42);
        assert_eq!(read_byte(&vm, addr + P + 8), 0);
    }

    #[test]
    fn registry_stays_ordered_through_edits() {
        let (_, vm) = setup();
        let base = 0x2_0000;
        fixed(&vm, base, 8 * P, RW, MmapFlags::FIXED).unwrap();
        vm.mprotect(base + 2 * P, 2 * P, Perm::READ).unwrap();
        vm.munmap(base + 5 * P, P).unwrap();
        fixed(&vm, base + 7 * P, 3 * P, Perm::READ, MmapFlags::FIXED).unwrap();
        anon(&vm, 4 * P, RW);

        let ranges = vma_ranges(&vm);
        assert!(ranges.windows(2).all(|pair| pair[0].end() <= pair[1].start()));
        assert!(ranges.iter().all(|range| !range.is_empty()));
        assert_eq!(ranges.len(), 6);
    }

    #[test]
    fn page_zero_is_never_mapped() {
        let (_, vm) = setup();
        assert_eq!(fixed(&vm, 0, P, RW, MmapFlags::FIXED), Err(VmError::NotPermitted));
    }

    #[test]
    fn mmap_rejects_bad_arguments() {
        let (_, vm) = setup();
        assert_eq!(fixed(&vm, 0x2_0000, 0, RW, MmapFlags::FIXED), Err(VmError::InvalidArgument));
        assert_eq!(fixed(&vm, 0x2_0010, P, RW, MmapFlags::FIXED), Err(VmError::InvalidArgument));
        let both = MmapFlags::SHARED | MmapFlags::PRIVATE;
        assert_eq!(vm.mmap(0, P, RW, both, MapSource::Anonymous, 0), Err(VmError::InvalidArgument));
        assert_eq!(
            vm.mmap(0, P, RW, MmapFlags::PRIVATE, MapSource::Anonymous, 3),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn fixed_replaces_and_noreplace_refuses() {
        let (_, vm) = setup();
        let base = 0x2_0000;
        fixed(&vm, base, 2 * P, RW, MmapFlags::FIXED).unwrap();
        write_byte(&vm, base, 9);

        assert_eq!(
            fixed(&vm, base + P, P, RW, MmapFlags::FIXED_NOREPLACE),
            Err(VmError::AlreadyExists)
        );
        fixed(&vm, base, P, Perm::READ, MmapFlags::FIXED).unwrap();
        assert_eq!(vm.mincore(base, 2 * P).unwrap(), [false, false]);
        assert_eq!(vma_ranges(&vm).len(), 2);
    }

    #[test]
    fn munmap_needs_a_fully_mapped_range() {
        let (_, vm) = setup();
        let base = 0x2_0000;
        fixed(&vm, base, 2 * P, RW, MmapFlags::FIXED).unwrap();
        assert_eq!(vm.munmap(base, 3 * P), Err(VmError::InvalidArgument));
        assert_eq!(vm.munmap(base + 1, P), Err(VmError::InvalidArgument));
        assert_eq!(vm.munmap(base, 0), Err(VmError::InvalidArgument));
        vm.munmap(base + P, P).unwrap();
        assert_eq!(vma_ranges(&vm), [AddrRange::new(base, base + P)]);
    }

    #[test]
    fn mprotect_needs_a_fully_mapped_range() {
        let (_, vm) = setup();
        let base = 0x2_0000;
        fixed(&vm, base, 2 * P, RW, MmapFlags::FIXED).unwrap();
        assert_eq!(vm.mprotect(base, 3 * P, Perm::READ), Err(VmError::OutOfMemory));
        assert_eq!(vm.mprotect(base + 8, P, Perm::READ), Err(VmError::InvalidArgument));
    }

    #[test]
    fn adjacent_mappings_stay_distinct_after_mprotect() {
        let (_, vm) = setup();
        let base = 0x2_0000;
        fixed(&vm, base, P, RW, MmapFlags::FIXED).unwrap();
        fixed(&vm, base + P, P, Perm::READ, MmapFlags::FIXED).unwrap();
        vm.mprotect(base + P, P, RW).unwrap();

        assert_eq!(vma_ranges(&vm).len(), 2);
        vm.fault(base, Access::Write).unwrap();
        vm.fault(base + P, Access::Write).unwrap();
        let first = vm.lookup(base).unwrap().0.flags();
        let second = vm.lookup(base + P).unwrap().0.flags();
        assert_eq!(
            (first.is_present(), first.is_writable(), first.is_executable()),
            (second.is_present(), second.is_writable(), second.is_executable())
        );
    }

    #[test]
    fn protecting_and_restoring_a_large_page_keeps_its_bits() {
        let (_, vm) = setup();
        let base = 0x2_0000;
        fixed(&vm, base, HUGE, RW, MmapFlags::FIXED | MmapFlags::POPULATE).unwrap();
        let bits = |addr| {
            let (entry, _) = vm.lookup(addr).unwrap();
            let flags = entry.flags();
            (vm.virt_to_phys(addr), entry.is_present(), flags.is_writable(), flags.is_executable())
        };
        let before: Vec<_> = (0..HUGE / P).map(|page| bits(base + page * P)).collect();
        assert!(vm.lookup(base).unwrap().0.is_large());

        vm.mprotect(base + 3 * P, P, Perm::READ).unwrap();
        assert!(!bits(base + 3 * P).2);
        vm.mprotect(base + 3 * P, P, RW).unwrap();

        let after: Vec<_> = (0..HUGE / P).map(|page| bits(base + page * P)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn faults_check_permissions() {
        let (_, vm) = setup();
        let addr = anon(&vm, P, Perm::READ);
        assert_eq!(vm.fault(addr, Access::Write), Err(Fault::Segv));
        assert_eq!(vm.fault(addr, Access::Exec), Err(Fault::Segv));
        assert_eq!(vm.fault(addr + P, Access::Read), Err(Fault::Segv));
        vm.fault(addr, Access::Read).unwrap();

        vm.mprotect(addr, P, Perm::empty()).unwrap();
        assert_eq!(vm.fault(addr, Access::Read), Err(Fault::Segv));
        assert_eq!(vm.virt_to_phys(addr), None);
        assert_eq!(vm.mincore(addr, P).unwrap(), [true]);
    }

    #[test]
    fn aligned_faults_get_a_large_page() {
        let (_, vm) = setup();
        let base = 0x3_0000;
        fixed(&vm, base, 2 * HUGE, RW, MmapFlags::FIXED).unwrap();
        vm.fault(base + HUGE + 5 * P, Access::Read).unwrap();
        let resident = vm.mincore(base, 2 * HUGE).unwrap();
        assert_eq!(resident.iter().filter(|&&page| page).count(), HUGE / P);
        assert!(resident[HUGE / P..].iter().all(|&page| page));

        // Small mappings never get one.
        fixed(&vm, base, HUGE, RW, MmapFlags::FIXED | MmapFlags::SMALL).unwrap();
        vm.fault(base, Access::Read).unwrap();
        assert_eq!(vm.mincore(base, 2 * P).unwrap(), [true, false]);
    }

    #[test]
    fn unmapping_part_of_a_large_page_without_memory_keeps_the_mapping() {
        let (sched, vm) = setup();
        let base = 0x3_0000;
        fixed(&vm, base, HUGE, RW, MmapFlags::FIXED).unwrap();
        vm.fault(base, Access::Write).unwrap();
        let phys = vm.virt_to_phys(base + P).unwrap();
        assert_eq!(vm.virt_to_phys(base), Some(phys - P));

        sched.set_emergency(true);
        let mut hoard = Vec::new();
        while let Some(page) = vm.memory().alloc_page() {
            hoard.push(page);
        }
        assert_eq!(vm.munmap(base + P, P), Err(VmError::OutOfMemory));
        assert_eq!(vm.find_range(base + P).map(|entry| entry.range), Some(AddrRange::new(base, base + HUGE)));
        assert_eq!(vma_ranges(&vm).iter().filter(|range| range.start() == base).count(), 1);
        assert_eq!(vm.virt_to_phys(base + P), Some(phys));

        for page in hoard {
            vm.memory().free_page(page);
        }
        sched.set_emergency(false);
        vm.munmap(base + P, P).unwrap();
        assert!(vm.virt_to_phys(base + P).is_none());
        assert_eq!(vm.virt_to_phys(base), Some(phys - P));
        assert!(vm.find_range(base + P).is_none());
    }

    #[test]
    fn file_mappings_read_the_file() {
        let (_, vm) = setup();
        let file = FakeFile::patterned(3 * P);
        let addr = vm
            .mmap(0, 2 * P, Perm::READ, MmapFlags::PRIVATE, MapSource::File(file.clone()), P)
            .unwrap()
            .as_usize();

        vm.fault(addr + P + 3, Access::Read).unwrap();
        assert_eq!(read_byte(&vm, addr + P + 3), file.contents()[2 * P + 3]);
    }

    #[test]
    fn faults_past_end_of_file_are_bus_errors() {
        let (_, vm) = setup();
        let file = FakeFile::patterned(P + 10);
        let addr = vm
            .mmap(0, 4 * P, Perm::READ, MmapFlags::PRIVATE, MapSource::File(file), 0)
            .unwrap()
            .as_usize();
        vm.fault(addr + P + 100, Access::Read).unwrap();
        assert_eq!(vm.fault(addr + 2 * P, Access::Read), Err(Fault::Bus));
    }

    #[test]
    fn file_permissions_are_checked() {
        let (_, vm) = setup();
        let read_only = FakeFile::new(alloc::vec![0; P], FileMode::READ);
        let no_read = FakeFile::new(alloc::vec![0; P], FileMode::WRITE);
        let noexec = FakeFile::new(alloc::vec![0; P], FileMode::READ | FileMode::NOEXEC);

        let map = |file: Arc<FakeFile>, perm, flags| vm.mmap(0, P, perm, flags, MapSource::File(file), 0);
        assert_eq!(map(no_read, Perm::READ, MmapFlags::PRIVATE), Err(VmError::AccessDenied));
        assert_eq!(map(read_only.clone(), RW, MmapFlags::SHARED), Err(VmError::AccessDenied));
        assert!(map(read_only.clone(), RW, MmapFlags::PRIVATE).is_ok());
        assert_eq!(
            map(noexec.clone(), Perm::READ | Perm::EXEC, MmapFlags::PRIVATE),
            Err(VmError::NotPermitted)
        );

        let addr = map(noexec, Perm::READ, MmapFlags::PRIVATE).unwrap().as_usize();
        assert_eq!(vm.mprotect(addr, P, Perm::READ | Perm::EXEC), Err(VmError::NotPermitted));
        let addr = map(read_only, Perm::READ, MmapFlags::SHARED).unwrap().as_usize();
        assert_eq!(vm.mprotect(addr, P, RW), Err(VmError::AccessDenied));
    }

    #[test]
    fn msync_writes_shared_mappings_only() {
        let (_, vm) = setup();
        let shared = FakeFile::patterned(2 * P);
        let private = FakeFile::patterned(2 * P);
        let map = |file: Arc<FakeFile>, flags| {
            vm.mmap(0, 2 * P, RW, flags | MmapFlags::SMALL, MapSource::File(file), 0)
                .unwrap()
                .as_usize()
        };
        let a = map(shared.clone(), MmapFlags::SHARED);
        let b = map(private.clone(), MmapFlags::PRIVATE);
        write_byte(&vm, a + P, 0xee);
        write_byte(&vm, b + P, 0xee);

        vm.msync(a, 2 * P, MsyncFlags::SYNC).unwrap();
        vm.msync(b, 2 * P, MsyncFlags::SYNC).unwrap();
        assert_eq!(shared.contents()[P], 0xee);
        assert_eq!(shared.fsyncs(), 1);
        assert_eq!(private.contents()[P], (P % 251) as u8);
        assert_eq!(private.writes(), 0);

        assert_eq!(vm.msync(a, P, MsyncFlags::SYNC | MsyncFlags::ASYNC), Err(VmError::InvalidArgument));
    }

    #[test]
    fn munmap_writes_back_shared_pages() {
        let (_, vm) = setup();
        let file = FakeFile::patterned(P);
        let addr = vm
            .mmap(0, P, RW, MmapFlags::SHARED, MapSource::File(file.clone()), 0)
            .unwrap()
            .as_usize();
        write_byte(&vm, addr, 0x11);
        vm.munmap(addr, P).unwrap();
        assert_eq!(file.contents()[0], 0x11);
    }

    #[test]
    fn populate_stops_at_end_of_file() {
        let (_, vm) = setup();
        let file = FakeFile::patterned(2 * P);
        let flags = MmapFlags::PRIVATE | MmapFlags::POPULATE;
        let addr = vm
            .mmap(0, 4 * P, Perm::READ, flags, MapSource::File(file), 0)
            .unwrap()
            .as_usize();
        assert_eq!(vm.mincore(addr, 4 * P).unwrap(), [true, true, false, false]);
    }

    #[test]
    fn shm_pages_outlive_their_mappings() {
        let (_, vm) = setup();
        let shm = vm.create_shm("ring", HUGE);
        let map = || {
            vm.mmap(0, HUGE, RW, MmapFlags::SHARED, MapSource::Shm(shm.clone()), 0)
                .unwrap()
                .as_usize()
        };
        let first = map();
        write_byte(&vm, first + 3 * P, 0x77);
        let second = map();
        vm.fault(second + 3 * P, Access::Read).unwrap();
        assert_eq!(read_byte(&vm, second + 3 * P), 0x77);

        assert_eq!(vm.close_shm(&shm), Err(VmError::InvalidArgument));
        vm.munmap(first, HUGE).unwrap();
        vm.munmap(second, HUGE).unwrap();
        assert_eq!(shm.resident_pages(), 1);

        let free = vm.stats().free();
        vm.close_shm(&shm).unwrap();
        assert_eq!(vm.stats().free(), free + HUGE);
    }

    #[test]
    fn procfs_maps_lists_each_vma() {
        let (_, vm) = setup();
        let file = FakeFile::patterned(2 * P);
        let inode = file.identity().inode;
        fixed(&vm, 0x2_0000, P, RW, MmapFlags::FIXED).unwrap();
        vm.mmap(
            0x3_0000,
            P,
            Perm::READ | Perm::EXEC,
            MmapFlags::SHARED | MmapFlags::FIXED,
            MapSource::File(file),
            P,
        )
        .unwrap();

        let expected = alloc::format!(
            "20000-20100 rw-p 00000000 00:00 0\n30000-30100 r-xs 00000100 08:01 {} /data/fake\n",
            inode
        );
        assert_eq!(vm.procfs_maps(), expected);
    }

    #[test]
    fn linear_maps_are_indexed_and_listed() {
        let (_, vm) = setup();
        let phys = PhysicalAddress::new(0x4_0000);
        vm.linear_map(0x6_0000, phys, HUGE + P, "ram", HUGE, MemAttr::Normal).unwrap();

        assert_eq!(vm.virt_to_phys(0x6_0123), Some(phys + 0x123));
        assert_eq!(vm.virt_to_phys(0x6_1010), Some(phys + 0x1010));
        assert!(vm.lookup(0x6_0000).unwrap().0.is_large());
        assert_eq!(
            vm.find_range(0x6_0800).unwrap().owner,
            RangeOwner::Linear { name: String::from("ram") }
        );
        assert_eq!(
            vm.linear_maps(),
            "           0x60000            0x40000         1100 rwxp n ram\n"
        );
        assert_eq!(
            vm.linear_map(0x6_1000, phys, P, "again", P, MemAttr::Device),
            Err(VmError::AlreadyExists)
        );
    }

    #[test]
    fn find_range_follows_mmap_and_munmap() {
        let (_, vm) = setup();
        let addr = anon(&vm, 2 * P, Perm::READ);
        match vm.find_range(addr + P).unwrap().owner {
            RangeOwner::Vma { perm, .. } => assert_eq!(perm, Perm::READ),
            other => panic!("unexpected owner {other:?}"),
        }
        vm.munmap(addr, 2 * P).unwrap();
        assert!(vm.find_range(addr).is_none());
    }

    #[test]
    fn writers_prefault_their_stack() {
        let (sched, vm) = setup();
        let addr = anon(&vm, P, RW);
        vm.munmap(addr, P).unwrap();
        assert_eq!(sched.stack_prefaults(), 2 * vm.config().stack_prefault_pages);
    }

    #[test]
    fn concurrent_faults_map_each_page_once() {
        let (_, vm) = setup();
        let vm = Arc::new(vm);
        let base = 0x2_0000;
        fixed(&vm, base, 8 * P, RW, MmapFlags::FIXED | MmapFlags::SMALL).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let vm = vm.clone();
                let translator = AddressTranslator::current().share();
                thread::spawn(move || {
                    AddressTranslator::set_current(translator);
                    for page in 0..8 {
                        vm.fault(base + page * P, Access::Write).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(vm.mincore(base, 8 * P).unwrap().iter().all(|&page| page));

        let free = vm.stats().free();
        vm.munmap(base, 8 * P).unwrap();
        assert_eq!(vm.stats().free(), free + 8 * P);
    }
}
