use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use page_table_entry::{GenericPTE, MappingFlags};
use spin::Mutex;

use super::gpa_space::{GpaMapping, GpaSpace, GpaSpaceListener};
use super::{GuestMapping, MapContext, P2mMap, TlbInvalidator, Translation};
use crate::config::HvConfig;
use crate::frame::PhysFrame;
use crate::{Hal, HostPhysAddr, HvError, HvResult};

bitflags! {
    /// EPT entry flags. (SDM Vol. 3C, Section 28.3.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EPTFlags: u64 {
        /// Read access.
        const READ =                1 << 0;
        /// Write access.
        const WRITE =               1 << 1;
        /// Execute access.
        const EXECUTE =             1 << 2;
        /// EPT memory type. Only for terminate pages.
        const MEM_TYPE_MASK =       0b111 << 3;
        /// Ignore PAT memory type. Only for terminate pages.
        const IGNORE_PAT =          1 << 6;
        /// Specifies that the entry maps a huge frame instead of a page table.
        /// Only allowed in P2 or P3 tables.
        const HUGE_PAGE =           1 << 7;
        /// If bit 6 of EPTP is 1, accessed flag for EPT.
        const ACCESSED =            1 << 8;
        /// If bit 6 of EPTP is 1, dirty flag for EPT.
        const DIRTY =               1 << 9;
        /// Execute access for user-mode linear addresses.
        const EXECUTE_FOR_USER =    1 << 10;
    }
}

numeric_enum_macro::numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    /// EPT memory typing. (SDM Vol. 3C, Section 28.3.7)
    pub enum EPTMemType {
        Uncached = 0,
        WriteCombining = 1,
        WriteThrough = 4,
        WriteProtected = 5,
        WriteBack = 6,
    }
}

impl EPTFlags {
    fn set_mem_type(&mut self, mem_type: EPTMemType) {
        let bits = (self.bits() & !Self::MEM_TYPE_MASK.bits()) | ((mem_type as u64) << 3);
        *self = Self::from_bits_retain(bits);
    }

    fn mem_type(&self) -> Result<EPTMemType, u8> {
        EPTMemType::try_from(((self.bits() & Self::MEM_TYPE_MASK.bits()) >> 3) as u8)
    }
}

impl From<MappingFlags> for EPTFlags {
    fn from(f: MappingFlags) -> Self {
        if f.is_empty() {
            return Self::empty();
        }
        let mut ret = Self::empty();
        if f.contains(MappingFlags::READ) {
            ret |= Self::READ;
        }
        if f.contains(MappingFlags::WRITE) {
            ret |= Self::WRITE;
        }
        if f.contains(MappingFlags::EXECUTE) {
            ret |= Self::EXECUTE;
        }
        if f.intersects(MappingFlags::DEVICE | MappingFlags::UNCACHED) {
            ret.set_mem_type(EPTMemType::Uncached);
        } else {
            ret.set_mem_type(EPTMemType::WriteBack);
        }
        ret
    }
}

impl From<EPTFlags> for MappingFlags {
    fn from(f: EPTFlags) -> Self {
        let mut ret = Self::empty();
        if f.contains(EPTFlags::READ) {
            ret |= Self::READ;
        }
        if f.contains(EPTFlags::WRITE) {
            ret |= Self::WRITE;
        }
        if f.contains(EPTFlags::EXECUTE) {
            ret |= Self::EXECUTE;
        }
        if let Ok(EPTMemType::Uncached) = f.mem_type() {
            ret |= Self::DEVICE;
        }
        ret
    }
}

/// An x86_64 VMX extended page table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct EPTEntry(u64);

impl EPTEntry {
    const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000; // bits 12..52

    pub const fn empty() -> Self {
        Self(0)
    }

    fn ept_flags(&self) -> EPTFlags {
        EPTFlags::from_bits_truncate(self.0)
    }

    pub fn mem_type(&self) -> Result<EPTMemType, u8> {
        self.ept_flags().mem_type()
    }
}

impl GenericPTE for EPTEntry {
    fn new_page(paddr: HostPhysAddr, flags: MappingFlags, is_huge: bool) -> Self {
        let mut flags = EPTFlags::from(flags);
        if is_huge {
            flags |= EPTFlags::HUGE_PAGE;
        }
        Self(flags.bits() | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK))
    }
    fn new_table(paddr: HostPhysAddr) -> Self {
        let flags = EPTFlags::READ | EPTFlags::WRITE | EPTFlags::EXECUTE;
        Self(flags.bits() | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK))
    }
    fn paddr(&self) -> HostPhysAddr {
        HostPhysAddr::from((self.0 & Self::PHYS_ADDR_MASK) as usize)
    }
    fn flags(&self) -> MappingFlags {
        self.ept_flags().into()
    }
    fn set_paddr(&mut self, paddr: HostPhysAddr) {
        self.0 = (self.0 & !Self::PHYS_ADDR_MASK) | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK)
    }
    fn set_flags(&mut self, flags: MappingFlags, is_huge: bool) {
        let mut flags = EPTFlags::from(flags);
        if is_huge {
            flags |= EPTFlags::HUGE_PAGE;
        }
        self.0 = (self.0 & Self::PHYS_ADDR_MASK) | flags.bits()
    }
    fn bits(self) -> usize {
        self.0 as usize
    }
    fn is_unused(&self) -> bool {
        self.0 == 0
    }
    fn is_present(&self) -> bool {
        self.ept_flags()
            .intersects(EPTFlags::READ | EPTFlags::WRITE | EPTFlags::EXECUTE)
    }
    fn is_huge(&self) -> bool {
        self.ept_flags().contains(EPTFlags::HUGE_PAGE)
    }
    fn clear(&mut self) {
        self.0 = 0
    }
}

impl fmt::Debug for EPTEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EPTEntry")
            .field("raw", &self.0)
            .field("paddr", &self.paddr())
            .field("flags", &self.ept_flags())
            .field("mem_type", &self.mem_type())
            .finish()
    }
}

bitflags! {
    /// Extended-Page-Table Pointer. (SDM Vol. 3C, Section 24.6.11)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EPTPointer: u64 {
        /// EPT paging-structure memory type: Write-back (WB).
        const MEM_TYPE_WB = 6;
        /// EPT page-walk length 1 = 4-level.
        const WALK_LENGTH_4 = 3 << 3;
        /// Setting this control to 1 enables accessed and dirty flags for EPT.
        const ENABLE_ACCESSED_DIRTY = 1 << 6;
    }
}

impl EPTPointer {
    pub fn from_table_phys(pml4_paddr: HostPhysAddr) -> Self {
        let aligned_addr = pml4_paddr.as_usize() as u64 & EPTEntry::PHYS_ADDR_MASK;
        Self::from_bits_retain(aligned_addr) | Self::MEM_TYPE_WB | Self::WALK_LENGTH_4
    }
}

const ENTRY_COUNT: usize = 512;

const fn p4_index(gfn: u64) -> usize {
    ((gfn >> 27) as usize) & (ENTRY_COUNT - 1)
}

const fn p3_index(gfn: u64) -> usize {
    ((gfn >> 18) as usize) & (ENTRY_COUNT - 1)
}

const fn p2_index(gfn: u64) -> usize {
    ((gfn >> 9) as usize) & (ENTRY_COUNT - 1)
}

const fn p1_index(gfn: u64) -> usize {
    (gfn as usize) & (ENTRY_COUNT - 1)
}

fn table_of<'a, H: Hal>(paddr: HostPhysAddr) -> &'a [EPTEntry] {
    let ptr = H::phys_to_virt(paddr).as_ptr() as *const EPTEntry;
    unsafe { core::slice::from_raw_parts(ptr, ENTRY_COUNT) }
}

fn table_of_mut<'a, H: Hal>(paddr: HostPhysAddr) -> &'a mut [EPTEntry] {
    let ptr = H::phys_to_virt(paddr).as_mut_ptr() as *mut EPTEntry;
    unsafe { core::slice::from_raw_parts_mut(ptr, ENTRY_COUNT) }
}

/// The 4-level tables of one tree.
///
/// It also tracks all intermediate level tables. They are deallocated when
/// the tree is cleared or dropped.
struct EptTables<H: Hal> {
    root: PhysFrame<H>,
    intrm_tables: Vec<PhysFrame<H>>,
}

impl<H: Hal> EptTables<H> {
    fn next_table<'a>(entry: &EPTEntry) -> Option<&'a [EPTEntry]> {
        if !entry.is_present() || entry.is_huge() {
            None
        } else {
            Some(table_of::<H>(entry.paddr()))
        }
    }

    fn next_table_mut<'a>(entry: &EPTEntry) -> Option<&'a mut [EPTEntry]> {
        if !entry.is_present() || entry.is_huge() {
            None
        } else {
            Some(table_of_mut::<H>(entry.paddr()))
        }
    }

    fn next_table_mut_or_create<'a>(
        &mut self,
        entry: &mut EPTEntry,
    ) -> HvResult<&'a mut [EPTEntry]> {
        if entry.is_unused() {
            let frame = PhysFrame::<H>::alloc_zero()?;
            *entry = EPTEntry::new_table(frame.start_paddr());
            self.intrm_tables.push(frame);
        }
        Self::next_table_mut(entry).ok_or(HvError::BadState("EPT entry maps a huge page"))
    }

    fn get_entry(&self, gfn: u64) -> Option<&EPTEntry> {
        let p4 = table_of::<H>(self.root.start_paddr());
        let p3 = Self::next_table(&p4[p4_index(gfn)])?;
        let p2 = Self::next_table(&p3[p3_index(gfn)])?;
        let p1 = Self::next_table(&p2[p2_index(gfn)])?;
        Some(&p1[p1_index(gfn)])
    }

    fn get_entry_mut(&mut self, gfn: u64) -> Option<&mut EPTEntry> {
        let p4 = table_of_mut::<H>(self.root.start_paddr());
        let p3 = Self::next_table_mut(&p4[p4_index(gfn)])?;
        let p2 = Self::next_table_mut(&p3[p3_index(gfn)])?;
        let p1 = Self::next_table_mut(&p2[p2_index(gfn)])?;
        Some(&mut p1[p1_index(gfn)])
    }

    fn get_entry_mut_or_create(&mut self, gfn: u64) -> HvResult<&mut EPTEntry> {
        let p4 = table_of_mut::<H>(self.root.start_paddr());
        let p3 = self.next_table_mut_or_create(&mut p4[p4_index(gfn)])?;
        let p2 = self.next_table_mut_or_create(&mut p3[p3_index(gfn)])?;
        let p1 = self.next_table_mut_or_create(&mut p2[p2_index(gfn)])?;
        Ok(&mut p1[p1_index(gfn)])
    }

    /// Empties the root and frees every intermediate table.
    fn clear(&mut self) -> usize {
        table_of_mut::<H>(self.root.start_paddr()).fill(EPTEntry::empty());
        core::mem::take(&mut self.intrm_tables).len()
    }
}

/// Hardware-walkable 4-level extended page table of one VM.
///
/// The tree mirrors a [`GpaSpace`] as a listener: leaves are filled lazily on
/// EPT violations, and are invalidated (followed by a single-context INVEPT)
/// whenever the backing of a frame is removed or changed.
pub struct EptTree<H: Hal> {
    tables: Mutex<EptTables<H>>,
    eptp: EPTPointer,
    invalidator: Arc<dyn TlbInvalidator>,
}

impl<H: Hal> EptTree<H> {
    pub fn new(invalidator: Arc<dyn TlbInvalidator>) -> HvResult<Self> {
        let root = PhysFrame::alloc_zero()?;
        let eptp = EPTPointer::from_table_phys(root.start_paddr());
        debug!("created EPT tree, EPTP {:#x}", eptp.bits());
        Ok(Self {
            tables: Mutex::new(EptTables {
                root,
                intrm_tables: Vec::new(),
            }),
            eptp,
            invalidator,
        })
    }

    /// The EPT pointer: root | page-walk length - 1 | write-back.
    pub fn eptp(&self) -> u64 {
        self.eptp.bits()
    }

    /// Number of tables below the root.
    pub fn table_count(&self) -> usize {
        self.tables.lock().intrm_tables.len()
    }

    /// Points `gfn` at `hpfn`, returns whether a present leaf was replaced.
    pub fn map(&self, gfn: u64, hpfn: u64, flags: MappingFlags) -> HvResult<bool> {
        let mut tables = self.tables.lock();
        let entry = tables.get_entry_mut_or_create(gfn)?;
        let paddr = HostPhysAddr::from_usize((hpfn << 12) as usize);
        let new = EPTEntry::new_page(paddr, flags, false);
        let old = core::mem::replace(entry, new);
        Ok(old.is_present() && old != new)
    }

    /// The frame and access rights `gfn` resolves to.
    pub fn lookup(&self, gfn: u64) -> Option<(u64, MappingFlags)> {
        let tables = self.tables.lock();
        let entry = tables.get_entry(gfn)?;
        if !entry.is_present() {
            return None;
        }
        Some(((entry.paddr().as_usize() as u64) >> 12, entry.flags()))
    }

    /// Clears the leaves of `count` frames from `gfn`, returns whether any
    /// was present.
    pub fn invalidate_entries(&self, gfn: u64, count: u64) -> bool {
        let mut tables = self.tables.lock();
        let mut modified = false;
        for gfn in gfn..gfn + count {
            if let Some(entry) = tables.get_entry_mut(gfn) {
                if entry.is_present() {
                    entry.clear();
                    modified = true;
                }
            }
        }
        modified
    }

    /// Frees every table below the root and empties the root.
    pub fn clear(&self) {
        let freed = self.tables.lock().clear();
        debug!("EPT {:#x}: freed {} tables", self.eptp(), freed);
    }

    /// Flushes the translations cached for this tree on every core.
    pub fn flush(&self) -> HvResult {
        self.invalidator.flush_ept(self.eptp())
    }

    fn invalidate_and_flush(&self, gfn: u64) {
        if self.invalidate_entries(gfn, 1) {
            trace!("EPT entry of gfn {:#x} invalidated", gfn);
            if let Err(err) = self.flush() {
                warn!("INVEPT after invalidating gfn {:#x} failed: {}", gfn, err);
            }
        }
    }
}

impl<H: Hal> GpaSpaceListener for EptTree<H> {
    // Leaves are populated on the first EPT violation.
    fn mapping_added(&self, _gfn: u64, _mapping: &GpaMapping) {}

    fn mapping_removed(&self, gfn: u64, _old: &GpaMapping) {
        self.invalidate_and_flush(gfn);
    }

    fn mapping_changed(&self, gfn: u64, _old: &GpaMapping, _new: &GpaMapping) {
        self.invalidate_and_flush(gfn);
    }
}

impl<H: Hal> fmt::Debug for EptTree<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EptTree")
            .field("eptp", &format_args!("{:#x}", self.eptp()))
            .field("tables", &self.table_count())
            .finish()
    }
}

/// Translation built on a [`GpaSpace`] mirrored into an [`EptTree`].
pub struct EptP2m<H: Hal> {
    p2m: P2mMap,
    gpa_space: GpaSpace,
    ept: Arc<EptTree<H>>,
}

impl<H: Hal> EptP2m<H> {
    pub fn new(config: &HvConfig, invalidator: Arc<dyn TlbInvalidator>) -> HvResult<Self> {
        let ept = Arc::new(EptTree::new(invalidator)?);
        let mut gpa_space = GpaSpace::new();
        gpa_space.add_listener(ept.clone());
        ept.flush()?;
        Ok(Self {
            p2m: P2mMap::new(config.max_gpfn()),
            gpa_space,
            ept,
        })
    }

    pub fn gpa_space(&self) -> &GpaSpace {
        &self.gpa_space
    }

    pub fn ept(&self) -> &EptTree<H> {
        &self.ept
    }

    /// Changes the access rights of an installed frame.
    pub fn protect(&mut self, gpfn: u64, flags: MappingFlags) -> HvResult {
        self.gpa_space.protect(gpfn, flags)
    }
}

impl<H: Hal> Translation<H> for EptP2m<H> {
    fn install(&mut self, gpfn: u64, hpfn: u64, hva: usize, flags: MappingFlags) -> HvResult {
        let entry = self.p2m.entry_or_alloc(gpfn)?;
        entry.hpa = hpfn << 12;
        entry.hva = hva & !0xfff;
        self.gpa_space.map(gpfn, hpfn, flags);
        Ok(())
    }

    fn invalidate(&mut self, gpfn: u64) -> HvResult {
        self.gpa_space.unmap(gpfn);
        self.p2m.clear(gpfn);
        Ok(())
    }

    fn resolve_hpa(&self, gpfn: u64) -> u64 {
        self.p2m.hpa(gpfn)
    }

    fn map_gpfn(&mut self, gpfn: u64, _ctx: &MapContext) -> Option<GuestMapping<H>> {
        if let Some(hva) = self.p2m.hva(gpfn) {
            return Some(GuestMapping::cached(hva));
        }
        let hpa = self.p2m.hpa(gpfn);
        if hpa == 0 {
            return None;
        }
        H::vmap(HostPhysAddr::from_usize(hpa as usize)).map(GuestMapping::one_shot)
    }

    fn cached_hva(&self, gpfn: u64) -> Option<usize> {
        self.p2m.hva(gpfn)
    }

    fn eptp(&self) -> u64 {
        self.ept.eptp()
    }

    fn handle_ept_violation(&mut self, gpa: u64) -> HvResult<bool> {
        let gfn = gpa >> 12;
        match self.gpa_space.get(gfn) {
            Some(mapping) => {
                self.ept.map(gfn, mapping.hpfn, mapping.flags)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn teardown(&mut self) {
        self.gpa_space.clear();
        self.ept.clear();
        self.p2m.free_all();
    }

    fn group_count(&self) -> usize {
        self.p2m.group_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockCpu, MockHal, MockInvalidator};

    const RW: MappingFlags = MappingFlags::READ.union(MappingFlags::WRITE);

    fn tree() -> (Arc<MockInvalidator>, EptTree<MockHal>) {
        MockCpu::reset(1);
        let inv = Arc::new(MockInvalidator::default());
        let tree = EptTree::new(inv.clone()).unwrap();
        (inv, tree)
    }

    #[test]
    fn test_eptp_format() {
        let (_, tree) = tree();
        let eptp = tree.eptp();
        assert_eq!(eptp & 0x7, 6);
        assert_eq!((eptp >> 3) & 0x7, 3);
        assert_eq!(eptp & 0xfff, 0x1e);
    }

    #[test]
    fn test_ept_entry_encoding() {
        let paddr = HostPhysAddr::from_usize(0x12_3456_7000);
        let mut entry = EPTEntry::new_page(paddr, RW, false);
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.bits(), 0x12_3456_7000 | 0b11 | (6 << 3));
        assert_eq!(entry.mem_type(), Ok(EPTMemType::WriteBack));
        assert_eq!(entry.flags(), RW);

        let mmio = EPTEntry::new_page(paddr, RW | MappingFlags::DEVICE, false);
        assert_eq!(mmio.mem_type(), Ok(EPTMemType::Uncached));
        assert_eq!(mmio.flags(), RW | MappingFlags::DEVICE);

        entry.set_paddr(HostPhysAddr::from_usize(0x8000));
        assert_eq!(entry.paddr().as_usize(), 0x8000);
        assert_eq!(entry.flags(), RW);
        entry.clear();
        assert!(entry.is_unused());
        assert!(!entry.is_present());

        let table = EPTEntry::new_table(paddr);
        assert_eq!(table.bits() & 0xfff, 0b111);
    }

    #[test]
    fn test_map_and_lookup() {
        let (_, tree) = tree();
        assert_eq!(tree.lookup(0x1234), None);
        assert!(!tree.map(0x1234, 0xabcd, RW).unwrap());
        assert_eq!(tree.lookup(0x1234), Some((0xabcd, RW)));
        assert_eq!(tree.table_count(), 3);

        // A neighbour shares the whole path.
        tree.map(0x1235, 0xabce, MappingFlags::READ).unwrap();
        assert_eq!(tree.table_count(), 3);
        assert!(tree.map(0x1234, 0x9999, RW).unwrap());
        assert_eq!(tree.lookup(0x1234), Some((0x9999, RW)));
    }

    #[test]
    fn test_invalidate_entries() {
        let (_, tree) = tree();
        tree.map(10, 100, RW).unwrap();
        tree.map(11, 101, RW).unwrap();
        assert!(tree.invalidate_entries(10, 3));
        assert_eq!(tree.lookup(10), None);
        assert_eq!(tree.lookup(11), None);
        assert!(!tree.invalidate_entries(10, 3));
        assert!(!tree.invalidate_entries(1 << 30, 1));
    }

    #[test]
    fn test_listener_flushes_only_present_leaves() {
        let (inv, tree) = tree();
        let old = GpaMapping {
            hpfn: 1,
            flags: RW,
        };
        tree.mapping_removed(5, &old);
        assert_eq!(inv.flushes(), 0);

        tree.map(5, 1, RW).unwrap();
        tree.mapping_changed(5, &old, &old);
        assert_eq!(inv.flushes(), 1);
        assert_eq!(inv.last_eptp(), Some(tree.eptp()));
        assert_eq!(tree.lookup(5), None);
    }

    #[test]
    fn test_ept_p2m_lazy_fill_and_invalidate() {
        MockCpu::reset(1);
        let inv = Arc::new(MockInvalidator::default());
        let mut p2m = EptP2m::<MockHal>::new(&HvConfig::default(), inv.clone()).unwrap();
        // The initial flush of a fresh context.
        assert_eq!(inv.flushes(), 1);

        p2m.install(0x42, 0x1042, 0, RW).unwrap();
        assert_eq!(p2m.resolve_hpa(0x42), 0x1042 << 12);
        assert_eq!(p2m.ept().lookup(0x42), None);

        assert!(p2m.handle_ept_violation(0x42_123).unwrap());
        assert_eq!(p2m.ept().lookup(0x42), Some((0x1042, RW)));
        assert!(!p2m.handle_ept_violation(0x43_000).unwrap());

        p2m.protect(0x42, MappingFlags::READ).unwrap();
        assert_eq!(p2m.ept().lookup(0x42), None);
        assert_eq!(inv.flushes(), 2);

        p2m.handle_ept_violation(0x42_000).unwrap();
        p2m.invalidate(0x42).unwrap();
        assert_eq!(p2m.ept().lookup(0x42), None);
        assert_eq!(p2m.resolve_hpa(0x42), 0);
        assert_eq!(inv.flushes(), 3);
    }

    #[test]
    fn test_ept_p2m_map_gpfn() {
        MockCpu::reset(1);
        let inv = Arc::new(MockInvalidator::default());
        let mut p2m = EptP2m::<MockHal>::new(&HvConfig::default(), inv).unwrap();
        p2m.install(1, 0x501, 0x7fff_0000_1234, RW).unwrap();
        p2m.install(2, 0x502, 0, RW).unwrap();

        let ctx = MapContext::default();
        let cached = p2m.map_gpfn(1, &ctx).unwrap();
        assert!(cached.is_cached());
        assert_eq!(cached.hva().as_usize(), 0x7fff_0000_1000);

        let one_shot = p2m.map_gpfn(2, &ctx).unwrap();
        assert!(!one_shot.is_cached());
        assert_eq!(MockCpu::live_vmaps(), 1);
        drop(one_shot);
        assert_eq!(MockCpu::live_vmaps(), 0);

        assert!(p2m.map_gpfn(3, &ctx).is_none());
    }

    #[test]
    fn test_ept_p2m_teardown() {
        MockCpu::reset(1);
        let inv = Arc::new(MockInvalidator::default());
        let mut p2m = EptP2m::<MockHal>::new(&HvConfig::default(), inv).unwrap();
        p2m.install(1, 0x501, 0, RW).unwrap();
        p2m.install((1 << 18) + 1, 0x502, 0, RW).unwrap();
        p2m.handle_ept_violation(0x1000).unwrap();
        assert_eq!(p2m.group_count(), 2);
        assert_eq!(p2m.ept().table_count(), 3);
        p2m.teardown();
        assert_eq!(p2m.ept().table_count(), 0);
        assert_eq!(p2m.ept().lookup(1), None);
        assert_eq!(p2m.group_count(), 0);
        assert!(p2m.gpa_space().is_empty());
        assert_eq!(p2m.gpa_space().listener_count(), 0);
    }
}
