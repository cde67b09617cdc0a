use alloc::sync::Arc;
use alloc::vec::Vec;

use page_table_entry::MappingFlags;

use super::ept::EptTree;
use super::{GuestMapping, MapContext, P2mMap, TlbInvalidator, Translation};
use crate::config::{HvConfig, HvaWindowConfig};
use crate::{Hal, HostPhysAddr, HostVirtAddr, HvResult};

/// One host-virtual mapping tracked by a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HvaRecord {
    pub gpfn: u64,
    pub hva: HostVirtAddr,
    /// Guest page-table root the mapping was created for.
    pub cr3: u64,
    pub is_kernel: bool,
    pub level: u8,
}

/// A bounded list of tracked host-virtual mappings.
///
/// Kernel mappings are tracked but do not count against the capacity.
#[derive(Debug)]
pub struct HvaWindow {
    records: Vec<HvaRecord>,
    capacity: usize,
}

impl HvaWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tracked non-kernel mappings.
    pub fn user_len(&self) -> usize {
        self.records.iter().filter(|r| !r.is_kernel).count()
    }

    pub fn is_full(&self) -> bool {
        self.user_len() >= self.capacity
    }

    pub fn records(&self) -> &[HvaRecord] {
        &self.records
    }

    fn push(&mut self, record: HvaRecord) {
        self.records.push(record);
    }

    fn take_gpfn(&mut self, gpfn: u64) -> Option<HvaRecord> {
        let pos = self.records.iter().position(|r| r.gpfn == gpfn)?;
        Some(self.records.remove(pos))
    }

    /// Removes and returns every record matching `pred`.
    fn take_where(&mut self, mut pred: impl FnMut(&HvaRecord) -> bool) -> Vec<HvaRecord> {
        let mut taken = Vec::new();
        self.records.retain(|r| {
            if pred(r) {
                taken.push(*r);
                false
            } else {
                true
            }
        });
        taken
    }
}

/// Translation that installs frames directly into the p2m groups and the EPT,
/// and caches host-virtual mappings of guest frames in two windows.
///
/// While the tracked total is at or below the recycle threshold, new mappings
/// land in the reserve window, which is only emptied by [`recycle_all`]. Past
/// the threshold they land in the primary window, which is recycled on demand
/// once the ceiling is reached.
///
/// [`recycle_all`]: Translation::recycle_all
#[derive(Debug)]
pub struct LegacyP2m<H: Hal> {
    window_config: HvaWindowConfig,
    p2m: P2mMap,
    ept: EptTree<H>,
    reserve: HvaWindow,
    primary: HvaWindow,
    /// Pages currently mapped through the windows.
    mapped_pages: usize,
}

impl<H: Hal> LegacyP2m<H> {
    pub fn new(config: &HvConfig, invalidator: Arc<dyn TlbInvalidator>) -> HvResult<Self> {
        let window_config = config.hva_window;
        let ept = EptTree::new(invalidator)?;
        ept.flush()?;
        let limit = window_config.limit_pages();
        let threshold = window_config.threshold_pages().min(limit);
        Ok(Self {
            window_config,
            p2m: P2mMap::new(config.max_gpfn()),
            ept,
            reserve: HvaWindow::new(threshold),
            primary: HvaWindow::new(limit - threshold),
            mapped_pages: 0,
        })
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped_pages << 12
    }

    pub fn reserve(&self) -> &HvaWindow {
        &self.reserve
    }

    pub fn primary(&self) -> &HvaWindow {
        &self.primary
    }

    pub fn ept(&self) -> &EptTree<H> {
        &self.ept
    }

    fn under_ceiling(&self) -> bool {
        self.mapped_pages < self.window_config.limit_pages()
    }

    /// Picks the window of a new mapping: the reserve up to the threshold,
    /// then whichever has room. Kernel mappings always land somewhere.
    fn pick_window(&self, ctx: &MapContext) -> Option<bool> {
        let below_threshold = self.mapped_pages < self.window_config.threshold_pages();
        if below_threshold && !self.reserve.is_full() {
            Some(true)
        } else if !self.primary.is_full() {
            Some(false)
        } else if !self.reserve.is_full() {
            Some(true)
        } else if ctx.is_kernel {
            Some(false)
        } else {
            None
        }
    }

    /// Maps `hpa` and records it for `gpfn`. Fails when no window has room or
    /// the host has no address space left.
    fn track_new(&mut self, gpfn: u64, hpa: u64, ctx: &MapContext) -> Option<GuestMapping<H>> {
        let to_reserve = self.pick_window(ctx)?;
        let hva = H::vmap(HostPhysAddr::from_usize(hpa as usize))?;
        let entry = self.p2m.entry_mut(gpfn)?;
        entry.hva = hva.as_usize();

        let record = HvaRecord {
            gpfn,
            hva,
            cr3: ctx.cr3,
            is_kernel: ctx.is_kernel,
            level: ctx.level,
        };
        if to_reserve {
            self.reserve.push(record);
        } else {
            self.primary.push(record);
        }
        self.mapped_pages += 1;
        Some(GuestMapping::cached(hva.as_usize()))
    }

    /// Unmaps a record taken out of a window.
    fn drop_record(&mut self, record: HvaRecord) {
        H::vunmap(record.hva);
        if let Some(entry) = self.p2m.entry_mut(record.gpfn) {
            if entry.hva == record.hva.as_usize() {
                entry.hva = 0;
            }
        }
        self.mapped_pages -= 1;
    }

    fn take_record(&mut self, gpfn: u64) -> Option<HvaRecord> {
        self.reserve
            .take_gpfn(gpfn)
            .or_else(|| self.primary.take_gpfn(gpfn))
    }

    /// Evicts the primary-window mappings of other guest address spaces.
    fn recycle(&mut self, cr3: u64) -> usize {
        let evicted = self.primary.take_where(|r| !r.is_kernel && r.cr3 != cr3);
        let count = evicted.len();
        for record in evicted {
            self.drop_record(record);
        }
        debug!("recycled {} host mappings for cr3 {:#x}", count, cr3);
        count
    }
}

impl<H: Hal> Translation<H> for LegacyP2m<H> {
    fn install(&mut self, gpfn: u64, hpfn: u64, hva: usize, flags: MappingFlags) -> HvResult {
        let hpa = hpfn << 12;
        // Reinstalling the same frame without an hva keeps the cached one.
        let rebind = self.p2m.hpa(gpfn) != hpa || hva != 0;
        if rebind {
            if let Some(record) = self.take_record(gpfn) {
                self.drop_record(record);
            }
        }
        let entry = self.p2m.entry_or_alloc(gpfn)?;
        entry.hpa = hpa;
        if rebind {
            entry.hva = hva & !0xfff;
        }
        if self.ept.map(gpfn, hpfn, flags)? {
            self.ept.flush()?;
        }
        Ok(())
    }

    fn invalidate(&mut self, gpfn: u64) -> HvResult {
        if let Some(record) = self.take_record(gpfn) {
            self.drop_record(record);
        }
        self.p2m.clear(gpfn);
        if self.ept.invalidate_entries(gpfn, 1) {
            self.ept.flush()?;
        }
        Ok(())
    }

    fn resolve_hpa(&self, gpfn: u64) -> u64 {
        self.p2m.hpa(gpfn)
    }

    fn map_gpfn(&mut self, gpfn: u64, ctx: &MapContext) -> Option<GuestMapping<H>> {
        if let Some(hva) = self.p2m.hva(gpfn) {
            return Some(GuestMapping::cached(hva));
        }
        let hpa = self.p2m.hpa(gpfn);
        if hpa == 0 {
            return None;
        }

        if self.under_ceiling() || ctx.is_kernel {
            if let Some(mapping) = self.track_new(gpfn, hpa, ctx) {
                return Some(mapping);
            }
        } else if self.recycle(ctx.cr3) > 0 && self.under_ceiling() {
            if let Some(mapping) = self.track_new(gpfn, hpa, ctx) {
                return Some(mapping);
            }
        }

        trace!("gpfn {:#x}: window exhausted, one-shot mapping", gpfn);
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
        if self.ept.lookup(gfn).is_some() {
            return Ok(true);
        }
        let hpa = self.p2m.hpa(gfn);
        if hpa == 0 {
            return Ok(false);
        }
        self.ept.map(
            gfn,
            hpa >> 12,
            MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE,
        )?;
        Ok(true)
    }

    fn recycle_all(&mut self, cr3: u64, force: bool) -> usize {
        let pred = |r: &HvaRecord| force || (!r.is_kernel && r.cr3 == cr3);
        let mut records = self.reserve.take_where(pred);
        records.extend(self.primary.take_where(pred));
        let count = records.len();
        for record in records {
            self.drop_record(record);
        }
        count
    }

    fn teardown(&mut self) {
        let count = self.recycle_all(0, true);
        debug!("released {} host mappings", count);
        self.ept.clear();
        self.p2m.free_all();
    }

    fn group_count(&self) -> usize {
        self.p2m.group_count()
    }
}

impl<H: Hal> Drop for LegacyP2m<H> {
    fn drop(&mut self) {
        self.recycle_all(0, true);
    }
}
