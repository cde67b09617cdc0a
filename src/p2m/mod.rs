//! Guest-physical to host-physical / host-virtual translation.
//!
//! Two schemes sit behind [`Translation`]:
//!
//! - [`EptP2m`]: a [`GpaSpace`] holds the guest memory layout and an
//!   [`EptTree`] listens to it, keeping the hardware tables in sync.
//! - [`LegacyP2m`]: mappings are installed straight into the p2m groups and
//!   the EPT, and host-virtual mappings of guest frames are cached in a
//!   bounded window that is recycled on demand.

mod ept;
mod gpa_space;
mod legacy;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use page_table_entry::MappingFlags;

use crate::config::{GPFN_GROUP_SHIFT, GPFN_GROUP_SIZE, HvConfig, TranslationKind};
use crate::{Hal, HostVirtAddr, HvError, HvResult};

pub use self::ept::{EPTEntry, EPTFlags, EPTMemType, EPTPointer, EptP2m, EptTree};
pub use self::gpa_space::{GpaMapping, GpaSpace, GpaSpaceListener};
pub use self::legacy::{HvaRecord, HvaWindow, LegacyP2m};

/// Flushes the cached EPT translations of one EPT context.
pub trait TlbInvalidator: Send + Sync {
    fn flush_ept(&self, eptp: u64) -> HvResult;
}

/// Translation of one guest frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct P2mEntry {
    /// Host virtual address of the frame, 0 if not mapped.
    pub hva: usize,
    /// Host physical address of the frame, 0 if not installed.
    pub hpa: u64,
}

/// Guest frame table, split in lazily allocated 1 GiB groups.
#[derive(Debug)]
pub struct P2mMap {
    groups: Vec<Option<Box<[P2mEntry]>>>,
}

impl P2mMap {
    pub fn new(max_gpfn: u64) -> Self {
        let group_count = max_gpfn.div_ceil(GPFN_GROUP_SIZE as u64) as usize;
        let mut groups = Vec::with_capacity(group_count);
        groups.resize_with(group_count, || None);
        Self { groups }
    }

    fn split(gpfn: u64) -> (usize, usize) {
        (
            (gpfn >> GPFN_GROUP_SHIFT) as usize,
            (gpfn & (GPFN_GROUP_SIZE as u64 - 1)) as usize,
        )
    }

    pub fn max_gpfn(&self) -> u64 {
        (self.groups.len() as u64) << GPFN_GROUP_SHIFT
    }

    pub fn entry(&self, gpfn: u64) -> Option<&P2mEntry> {
        let (group, index) = Self::split(gpfn);
        self.groups.get(group)?.as_ref().map(|g| &g[index])
    }

    pub fn entry_mut(&mut self, gpfn: u64) -> Option<&mut P2mEntry> {
        let (group, index) = Self::split(gpfn);
        self.groups.get_mut(group)?.as_mut().map(|g| &mut g[index])
    }

    /// Returns the entry of `gpfn`, allocating its group if needed.
    pub fn entry_or_alloc(&mut self, gpfn: u64) -> HvResult<&mut P2mEntry> {
        let (group, index) = Self::split(gpfn);
        let slot = self.groups.get_mut(group).ok_or(HvError::TooBig(gpfn))?;
        if slot.is_none() {
            let mut entries = Vec::new();
            entries
                .try_reserve_exact(GPFN_GROUP_SIZE)
                .map_err(|_| HvError::NoMemory)?;
            entries.resize(GPFN_GROUP_SIZE, P2mEntry::default());
            debug!("allocated p2m group {}", group);
            *slot = Some(entries.into_boxed_slice());
        }
        match slot {
            Some(entries) => Ok(&mut entries[index]),
            None => Err(HvError::NoMemory),
        }
    }

    /// Host physical address of `gpfn`, 0 if none.
    pub fn hpa(&self, gpfn: u64) -> u64 {
        self.entry(gpfn).map_or(0, |e| e.hpa)
    }

    /// Cached host virtual address of `gpfn`.
    pub fn hva(&self, gpfn: u64) -> Option<usize> {
        self.entry(gpfn).map(|e| e.hva).filter(|&hva| hva != 0)
    }

    /// Forgets the translation of `gpfn`, returning what was there.
    pub fn clear(&mut self, gpfn: u64) -> Option<P2mEntry> {
        self.entry_mut(gpfn)
            .map(core::mem::take)
            .filter(|e| *e != P2mEntry::default())
    }

    pub fn group_count(&self) -> usize {
        self.groups.iter().filter(|g| g.is_some()).count()
    }

    pub fn free_all(&mut self) {
        for group in self.groups.iter_mut() {
            *group = None;
        }
    }
}

/// Context of a host-virtual mapping request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapContext {
    /// Kernel mappings are shared by every guest address space.
    pub is_kernel: bool,
    /// Guest page-table root the request comes from.
    pub cr3: u64,
    /// Guest paging level of the walk that needs the frame.
    pub level: u8,
}

/// A host-virtual mapping of one guest frame.
///
/// A one-shot mapping is owned by the guard and released when it is dropped.
///
/// A cached mapping is owned by the translation, not by the guard. It stays
/// valid only until the frame is reinstalled, invalidated or recycled, and
/// none of those wait for outstanding guards: a `recycle_hva` on another core
/// can unmap it as soon as the translation lock is released. Callers must not
/// keep the address across a point where the guest address space may be
/// recycled.
#[derive(Debug)]
pub struct GuestMapping<H: Hal> {
    hva: HostVirtAddr,
    one_shot: bool,
    _marker: PhantomData<H>,
}

impl<H: Hal> GuestMapping<H> {
    pub(crate) fn cached(hva: usize) -> Self {
        Self {
            hva: HostVirtAddr::from_usize(hva),
            one_shot: false,
            _marker: PhantomData,
        }
    }

    pub(crate) fn one_shot(hva: HostVirtAddr) -> Self {
        Self {
            hva,
            one_shot: true,
            _marker: PhantomData,
        }
    }

    pub fn hva(&self) -> HostVirtAddr {
        self.hva
    }

    /// Whether the mapping is tracked by the translation.
    pub fn is_cached(&self) -> bool {
        !self.one_shot
    }
}

impl<H: Hal> Drop for GuestMapping<H> {
    fn drop(&mut self) {
        if self.one_shot {
            trace!("releasing one-shot mapping {:#x}", self.hva);
            H::vunmap(self.hva);
        }
    }
}

/// Per-VM guest memory translation.
pub trait Translation<H: Hal>: Send {
    /// Installs `gpfn -> hpfn`, with `hva` the host mapping of the frame if
    /// the caller has one (0 otherwise).
    fn install(&mut self, gpfn: u64, hpfn: u64, hva: usize, flags: MappingFlags) -> HvResult;

    /// Removes the translation of `gpfn`.
    fn invalidate(&mut self, gpfn: u64) -> HvResult;

    /// Host physical address of `gpfn`, 0 if not installed.
    fn resolve_hpa(&self, gpfn: u64) -> u64;

    /// Returns a host-virtual mapping of `gpfn`, `None` if the frame is not
    /// installed or cannot be mapped.
    fn map_gpfn(&mut self, gpfn: u64, ctx: &MapContext) -> Option<GuestMapping<H>>;

    /// The host-virtual address cached for `gpfn`, if any.
    fn cached_hva(&self, gpfn: u64) -> Option<usize>;

    /// EPT pointer to program into the VMCS of this VM's VCPUs.
    fn eptp(&self) -> u64;

    /// Fills the EPT for a faulting guest physical address. Returns whether
    /// the address is backed.
    fn handle_ept_violation(&mut self, gpa: u64) -> HvResult<bool>;

    /// Drops cached host-virtual mappings, returns how many were dropped.
    fn recycle_all(&mut self, _cr3: u64, _force: bool) -> usize {
        0
    }

    /// Releases every resource of the translation.
    fn teardown(&mut self);

    /// Number of allocated p2m groups.
    fn group_count(&self) -> usize;
}

/// Creates the translation selected by `config`.
pub(crate) fn new_translation<H: Hal>(
    config: &HvConfig,
    invalidator: Arc<dyn TlbInvalidator>,
) -> HvResult<Box<dyn Translation<H>>> {
    Ok(match config.translation {
        TranslationKind::Ept => Box::new(EptP2m::<H>::new(config, invalidator)?),
        TranslationKind::Legacy => Box::new(LegacyP2m::<H>::new(config, invalidator)?),
    })
}
