use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use page_table_entry::MappingFlags;

use crate::{HvError, HvResult};

/// Backing of one guest frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpaMapping {
    pub hpfn: u64,
    pub flags: MappingFlags,
}

/// Observer of the guest physical address space.
///
/// Callbacks run with the owning VM's translation lock held, and must be done
/// with the affected frames when they return.
pub trait GpaSpaceListener: Send + Sync {
    fn mapping_added(&self, _gfn: u64, _mapping: &GpaMapping) {}
    fn mapping_removed(&self, gfn: u64, old: &GpaMapping);
    fn mapping_changed(&self, gfn: u64, old: &GpaMapping, new: &GpaMapping);
}

/// The guest physical memory layout of one VM.
#[derive(Default)]
pub struct GpaSpace {
    mappings: BTreeMap<u64, GpaMapping>,
    listeners: Vec<Arc<dyn GpaSpaceListener>>,
}

impl GpaSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn GpaSpaceListener>) {
        self.listeners.push(listener);
    }

    /// Unregisters `listener`, returns whether it was registered.
    pub fn remove_listener(&mut self, listener: &Arc<dyn GpaSpaceListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn get(&self, gfn: u64) -> Option<GpaMapping> {
        self.mappings.get(&gfn).copied()
    }

    /// Backs `gfn` with `hpfn`, replacing whatever backed it before.
    pub fn map(&mut self, gfn: u64, hpfn: u64, flags: MappingFlags) {
        let new = GpaMapping { hpfn, flags };
        match self.mappings.insert(gfn, new) {
            None => {
                for l in &self.listeners {
                    l.mapping_added(gfn, &new);
                }
            }
            Some(old) if old != new => {
                for l in &self.listeners {
                    l.mapping_changed(gfn, &old, &new);
                }
            }
            Some(_) => {}
        }
    }

    pub fn unmap(&mut self, gfn: u64) -> Option<GpaMapping> {
        let old = self.mappings.remove(&gfn)?;
        for l in &self.listeners {
            l.mapping_removed(gfn, &old);
        }
        Some(old)
    }

    /// Changes the access rights of `gfn`.
    pub fn protect(&mut self, gfn: u64, flags: MappingFlags) -> HvResult {
        let entry = self.mappings.get_mut(&gfn).ok_or(HvError::NotFound)?;
        if entry.flags == flags {
            return Ok(());
        }
        let old = *entry;
        entry.flags = flags;
        let new = *entry;
        for l in &self.listeners {
            l.mapping_changed(gfn, &old, &new);
        }
        Ok(())
    }

    /// Drops every listener and mapping without notifying.
    pub fn clear(&mut self) {
        self.listeners.clear();
        self.mappings.clear();
    }
}

impl core::fmt::Debug for GpaSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpaSpace")
            .field("mappings", &self.mappings.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
