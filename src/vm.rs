use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use page_table_entry::MappingFlags;
use spin::Mutex;

use crate::p2m::{GuestMapping, MapContext, Translation};
use crate::vcpu::Vcpu;
use crate::{Hal, HvError, HvResult};

bitflags! {
    /// Capabilities negotiated with the controlling process.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VmFeatures: u32 {
        /// Fast MMIO exits with basic decoding.
        const FASTMMIO_BASIC = 1 << 0;
        /// Fast MMIO exits for the extended instruction set.
        const FASTMMIO_EXTRA = 1 << 1;
    }
}

/// A virtual machine.
///
/// Lifetime is governed by `ref_count`, not by the `Arc` around it: the VM is
/// torn down by whoever drops the count from one to zero, through
/// [`VmManager::put_vm`](crate::VmManager::put_vm).
pub struct Vm<H: Hal> {
    id: u8,
    pub(crate) ref_count: AtomicI32,
    features: AtomicU32,
    /// Opaque handle of the host-side companion object, 0 if unbound.
    host: AtomicUsize,
    opened: AtomicBool,
    torn_down: AtomicBool,
    pub(crate) vcpus: Mutex<Vec<Arc<Vcpu<H>>>>,
    translation: Mutex<Box<dyn Translation<H>>>,
}

impl<H: Hal> Vm<H> {
    pub(crate) fn new(id: u8, translation: Box<dyn Translation<H>>, host: usize) -> Self {
        Self {
            id,
            ref_count: AtomicI32::new(1),
            features: AtomicU32::new(0),
            host: AtomicUsize::new(host),
            opened: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            vcpus: Mutex::new(Vec::new()),
            translation: Mutex::new(translation),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Takes a reference unless the VM is already being destroyed.
    pub(crate) fn try_get(&self) -> bool {
        if self.ref_count.fetch_add(1, Ordering::AcqRel) <= 0 {
            self.ref_count.fetch_sub(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    pub fn features(&self) -> VmFeatures {
        VmFeatures::from_bits_truncate(self.features.load(Ordering::Acquire))
    }

    /// Enables the features the controlling process supports.
    pub fn set_qemu_version(&self, version: u32) {
        let mut features = VmFeatures::empty();
        if version >= 2 {
            features |= VmFeatures::FASTMMIO_BASIC;
            if version >= 4 {
                features |= VmFeatures::FASTMMIO_EXTRA;
            }
        }
        self.features.fetch_or(features.bits(), Ordering::AcqRel);
    }

    pub fn host(&self) -> usize {
        self.host.load(Ordering::Acquire)
    }

    /// Binds the host-side companion object. Rebinding to another one fails.
    pub fn set_host(&self, host: usize) -> HvResult {
        match self
            .host
            .compare_exchange(0, host, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(current) if current == host => Ok(()),
            Err(_) => Err(HvError::AlreadyExists),
        }
    }

    /// Marks the VM as opened by its controlling process.
    pub fn open(&self) -> HvResult {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(HvError::Busy);
        }
        Ok(())
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().len()
    }

    pub fn vcpu_ids(&self) -> Vec<u32> {
        self.vcpus.lock().iter().map(|v| v.id()).collect()
    }

    /// EPT pointer for the VMCS of this VM's VCPUs.
    pub fn eptp(&self) -> u64 {
        self.translation.lock().eptp()
    }

    /// Installs `gpfn -> hpfn`. Returns whether the mapping was stored.
    pub fn install_mapping(&self, gpfn: u64, hpfn: u64, hva: usize, flags: MappingFlags) -> bool {
        if self.is_torn_down() {
            warn!("VM {}: install on a torn down VM", self.id);
            return false;
        }
        match self.translation.lock().install(gpfn, hpfn, hva, flags) {
            Ok(()) => {
                trace!("VM {}: gpfn {:#x} -> hpfn {:#x}", self.id, gpfn, hpfn);
                true
            }
            Err(err) => {
                warn!("VM {}: failed to install gpfn {:#x}: {}", self.id, gpfn, err);
                false
            }
        }
    }

    /// Removes the mapping of `gpfn`.
    pub fn invalidate_mapping(&self, gpfn: u64) -> HvResult {
        self.translation.lock().invalidate(gpfn)
    }

    /// Host physical address of `gpfn`, 0 if unmapped.
    pub fn gpfn_to_hpa(&self, gpfn: u64) -> u64 {
        self.translation.lock().resolve_hpa(gpfn)
    }

    /// Host-virtual mapping of `gpfn`, see [`Translation::map_gpfn`].
    pub fn map_gpfn(&self, gpfn: u64, ctx: &MapContext) -> Option<GuestMapping<H>> {
        self.translation.lock().map_gpfn(gpfn, ctx)
    }

    pub fn cached_hva(&self, gpfn: u64) -> Option<usize> {
        self.translation.lock().cached_hva(gpfn)
    }

    /// Drops cached host mappings of the guest address space `cr3`, or all of
    /// them if `force`.
    pub fn recycle_hva(&self, cr3: u64, force: bool) -> usize {
        self.translation.lock().recycle_all(cr3, force)
    }

    pub fn handle_ept_violation(&self, gpa: u64) -> HvResult<bool> {
        self.translation.lock().handle_ept_violation(gpa)
    }

    /// Number of allocated p2m groups.
    pub fn group_count(&self) -> usize {
        self.translation.lock().group_count()
    }

    /// Frees the translation resources of the VM.
    ///
    /// Fails without touching anything while the VM still owns VCPUs.
    pub fn teardown(&self) -> HvResult {
        let vcpus = self.vcpus.lock();
        if !vcpus.is_empty() {
            warn!("VM {}: teardown with {} vCPUs left", self.id, vcpus.len());
            return Err(HvError::VmBusy);
        }
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.translation.lock().teardown();
        info!("VM {} torn down", self.id);
        Ok(())
    }
}

impl<H: Hal> core::fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("ref_count", &self.ref_count())
            .field("features", &self.features())
            .field("vcpus", &self.vcpu_ids())
            .finish()
    }
}

/// A counted reference to a [`Vm`].
///
/// Obtained from [`VmManager`](crate::VmManager) and given back with
/// [`VmManager::put_vm`](crate::VmManager::put_vm), which consumes it.
#[must_use = "VM references must be released with VmManager::put_vm"]
pub struct VmRef<H: Hal> {
    vm: Arc<Vm<H>>,
}

impl<H: Hal> VmRef<H> {
    pub(crate) fn new(vm: Arc<Vm<H>>) -> Self {
        Self { vm }
    }

    pub(crate) fn into_arc(self) -> Arc<Vm<H>> {
        self.vm
    }

    pub(crate) fn arc(&self) -> &Arc<Vm<H>> {
        &self.vm
    }
}

impl<H: Hal> Deref for VmRef<H> {
    type Target = Vm<H>;

    fn deref(&self) -> &Vm<H> {
        &self.vm
    }
}

impl<H: Hal> core::fmt::Debug for VmRef<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.vm.fmt(f)
    }
}
