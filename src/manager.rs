use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::config::HvConfig;
use crate::p2m::{TlbInvalidator, new_translation};
use crate::vcpu::{Vcpu, VcpuRef};
use crate::vm::{Vm, VmRef};
use crate::vmx::{VmxController, VmxRegion};
use crate::{Hal, HvError, HvResult};

/// Maximum number of VMs alive at the same time.
pub const MAX_VMS: usize = 8;

/// Owner of every VM and VCPU of the hypervisor.
///
/// VMs and VCPUs are reference counted: `create_*` and `get_*` hand out
/// counted references that must be given back with `put_*`. The object is
/// destroyed by the `put_*` that drops its count to zero, and a lookup never
/// resurrects an object whose count already reached zero.
pub struct VmManager<H: Hal> {
    ctrl: Arc<VmxController<H>>,
    config: HvConfig,
    /// Bit `i` set when VM id `i` is taken.
    vm_ids: AtomicU8,
    vms: Mutex<[Option<Arc<Vm<H>>>; MAX_VMS]>,
}

impl<H: Hal> VmManager<H> {
    pub fn new(ctrl: Arc<VmxController<H>>, config: HvConfig) -> Self {
        Self {
            ctrl,
            config,
            vm_ids: AtomicU8::new(0),
            vms: Mutex::new(Default::default()),
        }
    }

    pub fn controller(&self) -> &Arc<VmxController<H>> {
        &self.ctrl
    }

    pub fn config(&self) -> &HvConfig {
        &self.config
    }

    /// Ids of the VMs currently registered.
    pub fn vm_ids(&self) -> Vec<u8> {
        self.vms.lock().iter().flatten().map(|vm| vm.id()).collect()
    }

    fn alloc_id(&self) -> Option<u8> {
        (0..MAX_VMS as u8).find(|&id| {
            let bit = 1 << id;
            self.vm_ids.fetch_or(bit, Ordering::AcqRel) & bit == 0
        })
    }

    fn free_id(&self, id: u8) {
        let bit = 1 << id;
        if self.vm_ids.fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            warn!("VM id {} was not in use", id);
        }
    }

    /// Creates a VM and returns the first reference to it.
    pub fn create_vm(&self) -> HvResult<(VmRef<H>, u8)> {
        if !self.ctrl.vt_enabled() || !self.ctrl.nx_enabled() {
            error!("VT or NX is not enabled, can not setup VM");
            return Err(HvError::FeatureNotEnabled);
        }
        let id = self.alloc_id().ok_or_else(|| {
            warn!("no VM id available");
            HvError::NoVmIdAvailable
        })?;

        let invalidator: Arc<dyn TlbInvalidator> = self.ctrl.clone();
        let translation = match new_translation::<H>(&self.config, invalidator) {
            Ok(translation) => translation,
            Err(err) => {
                error!("VM {}: failed to create translation: {}", id, err);
                self.free_id(id);
                return Err(err);
            }
        };
        let host = match H::vm_create_host(id) {
            Ok(host) => host,
            Err(err) => {
                error!("VM {}: failed to create host object: {}", id, err);
                drop(translation);
                self.free_id(id);
                return Err(err);
            }
        };

        let vm = Arc::new(Vm::new(id, translation, host));
        self.vms.lock()[id as usize] = Some(vm.clone());
        info!("VM {} created", id);
        Ok((VmRef::new(vm), id))
    }

    /// Looks up VM `id` and takes a reference on it.
    pub fn get_vm(&self, id: u8) -> Option<VmRef<H>> {
        let vms = self.vms.lock();
        let vm = vms.get(id as usize)?.as_ref()?;
        if vm.try_get() {
            Some(VmRef::new(vm.clone()))
        } else {
            None
        }
    }

    /// Looks up VM `id` without taking a reference.
    ///
    /// The returned VM may be torn down at any time by its last `put_vm`.
    pub fn peek_vm(&self, id: u8) -> Option<Arc<Vm<H>>> {
        let vms = self.vms.lock();
        vms.get(id as usize)?
            .as_ref()
            .filter(|vm| vm.ref_count() > 0)
            .cloned()
    }

    /// Releases a VM reference, returns the count left.
    ///
    /// Dropping the last reference unpublishes the VM, destroys its host
    /// object, tears it down and frees its id.
    pub fn put_vm(&self, vm: VmRef<H>) -> i32 {
        self.release_vm(vm.into_arc())
    }

    fn release_vm(&self, vm: Arc<Vm<H>>) -> i32 {
        let old = vm.ref_count.fetch_sub(1, Ordering::AcqRel);
        if old != 1 {
            if old < 1 {
                error!("VM {}: released with count {}", vm.id(), old);
            }
            return old - 1;
        }

        let id = vm.id();
        {
            let mut vms = self.vms.lock();
            if vms[id as usize]
                .as_ref()
                .is_some_and(|v| Arc::ptr_eq(v, &vm))
            {
                vms[id as usize] = None;
            }
        }
        H::vm_destroy_host(id, vm.host());
        if let Err(err) = vm.teardown() {
            error!("VM {}: teardown on last release failed: {}", id, err);
        }
        self.free_id(id);
        info!("VM {} destroyed", id);
        0
    }

    /// Creates VCPU `vcpu_id` in `vm` and returns the first reference to it.
    pub fn create_vcpu(&self, vm: &VmRef<H>, vcpu_id: u32) -> HvResult<VcpuRef<H>> {
        if !vm.try_get() {
            return Err(HvError::BadState("VM is being destroyed"));
        }
        match self.link_vcpu(vm.arc(), vcpu_id) {
            Ok(vcpu) => {
                info!("VM {}: vCPU {} created", vm.id(), vcpu_id);
                Ok(VcpuRef::new(vcpu))
            }
            Err(err) => {
                warn!("VM {}: failed to create vCPU {}: {}", vm.id(), vcpu_id, err);
                self.release_vm(vm.arc().clone());
                Err(err)
            }
        }
    }

    fn link_vcpu(&self, vm: &Arc<Vm<H>>, vcpu_id: u32) -> HvResult<Arc<Vcpu<H>>> {
        let vmcs = VmxRegion::new(self.ctrl.vmcs_revision_id(), false)?;
        let mut vcpus = vm.vcpus.lock();
        if vm.is_torn_down() {
            return Err(HvError::BadState("VM is torn down"));
        }
        if vcpus.iter().any(|v| v.id() == vcpu_id) {
            return Err(HvError::AlreadyExists);
        }
        let vcpu = Arc::new(Vcpu::new(vcpu_id, vm.clone(), vmcs));
        vcpus.push(vcpu.clone());
        debug!("VM {}: vCPU {} VMCS at {:#x}", vm.id(), vcpu_id, vcpu.vmcs_paddr());
        Ok(vcpu)
    }

    fn find_vcpu(&self, vm_id: u8, vcpu_id: u32, take_ref: bool) -> Option<Arc<Vcpu<H>>> {
        let vm = self.get_vm(vm_id)?;
        let found = {
            let vcpus = vm.vcpus.lock();
            vcpus
                .iter()
                .find(|v| v.id() == vcpu_id)
                .filter(|v| if take_ref { v.try_get() } else { v.ref_count() > 0 })
                .cloned()
        };
        self.put_vm(vm);
        found
    }

    /// Looks up VCPU `vcpu_id` of VM `vm_id` and takes a reference on it.
    pub fn get_vcpu(&self, vm_id: u8, vcpu_id: u32) -> Option<VcpuRef<H>> {
        self.find_vcpu(vm_id, vcpu_id, true).map(VcpuRef::new)
    }

    /// Looks up a VCPU without taking a reference.
    pub fn peek_vcpu(&self, vm_id: u8, vcpu_id: u32) -> Option<Arc<Vcpu<H>>> {
        self.find_vcpu(vm_id, vcpu_id, false)
    }

    /// Releases a VCPU reference, returns the count left.
    ///
    /// Dropping the last reference unlinks the VCPU from its VM, clears its
    /// VMCS on the core it last ran on and releases its VM reference.
    pub fn put_vcpu(&self, vcpu: VcpuRef<H>) -> i32 {
        let vcpu = vcpu.into_arc();
        let old = vcpu.ref_count.fetch_sub(1, Ordering::AcqRel);
        if old != 1 {
            if old < 1 {
                error!("vCPU {}: released with count {}", vcpu.id(), old);
            }
            return old - 1;
        }

        let vm = vcpu.vm().clone();
        vm.vcpus.lock().retain(|v| !Arc::ptr_eq(v, &vcpu));
        if let Err(err) = self.ctrl.release_vcpu(&vcpu) {
            warn!("VM {}: failed to clear VMCS of vCPU {}: {}", vm.id(), vcpu.id(), err);
        }
        info!("VM {}: vCPU {} destroyed", vm.id(), vcpu.id());
        drop(vcpu);
        self.release_vm(vm);
        0
    }

    /// Leaves VMX operation on every core. Refused while any VM is alive.
    pub fn shutdown(&self) -> HvResult {
        let live = self.vm_ids();
        if !live.is_empty() {
            warn!("shutdown with live VMs {:?}", live);
            return Err(HvError::Busy);
        }
        self.ctrl.exit_vmx_all()
    }
}

impl<H: Hal> core::fmt::Debug for VmManager<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmManager")
            .field("vms", &self.vm_ids())
            .field("translation", &self.config.translation)
            .finish()
    }
}
