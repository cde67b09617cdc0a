use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicI32, Ordering};

use spin::Mutex;

use crate::regs::GeneralRegisters;
use crate::vm::Vm;
use crate::vmx::VmxRegion;
use crate::{Hal, HostPhysAddr};

/// State touched on every VM entry.
#[derive(Debug, Default)]
pub(crate) struct VcpuRunState {
    pub regs: GeneralRegisters,
    /// The VMCS is launched on `last_cpu`.
    pub launched: bool,
    /// The core the VMCS is active on.
    pub last_cpu: Option<usize>,
}

/// A virtual CPU of a [`Vm`].
///
/// Holds one counted reference to its VM for as long as it exists.
pub struct Vcpu<H: Hal> {
    id: u32,
    vm: Arc<Vm<H>>,
    pub(crate) ref_count: AtomicI32,
    vmcs: VmxRegion<H>,
    run: Mutex<VcpuRunState>,
}

impl<H: Hal> Vcpu<H> {
    pub(crate) fn new(id: u32, vm: Arc<Vm<H>>, vmcs: VmxRegion<H>) -> Self {
        Self {
            id,
            vm,
            ref_count: AtomicI32::new(1),
            vmcs,
            run: Mutex::new(VcpuRunState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vm(&self) -> &Arc<Vm<H>> {
        &self.vm
    }

    pub fn vm_id(&self) -> u8 {
        self.vm.id()
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn try_get(&self) -> bool {
        if self.ref_count.fetch_add(1, Ordering::AcqRel) <= 0 {
            self.ref_count.fetch_sub(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    pub fn vmcs_paddr(&self) -> HostPhysAddr {
        self.vmcs.phys_addr()
    }

    pub(crate) fn run_state(&self) -> &Mutex<VcpuRunState> {
        &self.run
    }

    pub fn regs(&self) -> GeneralRegisters {
        self.run.lock().regs
    }

    pub fn set_regs(&self, regs: GeneralRegisters) {
        self.run.lock().regs = regs;
    }

    /// The core this VCPU's VMCS is active on.
    pub fn last_cpu(&self) -> Option<usize> {
        self.run.lock().last_cpu
    }

    pub fn is_launched(&self) -> bool {
        self.run.lock().launched
    }
}

impl<H: Hal> core::fmt::Debug for Vcpu<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("vm", &self.vm.id())
            .field("ref_count", &self.ref_count())
            .field("vmcs", &self.vmcs_paddr())
            .finish()
    }
}

/// A counted reference to a [`Vcpu`], released with
/// [`VmManager::put_vcpu`](crate::VmManager::put_vcpu).
#[must_use = "vCPU references must be released with VmManager::put_vcpu"]
pub struct VcpuRef<H: Hal> {
    vcpu: Arc<Vcpu<H>>,
}

impl<H: Hal> VcpuRef<H> {
    pub(crate) fn new(vcpu: Arc<Vcpu<H>>) -> Self {
        Self { vcpu }
    }

    pub(crate) fn into_arc(self) -> Arc<Vcpu<H>> {
        self.vcpu
    }
}

impl<H: Hal> Deref for VcpuRef<H> {
    type Target = Vcpu<H>;

    fn deref(&self) -> &Vcpu<H> {
        &self.vcpu
    }
}

impl<H: Hal> core::fmt::Debug for VcpuRef<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.vcpu.fmt(f)
    }
}
