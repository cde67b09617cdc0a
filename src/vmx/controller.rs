use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use super::features::CpuFeatures;
use super::instructions::InvEptType;
use super::percpu::{StickyErrors, VmxPerCpuState, VmxState};
use super::vmcs::VmxExitInfo;
use crate::p2m::TlbInvalidator;
use crate::vcpu::Vcpu;
use crate::{Hal, HvError, HvResult};

struct PerCpuSlot<H: Hal>(UnsafeCell<VmxPerCpuState<H>>);

// Each slot is only touched by its own core, or through `Hal::run_on_cpu`.
unsafe impl<H: Hal> Sync for PerCpuSlot<H> {}

/// The VMX state of every physical core, and the operations that need more
/// than one core.
pub struct VmxController<H: Hal> {
    cpus: Box<[PerCpuSlot<H>]>,
    vt_enabled: AtomicBool,
    nx_enabled: AtomicBool,
}

impl<H: Hal> VmxController<H> {
    pub fn new() -> Self {
        let cpus = (0..H::cpu_count())
            .map(|cpu| PerCpuSlot(UnsafeCell::new(VmxPerCpuState::new(cpu))))
            .collect();
        Self {
            cpus,
            vt_enabled: AtomicBool::new(false),
            nx_enabled: AtomicBool::new(false),
        }
    }

    /// The state slot of `cpu`.
    ///
    /// # Safety
    ///
    /// The caller must run on `cpu`, or hold every core off the slot (as
    /// [`VmxController::init`] does before any VM exists).
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, cpu: usize) -> &mut VmxPerCpuState<H> {
        unsafe { &mut *self.cpus[cpu].0.get() }
    }

    /// Runs `f` on `cpu` against that core's state.
    fn on_cpu<R>(&self, cpu: usize, mut f: impl FnMut(&mut VmxPerCpuState<H>) -> R) -> R {
        let mut ret = None;
        H::run_on_cpu(cpu, &mut || ret = Some(f(unsafe { self.slot(cpu) })));
        ret.expect("run_on_cpu did not run the callback")
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Probes every core and allocates the per-core VMX regions.
    ///
    /// Must complete before any other method is used.
    pub fn init(&self) -> HvResult {
        let mut vt = !self.cpus.is_empty();
        let mut nx = !self.cpus.is_empty();
        for cpu in 0..self.cpu_count() {
            let features = self.on_cpu(cpu, |state| {
                state.probe();
                state.features()
            });
            vt &= features.contains(CpuFeatures::ENABLE_VT);
            nx &= features.contains(CpuFeatures::ENABLE_NX);
            debug!("CPU {} features: {:?}", cpu, features);

            if features.contains(CpuFeatures::ENABLE_VT) {
                unsafe { self.slot(cpu) }.prepare()?;
            } else {
                warn!("VT is not enabled on CPU {}", cpu);
            }
        }
        self.vt_enabled.store(vt, Ordering::Release);
        self.nx_enabled.store(nx, Ordering::Release);
        info!(
            "VMX controller initialized on {} CPUs: VT {}, NX {}",
            self.cpu_count(),
            vt,
            nx
        );
        Ok(())
    }

    /// Whether every core supports and enables VT.
    pub fn vt_enabled(&self) -> bool {
        self.vt_enabled.load(Ordering::Acquire)
    }

    /// Whether every core supports and enables NX.
    pub fn nx_enabled(&self) -> bool {
        self.nx_enabled.load(Ordering::Acquire)
    }

    pub fn vmcs_revision_id(&self) -> u32 {
        self.on_cpu(H::current_cpu(), |state| state.vmcs_revision_id())
    }

    pub fn features(&self, cpu: usize) -> CpuFeatures {
        self.on_cpu(cpu, |state| state.features())
    }

    pub fn state(&self, cpu: usize) -> VmxState {
        self.on_cpu(cpu, |state| state.state())
    }

    /// Reads the sticky errors of `cpu`, from a schedulable context.
    pub fn sticky_errors(&self, cpu: usize) -> StickyErrors {
        self.on_cpu(cpu, |state| state.sticky_errors())
    }

    /// Reads and clears the sticky errors of `cpu`.
    pub fn take_sticky_errors(&self, cpu: usize) -> StickyErrors {
        self.on_cpu(cpu, |state| state.take_sticky_errors())
    }

    /// Returns the ids of the cores whose sticky errors are not clear.
    pub fn cpus_with_errors(&self) -> Vec<usize> {
        (0..self.cpu_count())
            .filter(|&cpu| !self.sticky_errors(cpu).is_clear())
            .collect()
    }

    /// Enters VMX operation on every core that is not in it yet.
    pub fn enter_vmx_all(&self) -> HvResult {
        let mut result = Ok(());
        for cpu in 0..self.cpu_count() {
            let ret = self.on_cpu(cpu, |state| match state.enter_vmx() {
                Err(HvError::VmxAlreadyEnabled) => Ok(()),
                ret => ret,
            });
            if let Err(err) = ret {
                error!("failed to enable VMX on CPU {}: {}", cpu, err);
                result = result.and(Err(err));
            }
        }
        if result.is_ok() {
            info!("VMX enabled on {} CPUs", self.cpu_count());
        }
        result
    }

    /// Leaves VMX operation on every core that is in it.
    pub fn exit_vmx_all(&self) -> HvResult {
        let mut result = Ok(());
        for cpu in 0..self.cpu_count() {
            let ret = self.on_cpu(cpu, |state| match state.exit_vmx() {
                Err(HvError::VmxNotEnabled) => Ok(()),
                ret => ret,
            });
            if let Err(err) = ret {
                error!("failed to disable VMX on CPU {}: {}", cpu, err);
                result = result.and(Err(err));
            }
        }
        if result.is_ok() {
            info!("VMX disabled on {} CPUs", self.cpu_count());
        }
        result
    }

    /// Runs `vcpu` on the current core until the next VM exit.
    ///
    /// If the VCPU last ran on another core its VMCS is cleared there first,
    /// before preemption is disabled and without holding the VCPU. Nothing
    /// logs while preemption is off; failures are left in the sticky errors
    /// of the core.
    pub fn execute(&self, vcpu: &Vcpu<H>, exit_info: &mut VmxExitInfo) -> HvResult {
        let ret = loop {
            self.detach_vmcs(vcpu, Some(H::current_cpu()))?;
            H::preempt_disable();
            let ret = self.execute_on_current(vcpu, exit_info);
            H::preempt_enable();
            match ret {
                Ok(false) => continue,
                ret => break ret.map(|_| ()),
            }
        };
        if cfg!(feature = "tracing") && ret.is_ok() {
            trace!("VM {} vCPU {} exit: {:#x?}", vcpu.vm_id(), vcpu.id(), exit_info);
        }
        ret
    }

    /// Returns `false` without entering if the VMCS is still active on
    /// another core.
    fn execute_on_current(&self, vcpu: &Vcpu<H>, exit_info: &mut VmxExitInfo) -> HvResult<bool> {
        let cpu = H::current_cpu();
        let vmcs = vcpu.vmcs_paddr();
        let mut run = vcpu.run_state().lock();
        if run.last_cpu.is_some_and(|last| last != cpu) {
            return Ok(false);
        }

        let state = unsafe { self.slot(cpu) };
        if !state.is_vmx_on() {
            state.enter_vmx()?;
        }
        state.load_vmcs(vmcs)?;
        run.last_cpu = Some(cpu);

        let launched = run.launched;
        state.run(&mut run.regs, launched, exit_info)?;
        run.launched = true;
        Ok(true)
    }

    /// Clears the VMCS of `vcpu` on the core it last ran on, unless that core
    /// is `keep_on`. The VCPU is not locked across the cross-core call.
    fn detach_vmcs(&self, vcpu: &Vcpu<H>, keep_on: Option<usize>) -> HvResult {
        let last_cpu = vcpu.run_state().lock().last_cpu;
        let Some(last_cpu) = last_cpu.filter(|&last| Some(last) != keep_on) else {
            return Ok(());
        };
        let vmcs = vcpu.vmcs_paddr();
        self.on_cpu(last_cpu, |state| match state.clear_vmcs(vmcs) {
            Err(HvError::VmxNotEnabled) => Ok(()),
            ret => ret,
        })?;
        let mut run = vcpu.run_state().lock();
        if run.last_cpu == Some(last_cpu) {
            run.last_cpu = None;
            run.launched = false;
        }
        Ok(())
    }

    /// Drops the VMCS of `vcpu` from the core it last ran on.
    pub fn release_vcpu(&self, vcpu: &Vcpu<H>) -> HvResult {
        self.detach_vmcs(vcpu, None)
    }

    /// Invalidates the EPT-derived translations of `eptp` on every VT core.
    ///
    /// Cores outside VMX operation enter it for the duration of the INVEPT.
    pub fn invept_single_context(&self, eptp: u64) -> HvResult {
        let mut result = Ok(());
        for cpu in 0..self.cpu_count() {
            let ret = self.on_cpu(cpu, |state| {
                let features = state.features();
                if !features.contains(CpuFeatures::ENABLE_VT | CpuFeatures::INITIALIZED) {
                    return Ok(());
                }
                if state.is_vmx_on() {
                    return state.invept(InvEptType::SingleContext, eptp);
                }
                state.enter_vmx()?;
                let ret = state.invept(InvEptType::SingleContext, eptp);
                state.exit_vmx().and(ret)
            });
            if let Err(err) = ret {
                warn!("INVEPT({:#x}) failed on CPU {}: {}", eptp, cpu, err);
                result = result.and(Err(err));
            }
        }
        result
    }
}

impl<H: Hal> Default for VmxController<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hal> TlbInvalidator for VmxController<H> {
    fn flush_ept(&self, eptp: u64) -> HvResult {
        self.invept_single_context(eptp)
    }
}

impl<H: Hal> core::fmt::Debug for VmxController<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmxController")
            .field("cpus", &self.cpu_count())
            .field("vt_enabled", &self.vt_enabled())
            .field("nx_enabled", &self.nx_enabled())
            .finish()
    }
}
