use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;
use x86_64::registers::control::Cr4Flags;

use super::features::{CpuFeatures, PmuInfo, VmmFlags};
use super::hstate::HostState;
use super::instructions::{InvEptType, VmxInstructions};
use super::structs::VmxRegion;
use super::vmcs::VmxExitInfo;
use crate::error::VmxFail;
use crate::msr::{FeatureControl, FeatureControlFlags, Msr, VmxBasic};
use crate::regs::GeneralRegisters;
use crate::{Hal, HostPhysAddr, HvError, HvResult};

/// Position of one core in the VMX enablement state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxState {
    /// Nothing is known about the core yet.
    Uninitialized,
    /// Features probed, core is outside VMX operation.
    Probed,
    /// VMXON executed, no VMCS is current.
    VmxEnabled,
    /// A VMCS is current on this core.
    VmcsLoaded,
    /// Between VM entry and VM exit.
    Running,
}

/// Failures recorded on code paths that must not log.
///
/// Each field holds the latest failure of its kind until it is cleared.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StickyErrors {
    pub vmxon: Option<VmxFail>,
    pub vmxoff: Option<VmxFail>,
    pub invept: Option<VmxFail>,
    pub entry: Option<VmxFail>,
}

impl StickyErrors {
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

/// Represents the per-CPU state for Virtual Machine Extensions (VMX).
///
/// Every method acts on the physical core the caller is running on, and must
/// only be invoked on the core that owns this state. None of them logs.
#[derive(Debug)]
pub struct VmxPerCpuState<H: Hal> {
    cpu_id: usize,
    state: VmxState,

    /// Capabilities found by [`VmxPerCpuState::probe`].
    features: CpuFeatures,
    pmu: PmuInfo,
    vmm_flags: VmmFlags,

    /// The VMCS revision identifier read from IA32_VMX_BASIC.
    vmcs_revision_id: u32,

    /// The VMXON region of this core.
    vmxon_region: VmxRegion<H>,

    /// Save area for the host state around VM entries.
    host_state: HostState<H>,

    /// Whether CR4.VMXE was already set by the host before we enabled VMX.
    host_cr4_vmxe: bool,

    /// Physical address of the VMCS current on this core.
    current_vmcs: Option<HostPhysAddr>,

    errors: StickyErrors,
}

impl<H: Hal> VmxPerCpuState<H> {
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            state: VmxState::Uninitialized,
            features: CpuFeatures::empty(),
            pmu: PmuInfo::default(),
            vmm_flags: VmmFlags::empty(),
            vmcs_revision_id: 0,
            vmxon_region: unsafe { VmxRegion::uninit() },
            host_state: unsafe { HostState::uninit() },
            host_cr4_vmxe: false,
            current_vmcs: None,
            errors: StickyErrors::default(),
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn state(&self) -> VmxState {
        self.state
    }

    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    pub fn pmu(&self) -> PmuInfo {
        self.pmu
    }

    pub fn vmcs_revision_id(&self) -> u32 {
        self.vmcs_revision_id
    }

    pub fn current_vmcs(&self) -> Option<HostPhysAddr> {
        self.current_vmcs
    }

    pub fn is_vmx_on(&self) -> bool {
        self.vmm_flags.contains(VmmFlags::VMXON)
    }

    pub fn sticky_errors(&self) -> StickyErrors {
        self.errors
    }

    pub fn take_sticky_errors(&mut self) -> StickyErrors {
        core::mem::take(&mut self.errors)
    }

    /// Reads the capabilities of this core. Does not allocate.
    pub fn probe(&mut self) {
        self.features = CpuFeatures::probe::<H::Vmx>();
        self.pmu = PmuInfo::probe::<H::Vmx>();

        // Get VMCS revision identifier in IA32_VMX_BASIC MSR.
        if self.features.contains(CpuFeatures::ENABLE_VT) {
            let vmx_basic = VmxBasic::read::<H::Vmx>();
            if vmx_basic.region_size as usize == PAGE_SIZE
                && vmx_basic.mem_type == VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK
                && !vmx_basic.is_32bit_address
            {
                self.vmcs_revision_id = vmx_basic.revision_id;
            } else {
                self.features.remove(CpuFeatures::ENABLE_VT);
            }
        }
        if self.state == VmxState::Uninitialized {
            self.state = VmxState::Probed;
        }
    }

    /// Allocates the VMXON region and the host save area.
    ///
    /// Must run from a schedulable context after [`VmxPerCpuState::probe`].
    pub fn prepare(&mut self) -> HvResult {
        if self.state == VmxState::Uninitialized {
            return Err(HvError::BadState("core has not been probed"));
        }
        if !self.features.contains(CpuFeatures::ENABLE_VT) {
            return Err(HvError::Unsupported("VT is not enabled on this core"));
        }
        if self.features.contains(CpuFeatures::INITIALIZED) {
            return Ok(());
        }
        let vmxon_region = VmxRegion::new(self.vmcs_revision_id, false)?;
        let host_state = HostState::new(&self.pmu)?;
        self.vmxon_region = vmxon_region;
        self.host_state = host_state;
        self.features |= CpuFeatures::INITIALIZED;
        Ok(())
    }

    /// Brings this core into VMX root operation.
    pub fn enter_vmx(&mut self) -> HvResult {
        match self.state {
            VmxState::Uninitialized => return Err(HvError::BadState("core has not been probed")),
            VmxState::Probed => {}
            _ => return Err(HvError::VmxAlreadyEnabled),
        }
        if !self.features.contains(CpuFeatures::ENABLE_VT) {
            return Err(HvError::Unsupported("VT is not enabled on this core"));
        }
        if !self.features.contains(CpuFeatures::INITIALIZED) {
            return Err(HvError::BadState("VMXON region is not allocated"));
        }

        // Enable VMXON, if required.
        let ctrl = FeatureControl::read::<H::Vmx>();
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            FeatureControl::write::<H::Vmx>(
                ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
            )
        } else if !vmxon_outside {
            return Err(HvError::Unsupported("VMX disabled by BIOS"));
        }

        let cr4 = H::Vmx::read_cr4();
        let vmxe = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();

        // Check control registers are in a VMX-friendly state. (SDM Vol. 3C, Appendix A.7, A.8)
        macro_rules! cr_is_valid {
            ($value: expr, $crx: ident) => {{
                use Msr::*;
                let value = $value;
                paste::paste! {
                    let fixed0 = [<IA32_VMX_ $crx _FIXED0>].read::<H::Vmx>();
                    let fixed1 = [<IA32_VMX_ $crx _FIXED1>].read::<H::Vmx>();
                }
                (value & fixed0) == fixed0 && (value & !fixed1) == 0
            }};
        }
        if !cr_is_valid!(H::Vmx::read_cr0(), CR0) {
            return Err(HvError::BadState("host CR0 is not valid in VMX operation"));
        }
        if !cr_is_valid!(cr4 | vmxe, CR4) {
            return Err(HvError::BadState("host CR4 is not valid in VMX operation"));
        }

        self.host_cr4_vmxe = cr4 & vmxe != 0;
        unsafe {
            // Enable VMX using the VMXE bit.
            if !self.host_cr4_vmxe {
                H::Vmx::write_cr4(cr4 | vmxe);
            }
            // Execute VMXON.
            if let Err(fail) = H::Vmx::vmxon(self.vmxon_region.phys_addr().as_usize() as u64) {
                if !self.host_cr4_vmxe {
                    H::Vmx::write_cr4(cr4);
                }
                self.errors.vmxon = Some(fail);
                return Err(HvError::VmxonFail(fail));
            }
        }

        self.vmm_flags |= VmmFlags::VMXON;
        self.state = VmxState::VmxEnabled;
        Ok(())
    }

    /// Leaves VMX operation, clearing the current VMCS first.
    pub fn exit_vmx(&mut self) -> HvResult {
        if !self.is_vmx_on() {
            return Err(HvError::VmxNotEnabled);
        }
        if let Some(vmcs) = self.current_vmcs {
            self.clear_vmcs(vmcs)?;
        }

        unsafe {
            // Execute VMXOFF.
            if let Err(fail) = H::Vmx::vmxoff() {
                self.errors.vmxoff = Some(fail);
                return Err(HvError::VmxoffFail(fail));
            }
            // Remove VMXE bit in CR4, unless the host owned it.
            if !self.host_cr4_vmxe {
                let cr4 = H::Vmx::read_cr4();
                H::Vmx::write_cr4(cr4 & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
            }
        }

        self.vmm_flags.remove(VmmFlags::VMXON);
        self.state = VmxState::Probed;
        Ok(())
    }

    /// Makes `vmcs` the current VMCS of this core.
    pub fn load_vmcs(&mut self, vmcs: HostPhysAddr) -> HvResult {
        if !self.is_vmx_on() {
            return Err(HvError::VmxNotEnabled);
        }
        if self.current_vmcs == Some(vmcs) {
            return Ok(());
        }
        unsafe { H::Vmx::vmptrld(vmcs.as_usize() as u64) }.map_err(HvError::VmptrldFail)?;
        self.current_vmcs = Some(vmcs);
        self.state = VmxState::VmcsLoaded;
        Ok(())
    }

    /// Flushes `vmcs` to memory and makes it inactive and not launched.
    pub fn clear_vmcs(&mut self, vmcs: HostPhysAddr) -> HvResult {
        if !self.is_vmx_on() {
            return Err(HvError::VmxNotEnabled);
        }
        unsafe { H::Vmx::vmclear(vmcs.as_usize() as u64) }.map_err(HvError::VmclearFail)?;
        if self.current_vmcs == Some(vmcs) {
            self.current_vmcs = None;
            self.state = VmxState::VmxEnabled;
        }
        Ok(())
    }

    /// Performs one VM entry with the current VMCS and fills `exit_info` from
    /// the following VM exit.
    ///
    /// `launched` selects VMRESUME over VMLAUNCH.
    pub fn run(
        &mut self,
        regs: &mut GeneralRegisters,
        launched: bool,
        exit_info: &mut VmxExitInfo,
    ) -> HvResult {
        if self.state != VmxState::VmcsLoaded {
            return Err(HvError::BadState("no VMCS is loaded on this core"));
        }

        self.state = VmxState::Running;
        self.host_state.save();
        let entered = unsafe { H::Vmx::vm_enter(regs, launched) };
        self.host_state.restore();
        self.state = VmxState::VmcsLoaded;

        let captured = entered.and_then(|_| unsafe { exit_info.capture::<H::Vmx>() });
        match captured {
            Ok(()) => Ok(()),
            Err(fail) => {
                self.errors.entry = Some(fail);
                exit_info.record_entry_error(fail);
                Err(if launched {
                    HvError::VmResumeFail(fail)
                } else {
                    HvError::VmLaunchFail(fail)
                })
            }
        }
    }

    /// Executes INVEPT on this core.
    pub fn invept(&mut self, kind: InvEptType, eptp: u64) -> HvResult {
        if !self.is_vmx_on() {
            return Err(HvError::VmxNotEnabled);
        }
        unsafe { H::Vmx::invept(kind, eptp) }.map_err(|fail| {
            self.errors.invept = Some(fail);
            HvError::InveptFail(fail)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockCpu, MockHal};

    fn ready_state() -> VmxPerCpuState<MockHal> {
        MockCpu::reset(1);
        let mut state = VmxPerCpuState::<MockHal>::new(0);
        state.probe();
        state.prepare().unwrap();
        state
    }

    #[test]
    fn test_vmx_per_cpu_state_new() {
        let state = VmxPerCpuState::<MockHal>::new(3);
        assert_eq!(state.cpu_id(), 3);
        assert_eq!(state.state(), VmxState::Uninitialized);
        assert_eq!(state.vmcs_revision_id(), 0);
        assert!(!state.is_vmx_on());
        assert!(state.sticky_errors().is_clear());
    }

    #[test]
    fn test_enter_requires_probe() {
        MockCpu::reset(1);
        let mut state = VmxPerCpuState::<MockHal>::new(0);
        assert!(matches!(state.enter_vmx(), Err(HvError::BadState(_))));
        assert_eq!(state.state(), VmxState::Uninitialized);
    }

    #[test]
    fn test_probe_and_prepare() {
        let state = ready_state();
        assert_eq!(state.state(), VmxState::Probed);
        assert_eq!(state.vmcs_revision_id(), MockCpu::REVISION_ID);
        assert!(state.features().contains(CpuFeatures::INITIALIZED));
    }

    #[test]
    fn test_enter_and_exit_vmx() {
        let mut state = ready_state();
        state.enter_vmx().unwrap();
        assert_eq!(state.state(), VmxState::VmxEnabled);
        assert!(state.is_vmx_on());
        MockCpu::with(|cpu| {
            assert!(cpu.vmx_on);
            assert_ne!(cpu.cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);
            // Unlocked feature control gets locked with VMXON allowed.
            assert_eq!(cpu.msr(Msr::IA32_FEATURE_CONTROL.index()) & 0b101, 0b101);
        });

        assert_eq!(state.enter_vmx(), Err(HvError::VmxAlreadyEnabled));

        state.exit_vmx().unwrap();
        assert_eq!(state.state(), VmxState::Probed);
        MockCpu::with(|cpu| {
            assert!(!cpu.vmx_on);
            assert_eq!(cpu.cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);
        });
        assert_eq!(state.exit_vmx(), Err(HvError::VmxNotEnabled));
    }

    #[test]
    fn test_host_owned_vmxe_is_kept() {
        let mut state = ready_state();
        MockCpu::with(|cpu| cpu.cr4 |= Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
        state.enter_vmx().unwrap();
        state.exit_vmx().unwrap();
        MockCpu::with(|cpu| {
            assert_ne!(cpu.cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);
        });
    }

    #[test]
    fn test_vmxon_failure_keeps_state() {
        let mut state = ready_state();
        MockCpu::with(|cpu| cpu.faults.vmxon = Some(VmxFail::VmFailInvalid));
        assert_eq!(
            state.enter_vmx(),
            Err(HvError::VmxonFail(VmxFail::VmFailInvalid))
        );
        assert_eq!(state.state(), VmxState::Probed);
        assert!(!state.is_vmx_on());
        assert_eq!(state.sticky_errors().vmxon, Some(VmxFail::VmFailInvalid));
        MockCpu::with(|cpu| {
            assert_eq!(cpu.cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(), 0);
        });

        assert_eq!(state.take_sticky_errors().vmxon, Some(VmxFail::VmFailInvalid));
        assert!(state.sticky_errors().is_clear());
    }

    #[test]
    fn test_vmx_locked_off_by_bios() {
        let mut state = ready_state();
        MockCpu::with(|cpu| cpu.set_msr(Msr::IA32_FEATURE_CONTROL.index(), 0b011));
        assert!(matches!(state.enter_vmx(), Err(HvError::Unsupported(_))));
        assert_eq!(state.state(), VmxState::Probed);
    }

    #[test]
    fn test_invalid_host_cr0() {
        let mut state = ready_state();
        MockCpu::with(|cpu| cpu.cr0 &= !1);
        assert!(matches!(state.enter_vmx(), Err(HvError::BadState(_))));
        assert!(!state.is_vmx_on());
    }

    #[test]
    fn test_vmxoff_failure_keeps_state() {
        let mut state = ready_state();
        state.enter_vmx().unwrap();
        MockCpu::with(|cpu| cpu.faults.vmxoff = Some(VmxFail::VmFailValid(23)));
        assert_eq!(
            state.exit_vmx(),
            Err(HvError::VmxoffFail(VmxFail::VmFailValid(23)))
        );
        assert_eq!(state.state(), VmxState::VmxEnabled);
        assert_eq!(state.sticky_errors().vmxoff, Some(VmxFail::VmFailValid(23)));
    }

    #[test]
    fn test_load_vmcs_skips_current() {
        let mut state = ready_state();
        let vmcs = VmxRegion::<MockHal>::new(MockCpu::REVISION_ID, false).unwrap();
        assert_eq!(state.load_vmcs(vmcs.phys_addr()), Err(HvError::VmxNotEnabled));

        state.enter_vmx().unwrap();
        state.load_vmcs(vmcs.phys_addr()).unwrap();
        state.load_vmcs(vmcs.phys_addr()).unwrap();
        assert_eq!(state.state(), VmxState::VmcsLoaded);
        assert_eq!(MockCpu::with(|cpu| cpu.counts.vmptrld), 1);

        state.clear_vmcs(vmcs.phys_addr()).unwrap();
        assert_eq!(state.state(), VmxState::VmxEnabled);
        assert_eq!(state.current_vmcs(), None);
    }

    #[test]
    fn test_load_vmcs_rejected() {
        let mut state = ready_state();
        state.enter_vmx().unwrap();
        let vmcs = VmxRegion::<MockHal>::new(MockCpu::REVISION_ID + 1, false).unwrap();
        assert_eq!(
            state.load_vmcs(vmcs.phys_addr()),
            Err(HvError::VmptrldFail(VmxFail::VmFailValid(11)))
        );
        assert_eq!(state.state(), VmxState::VmxEnabled);
    }

    #[test]
    fn test_run_launch_then_resume() {
        let mut state = ready_state();
        state.enter_vmx().unwrap();
        let vmcs = VmxRegion::<MockHal>::new(MockCpu::REVISION_ID, false).unwrap();
        state.load_vmcs(vmcs.phys_addr()).unwrap();

        let mut regs = GeneralRegisters::default();
        let mut exit_info = VmxExitInfo::default();
        MockCpu::script_exit(10, 0, 0);
        state.run(&mut regs, false, &mut exit_info).unwrap();
        assert_eq!(exit_info.exit_reason, 10);
        assert!(exit_info.vmx_error.is_none());
        assert_eq!(regs.rax, 1);

        // A second VMLAUNCH on a launched VMCS fails.
        assert_eq!(
            state.run(&mut regs, false, &mut exit_info),
            Err(HvError::VmLaunchFail(VmxFail::VmFailValid(4)))
        );
        assert_eq!(exit_info.vmx_error, Some(VmxFail::VmFailValid(4)));
        assert_eq!(state.sticky_errors().entry, Some(VmxFail::VmFailValid(4)));
        assert_eq!(state.state(), VmxState::VmcsLoaded);

        MockCpu::script_exit(48, 0x182, 0x8000_1000);
        state.run(&mut regs, true, &mut exit_info).unwrap();
        assert_eq!(exit_info.exit_qualification, 0x182);
        assert_eq!(exit_info.guest_phys_addr, 0x8000_1000);
        assert_eq!(regs.rax, 2);

        // The host state was saved before and restored after every entry.
        MockCpu::with(|cpu| {
            assert_eq!(cpu.counts.fxsave, 3);
            assert_eq!(cpu.counts.fxrstor, 3);
        });
    }

    #[test]
    fn test_run_without_vmcs() {
        let mut state = ready_state();
        state.enter_vmx().unwrap();
        let mut regs = GeneralRegisters::default();
        let mut exit_info = VmxExitInfo::default();
        assert!(matches!(
            state.run(&mut regs, false, &mut exit_info),
            Err(HvError::BadState(_))
        ));
    }

    #[test]
    fn test_invept_failure_is_sticky() {
        let mut state = ready_state();
        assert_eq!(
            state.invept(InvEptType::SingleContext, 0x1000),
            Err(HvError::VmxNotEnabled)
        );
        state.enter_vmx().unwrap();
        state.invept(InvEptType::SingleContext, 0x1000).unwrap();
        MockCpu::with(|cpu| cpu.faults.invept = Some(VmxFail::VmFailValid(28)));
        assert_eq!(
            state.invept(InvEptType::SingleContext, 0x1000),
            Err(HvError::InveptFail(VmxFail::VmFailValid(28)))
        );
        assert_eq!(state.sticky_errors().invept, Some(VmxFail::VmFailValid(28)));
    }
}
