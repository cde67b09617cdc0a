use super::features::{PmuInfo, has_rdtscp};
use super::instructions::{HostSegments, VmxInstructions};
use crate::frame::PhysFrame;
use crate::msr::Msr;
use crate::{Hal, HvResult};

/// Upper bound of architectural general-purpose counters saved per core.
pub const MAX_GP_COUNTERS: usize = 8;

/// Host state that a VM exit does not restore by itself, saved before every
/// VM entry on a core and restored right after the exit.
#[derive(Debug)]
pub struct HostState<H: Hal> {
    segments: HostSegments,

    efer: u64,
    fs_base: u64,
    gs_base: u64,
    kernel_gs_base: u64,
    tsc_aux: u64,
    has_rdtscp: bool,

    pmc: [u64; MAX_GP_COUNTERS],
    perfevtsel: [u64; MAX_GP_COUNTERS],
    num_counters: usize,

    /// FXSAVE image of the host FPU/SSE state.
    fx_page: PhysFrame<H>,
}

impl<H: Hal> HostState<H> {
    pub const unsafe fn uninit() -> Self {
        Self {
            segments: HostSegments {
                ldt: 0,
                ds: 0,
                es: 0,
                fs: 0,
                gs: 0,
                gdtr: super::instructions::DescriptorTable { base: 0, limit: 0 },
                idtr: super::instructions::DescriptorTable { base: 0, limit: 0 },
            },
            efer: 0,
            fs_base: 0,
            gs_base: 0,
            kernel_gs_base: 0,
            tsc_aux: 0,
            has_rdtscp: false,
            pmc: [0; MAX_GP_COUNTERS],
            perfevtsel: [0; MAX_GP_COUNTERS],
            num_counters: 0,
            fx_page: unsafe { PhysFrame::uninit() },
        }
    }

    /// Prepares the save area of the calling core.
    pub fn new(pmu: &PmuInfo) -> HvResult<Self> {
        let mut state = unsafe { Self::uninit() };
        state.fx_page = PhysFrame::alloc_zero()?;
        state.num_counters = (pmu.num_counters as usize).min(MAX_GP_COUNTERS);
        state.has_rdtscp = has_rdtscp::<H::Vmx>();
        Ok(state)
    }

    pub fn is_initialized(&self) -> bool {
        self.fx_page.is_allocated()
    }

    /// Saves the host state of the calling core.
    ///
    /// Runs on the VM-entry path: no logging, no locks.
    pub fn save(&mut self) {
        self.segments = H::Vmx::save_segments();
        self.efer = Msr::IA32_EFER.read::<H::Vmx>();
        self.fs_base = Msr::IA32_FS_BASE.read::<H::Vmx>();
        self.gs_base = Msr::IA32_GS_BASE.read::<H::Vmx>();
        self.kernel_gs_base = Msr::IA32_KERNEL_GSBASE.read::<H::Vmx>();
        if self.has_rdtscp {
            self.tsc_aux = Msr::IA32_TSC_AUX.read::<H::Vmx>();
        }
        for i in 0..self.num_counters {
            self.perfevtsel[i] = H::Vmx::read_msr(Msr::IA32_PERFEVTSEL0.index() + i as u32);
            self.pmc[i] = H::Vmx::read_msr(Msr::IA32_PMC0.index() + i as u32);
        }
        unsafe { H::Vmx::fxsave(self.fx_page.as_mut_ptr()) };
    }

    /// Restores what [`HostState::save`] captured.
    ///
    /// Segment selectors go first: reloading FS/GS clobbers their bases.
    pub fn restore(&self) {
        unsafe {
            H::Vmx::restore_segments(&self.segments);
            Msr::IA32_EFER.write::<H::Vmx>(self.efer);
            Msr::IA32_FS_BASE.write::<H::Vmx>(self.fs_base);
            Msr::IA32_GS_BASE.write::<H::Vmx>(self.gs_base);
            Msr::IA32_KERNEL_GSBASE.write::<H::Vmx>(self.kernel_gs_base);
            if self.has_rdtscp {
                Msr::IA32_TSC_AUX.write::<H::Vmx>(self.tsc_aux);
            }
            for i in 0..self.num_counters {
                H::Vmx::write_msr(Msr::IA32_PERFEVTSEL0.index() + i as u32, self.perfevtsel[i]);
                H::Vmx::write_msr(Msr::IA32_PMC0.index() + i as u32, self.pmc[i]);
            }
            H::Vmx::fxrstor(self.fx_page.as_mut_ptr());
        }
    }
}
