//! A simulated machine for unit tests.
//!
//! Every test thread owns its own machine: a set of cores with MSRs, control
//! registers and VMX state, a VMCS field store and a fake `vmap` space.
//! [`MockHal::run_on_cpu`] switches the "current" core for the duration of
//! the callback.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::vec::Vec;

use raw_cpuid::CpuIdResult;

use crate::error::VmxFail;
use crate::msr::Msr;
use crate::p2m::TlbInvalidator;
use crate::regs::GeneralRegisters;
use crate::vmx::{DescriptorTable, HostSegments, InvEptType, VmcsField, VmxInstructions};
use crate::{Hal, HostPhysAddr, HostVirtAddr, HvError, HvResult};

#[repr(C, align(4096))]
struct Frame([u8; 0x1000]);

const FRAME_LAYOUT: Layout = Layout::new::<Frame>();

const VMAP_BASE: usize = 0xffff_c900_0000_0000;

const CR4_VMXE: u64 = 1 << 13;

/// One simulated core.
#[derive(Debug, Clone)]
pub struct MockCpu {
    pub has_vmx: bool,
    msrs: HashMap<u32, u64>,
    pub cr0: u64,
    pub cr4: u64,
    pub vmx_on: bool,
    pub current_vmcs: Option<u64>,
    pub segments: HostSegments,
    pub last_invept: Option<(InvEptType, u64)>,
    pub counts: Counts,
    pub faults: Faults,
}

/// Instructions executed by one core.
#[derive(Debug, Default, Clone)]
pub struct Counts {
    pub fxsave: usize,
    pub fxrstor: usize,
    pub vmptrld: usize,
    pub vmclear: usize,
    pub vm_entry: usize,
    pub invept: usize,
}

/// Failures injected into the instructions of one core.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub vmxon: Option<VmxFail>,
    pub vmxoff: Option<VmxFail>,
    pub invept: Option<VmxFail>,
    pub vm_enter: Option<VmxFail>,
}

/// Machine-wide state shared by the simulated cores.
#[derive(Debug)]
pub struct MockMachine {
    pub cpus: Vec<MockCpu>,
    pub current: usize,
    /// Depth of the `preempt_disable` sections of the calling thread.
    pub preempt_count: usize,
    /// VMCS contents, by VMCS physical address and field encoding.
    vmcs_fields: HashMap<(u64, u32), u64>,
    launched: HashSet<u64>,
    /// Exit reason, qualification and guest physical address of the next exits.
    scripted_exit: (u32, u64, u64),
    vmaps: HashMap<usize, usize>,
    next_vmap: usize,
    pub fail_vm_create_host: bool,
    pub destroyed_hosts: Vec<(u8, usize)>,
}

thread_local! {
    static MACHINE: RefCell<MockMachine> = RefCell::new(MockMachine::new(1));
}

impl MockMachine {
    fn new(cpus: usize) -> Self {
        Self {
            cpus: (0..cpus).map(|_| MockCpu::new()).collect(),
            current: 0,
            preempt_count: 0,
            vmcs_fields: HashMap::new(),
            launched: HashSet::new(),
            scripted_exit: (1, 0, 0),
            vmaps: HashMap::new(),
            next_vmap: VMAP_BASE,
            fail_vm_create_host: false,
            destroyed_hosts: Vec::new(),
        }
    }

    /// Runs `f` against the machine of the calling thread.
    pub fn with<R>(f: impl FnOnce(&mut MockMachine) -> R) -> R {
        MACHINE.with(|m| f(&mut m.borrow_mut()))
    }

    fn cpu(&mut self) -> &mut MockCpu {
        let current = self.current;
        &mut self.cpus[current]
    }
}

impl MockCpu {
    pub const REVISION_ID: u32 = 0x12;

    fn new() -> Self {
        let vmx_basic = Self::REVISION_ID as u64 | (0x1000 << 32) | (6 << 50);
        let msrs = HashMap::from([
            (Msr::IA32_FEATURE_CONTROL.index(), 0),
            // LME | LMA | NXE
            (Msr::IA32_EFER.index(), (1 << 8) | (1 << 10) | (1 << 11)),
            (Msr::IA32_VMX_BASIC.index(), vmx_basic),
            (Msr::IA32_VMX_CR0_FIXED0.index(), 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1.index(), 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0.index(), CR4_VMXE),
            (Msr::IA32_VMX_CR4_FIXED1.index(), 0x003f_ffff),
        ]);
        Self {
            has_vmx: true,
            msrs,
            cr0: 0x8005_0033,
            cr4: 0x0000_06f0,
            vmx_on: false,
            current_vmcs: None,
            segments: HostSegments {
                gdtr: DescriptorTable {
                    base: 0xffff_fe00_0000_1000,
                    limit: 0x7f,
                },
                ..Default::default()
            },
            last_invept: None,
            counts: Counts::default(),
            faults: Faults::default(),
        }
    }

    pub fn msr(&self, index: u32) -> u64 {
        self.msrs.get(&index).copied().unwrap_or(0)
    }

    pub fn set_msr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);
    }

    /// Replaces the machine of the calling thread with `cpus` fresh cores.
    pub fn reset(cpus: usize) {
        MockMachine::with(|m| *m = MockMachine::new(cpus));
    }

    /// Runs `f` against the current core.
    pub fn with<R>(f: impl FnOnce(&mut MockCpu) -> R) -> R {
        MockMachine::with(|m| f(m.cpu()))
    }

    /// Runs `f` against core `cpu`.
    pub fn with_cpu<R>(cpu: usize, f: impl FnOnce(&mut MockCpu) -> R) -> R {
        MockMachine::with(|m| f(&mut m.cpus[cpu]))
    }

    /// Sets what the following VM exits report.
    pub fn script_exit(reason: u32, qualification: u64, guest_phys_addr: u64) {
        MockMachine::with(|m| m.scripted_exit = (reason, qualification, guest_phys_addr));
    }

    /// Number of `vmap` mappings not released yet.
    pub fn live_vmaps() -> usize {
        MockMachine::with(|m| m.vmaps.len())
    }
}

/// Host kernel services backed by the thread's [`MockMachine`].
#[derive(Debug)]
pub struct MockHal;

impl Hal for MockHal {
    type Vmx = MockVmx;

    fn alloc_frame() -> Option<HostPhysAddr> {
        let ptr = unsafe { alloc_zeroed(FRAME_LAYOUT) };
        if ptr.is_null() {
            None
        } else {
            Some(HostPhysAddr::from_usize(ptr as usize))
        }
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        unsafe { dealloc(paddr.as_usize() as *mut u8, FRAME_LAYOUT) }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from_usize(paddr.as_usize())
    }

    fn vmap(paddr: HostPhysAddr) -> Option<HostVirtAddr> {
        MockMachine::with(|m| {
            let hva = m.next_vmap;
            m.next_vmap += 0x1000;
            m.vmaps.insert(hva, paddr.as_usize());
            Some(HostVirtAddr::from_usize(hva))
        })
    }

    fn vunmap(vaddr: HostVirtAddr) {
        let removed = MockMachine::with(|m| m.vmaps.remove(&vaddr.as_usize()));
        assert!(removed.is_some(), "vunmap of unknown mapping {:#x}", vaddr);
    }

    fn cpu_count() -> usize {
        MockMachine::with(|m| m.cpus.len())
    }

    fn current_cpu() -> usize {
        MockMachine::with(|m| m.current)
    }

    fn run_on_cpu(cpu: usize, f: &mut dyn FnMut()) {
        let prev = MockMachine::with(|m| {
            assert!(cpu < m.cpus.len(), "no CPU {}", cpu);
            assert_eq!(m.preempt_count, 0, "cross-core call with preemption disabled");
            core::mem::replace(&mut m.current, cpu)
        });
        f();
        MockMachine::with(|m| m.current = prev);
    }

    fn preempt_disable() {
        MockMachine::with(|m| m.preempt_count += 1);
    }

    fn preempt_enable() {
        MockMachine::with(|m| m.preempt_count -= 1);
    }

    fn vm_create_host(vm_id: u8) -> HvResult<usize> {
        MockMachine::with(|m| {
            if m.fail_vm_create_host {
                return Err(HvError::NoMemory);
            }
            Ok(0x1000 * (vm_id as usize + 1))
        })
    }

    fn vm_destroy_host(vm_id: u8, host: usize) {
        MockMachine::with(|m| m.destroyed_hosts.push((vm_id, host)));
    }
}

/// VMX instructions executed against the current simulated core.
#[derive(Debug)]
pub struct MockVmx;

impl MockVmx {
    fn current_vmcs() -> Result<u64, VmxFail> {
        MockCpu::with(|cpu| cpu.current_vmcs).ok_or(VmxFail::VmFailInvalid)
    }

    /// Fails with VMfailValid, leaving `error` in the current VMCS.
    fn fail_valid(vmcs: u64, error: u32) -> Result<(), VmxFail> {
        MockMachine::with(|m| {
            m.vmcs_fields
                .insert((vmcs, VmcsField::VM_INSTRUCTION_ERROR.into()), error as u64)
        });
        Err(VmxFail::VmFailValid(error))
    }
}

impl VmxInstructions for MockVmx {
    fn cpuid(leaf: u32, _subleaf: u32) -> CpuIdResult {
        let has_vmx = MockCpu::with(|cpu| cpu.has_vmx);
        let (eax, ebx, ecx, edx) = match leaf {
            // "GenuineIntel"
            0 => (0x16, 0x756e_6547, 0x6c65_746e, 0x4965_6e69),
            1 => (0x0009_06ea, 0, if has_vmx { 1 << 5 } else { 0 }, 0),
            // version 4, 4 counters of 48 bits; 3 fixed counters of 48 bits
            0xa => (0x0030_0404, 0, 0, (48 << 5) | 3),
            0x8000_0000 => (0x8000_0008, 0, 0, 0),
            0x8000_0001 => (0, 0, 0, (1 << 20) | (1 << 27) | (1 << 29)),
            _ => (0, 0, 0, 0),
        };
        CpuIdResult { eax, ebx, ecx, edx }
    }

    fn read_msr(msr: u32) -> u64 {
        MockCpu::with(|cpu| cpu.msr(msr))
    }

    unsafe fn write_msr(msr: u32, value: u64) {
        MockCpu::with(|cpu| cpu.set_msr(msr, value));
    }

    fn read_cr0() -> u64 {
        MockCpu::with(|cpu| cpu.cr0)
    }

    fn read_cr4() -> u64 {
        MockCpu::with(|cpu| cpu.cr4)
    }

    unsafe fn write_cr4(value: u64) {
        MockCpu::with(|cpu| cpu.cr4 = value);
    }

    unsafe fn vmxon(paddr: u64) -> Result<(), VmxFail> {
        let revision = unsafe { *(paddr as *const u32) };
        MockCpu::with(|cpu| {
            if let Some(fail) = cpu.faults.vmxon {
                return Err(fail);
            }
            if cpu.vmx_on || cpu.cr4 & CR4_VMXE == 0 || revision & 0x7fff_ffff != MockCpu::REVISION_ID {
                return Err(VmxFail::VmFailInvalid);
            }
            cpu.vmx_on = true;
            Ok(())
        })
    }

    unsafe fn vmxoff() -> Result<(), VmxFail> {
        MockCpu::with(|cpu| {
            if let Some(fail) = cpu.faults.vmxoff {
                return Err(fail);
            }
            if !cpu.vmx_on {
                return Err(VmxFail::VmFailInvalid);
            }
            cpu.vmx_on = false;
            cpu.current_vmcs = None;
            Ok(())
        })
    }

    unsafe fn vmclear(paddr: u64) -> Result<(), VmxFail> {
        MockMachine::with(|m| {
            let cpu = m.cpu();
            if !cpu.vmx_on {
                return Err(VmxFail::VmFailInvalid);
            }
            cpu.counts.vmclear += 1;
            if cpu.current_vmcs == Some(paddr) {
                cpu.current_vmcs = None;
            }
            m.launched.remove(&paddr);
            Ok(())
        })
    }

    unsafe fn vmptrld(paddr: u64) -> Result<(), VmxFail> {
        let revision = unsafe { *(paddr as *const u32) } & 0x7fff_ffff;
        MockCpu::with(|cpu| match (cpu.vmx_on, revision == MockCpu::REVISION_ID) {
            (false, _) => Err(VmxFail::VmFailInvalid),
            // VMPTRLD_INCORRECT_REVISION
            (true, false) => Err(VmxFail::VmFailValid(11)),
            (true, true) => {
                cpu.counts.vmptrld += 1;
                cpu.current_vmcs = Some(paddr);
                Ok(())
            }
        })
    }

    unsafe fn vmread(field: u32) -> Result<u64, VmxFail> {
        let vmcs = Self::current_vmcs()?;
        Ok(MockMachine::with(|m| {
            m.vmcs_fields.get(&(vmcs, field)).copied().unwrap_or(0)
        }))
    }

    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmxFail> {
        let vmcs = Self::current_vmcs()?;
        MockMachine::with(|m| m.vmcs_fields.insert((vmcs, field), value));
        Ok(())
    }

    unsafe fn invept(kind: InvEptType, eptp: u64) -> Result<(), VmxFail> {
        MockCpu::with(|cpu| {
            if !cpu.vmx_on {
                return Err(VmxFail::VmFailInvalid);
            }
            if let Some(fail) = cpu.faults.invept {
                return Err(fail);
            }
            cpu.counts.invept += 1;
            cpu.last_invept = Some((kind, eptp));
            Ok(())
        })
    }

    unsafe fn vm_enter(regs: &mut GeneralRegisters, launched: bool) -> Result<(), VmxFail> {
        if let Some(fail) = MockCpu::with(|cpu| cpu.faults.vm_enter) {
            return Err(fail);
        }
        let vmcs = Self::current_vmcs()?;
        let is_launched = MockMachine::with(|m| m.launched.contains(&vmcs));
        match (launched, is_launched) {
            // VMLAUNCH_NON_CLEAR_VMCS
            (false, true) => return Self::fail_valid(vmcs, 4),
            // VMRESUME_NON_LAUNCHED_VMCS
            (true, false) => return Self::fail_valid(vmcs, 5),
            _ => {}
        }
        MockMachine::with(|m| {
            m.launched.insert(vmcs);
            m.cpu().counts.vm_entry += 1;
            let (reason, qualification, gpa) = m.scripted_exit;
            let fields = [
                (VmcsField::EXIT_REASON, reason as u64),
                (VmcsField::EXIT_QUALIFICATION, qualification),
                (VmcsField::GUEST_PHYSICAL_ADDR, gpa),
            ];
            for (field, value) in fields {
                m.vmcs_fields.insert((vmcs, field.into()), value);
            }
        });
        regs.rax += 1;
        Ok(())
    }

    fn save_segments() -> HostSegments {
        MockCpu::with(|cpu| cpu.segments)
    }

    unsafe fn restore_segments(segs: &HostSegments) {
        MockCpu::with(|cpu| cpu.segments = *segs);
    }

    unsafe fn fxsave(_area: *mut u8) {
        MockCpu::with(|cpu| cpu.counts.fxsave += 1);
    }

    unsafe fn fxrstor(_area: *const u8) {
        MockCpu::with(|cpu| cpu.counts.fxrstor += 1);
    }
}

/// Records the EPT pointers flushed by a translation, oldest first.
#[derive(Debug, Default)]
pub struct MockInvalidator(Mutex<Vec<u64>>);

impl MockInvalidator {
    pub fn flushes(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn last_eptp(&self) -> Option<u64> {
        self.0.lock().unwrap().last().copied()
    }
}

impl TlbInvalidator for MockInvalidator {
    fn flush_ept(&self, eptp: u64) -> HvResult {
        self.0.lock().unwrap().push(eptp);
        Ok(())
    }
}
