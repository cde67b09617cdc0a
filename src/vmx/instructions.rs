//! Raw CPU and VMX instructions used by the per-core controller.
//!
//! [`VmxInstructions`] is the seam between the VMX state machine and the
//! processor; [`NativeVmx`] executes the real instructions.

use raw_cpuid::CpuIdResult;

use crate::error::VmxFail;
use crate::regs::GeneralRegisters;

/// INVEPT invalidation type. (SDM Vol. 3C, Section 30.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvEptType {
    SingleContext = 1,
}

/// Base and limit of a descriptor table register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Host segment state that a VM exit does not restore by itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostSegments {
    pub ldt: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
}

/// The processor operations the VMX controller is built on.
///
/// Every method acts on the core the caller is running on. None of them may
/// log or take locks: they are used on the VM-entry path.
pub trait VmxInstructions {
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult;

    fn read_msr(msr: u32) -> u64;
    /// # Safety
    ///
    /// Writing an MSR can change the execution environment of the host.
    unsafe fn write_msr(msr: u32, value: u64);

    fn read_cr0() -> u64;
    fn read_cr4() -> u64;
    /// # Safety
    ///
    /// The value must be a legal CR4 for the running host.
    unsafe fn write_cr4(value: u64);

    /// # Safety
    ///
    /// `paddr` must be a 4K-aligned VMXON region carrying the revision id.
    unsafe fn vmxon(paddr: u64) -> Result<(), VmxFail>;
    /// # Safety
    ///
    /// The core must be in VMX root operation.
    unsafe fn vmxoff() -> Result<(), VmxFail>;
    /// # Safety
    ///
    /// `paddr` must be a VMCS region owned by the caller.
    unsafe fn vmclear(paddr: u64) -> Result<(), VmxFail>;
    /// # Safety
    ///
    /// `paddr` must be a VMCS region owned by the caller.
    unsafe fn vmptrld(paddr: u64) -> Result<(), VmxFail>;
    /// # Safety
    ///
    /// A VMCS must be current on this core.
    unsafe fn vmread(field: u32) -> Result<u64, VmxFail>;
    /// # Safety
    ///
    /// A VMCS must be current on this core.
    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmxFail>;
    /// # Safety
    ///
    /// The core must be in VMX root operation.
    unsafe fn invept(kind: InvEptType, eptp: u64) -> Result<(), VmxFail>;

    /// Enters the guest with VMLAUNCH (or VMRESUME if `launched`) and returns
    /// after the next VM exit, with the guest registers saved into `regs`.
    ///
    /// # Safety
    ///
    /// A fully set up VMCS must be current on this core.
    unsafe fn vm_enter(regs: &mut GeneralRegisters, launched: bool) -> Result<(), VmxFail>;

    fn save_segments() -> HostSegments;
    /// # Safety
    ///
    /// `segs` must come from [`VmxInstructions::save_segments`] on this core.
    unsafe fn restore_segments(segs: &HostSegments);
    /// # Safety
    ///
    /// `area` must be a writable, 16-byte aligned 512-byte region.
    unsafe fn fxsave(area: *mut u8);
    /// # Safety
    ///
    /// `area` must hold an image written by [`VmxInstructions::fxsave`].
    unsafe fn fxrstor(area: *const u8);
}

/// Decodes the arithmetic flags left by a VMX instruction. (SDM Vol. 3C, Section 31.2)
pub(crate) fn vm_succeed<V: VmxInstructions>(rflags: u64) -> Result<(), VmxFail> {
    const RFLAGS_CF: u64 = 1 << 0;
    const RFLAGS_ZF: u64 = 1 << 6;
    if rflags & RFLAGS_ZF != 0 {
        let error = unsafe { V::vmread(super::vmcs::VmcsField::VM_INSTRUCTION_ERROR.into()) }
            .unwrap_or(0);
        Err(VmxFail::VmFailValid(error as u32))
    } else if rflags & RFLAGS_CF != 0 {
        Err(VmxFail::VmFailInvalid)
    } else {
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
pub use self::native::NativeVmx;

#[cfg(target_arch = "x86_64")]
mod native {
    use core::arch::{asm, global_asm};

    use raw_cpuid::CpuIdResult;
    use x86::bits64::vmx;
    use x86::dtables::{self, DescriptorTablePointer};
    use x86::segmentation::{self, SegmentSelector};
    use x86::vmx::VmFail;
    use x86_64::registers::control::{Cr0, Cr4};

    use super::{HostSegments, InvEptType, VmxInstructions, vm_succeed};
    use crate::error::VmxFail;
    use crate::regs::GeneralRegisters;
    use crate::vmx::vmcs::VmcsField;

    /// [`VmxInstructions`] backed by the real processor.
    pub struct NativeVmx;

    fn as_vmx_fail(err: VmFail) -> VmxFail {
        match err {
            VmFail::VmFailValid => {
                let error = unsafe { vmx::vmread(VmcsField::VM_INSTRUCTION_ERROR.into()) }
                    .unwrap_or(0);
                VmxFail::VmFailValid(error as u32)
            }
            VmFail::VmFailInvalid => VmxFail::VmFailInvalid,
        }
    }

    unsafe extern "C" {
        /// Returns 0 after a VM exit, or RFLAGS of the failed VM entry.
        fn __vmcore_vmx_enter(regs: *mut GeneralRegisters, launched: u64) -> u64;
    }

    // Host callee-saved registers and the `regs` pointer are kept on the host
    // stack; HOST_RSP points at the saved pointer, HOST_RIP at the exit stub.
    global_asm!(
        ".global __vmcore_vmx_enter",
        "__vmcore_vmx_enter:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rdi",
        "mov rax, {host_rsp}",
        "vmwrite rax, rsp",
        "jbe 3f",
        "lea rcx, [rip + __vmcore_vmx_exit]",
        "mov rax, {host_rip}",
        "vmwrite rax, rcx",
        "jbe 3f",
        "cmp rsi, 0",
        "mov rax, [rdi + {rax}]",
        "mov rcx, [rdi + {rcx}]",
        "mov rdx, [rdi + {rdx}]",
        "mov rbx, [rdi + {rbx}]",
        "mov rbp, [rdi + {rbp}]",
        "mov r8, [rdi + {r8}]",
        "mov r9, [rdi + {r9}]",
        "mov r10, [rdi + {r10}]",
        "mov r11, [rdi + {r11}]",
        "mov r12, [rdi + {r12}]",
        "mov r13, [rdi + {r13}]",
        "mov r14, [rdi + {r14}]",
        "mov r15, [rdi + {r15}]",
        "mov rsi, [rdi + {rsi}]",
        "mov rdi, [rdi + {rdi}]",
        "jne 2f",
        "vmlaunch",
        "jmp 3f",
        "2:",
        "vmresume",
        "3:",
        "pushfq",
        "pop rax",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        "",
        "__vmcore_vmx_exit:",
        "push rdi",
        "mov rdi, [rsp + 8]",
        "mov [rdi + {rax}], rax",
        "mov [rdi + {rcx}], rcx",
        "mov [rdi + {rdx}], rdx",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {rsi}], rsi",
        "mov [rdi + {r8}], r8",
        "mov [rdi + {r9}], r9",
        "mov [rdi + {r10}], r10",
        "mov [rdi + {r11}], r11",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "pop rax",
        "mov [rdi + {rdi}], rax",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "xor eax, eax",
        "ret",
        host_rsp = const 0x6c14,
        host_rip = const 0x6c16,
        rax = const gpr_offset!(rax),
        rcx = const gpr_offset!(rcx),
        rdx = const gpr_offset!(rdx),
        rbx = const gpr_offset!(rbx),
        rbp = const gpr_offset!(rbp),
        rsi = const gpr_offset!(rsi),
        rdi = const gpr_offset!(rdi),
        r8 = const gpr_offset!(r8),
        r9 = const gpr_offset!(r9),
        r10 = const gpr_offset!(r10),
        r11 = const gpr_offset!(r11),
        r12 = const gpr_offset!(r12),
        r13 = const gpr_offset!(r13),
        r14 = const gpr_offset!(r14),
        r15 = const gpr_offset!(r15),
    );

    impl VmxInstructions for NativeVmx {
        fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
            raw_cpuid::cpuid!(leaf, subleaf)
        }

        fn read_msr(msr: u32) -> u64 {
            unsafe { x86::msr::rdmsr(msr) }
        }

        unsafe fn write_msr(msr: u32, value: u64) {
            unsafe { x86::msr::wrmsr(msr, value) }
        }

        fn read_cr0() -> u64 {
            Cr0::read_raw()
        }

        fn read_cr4() -> u64 {
            Cr4::read_raw()
        }

        unsafe fn write_cr4(value: u64) {
            unsafe { Cr4::write_raw(value) }
        }

        unsafe fn vmxon(paddr: u64) -> Result<(), VmxFail> {
            unsafe { vmx::vmxon(paddr) }.map_err(|_| VmxFail::VmFailInvalid)
        }

        unsafe fn vmxoff() -> Result<(), VmxFail> {
            unsafe { vmx::vmxoff() }.map_err(as_vmx_fail)
        }

        unsafe fn vmclear(paddr: u64) -> Result<(), VmxFail> {
            unsafe { vmx::vmclear(paddr) }.map_err(as_vmx_fail)
        }

        unsafe fn vmptrld(paddr: u64) -> Result<(), VmxFail> {
            unsafe { vmx::vmptrld(paddr) }.map_err(as_vmx_fail)
        }

        unsafe fn vmread(field: u32) -> Result<u64, VmxFail> {
            unsafe { vmx::vmread(field) }.map_err(as_vmx_fail)
        }

        unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmxFail> {
            unsafe { vmx::vmwrite(field, value) }.map_err(as_vmx_fail)
        }

        unsafe fn invept(kind: InvEptType, eptp: u64) -> Result<(), VmxFail> {
            let descriptor: [u64; 2] = [eptp, 0];
            let rflags: u64;
            unsafe {
                asm!(
                    "invept {0}, [{1}]",
                    "pushfq",
                    "pop {2}",
                    in(reg) kind as u64,
                    in(reg) &descriptor,
                    lateout(reg) rflags,
                );
            }
            vm_succeed::<Self>(rflags)
        }

        unsafe fn vm_enter(regs: &mut GeneralRegisters, launched: bool) -> Result<(), VmxFail> {
            let rflags = unsafe { __vmcore_vmx_enter(regs, launched as u64) };
            if rflags == 0 {
                Ok(())
            } else {
                vm_succeed::<Self>(rflags)
            }
        }

        fn save_segments() -> HostSegments {
            let ldt: u16;
            let mut gdtp = DescriptorTablePointer::<u64>::default();
            let mut idtp = DescriptorTablePointer::<u64>::default();
            unsafe {
                asm!("sldt {0:x}", out(reg) ldt, options(nomem, nostack, preserves_flags));
                dtables::sgdt(&mut gdtp);
                dtables::sidt(&mut idtp);
            }
            HostSegments {
                ldt,
                ds: segmentation::ds().bits(),
                es: segmentation::es().bits(),
                fs: segmentation::fs().bits(),
                gs: segmentation::gs().bits(),
                gdtr: super::DescriptorTable {
                    base: gdtp.base as u64,
                    limit: gdtp.limit,
                },
                idtr: super::DescriptorTable {
                    base: idtp.base as u64,
                    limit: idtp.limit,
                },
            }
        }

        unsafe fn restore_segments(segs: &HostSegments) {
            // A VM exit leaves GDTR/IDTR limits at 0xffff and LDTR unusable.
            let gdtp = DescriptorTablePointer {
                limit: segs.gdtr.limit,
                base: segs.gdtr.base as *const u64,
            };
            let idtp = DescriptorTablePointer {
                limit: segs.idtr.limit,
                base: segs.idtr.base as *const u64,
            };
            unsafe {
                dtables::lgdt(&gdtp);
                dtables::lidt(&idtp);
                dtables::load_ldtr(SegmentSelector::from_raw(segs.ldt));
                segmentation::load_ds(SegmentSelector::from_raw(segs.ds));
                segmentation::load_es(SegmentSelector::from_raw(segs.es));
                segmentation::load_fs(SegmentSelector::from_raw(segs.fs));
                segmentation::load_gs(SegmentSelector::from_raw(segs.gs));
            }
        }

        unsafe fn fxsave(area: *mut u8) {
            unsafe { core::arch::x86_64::_fxsave64(area) }
        }

        unsafe fn fxrstor(area: *const u8) {
            unsafe { core::arch::x86_64::_fxrstor64(area) }
        }
    }
}
