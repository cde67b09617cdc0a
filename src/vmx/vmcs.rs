//! VMCS field encodings and the per-exit information channel.

use bit_field::BitField;

use super::VmxInstructions;
use crate::error::VmxFail;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// VMCS fields touched by the core. (SDM Vol. 3D, Appendix B)
pub enum VmcsField {
    // 64-bit read-only data fields.
    GUEST_PHYSICAL_ADDR = 0x2400,
    // 32-bit read-only data fields.
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INSTRUCTION_LEN = 0x440c,
    // Natural-width read-only data fields.
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDR = 0x640a,
    // Natural-width guest-state fields.
    GUEST_RIP = 0x681e,
    // Natural-width host-state fields.
    HOST_RSP = 0x6c14,
    HOST_RIP = 0x6c16,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// VMX basic exit reasons. (SDM Vol. 3D, Appendix C)
pub enum VmxExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    SMI = 5,
    OTHER_SMI = 6,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    GETSEC = 11,
    HLT = 12,
    INVD = 13,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    RSM = 17,
    VMCALL = 18,
    VMCLEAR = 19,
    VMLAUNCH = 20,
    VMPTRLD = 21,
    VMPTRST = 22,
    VMREAD = 23,
    VMRESUME = 24,
    VMWRITE = 25,
    VMOFF = 26,
    VMON = 27,
    CR_ACCESS = 28,
    DR_ACCESS = 29,
    IO_INSTRUCTION = 30,
    MSR_READ = 31,
    MSR_WRITE = 32,
    INVALID_GUEST_STATE = 33,
    MSR_LOAD_FAIL = 34,
    MWAIT_INSTRUCTION = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR_INSTRUCTION = 39,
    PAUSE_INSTRUCTION = 40,
    MCE_DURING_VMENTRY = 41,
    TPR_BELOW_THRESHOLD = 43,
    APIC_ACCESS = 44,
    VIRTUALIZED_EOI = 45,
    GDTR_IDTR = 46,
    LDTR_TR = 47,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
    VMFUNC = 59,
    ENCLS = 60,
    RDSEED = 61,
    PML_FULL = 62,
    XSAVES = 63,
    XRSTORS = 64,
}
}

/// Information of a VM exit, copied out of the VMCS right after the exit.
///
/// This is the channel through which the outer run loop learns why the guest
/// stopped; a failed VM entry is reported through `vmx_error` instead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    /// VM-entry failure. (bit 31 of the exit reason)
    pub entry_failure: bool,
    /// Basic exit reason. (bits 15:0 of the exit reason)
    pub exit_reason: u32,
    pub exit_qualification: u64,
    pub guest_rip: u64,
    pub instruction_len: u32,
    pub guest_phys_addr: u64,
    pub guest_linear_addr: u64,
    pub interruption_info: u32,
    /// Set when VMLAUNCH/VMRESUME itself failed.
    pub vmx_error: Option<VmxFail>,
}

impl VmxExitInfo {
    /// The decoded basic exit reason, if it is a known one.
    pub fn reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.exit_reason).ok()
    }

    pub(crate) fn record_entry_error(&mut self, fail: VmxFail) {
        *self = Self {
            vmx_error: Some(fail),
            ..Self::default()
        };
    }

    /// Reads the exit fields of the current VMCS.
    ///
    /// # Safety
    ///
    /// A VMCS must be current on this core and a VM exit must just have
    /// happened on it.
    pub(crate) unsafe fn capture<V: VmxInstructions>(&mut self) -> Result<(), VmxFail> {
        let read = |field: VmcsField| unsafe { V::vmread(field.into()) };
        let full_reason = read(VmcsField::EXIT_REASON)?;
        *self = Self {
            entry_failure: full_reason.get_bit(31),
            exit_reason: full_reason.get_bits(0..16) as u32,
            exit_qualification: read(VmcsField::EXIT_QUALIFICATION)?,
            guest_rip: read(VmcsField::GUEST_RIP)?,
            instruction_len: read(VmcsField::VMEXIT_INSTRUCTION_LEN)? as u32,
            guest_phys_addr: read(VmcsField::GUEST_PHYSICAL_ADDR)?,
            guest_linear_addr: read(VmcsField::GUEST_LINEAR_ADDR)?,
            interruption_info: read(VmcsField::VMEXIT_INTERRUPTION_INFO)? as u32,
            vmx_error: None,
        };
        Ok(())
    }
}
