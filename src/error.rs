use core::fmt;

use axerrno::{AxError, ax_err_type};

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// VM-instruction error numbers. (SDM Vol. 3C, Section 31.4)
pub enum VmxInstructionError {
    VMCALL_IN_VMX_ROOT = 1,
    VMCLEAR_INVALID_ADDRESS = 2,
    VMCLEAR_VMXON_POINTER = 3,
    VMLAUNCH_NON_CLEAR_VMCS = 4,
    VMRESUME_NON_LAUNCHED_VMCS = 5,
    VMRESUME_AFTER_VMXOFF = 6,
    ENTRY_INVALID_CONTROL_FIELDS = 7,
    ENTRY_INVALID_HOST_STATE = 8,
    VMPTRLD_INVALID_ADDRESS = 9,
    VMPTRLD_VMXON_POINTER = 10,
    VMPTRLD_INCORRECT_REVISION = 11,
    VMREAD_VMWRITE_UNSUPPORTED_FIELD = 12,
    VMWRITE_READ_ONLY_FIELD = 13,
    VMXON_IN_VMX_ROOT = 15,
    ENTRY_INVALID_EXECUTIVE_VMCS = 16,
    ENTRY_NON_LAUNCHED_EXECUTIVE_VMCS = 17,
    ENTRY_EXECUTIVE_VMCS_NOT_VMXON = 18,
    VMCALL_NON_CLEAR_VMCS = 19,
    VMCALL_INVALID_EXIT_CONTROLS = 20,
    VMCALL_INCORRECT_MSEG_REVISION = 22,
    VMXOFF_DUAL_MONITOR = 23,
    VMCALL_INVALID_SMM_FEATURES = 24,
    ENTRY_INVALID_EXECUTIVE_CONTROLS = 25,
    ENTRY_BLOCKED_BY_MOV_SS = 26,
    INVALID_INVEPT_INVVPID_OPERAND = 28,
}
}

/// Outcome of a failed VMX instruction. (SDM Vol. 3C, Section 31.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxFail {
    /// `CF` was set: no current VMCS, or the operand itself was rejected.
    VmFailInvalid,
    /// `ZF` was set: the VM-instruction error field holds the raw error number.
    VmFailValid(u32),
}

impl VmxFail {
    /// Decoded VM-instruction error, if the failure carried a known one.
    pub fn instruction_error(&self) -> Option<VmxInstructionError> {
        match *self {
            Self::VmFailValid(raw) => VmxInstructionError::try_from(raw).ok(),
            Self::VmFailInvalid => None,
        }
    }
}

impl fmt::Display for VmxFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmFailInvalid => f.write_str("VMfailInvalid"),
            Self::VmFailValid(raw) => match self.instruction_error() {
                Some(err) => write!(f, "VMfailValid({raw}: {err:?})"),
                None => write!(f, "VMfailValid({raw})"),
            },
        }
    }
}

/// Errors reported by the hypervisor core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HvError {
    #[error("VT or NX is not enabled, can not setup VM")]
    FeatureNotEnabled,
    #[error("no VM identifier available")]
    NoVmIdAvailable,
    #[error("out of memory")]
    NoMemory,
    #[error("guest frame {0:#x} is beyond the supported guest memory")]
    TooBig(u64),
    #[error("VMXON failed: {0}")]
    VmxonFail(VmxFail),
    #[error("VMXOFF failed: {0}")]
    VmxoffFail(VmxFail),
    #[error("VMPTRLD failed: {0}")]
    VmptrldFail(VmxFail),
    #[error("VMCLEAR failed: {0}")]
    VmclearFail(VmxFail),
    #[error("VMLAUNCH failed: {0}")]
    VmLaunchFail(VmxFail),
    #[error("VMRESUME failed: {0}")]
    VmResumeFail(VmxFail),
    #[error("INVEPT failed: {0}")]
    InveptFail(VmxFail),
    #[error("VMX is already enabled on this core")]
    VmxAlreadyEnabled,
    #[error("VMX is not enabled on this core")]
    VmxNotEnabled,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("VM still owns vCPUs")]
    VmBusy,
    #[error("resource busy")]
    Busy,
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("bad state: {0}")]
    BadState(&'static str),
}

/// Result type of this crate.
pub type HvResult<T = ()> = Result<T, HvError>;

impl From<HvError> for AxError {
    fn from(err: HvError) -> Self {
        match err {
            HvError::NoMemory => ax_err_type!(NoMemory),
            HvError::NoVmIdAvailable => ax_err_type!(NoMemory),
            HvError::TooBig(_) => ax_err_type!(InvalidInput),
            HvError::FeatureNotEnabled | HvError::Unsupported(_) => ax_err_type!(Unsupported),
            HvError::VmBusy | HvError::Busy | HvError::VmxAlreadyEnabled => {
                ax_err_type!(ResourceBusy)
            }
            HvError::NotFound => ax_err_type!(NotFound),
            HvError::AlreadyExists => ax_err_type!(AlreadyExists),
            _ => ax_err_type!(BadState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_vm_fail_valid_decodes_instruction_error() {
        let fail = VmxFail::VmFailValid(9);
        assert_eq!(
            fail.instruction_error(),
            Some(VmxInstructionError::VMPTRLD_INVALID_ADDRESS)
        );
        assert!(fail.to_string().contains("VMPTRLD_INVALID_ADDRESS"));
    }

    #[test]
    fn test_vm_fail_unknown_number() {
        let fail = VmxFail::VmFailValid(0xff);
        assert_eq!(fail.instruction_error(), None);
        assert_eq!(fail.to_string(), "VMfailValid(255)");
        assert_eq!(VmxFail::VmFailInvalid.instruction_error(), None);
    }

    #[test]
    fn test_errno_classes() {
        assert_eq!(AxError::from(HvError::NoMemory), ax_err_type!(NoMemory));
        assert_eq!(AxError::from(HvError::TooBig(1 << 40)), ax_err_type!(InvalidInput));
        assert_eq!(AxError::from(HvError::VmBusy), ax_err_type!(ResourceBusy));
        assert_eq!(
            AxError::from(HvError::VmxonFail(VmxFail::VmFailInvalid)),
            ax_err_type!(BadState)
        );
    }
}
