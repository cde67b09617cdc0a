/// General-purpose registers of a guest, in the order the VM-entry trampoline
/// saves and restores them.
///
/// `_unused_rsp` keeps the hardware numbering of the registers; the guest
/// stack pointer lives in the VMCS.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Byte offset of a register inside [`GeneralRegisters`], for the trampoline.
macro_rules! gpr_offset {
    ($reg:ident) => {
        core::mem::offset_of!($crate::regs::GeneralRegisters, $reg)
    };
}
