use bit_field::BitField;
use bitflags::bitflags;

use crate::vmx::VmxInstructions;

/// X86 model-specific registers. (SDM Vol. 4)
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Msr {
    IA32_FEATURE_CONTROL = 0x3a,

    IA32_PMC0 = 0xc1,
    IA32_PERFEVTSEL0 = 0x186,

    IA32_VMX_BASIC = 0x480,
    IA32_VMX_CR0_FIXED0 = 0x486,
    IA32_VMX_CR0_FIXED1 = 0x487,
    IA32_VMX_CR4_FIXED0 = 0x488,
    IA32_VMX_CR4_FIXED1 = 0x489,

    IA32_EFER = 0xc000_0080,
    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
    IA32_KERNEL_GSBASE = 0xc000_0102,
    IA32_TSC_AUX = 0xc000_0103,
}

impl Msr {
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// Reads this MSR through the instruction backend `V`.
    #[inline(always)]
    pub fn read<V: VmxInstructions>(self) -> u64 {
        V::read_msr(self.index())
    }

    /// Writes this MSR through the instruction backend `V`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write<V: VmxInstructions>(self, value: u64) {
        unsafe { V::write_msr(self.index(), value) }
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// Lock bit: when set, locks this MSR from being written. when clear,
        /// VMXON causes a #GP.
        const LOCKED = 1 << 0;
        /// Enable VMX inside SMX operation.
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        /// Enable VMX outside SMX operation.
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 23.7)
pub struct FeatureControl;

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read<V: VmxInstructions>() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read::<V>())
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved values.
    pub fn write<V: VmxInstructions>(flags: FeatureControlFlags) {
        let old_value = Msr::IA32_FEATURE_CONTROL.read::<V>();
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Msr::IA32_FEATURE_CONTROL.write::<V>(new_value) };
    }

    /// Whether VMXON is (or can be made) legal outside SMX operation.
    pub fn vmx_permitted(flags: FeatureControlFlags) -> bool {
        !flags.contains(FeatureControlFlags::LOCKED)
            || flags.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX)
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
        }
    }

    /// Read the current IA32_VMX_BASIC flags.
    pub fn read<V: VmxInstructions>() -> Self {
        Self::from_raw(Msr::IA32_VMX_BASIC.read::<V>())
    }
}
