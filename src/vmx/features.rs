use core::marker::PhantomData;

use bit_field::BitField;
use bitflags::bitflags;
use raw_cpuid::{CpuId, CpuIdReader, CpuIdResult};
use x86_64::registers::model_specific::EferFlags;

use super::VmxInstructions;
use crate::msr::{FeatureControl, Msr};

bitflags! {
    /// Virtualization-relevant capabilities of one core.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u16 {
        /// CPUID leaf 1 could be read.
        const VALID = 1 << 0;
        const SUPPORT_VT = 1 << 1;
        const SUPPORT_NX = 1 << 2;
        const SUPPORT_EM64T = 1 << 3;
        /// VT is supported and not locked off by firmware.
        const ENABLE_VT = 1 << 4;
        /// NX is supported and EFER.NXE is set.
        const ENABLE_NX = 1 << 5;
        /// Long mode is supported and active.
        const ENABLE_EM64T = 1 << 6;
        /// The core passed the VMX capability checks and has a VMXON region.
        const INITIALIZED = 1 << 8;
    }
}

bitflags! {
    /// Per-core VMM operation flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VmmFlags: u8 {
        /// The core is in VMX root operation.
        const VMXON = 1 << 0;
    }
}

/// Routes `raw_cpuid` queries through the instruction backend.
struct CpuIdBackend<V>(PhantomData<V>);

impl<V> Clone for CpuIdBackend<V> {
    fn clone(&self) -> Self {
        Self(PhantomData)
    }
}

impl<V: VmxInstructions> CpuIdReader for CpuIdBackend<V> {
    fn cpuid2(&self, eax: u32, ecx: u32) -> CpuIdResult {
        V::cpuid(eax, ecx)
    }
}

fn cpuid<V: VmxInstructions>() -> CpuId<CpuIdBackend<V>> {
    CpuId::with_cpuid_reader(CpuIdBackend(PhantomData))
}

impl CpuFeatures {
    /// Probes the core the caller runs on.
    pub fn probe<V: VmxInstructions>() -> Self {
        let cpuid = cpuid::<V>();
        let mut features = Self::empty();

        if let Some(info) = cpuid.get_feature_info() {
            features |= Self::VALID;
            features.set(Self::SUPPORT_VT, info.has_vmx());
        }
        if let Some(ext) = cpuid.get_extended_processor_and_feature_identifiers() {
            features.set(Self::SUPPORT_NX, ext.has_execute_disable());
            features.set(Self::SUPPORT_EM64T, ext.has_64bit_mode());
        }

        if features.contains(Self::SUPPORT_VT)
            && FeatureControl::vmx_permitted(FeatureControl::read::<V>())
        {
            features |= Self::ENABLE_VT;
        }
        let efer = EferFlags::from_bits_truncate(Msr::IA32_EFER.read::<V>());
        if features.contains(Self::SUPPORT_NX) && efer.contains(EferFlags::NO_EXECUTE_ENABLE) {
            features |= Self::ENABLE_NX;
        }
        if features.contains(Self::SUPPORT_EM64T) && efer.contains(EferFlags::LONG_MODE_ACTIVE) {
            features |= Self::ENABLE_EM64T;
        }
        features
    }
}

/// Whether the core supports RDTSCP (and so has a live TSC_AUX).
pub(crate) fn has_rdtscp<V: VmxInstructions>() -> bool {
    cpuid::<V>()
        .get_extended_processor_and_feature_identifiers()
        .is_some_and(|ext| ext.has_rdtscp())
}

/// Architectural performance monitoring capabilities. (CPUID leaf 0AH)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PmuInfo {
    pub version: u8,
    pub num_counters: u8,
    pub counter_bitlen: u8,
    pub num_fixed_counters: u8,
    pub fixed_counter_bitlen: u8,
}

impl PmuInfo {
    pub fn probe<V: VmxInstructions>() -> Self {
        if V::cpuid(0, 0).eax < 0xa {
            return Self::default();
        }
        let res = V::cpuid(0xa, 0);
        let version = res.eax.get_bits(0..8) as u8;
        if version == 0 {
            return Self::default();
        }
        Self {
            version,
            num_counters: res.eax.get_bits(8..16) as u8,
            counter_bitlen: res.eax.get_bits(16..24) as u8,
            // Fixed-function counters are enumerated from version 2 on.
            num_fixed_counters: if version > 1 {
                res.edx.get_bits(0..5) as u8
            } else {
                0
            },
            fixed_counter_bitlen: if version > 1 {
                res.edx.get_bits(5..13) as u8
            } else {
                0
            },
        }
    }
}
