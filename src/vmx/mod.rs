mod controller;
mod features;
mod hstate;
mod instructions;
mod percpu;
mod structs;
mod vmcs;

pub use self::controller::VmxController;
pub use self::features::{CpuFeatures, PmuInfo, VmmFlags};
pub use self::instructions::{DescriptorTable, HostSegments, InvEptType, VmxInstructions};
pub use self::percpu::{StickyErrors, VmxPerCpuState, VmxState};
pub use self::vmcs::{VmcsField, VmxExitInfo, VmxExitReason};

pub(crate) use self::structs::VmxRegion;

#[cfg(target_arch = "x86_64")]
pub use self::instructions::NativeVmx;
