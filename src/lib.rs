#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
mod regs;

mod error;
mod frame;
mod hal;
mod manager;
mod msr;
mod vcpu;
mod vm;

pub mod config;
pub mod p2m;
pub mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr};
pub use page_table_entry::MappingFlags;

pub use config::{HvConfig, HvaWindowConfig, TranslationKind};
pub use error::{HvError, HvResult, VmxFail, VmxInstructionError};
pub use frame::PhysFrame;
pub use hal::Hal;
pub use manager::{MAX_VMS, VmManager};
pub use p2m::{GuestMapping, MapContext};
pub use regs::GeneralRegisters;
pub use vcpu::{Vcpu, VcpuRef};
pub use vm::{Vm, VmFeatures, VmRef};
pub use vmx::{CpuFeatures, VmxController, VmxExitInfo, VmxExitReason, VmxInstructions};
