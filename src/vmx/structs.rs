use bit_field::BitField;

use crate::frame::PhysFrame;
use crate::{Hal, HostPhysAddr, HvResult};

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 24.2)
#[derive(Debug)]
pub struct VmxRegion<H: Hal> {
    frame: PhysFrame<H>,
}

impl<H: Hal> VmxRegion<H> {
    pub const unsafe fn uninit() -> Self {
        Self {
            frame: unsafe { PhysFrame::uninit() },
        }
    }

    pub fn new(revision_id: u32, shadow_indicator: bool) -> HvResult<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            (*(frame.as_mut_ptr() as *mut u32))
                .set_bits(0..=30, revision_id)
                .set_bit(31, shadow_indicator);
        }
        Ok(Self { frame })
    }

    pub fn is_allocated(&self) -> bool {
        self.frame.is_allocated()
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    /// The revision identifier stamped into the first dword.
    pub fn revision_id(&self) -> u32 {
        unsafe { (*(self.frame.as_mut_ptr() as *const u32)).get_bits(0..=30) }
    }
}
