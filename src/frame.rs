use core::marker::PhantomData;

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::{Hal, HostPhysAddr, HvError, HvResult};

/// A 4K-sized contiguous physical memory page, it will deallocate the page
/// automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: Hal> {
    start_paddr: Option<HostPhysAddr>,
    _marker: PhantomData<H>,
}

impl<H: Hal> PhysFrame<H> {
    pub fn alloc() -> HvResult<Self> {
        let start_paddr = H::alloc_frame().ok_or(HvError::NoMemory)?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr: Some(start_paddr),
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero() -> HvResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// Creates a placeholder that owns no memory.
    ///
    /// # Safety
    ///
    /// The frame must not be accessed before it is replaced by an allocated one.
    pub const unsafe fn uninit() -> Self {
        Self {
            start_paddr: None,
            _marker: PhantomData,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.start_paddr.is_some()
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr.expect("uninitialized PhysFrame")
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr()).as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }
}

impl<H: Hal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        if let Some(start_paddr) = self.start_paddr {
            H::dealloc_frame(start_paddr);
            debug!("deallocated PhysFrame({:#x})", start_paddr);
        }
    }
}
