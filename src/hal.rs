use crate::vmx::VmxInstructions;
use crate::{HostPhysAddr, HostVirtAddr, HvResult};

/// The interfaces the host kernel driver must implement.
///
/// Everything here is called from schedulable context, except the `Vmx`
/// backend which is also used on the VM-entry path.
pub trait Hal: Sized + Send + Sync + 'static {
    /// Raw CPU and VMX instruction backend.
    type Vmx: VmxInstructions;

    /// Allocates a 4K-sized physical frame, returns its physical address.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Returns a frame obtained from [`Hal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Converts a host physical address to a kernel virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Maps one 4K host page into kernel virtual address space.
    fn vmap(paddr: HostPhysAddr) -> Option<HostVirtAddr>;
    /// Releases a mapping created by [`Hal::vmap`].
    fn vunmap(vaddr: HostVirtAddr);

    /// Number of online physical cores.
    fn cpu_count() -> usize;
    /// Index of the core the caller runs on.
    fn current_cpu() -> usize;
    /// Runs `f` on core `cpu` and waits for it to finish.
    ///
    /// `f` must not log or take sleeping locks: on some hosts the rendezvous
    /// runs with interrupts disabled.
    fn run_on_cpu(cpu: usize, f: &mut dyn FnMut());

    /// Keeps the caller on its current core until [`Hal::preempt_enable`].
    fn preempt_disable() {}
    /// Ends a section started by [`Hal::preempt_disable`].
    fn preempt_enable() {}

    /// Creates the host-side companion object of a VM, returns its handle.
    fn vm_create_host(_vm_id: u8) -> HvResult<usize> {
        Ok(0)
    }
    /// Destroys the host-side companion object of a VM.
    fn vm_destroy_host(_vm_id: u8, _host: usize) {}
}
