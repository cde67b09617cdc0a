//! Build- and run-time knobs of the hypervisor core.

/// Guest frames are stored in groups of `1 << GPFN_GROUP_SHIFT` entries (1 GiB).
pub const GPFN_GROUP_SHIFT: usize = 18;
/// Number of entries in one p2m group.
pub const GPFN_GROUP_SIZE: usize = 1 << GPFN_GROUP_SHIFT;

/// Which guest-physical translation scheme a VM uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationKind {
    /// gpa-space as the source of truth, mirrored into an EPT tree.
    Ept,
    /// Per-gigabyte p2m groups plus the recycled host-virtual window.
    Legacy,
}

impl Default for TranslationKind {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "legacy-p2m")] {
                Self::Legacy
            } else {
                Self::Ept
            }
        }
    }
}

/// Bounds of the host-virtual window used by the legacy translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HvaWindowConfig {
    /// Ceiling of bytes mapped through the window, kernel mappings excepted.
    pub limit_bytes: usize,
    /// Up to this many bytes, new mappings go to the reserve window and are
    /// never recycled on demand.
    pub recycle_threshold_bytes: usize,
}

impl HvaWindowConfig {
    pub const fn limit_pages(&self) -> usize {
        self.limit_bytes >> 12
    }

    pub const fn threshold_pages(&self) -> usize {
        self.recycle_threshold_bytes >> 12
    }
}

impl Default for HvaWindowConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 128 << 20,
            recycle_threshold_bytes: 64 << 20,
        }
    }
}

/// Configuration shared by every VM of a [`VmManager`](crate::VmManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HvConfig {
    pub translation: TranslationKind,
    /// Guest frames at or beyond this many GiB are rejected.
    pub max_guest_mem_gb: usize,
    pub hva_window: HvaWindowConfig,
}

impl HvConfig {
    /// Number of guest frames a VM can address.
    pub const fn max_gpfn(&self) -> u64 {
        (self.max_guest_mem_gb as u64) << GPFN_GROUP_SHIFT
    }
}

impl Default for HvConfig {
    fn default() -> Self {
        Self {
            translation: TranslationKind::default(),
            max_guest_mem_gb: 64,
            hva_window: HvaWindowConfig::default(),
        }
    }
}
