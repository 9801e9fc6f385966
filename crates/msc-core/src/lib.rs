#![no_std]
#[cfg(feature = "std")]
extern crate std;

/// Memory alignment granularity of the staging buffer (DMA word).
pub const MEM_ALIGN: usize = 4;

/// Default staging buffer size. Matches the MSC endpoint FIFO.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Work buffer handed to the FAT formatter (one filesystem block).
pub const FS_WORKBUF_SIZE: usize = 4096;

/// Open-file capacity used when the config leaves it unset or non-positive.
pub const DEFAULT_MAX_FILES: usize = 2;

pub const DEFAULT_MOUNT_PATH: &str = "/data";

/// Upper bound on sectors per cluster when deriving the allocation unit.
const MAX_SECTORS_PER_CLUSTER: usize = 128;

pub type MscResult<T> = Result<T, MscError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MscError {
    /// Operation not allowed in the current mount state (or unknown drive).
    InvalidState,
    /// Length not aligned to the sector size, bad event kind, ...
    InvalidArg,
    /// Address arithmetic overflowed, or a size outside the configured bounds.
    InvalidSize,
    /// Configuration the selected backend cannot run with.
    NotSupported,
    NoMem,
    /// No free drive slot in the FAT driver.
    ResourceExhausted,
    /// VFS path already registered. Tolerated by mount.
    AlreadyRegistered,
    /// The single write slot is still owned by an undrained write.
    Busy,
    MediaError,
    EraseFailed,
    /// Medium carries no recognizable filesystem. Triggers a format.
    NoFilesystem,
    FsInternal,
    FsFailure,
    /// The storage session was torn down (or never created).
    NoSession,
}

impl core::fmt::Display for MscError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MscError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountState {
    #[default]
    Unmounted,
    Mounted,
}

impl MountState {
    pub fn is_mounted(self) -> bool {
        self == MountState::Mounted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Flash,
    Card,
}

/// Index into the FAT driver's block-device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriveSlot(pub u8);

impl DriveSlot {
    /// Logical drive prefix understood by the FAT driver ("0:", "1:", ...).
    pub fn drive_id(self) -> [u8; 2] {
        [b'0' + self.0, b':']
    }
}

impl core::fmt::Display for DriveSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Fired before a mount/unmount transition, carrying the current state.
    PremountChanged,
    /// Fired after a completed transition, carrying the new state.
    MountChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MscEvent {
    pub kind: EventKind,
    pub is_mounted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatType {
    #[default]
    Any,
    Fat,
    Fat32,
    ExFat,
}

/// How a blank medium gets formatted on first mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatPolicy {
    pub fat_type: FatType,
    /// Single-partition layout: no partition table, volume starts at sector 0.
    pub single_partition: bool,
}

/// Cluster size for mkfs: at least one sector, at most 128 sectors.
pub fn allocation_unit(sector_size: usize, requested: usize) -> usize {
    let max = sector_size.saturating_mul(MAX_SECTORS_PER_CLUSTER);
    requested.max(sector_size).min(max)
}
