#![no_std]
#![forbid(unsafe_code)]

use msc_core::{DriveSlot, FormatPolicy, MscResult};

/// Wear-leveling translation layer over a flash partition.
/// Addresses are byte offsets relative to the start of the partition.
pub trait WearLevel: Send {
    /// Usable bytes behind the translation layer.
    fn size(&self) -> usize;

    /// Erase/program unit. Also the sector size exported to the host.
    fn sector_size(&self) -> usize;

    fn read(&mut self, addr: usize, dest: &mut [u8]) -> MscResult<()>;

    /// Program previously erased bytes.
    fn write(&mut self, addr: usize, src: &[u8]) -> MscResult<()>;

    fn erase_range(&mut self, addr: usize, len: usize) -> MscResult<()>;
}

/// Raw sector-addressed card (SD/MMC).
pub trait SectorCard: Send {
    /// Capacity in sectors.
    fn capacity(&self) -> u32;
    fn sector_size(&self) -> u32;

    fn read_sectors(&mut self, dest: &mut [u8], start: u32, count: usize) -> MscResult<()>;
    fn write_sectors(&mut self, src: &[u8], start: u32, count: usize) -> MscResult<()>;

    /// Toggle the driver's periodic card-presence check.
    /// Default: the card has no such check.
    fn set_status_check(&mut self, _enabled: bool) {}
}

/// Sector-level view of a medium, as seen by the FAT driver.
pub trait BlockDisk {
    fn sector_count(&self) -> u32;
    fn sector_size(&self) -> u32;
    fn read(&mut self, lba: u32, offset: u32, dest: &mut [u8]) -> MscResult<()>;
    fn write(&mut self, lba: u32, offset: u32, src: &[u8]) -> MscResult<()>;
}

/// The FAT driver: block-device slot table, VFS path registry and volume
/// mount/format.
pub trait FatDriver: Send {
    /// Free drive slot. `ResourceExhausted` when every slot is taken.
    fn acquire_slot(&mut self) -> MscResult<DriveSlot>;
    fn release_slot(&mut self, slot: DriveSlot);

    /// Bind `path` to the volume in `slot`.
    /// Returns `AlreadyRegistered` if `path` is already bound.
    fn register(&mut self, path: &str, slot: DriveSlot, max_files: usize) -> MscResult<()>;
    fn unregister(&mut self, path: &str) -> MscResult<()>;

    /// Mount the volume found on `disk`. `NoFilesystem` when there is none.
    fn mount(&mut self, slot: DriveSlot, disk: &mut dyn BlockDisk) -> MscResult<()>;

    /// Create a fresh volume on `disk`. `work` is scratch space.
    fn format(
        &mut self,
        slot: DriveSlot,
        disk: &mut dyn BlockDisk,
        policy: &FormatPolicy,
        work: &mut [u8],
    ) -> MscResult<()>;

    /// Drop the mounted volume object for `slot`, if any.
    fn detach(&mut self, slot: DriveSlot);
}
