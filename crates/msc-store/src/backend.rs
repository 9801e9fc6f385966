use msc_core::{BackendKind, DriveSlot, MscError, MscResult};
use msc_hal::BlockDisk;

/// Uniform sector contract over heterogeneous media.
/// Implemented by `FlashBackend` and `CardBackend`; exactly one is owned by
/// a storage session.
pub trait StorageBackend: BlockDisk + Send {
    fn kind(&self) -> BackendKind;

    /// Smallest buffer the backend can program in one go, if it has one.
    fn erase_unit(&self) -> Option<u32> {
        None
    }

    /// Attach the medium to FAT drive `slot`.
    fn mount(&mut self, slot: DriveSlot) -> MscResult<()>;

    /// Detach the medium from its drive slot and return the slot.
    /// `InvalidState` if it was never attached.
    fn unmount(&mut self) -> MscResult<DriveSlot>;

    fn drive(&self) -> Option<DriveSlot>;

    /// The FAT driver's view of this backend.
    fn as_disk(&mut self) -> &mut dyn BlockDisk;
}

/// Byte address of `offset` within sector `lba`.
/// Media addresses are 32-bit; overflow is `InvalidSize`, never a media call.
pub fn sector_addr(lba: u32, sector_size: u32, offset: u32) -> MscResult<usize> {
    let base = lba.checked_mul(sector_size).ok_or_else(|| {
        log::error!("overflow lba {} sector_size {}", lba, sector_size);
        MscError::InvalidSize
    })?;
    let addr = base.checked_add(offset).ok_or_else(|| {
        log::error!("overflow addr {} offset {}", base, offset);
        MscError::InvalidSize
    })?;
    Ok(addr as usize)
}
