use crate::backend::{sector_addr, StorageBackend};
use log::{error, warn};
use msc_core::{BackendKind, DriveSlot, MscError, MscResult};
use msc_hal::{BlockDisk, WearLevel};

/// SPI flash behind a wear-leveling layer.
pub struct FlashBackend<W> {
    wl: W,
    drive: Option<DriveSlot>,
}

impl<W: WearLevel> FlashBackend<W> {
    pub fn new(wl: W) -> Self {
        Self { wl, drive: None }
    }

    pub fn into_inner(self) -> W {
        self.wl
    }
}

/// Media geometry past the 32-bit address space saturates.
fn clamp_u32(v: usize, what: &str) -> u32 {
    u32::try_from(v).unwrap_or_else(|_| {
        warn!("WL {} {} exceeds 32 bits", what, v);
        u32::MAX
    })
}

impl<W: WearLevel> BlockDisk for FlashBackend<W> {
    fn sector_count(&self) -> u32 {
        let size = self.wl.sector_size();
        if size == 0 {
            warn!("WL sector size is zero");
            return 0;
        }
        clamp_u32(self.wl.size() / size, "sector count")
    }

    fn sector_size(&self) -> u32 {
        clamp_u32(self.wl.sector_size(), "sector size")
    }

    fn read(&mut self, lba: u32, offset: u32, dest: &mut [u8]) -> MscResult<()> {
        let addr = sector_addr(lba, self.sector_size(), offset)?;
        self.wl.read(addr, dest)
    }

    fn write(&mut self, lba: u32, offset: u32, src: &[u8]) -> MscResult<()> {
        let addr = sector_addr(lba, self.sector_size(), offset)?;
        // Program only lands on erased cells.
        self.wl.erase_range(addr, src.len()).map_err(|e| {
            error!("Failed to erase addr {} len {}: {}", addr, src.len(), e);
            e
        })?;
        self.wl.write(addr, src)
    }
}

impl<W: WearLevel> StorageBackend for FlashBackend<W> {
    fn kind(&self) -> BackendKind {
        BackendKind::Flash
    }

    fn erase_unit(&self) -> Option<u32> {
        Some(clamp_u32(self.wl.sector_size(), "erase unit"))
    }

    fn mount(&mut self, slot: DriveSlot) -> MscResult<()> {
        self.drive = Some(slot);
        Ok(())
    }

    fn unmount(&mut self) -> MscResult<DriveSlot> {
        self.drive.take().ok_or_else(|| {
            error!("Invalid state: flash not attached to any drive");
            MscError::InvalidState
        })
    }

    fn drive(&self) -> Option<DriveSlot> {
        self.drive
    }

    fn as_disk(&mut self) -> &mut dyn BlockDisk {
        self
    }
}
