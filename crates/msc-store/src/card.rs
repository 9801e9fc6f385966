use crate::backend::StorageBackend;
use log::error;
use msc_core::{BackendKind, DriveSlot, MscError, MscResult};
use msc_hal::{BlockDisk, SectorCard};

/// Memory card addressed in whole sectors.
/// Callers guarantee transfer lengths are sector multiples; the intra-sector
/// offset is ignored.
pub struct CardBackend<C> {
    card: C,
    drive: Option<DriveSlot>,
}

impl<C: SectorCard> CardBackend<C> {
    pub fn new(card: C) -> Self {
        Self { card, drive: None }
    }

    pub fn into_inner(self) -> C {
        self.card
    }

    fn sectors(&self, len: usize) -> usize {
        match self.card.sector_size() {
            0 => 0,
            size => len / size as usize,
        }
    }
}

impl<C: SectorCard> BlockDisk for CardBackend<C> {
    fn sector_count(&self) -> u32 {
        self.card.capacity()
    }

    fn sector_size(&self) -> u32 {
        self.card.sector_size()
    }

    fn read(&mut self, lba: u32, _offset: u32, dest: &mut [u8]) -> MscResult<()> {
        let count = self.sectors(dest.len());
        self.card.read_sectors(dest, lba, count)
    }

    fn write(&mut self, lba: u32, _offset: u32, src: &[u8]) -> MscResult<()> {
        let count = self.sectors(src.len());
        self.card.write_sectors(src, lba, count)
    }
}

impl<C: SectorCard> StorageBackend for CardBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Card
    }

    fn mount(&mut self, slot: DriveSlot) -> MscResult<()> {
        self.drive = Some(slot);
        // No presence polling while attached.
        self.card.set_status_check(false);
        Ok(())
    }

    fn unmount(&mut self) -> MscResult<DriveSlot> {
        self.drive.take().ok_or_else(|| {
            error!("Invalid state: card not attached to any drive");
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
