use msc_core::{MscError, MscResult};
use msc_hal::{SectorCard, WearLevel};

const ERASED: u8 = 0xFF;

/// NOR flash partition in RAM, already wear-leveled.
///
/// Programming can only clear bits: a write over cells that were not erased
/// first reads back wrong and fails with `MediaError`.
pub struct RamFlash {
    mem: Vec<u8>,
    sector_size: usize,
    erases: Vec<u32>,
}

impl RamFlash {
    pub fn new(sectors: usize, sector_size: usize) -> Self {
        Self {
            mem: vec![ERASED; sectors * sector_size],
            sector_size,
            erases: vec![0; sectors],
        }
    }

    /// How many times the sector at `index` was erased.
    pub fn erase_count(&self, index: usize) -> u32 {
        self.erases.get(index).copied().unwrap_or(0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }

    fn range(&self, addr: usize, len: usize) -> MscResult<core::ops::Range<usize>> {
        match addr.checked_add(len) {
            Some(end) if end <= self.mem.len() => Ok(addr..end),
            _ => Err(MscError::InvalidSize),
        }
    }
}

impl WearLevel for RamFlash {
    fn size(&self) -> usize {
        self.mem.len()
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read(&mut self, addr: usize, dest: &mut [u8]) -> MscResult<()> {
        let r = self.range(addr, dest.len())?;
        dest.copy_from_slice(&self.mem[r]);
        Ok(())
    }

    fn write(&mut self, addr: usize, src: &[u8]) -> MscResult<()> {
        let r = self.range(addr, src.len())?;
        let cells = &mut self.mem[r];
        for (cell, byte) in cells.iter_mut().zip(src) {
            *cell &= *byte;
        }
        if &cells[..] != src {
            log::error!("program over non-erased cells at {:#x}", addr);
            return Err(MscError::MediaError);
        }
        Ok(())
    }

    fn erase_range(&mut self, addr: usize, len: usize) -> MscResult<()> {
        if self.sector_size == 0 || addr % self.sector_size != 0 || len % self.sector_size != 0 {
            return Err(MscError::InvalidArg);
        }
        let r = self.range(addr, len)?;
        let first = addr / self.sector_size;
        for count in &mut self.erases[first..first + len / self.sector_size] {
            *count += 1;
        }
        self.mem[r].fill(ERASED);
        Ok(())
    }
}

/// SD card in RAM.
pub struct RamCard {
    mem: Vec<u8>,
    sector_size: u32,
    status_check: bool,
}

impl RamCard {
    pub fn new(sectors: u32, sector_size: u32) -> Self {
        Self {
            mem: vec![0; sectors as usize * sector_size as usize],
            sector_size,
            status_check: true,
        }
    }

    /// Whether the driver still checks card presence.
    pub fn status_check_enabled(&self) -> bool {
        self.status_check
    }

    fn range(&self, start: u32, count: usize, buf_len: usize) -> MscResult<core::ops::Range<usize>> {
        let ss = self.sector_size as usize;
        let len = count.checked_mul(ss).ok_or(MscError::InvalidSize)?;
        if buf_len < len {
            return Err(MscError::InvalidArg);
        }
        let at = (start as usize).checked_mul(ss).ok_or(MscError::InvalidSize)?;
        match at.checked_add(len) {
            Some(end) if end <= self.mem.len() => Ok(at..end),
            _ => Err(MscError::InvalidSize),
        }
    }
}

impl SectorCard for RamCard {
    fn capacity(&self) -> u32 {
        if self.sector_size == 0 {
            return 0;
        }
        (self.mem.len() / self.sector_size as usize) as u32
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_sectors(&mut self, dest: &mut [u8], start: u32, count: usize) -> MscResult<()> {
        let r = self.range(start, count, dest.len())?;
        let n = r.len();
        dest[..n].copy_from_slice(&self.mem[r]);
        Ok(())
    }

    fn write_sectors(&mut self, src: &[u8], start: u32, count: usize) -> MscResult<()> {
        let r = self.range(start, count, src.len())?;
        let n = r.len();
        self.mem[r].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn set_status_check(&mut self, enabled: bool) {
        self.status_check = enabled;
    }
}
