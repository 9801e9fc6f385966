#![cfg(feature = "std")]

use msc_core::{MscError, MscResult};
use msc_hal::WearLevel;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::vec;

const ERASED: u8 = 0xFF;

/// Flash partition emulated by a disk image file.
/// Erased bytes read back as 0xFF, like NOR flash.
pub struct ImageFlash {
    file: File,
    path: PathBuf,
    size: usize,
    sector_size: usize,
}

impl ImageFlash {
    /// Open `path`, creating an erased image of `size` bytes if it does not
    /// exist yet. An existing image keeps its content.
    pub fn open<P: AsRef<Path>>(path: P, size: usize, sector_size: usize) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .read(true).write(true).create(true)
            .open(&path)?;

        if fresh || file.metadata()?.len() < size as u64 {
            file.set_len(0)?;
            file.write_all(&vec![ERASED; size])?;
            file.sync_all()?;
        }

        Ok(Self { file, path, size, sector_size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, addr: usize, len: usize) -> MscResult<()> {
        match addr.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MscError::InvalidSize),
        }
    }
}

impl WearLevel for ImageFlash {
    fn size(&self) -> usize {
        self.size
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read(&mut self, addr: usize, dest: &mut [u8]) -> MscResult<()> {
        self.check(addr, dest.len())?;
        self.file.seek(SeekFrom::Start(addr as u64)).map_err(|_| MscError::MediaError)?;
        self.file.read_exact(dest).map_err(|_| MscError::MediaError)
    }

    fn write(&mut self, addr: usize, src: &[u8]) -> MscResult<()> {
        self.check(addr, src.len())?;
        self.file.seek(SeekFrom::Start(addr as u64)).map_err(|_| MscError::MediaError)?;
        self.file.write_all(src).map_err(|_| MscError::MediaError)?;
        // FSYNC: the write is done when it hits the image
        self.file.sync_data().map_err(|_| MscError::MediaError)
    }

    fn erase_range(&mut self, addr: usize, len: usize) -> MscResult<()> {
        self.check(addr, len)?;
        self.file.seek(SeekFrom::Start(addr as u64)).map_err(|_| MscError::EraseFailed)?;
        self.file.write_all(&vec![ERASED; len]).map_err(|_| MscError::EraseFailed)
    }
}
