use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use log::{debug, error, info, warn};
use rand::Rng;

use msc_core::{allocation_unit, DriveSlot, FatType, FormatPolicy, MscError, MscResult};
use msc_hal::{BlockDisk, FatDriver};

const SIGNATURE_AT: usize = 510;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PARTITION_ENTRY: usize = 446;
const DIR_ENTRY_SIZE: u32 = 32;
const MIN_SECTOR: u32 = 512;
const MAX_SECTOR: u32 = 4096;
const FAT12_MAX_CLUSTERS: u64 = 4085;
const FAT16_MAX_CLUSTERS: u64 = 65525;

/// First sector of the volume when a partition table is written.
pub const PARTITION_START: u32 = 63;

/// A mounted FAT volume over a disk, as handed out by `open_volume`.
pub type Volume<'a> = fatfs::FileSystem<BlockStream<'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat12,
    Fat16,
    Fat32,
}

impl From<fatfs::FatType> for FsKind {
    fn from(t: fatfs::FatType) -> Self {
        match t {
            fatfs::FatType::Fat12 => FsKind::Fat12,
            fatfs::FatType::Fat16 => FsKind::Fat16,
            fatfs::FatType::Fat32 => FsKind::Fat32,
        }
    }
}

impl FsKind {
    fn partition_type(self) -> u8 {
        match self {
            FsKind::Fat12 => 0x01,
            FsKind::Fat16 => 0x0E,
            FsKind::Fat32 => 0x0C,
        }
    }
}

/// What the driver found when it mounted a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub kind: FsKind,
    pub serial: u32,
    /// First sector of the volume on the disk.
    pub start: u32,
    pub sectors: u32,
    pub cluster_size: u32,
    pub clusters: u32,
    pub free_clusters: u32,
}

// --- Byte stream over a sector disk ---

/// `Read + Write + Seek` view of `sectors` sectors of a disk starting at
/// `base`. One sector is cached; dirty data goes out on sector change,
/// `flush` or drop.
pub struct BlockStream<'a> {
    disk: &'a mut dyn BlockDisk,
    base: u32,
    sectors: u32,
    sector_size: u32,
    pos: u64,
    cache: Vec<u8>,
    cached: Option<u32>,
    dirty: bool,
}

fn io_error(e: MscError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

impl<'a> BlockStream<'a> {
    pub fn new(disk: &'a mut dyn BlockDisk, base: u32, sectors: u32) -> MscResult<Self> {
        let sector_size = disk.sector_size();
        if sector_size == 0 {
            return Err(MscError::InvalidSize);
        }
        Ok(Self {
            disk,
            base,
            sectors,
            sector_size,
            pos: 0,
            cache: vec![0u8; sector_size as usize],
            cached: None,
            dirty: false,
        })
    }

    fn len(&self) -> u64 {
        self.sectors as u64 * self.sector_size as u64
    }

    /// Sector index and offset inside it for the current position.
    fn locate(&self) -> (u32, usize) {
        let ss = self.sector_size as u64;
        ((self.pos / ss) as u32, (self.pos % ss) as usize)
    }

    fn write_back(&mut self) -> io::Result<()> {
        if let (true, Some(index)) = (self.dirty, self.cached) {
            self.disk.write(self.base + index, 0, &self.cache).map_err(io_error)?;
        }
        self.dirty = false;
        Ok(())
    }

    fn load(&mut self, index: u32, fill: bool) -> io::Result<()> {
        if self.cached == Some(index) {
            return Ok(());
        }
        self.write_back()?;
        self.cached = None;
        if fill {
            self.disk.read(self.base + index, 0, &mut self.cache).map_err(io_error)?;
        }
        self.cached = Some(index);
        Ok(())
    }
}

impl Read for BlockStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len() {
            return Ok(0);
        }
        let (index, at) = self.locate();
        self.load(index, true)?;
        let n = buf.len().min(self.cache.len() - at);
        buf[..n].copy_from_slice(&self.cache[at..at + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for BlockStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len() {
            return Ok(0);
        }
        let (index, at) = self.locate();
        let n = buf.len().min(self.cache.len() - at);
        // A whole-sector overwrite needs no read.
        self.load(index, n < self.cache.len())?;
        self.cache[at..at + n].copy_from_slice(&buf[..n]);
        self.dirty = true;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_back()
    }
}

impl Seek for BlockStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => self.len().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.pos = target;
        Ok(target)
    }
}

impl Drop for BlockStream<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.write_back() {
            error!("lost cached sector on drop: {}", e);
        }
    }
}

// --- Boot sector screening ---

fn get_u16(buf: &[u8], at: usize) -> u32 {
    u16::from_le_bytes([buf[at], buf[at + 1]]) as u32
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn has_signature(sector: &[u8]) -> bool {
    sector.len() >= SIGNATURE_AT + 2 && sector[SIGNATURE_AT..SIGNATURE_AT + 2] == BOOT_SIGNATURE
}

fn is_boot_sector(sector: &[u8]) -> bool {
    has_signature(sector) && matches!(sector[0], 0xEB | 0xE9)
}

/// Geometry checks done with checked arithmetic before fatfs sees the BPB.
fn screen_boot_sector(boot: &[u8], sector_size: u32, volume_sectors: u32) -> MscResult<()> {
    if !is_boot_sector(boot) || get_u16(boot, 11) != sector_size {
        return Err(MscError::NoFilesystem);
    }
    let spc = boot[13] as u32;
    let reserved = get_u16(boot, 14);
    let fats = boot[16] as u32;
    if spc == 0 || !spc.is_power_of_two() || reserved == 0 || fats == 0 {
        return Err(MscError::NoFilesystem);
    }

    let root_sectors = (get_u16(boot, 17) * DIR_ENTRY_SIZE + sector_size - 1) / sector_size;
    let fat_sectors = match get_u16(boot, 22) {
        0 => get_u32(boot, 36),
        n => n,
    };
    let total = match get_u16(boot, 19) {
        0 => get_u32(boot, 32),
        n => n,
    };

    let meta = fats
        .checked_mul(fat_sectors)
        .and_then(|f| f.checked_add(reserved))
        .and_then(|m| m.checked_add(root_sectors));
    let fat_bits = fat_sectors.checked_mul(sector_size * 8);
    match (meta, fat_bits) {
        (Some(meta), Some(_)) if fat_sectors > 0 && meta < total && total <= volume_sectors => Ok(()),
        _ => {
            warn!(
                "boot sector rejected: {} FATs x {} sectors, {} reserved, {} total of {}",
                fats, fat_sectors, reserved, total, volume_sectors
            );
            Err(MscError::NoFilesystem)
        }
    }
}

/// Where the volume lives: `(first sector, sector count)`.
fn locate_volume(disk: &mut dyn BlockDisk) -> MscResult<(u32, u32)> {
    let ss = disk.sector_size();
    if !(MIN_SECTOR..=MAX_SECTOR).contains(&ss) {
        return Err(MscError::NoFilesystem);
    }
    let count = disk.sector_count();
    let mut sector = vec![0u8; ss as usize];
    disk.read(0, 0, &mut sector).map_err(disk_error)?;

    let (start, sectors) = if is_boot_sector(&sector) {
        (0, count)
    } else if has_signature(&sector) && sector[PARTITION_ENTRY + 4] != 0 {
        let entry = &sector[PARTITION_ENTRY..PARTITION_ENTRY + 16];
        let start = get_u32(entry, 8);
        if start == 0 || start >= count {
            return Err(MscError::NoFilesystem);
        }
        (start, get_u32(entry, 12).min(count - start))
    } else {
        return Err(MscError::NoFilesystem);
    };

    if start != 0 {
        disk.read(start, 0, &mut sector).map_err(disk_error)?;
    }
    screen_boot_sector(&sector, ss, sectors)?;
    Ok((start, sectors))
}

fn disk_error(e: MscError) -> MscError {
    error!("disk I/O failed ({})", e);
    MscError::FsFailure
}

/// Disk faults surface as `FsFailure`; anything else fatfs reports becomes
/// `otherwise`.
fn fs_error(e: io::Error, otherwise: MscError) -> MscError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<MscError>()) {
        Some(fault) => disk_error(*fault),
        None => {
            debug!("fatfs: {}", e);
            otherwise
        }
    }
}

/// Open the FAT volume on `disk` (whole disk or first partition).
/// `NoFilesystem` when there is none.
pub fn open_volume(disk: &mut dyn BlockDisk) -> MscResult<Volume<'_>> {
    let (start, sectors) = locate_volume(disk)?;
    let stream = BlockStream::new(disk, start, sectors)?;
    fatfs::FileSystem::new(stream, fatfs::FsOptions::new())
        .map_err(|e| fs_error(e, MscError::NoFilesystem))
}

fn write_partition_table(sector: &mut [u8], kind: FsKind, start: u32, sectors: u32) {
    sector.fill(0);
    let entry = &mut sector[PARTITION_ENTRY..PARTITION_ENTRY + 16];
    entry[4] = kind.partition_type();
    entry[8..12].copy_from_slice(&start.to_le_bytes());
    entry[12..16].copy_from_slice(&sectors.to_le_bytes());
    sector[SIGNATURE_AT..SIGNATURE_AT + 2].copy_from_slice(&BOOT_SIGNATURE);
}

/// Requested FAT family against what the volume size allows.
fn check_policy(fat_type: FatType, clusters: u64) -> MscResult<()> {
    match fat_type {
        FatType::ExFat => {
            warn!("exFAT is not enabled in this driver");
            Err(MscError::NotSupported)
        }
        FatType::Fat32 if clusters < FAT16_MAX_CLUSTERS => {
            error!("{} clusters too few for FAT32", clusters);
            Err(MscError::FsFailure)
        }
        FatType::Fat if clusters >= FAT16_MAX_CLUSTERS => {
            error!("{} clusters do not fit FAT12/16", clusters);
            Err(MscError::FsFailure)
        }
        _ => Ok(()),
    }
}

fn kind_matches(fat_type: FatType, kind: FsKind) -> bool {
    match fat_type {
        FatType::Fat32 => kind == FsKind::Fat32,
        FatType::Fat => kind != FsKind::Fat32,
        _ => true,
    }
}

// --- Driver ---

/// FAT driver for the host build: drive slot table, path registry, and
/// volumes formatted and mounted with `fatfs`.
pub struct HostFat {
    slots: Vec<bool>,
    paths: HashMap<String, (DriveSlot, usize)>,
    volumes: HashMap<u8, VolumeInfo>,
}

impl HostFat {
    /// `drives`: number of volumes that can be mounted at the same time.
    pub fn new(drives: usize) -> Self {
        Self {
            slots: vec![false; drives],
            paths: HashMap::new(),
            volumes: HashMap::new(),
        }
    }

    pub fn volume(&self, slot: DriveSlot) -> Option<VolumeInfo> {
        self.volumes.get(&slot.0).copied()
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Open-file limit registered for `path`.
    pub fn max_files(&self, path: &str) -> Option<usize> {
        self.paths.get(path).map(|(_, n)| *n)
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.iter().filter(|used| **used).count()
    }

    fn check_slot(&self, slot: DriveSlot) -> MscResult<()> {
        match self.slots.get(slot.0 as usize) {
            Some(true) => Ok(()),
            _ => {
                error!("drive {} not acquired", slot);
                Err(MscError::FsInternal)
            }
        }
    }
}

impl FatDriver for HostFat {
    fn acquire_slot(&mut self) -> MscResult<DriveSlot> {
        let idx = self
            .slots
            .iter()
            .position(|used| !used)
            .ok_or(MscError::ResourceExhausted)?;
        self.slots[idx] = true;
        Ok(DriveSlot(idx as u8))
    }

    fn release_slot(&mut self, slot: DriveSlot) {
        if let Some(used) = self.slots.get_mut(slot.0 as usize) {
            *used = false;
        }
    }

    fn register(&mut self, path: &str, slot: DriveSlot, max_files: usize) -> MscResult<()> {
        if self.paths.contains_key(path) {
            return Err(MscError::AlreadyRegistered);
        }
        self.check_slot(slot).map_err(|_| MscError::InvalidState)?;
        self.paths.insert(path.to_string(), (slot, max_files));
        debug!("{} -> drive {} ({} files)", path, slot, max_files);
        Ok(())
    }

    fn unregister(&mut self, path: &str) -> MscResult<()> {
        self.paths.remove(path).map(|_| ()).ok_or(MscError::InvalidState)
    }

    fn mount(&mut self, slot: DriveSlot, disk: &mut dyn BlockDisk) -> MscResult<()> {
        self.check_slot(slot)?;
        let (start, sectors) = locate_volume(disk)?;
        let stream = BlockStream::new(disk, start, sectors)?;
        let fs = fatfs::FileSystem::new(stream, fatfs::FsOptions::new())
            .map_err(|e| fs_error(e, MscError::NoFilesystem))?;
        let stats = fs.stats().map_err(|e| fs_error(e, MscError::FsInternal))?;

        let volume = VolumeInfo {
            kind: fs.fat_type().into(),
            serial: fs.volume_id(),
            start,
            sectors,
            cluster_size: stats.cluster_size(),
            clusters: stats.total_clusters(),
            free_clusters: stats.free_clusters(),
        };
        fs.unmount().map_err(|e| fs_error(e, MscError::FsInternal))?;

        info!(
            "drive {}: {:?} volume {:08X}, {} of {} clusters free ({} bytes)",
            slot, volume.kind, volume.serial, volume.free_clusters, volume.clusters, volume.cluster_size
        );
        self.volumes.insert(slot.0, volume);
        Ok(())
    }

    fn format(
        &mut self,
        slot: DriveSlot,
        disk: &mut dyn BlockDisk,
        policy: &FormatPolicy,
        work: &mut [u8],
    ) -> MscResult<()> {
        self.check_slot(slot)?;
        let ss = disk.sector_size();
        if !(MIN_SECTOR..=MAX_SECTOR).contains(&ss) || !ss.is_power_of_two() {
            error!("sector size {} not supported", ss);
            return Err(MscError::NotSupported);
        }
        if work.len() < ss as usize {
            error!("work area {} smaller than a sector", work.len());
            return Err(MscError::FsFailure);
        }

        let start = if policy.single_partition { 0 } else { PARTITION_START };
        let sectors = disk
            .sector_count()
            .checked_sub(start)
            .filter(|n| *n > 0)
            .ok_or(MscError::FsFailure)?;
        // Whole power-of-two number of sectors.
        let cluster = allocation_unit(ss as usize, work.len()) as u32;
        let cluster = 1u32 << (31 - cluster.leading_zeros());
        check_policy(policy.fat_type, sectors as u64 * ss as u64 / cluster as u64)?;

        let serial: u32 = rand::thread_rng().gen();
        let options = fatfs::FormatVolumeOptions::new()
            .bytes_per_sector(ss as u16)
            .total_sectors(sectors)
            .bytes_per_cluster(cluster)
            .volume_id(serial)
            .volume_label(*b"NO NAME    ");

        let kind = {
            let mut stream = BlockStream::new(&mut *disk, start, sectors)?;
            let formatted = fatfs::format_volume(&mut stream, options).and_then(|_| stream.flush());
            formatted.map_err(|e| fs_error(e, MscError::FsFailure))?;

            stream.seek(SeekFrom::Start(0)).map_err(|e| fs_error(e, MscError::FsInternal))?;
            let fs = fatfs::FileSystem::new(&mut stream, fatfs::FsOptions::new())
                .map_err(|e| fs_error(e, MscError::FsFailure))?;
            let kind = FsKind::from(fs.fat_type());
            fs.unmount().map_err(|e| fs_error(e, MscError::FsFailure))?;
            stream.flush().map_err(|e| fs_error(e, MscError::FsFailure))?;
            kind
        };

        if !kind_matches(policy.fat_type, kind) {
            error!("{:?} requested, volume came out {:?}", policy.fat_type, kind);
            return Err(MscError::FsFailure);
        }

        if start > 0 {
            let sector = &mut work[..ss as usize];
            write_partition_table(sector, kind, start, sectors);
            disk.write(0, 0, sector).map_err(disk_error)?;
        }

        info!(
            "formatted {:?}: {} sectors at {}, cluster {} bytes, serial {:08X}",
            kind, sectors, start, cluster, serial
        );
        Ok(())
    }

    fn detach(&mut self, slot: DriveSlot) {
        if self.volumes.remove(&slot.0).is_some() {
            debug!("drive {} detached", slot);
        }
    }
}
