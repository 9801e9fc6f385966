use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, error, info, warn};

use msc_core::{
    allocation_unit, BackendKind, DriveSlot, EventKind, FormatPolicy, MountState, MscError,
    MscEvent, MscResult, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_FILES, DEFAULT_MOUNT_PATH,
    FS_WORKBUF_SIZE, MEM_ALIGN,
};
use msc_hal::{FatDriver, SectorCard, WearLevel};
use msc_store::{CardBackend, FlashBackend, StorageBackend};

/// Lifecycle notification sink.
pub type MscCallback = Box<dyn Fn(&MscEvent) + Send + Sync>;

pub struct SessionConfig {
    /// Write slot capacity. Multiple of `MEM_ALIGN`; for flash at least one
    /// erase unit.
    pub buffer_size: usize,
    /// Passed to the FAT driver. Zero or negative means `DEFAULT_MAX_FILES`.
    pub max_files: i32,
    /// Mount point used when `mount` gets no path.
    pub mount_path: String,
    pub format: FormatPolicy,
    pub on_mount_changed: Option<MscCallback>,
    pub on_premount_changed: Option<MscCallback>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_files: DEFAULT_MAX_FILES as i32,
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            format: FormatPolicy::default(),
            on_mount_changed: None,
            on_premount_changed: None,
        }
    }
}

/// Storage session: one backend, its geometry, and who owns the volume.
///
/// `Unmounted`: the command bridge has raw sector access.
/// `Mounted`: the FAT driver owns the volume; raw writes are refused.
pub struct Session {
    backend: Box<dyn StorageBackend>,
    fs: Box<dyn FatDriver>,
    sector_count: u32,
    sector_size: u32,
    state: MountState,
    base_path: Option<String>,
    last_path: String,
    default_path: String,
    max_files: usize,
    buffer_size: usize,
    format: FormatPolicy,
    on_premount_changed: Option<MscCallback>,
    on_mount_changed: Option<MscCallback>,
}

impl Session {
    pub fn new(
        backend: Box<dyn StorageBackend>,
        fs: Box<dyn FatDriver>,
        config: SessionConfig,
    ) -> MscResult<Self> {
        let sector_size = backend.sector_size();
        if sector_size == 0 {
            error!("Backend reports a zero sector size");
            return Err(MscError::InvalidSize);
        }
        if config.buffer_size == 0 || config.buffer_size % MEM_ALIGN != 0 {
            error!("Buffer size ({}) must be divisible by {}", config.buffer_size, MEM_ALIGN);
            return Err(MscError::InvalidSize);
        }
        if let Some(unit) = backend.erase_unit() {
            if config.buffer_size < unit as usize {
                error!(
                    "Buffer size ({}) must be at least the erase unit ({})",
                    config.buffer_size, unit
                );
                return Err(MscError::NotSupported);
            }
        }

        let sector_count = backend.sector_count();
        let max_files = if config.max_files > 0 {
            config.max_files as usize
        } else {
            DEFAULT_MAX_FILES
        };

        info!(
            "Storage session: {:?}, {} sectors x {} bytes, buffer {}",
            backend.kind(),
            sector_count,
            sector_size,
            config.buffer_size
        );

        Ok(Self {
            backend,
            fs,
            sector_count,
            sector_size,
            state: MountState::Unmounted,
            base_path: None,
            last_path: config.mount_path.clone(),
            default_path: config.mount_path,
            max_files,
            buffer_size: config.buffer_size,
            format: config.format,
            on_premount_changed: config.on_premount_changed,
            on_mount_changed: config.on_mount_changed,
        })
    }

    /// Session over SPI flash behind a wear-leveling layer.
    pub fn flash<W: WearLevel + 'static>(
        wl: W,
        fs: Box<dyn FatDriver>,
        config: SessionConfig,
    ) -> MscResult<Self> {
        Self::new(Box::new(FlashBackend::new(wl)), fs, config)
    }

    /// Session over a sector-addressed card.
    pub fn card<C: SectorCard + 'static>(
        card: C,
        fs: Box<dyn FatDriver>,
        config: SessionConfig,
    ) -> MscResult<Self> {
        Self::new(Box::new(CardBackend::new(card)), fs, config)
    }

    /// Release the backend and the FAT driver.
    pub fn deinit(self) -> (Box<dyn StorageBackend>, Box<dyn FatDriver>) {
        if self.state.is_mounted() {
            warn!("Session torn down while mounted at {:?}", self.base_path);
        }
        (self.backend, self.fs)
    }

    pub fn sector_count(&self) -> u32 { self.sector_count }
    pub fn sector_size(&self) -> u32 { self.sector_size }
    pub fn buffer_size(&self) -> usize { self.buffer_size }
    pub fn max_files(&self) -> usize { self.max_files }
    pub fn backend_kind(&self) -> BackendKind { self.backend.kind() }
    pub fn state(&self) -> MountState { self.state }

    pub fn is_mounted(&self) -> bool {
        self.state.is_mounted()
    }

    /// True while the host has raw access (volume not mounted locally).
    pub fn in_use_by_host(&self) -> bool {
        !self.state.is_mounted()
    }

    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    /// Path of the last successful mount, or the configured default.
    pub fn last_path(&self) -> &str {
        &self.last_path
    }

    pub fn register_callback(&mut self, kind: EventKind, cb: MscCallback) {
        match kind {
            EventKind::MountChanged => self.on_mount_changed = Some(cb),
            EventKind::PremountChanged => self.on_premount_changed = Some(cb),
        }
    }

    pub fn unregister_callback(&mut self, kind: EventKind) {
        match kind {
            EventKind::MountChanged => self.on_mount_changed = None,
            EventKind::PremountChanged => self.on_premount_changed = None,
        }
    }

    fn notify(&self, kind: EventKind) {
        let cb = match kind {
            EventKind::MountChanged => &self.on_mount_changed,
            EventKind::PremountChanged => &self.on_premount_changed,
        };
        if let Some(cb) = cb {
            cb(&MscEvent { kind, is_mounted: self.state.is_mounted() });
        }
    }

    /// Hand the volume to the FAT driver, formatting a blank medium first.
    /// Any failure leaves the session `Unmounted` with the drive slot freed.
    pub fn mount(&mut self, path: Option<&str>) -> MscResult<()> {
        if self.state.is_mounted() {
            return Ok(());
        }
        self.notify(EventKind::PremountChanged);

        let path = path.unwrap_or(self.default_path.as_str()).to_string();

        let slot = self.fs.acquire_slot().map_err(|e| {
            error!("The maximum count of volumes is already mounted");
            e
        })?;

        let mut registered = false;
        if let Err(e) = self.attach(slot, &path, &mut registered) {
            if registered {
                if let Err(re) = self.fs.unregister(&path) {
                    warn!("Rollback: unregister {} failed ({})", path, re);
                }
            }
            self.fs.detach(slot);
            if self.backend.drive().is_some() {
                if let Err(re) = self.backend.unmount() {
                    warn!("Rollback: backend unmount failed ({})", re);
                }
            }
            self.fs.release_slot(slot);
            self.state = MountState::Unmounted;
            warn!("Failed to mount storage ({})", e);
            return Err(e);
        }

        self.state = MountState::Mounted;
        self.base_path = Some(path.clone());
        self.last_path = path;
        self.notify(EventKind::MountChanged);
        Ok(())
    }

    fn attach(&mut self, slot: DriveSlot, path: &str, registered: &mut bool) -> MscResult<()> {
        self.backend.mount(slot).map_err(|e| {
            error!("Failed pdrv={} ({})", slot, e);
            e
        })?;

        match self.fs.register(path, slot, self.max_files) {
            Ok(()) => *registered = true,
            Err(MscError::AlreadyRegistered) => debug!("it's okay, {} already registered", path),
            Err(e) => {
                error!("VFS register of {} failed ({})", path, e);
                return Err(e);
            }
        }

        self.mount_or_format(slot)
    }

    fn mount_or_format(&mut self, slot: DriveSlot) -> MscResult<()> {
        match self.fs.mount(slot, self.backend.as_disk()) {
            Ok(()) => return Ok(()),
            Err(e @ (MscError::NoFilesystem | MscError::FsInternal)) => {
                warn!("f_mount failed ({})", e)
            }
            Err(e) => {
                warn!("f_mount failed ({})", e);
                return Err(e);
            }
        }

        // Released on every path out of this function.
        let mut work = Vec::new();
        work.try_reserve_exact(FS_WORKBUF_SIZE).map_err(|_| MscError::NoMem)?;
        work.resize(FS_WORKBUF_SIZE, 0u8);

        warn!(
            "formatting card, allocation unit size={}",
            allocation_unit(self.sector_size as usize, FS_WORKBUF_SIZE)
        );
        self.fs
            .format(slot, self.backend.as_disk(), &self.format, &mut work)
            .map_err(|e| {
                error!("f_mkfs failed ({})", e);
                e
            })?;
        drop(work);

        self.fs.mount(slot, self.backend.as_disk()).map_err(|e| {
            error!("f_mount failed after formatting ({})", e);
            e
        })
    }

    /// Take the volume away from the FAT driver so the host can own it.
    /// If the backend refuses, nothing changes.
    pub fn unmount(&mut self) -> MscResult<()> {
        if !self.state.is_mounted() {
            return Ok(());
        }
        self.notify(EventKind::PremountChanged);

        let slot = self.backend.unmount()?;
        self.fs.detach(slot);
        self.fs.release_slot(slot);

        let result = match self.base_path.take() {
            Some(path) => self.fs.unregister(&path),
            None => Ok(()),
        };
        self.state = MountState::Unmounted;

        self.notify(EventKind::MountChanged);
        result
    }

    /// Mount again at the last known path.
    pub fn remount(&mut self) -> MscResult<()> {
        let path = self.last_path.clone();
        self.mount(Some(&path))
    }

    pub fn read(&mut self, lba: u32, offset: u32, dest: &mut [u8]) -> MscResult<()> {
        self.backend.read(lba, offset, dest)
    }

    /// Checks a raw write would be accepted, without touching the medium.
    pub fn check_write(&self, lba: u32, offset: u32, len: usize) -> MscResult<()> {
        if self.state.is_mounted() {
            error!("can't write, FAT mounted");
            return Err(MscError::InvalidState);
        }
        if len % self.sector_size as usize != 0 {
            error!(
                "Invalid Argument lba({}) offset({}) size({}) sector_size({})",
                lba, offset, len, self.sector_size
            );
            return Err(MscError::InvalidArg);
        }
        Ok(())
    }

    pub fn write(&mut self, lba: u32, offset: u32, src: &[u8]) -> MscResult<()> {
        self.check_write(lba, offset, src.len())?;
        self.backend.write(lba, offset, src)
    }
}
