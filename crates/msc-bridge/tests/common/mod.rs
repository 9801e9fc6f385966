#![allow(dead_code)]

use msc_bridge::{MscCallback, Session, SessionConfig};
use msc_core::{DriveSlot, FormatPolicy, MscError, MscEvent, MscResult};
use msc_hal::{BlockDisk, FatDriver, WearLevel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const FS_MAGIC: &[u8; 4] = b"FAT!";

// --- TRACE ---
#[derive(Default)]
pub struct Trace {
    pub log: Vec<String>,
    pub media_reads: usize,
    pub media_writes: usize,
    pub formats: usize,
    pub slots_in_use: usize,
    pub max_files: Option<usize>,
}

pub type Tracer = Arc<Mutex<Trace>>;

pub fn tracer() -> Tracer {
    Arc::new(Mutex::new(Trace::default()))
}

pub fn record(p: &Tracer, entry: impl Into<String>) {
    p.lock().unwrap().log.push(entry.into());
}

pub fn entries(p: &Tracer) -> Vec<String> {
    p.lock().unwrap().log.clone()
}

pub fn media_writes(p: &Tracer) -> usize {
    p.lock().unwrap().media_writes
}

/// Callbacks that log "pre:<is_mounted>" and "post:<is_mounted>".
pub fn recorders(p: &Tracer) -> (MscCallback, MscCallback) {
    let pre = p.clone();
    let post = p.clone();
    (
        Box::new(move |ev: &MscEvent| record(&pre, format!("pre:{}", ev.is_mounted))),
        Box::new(move |ev: &MscEvent| record(&post, format!("post:{}", ev.is_mounted))),
    )
}

// --- MOCKS ---
pub struct MockFlash {
    mem: Vec<u8>,
    sector: usize,
    tracer: Tracer,
    pub fail_write: Arc<AtomicBool>,
}

impl MockFlash {
    pub fn new(sectors: usize, sector: usize, tracer: &Tracer) -> Self {
        Self {
            mem: vec![0xFF; sectors * sector],
            sector,
            tracer: tracer.clone(),
            fail_write: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl WearLevel for MockFlash {
    fn size(&self) -> usize { self.mem.len() }
    fn sector_size(&self) -> usize { self.sector }

    fn read(&mut self, addr: usize, dest: &mut [u8]) -> MscResult<()> {
        self.tracer.lock().unwrap().media_reads += 1;
        let end = addr.checked_add(dest.len()).filter(|e| *e <= self.mem.len()).ok_or(MscError::InvalidSize)?;
        dest.copy_from_slice(&self.mem[addr..end]);
        Ok(())
    }

    fn write(&mut self, addr: usize, src: &[u8]) -> MscResult<()> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(MscError::MediaError);
        }
        self.tracer.lock().unwrap().media_writes += 1;
        let end = addr.checked_add(src.len()).filter(|e| *e <= self.mem.len()).ok_or(MscError::InvalidSize)?;
        self.mem[addr..end].copy_from_slice(src);
        Ok(())
    }

    fn erase_range(&mut self, addr: usize, len: usize) -> MscResult<()> {
        let end = addr.checked_add(len).filter(|e| *e <= self.mem.len()).ok_or(MscError::InvalidSize)?;
        self.mem[addr..end].fill(0xFF);
        Ok(())
    }
}

/// FAT driver stand-in. A volume is "present" when sector 0 starts with
/// `FS_MAGIC`.
pub struct MockFat {
    slots: Vec<bool>,
    paths: Vec<String>,
    tracer: Tracer,
    pub fail_register: Option<MscError>,
    pub fail_mount: Option<MscError>,
    pub fail_unregister: Option<MscError>,
}

impl MockFat {
    pub fn new(slots: usize, tracer: &Tracer) -> Self {
        Self {
            slots: vec![false; slots],
            paths: Vec::new(),
            tracer: tracer.clone(),
            fail_register: None,
            fail_mount: None,
            fail_unregister: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.paths.push(path.to_string());
        self
    }
}

impl FatDriver for MockFat {
    fn acquire_slot(&mut self) -> MscResult<DriveSlot> {
        let idx = self.slots.iter().position(|used| !used).ok_or(MscError::ResourceExhausted)?;
        self.slots[idx] = true;
        self.tracer.lock().unwrap().slots_in_use += 1;
        record(&self.tracer, "fs.acquire");
        Ok(DriveSlot(idx as u8))
    }

    fn release_slot(&mut self, slot: DriveSlot) {
        if std::mem::replace(&mut self.slots[slot.0 as usize], false) {
            self.tracer.lock().unwrap().slots_in_use -= 1;
        }
        record(&self.tracer, "fs.release");
    }

    fn register(&mut self, path: &str, _slot: DriveSlot, max_files: usize) -> MscResult<()> {
        if let Some(e) = self.fail_register {
            return Err(e);
        }
        if self.paths.iter().any(|p| p == path) {
            return Err(MscError::AlreadyRegistered);
        }
        self.paths.push(path.to_string());
        self.tracer.lock().unwrap().max_files = Some(max_files);
        record(&self.tracer, format!("fs.register {}", path));
        Ok(())
    }

    fn unregister(&mut self, path: &str) -> MscResult<()> {
        if let Some(e) = self.fail_unregister {
            return Err(e);
        }
        let idx = self.paths.iter().position(|p| p == path).ok_or(MscError::InvalidState)?;
        self.paths.remove(idx);
        record(&self.tracer, format!("fs.unregister {}", path));
        Ok(())
    }

    fn mount(&mut self, _slot: DriveSlot, disk: &mut dyn BlockDisk) -> MscResult<()> {
        if let Some(e) = self.fail_mount {
            return Err(e);
        }
        let mut sector = vec![0u8; disk.sector_size() as usize];
        disk.read(0, 0, &mut sector)?;
        if &sector[..4] != FS_MAGIC {
            record(&self.tracer, "fs.nofs");
            return Err(MscError::NoFilesystem);
        }
        record(&self.tracer, "fs.mount");
        Ok(())
    }

    fn format(
        &mut self,
        _slot: DriveSlot,
        disk: &mut dyn BlockDisk,
        _policy: &FormatPolicy,
        work: &mut [u8],
    ) -> MscResult<()> {
        assert_eq!(work.len(), 4096);
        let mut sector = vec![0u8; disk.sector_size() as usize];
        sector[..4].copy_from_slice(FS_MAGIC);
        disk.write(0, 0, &sector)?;
        self.tracer.lock().unwrap().formats += 1;
        record(&self.tracer, "fs.format");
        Ok(())
    }

    fn detach(&mut self, _slot: DriveSlot) {}
}

pub fn config_with_recorders(p: &Tracer) -> SessionConfig {
    let (pre, post) = recorders(p);
    SessionConfig {
        on_premount_changed: Some(pre),
        on_mount_changed: Some(post),
        ..SessionConfig::default()
    }
}

/// 1024 x 512-byte flash session with callbacks recorded in `p`.
pub fn flash_session(p: &Tracer) -> Session {
    Session::flash(
        MockFlash::new(1024, 512, p),
        Box::new(MockFat::new(2, p)),
        config_with_recorders(p),
    )
    .unwrap()
}
