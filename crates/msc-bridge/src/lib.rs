#![no_std]
extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};
use spin::Mutex;

use msc_core::{EventKind, MscError, MscResult};
use msc_mem::WriteSlot;

pub mod defer;
pub mod scsi;
pub mod session;

pub use defer::{DeferredWrite, WorkQueue};
pub use scsi::{InquiryData, SenseData};
pub use session::{MscCallback, Session, SessionConfig};

use scsi::SCSI_CMD_PREVENT_ALLOW_MEDIUM_REMOVAL;

/// The slot is single-owner, so more than one queued write cannot exist.
const QUEUE_DEPTH: usize = 1;

/// Maps the mass-storage command callbacks onto a storage session.
///
/// Writes are staged in a single slot and committed later by `poll`, which
/// the host consumer runs on its own task. A write arriving while the slot is
/// still leased is refused with `Busy` (zero bytes accepted).
pub struct CommandBridge {
    session: Mutex<Option<Session>>,
    slot: Arc<WriteSlot>,
    queue: WorkQueue,
    sense: Mutex<SenseData>,
    write_fault: AtomicBool,
}

impl CommandBridge {
    pub fn new(session: Session) -> MscResult<Self> {
        let slot = WriteSlot::new(session.buffer_size())?;
        info!(">>> [MSC] Bridge ready: {} sectors x {} bytes", session.sector_count(), session.sector_size());
        Ok(Self {
            session: Mutex::new(Some(session)),
            slot,
            queue: WorkQueue::new(QUEUE_DEPTH),
            sense: Mutex::new(SenseData::default()),
            write_fault: AtomicBool::new(false),
        })
    }

    /// Tear the session down. Queued writes are dropped.
    pub fn deinit(&self) -> Option<Session> {
        let mut dropped = 0;
        while self.queue.take().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropping {} undrained write(s) on deinit", dropped);
        }
        self.session.lock().take()
    }

    /// Run `f` against the session. `NoSession` after `deinit`.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> MscResult<R>) -> MscResult<R> {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(MscError::NoSession)?;
        f(session)
    }

    pub fn mount(&self, path: Option<&str>) -> MscResult<()> {
        self.with_session(|s| s.mount(path))
    }

    pub fn unmount(&self) -> MscResult<()> {
        self.with_session(|s| s.unmount())
    }

    pub fn is_mounted(&self) -> MscResult<bool> {
        self.with_session(|s| Ok(s.is_mounted()))
    }

    pub fn in_use_by_host(&self) -> MscResult<bool> {
        self.with_session(|s| Ok(s.in_use_by_host()))
    }

    pub fn register_callback(&self, kind: EventKind, cb: MscCallback) -> MscResult<()> {
        self.with_session(|s| {
            s.register_callback(kind, cb);
            Ok(())
        })
    }

    pub fn unregister_callback(&self, kind: EventKind) -> MscResult<()> {
        self.with_session(|s| {
            s.unregister_callback(kind);
            Ok(())
        })
    }

    pub fn set_sense(&self, sense: SenseData) {
        *self.sense.lock() = sense;
    }

    /// Sense data of the last failed command.
    pub fn sense(&self) -> SenseData {
        *self.sense.lock()
    }

    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    // --- Host consumer callbacks ---

    pub fn inquiry(&self, _lun: u8) -> InquiryData {
        InquiryData::default()
    }

    /// Ready only while the host owns the medium.
    /// A deferred write that failed since the last poll is reported here once.
    pub fn test_unit_ready(&self, _lun: u8) -> bool {
        if self.write_fault.swap(false, Ordering::AcqRel) {
            warn!("Reporting failed deferred write to host");
            self.set_sense(SenseData::WRITE_ERROR);
            return false;
        }

        match self.is_mounted() {
            Ok(true) => {
                self.set_sense(SenseData::MEDIUM_NOT_PRESENT);
                false
            }
            Ok(false) => {
                if let Err(e) = self.unmount() {
                    warn!("test_unit_ready: unmount fails ({})", e);
                }
                true
            }
            Err(e) => {
                warn!("test_unit_ready: {}", e);
                self.set_sense(SenseData::MEDIUM_NOT_PRESENT);
                false
            }
        }
    }

    /// Block count and block size. The wire format carries a 16-bit size.
    pub fn capacity(&self, _lun: u8) -> (u32, u16) {
        self.with_session(|s| Ok((s.sector_count(), s.sector_size() as u16)))
            .unwrap_or_else(|e| {
                error!("capacity: {}", e);
                (0, 0)
            })
    }

    /// START STOP UNIT. Eject (`load_eject && !start`) gives the volume back
    /// to the FAT driver. Always succeeds towards the host.
    pub fn start_stop(&self, _lun: u8, _power_condition: u8, start: bool, load_eject: bool) -> bool {
        if load_eject && !start {
            if let Err(e) = self.with_session(|s| s.remount()) {
                warn!("start_stop: mount fails ({})", e);
            }
        }
        true
    }

    pub fn try_read10(&self, _lun: u8, lba: u32, offset: u32, buf: &mut [u8]) -> MscResult<usize> {
        self.with_session(|s| s.read(lba, offset, buf))?;
        Ok(buf.len())
    }

    /// Bytes read, or 0 on failure.
    pub fn read10(&self, lun: u8, lba: u32, offset: u32, buf: &mut [u8]) -> usize {
        self.try_read10(lun, lba, offset, buf).unwrap_or_else(|e| {
            error!("msc_storage_read_sector failed: {}", e);
            0
        })
    }

    /// Stage a write for `poll`. Returns the full length as accepted before
    /// the medium is touched.
    pub fn try_write10(&self, _lun: u8, lba: u32, offset: u32, buf: &[u8]) -> MscResult<usize> {
        self.with_session(|s| s.check_write(lba, offset, buf.len()))?;
        if buf.len() > self.slot.capacity() {
            error!("write of {} exceeds buffer {}", buf.len(), self.slot.capacity());
            return Err(MscError::InvalidSize);
        }

        let mut lease = self.slot.claim().ok_or_else(|| {
            warn!("write slot busy, lba {} deferred by host", lba);
            MscError::Busy
        })?;
        lease.stage(lba, offset, buf)?;
        self.queue.submit(DeferredWrite::new(lease))?;
        Ok(buf.len())
    }

    /// Bytes accepted, or 0 on failure (including `Busy`).
    pub fn write10(&self, lun: u8, lba: u32, offset: u32, buf: &[u8]) -> usize {
        self.try_write10(lun, lba, offset, buf).unwrap_or_else(|e| {
            error!("msc write10 rejected: {}", e);
            0
        })
    }

    /// Commands outside the built-in set. Negative return stalls the transfer.
    pub fn scsi(&self, _lun: u8, cmd: &[u8; 16], _buf: &mut [u8]) -> i32 {
        match cmd[0] {
            SCSI_CMD_PREVENT_ALLOW_MEDIUM_REMOVAL => 0,
            op => {
                warn!("scsi command not handled: {:#04x}", op);
                self.set_sense(SenseData::INVALID_COMMAND);
                -1
            }
        }
    }

    /// Host configured the device: the bridge takes the medium.
    pub fn on_attach(&self) {
        if let Err(e) = self.unmount() {
            warn!("on_attach: unmount fails ({})", e);
        }
    }

    /// Host went away: the medium goes back to the FAT driver.
    pub fn on_detach(&self) {
        if let Err(e) = self.with_session(|s| s.remount()) {
            warn!("on_detach: mount fails ({})", e);
        }
    }

    // --- Deferred execution context ---

    /// Commit one staged write. `WouldBlock` when nothing is queued.
    /// A failure is logged and latched for the next readiness check; the
    /// host already got its success status.
    pub fn poll(&self) -> nb::Result<usize, MscError> {
        let task = self.queue.take().ok_or(nb::Error::<MscError>::WouldBlock)?;

        let result = task.lease().with_staged(|w| {
            self.with_session(|s| s.write(w.lba, w.offset, w.data))
                .map(|_| w.data.len())
        });
        // Frees the slot.
        drop(task);

        result.map_err(|e| {
            error!("Write failed, error={}", e);
            self.write_fault.store(true, Ordering::Release);
            nb::Error::Other(e)
        })
    }

    /// Run `poll` until the queue is empty. Returns the number of tasks run.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        loop {
            match self.poll() {
                Err(nb::Error::WouldBlock) => return count,
                _ => count += 1,
            }
        }
    }
}
