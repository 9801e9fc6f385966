#![no_std]
#![forbid(unsafe_code)]

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use msc_core::{MscError, MscResult, MEM_ALIGN};
use spin::Mutex;
use zeroize::Zeroize;

#[derive(Zeroize)]
struct SlotBuffer {
    data: Vec<u8>,
    lba: u32,
    offset: u32,
    len: usize,
}

/// The single staging area for a write accepted from the host but not yet
/// committed to the backend. At most one lease exists at a time.
pub struct WriteSlot {
    buffer: Mutex<SlotBuffer>,
    capacity: usize,
    leased: AtomicBool,
}

/// Exclusive ownership of the write slot. Dropping it wipes the payload and
/// frees the slot for the next write.
pub struct SlotLease {
    slot: Arc<WriteSlot>,
}

/// Borrowed view of a staged write.
#[derive(Debug, Clone, Copy)]
pub struct StagedWrite<'a> {
    pub lba: u32,
    pub offset: u32,
    pub data: &'a [u8],
}

impl WriteSlot {
    /// Allocate the fixed-capacity buffer once. `capacity` must be a non-zero
    /// multiple of `MEM_ALIGN`.
    pub fn new(capacity: usize) -> MscResult<Arc<Self>> {
        if capacity == 0 || capacity % MEM_ALIGN != 0 {
            return Err(MscError::InvalidSize);
        }
        Ok(Arc::new(Self {
            buffer: Mutex::new(SlotBuffer {
                data: vec![0u8; capacity],
                lba: 0,
                offset: 0,
                len: 0,
            }),
            capacity,
            leased: AtomicBool::new(false),
        }))
    }

    /// `None` while a previous lease is alive.
    pub fn claim(self: &Arc<Self>) -> Option<SlotLease> {
        self.leased
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        Some(SlotLease { slot: self.clone() })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_busy(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    fn release(&self) {
        {
            let mut buf = self.buffer.lock();
            buf.zeroize();
            // zeroize() clears the Vec; restore the fixed length.
            buf.data.resize(self.capacity, 0);
        }
        self.leased.store(false, Ordering::Release);
    }
}

impl SlotLease {
    /// Copy `src` into the slot along with its target address.
    pub fn stage(&mut self, lba: u32, offset: u32, src: &[u8]) -> MscResult<()> {
        if src.len() > self.slot.capacity {
            return Err(MscError::InvalidSize);
        }
        let mut buf = self.slot.buffer.lock();
        buf.data[..src.len()].copy_from_slice(src);
        buf.lba = lba;
        buf.offset = offset;
        buf.len = src.len();
        Ok(())
    }

    pub fn with_staged<R>(&self, f: impl FnOnce(StagedWrite<'_>) -> R) -> R {
        let buf = self.slot.buffer.lock();
        f(StagedWrite {
            lba: buf.lba,
            offset: buf.offset,
            data: &buf.data[..buf.len],
        })
    }

    pub fn len(&self) -> usize {
        self.slot.buffer.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.slot.release();
    }
}
