use alloc::collections::VecDeque;
use log::warn;
use msc_core::{MscError, MscResult};
use msc_mem::SlotLease;
use spin::Mutex;

/// A write accepted from the host, waiting for the execution context.
/// Owns the slot lease: the payload cannot change until the task is dropped.
pub struct DeferredWrite {
    lease: SlotLease,
}

impl DeferredWrite {
    pub fn new(lease: SlotLease) -> Self {
        Self { lease }
    }

    pub fn lease(&self) -> &SlotLease {
        &self.lease
    }
}

/// Single-consumer queue drained by the host consumer's task.
pub struct WorkQueue {
    tasks: Mutex<VecDeque<DeferredWrite>>,
    depth: usize,
}

impl WorkQueue {
    pub fn new(depth: usize) -> Self {
        Self { tasks: Mutex::new(VecDeque::with_capacity(depth)), depth }
    }

    pub fn submit(&self, task: DeferredWrite) -> MscResult<()> {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.depth {
            warn!("Deferred queue full ({})", self.depth);
            return Err(MscError::Busy);
        }
        tasks.push_back(task);
        Ok(())
    }

    pub fn take(&self) -> Option<DeferredWrite> {
        self.tasks.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
