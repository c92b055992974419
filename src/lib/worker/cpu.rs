use std::sync::Mutex;

use crate::lib::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuSlot {
    id: usize,
    active: bool,
}

/// One toggle per core, handed out to tasks when containers are pinned.
pub struct CpuPool {
    slots: Mutex<Vec<CpuSlot>>,
}

impl CpuPool {
    pub fn new(cores: usize) -> Self {
        Self {
            slots: Mutex::new((0..cores).map(|id| CpuSlot { id, active: false }).collect()),
        }
    }

    /// Reserve the lowest free core.
    pub fn acquire(&self) -> Result<usize, WorkerError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = slots.len();
        let slot = slots
            .iter_mut()
            .find(|slot| !slot.active)
            .ok_or(WorkerError::NoFreeCpu { capacity })?;
        slot.active = true;
        Ok(slot.id)
    }

    pub fn release(&self, id: usize) -> Result<(), WorkerError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get_mut(id).ok_or(WorkerError::UnknownCpu(id))?;
        if !slot.active {
            return Err(WorkerError::CpuNotActive(id));
        }
        slot.active = false;
        Ok(())
    }

    pub fn cores(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|slot| slot.active)
            .count()
    }
}
