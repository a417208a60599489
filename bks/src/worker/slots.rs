//! Job instance slots of one worker session
//!
//! The dispatcher claims a free slot for every incoming request; an
//! execution thread takes the request out, runs it and parks the response
//! in the slot until the dispatcher frames it. A slot is free again once its
//! response has been taken, so the number of claimed slots never exceeds the
//! negotiated instance count.

use bks_wire::messages::{JobRequest, JobResponse};
use parking_lot::Mutex;

#[derive(Debug)]
enum Slot {
    Free,
    Claimed(JobRequest),
    Running,
    Finished(JobResponse),
}

#[derive(Debug)]
pub(crate) struct InstanceTable {
    slots: Mutex<Vec<Slot>>,
}

impl InstanceTable {
    pub(crate) fn new(instances: u32) -> Self {
        Self {
            slots: Mutex::new((0..instances).map(|_| Slot::Free).collect()),
        }
    }

    /// Put `request` into a free slot, or hand it back when all are busy.
    pub(crate) fn claim(&self, request: JobRequest) -> Result<usize, JobRequest> {
        let mut slots = self.slots.lock();
        match slots.iter().position(|s| matches!(s, Slot::Free)) {
            Some(index) => {
                slots[index] = Slot::Claimed(request);
                Ok(index)
            }
            None => Err(request),
        }
    }

    /// Move a claimed request out for execution.
    pub(crate) fn take_request(&self, index: usize) -> Option<JobRequest> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index)?;
        match std::mem::replace(slot, Slot::Running) {
            Slot::Claimed(request) => Some(request),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn finish(&self, index: usize, response: JobResponse) {
        if let Some(slot) = self.slots.lock().get_mut(index) {
            if matches!(slot, Slot::Running) {
                *slot = Slot::Finished(response);
            }
        }
    }

    /// Take up to `max` finished responses, freeing their slots.
    pub(crate) fn take_finished(&self, max: usize) -> Vec<JobResponse> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if matches!(slot, Slot::Finished(_)) {
                if let Slot::Finished(response) = std::mem::replace(slot, Slot::Free) {
                    out.push(response);
                }
                if out.len() == max {
                    break;
                }
            }
        }
        out
    }

    /// Slots not free
    pub(crate) fn busy(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }
}
