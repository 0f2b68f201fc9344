//! In-flight work, indexed by job id.

use std::sync::Arc;

use crate::asic::JobIds;
use crate::work::Work;

/// Job-id offsets tried, in order, when a nonce does not match the job it
/// was tagged with. Chips sometimes report a nonce against a job sent a
/// little later than the one it was found for.
pub const ROLLBACK: [i32; 5] = [0, -1, -2, -3, -4];

#[derive(Debug)]
struct Slot {
    work: Arc<Work>,
    active: bool,
}

#[derive(Debug)]
pub struct WorkSlots {
    ids: JobIds,
    current: u8,
    slots: Vec<Option<Slot>>,
}

impl WorkSlots {
    pub fn new(ids: JobIds) -> Self {
        Self {
            ids,
            current: ids.min,
            slots: (0..=ids.max).map(|_| None).collect(),
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Points the roll at `job_id` without touching any slot. Used while
    /// cores warm up.
    pub fn set_current(&mut self, job_id: u8) {
        self.current = job_id;
    }

    /// Advances the current job id one step, wrapping back to the minimum.
    pub fn roll(&mut self) -> u8 {
        let next = u16::from(self.current) + u16::from(self.ids.step);
        self.current = if next > u16::from(self.ids.max) {
            self.ids.min
        } else {
            next as u8
        };
        self.current
    }

    /// Rolls to the next job id and installs `work` there. Returns the new
    /// id and whatever work the slot held before.
    pub fn install(&mut self, work: Arc<Work>) -> (u8, Option<Arc<Work>>) {
        let job_id = self.roll();
        let evicted = self.slots[usize::from(job_id)]
            .replace(Slot { work, active: true })
            .map(|slot| slot.work);
        (job_id, evicted)
    }

    /// Work in slot `job_id`, if it is still active.
    pub fn lookup(&self, job_id: u8) -> Option<&Arc<Work>> {
        match self.slots.get(usize::from(job_id)) {
            Some(Some(slot)) if slot.active => Some(&slot.work),
            _ => None,
        }
    }

    /// Marks every slot inactive. Nonces for earlier work are no longer
    /// accepted, but the work stays until its slot is reused.
    pub fn deactivate_all(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.active = false;
        }
    }

    /// The job id `steps` rolls before the current one. Negative `steps`
    /// looks back.
    pub fn rolled(&self, steps: i32) -> u8 {
        let min = i32::from(self.ids.min);
        let span = i32::from(self.ids.max) + 1 - min;
        let step = i32::from(self.ids.step);
        let offset = (i32::from(self.current) - min + steps * step).rem_euclid(span);
        (min + offset) as u8
    }

    /// Number of distinct job ids in the roll.
    pub fn len(&self) -> usize {
        usize::from((self.ids.max - self.ids.min) / self.ids.step) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
