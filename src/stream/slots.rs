//! Ordered slot table: out-of-order parallel fetch writes land here, the
//! delivery task reads them strictly in order (spec.md §4.4.2).

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::FetchError;
use crate::plan::Segment;

#[derive(Debug, Clone)]
pub enum SlotState {
    Pending,
    InFlight,
    Ready(Segment),
    /// Permanently unavailable at every provider; delivered as zero bytes
    /// of the declared (or best-effort) length (spec.md §4.4.3).
    ZeroFilled(Segment),
    /// Permanently unavailable at every provider with no cached size to
    /// zero-fill against: guessing a length would silently corrupt byte
    /// offsets, so this is surfaced to the caller instead (spec.md §8 P5).
    Errored(FetchError),
}

pub struct SlotTable {
    slots: Vec<Mutex<SlotState>>,
    /// Signalled whenever any slot transitions, so the delivery task and
    /// the straggler monitor can wake without polling.
    pub changed: Notify,
}

impl SlotTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Mutex::new(SlotState::Pending)).collect(),
            changed: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn mark_in_flight(&self, index: usize) {
        *self.slots[index].lock().unwrap() = SlotState::InFlight;
    }

    /// Installs `segment` as `Ready` unless the slot is already settled,
    /// guarding against a straggler response landing after a redundant
    /// fetch already won (first writer wins, matching spec.md §4.4.5).
    pub fn complete(&self, index: usize, segment: Segment) -> bool {
        let mut slot = self.slots[index].lock().unwrap();
        if matches!(&*slot, SlotState::Ready(_) | SlotState::ZeroFilled(_)) {
            return false;
        }
        *slot = SlotState::Ready(segment);
        drop(slot);
        self.changed.notify_waiters();
        true
    }

    pub fn complete_zero_filled(&self, index: usize, segment: Segment) -> bool {
        let mut slot = self.slots[index].lock().unwrap();
        if Self::is_settled_state(&slot) {
            return false;
        }
        *slot = SlotState::ZeroFilled(segment);
        drop(slot);
        self.changed.notify_waiters();
        true
    }

    /// Marks `index` unrecoverable with no safe zero-fill length. First
    /// writer wins, same as `complete`/`complete_zero_filled`.
    pub fn complete_errored(&self, index: usize, err: FetchError) -> bool {
        let mut slot = self.slots[index].lock().unwrap();
        if Self::is_settled_state(&slot) {
            return false;
        }
        *slot = SlotState::Errored(err);
        drop(slot);
        self.changed.notify_waiters();
        true
    }

    fn is_settled_state(state: &SlotState) -> bool {
        matches!(state, SlotState::Ready(_) | SlotState::ZeroFilled(_) | SlotState::Errored(_))
    }

    pub fn is_settled(&self, index: usize) -> bool {
        Self::is_settled_state(&self.slots[index].lock().unwrap())
    }

    pub fn is_pending(&self, index: usize) -> bool {
        matches!(&*self.slots[index].lock().unwrap(), SlotState::Pending)
    }

    /// Count of slots that are settled or currently in flight — i.e. not
    /// still `Pending`. Used by tests to observe how far workers have
    /// raced ahead of delivery.
    #[cfg(test)]
    pub fn claimed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(&*s.lock().unwrap(), SlotState::Pending))
            .count()
    }

    /// Reverts a preempted `InFlight` slot back to `Pending` so it can be
    /// re-enqueued and re-claimed by another worker. A no-op if the slot
    /// already settled (the preempted worker raced a real completion),
    /// preserving first-writer-wins.
    pub fn reset_to_pending(&self, index: usize) {
        let mut slot = self.slots[index].lock().unwrap();
        if matches!(&*slot, SlotState::InFlight) {
            *slot = SlotState::Pending;
        }
    }

    /// Takes the settled segment out of `index`, leaving `Pending` behind.
    /// Used once by the delivery task as it advances its cursor.
    pub fn take(&self, index: usize) -> Option<Segment> {
        let mut slot = self.slots[index].lock().unwrap();
        match std::mem::replace(&mut *slot, SlotState::Pending) {
            SlotState::Ready(seg) | SlotState::ZeroFilled(seg) => Some(seg),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Takes a settled slot as a delivery outcome: `Ok` for a real or
    /// zero-filled segment, `Err` for a slot that errored with no safe
    /// zero-fill length. Used by the delivery task instead of `take` so it
    /// can terminate the stream on the latter.
    pub fn take_outcome(&self, index: usize) -> Option<Result<Segment, FetchError>> {
        let mut slot = self.slots[index].lock().unwrap();
        match std::mem::replace(&mut *slot, SlotState::Pending) {
            SlotState::Ready(seg) | SlotState::ZeroFilled(seg) => Some(Ok(seg)),
            SlotState::Errored(err) => Some(Err(err)),
            other => {
                *slot = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SegmentId;

    fn seg(n: &str) -> Segment {
        Segment {
            id: SegmentId::new(n),
            data: bytes::Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn first_completion_wins_over_a_later_straggler() {
        let table = SlotTable::new(1);
        assert!(table.complete(0, seg("a")));
        assert!(!table.complete(0, seg("b")));
        assert_eq!(table.take(0).unwrap().id.as_str(), "a");
    }

    #[test]
    fn take_resets_slot_to_pending() {
        let table = SlotTable::new(1);
        table.complete(0, seg("a"));
        table.take(0);
        assert!(table.is_pending(0));
    }
}
