//! Per-slot results precomputed over a discretised time range.

use std::sync::Arc;

use crate::time::TimeRange;

/// How a [`TimeSpanTable`] was populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpanReuse {
    /// Slots copied by reference from the previous table.
    pub reused: usize,
    /// Slots computed fresh.
    pub computed: usize,
}

/// A fixed-size array of results, one per time slot of a [`TimeRange`].
///
/// Slots hold `Arc`s so that a rebuilt table can share unchanged slots with
/// the table it replaces.
#[derive(Debug)]
pub struct TimeSpanTable<T> {
    range: TimeRange,
    slots: Vec<Arc<T>>,
}

impl<T> TimeSpanTable<T> {
    /// Build a table over `range`, reusing slots of `previous` where possible.
    ///
    /// For each slot of `range`, if `previous` has a slot at the same absolute
    /// time (within [`GEO_TIME_EPSILON`](crate::GEO_TIME_EPSILON)) its value is
    /// shared; otherwise `resolve` is called with the slot time. A slot is
    /// either entirely shared or entirely recomputed.
    ///
    /// If `resolve` fails the error is returned and no table is produced.
    pub fn build<E>(
        range: TimeRange,
        previous: Option<&TimeSpanTable<T>>,
        mut resolve: impl FnMut(f64) -> Result<Arc<T>, E>,
    ) -> Result<(Self, TimeSpanReuse), E> {
        let mut reuse = TimeSpanReuse::default();
        let mut slots = Vec::with_capacity(range.num_slots());
        for (_, time) in range.slot_times() {
            let existing = previous.and_then(|table| table.slot_at_time(time));
            let slot = match existing {
                Some(slot) => {
                    reuse.reused += 1;
                    slot.clone()
                }
                None => {
                    reuse.computed += 1;
                    resolve(time)?
                }
            };
            slots.push(slot);
        }
        Ok((Self { range, slots }, reuse))
    }

    /// The range this table covers.
    pub fn range(&self) -> &TimeRange {
        &self.range
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Value at slot `index`.
    pub fn slot(&self, index: usize) -> Option<&Arc<T>> {
        self.slots.get(index)
    }

    /// Value of the slot at `time`, if a slot lies at that time.
    pub fn slot_at_time(&self, time: f64) -> Option<&Arc<T>> {
        self.range
            .slot_at_time(time)
            .and_then(|index| self.slots.get(index))
    }

    /// Iterate over `(slot time, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &Arc<T>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(move |(index, slot)| (self.range.slot_time(index), slot))
    }
}
