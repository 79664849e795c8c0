// src/audio/region.rs
// Active/old region tracking: which new-layer samples are audible and which
// still have to be folded into the base layer.

use super::MAX_OLD_REGIONS;

/// True when `t` falls in `[start, start + size)` modulo `loop_length`.
#[inline]
pub fn in_region(start: usize, size: usize, t: usize, loop_length: usize) -> bool {
    if loop_length == 0 {
        return false;
    }
    let offset = (t % loop_length + loop_length - start % loop_length) % loop_length;
    offset < size
}

/// A contiguous, possibly wrapping range of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRegion {
    pub start: usize,
    pub size: usize,
}

impl ActiveRegion {
    /// Panics when the region does not fit the loop; regions are only built
    /// from engine state, so a bad one is a logic error.
    pub fn new(start: usize, size: usize, loop_length: usize) -> Self {
        assert!(
            size <= loop_length,
            "region of {} samples exceeds loop of {}",
            size,
            loop_length
        );
        assert!(
            start < loop_length.max(1),
            "region start {} outside loop of {}",
            start,
            loop_length
        );
        Self { start, size }
    }

    #[inline]
    pub fn contains(&self, t: usize, loop_length: usize) -> bool {
        in_region(self.start, self.size, t, loop_length)
    }

    pub fn grow(&mut self, loop_length: usize) {
        if self.size < loop_length {
            self.size += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// A superseded region whose new-layer samples are still in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OldRegion {
    pub region: ActiveRegion,
    /// Positions this region still owns.
    pub remaining: usize,
    /// False when the region was undone before being superseded. Its samples
    /// are never played or merged, but it still hides older regions.
    pub merge: bool,
    seq: u64,
}

impl OldRegion {
    /// Same tracked entry, even if a copy has a different `remaining`.
    pub fn same_entry(&self, other: &OldRegion) -> bool {
        self.seq == other.seq
    }
}

/// The newest region covering a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Active,
    Old(usize),
    Unowned,
}

type Slots = [Option<OldRegion>; MAX_OLD_REGIONS];

fn newest_containing(slots: &Slots, t: usize, loop_length: usize) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, slot) in slots.iter().enumerate() {
        if let Some(old) = slot
            && old.region.contains(t, loop_length)
            && best.is_none_or(|(_, seq)| old.seq > seq)
        {
            best = Some((index, old.seq));
        }
    }
    best.map(|(index, _)| index)
}

#[derive(Debug, Clone)]
pub struct RegionTracker {
    active: Option<ActiveRegion>,
    undo: bool,
    old: Slots,
    next_seq: u64,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self {
            active: None,
            undo: false,
            old: [None; MAX_OLD_REGIONS],
            next_seq: 0,
        }
    }

    pub fn reset(&mut self) {
        self.active = None;
        self.undo = false;
        self.old = [None; MAX_OLD_REGIONS];
    }

    pub fn active(&self) -> Option<ActiveRegion> {
        self.active
    }

    pub fn undo(&self) -> bool {
        self.undo
    }

    pub fn toggle_undo(&mut self) -> bool {
        self.undo = !self.undo;
        self.undo
    }

    /// Install the first take; there is nothing to supersede yet.
    pub fn set_first_take(&mut self, region: ActiveRegion) {
        self.reset();
        self.active = Some(region);
    }

    /// Replace the active region. The previous one is queued for merging, or
    /// kept as a silent shadow when it had been undone. The undo flag is left
    /// for the caller to clear.
    ///
    /// The set must have a free slot: callers fold the oldest entry away
    /// whenever a push fills it.
    pub fn supersede(&mut self, region: ActiveRegion) {
        if let Some(previous) = self.active.take()
            && !previous.is_empty()
        {
            let entry = OldRegion {
                region: previous,
                remaining: previous.size,
                merge: !self.undo,
                seq: self.next_seq,
            };
            self.next_seq += 1;
            self.push(entry);
        }
        self.active = Some(region);
    }

    fn push(&mut self, entry: OldRegion) {
        debug_assert!(!self.is_full(), "old-region set is full");
        if let Some(slot) = self.old.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(entry);
        } else if let Some((index, _)) = self.oldest() {
            self.old[index] = Some(entry);
        }
    }

    pub fn is_full(&self) -> bool {
        self.old.iter().all(Option::is_some)
    }

    /// The longest-tracked entry. Nothing older lies beneath it, so once its
    /// samples are folded into the base layer it can be dropped without any
    /// other region resurfacing.
    pub fn oldest(&self) -> Option<(usize, OldRegion)> {
        self.old
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|old| (index, old)))
            .min_by_key(|(_, old)| old.seq)
    }

    /// Stop tracking `entry` if it still sits in slot `index`.
    pub fn remove(&mut self, index: usize, entry: &OldRegion) -> bool {
        if self.old[index].is_some_and(|old| old.same_entry(entry)) {
            self.old[index] = None;
            return true;
        }
        false
    }

    /// Whether `entry` is the newest region at `t`, active region included.
    pub fn owns(&self, index: usize, entry: &OldRegion, t: usize, loop_length: usize) -> bool {
        self.owner_at(t, loop_length) == Owner::Old(index)
            && self.old[index].is_some_and(|old| old.same_entry(entry))
    }

    pub fn owner_at(&self, t: usize, loop_length: usize) -> Owner {
        if let Some(active) = self.active
            && active.contains(t, loop_length)
        {
            return Owner::Active;
        }
        match newest_containing(&self.old, t, loop_length) {
            Some(index) => Owner::Old(index),
            None => Owner::Unowned,
        }
    }

    /// Whether the new-layer sample at `t` belongs in the playback mix.
    pub fn is_live(&self, t: usize, loop_length: usize) -> bool {
        match self.owner_at(t, loop_length) {
            Owner::Active => !self.undo,
            Owner::Old(index) => self.old[index].is_some_and(|old| old.merge),
            Owner::Unowned => false,
        }
    }

    /// The active region is about to overwrite the new-layer sample at `t`.
    /// Returns whether the current sample must be folded into the base layer
    /// first, and retires the position from whichever old region owned it.
    pub fn claim(&mut self, t: usize, loop_length: usize) -> bool {
        match self.owner_at(t, loop_length) {
            // second pass over a full-length overdub: keep the first pass
            Owner::Active => !self.undo,
            Owner::Old(index) => {
                let merge = self.old[index].is_some_and(|old| old.merge);
                self.retire(index, 1);
                merge
            }
            Owner::Unowned => false,
        }
    }

    pub fn grow_active(&mut self, loop_length: usize) {
        if let Some(active) = self.active.as_mut() {
            active.grow(loop_length);
        }
    }

    fn retire(&mut self, index: usize, count: usize) {
        if let Some(old) = self.old[index].as_mut() {
            old.remaining = old.remaining.saturating_sub(count);
            if old.remaining == 0 {
                self.old[index] = None;
            }
        }
    }

    pub fn snapshot(&self) -> RegionSnapshot {
        RegionSnapshot { old: self.old }
    }

    /// Apply retirements counted by a background merge. Entries replaced since
    /// the snapshot was taken are skipped.
    pub fn apply(&mut self, report: &MergeReport) {
        for (index, &(seq, count)) in report.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            if self.old[index].is_some_and(|old| old.seq == seq) {
                self.retire(index, count);
            }
        }
    }

    pub fn old_regions(&self) -> impl Iterator<Item = &OldRegion> {
        self.old.iter().flatten()
    }

    pub fn old_count(&self) -> usize {
        self.old_regions().count()
    }
}

impl Default for RegionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the old-region set handed to the streaming thread with a scratch
/// merge.
#[derive(Debug, Clone, Copy)]
pub struct RegionSnapshot {
    old: Slots,
}

impl RegionSnapshot {
    /// Newest old region at `t`, ignoring the active region.
    pub fn owner_at(&self, t: usize, loop_length: usize) -> Option<(usize, OldRegion)> {
        newest_containing(&self.old, t, loop_length)
            .and_then(|index| self.old[index].map(|old| (index, old)))
    }

    pub fn is_owned_by(&self, entry: &OldRegion, t: usize, loop_length: usize) -> bool {
        self.owner_at(t, loop_length)
            .is_some_and(|(_, owner)| owner.same_entry(entry))
    }
}

/// Positions retired per old-region slot during a scratch merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    counts: [(u64, usize); MAX_OLD_REGIONS],
}

impl MergeReport {
    pub fn new() -> Self {
        Self {
            counts: [(0, 0); MAX_OLD_REGIONS],
        }
    }

    pub fn record(&mut self, index: usize, region: &OldRegion) {
        let entry = &mut self.counts[index];
        entry.0 = region.seq;
        entry.1 += 1;
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, count)| count).sum()
    }
}

impl Default for MergeReport {
    fn default() -> Self {
        Self::new()
    }
}
