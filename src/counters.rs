// counters.rs — host view of the cross-octave point counters.
//
// The extremum stage appends keypoints for every octave into one shared,
// fixed-capacity array. A small u32 array on the device tracks where each
// octave's slice begins and ends:
//
//   index         meaning                                       clamped
//   ───────────   ───────────────────────────────────────────   ───────
//   [2*o]         count when octave o started                   yes
//   [2*o + 1]     count after octave o finished                 yes
//   [2*n]         raw running total of accepted detections      no
//
// Octaves are processed coarse to fine, so octave n-1 occupies the lowest
// indices. A detection whose slot index (the pre-increment total) reaches
// capacity is dropped; the raw total keeps counting so callers can see how
// many were lost. Which detections are dropped depends on thread scheduling
// and is not reported.

use std::ops::Range;

use crate::error::{Result, SiftError};

/// Result of one bounded append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at this slot.
    Stored(u32),
    /// Capacity was exhausted.
    Dropped,
}

impl AppendOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, AppendOutcome::Stored(_))
    }
}

/// Decide the fate of a detection that received slot `raw_index`.
///
/// This is the host statement of `append_keypoint` in extrema.wgsl: the
/// index comes from a fetch-add on the raw total and the item is kept only
/// if it is below `capacity`.
#[inline]
pub fn bounded_slot(raw_index: u32, capacity: u32) -> AppendOutcome {
    if raw_index < capacity {
        AppendOutcome::Stored(raw_index)
    } else {
        AppendOutcome::Dropped
    }
}

/// A fixed-capacity collection that never grows past its capacity.
pub trait BoundedAppend<T> {
    fn capacity(&self) -> u32;

    /// Attempt to append. Never reallocates.
    fn try_append(&mut self, item: T) -> AppendOutcome;
}

/// Contiguous range of keypoints produced by one octave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctaveSlice {
    pub octave: usize,
    pub start: u32,
    pub end: u32,
}

impl OctaveSlice {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Number of u32 entries in the counter array for `num_octaves` octaves.
pub fn counter_len(num_octaves: usize) -> usize {
    2 * num_octaves + 1
}

/// Host copy of the counter array, read back after a full pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointCounters {
    values: Vec<u32>,
    capacity: u32,
}

impl PointCounters {
    /// Wrap a counter array read from the device.
    ///
    /// An empty or even-length array is `MalformedCounters`.
    pub fn new(values: Vec<u32>, capacity: u32) -> Result<Self> {
        if values.len() % 2 == 0 {
            return Err(SiftError::MalformedCounters(values.len()));
        }
        Ok(PointCounters { values, capacity })
    }

    pub fn num_octaves(&self) -> usize {
        self.values.len() / 2
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Running total including dropped detections.
    pub fn raw_total(&self) -> u32 {
        self.values[self.values.len() - 1]
    }

    /// Stored keypoints, `min(raw_total, capacity)`.
    pub fn count(&self) -> u32 {
        self.raw_total().min(self.capacity)
    }

    pub fn dropped(&self) -> u32 {
        self.raw_total() - self.count()
    }

    pub fn octave_slice(&self, octave: usize) -> OctaveSlice {
        OctaveSlice {
            octave,
            start: self.values[2 * octave],
            end: self.values[2 * octave + 1],
        }
    }

    /// Slices of every octave, finest first.
    pub fn octave_slices(&self) -> Vec<OctaveSlice> {
        (0..self.num_octaves()).map(|o| self.octave_slice(o)).collect()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host replay of the device protocol: open, append, close per octave.
    fn simulate(per_octave: &[u32], capacity: u32) -> PointCounters {
        let n = per_octave.len();
        let mut values = vec![0u32; counter_len(n)];
        for o in (0..n).rev() {
            values[2 * o] = values[2 * n].min(capacity);
            for _ in 0..per_octave[o] {
                let raw = values[2 * n];
                values[2 * n] += 1;
                let _ = bounded_slot(raw, capacity);
            }
            values[2 * o + 1] = values[2 * n].min(capacity);
        }
        PointCounters::new(values, capacity).unwrap()
    }

    #[test]
    fn test_bounded_slot() {
        assert_eq!(bounded_slot(0, 1), AppendOutcome::Stored(0));
        assert_eq!(bounded_slot(1, 1), AppendOutcome::Dropped);
        assert_eq!(bounded_slot(5, 0), AppendOutcome::Dropped);
    }

    #[test]
    fn test_slices_coarse_to_fine() {
        let c = simulate(&[10, 4, 2], 100);
        assert_eq!(c.count(), 16);
        assert_eq!(c.dropped(), 0);
        // Coarsest octave first in memory.
        assert_eq!(c.octave_slice(2).range(), 0..2);
        assert_eq!(c.octave_slice(1).range(), 2..6);
        assert_eq!(c.octave_slice(0).range(), 6..16);
    }

    #[test]
    fn test_overflow_clamps_slices() {
        let c = simulate(&[10, 4, 2], 5);
        assert_eq!(c.raw_total(), 16);
        assert_eq!(c.count(), 5);
        assert_eq!(c.dropped(), 11);
        assert_eq!(c.octave_slice(1).range(), 2..5);
        assert!(c.octave_slice(0).is_empty());
        let total: u32 = c.octave_slices().iter().map(|s| s.len()).sum();
        assert_eq!(total, c.count());
    }

    #[test]
    fn test_zero_points() {
        let c = simulate(&[0, 0], 8);
        assert_eq!(c.count(), 0);
        assert!(c.octave_slices().iter().all(|s| s.is_empty()));
    }

    #[test]
    fn test_even_length_rejected() {
        for bad in [vec![], vec![0, 0], vec![1, 2, 3, 4]] {
            let len = bad.len();
            assert!(matches!(PointCounters::new(bad, 4), Err(SiftError::MalformedCounters(n)) if n == len));
        }
        assert_eq!(PointCounters::new(vec![7], 4).unwrap().num_octaves(), 0);
    }
}
