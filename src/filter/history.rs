// filter/history.rs

// Replayable state history: a compact snapshot of the body state (vector,
// external quaternion, covariance) and a chronological container of
// timestamped values supporting binary search and pruning from both ends.

// Dependencies
use std::collections::VecDeque;

use nalgebra::UnitQuaternion;

use super::state::{BodyState, BodyStateMatrix, BodyStateVector};
use super::FilterState;
use crate::{Timestamp, TrackerError};

/// Everything needed to restore a body state: the 12-D vector, the
/// external quaternion, and the error covariance.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    state_vector: BodyStateVector,
    orientation: UnitQuaternion<f64>,
    covariance: BodyStateMatrix,
}

impl StateSnapshot {
    pub fn save(state: &BodyState) -> Self {
        StateSnapshot {
            state_vector: state.state_vector(),
            orientation: state.quaternion(),
            covariance: state.error_covariance(),
        }
    }

    pub fn restore(&self, state: &mut BodyState) {
        state.set_state_vector(&self.state_vector);
        state.set_quaternion(&self.orientation);
        state.set_error_covariance(&self.covariance);
    }
}

/// Stores values over time in chronological order, two-ended.
///
/// Duplicate timestamps are permitted; pushes older than the newest entry
/// are rejected.
#[derive(Debug, Clone)]
pub struct HistoryContainer<T> {
    entries: VecDeque<(Timestamp, T)>,
}

impl<T> Default for HistoryContainer<T> {
    fn default() -> Self {
        HistoryContainer {
            entries: VecDeque::new(),
        }
    }
}

impl<T> HistoryContainer<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.entries.front().map(|e| e.0)
    }

    pub fn newest_timestamp(&self) -> Option<Timestamp> {
        self.entries.back().map(|e| e.0)
    }

    pub fn newest(&self) -> Option<&T> {
        self.entries.back().map(|e| &e.1)
    }

    /// Whether `tv` may legally be pushed as the newest entry.
    pub fn is_valid_to_push_newest(&self, tv: Timestamp) -> bool {
        match self.newest_timestamp() {
            None => true,
            Some(newest) => tv >= newest,
        }
    }

    /// Appends a value; it must be at least as new as the newest entry.
    pub fn push_newest(&mut self, tv: Timestamp, value: T) -> Result<(), TrackerError> {
        if !self.is_valid_to_push_newest(tv) {
            return Err(TrackerError::HistoryOrder);
        }
        self.entries.push_back((tv, value));
        Ok(())
    }

    /// Index of the first entry with timestamp strictly newer than `tv`.
    fn upper_bound(&self, tv: Timestamp) -> usize {
        // VecDeque has O(1) indexing, so a plain binary search works.
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.entries[mid].0 <= tv {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the first entry with timestamp at or after `tv`.
    fn lower_bound(&self, tv: Timestamp) -> usize {
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.entries[mid].0 < tv {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// The newest entry whose timestamp is not newer than `tv`.
    pub fn closest_not_newer(&self, tv: Timestamp) -> Option<(Timestamp, &T)> {
        let idx = self.upper_bound(tv);
        if idx == 0 {
            return None;
        }
        let (t, v) = &self.entries[idx - 1];
        Some((*t, v))
    }

    /// Iterates over entries with timestamps strictly newer than `tv`, in
    /// chronological order.
    pub fn iter_newer_than(&self, tv: Timestamp) -> impl Iterator<Item = (Timestamp, &T)> {
        let start = self.upper_bound(tv);
        self.entries.iter().skip(start).map(|(t, v)| (*t, v))
    }

    /// Removes entries strictly older than `tv`; returns how many.
    pub fn pop_before(&mut self, tv: Timestamp) -> usize {
        let count = self.lower_bound(tv);
        for _ in 0..count {
            self.entries.pop_front();
        }
        count
    }

    /// Removes entries strictly newer than `tv`; returns how many.
    pub fn pop_after(&mut self, tv: Timestamp) -> usize {
        let start = self.upper_bound(tv);
        let count = self.entries.len() - start;
        for _ in 0..count {
            self.entries.pop_back();
        }
        count
    }
}
