// vision/association.rs

// Measurement-to-LED association: every (LED, measurement) pair within the
// movement threshold goes into a min-heap keyed by squared distance; pairs
// are popped closest-first, binding each LED and each measurement at most
// once (already-consumed entries are tombstoned in place and skipped).

// Dependencies
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A candidate pairing; the heap orders by squared distance, closest
/// first.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    led_index: usize,
    measurement_index: usize,
    squared_distance: f64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.squared_distance == other.squared_distance
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the smallest distance
        other
            .squared_distance
            .total_cmp(&self.squared_distance)
    }
}

/// Result of one association pass.
#[derive(Debug, Clone, Default)]
pub struct AssociationResult {
    /// (led_index, measurement_index) bindings, closest pairs first.
    pub bindings: Vec<(usize, usize)>,
    /// LEDs that received no measurement this frame (to be discarded).
    pub unmatched_leds: Vec<usize>,
    /// Measurements that matched no LED (to become new LEDs).
    pub unmatched_measurements: Vec<usize>,
}

/// Greedy closest-first assignment.
///
/// `led_positions` carries each LED's last-frame location;
/// `measurements` this frame's blob locations with their diameters. A pair
/// is a candidate only if its squared distance is below
/// `(move_threshold * diameter)^2`.
pub fn associate(
    led_positions: &[nalgebra::Vector2<f64>],
    measurements: &[(nalgebra::Vector2<f64>, f64)],
    move_threshold: f64,
) -> AssociationResult {
    let mut heap = BinaryHeap::new();
    for (m_idx, (loc, diameter)) in measurements.iter().enumerate() {
        let threshold = move_threshold * diameter;
        let threshold2 = threshold * threshold;
        for (l_idx, led_loc) in led_positions.iter().enumerate() {
            let d2 = (loc - led_loc).norm_squared();
            if d2 < threshold2 {
                heap.push(Candidate {
                    led_index: l_idx,
                    measurement_index: m_idx,
                    squared_distance: d2,
                });
            }
        }
    }

    let mut led_consumed = vec![false; led_positions.len()];
    let mut meas_consumed = vec![false; measurements.len()];
    let mut result = AssociationResult::default();

    while let Some(candidate) = heap.pop() {
        if led_consumed[candidate.led_index] || meas_consumed[candidate.measurement_index] {
            // tombstoned; a closer pairing already claimed one side
            continue;
        }
        led_consumed[candidate.led_index] = true;
        meas_consumed[candidate.measurement_index] = true;
        result
            .bindings
            .push((candidate.led_index, candidate.measurement_index));
    }

    result.unmatched_leds = led_consumed
        .iter()
        .enumerate()
        .filter(|(_, &used)| !used)
        .map(|(i, _)| i)
        .collect();
    result.unmatched_measurements = meas_consumed
        .iter()
        .enumerate()
        .filter(|(_, &used)| !used)
        .map(|(i, _)| i)
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn meas(x: f64, y: f64) -> (Vector2<f64>, f64) {
        (Vector2::new(x, y), 4.0)
    }

    #[test]
    fn nearest_pairs_bind_first() {
        let leds = vec![Vector2::new(0.0, 0.0), Vector2::new(10.0, 0.0)];
        let measurements = vec![meas(1.0, 0.0), meas(9.0, 0.0)];
        let result = associate(&leds, &measurements, 4.0);
        assert_eq!(result.bindings.len(), 2);
        assert!(result.bindings.contains(&(0, 0)));
        assert!(result.bindings.contains(&(1, 1)));
        assert!(result.unmatched_leds.is_empty());
        assert!(result.unmatched_measurements.is_empty());
    }

    #[test]
    fn each_side_binds_at_most_once() {
        // two LEDs fighting over one measurement: closer one wins
        let leds = vec![Vector2::new(0.0, 0.0), Vector2::new(2.0, 0.0)];
        let measurements = vec![meas(1.5, 0.0)];
        let result = associate(&leds, &measurements, 4.0);
        assert_eq!(result.bindings, vec![(1, 0)]);
        assert_eq!(result.unmatched_leds, vec![0]);
    }

    #[test]
    fn distance_threshold_scales_with_diameter() {
        let leds = vec![Vector2::new(0.0, 0.0)];
        // diameter 1, threshold factor 2 -> radius 2; distance 3 is out
        let measurements = vec![(Vector2::new(3.0, 0.0), 1.0)];
        let result = associate(&leds, &measurements, 2.0);
        assert!(result.bindings.is_empty());
        assert_eq!(result.unmatched_leds, vec![0]);
        assert_eq!(result.unmatched_measurements, vec![0]);
    }

    #[test]
    fn association_is_deterministic() {
        let leds = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(5.0, 5.0),
            Vector2::new(10.0, 0.0),
        ];
        let measurements = vec![meas(0.5, 0.2), meas(5.5, 5.2), meas(10.5, 0.1)];
        let first = associate(&leds, &measurements, 4.0);
        let second = associate(&leds, &measurements, 4.0);
        assert_eq!(first.bindings, second.bindings);
        // every binding is within its per-measurement threshold
        for &(l, m) in &first.bindings {
            let threshold = 4.0 * measurements[m].1;
            assert!((leds[l] - measurements[m].0).norm_squared() < threshold * threshold);
        }
    }

    #[test]
    fn unmatched_measurements_become_new_led_candidates() {
        let leds = vec![Vector2::new(0.0, 0.0)];
        let measurements = vec![meas(0.1, 0.0), meas(300.0, 300.0)];
        let result = associate(&leds, &measurements, 4.0);
        assert_eq!(result.bindings, vec![(0, 0)]);
        assert_eq!(result.unmatched_measurements, vec![1]);
    }
}
