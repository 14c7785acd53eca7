// vision/led.rs

// The tracked-LED data model: a blob followed across frames, carrying the
// brightness history used for blink-pattern identification, the current
// beacon identity (or one of the negative sentinels), and the bookkeeping
// the estimators need (novelty counter, bright-mode flag, used flag).

// Dependencies
use std::collections::VecDeque;

use nalgebra::Vector2;

use super::pattern::LedIdentifier;
use super::BlobMeasurement;

/// Beacon identity of a tracked LED. Non-negative values are zero-based
/// beacon indices; negative values are sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconId(pub i32);

impl BeaconId {
    /// No identifier ran, or the brightness history is too short.
    pub const SENTINEL_INSUFFICIENT_DATA: BeaconId = BeaconId(-1);
    /// History is long enough but too flat to split into bright/dim.
    pub const SENTINEL_INSUFFICIENT_EXTREMA: BeaconId = BeaconId(-2);
    /// History was usable but matched no known pattern.
    pub const SENTINEL_NO_PATTERN_RECOGNIZED: BeaconId = BeaconId(-3);
    /// Identification was refuted by model-based knowledge (sticky, so a
    /// debug view can show it).
    pub const SENTINEL_MARKED_MISIDENTIFIED: BeaconId = BeaconId(-4);

    /// Whether this is a positive identification of a known beacon.
    pub fn identified(self) -> bool {
        self.0 >= 0
    }

    /// Array index of an identified beacon. Must not be called on a
    /// sentinel.
    pub fn as_index(self) -> usize {
        debug_assert!(self.identified(), "sentinel beacon id used as an index");
        self.0 as usize
    }

    /// One-based form for display; sentinels pass through unchanged.
    pub fn one_based(self) -> i32 {
        if self.0 >= 0 {
            self.0 + 1
        } else {
            self.0
        }
    }
}

/// Maximum value of the novelty counter; identity changes reset to this.
pub const MAX_NOVELTY: u8 = 4;

/// Helper class to keep track of the state of a blob over time, which
/// determines the identity of each LED in the scene from its blink code.
#[derive(Debug, Clone)]
pub struct Led {
    latest: BlobMeasurement,
    /// Brightness per frame, oldest first.
    brightness_history: VecDeque<f64>,
    id: BeaconId,
    /// Most recent bright/dim decision; only meaningful when identified.
    last_bright: bool,
    /// Decays by one per frame, resets to MAX_NOVELTY on identity change.
    novelty: u8,
    was_used_last_frame: bool,
}

impl Led {
    /// A new LED from its first measurement. The keep-identity preference
    /// is irrelevant here since a fresh blob has no identity to keep.
    pub fn new(measurement: BlobMeasurement, identifier: &dyn LedIdentifier) -> Self {
        let mut led = Led {
            latest: measurement,
            brightness_history: VecDeque::new(),
            id: BeaconId::SENTINEL_INSUFFICIENT_DATA,
            last_bright: false,
            novelty: MAX_NOVELTY,
            was_used_last_frame: false,
        };
        // reuse the per-frame path; history is empty so this just seeds it
        let meas = led.latest.clone();
        led.add_measurement(meas, false, identifier);
        led
    }

    /// Adds this frame's measurement (which must belong to the frame
    /// immediately following the previous one, so the bright/dark encoding
    /// stays aligned) and re-runs identification.
    pub fn add_measurement(
        &mut self,
        measurement: BlobMeasurement,
        blobs_keep_id: bool,
        identifier: &dyn LedIdentifier,
    ) {
        self.brightness_history.push_back(measurement.brightness);
        if self.brightness_history.len() > identifier.history_capacity() {
            self.brightness_history.pop_front();
        }
        self.latest = measurement;

        let old_id = self.id;
        let (new_id, bright) =
            identifier.identify(self.id, &self.brightness_history, blobs_keep_id);
        self.id = new_id;
        self.last_bright = bright;

        // Keep the "misidentified" sentinel stickier than "insufficient
        // data" or "no pattern recognized" so it stays visible downstream.
        if old_id == BeaconId::SENTINEL_MARKED_MISIDENTIFIED
            && (self.id == BeaconId::SENTINEL_INSUFFICIENT_DATA
                || self.id == BeaconId::SENTINEL_NO_PATTERN_RECOGNIZED)
        {
            self.id = BeaconId::SENTINEL_MARKED_MISIDENTIFIED;
        }

        if old_id != self.id {
            // Newly recognized (any change counts): start at max novelty.
            self.novelty = MAX_NOVELTY;
        } else if self.novelty != 0 {
            // Novelty decays linearly to zero.
            self.novelty -= 1;
        }
    }

    pub fn measurement(&self) -> &BlobMeasurement {
        &self.latest
    }

    pub fn location(&self) -> Vector2<f64> {
        self.latest.loc
    }

    pub fn id(&self) -> BeaconId {
        self.id
    }

    pub fn identified(&self) -> bool {
        self.id.identified()
    }

    /// How new the current identification is, from MAX_NOVELTY down to 0.
    /// Used to penalize the variance of just-re-identified measurements.
    pub fn novelty(&self) -> u8 {
        self.novelty
    }

    /// Most recent bright-mode decision from the identifier.
    pub fn is_bright(&self) -> bool {
        self.last_bright
    }

    pub fn was_used_last_frame(&self) -> bool {
        self.was_used_last_frame
    }

    pub fn mark_as_used(&mut self) {
        self.was_used_last_frame = true;
    }

    pub fn reset_used(&mut self) {
        self.was_used_last_frame = false;
    }

    /// Called from pose estimation with model-based knowledge refuting the
    /// identification (e.g. the claimed beacon faces away from the
    /// camera). Clears the history so the pattern must re-establish
    /// itself.
    pub fn mark_misidentified(&mut self) {
        self.id = BeaconId::SENTINEL_MARKED_MISIDENTIFIED;
        if !self.brightness_history.is_empty() {
            self.brightness_history.clear();
            self.brightness_history.push_back(self.latest.brightness);
        }
    }

    pub fn brightness_history(&self) -> &VecDeque<f64> {
        &self.brightness_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::pattern::FixedIdentifier;

    fn blob_at(x: f64, y: f64) -> BlobMeasurement {
        BlobMeasurement::from_center_and_area(Vector2::new(x, y), 12.0)
    }

    #[test]
    fn sentinels_are_not_identified() {
        assert!(!BeaconId::SENTINEL_INSUFFICIENT_DATA.identified());
        assert!(!BeaconId::SENTINEL_MARKED_MISIDENTIFIED.identified());
        assert!(BeaconId(0).identified());
        assert_eq!(BeaconId(4).one_based(), 5);
        assert_eq!(BeaconId(-3).one_based(), -3);
    }

    #[test]
    fn identity_change_resets_novelty_and_decay_follows() {
        let ident = FixedIdentifier::new(BeaconId(2));
        let mut led = Led::new(blob_at(10.0, 10.0), &ident);
        assert_eq!(led.novelty(), MAX_NOVELTY);
        for expected in [3, 2, 1, 0, 0] {
            led.add_measurement(blob_at(10.0, 10.0), false, &ident);
            assert_eq!(led.novelty(), expected);
        }
    }

    #[test]
    fn misidentification_is_sticky_against_weak_sentinels() {
        let ident = FixedIdentifier::new(BeaconId::SENTINEL_INSUFFICIENT_DATA);
        let mut led = Led::new(blob_at(5.0, 5.0), &ident);
        led.mark_misidentified();
        assert_eq!(led.id(), BeaconId::SENTINEL_MARKED_MISIDENTIFIED);
        led.add_measurement(blob_at(5.0, 5.0), false, &ident);
        assert_eq!(led.id(), BeaconId::SENTINEL_MARKED_MISIDENTIFIED);
    }

    #[test]
    fn misidentification_clears_history() {
        let ident = FixedIdentifier::new(BeaconId(1));
        let mut led = Led::new(blob_at(5.0, 5.0), &ident);
        for _ in 0..5 {
            led.add_measurement(blob_at(5.0, 5.0), false, &ident);
        }
        assert!(led.brightness_history().len() > 1);
        led.mark_misidentified();
        assert_eq!(led.brightness_history().len(), 1);
    }

    #[test]
    fn used_flag_round_trips() {
        let ident = FixedIdentifier::new(BeaconId(0));
        let mut led = Led::new(blob_at(1.0, 1.0), &ident);
        assert!(!led.was_used_last_frame());
        led.mark_as_used();
        assert!(led.was_used_last_frame());
        led.reset_used();
        assert!(!led.was_used_last_frame());
    }
}
