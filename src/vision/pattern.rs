// vision/pattern.rs

// Blink-pattern identification: decides which beacon a tracked LED is by
// thresholding its brightness history into a bright/dim code and searching
// for that code in each beacon's pattern, treated cyclically.

// Dependencies
use std::collections::VecDeque;

use super::led::BeaconId;

/// Minimum spread between the brightest and dimmest history samples for
/// the bright/dim split to be trusted.
const MIN_EXTREMA_DIFFERENCE: f64 = 0.5;

/// Identity oracle for tracked LEDs. The production implementation matches
/// blink codes; fixed/mock implementations support synthetic pipelines and
/// tests.
pub trait LedIdentifier: Send + Sync {
    /// How many brightness samples an LED should retain.
    fn history_capacity(&self) -> usize;

    /// Determines the identity for an LED given its current identity and
    /// brightness history. Returns the new identity and the bright/dim
    /// decision for the newest sample.
    fn identify(&self, current: BeaconId, history: &VecDeque<f64>, keep_id: bool)
        -> (BeaconId, bool);
}

/// Identifies beacons by their blink codes: `*` is a bright frame, `.` a
/// dim one. Each pattern is stored "wrapped" (repeated almost twice) so an
/// observed window can be matched at any phase with a plain substring
/// search.
#[derive(Debug, Clone)]
pub struct PatternIdentifier {
    /// Wrapped patterns; None marks a disabled beacon that can never be
    /// identified.
    wrapped: Vec<Option<String>>,
    pattern_length: usize,
}

impl PatternIdentifier {
    /// Builds an identifier from one pattern string per beacon. Patterns
    /// that are empty, contain characters other than `*`/`.`, or disagree
    /// with the common length are treated as disabled.
    pub fn new(patterns: &[String]) -> Self {
        let pattern_length = patterns
            .iter()
            .find(|p| !p.is_empty() && p.chars().all(|c| c == '*' || c == '.'))
            .map(|p| p.len())
            .unwrap_or(0);
        let wrapped = patterns
            .iter()
            .map(|p| {
                if p.len() == pattern_length
                    && pattern_length > 0
                    && p.chars().all(|c| c == '*' || c == '.')
                {
                    let mut w = String::with_capacity(2 * pattern_length - 1);
                    w.push_str(p);
                    w.push_str(&p[..pattern_length - 1]);
                    Some(w)
                } else {
                    None
                }
            })
            .collect();
        PatternIdentifier {
            wrapped,
            pattern_length,
        }
    }

    pub fn pattern_length(&self) -> usize {
        self.pattern_length
    }

    fn bright_threshold(history: &VecDeque<f64>) -> Option<f64> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &b in history {
            min = min.min(b);
            max = max.max(b);
        }
        if max - min < MIN_EXTREMA_DIFFERENCE {
            None
        } else {
            Some((min + max) / 2.0)
        }
    }
}

impl LedIdentifier for PatternIdentifier {
    fn history_capacity(&self) -> usize {
        self.pattern_length.max(1)
    }

    fn identify(
        &self,
        current: BeaconId,
        history: &VecDeque<f64>,
        keep_id: bool,
    ) -> (BeaconId, bool) {
        let threshold = Self::bright_threshold(history);
        let bright = match (threshold, history.back()) {
            (Some(t), Some(&latest)) => latest >= t,
            _ => false,
        };

        // Optional early-out: hold on to an existing valid identity.
        if keep_id && current.identified() {
            return (current, bright);
        }

        if history.len() < self.pattern_length || self.pattern_length == 0 {
            return (BeaconId::SENTINEL_INSUFFICIENT_DATA, bright);
        }
        let threshold = match threshold {
            Some(t) => t,
            None => return (BeaconId::SENTINEL_INSUFFICIENT_EXTREMA, bright),
        };

        let window: String = history
            .iter()
            .skip(history.len() - self.pattern_length)
            .map(|&b| if b >= threshold { '*' } else { '.' })
            .collect();

        for (beacon, wrapped) in self.wrapped.iter().enumerate() {
            if let Some(wrapped) = wrapped {
                if wrapped.contains(&window) {
                    return (BeaconId(beacon as i32), bright);
                }
            }
        }
        (BeaconId::SENTINEL_NO_PATTERN_RECOGNIZED, bright)
    }
}

/// An identifier that always reports the same identity. Useful for
/// synthetic pipelines and tests where identities are known a priori.
#[derive(Debug, Clone)]
pub struct FixedIdentifier {
    id: BeaconId,
}

impl FixedIdentifier {
    pub fn new(id: BeaconId) -> Self {
        FixedIdentifier { id }
    }
}

impl LedIdentifier for FixedIdentifier {
    fn history_capacity(&self) -> usize {
        16
    }

    fn identify(
        &self,
        _current: BeaconId,
        _history: &VecDeque<f64>,
        _keep_id: bool,
    ) -> (BeaconId, bool) {
        (self.id, false)
    }
}
