// target/setup.rs

// Beacon setup tables: the parallel per-beacon arrays handed in by the
// device descriptor (pattern, location, emission direction, variances,
// fixed flag), plus the validator that disables malformed entries and
// summarizes what it found. Locations arrive in millimeters and are
// converted to meters by the factory.

// Dependencies
use log::{info, warn};
use nalgebra::Vector3;

/// Sentinel location marking a beacon whose position was never filled in.
pub fn bogus_location() -> Vector3<f64> {
    Vector3::new(-10000.0, -10000.0, -10000.0)
}

/// Data for a full target, unswizzled into a struct of parallel vectors.
/// All vectors must have the same length; uneven tails are reported by the
/// validator.
#[derive(Debug, Clone, Default)]
pub struct TargetSetupData {
    /// Blink pattern per beacon: `*` bright, `.` dim; any other character
    /// disables the beacon.
    pub patterns: Vec<String>,
    /// Beacon locations in the target frame, in millimeters.
    pub locations: Vec<Vector3<f64>>,
    /// Unit emission direction per beacon, in the target frame.
    pub emission_directions: Vec<Vector3<f64>>,
    /// Base measurement variance before observation-based modifiers.
    pub base_measurement_variances: Vec<f64>,
    /// Initial error in the auto-calibrated beacon position state.
    pub initial_autocalibration_errors: Vec<f64>,
    /// Fixed beacons are exempt from auto-calibration.
    pub is_fixed: Vec<bool>,
}

impl TargetSetupData {
    /// Resizes every parallel vector to `n` beacons with neutral defaults.
    pub fn set_beacon_count(
        &mut self,
        n: usize,
        default_measurement_variance: f64,
        default_autocalibration_error: f64,
    ) {
        self.patterns.resize(n, String::new());
        self.locations.resize(n, bogus_location());
        self.emission_directions.resize(n, Vector3::zeros());
        self.base_measurement_variances
            .resize(n, default_measurement_variance);
        self.initial_autocalibration_errors
            .resize(n, default_autocalibration_error);
        self.is_fixed.resize(n, false);
    }

    pub fn num_beacons(&self) -> usize {
        self.patterns.len()
    }

    /// Marks a beacon (zero-based) as fixed, clearing its initial
    /// auto-calibration error to match.
    pub fn mark_beacon_fixed(&mut self, beacon: usize) {
        if beacon < self.is_fixed.len() {
            self.is_fixed[beacon] = true;
            self.initial_autocalibration_errors[beacon] = 0.0;
        }
    }

    /// Validates and normalizes the table in place. Beacons with errors
    /// are disabled (pattern cleared) and every finding is recorded in the
    /// summary.
    pub fn clean_and_validate(&mut self) -> TargetDataSummary {
        let mut summary = TargetDataSummary::default();
        let lengths = [
            self.patterns.len(),
            self.locations.len(),
            self.emission_directions.len(),
            self.base_measurement_variances.len(),
            self.initial_autocalibration_errors.len(),
            self.is_fixed.len(),
        ];
        let min_len = *lengths.iter().min().unwrap();
        let max_len = *lengths.iter().max().unwrap();

        let mut pattern_length = 0usize;
        for i in 0..min_len {
            let one_based = (i + 1) as i32;

            if self.patterns[i].is_empty() {
                summary.disabled_by_empty_pattern.push(one_based);
                continue;
            }
            if self.patterns[i].chars().any(|c| c != '*' && c != '.') {
                // Disabled by adding an invalid character: not an error,
                // but clear the pattern for the ease of downstream code.
                self.patterns[i].clear();
                summary.disabled_by_pattern.push(one_based);
                continue;
            }
            if pattern_length == 0 {
                pattern_length = self.patterns[i].len();
                info!("Determined that patterns are {} bits long", pattern_length);
            }

            let mut got_error = false;
            if self.patterns[i].len() != pattern_length {
                got_error = true;
                summary.errors.push((
                    one_based,
                    "Pattern was non-empty and all legal characters, but length did not match"
                        .to_string(),
                ));
            }
            if self.locations[i] == bogus_location() {
                got_error = true;
                summary.errors.push((
                    one_based,
                    "Beacon location is still the uninitialized sentinel value".to_string(),
                ));
            }
            if self.emission_directions[i] == Vector3::zeros() {
                got_error = true;
                summary.errors.push((
                    one_based,
                    "Beacon emission direction is zero - uninitialized".to_string(),
                ));
            }
            if self.base_measurement_variances[i] <= 0.0 {
                got_error = true;
                summary.errors.push((
                    one_based,
                    "Beacon base measurement variance is not positive".to_string(),
                ));
            }
            if self.is_fixed[i] {
                // Normalize in case the helper wasn't used.
                self.initial_autocalibration_errors[i] = 0.0;
            } else if self.initial_autocalibration_errors[i] == 0.0 {
                got_error = true;
                summary.errors.push((
                    one_based,
                    "Beacon initial autocalibration error is zero but the beacon is not fixed"
                        .to_string(),
                ));
            } else if self.initial_autocalibration_errors[i] < 0.0 {
                got_error = true;
                summary.errors.push((
                    one_based,
                    "Beacon initial autocalibration error is negative".to_string(),
                ));
            }

            if got_error {
                self.patterns[i].clear();
            } else {
                summary.valid_beacons.push(one_based);
            }
        }

        // Uneven tails: beacon exists in some vectors but not all.
        for i in min_len..max_len {
            summary.errors.push((
                (i + 1) as i32,
                "Mismatched vectors: beacon exists in at least one vector but not in all"
                    .to_string(),
            ));
        }
        if max_len != min_len {
            warn!(
                "Beacon setup vectors have mismatched lengths ({}..{}); tail entries dropped",
                min_len, max_len
            );
            self.patterns.truncate(min_len);
            self.locations.truncate(min_len);
            self.emission_directions.truncate(min_len);
            self.base_measurement_variances.truncate(min_len);
            self.initial_autocalibration_errors.truncate(min_len);
            self.is_fixed.truncate(min_len);
        }
        summary
    }
}

/// Summary of what the validator found, one-based beacon ids throughout.
#[derive(Debug, Clone, Default)]
pub struct TargetDataSummary {
    pub valid_beacons: Vec<i32>,
    pub disabled_by_empty_pattern: Vec<i32>,
    pub disabled_by_pattern: Vec<i32>,
    pub errors: Vec<(i32, String)>,
}

impl std::fmt::Display for TargetDataSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Beacon setup summary:")?;
        writeln!(f, "  valid beacons: {:?}", self.valid_beacons)?;
        writeln!(
            f,
            "  disabled by empty pattern: {:?}",
            self.disabled_by_empty_pattern
        )?;
        writeln!(f, "  disabled by pattern: {:?}", self.disabled_by_pattern)?;
        for (id, message) in &self.errors {
            writeln!(f, "  error on beacon {}: {}", id, message)?;
        }
        Ok(())
    }
}
