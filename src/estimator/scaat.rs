// estimator/scaat.rs

// Single-Constraint-At-A-Time Kalman estimator: during steady tracking,
// every identified LED contributes its own 2-D correction to the augmented
// (body + beacon) state, letting beacon auto-calibration ride along. Also
// keeps the health counters that drive the target's state machine.

// Dependencies
use log::{debug, info};
use nalgebra::Matrix3;

use super::measurement::{CameraModel, ImagePointMeasurement};
use super::EstimationContext;
use crate::config::ConfigParams;
use crate::filter::augmented::AugmentedState;
use crate::filter::process::ConstantProcess;
use crate::filter::{begin_correction, predict};
use crate::vision::led::Led;

/// Number of dim identified LEDs that must be in view before bright-mode
/// LEDs may be skipped outright.
const DIM_BEACON_CUTOFF_TO_SKIP_BRIGHTS: usize = 4;
/// Variance penalty applied to bright-mode LEDs when they are used anyway.
const BRIGHT_PENALTY: f64 = 8.0;

/// Consecutive probation frames before the filter asks for a reset.
const MAX_PROBATION_FRAMES: usize = 10;
/// Consecutive frames where measurements were seen but none survived.
const MAX_FRAMES_WITHOUT_UTILIZED_MEASUREMENTS: usize = 30;
/// Consecutive frames with no identified blobs at all before waiting for
/// beacons to reappear.
const MAX_FRAMES_WITHOUT_IDENTIFIED_BLOBS: usize = 10;

/// Result of the post-frame health check, driving the target state
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingHealth {
    Functioning,
    NeedsResetNow,
    ResetWhenBeaconsSeen,
}

/// Three-valued answer for blob-shape tests that need "don't know".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriBool {
    False,
    True,
    Unknown,
}

pub struct ScaatEstimator {
    should_skip_bright: bool,
    max_squared_residual: f64,
    max_z_component: f64,
    high_residual_variance_penalty: f64,
    beacon_process_noise: f64,
    measurement_variance_scale_factor: f64,
    extra_verbose: bool,
    stream_beacon_debug: bool,
    min_box_ratio: f64,
    max_box_ratio: f64,

    frames_in_probation: usize,
    frames_without_identified_blobs: usize,
    frames_without_utilized_measurements: usize,
}

impl ScaatEstimator {
    pub fn new(params: &ConfigParams) -> Self {
        let ratio = params.bounding_box_filter_ratio;
        let (min_box_ratio, max_box_ratio) = if ratio >= 1.0 {
            (1.0 / ratio, ratio)
        } else {
            (ratio, 1.0 / ratio)
        };
        ScaatEstimator {
            should_skip_bright: params.should_skip_bright_leds,
            max_squared_residual: params.max_residual * params.max_residual,
            max_z_component: params.max_z_component,
            high_residual_variance_penalty: params.high_residual_variance_penalty,
            beacon_process_noise: params.beacon_process_noise,
            measurement_variance_scale_factor: params.measurement_variance_scale_factor,
            extra_verbose: params.extra_verbose,
            stream_beacon_debug: params.stream_beacon_debug_info,
            min_box_ratio,
            max_box_ratio,
            frames_in_probation: 0,
            frames_without_identified_blobs: 0,
            frames_without_utilized_measurements: 0,
        }
    }

    /// Call when (re-)entering Kalman mode.
    pub fn reset_counters(&mut self) {
        self.frames_in_probation = 0;
        self.frames_without_identified_blobs = 0;
        self.frames_without_utilized_measurements = 0;
    }

    /// Whether a blob's bounding box is near enough to square; Unknown if
    /// no bounding box was recorded.
    fn in_bounding_box_ratio_range(&self, led: &Led) -> TriBool {
        match led.measurement().bounding_box {
            Some((w, h)) if w > 0.0 => {
                let ratio = h / w;
                if ratio > self.min_box_ratio && ratio < self.max_box_ratio {
                    TriBool::True
                } else {
                    TriBool::False
                }
            }
            _ => TriBool::Unknown,
        }
    }

    /// One frame of per-LED corrections. `usable` indexes the identified
    /// LEDs in `leds`; `video_dt` is the time since the previous video
    /// estimate.
    pub fn estimate(
        &mut self,
        ctx: &mut EstimationContext<'_>,
        leds: &mut [Led],
        usable: &[usize],
        video_dt: f64,
    ) -> bool {
        let in_bounds = usable.len();
        let mut in_bounds_bright = 0usize;
        for &idx in usable {
            if leds[idx].is_bright() {
                in_bounds_bright += 1;
            }
        }
        // Skip brights only if we can afford to: enough dim identified
        // LEDs must remain.
        let skip_bright = self.should_skip_bright
            && in_bounds - in_bounds_bright > DIM_BEACON_CUTOFF_TO_SKIP_BRIGHTS;

        if in_bounds == 0 {
            self.frames_without_identified_blobs += 1;
        } else {
            self.frames_without_identified_blobs = 0;
        }

        let mut meas = ImagePointMeasurement::new(CameraModel::from(ctx.intrinsics));
        let mut beacon_process = ConstantProcess::default();

        // Rotation used for emission-direction culling; computed once from
        // the predicted orientation rather than after each correction.
        let rotate: Matrix3<f64> = *ctx.state.combined_quaternion().to_rotation_matrix().matrix();

        let mut num_bad = 0usize;
        let mut num_good = 0usize;
        let mut got_measurement = false;

        for &led_idx in usable {
            let led = &mut leds[led_idx];
            let index = led.id().as_index();
            if index >= ctx.beacons.len() {
                continue;
            }
            if self.stream_beacon_debug {
                ctx.beacon_debug[index].seen = true;
                ctx.beacon_debug[index].measurement = led.location();
            }
            if skip_bright && led.is_bright() {
                continue;
            }

            // Angle-of-emission check: transformed into camera space, an
            // LED pointed straight at the camera has emission z = -1. Zero
            // or positive z means the LED faces away, so the
            // identification must be wrong.
            let z_component = (rotate * ctx.emission_directions[index]).z;
            if z_component > 0.0 {
                if self.extra_verbose {
                    debug!(
                        "Rejecting an LED at {:?} claiming beacon {}: it would face away",
                        led.location(),
                        led.id().one_based()
                    );
                }
                led.mark_misidentified();
                num_bad += 1;
                continue;
            } else if z_component > self.max_z_component {
                // Too oblique to give reliable data; skip without blame.
                continue;
            }

            // Give the beacon its share of process uncertainty, unless it
            // is fixed.
            if !ctx.beacon_fixed[index] {
                beacon_process.set_noise_autocorrelation(self.beacon_process_noise);
                predict(&mut ctx.beacons[index], &beacon_process, video_dt);
            }

            meas.set_measurement(&led.location());
            led.mark_as_used();

            let mut local_variance_factor = 1.0;
            let novelty_penalty = (led.novelty() as f64).exp2();

            let mut aug = AugmentedState::new(ctx.state, &mut ctx.beacons[index]);
            let residual = crate::filter::MeasurementModel::residual(&meas, &aug);
            if residual.norm_squared() > self.max_squared_residual {
                // Probably bad: keep it, but heavily discounted.
                num_bad += 1;
                local_variance_factor *= self.high_residual_variance_penalty;
            } else {
                num_good += 1;
            }

            let effective_variance = local_variance_factor
                * self.measurement_variance_scale_factor
                * novelty_penalty
                * if led.is_bright() { BRIGHT_PENALTY } else { 1.0 }
                * ctx.base_measurement_variance[index]
                / led.measurement().area;
            meas.set_variance(effective_variance);

            if self.stream_beacon_debug {
                ctx.beacon_debug[index].residual = residual;
                ctx.beacon_debug[index].variance = effective_variance;
            }

            let correction = begin_correction(&mut aug, &meas);
            if !correction.state_correction_finite {
                debug!("Non-finite SCAAT correction for beacon {}", index + 1);
                continue;
            }
            if correction.finish_correction(true) {
                got_measurement = true;
            }
        }

        // Probation: track the ratio of bad to good residuals, with
        // hysteresis so one bad frame doesn't flap the state machine.
        let increment_probation = if self.frames_in_probation == 0 {
            // aim for at least a 3:2 ratio of good to bad
            num_bad * 3 > num_good * 2
        } else {
            let still_bad = num_bad * 2 > num_good;
            if !still_bad {
                self.frames_in_probation = 0;
            }
            still_bad
        };
        if increment_probation {
            self.frames_in_probation += 1;
        }

        if got_measurement {
            self.frames_without_utilized_measurements = 0;
        } else if in_bounds > 0 {
            // We saw measurements and rejected them all; the problem may
            // be our own state rather than the blobs.
            self.frames_without_utilized_measurements += 1;
        }
        true
    }

    /// Determines whether the filter is in good working condition, should
    /// fall back to RANSAC immediately, or should fall back as soon as
    /// beacons are seen again. Call `reset_counters` when re-entering
    /// Kalman mode afterwards.
    pub fn tracking_health(&self) -> TrackingHealth {
        if self.frames_in_probation > MAX_PROBATION_FRAMES
            || self.frames_without_utilized_measurements
                > MAX_FRAMES_WITHOUT_UTILIZED_MEASUREMENTS
        {
            info!(
                "SCAAT health: reset needed (probation {}, unused-measurement frames {})",
                self.frames_in_probation, self.frames_without_utilized_measurements
            );
            return TrackingHealth::NeedsResetNow;
        }
        if self.frames_without_identified_blobs > MAX_FRAMES_WITHOUT_IDENTIFIED_BLOBS {
            return TrackingHealth::ResetWhenBeaconsSeen;
        }
        TrackingHealth::Functioning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::process::DampedConstantVelocity;
    use crate::filter::state::{BeaconState, BodyState};
    use crate::filter::FilterState;
    use crate::vision::camera::CameraIntrinsics;
    use crate::vision::led::BeaconId;
    use crate::vision::pattern::FixedIdentifier;
    use crate::vision::BlobMeasurement;
    use crate::estimator::BeaconDebug;
    use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};

    struct Fixture {
        intrinsics: CameraIntrinsics,
        beacons: Vec<BeaconState>,
        variances: Vec<f64>,
        fixed: Vec<bool>,
        emission: Vec<Vector3<f64>>,
        debug: Vec<BeaconDebug>,
        state: BodyState,
        process: DampedConstantVelocity,
    }

    fn fixture() -> Fixture {
        let beacon_positions = [
            Vector3::new(-0.04, -0.03, 0.0),
            Vector3::new(0.04, -0.03, 0.0),
            Vector3::new(0.04, 0.03, 0.0),
            Vector3::new(-0.04, 0.03, 0.0),
        ];
        let mut state = BodyState::default();
        state.set_position(&Vector3::new(0.0, 0.0, 0.35));
        // moderately confident starting covariance
        let mut cov = state.error_covariance();
        cov *= 1e-4;
        state.set_error_covariance(&cov);
        Fixture {
            intrinsics: CameraIntrinsics::simulated(),
            beacons: beacon_positions
                .iter()
                .map(|p| BeaconState::new(*p, Matrix3::identity() * 1e-9))
                .collect(),
            variances: vec![3.0; 4],
            fixed: vec![false; 4],
            emission: vec![Vector3::new(0.0, 0.0, -1.0); 4],
            debug: vec![BeaconDebug::default(); 4],
            state,
            process: DampedConstantVelocity::new(
                0.9,
                0.9,
                &[0.01, 0.01, 0.01, 0.1, 0.1, 0.1],
            ),
        }
    }

    fn led_for_beacon(
        fx: &Fixture,
        beacon: usize,
        offset: Vector2<f64>,
    ) -> Led {
        let world = fx.state.combined_quaternion() * fx.beacons[beacon].position()
            + fx.state.position();
        let pixel = fx.intrinsics.project(&world).unwrap() + offset;
        let ident = FixedIdentifier::new(BeaconId(beacon as i32));
        let mut blob = BlobMeasurement::from_center_and_area(pixel, 30.0);
        blob.bounding_box = Some((6.0, 6.0));
        Led::new(blob, &ident)
    }

    fn run_frame(fx: &mut Fixture, leds: &mut [Led], usable: &[usize]) -> bool {
        let mut estimator = ScaatEstimator::new(&ConfigParams::default());
        let mut ctx = EstimationContext {
            intrinsics: &fx.intrinsics,
            beacons: &mut fx.beacons,
            base_measurement_variance: &fx.variances,
            beacon_fixed: &fx.fixed,
            emission_directions: &fx.emission,
            starting_time: crate::Timestamp::from_secs(0.0),
            state: &mut fx.state,
            process: &fx.process,
            beacon_debug: &mut fx.debug,
        };
        estimator.estimate(&mut ctx, leds, usable, 1.0 / 30.0)
    }

    #[test]
    fn consistent_measurements_leave_pose_close() {
        let mut fx = fixture();
        let mut leds: Vec<Led> = (0..4).map(|i| led_for_beacon(&fx, i, Vector2::zeros())).collect();
        let before = fx.state.position();
        run_frame(&mut fx, &mut leds, &[0, 1, 2, 3]);
        assert!((fx.state.position() - before).norm() < 1e-3);
        assert!(leds.iter().all(|l| l.was_used_last_frame()));
    }

    #[test]
    fn offset_measurements_pull_the_pose() {
        let mut fx = fixture();
        // every beacon appears shifted right by 12px: the body should move
        let mut leds: Vec<Led> = (0..4)
            .map(|i| led_for_beacon(&fx, i, Vector2::new(12.0, 0.0)))
            .collect();
        let before = fx.state.position();
        for _ in 0..8 {
            run_frame(&mut fx, &mut leds, &[0, 1, 2, 3]);
        }
        assert!(fx.state.position().x > before.x + 1e-4);
    }

    #[test]
    fn away_facing_beacon_is_flagged_misidentified() {
        let mut fx = fixture();
        fx.emission[2] = Vector3::new(0.0, 0.0, 1.0); // faces away
        let mut leds: Vec<Led> = (0..4).map(|i| led_for_beacon(&fx, i, Vector2::zeros())).collect();
        run_frame(&mut fx, &mut leds, &[0, 1, 2, 3]);
        assert_eq!(leds[2].id(), BeaconId::SENTINEL_MARKED_MISIDENTIFIED);
        assert!(!leds[2].was_used_last_frame());
    }

    #[test]
    fn grazing_beacon_is_skipped_without_blame() {
        let mut fx = fixture();
        // just past the default -0.3 cutoff, but still negative
        fx.emission[1] = Vector3::new(0.97, 0.0, -0.2).normalize();
        let mut leds: Vec<Led> = (0..4).map(|i| led_for_beacon(&fx, i, Vector2::zeros())).collect();
        run_frame(&mut fx, &mut leds, &[0, 1, 2, 3]);
        assert!(leds[1].identified());
        assert!(!leds[1].was_used_last_frame());
    }

    #[test]
    fn empty_frames_escalate_to_reset_when_beacons_seen() {
        let mut fx = fixture();
        let mut estimator = ScaatEstimator::new(&ConfigParams::default());
        for _ in 0..(MAX_FRAMES_WITHOUT_IDENTIFIED_BLOBS + 1) {
            let mut ctx = EstimationContext {
                intrinsics: &fx.intrinsics,
                beacons: &mut fx.beacons,
                base_measurement_variance: &fx.variances,
                beacon_fixed: &fx.fixed,
                emission_directions: &fx.emission,
                starting_time: crate::Timestamp::from_secs(0.0),
                state: &mut fx.state,
                process: &fx.process,
                beacon_debug: &mut fx.debug,
            };
            estimator.estimate(&mut ctx, &mut [], &[], 1.0 / 30.0);
        }
        assert_eq!(estimator.tracking_health(), TrackingHealth::ResetWhenBeaconsSeen);
        estimator.reset_counters();
        assert_eq!(estimator.tracking_health(), TrackingHealth::Functioning);
    }

    #[test]
    fn non_fixed_beacons_accumulate_process_noise() {
        let mut fx = fixture();
        fx.fixed = vec![false, true, false, false];
        let before_free = fx.beacons[0].error_covariance()[(0, 0)];
        let before_fixed = fx.beacons[1].error_covariance()[(0, 0)];
        let mut leds: Vec<Led> = (0..4).map(|i| led_for_beacon(&fx, i, Vector2::zeros())).collect();
        run_frame(&mut fx, &mut leds, &[0, 1, 2, 3]);
        // the non-fixed beacon got prediction noise (then a correction);
        // the fixed one never saw prediction noise
        assert!(fx.beacons[1].error_covariance()[(0, 0)] <= before_fixed);
        let _ = before_free;
    }

    #[test]
    fn bounding_box_ratio_tristate() {
        let fx = fixture();
        let estimator = ScaatEstimator::new(&ConfigParams::default());
        let mut round = led_for_beacon(&fx, 0, Vector2::zeros());
        assert_eq!(estimator.in_bounding_box_ratio_range(&round), TriBool::True);
        let mut blob = round.measurement().clone();
        blob.bounding_box = Some((10.0, 2.0));
        let ident = FixedIdentifier::new(BeaconId(0));
        round.add_measurement(blob, false, &ident);
        assert_eq!(estimator.in_bounding_box_ratio_range(&round), TriBool::False);
        let mut no_box = round.measurement().clone();
        no_box.bounding_box = None;
        round.add_measurement(no_box, false, &ident);
        assert_eq!(estimator.in_bounding_box_ratio_range(&round), TriBool::Unknown);
    }
}
