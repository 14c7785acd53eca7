// target/mod.rs

// The tracked target: a rigid arrangement of beacons detected by
// video-based tracking. Owns the per-beacon model arrays and live
// auto-calibration states, the tracked-LED bookkeeping, and the
// three-mode estimation state machine (RANSAC bootstrap, RANSAC-seeded
// grace period, SCAAT Kalman steady state) with its health monitoring.

pub mod setup;

// Dependencies
use log::{info, warn};
use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};

use crate::config::ConfigParams;
use crate::estimator::ransac::RansacPoseEstimator;
use crate::estimator::scaat::{ScaatEstimator, TrackingHealth};
use crate::estimator::{BeaconDebug, EstimationContext};
use crate::filter::process::DampedConstantVelocity;
use crate::filter::state::{BeaconState, BodyState};
use crate::filter::FilterState;
use crate::vision::association::associate;
use crate::vision::camera::CameraIntrinsics;
use crate::vision::led::Led;
use crate::vision::pattern::{LedIdentifier, PatternIdentifier};
use crate::vision::BlobMeasurement;
use crate::{Timestamp, TrackerError};
use self::setup::TargetSetupData;

/// Current mode of the target's tracking state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTrackingState {
    Ransac,
    /// Grace period: the first frame after a successful bootstrap skips
    /// the Kalman health check once.
    EnteringKalman,
    Kalman,
    /// Tracking failed with no beacons in sight; bootstrap again as soon
    /// as any identified LED reappears.
    RansacWhenBlobDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetHealthState {
    Ok,
    StopTrackingErrorBoundsExceeded,
    StopTrackingLostSight,
}

/// Frames without any identified beacon before tracking is declared lost.
const MAX_FRAMES_WITHOUT_BEACONS: usize = 150;
/// Hard cap on the positional error variance (m^2) while in a
/// Kalman-family state.
const MAX_POSITIONAL_ERROR_VARIANCE: f64 = 15.0;

#[derive(Debug, Default)]
struct TargetHealthEvaluator {
    frames_without_valid_beacons: usize,
}

impl TargetHealthEvaluator {
    fn evaluate(
        &mut self,
        body_state: &BodyState,
        usable_leds: usize,
        tracking_state: TargetTrackingState,
    ) -> TargetHealthState {
        if usable_leds == 0 {
            self.frames_without_valid_beacons += 1;
        } else {
            self.frames_without_valid_beacons = 0;
        }

        if tracking_state != TargetTrackingState::Ransac {
            let max_positional_error = body_state
                .error_covariance()
                .diagonal()
                .fixed_rows::<3>(0)
                .max();
            if max_positional_error > MAX_POSITIONAL_ERROR_VARIANCE {
                return TargetHealthState::StopTrackingErrorBoundsExceeded;
            }
        }

        if self.frames_without_valid_beacons > MAX_FRAMES_WITHOUT_BEACONS {
            return TargetHealthState::StopTrackingLostSight;
        }
        TargetHealthState::Ok
    }
}

/// One rigid beacon arrangement tracked in video.
pub struct TrackedTarget {
    params: ConfigParams,
    id: u8,

    // Parallel vectors, one entry per beacon; all the same length.
    beacons: Vec<BeaconState>,
    base_measurement_variance: Vec<f64>,
    beacon_fixed: Vec<bool>,
    emission_directions: Vec<Vector3<f64>>,
    beacon_debug: Vec<BeaconDebug>,

    /// Offset subtracted from all beacon positions at setup; added back to
    /// the body position before reporting. Keeps orientation and position
    /// error decoupled when the camera views a small cluster.
    beacon_offset: Vector3<f64>,

    leds: Vec<Led>,
    usable_leds: Vec<usize>,
    identifier: Box<dyn LedIdentifier>,

    ransac: RansacPoseEstimator,
    scaat: ScaatEstimator,
    health: TargetHealthEvaluator,

    tracking_state: TargetTrackingState,
    last_estimate: Timestamp,
    has_pose_estimate: bool,
}

impl TrackedTarget {
    /// Builds a target from validated setup data with locations already in
    /// meters. The parallel arrays must agree in length.
    pub fn new(
        params: &ConfigParams,
        data: &TargetSetupData,
        id: u8,
    ) -> Result<Self, TrackerError> {
        let n = data.num_beacons();
        if data.locations.len() != n
            || data.emission_directions.len() != n
            || data.base_measurement_variances.len() != n
            || data.initial_autocalibration_errors.len() != n
            || data.is_fixed.len() != n
        {
            return Err(TrackerError::BeaconTable(
                "parallel beacon vectors have mismatched lengths".to_string(),
            ));
        }

        let beacon_offset = if params.offset_to_centroid {
            let centroid = data.locations.iter().sum::<Vector3<f64>>() / n.max(1) as f64;
            if params.debug {
                info!("Computed beacon centroid: {:?}", centroid);
            }
            centroid
        } else {
            Vector3::from_column_slice(&params.manual_beacon_offset)
        };

        let beacons = data
            .locations
            .iter()
            .zip(&data.initial_autocalibration_errors)
            .map(|(location, &error)| {
                BeaconState::new(
                    location - beacon_offset,
                    Matrix3::from_diagonal(&Vector3::from_element(error)),
                )
            })
            .collect();

        Ok(TrackedTarget {
            params: params.clone(),
            id,
            beacons,
            base_measurement_variance: data.base_measurement_variances.clone(),
            beacon_fixed: data.is_fixed.clone(),
            emission_directions: data.emission_directions.clone(),
            beacon_debug: vec![BeaconDebug::default(); n],
            beacon_offset,
            leds: Vec::new(),
            usable_leds: Vec::new(),
            identifier: Box::new(PatternIdentifier::new(&data.patterns)),
            ransac: RansacPoseEstimator::default(),
            scaat: ScaatEstimator::new(params),
            health: TargetHealthEvaluator::default(),
            tracking_state: TargetTrackingState::Ransac,
            last_estimate: Timestamp::default(),
            has_pose_estimate: false,
        })
    }

    /// Replaces the identity oracle (synthetic pipelines, alternative
    /// hardware profiles).
    pub fn set_identifier(&mut self, identifier: Box<dyn LedIdentifier>) {
        self.identifier = identifier;
    }

    pub fn num_beacons(&self) -> usize {
        self.beacons.len()
    }

    pub fn tracking_state(&self) -> TargetTrackingState {
        self.tracking_state
    }

    pub fn has_pose_estimate(&self) -> bool {
        self.has_pose_estimate
    }

    pub fn last_update(&self) -> Timestamp {
        self.last_estimate
    }

    pub fn beacon_offset(&self) -> Vector3<f64> {
        self.beacon_offset
    }

    /// Auto-calibrated beacon position in the original target frame.
    pub fn beacon_autocalib_position(&self, beacon: usize) -> Vector3<f64> {
        self.beacons[beacon].position() + self.beacon_offset
    }

    /// Diagonal of the beacon's auto-calibration covariance.
    pub fn beacon_autocalib_variance(&self, beacon: usize) -> Vector3<f64> {
        self.beacons[beacon].error_covariance().diagonal()
    }

    pub fn leds(&self) -> &[Led] {
        &self.leds
    }

    pub fn beacon_debug(&self) -> &[BeaconDebug] {
        &self.beacon_debug
    }

    /// Ingests this frame's (undistorted) blob measurements: associates
    /// them with surviving LEDs, drops LEDs that found no blob, and starts
    /// tracking new blobs. Returns how many measurements landed on
    /// existing LEDs.
    pub fn process_led_measurements(&mut self, undistorted: &[BlobMeasurement]) -> usize {
        self.usable_leds.clear();
        if self.params.stream_beacon_debug_info {
            for debug in &mut self.beacon_debug {
                debug.reset();
            }
        }

        let num_beacons = self.beacons.len();
        for led in &mut self.leds {
            led.reset_used();
            Self::handle_out_of_range_id(led, num_beacons);
        }

        let led_positions: Vec<Vector2<f64>> = self.leds.iter().map(|l| l.location()).collect();
        let measurements: Vec<(Vector2<f64>, f64)> =
            undistorted.iter().map(|m| (m.loc, m.diameter)).collect();
        let result = associate(
            &led_positions,
            &measurements,
            self.params.blob_move_threshold,
        );

        let mut used_measurements = 0;
        for &(led_idx, meas_idx) in &result.bindings {
            let led = &mut self.leds[led_idx];
            led.add_measurement(
                undistorted[meas_idx].clone(),
                self.params.blobs_keep_identity,
                self.identifier.as_ref(),
            );
            if !Self::handle_out_of_range_id(led, num_beacons) {
                used_measurements += 1;
            }
        }

        // LEDs with no blob this frame are gone.
        let mut keep = vec![true; self.leds.len()];
        for &idx in &result.unmatched_leds {
            keep[idx] = false;
        }
        let mut index = 0;
        self.leds.retain(|_| {
            let keep_this = keep[index];
            index += 1;
            keep_this
        });

        // Blobs with no LED start new tracks.
        for &meas_idx in &result.unmatched_measurements {
            self.leds.push(Led::new(
                undistorted[meas_idx].clone(),
                self.identifier.as_ref(),
            ));
        }
        used_measurements
    }

    /// An identity outside [0, num_beacons) cannot be real; flag it so it
    /// never escapes into estimation.
    fn handle_out_of_range_id(led: &mut Led, num_beacons: usize) -> bool {
        if led.identified() && led.id().as_index() >= num_beacons {
            warn!(
                "Got a blob claiming to be beacon {} when we only have {} beacons",
                led.id().one_based(),
                num_beacons
            );
            led.mark_misidentified();
            return true;
        }
        false
    }

    fn update_usable_leds(&mut self) {
        self.usable_leds.clear();
        for (i, led) in self.leds.iter().enumerate() {
            if led.identified() {
                self.usable_leds.push(i);
            }
        }
    }

    pub fn usable_led_count(&self) -> usize {
        self.usable_leds.len()
    }

    /// The beacon offset rotated into camera space by the body's current
    /// orientation.
    fn state_correction(&self, body_state: &BodyState) -> Vector3<f64> {
        body_state.quaternion() * self.beacon_offset
    }

    /// Updates the pose estimate from the LEDs processed this frame,
    /// driving the tracking-mode state machine. `starting_time` is the
    /// time `body_state` corresponds to; `valid_state_and_time` gates
    /// entry into Kalman mode (a bootstrap at an unchanged timestamp
    /// cannot seed velocities meaningfully).
    pub fn update_pose_estimate(
        &mut self,
        intrinsics: &CameraIntrinsics,
        tv: Timestamp,
        body_state: &mut BodyState,
        process: &DampedConstantVelocity,
        starting_time: Timestamp,
        valid_state_and_time: bool,
    ) -> bool {
        self.update_usable_leds();

        // The estimators work in the centroid-offset frame.
        let pre_correction = self.state_correction(body_state);
        body_state.set_position(&(body_state.position() + pre_correction));

        let permit_kalman = valid_state_and_time;

        if !self.has_pose_estimate && self.tracking_state != TargetTrackingState::Ransac {
            // Lost tracking entirely.
            self.enter_ransac_mode(body_state);
        }

        // Pre-estimation transitions based on overall health.
        match self
            .health
            .evaluate(body_state, self.usable_leds.len(), self.tracking_state)
        {
            TargetHealthState::StopTrackingErrorBoundsExceeded => {
                info!(
                    "Target {}: in-flight reset - error bounds exceeded",
                    self.id
                );
                self.enter_ransac_mode(body_state);
            }
            TargetHealthState::StopTrackingLostSight => {
                self.enter_ransac_mode(body_state);
            }
            TargetHealthState::Ok => {}
        }

        // Pre-estimation transitions per state.
        if self.tracking_state == TargetTrackingState::RansacWhenBlobDetected
            && !self.usable_leds.is_empty()
        {
            info!(
                "Target {}: in-flight reset - beacons detected, re-acquiring fix",
                self.id
            );
            self.enter_ransac_mode(body_state);
        }

        // Main estimation dispatch.
        let mut ctx = EstimationContext {
            intrinsics,
            beacons: &mut self.beacons,
            base_measurement_variance: &self.base_measurement_variance,
            beacon_fixed: &self.beacon_fixed,
            emission_directions: &self.emission_directions,
            starting_time,
            state: &mut *body_state,
            process,
            beacon_debug: &mut self.beacon_debug,
        };
        match self.tracking_state {
            TargetTrackingState::Ransac => {
                self.has_pose_estimate =
                    self.ransac
                        .estimate_into_state(&mut ctx, &mut self.leds, &self.usable_leds);
            }
            TargetTrackingState::RansacWhenBlobDetected
            | TargetTrackingState::EnteringKalman
            | TargetTrackingState::Kalman => {
                let video_dt = tv.seconds_since(self.last_estimate);
                self.has_pose_estimate =
                    self.scaat
                        .estimate(&mut ctx, &mut self.leds, &self.usable_leds, video_dt);
            }
        }

        // Post-estimation transitions.
        match self.tracking_state {
            TargetTrackingState::Ransac => {
                if self.has_pose_estimate && permit_kalman {
                    self.enter_kalman_mode();
                }
            }
            TargetTrackingState::EnteringKalman => {
                // One frame of grace before the health check applies.
                self.tracking_state = TargetTrackingState::Kalman;
            }
            TargetTrackingState::Kalman => match self.scaat.tracking_health() {
                TrackingHealth::NeedsResetNow => {
                    info!("Target {}: in-flight reset - lost fix", self.id);
                    self.enter_ransac_mode(body_state);
                }
                TrackingHealth::ResetWhenBeaconsSeen => {
                    self.tracking_state = TargetTrackingState::RansacWhenBlobDetected;
                }
                TrackingHealth::Functioning => {}
            },
            TargetTrackingState::RansacWhenBlobDetected => {}
        }

        self.last_estimate = tv;

        // Corresponding post-correction, with the possibly-updated
        // orientation.
        let post_correction = self.state_correction(body_state);
        body_state.set_position(&(body_state.position() - post_correction));

        self.has_pose_estimate
    }

    /// RANSAC pose estimate without touching body state or applying the
    /// centroid-offset calibration. Intended for room calibration during
    /// startup.
    pub fn uncalibrated_ransac_pose_estimate(
        &mut self,
        intrinsics: &CameraIntrinsics,
    ) -> Option<(Vector3<f64>, UnitQuaternion<f64>)> {
        self.update_usable_leds();
        let beacon_positions: Vec<Vector3<f64>> =
            self.beacons.iter().map(|b| b.position()).collect();
        let pose = self.ransac.estimate_pose(
            intrinsics,
            &mut self.leds,
            &self.usable_leds,
            &beacon_positions,
        )?;
        // Undo the centroid offset so the pose refers to the original
        // target origin.
        let xlate = pose.translation - pose.rotation * self.beacon_offset;
        Some((xlate, pose.rotation))
    }

    fn enter_kalman_mode(&mut self) {
        info!("Target {}: entering SCAAT Kalman mode", self.id);
        self.tracking_state = TargetTrackingState::EnteringKalman;
        self.scaat.reset_counters();
    }

    fn enter_ransac_mode(&mut self, body_state: &mut BodyState) {
        // Zero velocities when falling out of a Kalman-family state; a
        // single EnteringKalman frame cannot have corrupted them.
        match self.tracking_state {
            TargetTrackingState::Kalman | TargetTrackingState::RansacWhenBlobDetected => {
                body_state.set_velocity(&Vector3::zeros());
                body_state.set_angular_velocity(&Vector3::zeros());
            }
            TargetTrackingState::EnteringKalman | TargetTrackingState::Ransac => {}
        }
        self.tracking_state = TargetTrackingState::Ransac;
    }
}
