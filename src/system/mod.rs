// system/mod.rs

// The tracking system: owns the bodies, the blob extractor, the camera
// pose, and the room-calibration state machine, and drives the three-phase
// video flow (image processing, LED update, pose estimation) plus the
// routing of IMU reports into either calibration or the filter.

pub mod calibration;
pub mod reporting;
pub mod thread;

// Dependencies
use log::{info, warn};
use nalgebra::{Isometry3, UnitQuaternion, Vector3};

use crate::body::imu::CannedImuMeasurement;
use crate::body::{BodyId, TrackedBody};
use crate::config::ConfigParams;
use crate::target::setup::TargetSetupData;
use crate::vision::blob::BlobExtractor;
use crate::vision::camera::{undistort_measurements, CameraIntrinsics};
use crate::vision::{BlobMeasurement, GrayImage};
use crate::{Timestamp, TrackerError};
use self::calibration::RoomCalibration;

/// Output of the first (async-able) phase of video processing: blob
/// extraction and undistortion.
#[derive(Debug, Clone)]
pub struct ImageProcessingOutput {
    pub timestamp: Timestamp,
    /// Zero-distortion intrinsics, valid for the undistorted points.
    pub camera: CameraIntrinsics,
    pub led_measurements: Vec<BlobMeasurement>,
}

pub struct TrackingSystem {
    params: ConfigParams,
    bodies: Vec<TrackedBody>,
    blob_extractor: BlobExtractor,
    camera_pose: Option<Isometry3<f64>>,
    camera_pose_inverse: Option<Isometry3<f64>>,
    calibration: RoomCalibration,
    calibration_complete_cached: bool,
    last_frame: Timestamp,
    updated_bodies: Vec<BodyId>,
    /// Per-target used-measurement counts from phase two.
    update_counts: Vec<(BodyId, usize)>,
}

impl TrackingSystem {
    pub fn new(params: ConfigParams) -> Self {
        let calibration = RoomCalibration::new(
            Vector3::from_column_slice(&params.camera_position),
            params.camera_is_forward,
        );
        TrackingSystem {
            blob_extractor: BlobExtractor::new(&params.blob_params),
            calibration,
            params,
            bodies: Vec::new(),
            camera_pose: None,
            camera_pose_inverse: None,
            calibration_complete_cached: false,
            last_frame: Timestamp::default(),
            updated_bodies: Vec::new(),
            update_counts: Vec::new(),
        }
    }

    pub fn params(&self) -> &ConfigParams {
        &self.params
    }

    pub fn create_tracked_body(&mut self) -> BodyId {
        let id = BodyId(self.bodies.len() as u16);
        self.bodies.push(TrackedBody::new(id, &self.params));
        id
    }

    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    pub fn body(&self, id: BodyId) -> Option<&TrackedBody> {
        self.bodies.get(id.0 as usize)
    }

    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut TrackedBody> {
        self.bodies.get_mut(id.0 as usize)
    }

    /// Transform from camera space to room space, once calibrated.
    pub fn camera_pose(&self) -> Option<&Isometry3<f64>> {
        self.camera_pose.as_ref()
    }

    pub fn have_camera_pose(&self) -> bool {
        self.camera_pose.is_some()
    }

    /// Rotation taking room-frame quantities into camera space; identity
    /// until calibration has produced a camera pose.
    pub fn camera_from_room(&self) -> UnitQuaternion<f64> {
        self.camera_pose_inverse
            .map(|pose| pose.rotation)
            .unwrap_or_else(UnitQuaternion::identity)
    }

    /// Transform from room space to camera space.
    pub fn room_from_camera(&self) -> Option<&Isometry3<f64>> {
        self.camera_pose_inverse.as_ref()
    }

    pub fn set_camera_pose(&mut self, pose: Isometry3<f64>) {
        self.camera_pose_inverse = Some(pose.inverse());
        self.camera_pose = Some(pose);
    }

    /// Whether the camera pose and every IMU yaw are known.
    pub fn is_room_calibration_complete(&mut self) -> bool {
        if self.calibration_complete_cached {
            return true;
        }
        let complete = self.camera_pose.is_some()
            && self
                .bodies
                .iter()
                .flat_map(|b| b.imu())
                .all(|imu| imu.calibration_yaw_known());
        self.calibration_complete_cached = complete;
        complete
    }

    /// Phase one: blob extraction and undistortion. Safe to run off the
    /// tracker thread; touches no body state.
    pub fn perform_initial_image_processing(
        &self,
        tv: Timestamp,
        frame: &GrayImage,
        intrinsics: &CameraIntrinsics,
    ) -> ImageProcessingOutput {
        let raw = self.blob_extractor.extract_blobs(frame);
        ImageProcessingOutput {
            timestamp: tv,
            camera: intrinsics.undistorted_variant(),
            led_measurements: undistort_measurements(&raw, intrinsics),
        }
    }

    /// Phases two and three: feed the image output through LED update and
    /// pose estimation. Returns the bodies whose state changed.
    pub fn update_bodies_from_video_data(&mut self, data: ImageProcessingOutput) -> &[BodyId] {
        self.update_leds_from_video_data(&data);
        self.update_pose_estimates(&data.camera);
        &self.updated_bodies
    }

    /// Phase two: route the blob measurements to each target's LED
    /// bookkeeping.
    fn update_leds_from_video_data(&mut self, data: &ImageProcessingOutput) {
        self.updated_bodies.clear();
        self.update_counts.clear();
        self.last_frame = data.timestamp;

        for body in &mut self.bodies {
            let id = body.id();
            if let Some(target) = body.target_mut() {
                let used = target.process_led_measurements(&data.led_measurements);
                if used != 0 {
                    self.update_counts.push((id, used));
                }
            }
        }
    }

    /// Phase three: pose estimation (or calibration, before the room is
    /// known).
    fn update_pose_estimates(&mut self, camera: &CameraIntrinsics) {
        if !self.is_room_calibration_complete() {
            self.calibration_video_phase(camera);
            return;
        }

        let camera_from_room = self.camera_from_room();
        let last_frame = self.last_frame;
        for &(body_id, _used) in &self.update_counts {
            let body = match self.bodies.get_mut(body_id.0 as usize) {
                Some(body) => body,
                None => continue,
            };

            let new_time = last_frame;
            let found = body.state_at_or_before(new_time);
            let valid_state = found.is_some();
            let (state_time, mut working_state) = found.unwrap_or_else(|| {
                (body.state_time(), body.state().clone())
            });

            // Advance the snapshot to the frame time; the estimators
            // correct an already-predicted state.
            if valid_state && state_time != new_time {
                let dt = new_time.seconds_since(state_time);
                crate::filter::predict(&mut working_state, body.process_model(), dt);
            }

            let got_pose = match body.target_and_state() {
                Some((target, _live_state, process)) => target.update_pose_estimate(
                    camera,
                    new_time,
                    &mut working_state,
                    process,
                    state_time,
                    valid_state && state_time != new_time,
                ),
                None => false,
            };
            if got_pose {
                body.replace_state_snapshot(
                    &camera_from_room,
                    state_time,
                    new_time,
                    working_state,
                );
                self.updated_bodies.push(body_id);
            }
        }

        // Prune history after the video update.
        for body in &mut self.bodies {
            body.prune_history();
        }
    }

    /// Video side of room calibration: raw RANSAC poses of the chosen
    /// target feed the calibrator until it converges.
    fn calibration_video_phase(&mut self, camera: &CameraIntrinsics) {
        let last_frame = self.last_frame;
        for i in 0..self.update_counts.len() {
            let (body_id, _) = self.update_counts[i];
            let target_id = (body_id, 0u8);
            if !self.calibration.want_video_data(target_id) {
                continue;
            }
            let pose = self
                .bodies
                .get_mut(body_id.0 as usize)
                .and_then(|body| body.target_mut())
                .and_then(|target| target.uncalibrated_ransac_pose_estimate(camera));
            if let Some((xlate, quat)) = pose {
                self.calibration
                    .process_video_data(target_id, last_frame, &xlate, &quat);
            }
        }
        self.apply_calibration_if_complete();
    }

    /// IMU side of room calibration: orientation reports arriving before
    /// the IMU's yaw is known land here instead of in the filter.
    pub fn calibration_handle_imu_data(
        &mut self,
        body_id: BodyId,
        tv: Timestamp,
        quat: &UnitQuaternion<f64>,
    ) {
        let has_target = match self.body(body_id) {
            Some(body) => body.target().is_some(),
            None => {
                warn!("IMU data for unknown body {}", body_id.0);
                return;
            }
        };
        self.calibration
            .process_imu_data(body_id, has_target, tv, quat);
        self.apply_calibration_if_complete();
    }

    fn apply_calibration_if_complete(&mut self) {
        if let Some(output) = self.calibration.post_calibration_update() {
            self.set_camera_pose(output.camera_pose);
            if let Some(imu) = self
                .bodies
                .get_mut(output.imu_body.0 as usize)
                .and_then(|b| b.imu_mut())
            {
                imu.set_calibration_yaw(output.imu_yaw);
            }
            info!("Room calibration applied to the tracking system");
        }
    }

    /// Routes one IMU report: to calibration while the yaw is unknown,
    /// otherwise canned and incorporated into the body state (replaying
    /// history if the report arrived out of order).
    pub fn handle_imu_report(
        &mut self,
        body_id: BodyId,
        tv: Timestamp,
        report: &ImuReportKind,
    ) -> Result<(), TrackerError> {
        let camera_from_room = self.camera_from_room();
        {
            let body = self
                .bodies
                .get(body_id.0 as usize)
                .ok_or(TrackerError::UnknownBody(body_id.0))?;
            let imu = match body.imu() {
                Some(imu) => imu,
                None => return Ok(()), // body has no IMU; drop silently
            };
            if let ImuReportKind::Orientation(quat) = report {
                if !imu.calibration_yaw_known() {
                    // Not calibrated yet: this report belongs to room
                    // calibration, not the filter.
                    self.calibration_handle_imu_data(body_id, tv, quat);
                    return Ok(());
                }
            }
        }

        let body = match self.bodies.get_mut(body_id.0 as usize) {
            Some(body) => body,
            None => return Err(TrackerError::UnknownBody(body_id.0)),
        };
        let canned: Option<CannedImuMeasurement> = match body.imu_mut() {
            Some(imu) => match report {
                ImuReportKind::Orientation(quat) => imu.preprocess_orientation(tv, quat),
                ImuReportKind::AngularVelocity { delta, dt } => {
                    imu.preprocess_angular_velocity(tv, delta, *dt)
                }
            },
            None => None,
        };
        if let Some(canned) = canned {
            body.incorporate_new_measurement_from_imu(&camera_from_room, tv, canned);
        }
        Ok(())
    }
}

/// The two kinds of IMU report the system accepts.
#[derive(Debug, Clone)]
pub enum ImuReportKind {
    /// Absolute orientation in the IMU's (room-aligned, modulo yaw) frame.
    Orientation(UnitQuaternion<f64>),
    /// Incremental rotation over `dt` seconds.
    AngularVelocity {
        delta: UnitQuaternion<f64>,
        dt: f64,
    },
}

/// Builds a single-body tracking system from beacon setup data with
/// locations in millimeters: scales to meters, optionally appends the
/// rear panel behind the front one, validates the table, and attaches an
/// IMU.
pub fn make_tracking_system(
    params: &ConfigParams,
    mut front: TargetSetupData,
    rear: Option<TargetSetupData>,
    imu_orientation_variance: f64,
    imu_angular_velocity_variance: f64,
) -> Result<TrackingSystem, TrackerError> {
    const SCALE: f64 = 0.001; // mm to m

    if let Some(rear) = rear {
        if params.include_rear_panel {
            // Distance between the front and back panel target origins, in
            // millimeters (circumference in cm, distance already in mm).
            let panel_spacing = params.head_circumference / std::f64::consts::PI * 10.0
                + params.head_to_front_beacon_origin_distance;
            front.patterns.extend(rear.patterns);
            front.locations.extend(
                rear.locations
                    .iter()
                    .map(|p| Vector3::new(p.x, p.y, p.z + panel_spacing)),
            );
            front
                .emission_directions
                .extend(rear.emission_directions);
            front.base_measurement_variances.extend(
                rear.base_measurement_variances
                    .iter()
                    .map(|_| params.back_panel_measurement_error),
            );
            front
                .initial_autocalibration_errors
                .extend(rear.initial_autocalibration_errors);
            front.is_fixed.extend(rear.is_fixed);
        }
    }

    let summary = front.clean_and_validate();
    info!("{}", summary);
    if summary.valid_beacons.is_empty() {
        return Err(TrackerError::BeaconTable(
            "no valid beacons in setup data".to_string(),
        ));
    }

    // The core works in meters.
    for location in &mut front.locations {
        *location *= SCALE;
    }

    let mut system = TrackingSystem::new(params.clone());
    let body_id = system.create_tracked_body();
    if let Some(body) = system.body_mut(body_id) {
        body.create_target(&front)?;
        body.create_integrated_imu(imu_orientation_variance, imu_angular_velocity_variance)?;
    }
    Ok(system)
}


// Weaknesses:
// - One camera only; the frame timeline assumes monotonic video timestamps
//   that always trail the IMU stream.
// Future improvement: generalize the state history into an event-sourced
// timeline so any sensor may arrive late.
// - One target per body; several call sites would need revisiting to lift
//   that (velocity zeroing on target reset, the update-count bookkeeping).
// - Calibration picks the first IMU and first matching video target; no
//   way to prefer a better-placed sensor pair.

// Current Functionality:
// - Owns bodies, blob extraction, camera pose, and room calibration.
// - Drives the three video phases and routes IMU reports to calibration or
//   the filter, replaying history for late reports.
// - Factory assembles a single-body system from millimeter beacon tables,
//   with optional rear panel.
