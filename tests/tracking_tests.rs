// tests/tracking_tests.rs
// End-to-end pipeline tests: a synthetic camera renders a blinking
// four-beacon target, frames flow through blob extraction, undistortion,
// LED identification, room calibration, and the RANSAC/SCAAT estimators,
// with IMU reports interleaved the way the orchestrator would deliver
// them.

use nalgebra::{UnitQuaternion, Vector3};

use argus::body::BodyId;
use argus::system::{make_tracking_system, ImuReportKind, TrackingSystem};
use argus::target::setup::TargetSetupData;
use argus::vision::camera::CameraIntrinsics;
use argus::{ConfigParams, GrayImage, Timestamp};

const FRAME_RATE: f64 = 30.0;
const PATTERNS: [&str; 4] = ["*.........", "**........", "*.*.......", "***......."];

/// Beacon locations in millimeters, as a descriptor would supply them.
fn beacon_locations_mm() -> [Vector3<f64>; 4] {
    [
        Vector3::new(-40.0, -30.0, 0.0),
        Vector3::new(40.0, -30.0, 0.0),
        Vector3::new(40.0, 30.0, 0.0),
        Vector3::new(-40.0, 30.0, 0.0),
    ]
}

fn setup_data(params: &ConfigParams) -> TargetSetupData {
    let mut data = TargetSetupData::default();
    data.set_beacon_count(4, 3.0, params.initial_beacon_error.max(1e-9));
    for (i, location) in beacon_locations_mm().iter().enumerate() {
        data.patterns[i] = PATTERNS[i].to_string();
        data.locations[i] = *location;
        data.emission_directions[i] = Vector3::new(0.0, 0.0, -1.0);
    }
    data
}

fn test_params() -> ConfigParams {
    let mut params = ConfigParams::default();
    // synthetic disks are slightly blocky; don't let the convexity filter
    // nibble at the small ones
    params.blob_params.filter_by_convexity = false;
    params
}

/// Renders the target's beacons for one frame, blinking per pattern.
fn render_frame(
    intrinsics: &CameraIntrinsics,
    translation: &Vector3<f64>,
    frame_number: usize,
) -> GrayImage {
    let mut image = GrayImage::new(intrinsics.width, intrinsics.height);
    for (i, location) in beacon_locations_mm().iter().enumerate() {
        let pattern = PATTERNS[i].as_bytes();
        let bright = pattern[frame_number % pattern.len()] == b'*';
        let camera_space = location * 0.001 + translation;
        if let Some(pixel) = intrinsics.project(&camera_space) {
            let radius = if bright { 4.0 } else { 2.5 };
            image.fill_disk(pixel.x, pixel.y, radius, 220);
        }
    }
    image
}

struct Pipeline {
    system: TrackingSystem,
    intrinsics: CameraIntrinsics,
    translation: Vector3<f64>,
    body: BodyId,
}

impl Pipeline {
    fn new() -> Self {
        let params = test_params();
        let system = make_tracking_system(&params, setup_data(&params), None, 1e-4, 1e-3)
            .expect("system builds");
        Pipeline {
            system,
            intrinsics: CameraIntrinsics::simulated(),
            translation: Vector3::new(0.0, 0.0, 0.35),
            body: BodyId(0),
        }
    }

    /// One video frame followed by one IMU orientation report, the
    /// ordering the orchestrator produces for a camera slower than the
    /// IMU.
    fn step(&mut self, frame_number: usize) {
        let tv = Timestamp::from_secs(frame_number as f64 / FRAME_RATE);
        let image = render_frame(&self.intrinsics, &self.translation, frame_number);
        let output =
            self.system
                .perform_initial_image_processing(tv, &image, &self.intrinsics);
        self.system.update_bodies_from_video_data(output);

        let imu_tv = Timestamp::from_secs(frame_number as f64 / FRAME_RATE + 0.005);
        self.system
            .handle_imu_report(
                self.body,
                imu_tv,
                &ImuReportKind::Orientation(UnitQuaternion::identity()),
            )
            .expect("known body");
    }
}

#[test]
fn cold_start_calibrates_and_tracks_steady_target() {
    let mut pipeline = Pipeline::new();
    for frame in 0..60 {
        pipeline.step(frame);
    }

    // Room calibration: held steady with identity IMU and identity-rotation
    // video pose, the camera pose must come out at the configured position
    // with identity rotation.
    assert!(pipeline.system.is_room_calibration_complete());
    let camera_pose = pipeline.system.camera_pose().expect("camera pose");
    let expected_position = Vector3::new(0.0, 1.2, -0.5);
    assert!(
        (camera_pose.translation.vector - expected_position).norm() < 1e-9,
        "camera translation {:?}",
        camera_pose.translation.vector
    );
    assert!(camera_pose.rotation.angle() < 1e-3);

    // Steady tracking: the body pose in camera space converges on the
    // rendered pose.
    let body = pipeline.system.body(pipeline.body).expect("body");
    assert!(body.has_pose_estimate());
    let position = body.state().position();
    assert!(
        (position - pipeline.translation).norm() < 0.005,
        "tracked position {:?}",
        position
    );
    assert!(body.state().quaternion().angle() < 0.05);
}

#[test]
fn identified_leds_carry_their_beacon_ids() {
    let mut pipeline = Pipeline::new();
    // one full pattern period plus slack
    for frame in 0..14 {
        pipeline.step(frame);
    }
    let target = pipeline
        .system
        .body(pipeline.body)
        .and_then(|b| b.target())
        .expect("target");
    let mut seen: Vec<i32> = target
        .leds()
        .iter()
        .filter(|led| led.identified())
        .map(|led| led.id().0)
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3], "all four beacons identified");
}

#[test]
fn dropout_and_reacquisition_recovers_tracking() {
    let mut pipeline = Pipeline::new();
    for frame in 0..60 {
        pipeline.step(frame);
    }
    assert!(pipeline
        .system
        .body(pipeline.body)
        .expect("body")
        .has_pose_estimate());

    // Cover the camera: frames with no blobs at all.
    for frame in 60..80 {
        let tv = Timestamp::from_secs(frame as f64 / FRAME_RATE);
        let dark = GrayImage::new(640, 480);
        let output = pipeline
            .system
            .perform_initial_image_processing(tv, &dark, &pipeline.intrinsics);
        pipeline.system.update_bodies_from_video_data(output);
    }

    // Uncover: tracking comes back within a pattern period or two.
    for frame in 80..110 {
        pipeline.step(frame);
    }
    let body = pipeline.system.body(pipeline.body).expect("body");
    assert!(body.has_pose_estimate(), "tracking did not reacquire");
    assert!((body.state().position() - pipeline.translation).norm() < 0.01);
}

#[test]
fn out_of_order_imu_reports_reconcile_at_the_system_level() {
    let mut pipeline = Pipeline::new();
    // run to full calibration first
    for frame in 0..40 {
        pipeline.step(frame);
    }
    let t_base = 40.0 / FRAME_RATE;
    let report = |angle: f64| {
        ImuReportKind::Orientation(UnitQuaternion::from_axis_angle(
            &Vector3::y_axis(),
            angle,
        ))
    };

    // Submit t1, t3, then t2: the body must end up as if they had arrived
    // in order.
    let mut shuffled = pipeline;
    shuffled
        .system
        .handle_imu_report(BodyId(0), Timestamp::from_secs(t_base + 0.01), &report(0.01))
        .unwrap();
    shuffled
        .system
        .handle_imu_report(BodyId(0), Timestamp::from_secs(t_base + 0.03), &report(0.03))
        .unwrap();
    shuffled
        .system
        .handle_imu_report(BodyId(0), Timestamp::from_secs(t_base + 0.02), &report(0.02))
        .unwrap();

    let mut ordered = Pipeline::new();
    for frame in 0..40 {
        ordered.step(frame);
    }
    ordered
        .system
        .handle_imu_report(BodyId(0), Timestamp::from_secs(t_base + 0.01), &report(0.01))
        .unwrap();
    ordered
        .system
        .handle_imu_report(BodyId(0), Timestamp::from_secs(t_base + 0.02), &report(0.02))
        .unwrap();
    ordered
        .system
        .handle_imu_report(BodyId(0), Timestamp::from_secs(t_base + 0.03), &report(0.03))
        .unwrap();

    let a = shuffled.system.body(BodyId(0)).unwrap();
    let b = ordered.system.body(BodyId(0)).unwrap();
    assert_eq!(a.state_time(), b.state_time());
    assert!(
        (a.state().position() - b.state().position()).norm() < 1e-6,
        "positions diverged"
    );
    assert!(a.state().quaternion().angle_to(&b.state().quaternion()) < 1e-6);
}
