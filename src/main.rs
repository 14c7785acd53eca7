// src/main.rs
// Demo entry point for Argus: runs the full video-inertial pipeline against
// a synthetic camera rendering a blinking four-beacon target, with IMU
// reports interleaved, and prints the tracked pose as it converges.

// Dependencies
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;
use nalgebra::{UnitQuaternion, Vector3};

use argus::system::reporting::make_reporting_vector;
use argus::system::{make_tracking_system, thread::FrameSource};
use argus::target::setup::TargetSetupData;
use argus::{BodyId, CameraIntrinsics, ConfigParams, GrayImage, Timestamp, TrackerThread};

const FRAME_RATE: f64 = 30.0;
const PATTERNS: [&str; 4] = ["*.........", "**........", "*.*.......", "***......."];

/// A synthetic camera: renders the four beacons of a fixed-pose target,
/// blinking per their patterns, into a grayscale frame.
struct SyntheticCamera {
    intrinsics: CameraIntrinsics,
    beacon_locations: Vec<Vector3<f64>>,
    pose_translation: Vector3<f64>,
    frame: Arc<AtomicUsize>,
}

impl FrameSource for SyntheticCamera {
    fn ok(&self) -> bool {
        true
    }

    fn grab(&mut self) -> bool {
        true
    }

    fn retrieve(&mut self) -> Option<(GrayImage, Timestamp)> {
        let frame_number = self.frame.fetch_add(1, Ordering::SeqCst);
        let tv = Timestamp::from_secs(frame_number as f64 / FRAME_RATE);

        let mut image = GrayImage::new(
            self.intrinsics.width,
            self.intrinsics.height,
        );
        for (i, location) in self.beacon_locations.iter().enumerate() {
            let pattern = PATTERNS[i].as_bytes();
            let bright = pattern[frame_number % pattern.len()] == b'*';
            let camera_space = location + self.pose_translation;
            if let Some(pixel) = self.intrinsics.project(&camera_space) {
                // bright frames render bigger blobs, like a defocused LED
                let radius = if bright { 4.0 } else { 2.5 };
                image.fill_disk(pixel.x, pixel.y, radius, 220);
            }
        }
        // pace the synthetic source roughly like a real camera
        std::thread::sleep(std::time::Duration::from_millis(5));
        Some((image, tv))
    }
}

/// Main function: builds the tracking system, spawns the tracker thread,
/// and feeds it synthetic IMU reports while frames flow.
fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging for debugging
    env_logger::init();
    info!("Starting Argus tracking demo...");

    let params = ConfigParams::default();

    // A small square target; locations in millimeters as a descriptor
    // would provide them.
    let mut data = TargetSetupData::default();
    data.set_beacon_count(4, 3.0, params.initial_beacon_error.max(1e-9));
    let locations = [
        Vector3::new(-40.0, -30.0, 0.0),
        Vector3::new(40.0, -30.0, 0.0),
        Vector3::new(40.0, 30.0, 0.0),
        Vector3::new(-40.0, 30.0, 0.0),
    ];
    for i in 0..4 {
        data.patterns[i] = PATTERNS[i].to_string();
        data.locations[i] = locations[i];
        data.emission_directions[i] = Vector3::new(0.0, 0.0, -1.0);
    }

    let system = make_tracking_system(&params, data.clone(), None, 1e-4, 1e-3)?;
    info!("Tracking system created with one body and four beacons");

    let intrinsics = CameraIntrinsics::simulated();
    let camera = SyntheticCamera {
        intrinsics: intrinsics.clone(),
        beacon_locations: data.locations.iter().map(|p| p * 0.001).collect(),
        pose_translation: Vector3::new(0.0, 0.0, 0.35),
        frame: Arc::new(AtomicUsize::new(0)),
    };

    let reporting = make_reporting_vector(1);
    let tracker = TrackerThread::spawn(system, Box::new(camera), intrinsics, reporting.clone());
    tracker.permit_start();
    info!("Tracker thread running");

    // Feed identity IMU orientation reports at twice the frame rate while
    // the demo runs; the device is "held still" so room calibration can
    // converge.
    let body = BodyId(0);
    let demo_frames = 120;
    for i in 0..demo_frames * 2 {
        tracker.submit_imu_orientation(
            body,
            Timestamp::from_secs(i as f64 / (2.0 * FRAME_RATE)),
            UnitQuaternion::identity(),
        );
        std::thread::sleep(std::time::Duration::from_millis(8));

        if i % 30 == 0 {
            let report = reporting[0].get();
            info!(
                "pose valid={} position=({:.3}, {:.3}, {:.3})",
                report.pose_valid, report.position.x, report.position.y, report.position.z
            );
        }
    }

    tracker.trigger_stop();
    tracker.join();

    let report = reporting[0].get();
    info!(
        "Final report: valid={} position=({:.3}, {:.3}, {:.3})",
        report.pose_valid, report.position.x, report.position.y, report.position.z
    );
    info!("Argus demo completed");
    Ok(())
}

// SWOT Analysis
// Strengths:
// - Full pipeline demo: blob extraction, identification, calibration, and
//   both estimator families run against a live synthetic camera.
// - Deterministic target geometry makes convergence easy to eyeball from
//   the logged positions.
//
// Weaknesses:
// - The synthetic camera never moves, so the damped-velocity model is not
//   really exercised here; see the integration tests for dropout cases.
// - IMU reports are generated on the main thread at a fixed sleep cadence
//   rather than from a real sensor clock.
//
// Opportunities:
// - Swap SyntheticCamera for a capture backend implementing FrameSource to
//   run against real hardware without touching the core.
// - Feed recorded sensor logs through the same loop for regression runs.
//
// Threats:
// - Demo timing is wall-clock based; a heavily loaded machine can starve
//   the tracker thread and make the printed poses look worse than they are.
