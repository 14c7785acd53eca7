// system/thread.rs

// The tracker orchestrator: a dedicated worker thread that owns the camera
// and the tracking system. Each frame it triggers a grab, hands the
// retrieve-and-extract work to a transient helper thread, and services the
// IMU message queue while waiting; when the image work completes it runs
// the LED/pose phases and publishes reports. IMU reports are submitted
// from arbitrary threads through a mutex-protected FIFO; the condition
// variable is the single rendezvous for both message arrival and helper
// completion.

// Dependencies
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nalgebra::UnitQuaternion;

use super::reporting::{camera_pose_slot, imu_in_camera_slot, imu_slot, BodyReportingVector};
use super::{ImageProcessingOutput, ImuReportKind, TrackingSystem};
use crate::body::BodyId;
use crate::vision::blob::BlobExtractor;
use crate::vision::camera::CameraIntrinsics;
use crate::vision::GrayImage;
use crate::Timestamp;

/// Contract with the camera driver: trigger a grab, then retrieve the
/// grayscale frame with its timestamp.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSource: Send {
    /// Whether the camera is currently usable.
    fn ok(&self) -> bool;
    /// Triggers acquisition of one frame; false on failure.
    fn grab(&mut self) -> bool;
    /// Retrieves the frame triggered by the last grab. May block on
    /// driver I/O; this runs on the image helper thread.
    fn retrieve(&mut self) -> Option<(GrayImage, Timestamp)>;
}

/// One queued IMU message.
#[derive(Debug, Clone)]
pub struct ImuMessage {
    pub body: BodyId,
    pub timestamp: Timestamp,
    pub report: ImuReportKind,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<ImuMessage>,
    image_step_complete: bool,
    image_output: Option<ImageProcessingOutput>,
}

struct Shared {
    queue: Mutex<QueueState>,
    condvar: Condvar,
    run: AtomicBool,
    start_latch: Mutex<bool>,
    start_condvar: Condvar,
}

/// Handle to the tracker thread. Dropping it without `join` detaches the
/// thread; call `trigger_stop` then `join` for an orderly shutdown.
pub struct TrackerThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl TrackerThread {
    /// Spawns the tracker thread. It blocks on the startup latch until
    /// `permit_start` is called.
    pub fn spawn(
        system: TrackingSystem,
        source: Box<dyn FrameSource>,
        intrinsics: CameraIntrinsics,
        reporting: BodyReportingVector,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            condvar: Condvar::new(),
            run: AtomicBool::new(true),
            start_latch: Mutex::new(false),
            start_condvar: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("tracker".to_string())
            .spawn(move || {
                let mut worker = TrackerWorker {
                    system,
                    source,
                    intrinsics,
                    reporting,
                    shared: thread_shared,
                    extractor: None,
                    room_transform_installed: false,
                    next_camera_pose_report: None,
                };
                worker.thread_action();
            })
            .expect("failed to spawn tracker thread");
        TrackerThread {
            shared,
            handle: Some(handle),
        }
    }

    /// Releases the startup latch; the thread begins grabbing frames.
    pub fn permit_start(&self) {
        let mut started = self.shared.start_latch.lock().unwrap();
        *started = true;
        self.shared.start_condvar.notify_all();
    }

    /// Asks the thread to exit after the current frame.
    pub fn trigger_stop(&self) {
        info!("Tracker thread: stop requested");
        self.shared.run.store(false, Ordering::SeqCst);
        // wake it if it is waiting on either latch or queue
        self.shared.start_condvar.notify_all();
        self.shared.condvar.notify_all();
    }

    /// Submits an IMU orientation report from any thread.
    pub fn submit_imu_orientation(
        &self,
        body: BodyId,
        timestamp: Timestamp,
        quat: UnitQuaternion<f64>,
    ) {
        self.submit(ImuMessage {
            body,
            timestamp,
            report: ImuReportKind::Orientation(quat),
        });
    }

    /// Submits an IMU angular-velocity report (incremental rotation over
    /// `dt` seconds) from any thread.
    pub fn submit_imu_angular_velocity(
        &self,
        body: BodyId,
        timestamp: Timestamp,
        delta: UnitQuaternion<f64>,
        dt: f64,
    ) {
        self.submit(ImuMessage {
            body,
            timestamp,
            report: ImuReportKind::AngularVelocity { delta, dt },
        });
    }

    fn submit(&self, message: ImuMessage) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.messages.push_back(message);
        }
        self.shared.condvar.notify_one();
    }

    /// Waits for the thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TrackerThread {
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        self.shared.start_condvar.notify_all();
        self.shared.condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The state owned by the thread itself.
struct TrackerWorker {
    system: TrackingSystem,
    source: Box<dyn FrameSource>,
    intrinsics: CameraIntrinsics,
    reporting: BodyReportingVector,
    shared: Arc<Shared>,
    /// Lazily cloned from the system's parameters for use off-thread.
    extractor: Option<BlobExtractor>,
    room_transform_installed: bool,
    next_camera_pose_report: Option<Instant>,
}

impl TrackerWorker {
    fn thread_action(&mut self) {
        info!("Tracker thread started, waiting for permit_start()");
        {
            let mut started = self.shared.start_latch.lock().unwrap();
            while !*started && self.shared.run.load(Ordering::SeqCst) {
                started = self.shared.start_condvar.wait(started).unwrap();
            }
        }
        info!("Tracker thread entering its main loop");

        // A panic escaping do_frame is the only thing that halts the loop
        // from inside; it clears the run flag on the way out.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            while self.shared.run.load(Ordering::SeqCst) {
                self.do_frame();
            }
        }));
        if result.is_err() {
            error!("Tracker thread exiting because of a caught panic");
            self.shared.run.store(false, Ordering::SeqCst);
        }
        info!("Tracker thread exiting");
    }

    fn do_frame(&mut self) {
        if !self.source.ok() {
            warn!("Camera is reporting it is not OK");
            std::thread::sleep(Duration::from_millis(10));
            return;
        }
        if !self.source.grab() {
            warn!("Camera grab failed; will retry");
            return;
        }

        let extractor = self
            .extractor
            .get_or_insert_with(|| BlobExtractor::new(&self.system.params().blob_params))
            .clone();
        let intrinsics = self.intrinsics.clone();
        let shared = self.shared.clone();
        let source = &mut self.source;
        let system = &mut self.system;

        let mut image_output: Option<ImageProcessingOutput> = None;
        std::thread::scope(|scope| {
            // The only work permitted in parallel with IMU processing:
            // frame retrieval and initial image processing.
            scope.spawn(move || {
                let output = source.retrieve().map(|(frame, tv)| {
                    let raw = extractor.extract_blobs(&frame);
                    ImageProcessingOutput {
                        timestamp: tv,
                        camera: intrinsics.undistorted_variant(),
                        led_measurements: crate::vision::camera::undistort_measurements(
                            &raw,
                            &intrinsics,
                        ),
                    }
                });
                let mut queue = shared.queue.lock().unwrap();
                queue.image_output = output;
                queue.image_step_complete = true;
                shared.condvar.notify_all();
            });

            // Service the message queue until the helper finishes.
            loop {
                let message = {
                    let mut queue = self.shared.queue.lock().unwrap();
                    queue = self
                        .shared
                        .condvar
                        .wait_while(queue, |q| {
                            !q.image_step_complete && q.messages.is_empty()
                        })
                        .unwrap();
                    if let Some(message) = queue.messages.pop_front() {
                        Some(message)
                    } else {
                        // image step complete
                        queue.image_step_complete = false;
                        image_output = queue.image_output.take();
                        None
                    }
                };
                match message {
                    Some(message) => {
                        Self::process_imu_message(system, &message);
                    }
                    None => break,
                }
            }
        });

        let image_output = match image_output {
            Some(output) => output,
            None => {
                warn!("Camera retrieve failed; skipping frame");
                return;
            }
        };

        // Phases two and three.
        let updated: Vec<BodyId> = self
            .system
            .update_bodies_from_video_data(image_output)
            .to_vec();

        // Drain anything that accumulated during the video phases.
        let pending: Vec<ImuMessage> = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.messages.drain(..).collect()
        };
        for message in &pending {
            Self::process_imu_message(&mut self.system, message);
        }

        self.update_reporting_vector(&updated);
    }

    fn process_imu_message(system: &mut TrackingSystem, message: &ImuMessage) {
        if let Err(e) = system.handle_imu_report(message.body, message.timestamp, &message.report)
        {
            warn!("Dropped IMU report: {}", e);
        }
    }

    /// Copies updated body state into the reporting surface, plus the
    /// synthetic camera-pose and IMU reports once calibration is done.
    fn update_reporting_vector(&mut self, updated: &[BodyId]) {
        let additional_prediction = self.system.params().additional_prediction;
        for &body_id in updated {
            if let (Some(body), Some(slot)) = (
                self.system.body(body_id),
                self.reporting.get(body_id.0 as usize),
            ) {
                slot.update_from_state(body.state_time(), body.state(), additional_prediction);
            }
        }

        // Nothing below applies before calibration: no camera pose means
        // no room frame to report in.
        let camera_pose = match self.system.camera_pose() {
            Some(pose) => *pose,
            None => return,
        };
        let num_bodies = self.system.num_bodies();

        if !self.room_transform_installed {
            self.room_transform_installed = true;
            for (index, slot) in self.reporting.iter().enumerate() {
                if index >= num_bodies {
                    // synthetic slots keep the identity transform
                    continue;
                }
                slot.set_tracker_to_room(camera_pose);
            }
        }

        // Camera pose report, rate-limited to once per second.
        let due = self
            .next_camera_pose_report
            .map(|t| Instant::now() > t)
            .unwrap_or(true);
        if due {
            self.next_camera_pose_report = Some(Instant::now() + Duration::from_secs(1));
            if let Some(slot) = self.reporting.get(camera_pose_slot(num_bodies)) {
                slot.update_pose(
                    self.system
                        .body(BodyId(0))
                        .map(|b| b.state_time())
                        .unwrap_or_default(),
                    camera_pose.translation.vector,
                    camera_pose.rotation,
                );
            }
        }

        // IMU orientation views for debugging: raw (room-aligned) and
        // rotated into camera space (hoisted a little so the two are
        // distinguishable).
        if let Some(body) = self.system.body(BodyId(0)) {
            if let Some(imu) = body.imu() {
                if let Some(orientation) = imu.pose_estimate() {
                    if let Some(slot) = self.reporting.get(imu_slot(num_bodies)) {
                        slot.update_pose(
                            imu.last_update(),
                            nalgebra::Vector3::zeros(),
                            orientation,
                        );
                    }
                    if let Some(slot) = self.reporting.get(imu_in_camera_slot(num_bodies)) {
                        slot.update_pose(
                            imu.last_update(),
                            nalgebra::Vector3::new(0.0, 0.5, 0.0),
                            self.system.camera_from_room() * orientation,
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParams;
    use crate::system::reporting::make_reporting_vector;

    fn idle_system() -> TrackingSystem {
        TrackingSystem::new(ConfigParams::default())
    }

    #[test]
    fn startup_latch_blocks_until_permitted() {
        let mut source = MockFrameSource::new();
        // ok() must never be called before permit_start in this test run;
        // we stop before permitting, so no frame work happens at all.
        source.expect_ok().times(0);
        let thread = TrackerThread::spawn(
            idle_system(),
            Box::new(source),
            CameraIntrinsics::simulated(),
            make_reporting_vector(0),
        );
        std::thread::sleep(Duration::from_millis(50));
        thread.trigger_stop();
        thread.join();
    }

    #[test]
    fn frames_flow_after_permit_and_stop_is_honored() {
        let mut source = MockFrameSource::new();
        source.expect_ok().returning(|| true);
        source.expect_grab().returning(|| true);
        let frame_counter = std::sync::Arc::new(AtomicBool::new(false));
        let seen = frame_counter.clone();
        source.expect_retrieve().returning(move || {
            seen.store(true, Ordering::SeqCst);
            let mut frame = GrayImage::new(64, 48);
            frame.fill_disk(32.0, 24.0, 3.0, 200);
            Some((frame, Timestamp::from_secs(0.0)))
        });

        let thread = TrackerThread::spawn(
            idle_system(),
            Box::new(source),
            CameraIntrinsics::simulated(),
            make_reporting_vector(0),
        );
        thread.permit_start();
        std::thread::sleep(Duration::from_millis(100));
        thread.trigger_stop();
        thread.join();
        assert!(frame_counter.load(Ordering::SeqCst), "no frame was retrieved");
    }

    #[test]
    fn imu_messages_are_consumed_between_frames() {
        let mut system = idle_system();
        let body = system.create_tracked_body();
        system
            .body_mut(body)
            .unwrap()
            .create_integrated_imu(1e-4, 1e-3)
            .unwrap();

        let mut source = MockFrameSource::new();
        source.expect_ok().returning(|| true);
        source.expect_grab().returning(|| true);
        source.expect_retrieve().returning(|| {
            std::thread::sleep(Duration::from_millis(5));
            Some((GrayImage::new(64, 48), Timestamp::from_secs(0.0)))
        });

        let thread = TrackerThread::spawn(
            system,
            Box::new(source),
            CameraIntrinsics::simulated(),
            make_reporting_vector(1),
        );
        thread.permit_start();
        for i in 0..20 {
            thread.submit_imu_orientation(
                body,
                Timestamp::from_secs(i as f64 * 0.005),
                UnitQuaternion::identity(),
            );
            std::thread::sleep(Duration::from_millis(2));
        }
        // queue must not grow without bound: give it a moment to drain
        std::thread::sleep(Duration::from_millis(50));
        let remaining = {
            let queue = thread.shared.queue.lock().unwrap();
            queue.messages.len()
        };
        thread.trigger_stop();
        thread.join();
        assert!(remaining < 20, "queue never drained: {} left", remaining);
    }
}
