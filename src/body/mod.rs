// body/mod.rs

// The tracked body: owner of the pose state, its process model, at most
// one IMU and at most one video target, and the replayable state history
// that reconciles the two sensor streams' different latencies. Video
// results computed against an older snapshot replace that part of the
// timeline, and IMU reports that landed in the replaced span are re-applied
// in chronological order.

pub mod imu;

// Dependencies
use log::debug;
use nalgebra::UnitQuaternion;

use crate::config::ConfigParams;
use crate::filter::history::{HistoryContainer, StateSnapshot};
use crate::filter::process::DampedConstantVelocity;
use crate::filter::state::{BodyState, BodyStateVector};
use crate::filter::FilterState;
use crate::target::setup::TargetSetupData;
use crate::target::TrackedTarget;
use crate::{Timestamp, TrackerError};
use self::imu::{apply_imu_to_state, CannedImuMeasurement, TrackedBodyImu};

/// Zero-based body identifier within a tracking system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyId(pub u16);

pub struct TrackedBody {
    id: BodyId,
    params: ConfigParams,
    state: BodyState,
    process: DampedConstantVelocity,
    state_time: Timestamp,
    imu: Option<TrackedBodyImu>,
    target: Option<TrackedTarget>,
    history: HistoryContainer<StateSnapshot>,
    imu_log: HistoryContainer<CannedImuMeasurement>,
}

impl TrackedBody {
    pub fn new(id: BodyId, params: &ConfigParams) -> Self {
        let mut state = BodyState::default();
        // Large starting covariance for safety: nothing is known yet.
        state.set_error_covariance(
            &crate::filter::state::BodyStateMatrix::from_diagonal(
                &BodyStateVector::from_element(10.0),
            ),
        );
        let process = DampedConstantVelocity::new(
            params.linear_velocity_decay_coefficient,
            params.angular_velocity_decay_coefficient,
            &params.process_noise_autocorrelation,
        );
        TrackedBody {
            id,
            params: params.clone(),
            state,
            process,
            state_time: Timestamp::default(),
            imu: None,
            target: None,
            history: HistoryContainer::default(),
            imu_log: HistoryContainer::default(),
        }
    }

    pub fn id(&self) -> BodyId {
        self.id
    }

    pub fn state(&self) -> &BodyState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BodyState {
        &mut self.state
    }

    pub fn state_time(&self) -> Timestamp {
        self.state_time
    }

    pub fn process_model(&self) -> &DampedConstantVelocity {
        &self.process
    }

    /// Attaches the body's IMU. Fails if one is already attached.
    pub fn create_integrated_imu(
        &mut self,
        orientation_variance: f64,
        angular_velocity_variance: f64,
    ) -> Result<&mut TrackedBodyImu, TrackerError> {
        if self.imu.is_some() {
            return Err(TrackerError::AlreadyAttached("IMU"));
        }
        Ok(self.imu.insert(TrackedBodyImu::new(
            orientation_variance,
            angular_velocity_variance,
        )))
    }

    /// Attaches the body's video target from validated, meter-scaled setup
    /// data. Fails if one is already attached.
    pub fn create_target(&mut self, data: &TargetSetupData) -> Result<(), TrackerError> {
        if self.target.is_some() {
            return Err(TrackerError::AlreadyAttached("target"));
        }
        self.target = Some(TrackedTarget::new(&self.params, data, 0)?);
        Ok(())
    }

    pub fn imu(&self) -> Option<&TrackedBodyImu> {
        self.imu.as_ref()
    }

    pub fn imu_mut(&mut self) -> Option<&mut TrackedBodyImu> {
        self.imu.as_mut()
    }

    pub fn target(&self) -> Option<&TrackedTarget> {
        self.target.as_ref()
    }

    pub fn target_mut(&mut self) -> Option<&mut TrackedTarget> {
        self.target.as_mut()
    }

    /// Split borrow for the video phase: the target needs the body state
    /// and process model alongside itself.
    pub fn target_and_state(
        &mut self,
    ) -> Option<(&mut TrackedTarget, &mut BodyState, &DampedConstantVelocity)> {
        let target = self.target.as_mut()?;
        Some((target, &mut self.state, &self.process))
    }

    /// True iff the video target currently holds a valid pose estimate.
    pub fn has_pose_estimate(&self) -> bool {
        self.target
            .as_ref()
            .map(|t| t.has_pose_estimate())
            .unwrap_or(false)
    }

    /// The newest stored state at or before `tv`.
    pub fn state_at_or_before(&self, tv: Timestamp) -> Option<(Timestamp, BodyState)> {
        let (t, snapshot) = self.history.closest_not_newer(tv)?;
        let mut state = BodyState::default();
        snapshot.restore(&mut state);
        Some((t, state))
    }

    /// Incorporates an IMU measurement, handling reports that arrive out
    /// of timestamp order by replaying the log on top of the nearest older
    /// snapshot. In-order reports are simply applied to the live state.
    pub fn incorporate_new_measurement_from_imu(
        &mut self,
        camera_from_room: &UnitQuaternion<f64>,
        tv: Timestamp,
        measurement: CannedImuMeasurement,
    ) {
        if self.history.is_empty() || tv >= self.state_time {
            self.apply_and_record_imu(camera_from_room, tv, measurement);
            return;
        }

        // Out-of-order: rewind to the newest snapshot not newer than the
        // report, splice the report into the log, and replay everything
        // after it.
        debug!(
            "IMU report at {:?} is older than state time {:?}; replaying history",
            tv, self.state_time
        );
        let rewind_point = match self.history.closest_not_newer(tv) {
            Some((t, snapshot)) => {
                let mut state = BodyState::default();
                snapshot.restore(&mut state);
                (t, state)
            }
            None => {
                // Nothing old enough to rewind to; apply in arrival order.
                self.apply_and_record_imu(camera_from_room, tv, measurement);
                return;
            }
        };

        let replay: Vec<(Timestamp, CannedImuMeasurement)> = self
            .imu_log
            .iter_newer_than(tv)
            .map(|(t, m)| (t, m.clone()))
            .collect();
        self.history.pop_after(rewind_point.0);
        self.imu_log.pop_after(tv);

        self.state = rewind_point.1;
        self.state_time = rewind_point.0;

        self.apply_and_record_imu(camera_from_room, tv, measurement);
        for (t, m) in replay {
            self.apply_and_record_imu(camera_from_room, t, m);
        }
    }

    fn apply_and_record_imu(
        &mut self,
        camera_from_room: &UnitQuaternion<f64>,
        tv: Timestamp,
        measurement: CannedImuMeasurement,
    ) {
        apply_imu_to_state(
            camera_from_room,
            self.state_time,
            &mut self.state,
            &self.process,
            tv,
            &measurement,
        );
        self.state_time = tv;
        if self.history.push_newest(tv, StateSnapshot::save(&self.state)).is_err() {
            debug!("Dropping IMU snapshot pushed out of order at {:?}", tv);
        }
        if self.imu_log.push_newest(tv, measurement).is_err() {
            debug!("Dropping IMU log entry pushed out of order at {:?}", tv);
        }
    }

    /// Installs a video-derived state that was computed against the
    /// snapshot at `orig_time`: snapshots newer than `orig_time` are
    /// discarded and any logged IMU measurements from that span are
    /// replayed on top, in chronological order.
    pub fn replace_state_snapshot(
        &mut self,
        camera_from_room: &UnitQuaternion<f64>,
        orig_time: Timestamp,
        new_time: Timestamp,
        new_state: BodyState,
    ) {
        let replay: Vec<(Timestamp, CannedImuMeasurement)> = self
            .imu_log
            .iter_newer_than(orig_time)
            .map(|(t, m)| (t, m.clone()))
            .collect();
        self.history.pop_after(orig_time);
        self.imu_log.pop_after(orig_time);

        self.state = new_state;
        self.state_time = new_time;
        if self
            .history
            .push_newest(new_time, StateSnapshot::save(&self.state))
            .is_err()
        {
            debug!("Video snapshot at {:?} precedes history tail", new_time);
        }

        for (t, m) in replay {
            self.apply_and_record_imu(camera_from_room, t, m);
        }
    }

    /// Drops history older than the oldest timestamp any measurement
    /// source still refers to, always retaining at least the newest entry.
    pub fn prune_history(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let mut oldest: Option<Timestamp> = None;
        let mut update = |tv: Timestamp| {
            if oldest.map(|o| tv < o).unwrap_or(true) {
                oldest = Some(tv);
            }
        };
        if let Some(target) = &self.target {
            update(target.last_update());
        }
        if let Some(imu) = &self.imu {
            update(imu.last_update());
        }
        let mut oldest = match oldest {
            Some(t) => t,
            None => return,
        };
        if let Some(newest) = self.history.newest_timestamp() {
            // Never prune down to an empty history.
            if newest < oldest {
                oldest = newest;
            }
        }
        self.history.pop_before(oldest);
        self.imu_log.pop_before(oldest);
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
