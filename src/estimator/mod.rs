// estimator/mod.rs

// Pose estimators and their shared plumbing. The three estimators cover
// the three phases of tracking life: RANSAC PnP bootstraps a pose from
// scratch, the RANSAC-seeded Kalman feeds a full pose into the filter as
// two measurements, and the SCAAT estimator applies one correction per
// identified LED during steady tracking.

pub mod measurement;
pub mod pnp;
pub mod ransac;
pub mod ransac_kalman;
pub mod scaat;

// Dependencies
use nalgebra::{Vector2, Vector3};

use crate::filter::process::DampedConstantVelocity;
use crate::filter::state::{BeaconState, BodyState};
use crate::vision::camera::CameraIntrinsics;
use crate::Timestamp;

/// Per-beacon debug record, streamed alongside pose reports when
/// requested.
#[derive(Debug, Clone)]
pub struct BeaconDebug {
    pub seen: bool,
    pub measurement: Vector2<f64>,
    pub residual: Vector2<f64>,
    pub variance: f64,
}

impl Default for BeaconDebug {
    fn default() -> Self {
        BeaconDebug {
            seen: false,
            measurement: Vector2::zeros(),
            residual: Vector2::zeros(),
            variance: 0.0,
        }
    }
}

impl BeaconDebug {
    pub fn reset(&mut self) {
        *self = BeaconDebug::default();
    }
}

/// Everything an estimator reads and writes, borrowed from the target and
/// its body for the duration of one frame. The parallel per-beacon slices
/// are indexed by zero-based beacon id.
pub struct EstimationContext<'a> {
    pub intrinsics: &'a CameraIntrinsics,
    pub beacons: &'a mut [BeaconState],
    pub base_measurement_variance: &'a [f64],
    pub beacon_fixed: &'a [bool],
    pub emission_directions: &'a [Vector3<f64>],
    /// Time the incoming body state corresponds to.
    pub starting_time: Timestamp,
    pub state: &'a mut BodyState,
    pub process: &'a DampedConstantVelocity,
    pub beacon_debug: &'a mut [BeaconDebug],
}
