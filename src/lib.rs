//! Argus - Unified Video-Inertial Tracking Runtime
//!
//! This library fuses two sensor streams into a single 6-DoF pose estimate
//! for a rigid body: blinking infra-red LED "beacons" observed by a grayscale
//! camera, and orientation/angular-velocity reports from an on-board IMU.
//! The fusion core is an Extended Kalman Filter over a 12-dimensional pose
//! state with an externalized unit quaternion, fed by a RANSAC bootstrap and
//! a per-beacon SCAAT update loop with beacon auto-calibration.

#![warn(unused_extern_crates)]

pub mod body;
pub mod config;
pub mod estimator;
pub mod filter;
pub mod math;
pub mod system;
pub mod target;
pub mod vision;

// Re-export commonly used items for easier access
pub use body::{BodyId, TrackedBody};
pub use config::{BlobParams, ConfigParams};
pub use filter::state::{BeaconState, BodyState};
pub use system::reporting::{BodyReport, BodyReportingVector};
pub use system::thread::{FrameSource, TrackerThread};
pub use system::TrackingSystem;
pub use target::TrackedTarget;
pub use vision::camera::CameraIntrinsics;
pub use vision::GrayImage;

/// A point on the tracker's shared timeline, in seconds.
///
/// Camera frames and IMU reports are both stamped with this type; the state
/// history is ordered by it. It wraps an `f64` with a total order so it can
/// key binary searches without NaN surprises.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timestamp(f64);

impl Timestamp {
    pub fn from_secs(secs: f64) -> Self {
        Timestamp(secs)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Seconds elapsed from `earlier` to `self` (negative if out of order).
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        self.0 - earlier.0
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Tracker error types
#[derive(Debug)]
pub enum TrackerError {
    /// Configuration could not be read or parsed
    ConfigError(String),
    /// The beacon setup table was malformed beyond recovery
    BeaconTable(String),
    /// The camera reported a failure
    CameraError(String),
    /// A body already owns the resource being attached (IMU or target)
    AlreadyAttached(&'static str),
    /// A timestamped value was pushed behind the newest history entry
    HistoryOrder,
    /// Referenced a body that does not exist
    UnknownBody(u16),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TrackerError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            TrackerError::BeaconTable(msg) => write!(f, "Beacon table error: {}", msg),
            TrackerError::CameraError(msg) => write!(f, "Camera error: {}", msg),
            TrackerError::AlreadyAttached(what) => {
                write!(f, "Body already has a {} attached", what)
            }
            TrackerError::HistoryOrder => {
                write!(f, "Value pushed out of order into state history")
            }
            TrackerError::UnknownBody(id) => write!(f, "Unknown body id {}", id),
        }
    }
}

impl std::error::Error for TrackerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_total_order() {
        let a = Timestamp::from_secs(1.0);
        let b = Timestamp::from_secs(2.5);
        assert!(a < b);
        assert_eq!(b.seconds_since(a), 1.5);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn error_messages_are_printable() {
        let e = TrackerError::AlreadyAttached("target");
        assert!(format!("{}", e).contains("target"));
    }
}
