// config.rs

// Flat configuration record for the tracking runtime, loadable from a YAML
// file. Every recognized option is documented with its effect on the
// algorithm; defaults reproduce the tuned values shipped with the reference
// hardware profile.

// Dependencies
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::TrackerError;

/// Blob detection configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobParams {
    /// Centroids from different threshold levels closer than this (pixels)
    /// are clustered into a single blob.
    pub min_dist_between_blobs: f64,
    /// Minimum connected-component area, in square pixels.
    pub min_area: f64,
    /// Whether to filter candidate contours by circularity. Faster than the
    /// convexity filter but may be confused by side views of LEDs.
    pub filter_by_circularity: bool,
    /// Minimum circularity (4*pi*area / perimeter^2) in [0, 1].
    pub min_circularity: f64,
    /// Whether to filter candidate contours by convexity. More expensive
    /// than the circularity filter.
    pub filter_by_convexity: bool,
    /// Minimum convexity (area / convex hull area) in [0, 1].
    pub min_convexity: f64,
    /// Absolute minimum pixel value considered a possible signal. Frames
    /// whose brightest pixel is below this produce zero blobs.
    pub absolute_min_threshold: f64,
    /// Linear interpolation factor, in (0, 1), between the frame's min and
    /// max pixel values giving the lowest threshold the sweep will use
    /// (clamped below by `absolute_min_threshold`).
    pub min_threshold_alpha: f64,
    /// Linear interpolation factor, in (0, 1), between the frame's min and
    /// max pixel values giving the highest threshold the sweep will use.
    pub max_threshold_alpha: f64,
    /// Number of thresholding and contour-extraction steps taken between
    /// the two threshold extrema. Directly scales extraction cost.
    pub threshold_steps: usize,
}

impl Default for BlobParams {
    fn default() -> Self {
        BlobParams {
            min_dist_between_blobs: 3.0,
            min_area: 2.0,
            filter_by_circularity: false,
            min_circularity: 0.2,
            filter_by_convexity: true,
            min_convexity: 0.90,
            absolute_min_threshold: 75.0,
            min_threshold_alpha: 0.5,
            max_threshold_alpha: 0.8,
            threshold_steps: 4,
        }
    }
}

/// General configuration parameters for the tracking runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigParams {
    /// Parameters specific to the blob-detection step of the algorithm.
    pub blob_params: BlobParams,

    /// Seconds beyond the frame time to predict when publishing reports.
    /// Applied only at the reporting surface, never to internal state.
    pub additional_prediction: f64,

    /// Max residual (pixel units) for a beacon before the SCAAT estimator
    /// applies the variance penalty.
    pub max_residual: f64,

    /// Initial per-beacon auto-calibration variance (m^2). Zero effectively
    /// turns beacon auto-calibration off.
    pub initial_beacon_error: f64,

    /// Maximum distance a blob can move, in multiples of its previous
    /// diameter, and still be matched to the same tracked LED.
    pub blob_move_threshold: f64,

    /// Whether to emit extra debug output.
    pub debug: bool,

    /// Autocorrelation kernel of the process noise. The first three
    /// elements correspond to position, the last three to incremental
    /// orientation.
    pub process_noise_autocorrelation: [f64; 6],

    /// Exponential decay of linear velocity: the proportion of velocity
    /// remaining after one second. In (0, 1); smaller means faster decay.
    pub linear_velocity_decay_coefficient: f64,

    /// Exponential decay of angular velocity: the proportion of velocity
    /// remaining after one second. In (0, 1); smaller means faster decay.
    pub angular_velocity_decay_coefficient: f64,

    /// Global multiplier applied to every beacon measurement variance.
    pub measurement_variance_scale_factor: f64,

    /// Whether beacon positions are internally re-centered on their
    /// centroid. If false, `manual_beacon_offset` is used instead.
    pub offset_to_centroid: bool,

    /// Manual beacon offset in meters, used when `offset_to_centroid` is
    /// false. Only sensible with a single target.
    pub manual_beacon_offset: [f64; 3],

    /// If true, the rear-panel beacons are folded into the single target as
    /// a rigid extension of the front panel.
    pub include_rear_panel: bool,

    /// Head circumference at the strap, in cm. Only matters when
    /// `include_rear_panel` is true.
    pub head_circumference: f64,

    /// Distance from the front of the head to the origin of the front
    /// beacon coordinate system along Z, in mm.
    pub head_to_front_beacon_origin_distance: f64,

    /// Base measurement variance assigned to rear-panel beacons.
    pub back_panel_measurement_error: f64,

    /// Process noise for beacon auto-calibration, applied per second of
    /// prediction whenever a non-fixed beacon is used in a measurement.
    pub beacon_process_noise: f64,

    /// Multiplicative penalty applied to the variance of measurements whose
    /// residual exceeds `max_residual`.
    pub high_residual_variance_penalty: f64,

    /// Permitted ratio between the longer and shorter sides of a blob's
    /// bounding box for it to be considered usable by the SCAAT estimator.
    pub bounding_box_filter_ratio: f64,

    /// Largest camera-space Z component of a beacon's rotated emission
    /// direction that is still accepted for estimation. Should be negative;
    /// acos of it is the maximum angle away from facing the camera.
    pub max_z_component: f64,

    /// Whether to skip bright-mode LEDs outright when enough dim ones are
    /// identified. The alternative is a fixed variance penalty.
    pub should_skip_bright_leds: bool,

    /// If true, the pattern identifier takes an early-out when a blob
    /// already carries a valid beacon ID. Keeps IDs on hard-to-identify
    /// blobs, at the price of persisting errors longer.
    pub blobs_keep_identity: bool,

    /// Extra verbose developer messages (per-measurement rejections).
    pub extra_verbose: bool,

    /// Whether to stream per-beacon debug data (variance, measurement,
    /// residual) alongside pose reports.
    pub stream_beacon_debug_info: bool,

    /// Supplied camera position in the room frame, in meters.
    pub camera_position: [f64; 3],

    /// Whether the camera is assumed to face forward along the room's Z
    /// axis; when true, room calibration removes the yaw component from the
    /// recovered camera orientation and hands it to the IMU instead.
    pub camera_is_forward: bool,
}

impl Default for ConfigParams {
    fn default() -> Self {
        let position_noise = 0.1661102065530816;
        let rotation_noise = 0.07814149202850287;
        ConfigParams {
            blob_params: BlobParams::default(),
            additional_prediction: 24.0 / 1000.0,
            max_residual: 75.0,
            initial_beacon_error: 1e-9,
            blob_move_threshold: 4.0,
            debug: false,
            process_noise_autocorrelation: [
                position_noise,
                position_noise,
                position_noise,
                rotation_noise,
                rotation_noise,
                rotation_noise,
            ],
            linear_velocity_decay_coefficient: 0.9,
            angular_velocity_decay_coefficient: 0.9,
            measurement_variance_scale_factor: 1.0,
            offset_to_centroid: true,
            // Centroid of the front beacons with only the Z component
            // retained; the best manual offset found for the reference
            // hardware.
            manual_beacon_offset: [0.0, 0.0, -0.0388676],
            include_rear_panel: false,
            head_circumference: 55.75,
            head_to_front_beacon_origin_distance: 0.0,
            back_panel_measurement_error: 3.0,
            beacon_process_noise: 1e-13,
            high_residual_variance_penalty: 10.0,
            bounding_box_filter_ratio: 5.0 / 4.0,
            max_z_component: -0.3,
            should_skip_bright_leds: false,
            blobs_keep_identity: false,
            extra_verbose: false,
            stream_beacon_debug_info: false,
            camera_position: [0.0, 1.2, -0.5],
            camera_is_forward: true,
        }
    }
}

impl ConfigParams {
    /// Loads configuration from a YAML file, falling back to defaults for
    /// any omitted field.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, TrackerError> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| TrackerError::ConfigError(e.to_string()))?;
        serde_yaml::from_reader(file).map_err(|e| TrackerError::ConfigError(e.to_string()))
    }
}
