// math/filters.rs

// 1-euro low-pass filters for positions and orientations, used to steady the
// noisy RANSAC poses fed into room calibration. The cutoff frequency adapts
// to the speed of the signal: slow signals get heavy smoothing, fast ones
// track with low lag.

// Dependencies
use nalgebra::{UnitQuaternion, Vector3};

use super::{quat_exp, quat_ln};

/// Smoothing factor for a first-order low-pass at the given cutoff (Hz)
/// sampled every `dt` seconds.
fn smoothing_alpha(cutoff: f64, dt: f64) -> f64 {
    let tau = 1.0 / (2.0 * std::f64::consts::PI * cutoff);
    1.0 / (1.0 + tau / dt)
}

/// Shared tuning for the 1-euro filters.
#[derive(Debug, Clone, Copy)]
pub struct OneEuroParams {
    /// Minimum cutoff frequency (Hz); the floor of the smoothing.
    pub min_cutoff: f64,
    /// Cutoff slope: how quickly the cutoff rises with signal speed.
    pub beta: f64,
    /// Cutoff for the internal derivative estimate (Hz).
    pub derivative_cutoff: f64,
}

impl Default for OneEuroParams {
    fn default() -> Self {
        OneEuroParams {
            min_cutoff: 1.15,
            beta: 0.5,
            derivative_cutoff: 1.2,
        }
    }
}

/// 1-euro filter over 3-vectors.
#[derive(Debug, Clone)]
pub struct OneEuroVectorFilter {
    params: OneEuroParams,
    state: Option<Vector3<f64>>,
    derivative: Vector3<f64>,
}

impl OneEuroVectorFilter {
    pub fn new(params: OneEuroParams) -> Self {
        OneEuroVectorFilter {
            params,
            state: None,
            derivative: Vector3::zeros(),
        }
    }

    /// Feeds one sample taken `dt` seconds after the previous one and
    /// returns the filtered value.
    pub fn filter(&mut self, dt: f64, sample: &Vector3<f64>) -> Vector3<f64> {
        let prev = match self.state {
            Some(prev) => prev,
            None => {
                self.state = Some(*sample);
                return *sample;
            }
        };
        let raw_derivative = (sample - prev) / dt;
        let d_alpha = smoothing_alpha(self.params.derivative_cutoff, dt);
        self.derivative = self.derivative.lerp(&raw_derivative, d_alpha);

        let cutoff = self.params.min_cutoff + self.params.beta * self.derivative.norm();
        let alpha = smoothing_alpha(cutoff, dt);
        let filtered = prev.lerp(sample, alpha);
        self.state = Some(filtered);
        filtered
    }

    /// Latest filtered value, if any sample has been seen.
    pub fn value(&self) -> Option<Vector3<f64>> {
        self.state
    }
}

/// 1-euro filter over unit quaternions. Blending happens via slerp and the
/// derivative estimate lives in the tangent space.
#[derive(Debug, Clone)]
pub struct OneEuroQuatFilter {
    params: OneEuroParams,
    state: Option<UnitQuaternion<f64>>,
    derivative: Vector3<f64>,
}

impl OneEuroQuatFilter {
    pub fn new(params: OneEuroParams) -> Self {
        OneEuroQuatFilter {
            params,
            state: None,
            derivative: Vector3::zeros(),
        }
    }

    pub fn filter(&mut self, dt: f64, sample: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
        let prev = match self.state {
            Some(prev) => prev,
            None => {
                self.state = Some(*sample);
                return *sample;
            }
        };
        let raw_derivative = quat_ln(&(sample * prev.inverse())) / dt;
        let d_alpha = smoothing_alpha(self.params.derivative_cutoff, dt);
        self.derivative = self.derivative.lerp(&raw_derivative, d_alpha);

        let cutoff = self.params.min_cutoff + self.params.beta * self.derivative.norm();
        let alpha = smoothing_alpha(cutoff, dt);
        // slerp along the shortest arc toward the sample
        let step = quat_ln(&(sample * prev.inverse())) * alpha;
        let filtered = quat_exp(&step) * prev;
        self.state = Some(filtered);
        filtered
    }

    pub fn value(&self) -> Option<UnitQuaternion<f64>> {
        self.state
    }
}
