// filter/mod.rs

// Generic Extended Kalman Filter kernel: the state / process-model /
// measurement-model trait triple, the predict step, and a two-phase
// correction. The correction is split into a "begin" phase that computes
// the candidate state correction and covariance, and a "finish" phase that
// commits them, so callers can reject obviously wrong measurements before
// any state is mutated. Non-finite corrections are detected and reported
// instead of corrupting the state.

pub mod augmented;
pub mod history;
pub mod measurement;
pub mod process;
pub mod state;

// Dependencies
use nalgebra::{Cholesky, Const, SMatrix, SVector};

/// A filterable state: an N-dimensional estimate vector with its error
/// covariance, plus a post-correction cleanup hook (externalized-rotation
/// states fold the incremental rotation into their quaternion there).
pub trait FilterState<const N: usize> {
    fn state_vector(&self) -> SVector<f64, N>;
    fn set_state_vector(&mut self, x: &SVector<f64, N>);
    fn error_covariance(&self) -> SMatrix<f64, N, N>;
    fn set_error_covariance(&mut self, p: &SMatrix<f64, N, N>);
    /// Cleanup after a correction has been applied.
    fn post_correct(&mut self);
}

/// A process model: advances a state (estimate and covariance) by `dt`
/// seconds. Implementations perform the standard covariance prediction
/// `A * P * A' + Q(dt)` internally.
pub trait ProcessModel<const N: usize> {
    type State: FilterState<N>;
    fn predict_state(&self, state: &mut Self::State, dt: f64);
}

/// A measurement model against a state type: residual, Jacobian, and
/// measurement covariance, each evaluated at the current state.
pub trait MeasurementModel<S, const N: usize, const M: usize> {
    fn jacobian(&self, state: &S) -> SMatrix<f64, M, N>;
    fn residual(&self, state: &S) -> SVector<f64, M>;
    fn covariance(&self, state: &S) -> SMatrix<f64, M, M>;
}

/// Advances state and covariance through the process model.
pub fn predict<P, const N: usize>(state: &mut P::State, process: &P, dt: f64)
where
    P: ProcessModel<N>,
{
    process.predict_state(state, dt);
}

/// Computes the a-priori error covariance `A * P * A' + Q`. Called by
/// process-model implementations from `predict_state`.
pub fn predict_error_covariance<const N: usize>(
    p: &SMatrix<f64, N, N>,
    a: &SMatrix<f64, N, N>,
    q: &SMatrix<f64, N, N>,
) -> SMatrix<f64, N, N> {
    a * p * a.transpose() + q
}

/// First phase of a correction: everything computed, nothing committed.
///
/// The innovation covariance `S = H*P*H' + R` is factored (Cholesky) and
/// solved against rather than inverted. A factorization failure is treated
/// the same as a non-finite correction: `state_correction_finite` goes
/// false and `finish` refuses to commit.
pub struct CorrectionInProgress<'a, S, const N: usize, const M: usize> {
    state: &'a mut S,
    p: SMatrix<f64, N, N>,
    pht: SMatrix<f64, N, M>,
    denom: Option<Cholesky<f64, Const<M>>>,
    /// Measurement residual (innovation).
    pub delta_z: SVector<f64, M>,
    /// Candidate state correction to apply.
    pub state_correction: SVector<f64, N>,
    /// Whether the candidate correction is free of NaNs and infinities.
    pub state_correction_finite: bool,
}

impl<'a, S, const N: usize, const M: usize> CorrectionInProgress<'a, S, N, M>
where
    S: FilterState<N>,
{
    /// Second phase: computes the new error covariance and commits both it
    /// and the state correction, then runs `post_correct`.
    ///
    /// Returns false (leaving the state untouched) if the new covariance
    /// contains non-finite values and `cancel_if_not_finite` is set.
    pub fn finish_correction(self, cancel_if_not_finite: bool) -> bool {
        let denom = match self.denom {
            Some(d) => d,
            None => return false,
        };
        // Differs from the (I - K*H)*P form by reusing the P*H' product we
        // already have.
        let new_p = self.p - self.pht * denom.solve(&self.pht.transpose());
        if cancel_if_not_finite && !new_p.iter().all(|v| v.is_finite()) {
            return false;
        }

        let corrected = self.state.state_vector() + self.state_correction;
        self.state.set_state_vector(&corrected);
        self.state.set_error_covariance(&new_p);
        self.state.post_correct();
        true
    }
}

/// First phase of an EKF correction for one measurement.
pub fn begin_correction<'a, S, Me, const N: usize, const M: usize>(
    state: &'a mut S,
    measurement: &Me,
) -> CorrectionInProgress<'a, S, N, M>
where
    S: FilterState<N>,
    Me: MeasurementModel<S, N, M>,
{
    let h = measurement.jacobian(state);
    let r = measurement.covariance(state);
    let p = state.error_covariance();
    // The gain numerator that we never multiply by an explicit inverse.
    let pht = p * h.transpose();
    // Innovation covariance.
    let s = h * pht + r;
    let delta_z = measurement.residual(state);

    let denom = Cholesky::new(s);
    let (state_correction, finite) = match &denom {
        Some(chol) => {
            let correction = pht * chol.solve(&delta_z);
            let finite = correction.iter().all(|v| v.is_finite());
            (correction, finite)
        }
        None => (SVector::<f64, N>::zeros(), false),
    };

    CorrectionInProgress {
        state,
        p,
        pht,
        denom,
        delta_z,
        state_correction,
        state_correction_finite: finite,
    }
}

/// Convenience single-call correction.
///
/// Returns true if the correction was applied. With `cancel_if_not_finite`
/// set, a non-finite correction or covariance leaves the state unchanged.
pub fn correct<S, Me, const N: usize, const M: usize>(
    state: &mut S,
    measurement: &Me,
    cancel_if_not_finite: bool,
) -> bool
where
    S: FilterState<N>,
    Me: MeasurementModel<S, N, M>,
{
    let in_progress = begin_correction(state, measurement);
    if cancel_if_not_finite && !in_progress.state_correction_finite {
        return false;
    }
    in_progress.finish_correction(cancel_if_not_finite)
}
