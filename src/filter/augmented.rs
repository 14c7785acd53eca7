// filter/augmented.rs

// Ad-hoc augmented state for SCAAT updates: the 12-D body state and one
// 3-D beacon state, borrowed together and treated as a single 15-D state
// for the duration of one measurement correction. There is no fused global
// state; the augmentation is local to the measurement, and the
// cross-covariance between the two halves is not tracked.

// Dependencies
use nalgebra::{SMatrix, SVector};

use super::state::{BeaconState, BodyState, BODY_STATE_DIM};
use super::FilterState;

pub const AUGMENTED_DIM: usize = BODY_STATE_DIM + 3;
pub type AugmentedVector = SVector<f64, AUGMENTED_DIM>;
pub type AugmentedMatrix = SMatrix<f64, AUGMENTED_DIM, AUGMENTED_DIM>;

/// Borrowed (body, beacon) pair presenting a joint 15-D filter state.
pub struct AugmentedState<'a> {
    body: &'a mut BodyState,
    beacon: &'a mut BeaconState,
}

impl<'a> AugmentedState<'a> {
    pub fn new(body: &'a mut BodyState, beacon: &'a mut BeaconState) -> Self {
        AugmentedState { body, beacon }
    }

    pub fn body(&self) -> &BodyState {
        self.body
    }

    pub fn beacon(&self) -> &BeaconState {
        self.beacon
    }
}

impl<'a> FilterState<AUGMENTED_DIM> for AugmentedState<'a> {
    fn state_vector(&self) -> AugmentedVector {
        let mut x = AugmentedVector::zeros();
        x.fixed_rows_mut::<BODY_STATE_DIM>(0)
            .copy_from(&self.body.state_vector());
        x.fixed_rows_mut::<3>(BODY_STATE_DIM)
            .copy_from(&self.beacon.state_vector());
        x
    }

    fn set_state_vector(&mut self, x: &AugmentedVector) {
        self.body
            .set_state_vector(&x.fixed_rows::<BODY_STATE_DIM>(0).into_owned());
        self.beacon
            .set_state_vector(&x.fixed_rows::<3>(BODY_STATE_DIM).into_owned());
    }

    fn error_covariance(&self) -> AugmentedMatrix {
        // Block-diagonal: the body/beacon cross terms are not maintained.
        let mut p = AugmentedMatrix::zeros();
        p.fixed_view_mut::<BODY_STATE_DIM, BODY_STATE_DIM>(0, 0)
            .copy_from(&self.body.error_covariance());
        p.fixed_view_mut::<3, 3>(BODY_STATE_DIM, BODY_STATE_DIM)
            .copy_from(&self.beacon.error_covariance());
        p
    }

    fn set_error_covariance(&mut self, p: &AugmentedMatrix) {
        self.body.set_error_covariance(
            &p.fixed_view::<BODY_STATE_DIM, BODY_STATE_DIM>(0, 0).into_owned(),
        );
        self.beacon.set_error_covariance(
            &p.fixed_view::<3, 3>(BODY_STATE_DIM, BODY_STATE_DIM).into_owned(),
        );
    }

    fn post_correct(&mut self) {
        self.body.post_correct();
        self.beacon.post_correct();
    }
}
