//! Kalman update in gain-matrix formalism.
//!
//! For a predicted state `x` with covariance `C` and a measurement `m` with
//! covariance `V` and projector `H`:
//!
//! ```text
//! K  = C Hᵀ (H C Hᵀ + V)⁻¹
//! x' = x + K (m - H x)
//! C' = (I - K H) C
//! r  = m - H x'
//! χ² = rᵀ ((I - H K) V)⁻¹ r
//! ```

use nalgebra::{SMatrix, SVector};
use tracing::trace;

use crate::kalman_fitter::KalmanFitterError;
use crate::measurement::{
    measurement_residual, visit_measurement_size, MeasurementSizeVisitor, SubspaceIndices,
};
use crate::track_parameters::{normalize_bound_parameters, BoundMatrix, BoundVector};
use crate::track_state::TrackStateProxyMut;

/// Outcome of a single update step.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanUpdate {
    pub filtered: BoundVector,
    pub filtered_covariance: BoundMatrix,
    pub chi2: f64,
}

/// Combines a prediction with a measurement of size `M`.
///
/// # Arguments
/// * `predicted` / `predicted_covariance` - Prior bound state
/// * `subspace` - Measured bound indices
/// * `calibrated` / `calibrated_covariance` - The measurement
///
/// # Errors
/// [`KalmanFitterError::SingularMatrix`] if the residual covariance cannot
/// be inverted, [`KalmanFitterError::UpdateFailed`] if the gain is not finite.
pub fn kalman_update<const M: usize>(
    predicted: &BoundVector,
    predicted_covariance: &BoundMatrix,
    subspace: &SubspaceIndices,
    calibrated: &SVector<f64, M>,
    calibrated_covariance: &SMatrix<f64, M, M>,
) -> Result<KalmanUpdate, KalmanFitterError> {
    let h = subspace.projector::<M>();
    trace!("Measurement projector H:\n{}", h);

    let s = h * predicted_covariance * h.transpose() + calibrated_covariance;
    let s_inv = s.try_inverse().ok_or(KalmanFitterError::SingularMatrix)?;

    let gain = predicted_covariance * h.transpose() * s_inv;
    trace!("Gain matrix K:\n{}", gain);
    if gain.iter().any(|k| !k.is_finite()) {
        return Err(KalmanFitterError::UpdateFailed);
    }

    let innovation = measurement_residual(subspace, calibrated, predicted);
    let filtered = normalize_bound_parameters(&(predicted + gain * innovation));
    let filtered_covariance = (BoundMatrix::identity() - gain * h) * predicted_covariance;
    trace!("Filtered parameters: {}", filtered.transpose());
    trace!("Filtered covariance:\n{}", filtered_covariance);

    let residual = measurement_residual(subspace, calibrated, &filtered);
    let residual_covariance = (SMatrix::<f64, M, M>::identity() - h * gain) * calibrated_covariance;
    let residual_weight = residual_covariance
        .try_inverse()
        .ok_or(KalmanFitterError::SingularMatrix)?;
    let chi2 = (residual.transpose() * residual_weight * residual)[(0, 0)];
    trace!("Chi2: {}", chi2);

    Ok(KalmanUpdate {
        filtered,
        filtered_covariance,
        chi2,
    })
}

/// Applies [`kalman_update`] to a track state in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct GainMatrixUpdater;

impl GainMatrixUpdater {
    pub fn new() -> Self {
        Self
    }

    /// Updates `state` with its calibrated measurement.
    ///
    /// Reads the predicted parameters and the calibrated measurement, writes
    /// the filtered parameters, covariance and chi2.
    ///
    /// # Errors
    /// [`KalmanFitterError::MissingComponent`] unless predicted, filtered and
    /// calibrated components are allocated; otherwise as [`kalman_update`].
    pub fn update(&self, state: &mut TrackStateProxyMut<'_>) -> Result<(), KalmanFitterError> {
        if !(state.has_predicted() && state.has_filtered() && state.has_calibrated()) {
            return Err(KalmanFitterError::MissingComponent);
        }
        trace!("Updating track state {}", state.index());

        let result = visit_measurement_size(
            state.calibrated_size(),
            UpdateStep {
                state: &*state,
            },
        )?;

        *state.filtered_mut() = result.filtered;
        *state.filtered_covariance_mut() = result.filtered_covariance;
        *state.chi2_mut() = result.chi2;
        Ok(())
    }
}

struct UpdateStep<'p, 'a> {
    state: &'p TrackStateProxyMut<'a>,
}

impl MeasurementSizeVisitor for UpdateStep<'_, '_> {
    type Output = Result<KalmanUpdate, KalmanFitterError>;

    fn visit<const M: usize>(self) -> Self::Output {
        kalman_update::<M>(
            self.state.predicted(),
            self.state.predicted_covariance(),
            &self.state.projector_subspace(),
            &self.state.calibrated::<M>(),
            &self.state.calibrated_covariance::<M>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Measurement, SourceLink};
    use crate::multi_trajectory::{MultiTrajectory, TrackStatePropMask};
    use crate::track_parameters::{E_BOUND_LOC0, E_BOUND_LOC1, E_BOUND_PHI, E_BOUND_THETA};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2, Vector2};
    use proptest::prelude::*;

    fn predicted_state() -> (BoundVector, BoundMatrix) {
        let params = BoundVector::from_column_slice(&[0.3, -0.2, 0.5, 1.2, 0.1, 4.0]);
        let cov = BoundMatrix::from_diagonal(&BoundVector::from_column_slice(&[
            0.04, 0.09, 1e-4, 1e-4, 1e-6, 1.0,
        ]));
        (params, cov)
    }

    fn loc_subspace() -> SubspaceIndices {
        SubspaceIndices::new(&[E_BOUND_LOC0, E_BOUND_LOC1]).unwrap()
    }

    #[test]
    fn test_measurement_equal_to_prediction() {
        // The measurement agrees exactly with the prediction: nothing moves
        let (x, c) = predicted_state();
        let m = Vector2::new(x[E_BOUND_LOC0], x[E_BOUND_LOC1]);
        let v = Matrix2::new(0.01, 0.0, 0.0, 0.01);

        let up = kalman_update::<2>(&x, &c, &loc_subspace(), &m, &v).unwrap();

        assert_relative_eq!(up.filtered, x, epsilon = 1e-12);
        assert_relative_eq!(up.chi2, 0.0, epsilon = 1e-12);

        let h = loc_subspace().projector::<2>();
        let k = c * h.transpose() * (h * c * h.transpose() + v).try_inverse().unwrap();
        let expected_cov = (BoundMatrix::identity() - k * h) * c;
        assert_relative_eq!(up.filtered_covariance, expected_cov, epsilon = 1e-15);
    }

    #[test]
    fn test_one_dimensional_update_matches_scalar_formula() {
        let (x, c) = predicted_state();
        let sub = SubspaceIndices::new(&[E_BOUND_LOC0]).unwrap();
        let m = SVector::<f64, 1>::new(0.5);
        let v = SMatrix::<f64, 1, 1>::new(0.04);

        let up = kalman_update::<1>(&x, &c, &sub, &m, &v).unwrap();

        // Equal prior and measurement variance: the filtered value sits halfway
        assert_relative_eq!(up.filtered[E_BOUND_LOC0], 0.4, epsilon = 1e-12);
        assert_relative_eq!(up.filtered_covariance[(0, 0)], 0.02, epsilon = 1e-12);
        // Unmeasured, uncorrelated components are untouched
        assert_relative_eq!(up.filtered[E_BOUND_LOC1], x[E_BOUND_LOC1]);
        // r = 0.1, (1 - HK) V = 0.02
        assert_relative_eq!(up.chi2, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_residual_covariance() {
        let x = BoundVector::zeros();
        let c = BoundMatrix::zeros();
        let sub = SubspaceIndices::new(&[E_BOUND_PHI]).unwrap();
        let result = kalman_update::<1>(
            &x,
            &c,
            &sub,
            &SVector::<f64, 1>::new(0.1),
            &SMatrix::<f64, 1, 1>::zeros(),
        );
        assert_eq!(result, Err(KalmanFitterError::SingularMatrix));
    }

    #[test]
    fn test_updater_writes_into_track_state() {
        let mut traj = MultiTrajectory::new();
        let mask = TrackStatePropMask::PREDICTED
            | TrackStatePropMask::FILTERED
            | TrackStatePropMask::CALIBRATED;
        let i = traj.add_track_state(mask, MultiTrajectory::INVALID);
        let (x, c) = predicted_state();
        let meas = Measurement::new(
            SourceLink::default(),
            [E_BOUND_LOC0, E_BOUND_LOC1],
            Vector2::new(0.35, -0.1),
            Matrix2::new(0.01, 0.0, 0.0, 0.01),
        )
        .unwrap();

        let mut ts = traj.get_track_state_mut(i);
        *ts.predicted_mut() = x;
        *ts.predicted_covariance_mut() = c;
        ts.set_calibrated(&meas);
        GainMatrixUpdater::new().update(&mut ts).unwrap();

        let expected = kalman_update::<2>(
            &x,
            &c,
            &loc_subspace(),
            &Vector2::new(0.35, -0.1),
            &Matrix2::new(0.01, 0.0, 0.0, 0.01),
        )
        .unwrap();
        let ts = traj.get_track_state(i);
        assert_relative_eq!(*ts.filtered(), expected.filtered);
        assert_relative_eq!(ts.chi2(), expected.chi2);
        assert!(ts.chi2() > 0.0);
    }

    #[test]
    fn test_updater_requires_components() {
        let mut traj = MultiTrajectory::new();
        let i = traj.add_track_state(TrackStatePropMask::PREDICTED, MultiTrajectory::INVALID);
        let result = GainMatrixUpdater::new().update(&mut traj.get_track_state_mut(i));
        assert_eq!(result, Err(KalmanFitterError::MissingComponent));
    }

    /// Random symmetric positive definite matrix `A Aᵀ + δ I`.
    fn spd6(entries: &[f64]) -> BoundMatrix {
        let a = BoundMatrix::from_column_slice(entries);
        a * a.transpose() + BoundMatrix::identity() * 0.1
    }

    proptest! {
        #[test]
        fn prop_filtered_covariance_is_symmetric_psd(
            entries in proptest::collection::vec(-1.0f64..1.0, 36),
            var0 in 0.001f64..1.0,
            var1 in 0.001f64..1.0,
            m0 in -1.0f64..1.0,
            m1 in -1.0f64..1.0,
        ) {
            let c = spd6(&entries);
            let mut x = BoundVector::zeros();
            x[E_BOUND_THETA] = 1.0;
            x[4] = 0.5;
            let v = Matrix2::new(var0, 0.0, 0.0, var1);

            let up = kalman_update::<2>(&x, &c, &loc_subspace(), &Vector2::new(m0, m1), &v).unwrap();
            let cf = up.filtered_covariance;

            let asymmetry = (cf - cf.transpose()).abs().max();
            prop_assert!(asymmetry < 1e-9 * (1.0 + c.abs().max()));

            let sym = (cf + cf.transpose()) * 0.5;
            let min_eigen = sym.symmetric_eigenvalues().min();
            prop_assert!(min_eigen > -1e-9 * (1.0 + c.abs().max()));
            prop_assert!(up.chi2 >= -1e-12);
        }
    }
}
