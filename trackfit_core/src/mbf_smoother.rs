//! Modified Bryson-Frazier backward smoother.
//!
//! Runs from the tip of a filtered trajectory back to its first state and
//! carries the backward information `(Λ̂, λ̂)` instead of inverting filtered
//! covariances:
//!
//! ```text
//! smoothed     = x_f - C_f λ̂
//! smoothed cov = C_f - C_f Λ̂ C_f
//! ```
//!
//! A measurement state folds its innovation into the information, any other
//! state passes it through unchanged. The information is then transported to
//! the parent with the jacobian stored on the current state, `F`:
//! `Λ̂ ← Fᵀ Λ̃ F`, `λ̂ ← Fᵀ λ̃`.

use nalgebra::SMatrix;
use tracing::{debug, trace};

use crate::kalman_fitter::KalmanFitterError;
use crate::measurement::{measurement_residual, visit_measurement_size, MeasurementSizeVisitor};
use crate::multi_trajectory::{MultiTrajectory, TrackIndex, TrackStatePropMask};
use crate::track_parameters::{BoundMatrix, BoundVector};
use crate::track_state::TrackStateProxy;

/// Backward information propagated between track states.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BackwardInformation {
    big_lambda: BoundMatrix,
    small_lambda: BoundVector,
}

/// MBF smoother over a [`MultiTrajectory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MbfSmoother;

impl MbfSmoother {
    pub fn new() -> Self {
        Self
    }

    /// Smooths the trajectory ending at `entry`.
    ///
    /// A trajectory of a single state is left untouched: it has no
    /// smoothed component afterwards.
    ///
    /// # Errors
    /// [`KalmanFitterError::MissingComponent`] if a state lacks its filtered
    /// parameters or jacobian, or a measurement state lacks its predicted or
    /// calibrated components. [`KalmanFitterError::SingularMatrix`] if a
    /// residual covariance cannot be inverted.
    pub fn smooth(&self, traj: &mut MultiTrajectory, entry: TrackIndex) -> Result<(), KalmanFitterError> {
        if !traj.get_track_state(entry).has_previous() {
            debug!("Track state {} has no parent, nothing to smooth", entry);
            return Ok(());
        }

        let mut info = BackwardInformation {
            big_lambda: BoundMatrix::zeros(),
            small_lambda: BoundVector::zeros(),
        };

        traj.try_apply_backwards(entry, |mut ts| {
            if !ts.has_filtered() {
                return Err(KalmanFitterError::MissingComponent);
            }
            ts.add_components(TrackStatePropMask::SMOOTHED);

            let filtered = *ts.filtered();
            let filtered_cov = *ts.filtered_covariance();
            *ts.smoothed_mut() = filtered - filtered_cov * info.small_lambda;
            *ts.smoothed_covariance_mut() =
                filtered_cov - filtered_cov * info.big_lambda * filtered_cov;
            trace!("Smoothed parameters of state {}: {}", ts.index(), ts.smoothed().transpose());

            // The first state of the trajectory ends the pass
            if !ts.has_previous() {
                return Ok(false);
            }

            let tilde = if ts.type_flags().is_measurement() {
                if !(ts.has_predicted() && ts.has_calibrated()) {
                    return Err(KalmanFitterError::MissingComponent);
                }
                visit_measurement_size(
                    ts.calibrated_size(),
                    MeasurementInformation {
                        state: ts.as_const(),
                        hat: &info,
                    },
                )?
            } else {
                info
            };

            if !ts.has_jacobian() {
                return Err(KalmanFitterError::MissingComponent);
            }
            let f = ts.jacobian();
            info = BackwardInformation {
                big_lambda: f.transpose() * tilde.big_lambda * f,
                small_lambda: f.transpose() * tilde.small_lambda,
            };
            Ok(true)
        })
    }
}

/// Folds the measurement of one state into the backward information.
struct MeasurementInformation<'p, 'a> {
    state: TrackStateProxy<'a>,
    hat: &'p BackwardInformation,
}

impl MeasurementSizeVisitor for MeasurementInformation<'_, '_> {
    type Output = Result<BackwardInformation, KalmanFitterError>;

    fn visit<const M: usize>(self) -> Self::Output {
        let ts = self.state;
        let h = ts.projector::<M>();
        let predicted_cov = ts.predicted_covariance();

        let s = h * predicted_cov * h.transpose() + ts.calibrated_covariance::<M>();
        let s_inv: SMatrix<f64, M, M> = s.try_inverse().ok_or(KalmanFitterError::SingularMatrix)?;
        let gain = predicted_cov * h.transpose() * s_inv;
        let c_hat = BoundMatrix::identity() - gain * h;
        let y = measurement_residual(&ts.projector_subspace(), &ts.calibrated::<M>(), ts.predicted());

        Ok(BackwardInformation {
            big_lambda: h.transpose() * s_inv * h + c_hat.transpose() * self.hat.big_lambda * c_hat,
            small_lambda: -h.transpose() * s_inv * y + c_hat.transpose() * self.hat.small_lambda,
        })
    }
}
