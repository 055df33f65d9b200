//! The Kalman track fitter
//!
//! Drives a single track through the detector:
//! 1. Navigation: ask the navigator for the next surface ahead
//! 2. Prediction: transport the current estimate onto it
//! 3. Update: combine with the measurement on that surface, if any
//! 4. Smoothing: run the MBF smoother from the last state backwards
//!
//! Every crossed surface after the first measurement becomes a track state
//! in the caller's [`MultiTrajectory`]; surfaces without a measurement are
//! recorded as holes, measurements failing the chi2 cut as outliers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};
use trackfit_env::{GeometryContext, GeometryError, GeometryIdentifier, Navigator, SurfaceHandle};

use crate::gain_matrix::GainMatrixUpdater;
use crate::mbf_smoother::MbfSmoother;
use crate::measurement::Measurement;
use crate::multi_trajectory::{
    MultiTrajectory, TrackIndex, TrackStatePropMask, TrajectoryState,
};
use crate::propagator::{PropagationResult, Propagator};
use crate::track_parameters::{BoundMatrix, BoundTrackParameters};
use crate::track_state_type::{TrackStateFlag, TrackStateType};

// ============================================================================
// ERRORS
// ============================================================================

/// Failures of the track fit and its update/smoothing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KalmanFitterError {
    #[error("Kalman update failed")]
    UpdateFailed,

    #[error("Kalman smooth failed")]
    SmoothFailed,

    #[error("Kalman output conversion failed")]
    OutputConversionFailed,

    #[error("No measurement detected during the propagation")]
    NoMeasurementFound,

    #[error("Reverse navigation failed")]
    ReverseNavigationFailed,

    #[error("Encountered non-invertible matrix")]
    SingularMatrix,

    #[error("Track state is missing a required component")]
    MissingComponent,

    #[error("Start parameters have no covariance")]
    NoCovariance,

    #[error("Propagation to the next surface failed")]
    PropagationFailed,
}

impl KalmanFitterError {
    pub fn code(&self) -> i32 {
        match self {
            Self::UpdateFailed => 1,
            Self::SmoothFailed => 2,
            Self::OutputConversionFailed => 3,
            Self::NoMeasurementFound => 4,
            Self::ReverseNavigationFailed => 5,
            Self::SingularMatrix => 6,
            Self::MissingComponent => 7,
            Self::NoCovariance => 8,
            Self::PropagationFailed => 9,
        }
    }
}

impl From<GeometryError> for KalmanFitterError {
    fn from(_: GeometryError) -> Self {
        Self::PropagationFailed
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`KalmanFitter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanFitterConfig {
    /// Chi2 above which a measurement is flagged as outlier (default: no cut)
    pub outlier_chi2_cut: Option<f64>,

    /// Run the MBF smoother after filtering (default: true)
    pub smoothing: bool,

    /// Record surfaces without measurement as holes (default: true)
    pub record_holes: bool,

    /// Upper bound on crossed surfaces (default: 1000)
    pub max_surfaces: usize,
}

impl Default for KalmanFitterConfig {
    fn default() -> Self {
        Self {
            outlier_chi2_cut: None,
            smoothing: true,
            record_holes: true,
            max_surfaces: 1000,
        }
    }
}

// ============================================================================
// RESULT
// ============================================================================

/// Outcome of a successful fit.
#[derive(Debug, Clone)]
pub struct KalmanFitResult {
    /// Last state of the trajectory (measurement or outlier)
    pub tip: TrackIndex,

    /// Last state that entered the fit as a measurement
    pub last_measurement_index: TrackIndex,

    pub summary: TrajectoryState,

    /// Best estimate at the first state of the trajectory
    pub fitted_parameters: BoundTrackParameters,
}

// ============================================================================
// FITTER
// ============================================================================

/// Kalman fitter over a navigator and propagator.
pub struct KalmanFitter<P, N> {
    propagator: P,
    navigator: N,
    updater: GainMatrixUpdater,
    smoother: MbfSmoother,
    config: KalmanFitterConfig,
}

/// A crossed surface without measurement, written once a later measurement
/// confirms the track continues.
struct PendingHole {
    surface: SurfaceHandle,
    prediction: PropagationResult,
    path_length: f64,
}

impl<P: Propagator, N: Navigator> KalmanFitter<P, N> {
    pub fn new(propagator: P, navigator: N, config: KalmanFitterConfig) -> Self {
        Self {
            propagator,
            navigator,
            updater: GainMatrixUpdater::new(),
            smoother: MbfSmoother::new(),
            config,
        }
    }

    pub fn config(&self) -> &KalmanFitterConfig {
        &self.config
    }

    /// Fits `measurements` starting from `start`.
    ///
    /// # Arguments
    /// * `gctx` - Geometry conditions
    /// * `start` - Initial estimate; must carry a covariance
    /// * `measurements` - At most one measurement per surface, matched by
    ///   the geometry id of their source link
    /// * `traj` - Store receiving the track states
    pub fn fit(
        &self,
        gctx: &GeometryContext,
        start: &BoundTrackParameters,
        measurements: &[Measurement],
        traj: &mut MultiTrajectory,
    ) -> Result<KalmanFitResult, KalmanFitterError> {
        if start.covariance().is_none() {
            return Err(KalmanFitterError::NoCovariance);
        }
        let by_surface: HashMap<GeometryIdentifier, &Measurement> = measurements
            .iter()
            .map(|m| (m.source_link().geometry_id, m))
            .collect();

        let mut current = start.clone();
        let mut current_id = Some(start.reference_surface().geometry_id());
        let mut accumulated_jacobian = BoundMatrix::identity();
        let mut path_length = 0.0;
        let mut pending_holes: Vec<PendingHole> = Vec::new();
        let mut tip = MultiTrajectory::INVALID;
        let mut last_measurement = MultiTrajectory::INVALID;

        for _ in 0..self.config.max_surfaces {
            let position = current.position(gctx);
            let direction = current.direction();
            let Some((surface, _)) =
                self.navigator
                    .next_surface(gctx, &position, &direction, current_id)
            else {
                break;
            };
            let surface_id = surface.geometry_id();
            current_id = Some(surface_id);

            let mut prediction = self.propagator.propagate(gctx, &current, &surface)?;
            path_length += prediction.path_length;
            prediction.jacobian *= accumulated_jacobian;
            trace!("Predicted on {}: {}", surface_id, prediction.parameters.parameters().transpose());

            let Some(measurement) = by_surface.get(&surface_id) else {
                current = prediction.parameters.clone();
                if self.config.record_holes && tip != MultiTrajectory::INVALID {
                    pending_holes.push(PendingHole {
                        surface,
                        prediction,
                        path_length,
                    });
                    accumulated_jacobian = BoundMatrix::identity();
                } else {
                    accumulated_jacobian = prediction.jacobian;
                }
                continue;
            };

            for hole in pending_holes.drain(..) {
                tip = Self::add_hole(traj, tip, hole);
            }

            let index = self.add_measurement_state(traj, tip, &surface, &prediction, measurement, path_length)?;
            tip = index;
            accumulated_jacobian = BoundMatrix::identity();

            let ts = traj.get_track_state(index);
            if ts.type_flags().is_measurement() {
                last_measurement = index;
            }
            current = BoundTrackParameters::new(
                surface.clone(),
                *ts.filtered(),
                Some(*ts.filtered_covariance()),
                start.particle_hypothesis(),
            );
        }

        if last_measurement == MultiTrajectory::INVALID {
            return Err(KalmanFitterError::NoMeasurementFound);
        }

        if self.config.smoothing {
            self.smoother.smooth(traj, tip)?;
        }

        let summary = traj.trajectory_state(tip);
        debug!(
            "Fitted track: {} states, {} measurements, {} holes, {} outliers, chi2 {:.3}",
            summary.n_states, summary.n_measurements, summary.n_holes, summary.n_outliers, summary.chi2_sum
        );

        let first = traj.trajectory_indices(tip)[0];
        let first_state = traj.get_track_state(first);
        let surface = first_state
            .reference_surface()
            .ok_or(KalmanFitterError::OutputConversionFailed)?
            .clone();
        let fitted_parameters = BoundTrackParameters::new(
            surface,
            *first_state.parameters(),
            Some(*first_state.covariance()),
            start.particle_hypothesis(),
        );

        Ok(KalmanFitResult {
            tip,
            last_measurement_index: last_measurement,
            summary,
            fitted_parameters,
        })
    }

    fn add_hole(traj: &mut MultiTrajectory, previous: TrackIndex, hole: PendingHole) -> TrackIndex {
        let mask = TrackStatePropMask::PREDICTED
            | TrackStatePropMask::FILTERED
            | TrackStatePropMask::JACOBIAN;
        let index = traj.add_track_state(mask, previous);
        let params = *hole.prediction.parameters.parameters();
        let cov = hole
            .prediction
            .parameters
            .covariance()
            .copied()
            .unwrap_or_else(BoundMatrix::zeros);

        let mut ts = traj.get_track_state_mut(index);
        *ts.predicted_mut() = params;
        *ts.predicted_covariance_mut() = cov;
        *ts.filtered_mut() = params;
        *ts.filtered_covariance_mut() = cov;
        *ts.jacobian_mut() = hole.prediction.jacobian;
        *ts.path_length_mut() = hole.path_length;
        ts.set_reference_surface(hole.surface);
        *ts.type_flags_mut() = TrackStateType::new()
            .with(TrackStateFlag::Hole)
            .with(TrackStateFlag::Parameter);
        index
    }

    fn add_measurement_state(
        &self,
        traj: &mut MultiTrajectory,
        previous: TrackIndex,
        surface: &SurfaceHandle,
        prediction: &PropagationResult,
        measurement: &Measurement,
        path_length: f64,
    ) -> Result<TrackIndex, KalmanFitterError> {
        let mask = TrackStatePropMask::PREDICTED
            | TrackStatePropMask::FILTERED
            | TrackStatePropMask::JACOBIAN
            | TrackStatePropMask::CALIBRATED
            | TrackStatePropMask::SOURCE_LINK;
        let index = traj.add_track_state(mask, previous);
        let predicted_cov = prediction
            .parameters
            .covariance()
            .copied()
            .ok_or(KalmanFitterError::NoCovariance)?;

        let mut ts = traj.get_track_state_mut(index);
        *ts.predicted_mut() = *prediction.parameters.parameters();
        *ts.predicted_covariance_mut() = predicted_cov;
        *ts.jacobian_mut() = prediction.jacobian;
        *ts.path_length_mut() = path_length;
        ts.set_reference_surface(surface.clone());
        ts.set_calibrated(measurement);

        self.updater.update(&mut ts)?;

        let outlier = self
            .config
            .outlier_chi2_cut
            .is_some_and(|cut| ts.chi2() > cut);
        let mut flags = TrackStateType::new().with(TrackStateFlag::Parameter);
        if outlier {
            debug!("Measurement on {} is an outlier (chi2 {:.2})", surface.geometry_id(), ts.chi2());
            flags.set(TrackStateFlag::Outlier);
            let predicted = *ts.predicted();
            *ts.filtered_mut() = predicted;
            *ts.filtered_covariance_mut() = predicted_cov;
        } else {
            flags.set(TrackStateFlag::Measurement);
        }
        *ts.type_flags_mut() = flags;
        Ok(index)
    }
}
