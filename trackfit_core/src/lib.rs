//! Trackfit Core - Track Fitting and Vertex Reconstruction
//!
//! The fitting side keeps every candidate trajectory of an event in one
//! arena, the [`MultiTrajectory`]:
//! 1. **Kalman filter**: gain-matrix update of predicted states with their
//!    measurements ([`GainMatrixUpdater`])
//! 2. **Smoother**: modified Bryson-Frazier backward pass producing smoothed
//!    states without covariance inversions ([`MbfSmoother`])
//! 3. **Driver**: [`KalmanFitter`] walks a track through the surfaces given
//!    by a navigator, recording measurements, outliers and holes
//!
//! The [`vertexing`] module fits and finds vertices from the fitted tracks.
//!
//! Units: mm, GeV, ns-scaled mm for time, see [`units`].

pub mod gain_matrix;
pub mod kalman_fitter;
pub mod mbf_smoother;
pub mod measurement;
pub mod multi_trajectory;
pub mod propagator;
pub mod track_parameters;
pub mod track_state;
pub mod track_state_type;
pub mod units;
pub mod vertexing;

// Re-export key types for convenience
pub use gain_matrix::{kalman_update, GainMatrixUpdater, KalmanUpdate};
pub use kalman_fitter::{KalmanFitResult, KalmanFitter, KalmanFitterConfig, KalmanFitterError};
pub use mbf_smoother::MbfSmoother;
pub use measurement::{Measurement, MeasurementError, SourceLink, SubspaceIndices};
pub use multi_trajectory::{MultiTrajectory, TrackIndex, TrackStatePropMask, TrajectoryState};
pub use propagator::{PropagationResult, Propagator, StraightLinePropagator};
pub use track_parameters::{BoundMatrix, BoundTrackParameters, BoundVector, ParticleHypothesis};
pub use track_state::{TrackStateProxy, TrackStateProxyMut};
pub use track_state_type::{TrackStateFlag, TrackStateType};
pub use vertexing::VertexingError;
