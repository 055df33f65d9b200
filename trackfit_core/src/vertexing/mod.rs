//! Vertex reconstruction
//!
//! - **Linearization**: tracks expanded around a vertex candidate
//!   ([`NumericalTrackLinearizer`])
//! - **Kalman vertex update**: adding/removing a weighted track
//!   ([`update_vertex_with_track`]) and track smoothing
//!   ([`update_track_with_vertex`])
//! - **Fitting**: sequential single-vertex fit ([`KalmanVertexFitter`]) and
//!   the adaptive multi-vertex fit with annealed track weights
//!   ([`AdaptiveMultiVertexFitter`])
//! - **Finding**: Z-scan and track density grid seeding, and the iterative
//!   adaptive multi-vertex finder ([`AdaptiveMultiVertexFinder`])

mod error;
mod vertex;

pub mod amv_finder;
pub mod amv_fitter;
pub mod annealing;
pub mod fsmw;
pub mod grid_density;
pub mod impact_point;
pub mod kalman_vertex_fitter;
pub mod kalman_vertex_track_updater;
pub mod kalman_vertex_updater;
pub mod linearizer;
pub mod perigee;
pub mod zscan;

pub use amv_finder::{AdaptiveMultiVertexFinder, AmvFinderConfig, ParameterExtractor};
pub use amv_fitter::{
    AdaptiveMultiVertexFitter, AmvFitReport, AmvFitterConfig, AmvFitterState, VertexId, VertexInfo,
};
pub use annealing::{AnnealingConfig, AnnealingState, AnnealingUtility};
pub use error::VertexingError;
pub use fsmw::{FsmwConfig, FsmwMode1dFinder};
pub use grid_density::{
    AdaptiveGridTrackDensity, DensityMap, GridDensityConfig, GridDensityFinderConfig,
    GridDensityVertexFinder,
};
pub use impact_point::{ImpactParametersAndSigma, ImpactPointEstimator, ImpactPointEstimatorConfig};
pub use kalman_vertex_fitter::{KalmanVertexFitter, KalmanVertexFitterConfig};
pub use kalman_vertex_track_updater::update_track_with_vertex;
pub use kalman_vertex_updater::{
    calculate_update, constraint_chi2, track_chi2_at_vertex, update_vertex_with_track,
    VertexUpdateCache,
};
pub use linearizer::{LinearizedTrack, NumericalTrackLinearizer, TrackLinearizer};
pub use perigee::{point_of_closest_approach, PerigeeTransport, TrackPoint};
pub use vertex::{FitQuality, TrackAtVertex, Vertex, VertexingOptions};
pub use zscan::{VertexSeedFinder, ZScanConfig, ZScanVertexFinder};
