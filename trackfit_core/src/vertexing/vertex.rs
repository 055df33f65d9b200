//! Vertex and track-at-vertex records.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use trackfit_env::{GeometryContext, MagneticFieldContext};

use super::linearizer::LinearizedTrack;
use crate::track_parameters::BoundTrackParameters;

/// Chi2 and (weighted, possibly negative) number of degrees of freedom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub chi2: f64,
    pub ndf: f64,
}

impl FitQuality {
    pub fn new(chi2: f64, ndf: f64) -> Self {
        Self { chi2, ndf }
    }
}

// ============================================================================
// TRACK AT VERTEX
// ============================================================================

/// One track's association with one vertex.
#[derive(Debug, Clone)]
pub struct TrackAtVertex {
    /// Index of the track in the caller's input collection
    pub track: usize,

    /// Parameters as handed to the vertexer
    pub original_params: BoundTrackParameters,

    /// Parameters refitted with the vertex constraint (after smoothing)
    pub fitted_params: BoundTrackParameters,

    /// Linearization around the current linearization point, if done
    pub linearized_state: Option<LinearizedTrack>,

    /// Weight in [0, 1] assigned by the adaptive fit
    pub track_weight: f64,

    /// Chi2 of the track with respect to the vertex
    pub chi2_track: f64,

    pub ndf: f64,

    /// Compatibility (chi2-like distance) used for the annealing weights
    pub vertex_compatibility: f64,
}

impl TrackAtVertex {
    pub fn new(track: usize, params: BoundTrackParameters) -> Self {
        Self {
            track,
            fitted_params: params.clone(),
            original_params: params,
            linearized_state: None,
            track_weight: 1.0,
            chi2_track: 0.0,
            ndf: 0.0,
            vertex_compatibility: 0.0,
        }
    }

    pub fn is_linearized(&self) -> bool {
        self.linearized_state.is_some()
    }
}

// ============================================================================
// VERTEX
// ============================================================================

/// Space-time vertex estimate.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// (x, y, z, t)
    pub position: Vector4<f64>,

    pub covariance: Matrix4<f64>,

    pub fit_quality: FitQuality,

    pub tracks: Vec<TrackAtVertex>,

    /// False if the fit producing this vertex stopped at its iteration cap
    pub converged: bool,
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vector4::zeros(),
            covariance: Matrix4::zeros(),
            fit_quality: FitQuality::default(),
            tracks: Vec::new(),
            converged: true,
        }
    }
}

impl Vertex {
    /// Vertex at `position` without covariance.
    pub fn new(position: Vector4<f64>) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn with_covariance(position: Vector4<f64>, covariance: Matrix4<f64>) -> Self {
        Self {
            position,
            covariance,
            ..Self::default()
        }
    }

    /// Spatial position.
    pub fn position3(&self) -> Vector3<f64> {
        self.position.xyz()
    }

    pub fn time(&self) -> f64 {
        self.position.w
    }

    /// Spatial block of the covariance.
    pub fn covariance3(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// True if no covariance has been set (all entries zero).
    pub fn has_zero_covariance(&self) -> bool {
        self.covariance.iter().all(|c| *c == 0.0)
    }
}

// ============================================================================
// OPTIONS
// ============================================================================

/// Per-event inputs shared by the vertexing algorithms.
#[derive(Debug, Clone, Default)]
pub struct VertexingOptions {
    pub geometry_context: GeometryContext,
    pub magnetic_field_context: MagneticFieldContext,

    /// Beam spot or other prior; its position also anchors the seeding
    pub constraint: Vertex,

    /// Use `constraint` as a prior in the fit (requires a covariance)
    pub use_constraint_in_fit: bool,
}

impl VertexingOptions {
    /// Options with a constraint used in the fit.
    pub fn with_constraint(constraint: Vertex) -> Self {
        Self {
            constraint,
            use_constraint_in_fit: true,
            ..Self::default()
        }
    }

    /// True if the constraint takes part in the fit.
    pub fn constraint_in_fit(&self) -> bool {
        self.use_constraint_in_fit && !self.constraint.has_zero_covariance()
    }
}
