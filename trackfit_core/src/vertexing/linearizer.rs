//! Track linearization around a vertex candidate.
//!
//! Near the linearization point `V0` the perigee parameters of a track are
//! modelled as a linear function of the vertex position `V` and the
//! momentum `q = (phi, theta, q/p)` at the vertex:
//!
//! ```text
//! p(V, q) ≈ c + A·V + B·q
//! ```
//!
//! `A` (position jacobian) and `B` (momentum jacobian) are obtained by
//! central differences of the perigee transport.

use nalgebra::{Matrix6x3, Matrix6x4, SVector, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use tracing::trace;
use trackfit_env::{GeometryContext, MagneticFieldContext};

use super::error::VertexingError;
use super::perigee::{numerical_jacobian, point_of_closest_approach, PerigeeTransport, TrackPoint};
use crate::track_parameters::{
    BoundMatrix, BoundTrackParameters, BoundVector, E_BOUND_PHI, E_BOUND_QOVERP, E_BOUND_THETA,
    E_BOUND_TIME,
};

/// Linear expansion of a track around a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearizedTrack {
    /// Perigee parameters with respect to the linearization point
    pub parameters_at_pca: BoundVector,

    pub covariance_at_pca: BoundMatrix,

    pub linearization_point: Vector4<f64>,

    /// d(parameters) / d(x, y, z, t)
    pub position_jacobian: Matrix6x4<f64>,

    /// d(parameters) / d(phi, theta, q/p)
    pub momentum_jacobian: Matrix6x3<f64>,

    /// Global point of closest approach and its time
    pub position_at_pca: Vector4<f64>,

    /// (phi, theta, q/p) at the point of closest approach
    pub momentum_at_pca: Vector3<f64>,

    /// `parameters_at_pca - A·position_at_pca - B·momentum_at_pca`
    pub constant_term: BoundVector,
}

/// Produces [`LinearizedTrack`]s.
pub trait TrackLinearizer: Send + Sync {
    fn linearize_track(
        &self,
        params: &BoundTrackParameters,
        linearization_point: &Vector4<f64>,
        gctx: &GeometryContext,
        mctx: &MagneticFieldContext,
    ) -> Result<LinearizedTrack, VertexingError>;
}

/// Linearizer using finite differences of the helix transport.
#[derive(Debug, Clone)]
pub struct NumericalTrackLinearizer {
    transport: PerigeeTransport,

    /// Relative finite-difference step
    pub delta: f64,
}

impl NumericalTrackLinearizer {
    pub fn new(transport: PerigeeTransport) -> Self {
        Self {
            transport,
            delta: 1e-7,
        }
    }

    pub fn transport(&self) -> &PerigeeTransport {
        &self.transport
    }
}

impl TrackLinearizer for NumericalTrackLinearizer {
    fn linearize_track(
        &self,
        params: &BoundTrackParameters,
        linearization_point: &Vector4<f64>,
        gctx: &GeometryContext,
        mctx: &MagneticFieldContext,
    ) -> Result<LinearizedTrack, VertexingError> {
        if params.covariance().is_none() {
            return Err(VertexingError::NoCovariance);
        }
        let reference = linearization_point.xyz();
        let hypothesis = params.particle_hypothesis();

        let perigee = self.transport.to_perigee(gctx, mctx, params, &reference)?;
        let parameters_at_pca = *perigee.parameters();
        let covariance_at_pca = perigee
            .covariance()
            .copied()
            .ok_or(VertexingError::NoCovariance)?;

        let pca = point_of_closest_approach(&reference, &parameters_at_pca);
        let position_at_pca = Vector4::new(pca.x, pca.y, pca.z, parameters_at_pca[E_BOUND_TIME]);
        let momentum_at_pca = Vector3::new(
            parameters_at_pca[E_BOUND_PHI],
            parameters_at_pca[E_BOUND_THETA],
            parameters_at_pca[E_BOUND_QOVERP],
        );

        let evaluate = |position: &Vector4<f64>, momentum: &Vector3<f64>| {
            let point = TrackPoint {
                position: position.xyz(),
                time: position.w,
                phi: momentum.x,
                theta: momentum.y,
                qop: momentum.z,
            };
            self.transport
                .perigee_parameters(mctx, &point, &reference, &hypothesis)
        };

        let position_jacobian = numerical_jacobian(
            |v: &SVector<f64, 4>| evaluate(v, &momentum_at_pca),
            &position_at_pca,
            self.delta,
        )?;
        let momentum_jacobian = numerical_jacobian(
            |q: &SVector<f64, 3>| evaluate(&position_at_pca, q),
            &momentum_at_pca,
            self.delta,
        )?;

        let constant_term = parameters_at_pca
            - position_jacobian * position_at_pca
            - momentum_jacobian * momentum_at_pca;
        trace!("Position jacobian:\n{}", position_jacobian);
        trace!("Momentum jacobian:\n{}", momentum_jacobian);

        Ok(LinearizedTrack {
            parameters_at_pca,
            covariance_at_pca,
            linearization_point: *linearization_point,
            position_jacobian,
            momentum_jacobian,
            position_at_pca,
            momentum_at_pca,
            constant_term,
        })
    }
}
