//! Impact parameters of tracks with respect to vertices.
//!
//! - **Transverse/longitudinal IP**: d0 and z0 of the perigee at the vertex,
//!   with the vertex extent folded into their uncertainties
//! - **3D IP**: parameters on the plane through the 3D point of closest
//!   approach, normal to the track direction there
//! - **Compatibility**: chi2 distance of a vertex from the track in that plane

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use trackfit_env::{GeometryContext, GeometryIdentifier, MagneticFieldContext, PlaneSurface};

use super::error::VertexingError;
use super::perigee::{point_of_closest_approach, velocity, PerigeeTransport};
use super::vertex::Vertex;
use crate::track_parameters::{
    make_direction_from_phi_theta, BoundMatrix, BoundTrackParameters, BoundVector, E_BOUND_LOC0,
    E_BOUND_LOC1, E_BOUND_PHI, E_BOUND_QOVERP, E_BOUND_THETA, E_BOUND_TIME,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`ImpactPointEstimator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactPointEstimatorConfig {
    /// Newton iterations refining the 3D point of closest approach (default: 20)
    pub max_iterations: usize,

    /// Path-length change below which the refinement stops (default: 1e-6 mm)
    pub precision: f64,
}

impl Default for ImpactPointEstimatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            precision: 1e-6,
        }
    }
}

/// Signed impact parameters and their uncertainties.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImpactParametersAndSigma {
    pub d0: f64,
    pub z0: f64,
    pub sigma_d0: f64,
    pub sigma_z0: f64,

    /// |t_vertex - t_track|, if requested
    pub delta_t: Option<f64>,
    pub sigma_delta_t: Option<f64>,
}

// ============================================================================
// ESTIMATOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImpactPointEstimator {
    transport: PerigeeTransport,
    config: ImpactPointEstimatorConfig,
}

impl ImpactPointEstimator {
    pub fn new(transport: PerigeeTransport, config: ImpactPointEstimatorConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &PerigeeTransport {
        &self.transport
    }

    /// Impact parameters of `params` at the perigee of `vertex`.
    ///
    /// # Arguments
    /// * `params` - Track parameters with covariance
    /// * `vertex` - Reference vertex; its covariance widens the sigmas
    /// * `calculate_time_ip` - Also compute the time residual
    pub fn impact_parameters_and_sigma(
        &self,
        gctx: &GeometryContext,
        mctx: &MagneticFieldContext,
        params: &BoundTrackParameters,
        vertex: &Vertex,
        calculate_time_ip: bool,
    ) -> Result<ImpactParametersAndSigma, VertexingError> {
        let perigee = self
            .transport
            .to_perigee(gctx, mctx, params, &vertex.position3())?;
        let p = perigee.parameters();
        let cov = perigee.covariance().ok_or(VertexingError::NoCovariance)?;

        let (sin_phi, cos_phi) = p[E_BOUND_PHI].sin_cos();
        let vtx_cov = &vertex.covariance;
        // Vertex extent projected on the d0 direction
        let vtx_var_d0 = (vtx_cov[(0, 0)] * sin_phi * sin_phi + vtx_cov[(1, 1)] * cos_phi * cos_phi
            - 2.0 * vtx_cov[(0, 1)] * sin_phi * cos_phi)
            .max(0.0);
        let vtx_var_z = vtx_cov[(2, 2)];

        let mut ip = ImpactParametersAndSigma {
            d0: p[E_BOUND_LOC0],
            z0: p[E_BOUND_LOC1],
            sigma_d0: (vtx_var_d0 + cov[(E_BOUND_LOC0, E_BOUND_LOC0)]).sqrt(),
            sigma_z0: (vtx_var_z + cov[(E_BOUND_LOC1, E_BOUND_LOC1)]).sqrt(),
            delta_t: None,
            sigma_delta_t: None,
        };
        if calculate_time_ip {
            ip.delta_t = Some((vertex.time() - p[E_BOUND_TIME]).abs());
            ip.sigma_delta_t = Some((vtx_cov[(3, 3)] + cov[(E_BOUND_TIME, E_BOUND_TIME)]).sqrt());
        }
        if !(ip.sigma_d0.is_finite() && ip.sigma_z0.is_finite()) {
            return Err(VertexingError::NumericFailure);
        }
        Ok(ip)
    }

    /// Parameters at the 3D point of closest approach to `point`.
    ///
    /// The result lives on a plane through the PCA whose normal is the
    /// track direction there, so `point` is displaced from the track only
    /// within the plane's local frame.
    pub fn estimate_3d_impact_parameters(
        &self,
        gctx: &GeometryContext,
        mctx: &MagneticFieldContext,
        params: &BoundTrackParameters,
        point: &Vector3<f64>,
    ) -> Result<BoundTrackParameters, VertexingError> {
        let perigee = self.transport.to_perigee(gctx, mctx, params, point)?;
        let p = *perigee.parameters();
        let perigee_cov = perigee.covariance().ok_or(VertexingError::NoCovariance)?;
        let hypothesis = params.particle_hypothesis();

        // Walk along the local tangent to the 3D closest approach
        let theta = p[E_BOUND_THETA];
        let mut phi = p[E_BOUND_PHI];
        let mut position = point_of_closest_approach(point, &p);
        let mut path = 0.0;
        let bz = self.transport.field().field_at(mctx, &position).z;
        let curvature = if bz == 0.0 || p[E_BOUND_QOVERP].abs() < self.transport.min_qop {
            0.0
        } else {
            p[E_BOUND_QOVERP] * bz
        };
        for _ in 0..self.config.max_iterations {
            let direction = make_direction_from_phi_theta(phi, theta);
            let step = (point - position).dot(&direction);
            if step.abs() < self.config.precision {
                break;
            }
            // Transverse motion on the circle, longitudinal motion linear
            let dphi = -curvature * step;
            let (s0, c0) = phi.sin_cos();
            let (s1, c1) = (phi + dphi).sin_cos();
            let transverse = step * theta.sin();
            let (dx, dy) = if dphi.abs() < 1e-12 {
                (transverse * c0, transverse * s0)
            } else {
                let rho = transverse / dphi;
                (rho * (s1 - s0), -rho * (c1 - c0))
            };
            position += Vector3::new(dx, dy, step * theta.cos());
            phi += dphi;
            path += step;
        }

        let direction = make_direction_from_phi_theta(phi, theta);
        let plane = PlaneSurface::new(position, direction, GeometryIdentifier::default()).into_handle();

        let mut vector = BoundVector::zeros();
        vector[E_BOUND_PHI] = phi;
        vector[E_BOUND_THETA] = theta;
        vector[E_BOUND_QOVERP] = p[E_BOUND_QOVERP];
        vector[E_BOUND_TIME] = p[E_BOUND_TIME] + path / velocity(&hypothesis, p[E_BOUND_QOVERP]);

        // d0 lies in the plane, z0 enters projected by sin(theta)
        let mut jacobian = BoundMatrix::identity();
        jacobian[(E_BOUND_LOC1, E_BOUND_LOC1)] = theta.sin();
        let covariance = jacobian * perigee_cov * jacobian.transpose();

        Ok(BoundTrackParameters::new(plane, vector, Some(covariance), hypothesis))
    }

    /// Chi2 distance of `vertex_position` from a track given at its 3D PCA.
    ///
    /// # Arguments
    /// * `params` - Output of [`Self::estimate_3d_impact_parameters`]
    /// * `vertex_position` - (x, y, z, t)
    /// * `use_time` - Include the time residual
    pub fn vertex_compatibility(
        &self,
        gctx: &GeometryContext,
        params: &BoundTrackParameters,
        vertex_position: &Vector4<f64>,
        use_time: bool,
    ) -> Result<f64, VertexingError> {
        let cov = params.covariance().ok_or(VertexingError::NoCovariance)?;
        let surface = params.reference_surface();
        let direction = params.direction();
        let center = surface.center(gctx);
        let x_axis = surface.local_to_global(gctx, &Vector2::x(), &direction) - center;
        let y_axis = surface.local_to_global(gctx, &Vector2::y(), &direction) - center;

        let delta = vertex_position.xyz() - center;
        let residual = params.local_position() - Vector2::new(delta.dot(&x_axis), delta.dot(&y_axis));

        if use_time {
            let residual = Vector3::new(residual.x, residual.y, params.time() - vertex_position.w);
            let idx = [E_BOUND_LOC0, E_BOUND_LOC1, E_BOUND_TIME];
            let block = Matrix3::from_fn(|i, j| cov[(idx[i], idx[j])]);
            let weight = block.try_inverse().ok_or(VertexingError::SingularMatrix)?;
            Ok(residual.dot(&(weight * residual)))
        } else {
            let block: Matrix2<f64> = cov.fixed_view::<2, 2>(0, 0).into_owned();
            let weight = block.try_inverse().ok_or(VertexingError::SingularMatrix)?;
            Ok(residual.dot(&(weight * residual)))
        }
    }
}
