//! Analytic transport of track parameters onto a perigee surface.
//!
//! In a constant solenoidal field a track is a helix whose transverse
//! projection is a circle. The perigee with respect to a reference point is
//! the point of that circle closest to the reference in the transverse plane:
//!
//! ```text
//! rho    = sin(theta) / (q/p · Bz)               signed radius
//! center = pos + rho · (sin phi, -cos phi)
//! phi'   = direction at the point of closest approach
//! s_T    = rho · (phi - phi')                     transverse arc length
//! d0     = (pca - ref) · (-sin phi', cos phi')
//! z0     = z + s_T · cot(theta) - z_ref
//! ```
//!
//! Without field, or for negligible curvature, the straight line is used.

use nalgebra::{SMatrix, SVector, Vector2, Vector3};
use std::sync::Arc;
use trackfit_env::{ConstantBField, GeometryContext, MagneticFieldContext, MagneticFieldProvider, SurfaceHandle};

use super::error::VertexingError;
use crate::track_parameters::{
    bound_to_free_vector, phi_theta_from_direction, radian_sym, subtract_bound_parameters,
    BoundTrackParameters, BoundVector, ParticleHypothesis, E_BOUND_LOC0, E_BOUND_LOC1, E_BOUND_PHI,
    E_BOUND_QOVERP, E_BOUND_SIZE, E_BOUND_THETA, E_BOUND_TIME, E_FREE_DIR0, E_FREE_POS0,
    E_FREE_QOVERP, E_FREE_TIME,
};

/// A point on a trajectory together with the momentum there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub position: Vector3<f64>,
    pub time: f64,
    pub phi: f64,
    pub theta: f64,
    pub qop: f64,
}

impl TrackPoint {
    /// Global point described by bound parameters on `surface`.
    pub fn from_bound(gctx: &GeometryContext, surface: &SurfaceHandle, bound: &BoundVector) -> Self {
        let free = bound_to_free_vector(gctx, surface, bound);
        let direction = free.fixed_rows::<3>(E_FREE_DIR0).into_owned();
        let (phi, theta) = phi_theta_from_direction(&direction);
        Self {
            position: free.fixed_rows::<3>(E_FREE_POS0).into_owned(),
            time: free[E_FREE_TIME],
            phi,
            theta,
            qop: free[E_FREE_QOVERP],
        }
    }
}

/// Global point of closest approach encoded by perigee parameters.
pub fn point_of_closest_approach(reference: &Vector3<f64>, perigee: &BoundVector) -> Vector3<f64> {
    let (sin_phi, cos_phi) = perigee[E_BOUND_PHI].sin_cos();
    reference
        + perigee[E_BOUND_LOC0] * Vector3::new(-sin_phi, cos_phi, 0.0)
        + perigee[E_BOUND_LOC1] * Vector3::z()
}

/// Velocity in units of c, 1 for infinite momentum.
pub(crate) fn velocity(hypothesis: &ParticleHypothesis, qop: f64) -> f64 {
    let momentum = hypothesis.extract_momentum(qop);
    if momentum.is_finite() {
        hypothesis.beta(momentum)
    } else {
        1.0
    }
}

/// Central-difference jacobian of a map into bound parameters.
///
/// Output differences are taken with phi wrapping.
pub(crate) fn numerical_jacobian<const N: usize, F>(
    f: F,
    x: &SVector<f64, N>,
    relative_step: f64,
) -> Result<SMatrix<f64, E_BOUND_SIZE, N>, VertexingError>
where
    F: Fn(&SVector<f64, N>) -> Result<BoundVector, VertexingError>,
{
    let mut jacobian = SMatrix::<f64, E_BOUND_SIZE, N>::zeros();
    for j in 0..N {
        let h = relative_step * x[j].abs().max(1.0);
        let mut up = *x;
        let mut down = *x;
        up[j] += h;
        down[j] -= h;
        let column = subtract_bound_parameters(&f(&up)?, &f(&down)?) / (2.0 * h);
        jacobian.set_column(j, &column);
    }
    if jacobian.iter().any(|v| !v.is_finite()) {
        return Err(VertexingError::NumericFailure);
    }
    Ok(jacobian)
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Re-expresses track parameters at the perigee of a reference point.
#[derive(Clone)]
pub struct PerigeeTransport {
    field: Arc<dyn MagneticFieldProvider>,

    /// Below this |q/p| the track is treated as a straight line (1/GeV)
    pub min_qop: f64,

    /// Relative finite-difference step for covariance transport
    pub jacobian_step: f64,
}

impl std::fmt::Debug for PerigeeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerigeeTransport")
            .field("min_qop", &self.min_qop)
            .field("jacobian_step", &self.jacobian_step)
            .finish_non_exhaustive()
    }
}

impl PerigeeTransport {
    pub fn new(field: Arc<dyn MagneticFieldProvider>) -> Self {
        Self {
            field,
            min_qop: 1e-6,
            jacobian_step: 1e-7,
        }
    }

    /// Transport for a field-free setup.
    pub fn straight_line() -> Self {
        Self::new(Arc::new(ConstantBField::zero()))
    }

    pub fn field(&self) -> &Arc<dyn MagneticFieldProvider> {
        &self.field
    }

    /// Perigee parameters of `point` with respect to `reference`.
    ///
    /// # Errors
    /// [`VertexingError::NumericFailure`] if the direction is parallel to the
    /// beam axis or the reference coincides with the helix center.
    pub fn perigee_parameters(
        &self,
        mctx: &MagneticFieldContext,
        point: &TrackPoint,
        reference: &Vector3<f64>,
        hypothesis: &ParticleHypothesis,
    ) -> Result<BoundVector, VertexingError> {
        let (sin_theta, cos_theta) = point.theta.sin_cos();
        if sin_theta.abs() < 1e-9 {
            return Err(VertexingError::NumericFailure);
        }
        let (sin_phi, cos_phi) = point.phi.sin_cos();
        let position = point.position.xy();
        let reference_xy = reference.xy();

        let bz = self.field.field_at(mctx, &point.position).z;
        let straight = bz == 0.0 || hypothesis.abs_charge == 0.0 || point.qop.abs() < self.min_qop;

        let (pca, phi_pca, transverse_path) = if straight {
            let direction = Vector2::new(cos_phi, sin_phi);
            let s = (reference_xy - position).dot(&direction);
            (position + s * direction, point.phi, s)
        } else {
            let rho = sin_theta / (point.qop * bz);
            let center = position + rho * Vector2::new(sin_phi, -cos_phi);
            let offset = reference_xy - center;
            let distance = offset.norm();
            if distance < 1e-12 {
                return Err(VertexingError::NumericFailure);
            }
            let u = offset / distance;
            let h = rho.signum();
            let phi_pca = (-h * u.x).atan2(h * u.y);
            let s = rho * radian_sym(point.phi - phi_pca);
            (center + rho.abs() * u, phi_pca, s)
        };

        let (sin_pca, cos_pca) = phi_pca.sin_cos();
        let d0 = (pca - reference_xy).dot(&Vector2::new(-sin_pca, cos_pca));
        let z0 = point.position.z + transverse_path * cos_theta / sin_theta - reference.z;
        let path = transverse_path / sin_theta;
        let time = point.time + path / velocity(hypothesis, point.qop);

        let mut perigee = BoundVector::zeros();
        perigee[E_BOUND_LOC0] = d0;
        perigee[E_BOUND_LOC1] = z0;
        perigee[E_BOUND_PHI] = phi_pca;
        perigee[E_BOUND_THETA] = point.theta;
        perigee[E_BOUND_QOVERP] = point.qop;
        perigee[E_BOUND_TIME] = time;
        Ok(perigee)
    }

    /// Expresses `params` on the perigee surface of `reference`.
    ///
    /// The covariance, if present, is transported with the numerical
    /// jacobian of the map.
    pub fn to_perigee(
        &self,
        gctx: &GeometryContext,
        mctx: &MagneticFieldContext,
        params: &BoundTrackParameters,
        reference: &Vector3<f64>,
    ) -> Result<BoundTrackParameters, VertexingError> {
        let hypothesis = params.particle_hypothesis();
        let surface = params.reference_surface();
        let map = |bound: &BoundVector| {
            let point = TrackPoint::from_bound(gctx, surface, bound);
            self.perigee_parameters(mctx, &point, reference, &hypothesis)
        };

        let perigee = map(params.parameters())?;
        let covariance = match params.covariance() {
            Some(cov) => {
                let jacobian = numerical_jacobian(map, params.parameters(), self.jacobian_step)?;
                Some(jacobian * cov * jacobian.transpose())
            }
            None => None,
        };
        Ok(BoundTrackParameters::perigee(*reference, perigee, covariance, hypothesis))
    }
}
