//! Track parameter primitives
//!
//! Fixed-size vectors and matrices for the two parametrizations used
//! throughout the core:
//! - **Bound** (6): surface-local `(loc0, loc1, phi, theta, q/p, time)`
//! - **Free** (8): global `(x, y, z, time, dx, dy, dz, q/p)`
//!
//! plus the periodicity-aware arithmetic needed to add, subtract and
//! normalize bound vectors without tearing the direction at the phi/theta
//! boundaries.

use nalgebra::{SMatrix, SVector, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use trackfit_env::{GeometryContext, GeometryError, PerigeeSurface, SurfaceHandle};

use crate::units::PION_MASS;

// ============================================================================
// INDICES & ALIASES
// ============================================================================

pub const E_BOUND_LOC0: usize = 0;
pub const E_BOUND_LOC1: usize = 1;
pub const E_BOUND_PHI: usize = 2;
pub const E_BOUND_THETA: usize = 3;
pub const E_BOUND_QOVERP: usize = 4;
pub const E_BOUND_TIME: usize = 5;
pub const E_BOUND_SIZE: usize = 6;

pub const E_FREE_POS0: usize = 0;
pub const E_FREE_POS1: usize = 1;
pub const E_FREE_POS2: usize = 2;
pub const E_FREE_TIME: usize = 3;
pub const E_FREE_DIR0: usize = 4;
pub const E_FREE_DIR1: usize = 5;
pub const E_FREE_DIR2: usize = 6;
pub const E_FREE_QOVERP: usize = 7;
pub const E_FREE_SIZE: usize = 8;

pub type BoundVector = SVector<f64, E_BOUND_SIZE>;
pub type BoundMatrix = SMatrix<f64, E_BOUND_SIZE, E_BOUND_SIZE>;
pub type FreeVector = SVector<f64, E_FREE_SIZE>;
pub type FreeMatrix = SMatrix<f64, E_FREE_SIZE, E_FREE_SIZE>;
pub type BoundToFreeMatrix = SMatrix<f64, E_FREE_SIZE, E_BOUND_SIZE>;
pub type FreeToBoundMatrix = SMatrix<f64, E_BOUND_SIZE, E_FREE_SIZE>;

/// Default tolerance for [`is_bound_vector_valid`] / [`is_free_vector_valid`].
pub const DEFAULT_VALIDITY_EPSILON: f64 = 1e-6;

/// Default pseudorapidity cut for the validity checks (no cut).
pub const DEFAULT_MAX_ABS_ETA: f64 = f64::INFINITY;

// ============================================================================
// PERIODIC ARITHMETIC
// ============================================================================

/// Wraps `value` into `[start, start + range)`.
pub fn wrap_periodic(value: f64, start: f64, range: f64) -> f64 {
    let diff = value - start;
    if (0.0..range).contains(&diff) {
        value
    } else {
        value - range * (diff / range).floor()
    }
}

/// Wraps an angle into `[-pi, pi)`.
pub fn radian_sym(angle: f64) -> f64 {
    wrap_periodic(angle, -PI, 2.0 * PI)
}

/// Wraps an angle into `[0, 2pi)`.
pub fn radian_pos(angle: f64) -> f64 {
    wrap_periodic(angle, 0.0, 2.0 * PI)
}

/// Smallest signed difference `lhs - rhs` on a circle of circumference `range`.
pub fn difference_periodic(lhs: f64, rhs: f64, range: f64) -> f64 {
    let mut delta = (lhs - rhs) % range;
    if 2.0 * delta < -range {
        delta += range;
    } else if range <= 2.0 * delta {
        delta -= range;
    }
    delta
}

/// Jointly normalizes a direction: theta into `[0, pi]`, phi into `[-pi, pi)`.
///
/// A theta beyond pi describes the same direction as `2pi - theta` seen from
/// the opposite azimuth, so reflecting theta rotates phi by pi.
pub fn normalize_phi_theta(phi: f64, theta: f64) -> (f64, f64) {
    let mut phi = phi;
    let mut theta = radian_pos(theta);
    if theta > PI {
        theta = 2.0 * PI - theta;
        phi += PI;
    }
    (radian_sym(phi), theta)
}

/// Returns `v` with phi/theta jointly normalized.
pub fn normalize_bound_parameters(v: &BoundVector) -> BoundVector {
    let mut out = *v;
    let (phi, theta) = normalize_phi_theta(v[E_BOUND_PHI], v[E_BOUND_THETA]);
    out[E_BOUND_PHI] = phi;
    out[E_BOUND_THETA] = theta;
    out
}

/// Componentwise sum followed by normalization.
pub fn add_bound_parameters(lhs: &BoundVector, rhs: &BoundVector) -> BoundVector {
    normalize_bound_parameters(&(lhs + rhs))
}

/// Componentwise difference with phi taken as the shortest arc.
///
/// Only meaningful for small differences, e.g. Kalman residuals.
pub fn subtract_bound_parameters(lhs: &BoundVector, rhs: &BoundVector) -> BoundVector {
    let mut out = lhs - rhs;
    out[E_BOUND_PHI] = difference_periodic(lhs[E_BOUND_PHI], rhs[E_BOUND_PHI], 2.0 * PI);
    out
}

// ============================================================================
// DIRECTION HELPERS
// ============================================================================

/// Pseudorapidity of a polar angle.
pub fn eta_from_theta(theta: f64) -> f64 {
    -(theta / 2.0).tan().ln()
}

/// Polar angle of a pseudorapidity.
pub fn theta_from_eta(eta: f64) -> f64 {
    2.0 * (-eta).exp().atan()
}

/// Unit direction from spherical angles.
pub fn make_direction_from_phi_theta(phi: f64, theta: f64) -> Vector3<f64> {
    let (sin_phi, cos_phi) = phi.sin_cos();
    let (sin_theta, cos_theta) = theta.sin_cos();
    Vector3::new(cos_phi * sin_theta, sin_phi * sin_theta, cos_theta)
}

/// Spherical angles `(phi, theta)` of a (not necessarily unit) direction.
pub fn phi_theta_from_direction(direction: &Vector3<f64>) -> (f64, f64) {
    let phi = direction.y.atan2(direction.x);
    let theta = direction.x.hypot(direction.y).atan2(direction.z);
    (phi, theta)
}

// ============================================================================
// VALIDITY CHECKS
// ============================================================================

/// Checks that a bound vector describes a physical track.
///
/// # Arguments
/// * `v` - Bound parameter vector
/// * `epsilon` - Slack allowed on the angular ranges
/// * `max_abs_eta` - Largest accepted |pseudorapidity|
///
/// Rejects non-finite components, phi outside `[-pi, pi)`, theta outside
/// `[0, pi]`, a q/p of exactly zero and |eta| above `max_abs_eta`.
pub fn is_bound_vector_valid(v: &BoundVector, epsilon: f64, max_abs_eta: f64) -> bool {
    if v.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let phi = v[E_BOUND_PHI];
    let theta = v[E_BOUND_THETA];
    let phi_valid = phi + epsilon >= -PI && phi - epsilon < PI;
    let theta_valid = theta + epsilon >= 0.0 && theta - epsilon <= PI;
    let qop_valid = v[E_BOUND_QOVERP] != 0.0;
    // eta(0) is +inf, which only passes an infinite cut
    let eta_valid = eta_from_theta(theta.clamp(0.0, PI)).abs() <= max_abs_eta;

    phi_valid && theta_valid && qop_valid && eta_valid
}

/// Checks that a free vector describes a physical track.
///
/// Additionally to finiteness and a non-zero q/p the direction must have unit
/// norm within `epsilon`.
pub fn is_free_vector_valid(v: &FreeVector, epsilon: f64, max_abs_eta: f64) -> bool {
    if v.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let dir = v.fixed_rows::<3>(E_FREE_DIR0).into_owned();
    let dir_valid = (dir.norm() - 1.0).abs() <= epsilon;
    let qop_valid = v[E_FREE_QOVERP] != 0.0;
    let (_, theta) = phi_theta_from_direction(&dir);
    let eta_valid = eta_from_theta(theta).abs() <= max_abs_eta;

    dir_valid && qop_valid && eta_valid
}

// ============================================================================
// PARTICLE HYPOTHESIS
// ============================================================================

/// Mass and absolute charge assumed when interpreting q/p.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticleHypothesis {
    /// Absolute charge in units of e (0 for neutral particles)
    pub abs_charge: f64,

    /// Mass in GeV
    pub mass: f64,
}

impl ParticleHypothesis {
    pub fn pion() -> Self {
        Self {
            abs_charge: 1.0,
            mass: PION_MASS,
        }
    }

    /// Charged particle without mass.
    pub fn charged_geantino() -> Self {
        Self {
            abs_charge: 1.0,
            mass: 0.0,
        }
    }

    /// Signed charge carried by a q/p value.
    pub fn extract_charge(&self, qop: f64) -> f64 {
        self.abs_charge.copysign(qop)
    }

    /// Absolute momentum carried by a q/p value.
    ///
    /// Neutral particles store 1/p in the q/p slot.
    pub fn extract_momentum(&self, qop: f64) -> f64 {
        let q = if self.abs_charge > 0.0 { self.abs_charge } else { 1.0 };
        q / qop.abs()
    }

    /// Velocity in units of c for a given absolute momentum.
    pub fn beta(&self, momentum: f64) -> f64 {
        momentum / momentum.hypot(self.mass)
    }
}

impl Default for ParticleHypothesis {
    fn default() -> Self {
        Self::pion()
    }
}

// ============================================================================
// BOUND TRACK PARAMETERS
// ============================================================================

/// Track parameters bound to a reference surface, with optional covariance.
#[derive(Debug, Clone)]
pub struct BoundTrackParameters {
    surface: SurfaceHandle,
    params: BoundVector,
    covariance: Option<BoundMatrix>,
    particle_hypothesis: ParticleHypothesis,
}

impl BoundTrackParameters {
    /// Creates parameters on `surface`; phi/theta are normalized.
    pub fn new(
        surface: SurfaceHandle,
        params: BoundVector,
        covariance: Option<BoundMatrix>,
        particle_hypothesis: ParticleHypothesis,
    ) -> Self {
        Self {
            surface,
            params: normalize_bound_parameters(&params),
            covariance,
            particle_hypothesis,
        }
    }

    /// Creates perigee parameters with respect to `reference_point`.
    pub fn perigee(
        reference_point: Vector3<f64>,
        params: BoundVector,
        covariance: Option<BoundMatrix>,
        particle_hypothesis: ParticleHypothesis,
    ) -> Self {
        Self::new(
            PerigeeSurface::new(reference_point).into_handle(),
            params,
            covariance,
            particle_hypothesis,
        )
    }

    /// Converts a free vector onto `surface`.
    pub fn from_free(
        gctx: &GeometryContext,
        surface: SurfaceHandle,
        free: &FreeVector,
        covariance: Option<BoundMatrix>,
        particle_hypothesis: ParticleHypothesis,
        tolerance: f64,
    ) -> Result<Self, GeometryError> {
        let params = free_to_bound_vector(gctx, &surface, free, tolerance)?;
        Ok(Self::new(surface, params, covariance, particle_hypothesis))
    }

    pub fn parameters(&self) -> &BoundVector {
        &self.params
    }

    pub fn covariance(&self) -> Option<&BoundMatrix> {
        self.covariance.as_ref()
    }

    pub fn set_covariance(&mut self, covariance: Option<BoundMatrix>) {
        self.covariance = covariance;
    }

    pub fn reference_surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    pub fn particle_hypothesis(&self) -> ParticleHypothesis {
        self.particle_hypothesis
    }

    pub fn local_position(&self) -> Vector2<f64> {
        Vector2::new(self.params[E_BOUND_LOC0], self.params[E_BOUND_LOC1])
    }

    pub fn phi(&self) -> f64 {
        self.params[E_BOUND_PHI]
    }

    pub fn theta(&self) -> f64 {
        self.params[E_BOUND_THETA]
    }

    pub fn qop(&self) -> f64 {
        self.params[E_BOUND_QOVERP]
    }

    pub fn time(&self) -> f64 {
        self.params[E_BOUND_TIME]
    }

    /// Unit direction of motion.
    pub fn direction(&self) -> Vector3<f64> {
        make_direction_from_phi_theta(self.phi(), self.theta())
    }

    /// Global position on the reference surface.
    pub fn position(&self, gctx: &GeometryContext) -> Vector3<f64> {
        self.surface
            .local_to_global(gctx, &self.local_position(), &self.direction())
    }

    /// Global position and time.
    pub fn four_position(&self, gctx: &GeometryContext) -> Vector4<f64> {
        let pos = self.position(gctx);
        Vector4::new(pos.x, pos.y, pos.z, self.time())
    }

    pub fn charge(&self) -> f64 {
        self.particle_hypothesis.extract_charge(self.qop())
    }

    pub fn absolute_momentum(&self) -> f64 {
        self.particle_hypothesis.extract_momentum(self.qop())
    }

    pub fn transverse_momentum(&self) -> f64 {
        self.absolute_momentum() * self.theta().sin()
    }

    pub fn momentum(&self) -> Vector3<f64> {
        self.absolute_momentum() * self.direction()
    }

    pub fn to_free_vector(&self, gctx: &GeometryContext) -> FreeVector {
        bound_to_free_vector(gctx, &self.surface, &self.params)
    }
}

// ============================================================================
// BOUND <-> FREE
// ============================================================================

/// Expresses bound parameters in global coordinates.
pub fn bound_to_free_vector(
    gctx: &GeometryContext,
    surface: &SurfaceHandle,
    bound: &BoundVector,
) -> FreeVector {
    let dir = make_direction_from_phi_theta(bound[E_BOUND_PHI], bound[E_BOUND_THETA]);
    let local = Vector2::new(bound[E_BOUND_LOC0], bound[E_BOUND_LOC1]);
    let pos = surface.local_to_global(gctx, &local, &dir);

    let mut free = FreeVector::zeros();
    free.fixed_rows_mut::<3>(E_FREE_POS0).copy_from(&pos);
    free[E_FREE_TIME] = bound[E_BOUND_TIME];
    free.fixed_rows_mut::<3>(E_FREE_DIR0).copy_from(&dir);
    free[E_FREE_QOVERP] = bound[E_BOUND_QOVERP];
    free
}

/// Expresses global parameters on `surface`.
///
/// Fails if the position is not on the surface within `tolerance`.
pub fn free_to_bound_vector(
    gctx: &GeometryContext,
    surface: &SurfaceHandle,
    free: &FreeVector,
    tolerance: f64,
) -> Result<BoundVector, GeometryError> {
    let pos = free.fixed_rows::<3>(E_FREE_POS0).into_owned();
    let dir = free.fixed_rows::<3>(E_FREE_DIR0).into_owned();
    let local = surface.global_to_local(gctx, &pos, &dir, tolerance)?;
    let (phi, theta) = phi_theta_from_direction(&dir);

    Ok(BoundVector::from_column_slice(&[
        local.x,
        local.y,
        phi,
        theta,
        free[E_FREE_QOVERP],
        free[E_FREE_TIME],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use trackfit_env::{GeometryIdentifier, PlaneSurface};

    fn bound(v: [f64; 6]) -> BoundVector {
        BoundVector::from_column_slice(&v)
    }

    #[test]
    fn test_bound_vector_validity() {
        let eps = DEFAULT_VALIDITY_EPSILON;
        let eta = DEFAULT_MAX_ABS_ETA;
        // theta = 4 is beyond pi
        assert!(!is_bound_vector_valid(&bound([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), eps, eta));
        assert!(is_bound_vector_valid(&bound([1.0, 2.0, 1.0, 1.0, 5.0, 6.0]), eps, eta));
    }

    #[test]
    fn test_bound_vector_validity_edges() {
        let eps = DEFAULT_VALIDITY_EPSILON;
        let eta = DEFAULT_MAX_ABS_ETA;

        assert!(!is_bound_vector_valid(&bound([0.0, 0.0, 0.0, -0.1, 1.0, 0.0]), eps, eta));
        assert!(is_bound_vector_valid(&bound([0.0, 0.0, 0.0, 0.0, 1.0, 0.0]), eps, eta));
        assert!(!is_bound_vector_valid(&bound([0.0, 0.0, 0.0, 1.0, 0.0, 0.0]), eps, eta));
        assert!(!is_bound_vector_valid(&bound([0.0, 0.0, 3.2, 1.0, 1.0, 0.0]), eps, eta));
        assert!(!is_bound_vector_valid(&bound([f64::NAN, 0.0, 0.0, 1.0, 1.0, 0.0]), eps, eta));

        // A finite eta cut rejects the beam axis
        assert!(!is_bound_vector_valid(&bound([0.0, 0.0, 0.0, 0.0, 1.0, 0.0]), eps, 6.0));
        assert!(!is_bound_vector_valid(&bound([0.0, 0.0, 0.0, 0.001, 1.0, 0.0]), eps, 6.0));
        assert!(is_bound_vector_valid(&bound([0.0, 0.0, 0.0, 0.1, 1.0, 0.0]), eps, 6.0));
    }

    #[test]
    fn test_free_vector_validity() {
        let eps = DEFAULT_VALIDITY_EPSILON;
        let eta = DEFAULT_MAX_ABS_ETA;
        let free = |v: [f64; 8]| FreeVector::from_column_slice(&v);

        assert!(!is_free_vector_valid(&free([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), eps, eta));
        assert!(is_free_vector_valid(&free([1.0, 2.0, 3.0, 4.0, 1.0, 0.0, 0.0, 8.0]), eps, eta));
        assert!(!is_free_vector_valid(&free([1.0, 2.0, 3.0, 4.0, 1.0, 0.0, 0.0, 0.0]), eps, eta));
    }

    #[test]
    fn test_normalize_bound_parameters() {
        let normalized = normalize_bound_parameters(&bound([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let expected = bound([1.0, 2.0, -0.141593, 2.28319, 5.0, 6.0]);
        assert_relative_eq!(normalized, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_add_bound_parameters() {
        let a = bound([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert_relative_eq!(
            add_bound_parameters(&a, &BoundVector::zeros()),
            normalize_bound_parameters(&a),
            epsilon = 1e-9
        );
        assert_relative_eq!(
            add_bound_parameters(&a, &bound([0.0, 0.0, 1.0, 1.0, 0.0, 0.0])),
            normalize_bound_parameters(&bound([1.0, 2.0, 4.0, 5.0, 5.0, 6.0])),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_subtract_bound_parameters() {
        let a = bound([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let delta = bound([0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

        assert_relative_eq!(subtract_bound_parameters(&a, &a), BoundVector::zeros());
        assert_relative_eq!(
            add_bound_parameters(&subtract_bound_parameters(&a, &delta), &delta),
            normalize_bound_parameters(&a),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_subtract_takes_short_arc() {
        let a = bound([0.0, 0.0, PI - 0.1, 1.0, 1.0, 0.0]);
        let b = bound([0.0, 0.0, -PI + 0.1, 1.0, 1.0, 0.0]);
        let diff = subtract_bound_parameters(&a, &b);
        assert_relative_eq!(diff[E_BOUND_PHI], -0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_bound_free_round_trip_on_plane() {
        let gctx = GeometryContext::nominal();
        let plane = PlaneSurface::at_x(25.0, GeometryIdentifier::new(1, 1, 1)).into_handle();
        let params = bound([1.5, -2.0, 0.2, 1.4, 0.5, 3.0]);

        let free = bound_to_free_vector(&gctx, &plane, &params);
        assert_relative_eq!(free[E_FREE_POS0], 25.0, epsilon = 1e-12);

        let back = free_to_bound_vector(&gctx, &plane, &free, 1e-9).unwrap();
        assert_relative_eq!(back, params, epsilon = 1e-12);
    }

    #[test]
    fn test_perigee_parameters_kinematics() {
        let gctx = GeometryContext::nominal();
        let params = BoundTrackParameters::perigee(
            Vector3::zeros(),
            bound([0.1, 5.0, PI / 2.0, PI / 2.0, -0.5, 0.0]),
            None,
            ParticleHypothesis::pion(),
        );

        assert_relative_eq!(params.absolute_momentum(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(params.charge(), -1.0);
        assert_relative_eq!(params.transverse_momentum(), 2.0, epsilon = 1e-12);
        // Moving along +y, positive d0 lies at -x
        assert_relative_eq!(
            params.position(&gctx),
            Vector3::new(-0.1, 0.0, 5.0),
            epsilon = 1e-12
        );
    }

    proptest! {
        #[test]
        fn prop_normalize_ranges_and_idempotence(
            phi in -4.0 * PI..4.0 * PI,
            theta in -2.0 * PI..4.0 * PI,
        ) {
            let v = bound([0.0, 0.0, phi, theta, 1.0, 0.0]);
            let once = normalize_bound_parameters(&v);
            let twice = normalize_bound_parameters(&once);

            prop_assert!(once[E_BOUND_PHI] >= -PI && once[E_BOUND_PHI] < PI);
            prop_assert!(once[E_BOUND_THETA] >= 0.0 && once[E_BOUND_THETA] <= PI);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_normalize_preserves_direction(
            phi in -4.0 * PI..4.0 * PI,
            theta in -2.0 * PI..4.0 * PI,
        ) {
            let before = make_direction_from_phi_theta(phi, theta);
            let (p, t) = normalize_phi_theta(phi, theta);
            let after = make_direction_from_phi_theta(p, t);
            prop_assert!((before - after).norm() < 1e-9);
        }
    }
}
