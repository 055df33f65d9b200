//! Straight-line transport of bound parameters between surfaces.
//!
//! Used by the Kalman fitter in field-free regions. The bound-to-bound
//! jacobian is obtained by central differences, so any pair of surfaces that
//! implements the surface capability works without dedicated derivatives.

use trackfit_env::{GeometryContext, GeometryError, SurfaceHandle};

use crate::kalman_fitter::KalmanFitterError;
use crate::track_parameters::{
    bound_to_free_vector, free_to_bound_vector, subtract_bound_parameters, BoundMatrix,
    BoundTrackParameters, BoundVector, ParticleHypothesis, E_BOUND_SIZE, E_FREE_DIR0,
    E_FREE_POS0, E_FREE_QOVERP, E_FREE_TIME,
};

/// Parameters on the target surface plus the transport jacobian.
#[derive(Debug, Clone)]
pub struct PropagationResult {
    pub parameters: BoundTrackParameters,
    pub jacobian: BoundMatrix,
    /// Signed path length from start to target (mm)
    pub path_length: f64,
}

/// Transports bound parameters onto a target surface.
pub trait Propagator: Send + Sync {
    fn propagate(
        &self,
        gctx: &GeometryContext,
        start: &BoundTrackParameters,
        target: &SurfaceHandle,
    ) -> Result<PropagationResult, KalmanFitterError>;
}

/// Propagator for a field-free detector.
#[derive(Debug, Clone, Copy)]
pub struct StraightLinePropagator {
    /// On-surface tolerance (mm)
    pub tolerance: f64,

    /// Relative finite-difference step for the jacobian
    pub jacobian_step: f64,
}

impl Default for StraightLinePropagator {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            jacobian_step: 1e-6,
        }
    }
}

impl StraightLinePropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `bound` on `start` along its direction onto `target`.
    fn transport(
        &self,
        gctx: &GeometryContext,
        start: &SurfaceHandle,
        target: &SurfaceHandle,
        bound: &BoundVector,
        hypothesis: &ParticleHypothesis,
    ) -> Result<(BoundVector, f64), GeometryError> {
        let mut free = bound_to_free_vector(gctx, start, bound);
        let position = free.fixed_rows::<3>(E_FREE_POS0).into_owned();
        let direction = free.fixed_rows::<3>(E_FREE_DIR0).into_owned();

        let hit = target.intersect(gctx, &position, &direction, self.tolerance);
        if !hit.is_valid() {
            return Err(GeometryError::NoIntersection);
        }

        let momentum = hypothesis.extract_momentum(free[E_FREE_QOVERP]);
        free.fixed_rows_mut::<3>(E_FREE_POS0).copy_from(&hit.position);
        free[E_FREE_TIME] += hit.path_length / hypothesis.beta(momentum);

        let transported = free_to_bound_vector(gctx, target, &free, self.tolerance)?;
        Ok((transported, hit.path_length))
    }
}

impl Propagator for StraightLinePropagator {
    fn propagate(
        &self,
        gctx: &GeometryContext,
        start: &BoundTrackParameters,
        target: &SurfaceHandle,
    ) -> Result<PropagationResult, KalmanFitterError> {
        let surface = start.reference_surface();
        let hypothesis = start.particle_hypothesis();
        let x = start.parameters();

        let (end, path_length) = self.transport(gctx, surface, target, x, &hypothesis)?;

        let mut jacobian = BoundMatrix::zeros();
        for j in 0..E_BOUND_SIZE {
            let h = self.jacobian_step * x[j].abs().max(1.0);
            let mut up = *x;
            let mut down = *x;
            up[j] += h;
            down[j] -= h;
            let (f_up, _) = self.transport(gctx, surface, target, &up, &hypothesis)?;
            let (f_down, _) = self.transport(gctx, surface, target, &down, &hypothesis)?;
            jacobian.set_column(j, &(subtract_bound_parameters(&f_up, &f_down) / (2.0 * h)));
        }

        let covariance = start
            .covariance()
            .map(|c| jacobian * c * jacobian.transpose());

        Ok(PropagationResult {
            parameters: BoundTrackParameters::new(target.clone(), end, covariance, hypothesis),
            jacobian,
            path_length,
        })
    }
}
