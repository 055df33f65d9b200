//! Kalman update of a vertex with one linearized track (weighted formalism).
//!
//! With `A`, `B` the position/momentum jacobians, `G` the track weight at
//! the PCA, `w` the track weight and `s = ±1`:
//!
//! ```text
//! W  = (Bᵀ G B)⁻¹
//! Ĝ  = G - G B W Bᵀ G
//! C'⁻¹ = C⁻¹ + s·w·Aᵀ Ĝ A
//! x' = C' (C⁻¹ x + s·w·Aᵀ Ĝ (p - c))
//!    = x + s·w·C' Aᵀ Ĝ (p - c - A x)
//! ```
//!
//! The second form is the one evaluated: it stays accurate when the prior
//! weight `C⁻¹` is tiny compared to the track weight.
//!
//! `s = -1` removes a track again, which the track smoother uses for a
//! symmetric chi2. The vertex dimension (3 or 4) is chosen at runtime and
//! dispatched to fixed-size routines.

use nalgebra::{SMatrix, SVector};
use tracing::trace;

use super::error::VertexingError;
use super::linearizer::LinearizedTrack;
use super::vertex::{TrackAtVertex, Vertex};

/// Result of [`calculate_update`], padded to four dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexUpdateCache {
    pub new_vertex_position: nalgebra::Vector4<f64>,
    pub new_vertex_covariance: nalgebra::Matrix4<f64>,
    pub new_vertex_weight: nalgebra::Matrix4<f64>,
    pub old_vertex_weight: nalgebra::Matrix4<f64>,
    /// Momentum covariance `W`
    pub w_matrix: nalgebra::Matrix3<f64>,
}

/// Fixed-size views of a linearized track for a vertex of dimension `V`
/// and `P = V + 2` bound parameters.
pub(crate) struct TrackBlocks<const V: usize, const P: usize> {
    pub position_jacobian: SMatrix<f64, P, V>,
    pub momentum_jacobian: SMatrix<f64, P, 3>,
    pub parameters: SVector<f64, P>,
    pub constant_term: SVector<f64, P>,
    pub weight: SMatrix<f64, P, P>,
}

impl<const V: usize, const P: usize> TrackBlocks<V, P> {
    pub(crate) fn from_linearized(track: &LinearizedTrack) -> Result<Self, VertexingError> {
        let covariance: SMatrix<f64, P, P> = track.covariance_at_pca.fixed_view::<P, P>(0, 0).into_owned();
        let weight = covariance
            .try_inverse()
            .ok_or(VertexingError::SingularMatrix)?;
        Ok(Self {
            position_jacobian: track.position_jacobian.fixed_view::<P, V>(0, 0).into_owned(),
            momentum_jacobian: track.momentum_jacobian.fixed_view::<P, 3>(0, 0).into_owned(),
            parameters: track.parameters_at_pca.fixed_rows::<P>(0).into_owned(),
            constant_term: track.constant_term.fixed_rows::<P>(0).into_owned(),
            weight,
        })
    }

    /// `W = (Bᵀ G B)⁻¹`
    pub(crate) fn momentum_covariance(&self) -> Result<SMatrix<f64, 3, 3>, VertexingError> {
        (self.momentum_jacobian.transpose() * self.weight * self.momentum_jacobian)
            .try_inverse()
            .ok_or(VertexingError::SingularMatrix)
    }
}

pub(crate) fn vertex_block<const V: usize>(vertex: &Vertex) -> (SVector<f64, V>, SMatrix<f64, V, V>) {
    (
        vertex.position.fixed_rows::<V>(0).into_owned(),
        vertex.covariance.fixed_view::<V, V>(0, 0).into_owned(),
    )
}

fn pad_vector<const V: usize>(v: &SVector<f64, V>) -> nalgebra::Vector4<f64> {
    let mut out = nalgebra::Vector4::zeros();
    out.fixed_rows_mut::<V>(0).copy_from(v);
    out
}

fn pad_matrix<const V: usize>(m: &SMatrix<f64, V, V>) -> nalgebra::Matrix4<f64> {
    let mut out = nalgebra::Matrix4::zeros();
    out.fixed_view_mut::<V, V>(0, 0).copy_from(m);
    out
}

pub(crate) struct UpdateBlocks<const V: usize> {
    pub position: SVector<f64, V>,
    pub covariance: SMatrix<f64, V, V>,
    pub weight: SMatrix<f64, V, V>,
    pub old_weight: SMatrix<f64, V, V>,
    pub w_matrix: SMatrix<f64, 3, 3>,
}

pub(crate) fn calculate_update_impl<const V: usize, const P: usize>(
    vertex: &Vertex,
    blocks: &TrackBlocks<V, P>,
    track_weight: f64,
    sign: f64,
) -> Result<UpdateBlocks<V>, VertexingError> {
    let (position, covariance) = vertex_block::<V>(vertex);
    let old_weight = covariance
        .try_inverse()
        .ok_or(VertexingError::SingularMatrix)?;

    let w_matrix = blocks.momentum_covariance()?;
    let g = blocks.weight;
    let b = blocks.momentum_jacobian;
    let a = blocks.position_jacobian;
    let deflated = g - g * b * w_matrix * b.transpose() * g;

    let weight = old_weight + a.transpose() * deflated * a * (sign * track_weight);
    let new_covariance = weight
        .try_inverse()
        .ok_or(VertexingError::SingularMatrix)?;
    let residual = blocks.parameters - blocks.constant_term - a * position;
    let new_position = position + new_covariance * a.transpose() * deflated * residual * (sign * track_weight);
    trace!("Updated vertex position: {}", new_position.transpose());

    Ok(UpdateBlocks {
        position: new_position,
        covariance: new_covariance,
        weight,
        old_weight,
        w_matrix,
    })
}

/// New vertex position and covariance after adding (`sign = 1`) or
/// removing (`sign = -1`) a track.
///
/// # Arguments
/// * `vertex` - Current estimate; its covariance must be invertible
/// * `linearized_track` - The track, linearized near the vertex
/// * `track_weight` - Adaptive weight of the track
/// * `sign` - +1 to add, -1 to remove
/// * `dimension` - 3 (space) or 4 (space-time)
pub fn calculate_update(
    vertex: &Vertex,
    linearized_track: &LinearizedTrack,
    track_weight: f64,
    sign: i32,
    dimension: usize,
) -> Result<VertexUpdateCache, VertexingError> {
    match dimension {
        3 => calculate_update_dim::<3, 5>(vertex, linearized_track, track_weight, sign),
        4 => calculate_update_dim::<4, 6>(vertex, linearized_track, track_weight, sign),
        _ => Err(VertexingError::InvalidInput),
    }
}

fn calculate_update_dim<const V: usize, const P: usize>(
    vertex: &Vertex,
    linearized_track: &LinearizedTrack,
    track_weight: f64,
    sign: i32,
) -> Result<VertexUpdateCache, VertexingError> {
    let blocks = TrackBlocks::<V, P>::from_linearized(linearized_track)?;
    let update = calculate_update_impl(vertex, &blocks, track_weight, f64::from(sign))?;
    Ok(VertexUpdateCache {
        new_vertex_position: pad_vector(&update.position),
        new_vertex_covariance: pad_matrix(&update.covariance),
        new_vertex_weight: pad_matrix(&update.weight),
        old_vertex_weight: pad_matrix(&update.old_weight),
        w_matrix: update.w_matrix,
    })
}

/// Chi2 of the track parameters with respect to the updated vertex.
pub(crate) fn track_parameters_chi2<const V: usize, const P: usize>(
    blocks: &TrackBlocks<V, P>,
    vertex_position: &SVector<f64, V>,
    w_matrix: &SMatrix<f64, 3, 3>,
) -> f64 {
    let a = blocks.position_jacobian;
    let b = blocks.momentum_jacobian;
    let g = blocks.weight;
    let predicted = blocks.constant_term + a * vertex_position;
    let momentum = w_matrix * b.transpose() * g * (blocks.parameters - predicted);
    let residual = blocks.parameters - predicted - b * momentum;
    residual.dot(&(g * residual))
}

/// Chi2 of a linearized track at the current position of `vertex`, with
/// the track momentum refitted there.
///
/// # Errors
/// [`VertexingError::InvalidInput`] if the track is not linearized or the
/// dimension is not 3 or 4, [`VertexingError::SingularMatrix`] if a
/// weight matrix cannot be inverted.
pub fn track_chi2_at_vertex(
    vertex: &Vertex,
    track: &TrackAtVertex,
    dimension: usize,
) -> Result<f64, VertexingError> {
    match dimension {
        3 => track_chi2_dim::<3, 5>(vertex, track),
        4 => track_chi2_dim::<4, 6>(vertex, track),
        _ => Err(VertexingError::InvalidInput),
    }
}

fn track_chi2_dim<const V: usize, const P: usize>(
    vertex: &Vertex,
    track: &TrackAtVertex,
) -> Result<f64, VertexingError> {
    let linearized = track
        .linearized_state
        .as_ref()
        .ok_or(VertexingError::InvalidInput)?;
    let blocks = TrackBlocks::<V, P>::from_linearized(linearized)?;
    let w_matrix = blocks.momentum_covariance()?;
    let (position, _) = vertex_block::<V>(vertex);
    Ok(track_parameters_chi2(&blocks, &position, &w_matrix))
}

/// Chi2 of the position of `vertex` against a `constraint` vertex.
///
/// # Errors
/// [`VertexingError::SingularMatrix`] if the constraint covariance cannot
/// be inverted, [`VertexingError::InvalidInput`] for a dimension other than
/// 3 or 4.
pub fn constraint_chi2(vertex: &Vertex, constraint: &Vertex, dimension: usize) -> Result<f64, VertexingError> {
    match dimension {
        3 => constraint_chi2_dim::<3>(vertex, constraint),
        4 => constraint_chi2_dim::<4>(vertex, constraint),
        _ => Err(VertexingError::InvalidInput),
    }
}

fn constraint_chi2_dim<const V: usize>(vertex: &Vertex, constraint: &Vertex) -> Result<f64, VertexingError> {
    let (position, _) = vertex_block::<V>(vertex);
    let (constraint_position, constraint_covariance) = vertex_block::<V>(constraint);
    let weight = constraint_covariance
        .try_inverse()
        .ok_or(VertexingError::SingularMatrix)?;
    let shift = position - constraint_position;
    Ok(shift.dot(&(weight * shift)))
}

/// Adds (`sign = 1`) or removes (`sign = -1`) a track from `vertex`,
/// updating position, covariance and fit quality.
///
/// The track is not appended to `vertex.tracks`; on adding, its
/// `chi2_track` and `ndf` are set.
///
/// # Errors
/// [`VertexingError::InvalidInput`] if the track is not linearized or the
/// dimension is not 3 or 4, [`VertexingError::SingularMatrix`] if a
/// weight matrix cannot be inverted.
pub fn update_vertex_with_track(
    vertex: &mut Vertex,
    track: &mut TrackAtVertex,
    sign: i32,
    dimension: usize,
) -> Result<(), VertexingError> {
    match dimension {
        3 => update_dim::<3, 5>(vertex, track, sign),
        4 => update_dim::<4, 6>(vertex, track, sign),
        _ => Err(VertexingError::InvalidInput),
    }
}

fn update_dim<const V: usize, const P: usize>(
    vertex: &mut Vertex,
    track: &mut TrackAtVertex,
    sign: i32,
) -> Result<(), VertexingError> {
    let linearized = track
        .linearized_state
        .as_ref()
        .ok_or(VertexingError::InvalidInput)?;
    let blocks = TrackBlocks::<V, P>::from_linearized(linearized)?;
    let sign_f = f64::from(sign);
    let update = calculate_update_impl(vertex, &blocks, track.track_weight, sign_f)?;

    let (old_position, _) = vertex_block::<V>(vertex);
    let shift = update.position - old_position;
    let vertex_chi2 = shift.dot(&(update.old_weight * shift));
    let track_chi2 = track_parameters_chi2(&blocks, &update.position, &update.w_matrix);

    vertex.fit_quality.chi2 += sign_f * (vertex_chi2 + track.track_weight * track_chi2);
    vertex.fit_quality.ndf += sign_f * 2.0 * track.track_weight;
    vertex.position.fixed_rows_mut::<V>(0).copy_from(&update.position);
    vertex.covariance.fixed_view_mut::<V, V>(0, 0).copy_from(&update.covariance);

    if sign > 0 {
        track.chi2_track = track_chi2;
        track.ndf = 2.0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track_parameters::{BoundMatrix, BoundTrackParameters, BoundVector, ParticleHypothesis};
    use crate::vertexing::linearizer::{NumericalTrackLinearizer, TrackLinearizer};
    use crate::vertexing::perigee::PerigeeTransport;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector3, Vector4};
    use proptest::prelude::*;
    use trackfit_env::{GeometryContext, MagneticFieldContext};

    fn linearized(d0: f64, z0: f64, phi: f64, theta: f64) -> LinearizedTrack {
        let cov = BoundMatrix::from_diagonal(&BoundVector::from_column_slice(&[
            0.01, 0.01, 1e-4, 1e-4, 1e-4, 1.0,
        ]));
        let params = BoundTrackParameters::perigee(
            Vector3::zeros(),
            BoundVector::from_column_slice(&[d0, z0, phi, theta, 0.5, 0.0]),
            Some(cov),
            ParticleHypothesis::pion(),
        );
        NumericalTrackLinearizer::new(PerigeeTransport::straight_line())
            .linearize_track(
                &params,
                &Vector4::zeros(),
                &GeometryContext::nominal(),
                &MagneticFieldContext::default(),
            )
            .unwrap()
    }

    fn prior() -> Vertex {
        Vertex::with_covariance(Vector4::zeros(), Matrix4::identity() * 100.0)
    }

    #[test]
    fn test_two_crossing_tracks_pull_vertex() {
        // Both tracks pass through (0, 0, 1)
        let mut vertex = prior();
        let mut t1 = TrackAtVertex::new(0, dummy_params());
        t1.linearized_state = Some(linearized(0.0, 1.0, 0.0, 1.2));
        let mut t2 = TrackAtVertex::new(1, dummy_params());
        t2.linearized_state = Some(linearized(0.0, 1.0, 1.5, 1.9));

        update_vertex_with_track(&mut vertex, &mut t1, 1, 3).unwrap();
        update_vertex_with_track(&mut vertex, &mut t2, 1, 3).unwrap();

        assert_relative_eq!(vertex.position.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(vertex.position.y, 0.0, epsilon = 1e-3);
        assert_relative_eq!(vertex.position.z, 1.0, epsilon = 1e-3);
        assert!(vertex.covariance[(2, 2)] < 0.02);
        // Time is not fitted in 3D
        assert_relative_eq!(vertex.covariance[(3, 3)], 100.0);
        assert_relative_eq!(vertex.fit_quality.ndf, 4.0);
        assert!(t1.chi2_track < 1e-3);
    }

    #[test]
    fn test_requires_linearized_track() {
        let mut vertex = prior();
        let mut trk = TrackAtVertex::new(0, dummy_params());
        let result = update_vertex_with_track(&mut vertex, &mut trk, 1, 3);
        assert_eq!(result, Err(VertexingError::InvalidInput));
    }

    #[test]
    fn test_singular_vertex_covariance() {
        let vertex = Vertex::new(Vector4::zeros());
        let result = calculate_update(&vertex, &linearized(0.0, 0.0, 0.3, 1.0), 1.0, 1, 3);
        assert_eq!(result, Err(VertexingError::SingularMatrix));
    }

    #[test]
    fn test_invalid_dimension() {
        let result = calculate_update(&prior(), &linearized(0.0, 0.0, 0.3, 1.0), 1.0, 1, 5);
        assert_eq!(result, Err(VertexingError::InvalidInput));
    }

    #[test]
    fn test_track_chi2_at_vertex_matches_update() {
        let mut vertex = prior();
        let mut trk = TrackAtVertex::new(0, dummy_params());
        trk.linearized_state = Some(linearized(0.05, 1.0, 0.4, 1.1));
        update_vertex_with_track(&mut vertex, &mut trk, 1, 3).unwrap();

        assert_relative_eq!(track_chi2_at_vertex(&vertex, &trk, 3).unwrap(), trk.chi2_track);
        let unlinearized = TrackAtVertex::new(1, dummy_params());
        assert_eq!(
            track_chi2_at_vertex(&vertex, &unlinearized, 3),
            Err(VertexingError::InvalidInput)
        );
    }

    #[test]
    fn test_constraint_chi2() {
        let vertex = Vertex::new(Vector4::new(0.0, 0.0, 1.0, 3.0));
        let constraint = Vertex::with_covariance(Vector4::zeros(), Matrix4::identity() * 4.0);
        assert_relative_eq!(constraint_chi2(&vertex, &constraint, 3).unwrap(), 0.25);
        assert_relative_eq!(constraint_chi2(&vertex, &constraint, 4).unwrap(), 2.5);
        assert_eq!(
            constraint_chi2(&vertex, &Vertex::new(Vector4::zeros()), 3),
            Err(VertexingError::SingularMatrix)
        );
    }

    fn dummy_params() -> BoundTrackParameters {
        BoundTrackParameters::perigee(
            Vector3::zeros(),
            BoundVector::from_column_slice(&[0.0, 0.0, 0.0, 1.0, 0.5, 0.0]),
            None,
            ParticleHypothesis::pion(),
        )
    }

    proptest! {
        #[test]
        fn prop_add_then_remove_restores_vertex(
            d0 in -0.5f64..0.5,
            z0 in -5.0f64..5.0,
            phi in -3.0f64..3.0,
            theta in 0.5f64..2.6,
            weight in 0.05f64..1.0,
            use_time in proptest::bool::ANY,
        ) {
            let dim = if use_time { 4 } else { 3 };
            let mut vertex = Vertex::with_covariance(
                Vector4::new(0.1, -0.1, 0.5, 0.0),
                Matrix4::identity() * 4.0,
            );
            let before = vertex.clone();
            let mut trk = TrackAtVertex::new(0, dummy_params());
            trk.linearized_state = Some(linearized(d0, z0, phi, theta));
            trk.track_weight = weight;

            update_vertex_with_track(&mut vertex, &mut trk, 1, dim).unwrap();
            update_vertex_with_track(&mut vertex, &mut trk, -1, dim).unwrap();

            prop_assert!((vertex.position - before.position).abs().max() < 1e-8);
            prop_assert!((vertex.covariance - before.covariance).abs().max() < 1e-8);
            prop_assert!(vertex.fit_quality.ndf.abs() < 1e-12);
        }
    }
}
