//! Track smoothing: refits a track's momentum with the vertex constraint and
//! expresses it as perigee parameters at the vertex.

use nalgebra::{SMatrix, SVector};
use tracing::debug;

use super::error::VertexingError;
use super::kalman_vertex_updater::{calculate_update_impl, track_parameters_chi2, vertex_block, TrackBlocks};
use super::vertex::{TrackAtVertex, Vertex};
use crate::track_parameters::{
    BoundMatrix, BoundTrackParameters, BoundVector, E_BOUND_PHI, E_BOUND_QOVERP, E_BOUND_THETA,
    E_BOUND_TIME,
};

/// Free vertex-track state used for the covariance:
/// (x, y, z, phi, theta, q/p, t).
type FreeVertexMatrix = SMatrix<f64, 7, 7>;

/// Replaces `track.fitted_params` with the vertex-constrained refit and sets
/// its chi2 and ndf.
///
/// The chi2 is symmetric: the vertex is first recomputed without the track,
/// then the distance of the full vertex and of the track from that reduced
/// estimate is summed.
///
/// # Arguments
/// * `track` - A linearized track of `vertex`
/// * `vertex` - Fitted vertex (its covariance must be invertible)
/// * `dimension` - 3 or 4
pub fn update_track_with_vertex(
    track: &mut TrackAtVertex,
    vertex: &Vertex,
    dimension: usize,
) -> Result<(), VertexingError> {
    match dimension {
        3 => update_track_dim::<3, 5>(track, vertex),
        4 => update_track_dim::<4, 6>(track, vertex),
        _ => Err(VertexingError::InvalidInput),
    }
}

fn update_track_dim<const V: usize, const P: usize>(
    track: &mut TrackAtVertex,
    vertex: &Vertex,
) -> Result<(), VertexingError> {
    let linearized = track
        .linearized_state
        .as_ref()
        .ok_or(VertexingError::InvalidInput)?;
    let blocks = TrackBlocks::<V, P>::from_linearized(linearized)?;
    let (vtx_position, vtx_covariance) = vertex_block::<V>(vertex);
    let vtx_weight = vtx_covariance
        .try_inverse()
        .ok_or(VertexingError::SingularMatrix)?;

    let a = blocks.position_jacobian;
    let b = blocks.momentum_jacobian;
    let g = blocks.weight;
    let w_matrix = blocks.momentum_covariance()?;

    let momentum = w_matrix
        * b.transpose()
        * g
        * (blocks.parameters - blocks.constant_term - a * vtx_position);

    let mut new_params = BoundVector::zeros();
    new_params[E_BOUND_PHI] = momentum[0];
    new_params[E_BOUND_THETA] = momentum[1];
    new_params[E_BOUND_QOVERP] = momentum[2];
    // Only a space-time fit knows the vertex time
    new_params[E_BOUND_TIME] = if V > 3 {
        vertex.time()
    } else {
        track.original_params.time()
    };

    // Vertex-momentum correlation and the momentum covariance including the
    // vertex uncertainty
    let cross: SMatrix<f64, V, 3> = -vtx_covariance * a.transpose() * g * b * w_matrix;
    let momentum_cov = w_matrix + cross.transpose() * vtx_weight * cross;

    let free_cov = free_covariance(&vtx_covariance, &cross, &momentum_cov);
    let (sin_phi, cos_phi) = momentum[0].sin_cos();
    let tan_theta = momentum[1].tan();

    // TODO: replace with the exact free-to-perigee jacobian; this one ignores
    // the field-dependent terms of d0 and z0
    let mut jacobian = SMatrix::<f64, P, 7>::zeros();
    jacobian[(0, 0)] = -sin_phi;
    jacobian[(0, 1)] = cos_phi;
    jacobian[(1, 0)] = -cos_phi / tan_theta;
    jacobian[(1, 1)] = -sin_phi / tan_theta;
    jacobian[(1, 2)] = 1.0;
    jacobian.fixed_view_mut::<3, 3>(2, 3).fill_with_identity();
    if P > 5 {
        jacobian[(5, 6)] = 1.0;
    }
    let bound_block: SMatrix<f64, P, P> = jacobian * free_cov * jacobian.transpose();
    let mut covariance = BoundMatrix::identity();
    covariance.fixed_view_mut::<P, P>(0, 0).copy_from(&bound_block);

    // Symmetric chi2 against the vertex without this track
    let reduced = calculate_update_impl(vertex, &blocks, track.track_weight, -1.0)?;
    let shift: SVector<f64, V> = vtx_position - reduced.position;
    let vertex_chi2 = shift.dot(&(reduced.weight * shift));
    let track_chi2 = track_parameters_chi2(&blocks, &reduced.position, &reduced.w_matrix);
    debug!(
        "Smoothed track {}: vertex chi2 {:.3}, track chi2 {:.3}",
        track.track, vertex_chi2, track_chi2
    );

    track.fitted_params = BoundTrackParameters::perigee(
        vertex.position3(),
        new_params,
        Some(covariance),
        track.original_params.particle_hypothesis(),
    );
    track.chi2_track = vertex_chi2 + track_chi2;
    track.ndf = 2.0 * track.track_weight;
    Ok(())
}

/// Assembles the 7x7 covariance of (x, y, z, phi, theta, q/p, t).
fn free_covariance<const V: usize>(
    vtx_covariance: &SMatrix<f64, V, V>,
    cross: &SMatrix<f64, V, 3>,
    momentum_cov: &SMatrix<f64, 3, 3>,
) -> FreeVertexMatrix {
    let mut free = FreeVertexMatrix::zeros();
    for i in 0..3 {
        for j in 0..3 {
            free[(i, j)] = vtx_covariance[(i, j)];
            free[(i, 3 + j)] = cross[(i, j)];
            free[(3 + j, i)] = cross[(i, j)];
            free[(3 + i, 3 + j)] = momentum_cov[(i, j)];
        }
    }
    if V > 3 {
        free[(6, 6)] = vtx_covariance[(3, 3)];
        for i in 0..3 {
            free[(6, i)] = vtx_covariance[(3, i)];
            free[(i, 6)] = vtx_covariance[(i, 3)];
            free[(6, 3 + i)] = cross[(3, i)];
            free[(3 + i, 6)] = cross[(3, i)];
        }
    }
    free
}
