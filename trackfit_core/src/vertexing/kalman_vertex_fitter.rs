//! Sequential Kalman fit of a single vertex.
//!
//! Tracks are added one at a time with unit weight. The fit is repeated with
//! the tracks relinearized at the previous result until the position
//! settles or the iteration cap is hit.
//!
//! The reported chi2 is evaluated at the final position: the sum of the track
//! chi2 plus, when the constraint takes part in the fit, the chi2 of the
//! position against it. The wide prior of an unconstrained fit adds nothing.

use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::VertexingError;
use super::kalman_vertex_track_updater::update_track_with_vertex;
use super::kalman_vertex_updater::{constraint_chi2, track_chi2_at_vertex, update_vertex_with_track};
use super::linearizer::TrackLinearizer;
use super::vertex::{FitQuality, TrackAtVertex, Vertex, VertexingOptions};
use crate::track_parameters::BoundTrackParameters;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`KalmanVertexFitter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanVertexFitterConfig {
    /// Linearize-and-fit passes (default: 5)
    pub max_iterations: usize,

    /// Position change ending the passes early (default: 1e-3 mm)
    pub convergence_distance: f64,

    /// Prior variance when no constraint takes part in the fit (default: 1e8)
    pub initial_variance: f64,

    /// Fit the vertex time as well (default: false)
    pub use_time: bool,

    /// Refit the tracks with the vertex constraint (default: false)
    pub do_smoothing: bool,
}

impl Default for KalmanVertexFitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            convergence_distance: 1e-3,
            initial_variance: 1e8,
            use_time: false,
            do_smoothing: false,
        }
    }
}

// ============================================================================
// FITTER
// ============================================================================

pub struct KalmanVertexFitter<L: TrackLinearizer> {
    linearizer: L,
    config: KalmanVertexFitterConfig,
}

impl<L: TrackLinearizer> KalmanVertexFitter<L> {
    /// # Errors
    /// [`VertexingError::InvalidInput`] for a zero iteration cap or a
    /// non-positive initial variance.
    pub fn new(linearizer: L, config: KalmanVertexFitterConfig) -> Result<Self, VertexingError> {
        if config.max_iterations == 0 || config.initial_variance <= 0.0 {
            return Err(VertexingError::InvalidInput);
        }
        Ok(Self { linearizer, config })
    }

    pub fn config(&self) -> &KalmanVertexFitterConfig {
        &self.config
    }

    fn dimension(&self) -> usize {
        if self.config.use_time {
            4
        } else {
            3
        }
    }

    /// Fits one vertex to `tracks`.
    ///
    /// Without tracks the constraint is returned as is when it takes part
    /// in the fit.
    ///
    /// # Errors
    /// * [`VertexingError::EmptyInput`] without tracks and without a constraint
    /// * [`VertexingError::NoCovariance`] if tracks are given and the
    ///   constraint has no covariance, or a track lacks one
    pub fn fit(
        &self,
        tracks: &[BoundTrackParameters],
        options: &VertexingOptions,
    ) -> Result<Vertex, VertexingError> {
        if tracks.is_empty() {
            return if options.use_constraint_in_fit {
                Ok(options.constraint.clone())
            } else {
                Err(VertexingError::EmptyInput)
            };
        }
        if options.use_constraint_in_fit && options.constraint.has_zero_covariance() {
            return Err(VertexingError::NoCovariance);
        }

        let prior = if options.use_constraint_in_fit {
            options.constraint.clone()
        } else {
            let mut seed = Vertex::with_covariance(
                options.constraint.position,
                Matrix4::from_diagonal_element(self.config.initial_variance),
            );
            seed.fit_quality = FitQuality::new(0.0, -3.0);
            seed
        };

        let dimension = self.dimension();
        let mut linearization_point: Vector4<f64> = prior.position;
        let mut vertex = prior.clone();
        let mut converged = false;

        for iteration in 0..self.config.max_iterations {
            vertex = prior.clone();
            vertex.tracks.clear();
            for (index, params) in tracks.iter().enumerate() {
                let mut track = TrackAtVertex::new(index, params.clone());
                track.linearized_state = Some(self.linearizer.linearize_track(
                    params,
                    &linearization_point,
                    &options.geometry_context,
                    &options.magnetic_field_context,
                )?);
                update_vertex_with_track(&mut vertex, &mut track, 1, dimension)?;
                vertex.tracks.push(track);
            }

            let shift = (vertex.position3() - linearization_point.xyz()).norm();
            debug!("Vertex fit pass {}: shift {:.3e} mm", iteration, shift);
            linearization_point = vertex.position;
            if shift < self.config.convergence_distance {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(
                "Vertex fit reached {} passes without settling",
                self.config.max_iterations
            );
        }
        vertex.converged = converged;

        let track_chi2 = vertex
            .tracks
            .iter()
            .map(|track| track_chi2_at_vertex(&vertex, track, dimension))
            .collect::<Result<Vec<_>, _>>()?;
        let mut chi2 = if options.use_constraint_in_fit {
            constraint_chi2(&vertex, &options.constraint, dimension)?
        } else {
            0.0
        };
        for (track, track_chi2) in vertex.tracks.iter_mut().zip(track_chi2) {
            track.chi2_track = track_chi2;
            chi2 += track.track_weight * track_chi2;
        }
        vertex.fit_quality.chi2 = chi2;
        debug!("Vertex fit chi2 {:.3e}, ndf {:.1}", chi2, vertex.fit_quality.ndf);

        if self.config.do_smoothing {
            let fitted = vertex.clone();
            for track in vertex.tracks.iter_mut() {
                update_track_with_vertex(track, &fitted, dimension)?;
            }
        }
        Ok(vertex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track_parameters::{BoundMatrix, BoundVector, ParticleHypothesis};
    use crate::units::T;
    use crate::vertexing::linearizer::NumericalTrackLinearizer;
    use crate::vertexing::perigee::PerigeeTransport;
    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector4};
    use std::sync::Arc;
    use trackfit_env::{ConstantBField, GeometryContext, MagneticFieldContext};

    fn fitter(config: KalmanVertexFitterConfig) -> KalmanVertexFitter<NumericalTrackLinearizer> {
        let transport = PerigeeTransport::new(Arc::new(ConstantBField::along_z(2.0 * T)));
        KalmanVertexFitter::new(NumericalTrackLinearizer::new(transport), config).unwrap()
    }

    /// Perigee parameters at the origin of a track produced at `vertex`.
    fn track_from(vertex: &Vector3<f64>, phi: f64, theta: f64, qop: f64) -> BoundTrackParameters {
        displaced_track_from(vertex, 0.0, phi, theta, qop)
    }

    /// As [`track_from`], with the track missing `vertex` by `d0`.
    fn displaced_track_from(vertex: &Vector3<f64>, d0: f64, phi: f64, theta: f64, qop: f64) -> BoundTrackParameters {
        let transport = PerigeeTransport::new(Arc::new(ConstantBField::along_z(2.0 * T)));
        let cov = BoundMatrix::from_diagonal(&BoundVector::from_column_slice(&[
            1e-4, 1e-4, 1e-6, 1e-6, 1e-6, 1.0,
        ]));
        let at_vertex = BoundTrackParameters::perigee(
            *vertex,
            BoundVector::from_column_slice(&[d0, 0.0, phi, theta, qop, 0.0]),
            Some(cov),
            ParticleHypothesis::pion(),
        );
        transport
            .to_perigee(
                &GeometryContext::nominal(),
                &MagneticFieldContext::default(),
                &at_vertex,
                &Vector3::zeros(),
            )
            .unwrap()
    }

    #[test]
    fn test_constraint_passes_through_without_tracks() {
        let constraint = Vertex::with_covariance(
            Vector4::new(0.1, -0.2, 3.0, 0.0),
            Matrix4::from_diagonal(&Vector4::new(0.01, 0.02, 4.0, 1.0)),
        );
        let options = VertexingOptions::with_constraint(constraint.clone());
        let vertex = fitter(KalmanVertexFitterConfig::default())
            .fit(&[], &options)
            .unwrap();
        assert_eq!(vertex.position, constraint.position);
        assert_eq!(vertex.covariance, constraint.covariance);
        assert!(vertex.tracks.is_empty());
    }

    #[test]
    fn test_empty_input_without_constraint() {
        let result = fitter(KalmanVertexFitterConfig::default()).fit(&[], &VertexingOptions::default());
        assert_eq!(result.unwrap_err(), VertexingError::EmptyInput);
    }

    #[test]
    fn test_constraint_without_covariance() {
        let options = VertexingOptions::with_constraint(Vertex::new(Vector4::zeros()));
        let tracks = [track_from(&Vector3::zeros(), 0.0, 1.0, 1.0)];
        let result = fitter(KalmanVertexFitterConfig::default()).fit(&tracks, &options);
        assert_eq!(result.unwrap_err(), VertexingError::NoCovariance);
    }

    #[test]
    fn test_fits_displaced_vertex() {
        let truth = Vector3::new(0.3, -0.2, 12.0);
        let tracks = six_tracks(&truth, 0.0);

        let mut options = VertexingOptions::default();
        options.constraint.position = Vector4::new(0.0, 0.0, 11.0, 0.0);
        let config = KalmanVertexFitterConfig {
            do_smoothing: true,
            ..KalmanVertexFitterConfig::default()
        };
        let vertex = fitter(config).fit(&tracks, &options).unwrap();

        assert!(vertex.converged);
        assert_relative_eq!(vertex.position3(), truth, epsilon = 1e-3);
        assert_eq!(vertex.tracks.len(), 6);
        assert_relative_eq!(vertex.fit_quality.ndf, 9.0, epsilon = 1e-9);
        assert!(vertex.fit_quality.chi2 < 1e-2);
        for track in &vertex.tracks {
            assert_relative_eq!(
                track.fitted_params.phi(),
                track.original_params.phi(),
                epsilon = 1e-2
            );
        }
    }

    fn six_tracks(truth: &Vector3<f64>, d0: f64) -> Vec<BoundTrackParameters> {
        (0..6)
            .map(|i| {
                let phi = -2.8 + 1.0 * i as f64;
                let theta = 0.8 + 0.25 * i as f64;
                let qop = if i % 2 == 0 { 1.0 } else { -0.8 };
                let miss = if i % 2 == 0 { d0 } else { -d0 };
                displaced_track_from(truth, miss, phi, theta, qop)
            })
            .collect()
    }

    #[test]
    fn test_chi2_does_not_depend_on_prior_width() {
        let truth = Vector3::new(0.3, -0.2, 12.0);
        let tracks = six_tracks(&truth, 0.0);
        let mut options = VertexingOptions::default();
        options.constraint.position = Vector4::new(0.0, 0.0, 11.0, 0.0);

        let chi2 = |initial_variance: f64| {
            let config = KalmanVertexFitterConfig {
                initial_variance,
                ..KalmanVertexFitterConfig::default()
            };
            fitter(config).fit(&tracks, &options).unwrap().fit_quality.chi2
        };
        let wide = chi2(1e8);
        let narrow = chi2(1e4);
        assert!(wide < 1e-6, "chi2 {}", wide);
        assert!(narrow < 1e-6, "chi2 {}", narrow);
    }

    #[test]
    fn test_chi2_is_sum_of_track_chi2() {
        let truth = Vector3::new(0.1, 0.1, -4.0);
        let tracks = six_tracks(&truth, 0.01);
        let vertex = fitter(KalmanVertexFitterConfig::default())
            .fit(&tracks, &VertexingOptions::default())
            .unwrap();

        let sum: f64 = vertex.tracks.iter().map(|t| t.chi2_track).sum();
        assert!(vertex.fit_quality.chi2 > 0.0);
        assert_relative_eq!(vertex.fit_quality.chi2, sum, epsilon = 1e-12);
    }

    #[test]
    fn test_constrained_chi2_includes_constraint() {
        let truth = Vector3::new(0.0, 0.0, 1.0);
        let tracks = six_tracks(&truth, 0.0);
        let constraint = Vertex::with_covariance(
            Vector4::zeros(),
            Matrix4::from_diagonal(&Vector4::new(0.01, 0.01, 1.0, 1.0)),
        );
        let options = VertexingOptions::with_constraint(constraint);
        let vertex = fitter(KalmanVertexFitterConfig::default())
            .fit(&tracks, &options)
            .unwrap();

        let sum: f64 = vertex.tracks.iter().map(|t| t.chi2_track).sum();
        // The tracks pull z to 1 against a constraint at 0 with unit variance
        assert!(vertex.fit_quality.chi2 > sum);
        assert!((vertex.position.z - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = KalmanVertexFitterConfig {
            max_iterations: 0,
            ..KalmanVertexFitterConfig::default()
        };
        let transport = PerigeeTransport::straight_line();
        assert!(KalmanVertexFitter::new(NumericalTrackLinearizer::new(transport), config).is_err());
    }
}
