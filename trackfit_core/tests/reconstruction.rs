//! End-to-end reconstruction: track fit with smoothing on a telescope, and
//! multi-vertex finding on a seeded two-vertex event.

use std::sync::Arc;

use nalgebra::{Matrix2, Vector2, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use trackfit_core::track_parameters::{E_BOUND_LOC0, E_BOUND_LOC1};
use trackfit_core::units::T;
use trackfit_core::vertexing::{
    AdaptiveMultiVertexFinder, AdaptiveMultiVertexFitter, AmvFinderConfig, AmvFitterConfig,
    ImpactPointEstimator, ImpactPointEstimatorConfig, NumericalTrackLinearizer, PerigeeTransport,
    VertexingOptions, ZScanConfig, ZScanVertexFinder,
};
use trackfit_core::{
    BoundMatrix, BoundTrackParameters, BoundVector, KalmanFitter, KalmanFitterConfig, Measurement,
    MultiTrajectory, ParticleHypothesis, SourceLink, StraightLinePropagator,
};
use trackfit_env::{
    ConstantBField, GeometryContext, GeometryIdentifier, MagneticFieldContext, PlaneSurface,
    SurfaceSequenceNavigator,
};

const SEED: u64 = 42;

// ============================================================================
// TRACK FIT
// ============================================================================

fn layer_id(i: u64) -> GeometryIdentifier {
    GeometryIdentifier::new(1, 2, i)
}

#[test]
fn test_telescope_fit_and_smoothing() {
    let n_layers = 8u64;
    let (slope0, slope1) = (0.01, -0.02);
    let resolution = 0.01;

    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let noise = Normal::new(0.0, resolution).unwrap();
    let measurements: Vec<Measurement> = (1..=n_layers)
        .map(|i| {
            let x = i as f64 * 50.0;
            Measurement::new(
                SourceLink::new(layer_id(i), i as usize),
                [E_BOUND_LOC0, E_BOUND_LOC1],
                Vector2::new(slope0 * x + noise.sample(&mut rng), slope1 * x + noise.sample(&mut rng)),
                Matrix2::from_diagonal_element(resolution * resolution),
            )
            .unwrap()
        })
        .collect();

    let navigator = SurfaceSequenceNavigator::new(
        (1..=n_layers)
            .map(|i| PlaneSurface::at_x(i as f64 * 50.0, layer_id(i)).into_handle())
            .collect(),
    );
    let start_cov = BoundMatrix::from_diagonal(&BoundVector::from_column_slice(&[
        1.0, 1.0, 1e-2, 1e-2, 1e-2, 1e2,
    ]));
    let start = BoundTrackParameters::new(
        PlaneSurface::at_x(0.0, layer_id(0)).into_handle(),
        BoundVector::from_column_slice(&[0.0, 0.0, 0.0, std::f64::consts::FRAC_PI_2, 1.0, 0.0]),
        Some(start_cov),
        ParticleHypothesis::pion(),
    );

    let gctx = GeometryContext::nominal();
    let mut traj = MultiTrajectory::new();
    let fitter = KalmanFitter::new(StraightLinePropagator::new(), navigator, KalmanFitterConfig::default());
    let result = fitter.fit(&gctx, &start, &measurements, &mut traj).unwrap();

    assert_eq!(result.summary.n_states, n_layers as usize);
    assert_eq!(result.summary.n_measurements, n_layers as usize);
    assert_eq!(result.summary.n_holes, 0);
    assert!(result.summary.chi2_sum < 3.0 * result.summary.ndf as f64);

    let indices = traj.trajectory_indices(result.tip);
    assert_eq!(indices.len(), n_layers as usize);
    for &i in &indices {
        let state = traj.get_track_state(i);
        assert!(state.has_smoothed());
        assert!(state.chi2() >= 0.0);
    }

    // Smoothing at the first layer draws on every later hit
    let first = traj.get_track_state(indices[0]);
    assert!(first.smoothed_covariance()[(0, 0)] <= first.filtered_covariance()[(0, 0)]);
    assert!(first.smoothed_covariance()[(1, 1)] <= first.filtered_covariance()[(1, 1)]);

    let fitted = result.fitted_parameters.parameters();
    assert!((fitted[E_BOUND_LOC0] - 0.5).abs() < 0.05, "loc0 {}", fitted[E_BOUND_LOC0]);
    assert!((fitted[E_BOUND_LOC1] + 1.0).abs() < 0.05, "loc1 {}", fitted[E_BOUND_LOC1]);
}

// ============================================================================
// VERTEX FINDING
// ============================================================================

fn transport() -> PerigeeTransport {
    PerigeeTransport::new(Arc::new(ConstantBField::along_z(2.0 * T)))
}

fn ip_estimator() -> ImpactPointEstimator {
    ImpactPointEstimator::new(transport(), ImpactPointEstimatorConfig::default())
}

/// Tracks leaving `vertex`, smeared at the vertex and expressed at the origin.
fn event_tracks(vertex: &Vector3<f64>, n: usize, rng: &mut ChaCha8Rng) -> Vec<BoundTrackParameters> {
    let sigma_ip: f64 = 0.02;
    let smear = Normal::new(0.0, sigma_ip).unwrap();
    let variances = [sigma_ip * sigma_ip, sigma_ip * sigma_ip, 1e-6, 1e-6, 1e-6, 1.0];
    let cov = BoundMatrix::from_diagonal(&BoundVector::from_column_slice(&variances));

    (0..n)
        .map(|i| {
            let phi = -3.0 + 0.75 * i as f64;
            let theta = 0.7 + 0.22 * i as f64;
            let qop = if i % 2 == 0 { 0.6 } else { -0.8 };
            let at_vertex = BoundTrackParameters::perigee(
                *vertex,
                BoundVector::from_column_slice(&[
                    smear.sample(rng),
                    smear.sample(rng),
                    phi,
                    theta,
                    qop,
                    0.0,
                ]),
                Some(cov),
                ParticleHypothesis::pion(),
            );
            transport()
                .to_perigee(
                    &GeometryContext::nominal(),
                    &MagneticFieldContext::default(),
                    &at_vertex,
                    &Vector3::zeros(),
                )
                .unwrap()
        })
        .collect()
}

#[test]
fn test_adaptive_multi_vertex_finding_on_two_vertices() {
    let truths = [Vector3::new(0.0, 0.0, -10.0), Vector3::new(0.0, 0.0, 15.0)];
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let tracks: Vec<_> = truths
        .iter()
        .flat_map(|truth| event_tracks(truth, 8, &mut rng))
        .collect();

    let fitter = AdaptiveMultiVertexFitter::new(
        AmvFitterConfig::default(),
        NumericalTrackLinearizer::new(transport()),
        ip_estimator(),
    )
    .unwrap();
    let seed_finder = ZScanVertexFinder::new(ZScanConfig::default(), ip_estimator()).unwrap();
    let finder =
        AdaptiveMultiVertexFinder::new(AmvFinderConfig::for_bound_parameters(), fitter, seed_finder)
            .unwrap();

    let vertices = finder.find(&tracks, &VertexingOptions::default()).unwrap();
    assert_eq!(vertices.len(), 2);

    for truth in &truths {
        let closest = vertices
            .iter()
            .min_by(|a, b| {
                (a.position3() - truth)
                    .norm()
                    .total_cmp(&(b.position3() - truth).norm())
            })
            .unwrap();
        let distance = (closest.position3() - truth).norm();
        assert!(distance < 0.05, "vertex at {:?} is {} mm from truth", closest.position, distance);
        assert!(closest.covariance[(2, 2)] > 0.0);
    }
}
