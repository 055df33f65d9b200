//! Adaptive multi-vertex finder.
//!
//! Vertices are found one at a time. Each round seeds a candidate from the
//! remaining seed tracks, associates the compatible tracks, fits the
//! candidate together with every vertex it shares tracks with, removes its
//! tracks from the seed pool and keeps it if it is clean and not merged
//! with an existing vertex. Rejected candidates are removed and the
//! remaining vertices refitted.

use std::fmt;
use std::sync::Arc;

use nalgebra::{Matrix4, Vector4};
use tracing::debug;

use super::amv_fitter::{AdaptiveMultiVertexFitter, AmvFitterState, VertexId, VertexInfo};
use super::error::VertexingError;
use super::linearizer::TrackLinearizer;
use super::vertex::{FitQuality, Vertex, VertexingOptions};
use super::zscan::VertexSeedFinder;
use crate::track_parameters::BoundTrackParameters;

/// Maps the caller's track type to bound parameters.
pub type ParameterExtractor<T> = Arc<dyn Fn(&T) -> BoundTrackParameters + Send + Sync>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`AdaptiveMultiVertexFinder`]
pub struct AmvFinderConfig<T> {
    /// Seed tracks farther than this from the candidate in z are not
    /// associated (default: 3 mm)
    pub tracks_max_z_interval: f64,

    /// Largest IP significance of an associated track (default: 5)
    pub tracks_max_significance: f64,

    /// Compatibility (or track chi2) below which a track counts as
    /// compatible with the candidate (default: 18.42)
    pub max_vertex_chi2: f64,

    /// Associate all tracks, not only the remaining seed tracks
    /// (default: true)
    pub do_real_multi_vertex: bool,

    /// Judge compatibility by the 3D compatibility instead of weight and
    /// track chi2 (default: true)
    pub use_fast_compatibility: bool,

    /// Largest significance of the separation of two vertices that counts
    /// as merged (default: 3)
    pub max_merge_vertex_significance: f64,

    /// Weight below which a track does not count (default: 1e-4)
    pub min_weight: f64,

    /// Finder rounds (default: 100)
    pub max_iterations: usize,

    /// Keep vertices with a single track when the constraint is in the fit
    /// (default: false)
    pub add_single_track_vertices: bool,

    /// Merge check in 3D (4D with `use_time`) instead of z only
    /// (default: false)
    pub do_3d_splitting: bool,

    /// Largest Σw(1-w) / Σw² of a kept vertex (default: 0.5)
    pub maximum_vertex_contamination: f64,

    /// Use the seed's covariance as prior when it provides one
    /// (default: true)
    pub use_seed_constraint: bool,

    /// Include the candidate's covariance in the IP significance
    /// (default: false)
    pub use_vertex_cov_for_ip_estimation: bool,

    /// Include time in the IP significance (default: false)
    pub use_time: bool,

    /// Prior variance of a seed without constraint (default: 1e8)
    pub initial_variances: f64,

    /// Fit quality of a prior without constraint (default: (0, -3))
    pub default_constraint_fit_quality: FitQuality,

    /// Required
    pub extract_parameters: Option<ParameterExtractor<T>>,
}

impl<T> Default for AmvFinderConfig<T> {
    fn default() -> Self {
        Self {
            tracks_max_z_interval: 3.0,
            tracks_max_significance: 5.0,
            max_vertex_chi2: 18.42,
            do_real_multi_vertex: true,
            use_fast_compatibility: true,
            max_merge_vertex_significance: 3.0,
            min_weight: 1e-4,
            max_iterations: 100,
            add_single_track_vertices: false,
            do_3d_splitting: false,
            maximum_vertex_contamination: 0.5,
            use_seed_constraint: true,
            use_vertex_cov_for_ip_estimation: false,
            use_time: false,
            initial_variances: 1e8,
            default_constraint_fit_quality: FitQuality::new(0.0, -3.0),
            extract_parameters: None,
        }
    }
}

impl<T> Clone for AmvFinderConfig<T> {
    fn clone(&self) -> Self {
        Self {
            extract_parameters: self.extract_parameters.clone(),
            default_constraint_fit_quality: self.default_constraint_fit_quality,
            ..*self
        }
    }
}

impl<T> fmt::Debug for AmvFinderConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmvFinderConfig")
            .field("tracks_max_z_interval", &self.tracks_max_z_interval)
            .field("tracks_max_significance", &self.tracks_max_significance)
            .field("max_vertex_chi2", &self.max_vertex_chi2)
            .field("do_real_multi_vertex", &self.do_real_multi_vertex)
            .field("use_fast_compatibility", &self.use_fast_compatibility)
            .field("max_iterations", &self.max_iterations)
            .field("use_time", &self.use_time)
            .field("has_extractor", &self.extract_parameters.is_some())
            .finish_non_exhaustive()
    }
}

impl AmvFinderConfig<BoundTrackParameters> {
    /// Configuration for inputs that already are bound parameters.
    pub fn for_bound_parameters() -> Self {
        Self {
            extract_parameters: Some(Arc::new(|params: &BoundTrackParameters| params.clone())),
            ..Self::default()
        }
    }
}

// ============================================================================
// FINDER
// ============================================================================

pub struct AdaptiveMultiVertexFinder<T, L: TrackLinearizer, S: VertexSeedFinder> {
    config: AmvFinderConfig<T>,
    extract_parameters: ParameterExtractor<T>,
    fitter: AdaptiveMultiVertexFitter<L>,
    seed_finder: S,
}

impl<T, L: TrackLinearizer, S: VertexSeedFinder> AdaptiveMultiVertexFinder<T, L, S> {
    /// # Errors
    /// [`VertexingError::InvalidInput`] without a parameter extractor, for a
    /// zero round cap or non-positive thresholds.
    pub fn new(
        config: AmvFinderConfig<T>,
        fitter: AdaptiveMultiVertexFitter<L>,
        seed_finder: S,
    ) -> Result<Self, VertexingError> {
        let extract_parameters = config
            .extract_parameters
            .clone()
            .ok_or(VertexingError::InvalidInput)?;
        if config.max_iterations == 0
            || config.tracks_max_significance <= 0.0
            || config.max_vertex_chi2 <= 0.0
            || config.tracks_max_z_interval <= 0.0
            || config.initial_variances <= 0.0
        {
            return Err(VertexingError::InvalidInput);
        }
        Ok(Self {
            config,
            extract_parameters,
            fitter,
            seed_finder,
        })
    }

    pub fn config(&self) -> &AmvFinderConfig<T> {
        &self.config
    }

    /// Finds and fits all vertices in `tracks`.
    ///
    /// The returned vertices carry their associated tracks, with
    /// [`super::TrackAtVertex::track`] indexing into `tracks`.
    ///
    /// # Errors
    /// [`VertexingError::EmptyInput`] for an empty track collection; seed
    /// finder and fitter errors propagate.
    pub fn find(&self, tracks: &[T], options: &VertexingOptions) -> Result<Vec<Vertex>, VertexingError> {
        if tracks.is_empty() {
            return Err(VertexingError::EmptyInput);
        }
        let params: Vec<BoundTrackParameters> = tracks.iter().map(|t| (self.extract_parameters)(t)).collect();
        let all_tracks: Vec<usize> = (0..params.len()).collect();
        let mut state = AmvFitterState::new(params);
        let mut seed_tracks = all_tracks.clone();
        let mut all_vertices: Vec<VertexId> = Vec::new();
        let use_constraint = options.constraint_in_fit();

        let mut iteration = 0;
        while self.has_seed_tracks(&seed_tracks) && iteration < self.config.max_iterations {
            let seed_params: Vec<BoundTrackParameters> =
                seed_tracks.iter().map(|i| state.tracks[*i].clone()).collect();
            let Some(seed) = self.seed_finder.find(&seed_params, options)?.into_iter().next() else {
                debug!("No seed found, stopping after {} vertices", all_vertices.len());
                break;
            };
            let (candidate, constraint) = self.constrain_seed(seed, options, use_constraint);
            if candidate.position.z == 0.0 {
                debug!("Seed at z = 0 treated as no seed");
                break;
            }
            debug!("Round {}: seed at z = {:.3} mm", iteration, candidate.position.z);

            let search_tracks = if self.config.do_real_multi_vertex {
                &all_tracks
            } else {
                &seed_tracks
            };
            let candidate_id = state.add_vertex(candidate);
            all_vertices.push(candidate_id);

            if !self.prepare_candidate(&mut state, candidate_id, constraint, search_tracks, &seed_tracks, options)? {
                debug!("No compatible tracks for the candidate, stopping");
                state.remove_vertex(candidate_id);
                all_vertices.pop();
                break;
            }

            state.add_vertex_to_multimap(candidate_id);
            self.fitter.add_vertex_to_fit(&mut state, candidate_id, options)?;

            let (n_compatible, is_good) =
                self.check_vertex_and_compatible_tracks(&state, candidate_id, &seed_tracks, use_constraint);
            if n_compatible > 0 {
                self.remove_compatible_tracks(&state, candidate_id, &mut seed_tracks);
            } else if !self.remove_track_if_incompatible(&state, candidate_id, &mut seed_tracks, options) {
                debug!("No seed track left to remove, stopping");
                state.remove_vertex(candidate_id);
                all_vertices.pop();
                break;
            }

            let keep = is_good && self.keep_new_vertex(&state, candidate_id, &all_vertices);
            debug!(
                "Candidate at z = {:.3} mm: {} compatible tracks, kept: {}",
                state.vertices[candidate_id].position.z, n_compatible, keep
            );
            if !keep {
                state.remove_vertex(candidate_id);
                all_vertices.pop();
                if !all_vertices.is_empty() {
                    state.vertex_collection = all_vertices.clone();
                    self.fitter.fit(&mut state, options)?;
                }
            }
            iteration += 1;
        }

        debug!("Found {} vertices in {} rounds", all_vertices.len(), iteration);
        Ok(all_vertices
            .iter()
            .filter_map(|id| state.vertex_with_tracks(*id))
            .collect())
    }

    fn has_seed_tracks(&self, seed_tracks: &[usize]) -> bool {
        if self.config.add_single_track_vertices {
            !seed_tracks.is_empty()
        } else {
            seed_tracks.len() > 1
        }
    }

    /// Candidate vertex and the prior it is fitted with.
    fn constrain_seed(&self, mut seed: Vertex, options: &VertexingOptions, use_constraint: bool) -> (Vertex, Vertex) {
        let mut constraint = options.constraint.clone();
        if use_constraint {
            if self.config.use_seed_constraint && !seed.has_zero_covariance() {
                constraint.position = seed.position;
                constraint.covariance = seed.covariance;
            } else {
                seed.covariance = constraint.covariance;
            }
        } else {
            constraint.position = seed.position;
            constraint.covariance = Matrix4::from_diagonal_element(self.config.initial_variances);
            constraint.fit_quality = self.config.default_constraint_fit_quality;
        }
        (seed, constraint)
    }

    /// Associates compatible tracks with the candidate, retrying at the
    /// nearest seed track if none are found. False if nothing could be
    /// associated.
    fn prepare_candidate(
        &self,
        state: &mut AmvFitterState,
        candidate: VertexId,
        constraint: Vertex,
        search_tracks: &[usize],
        seed_tracks: &[usize],
        options: &VertexingOptions,
    ) -> Result<bool, VertexingError> {
        let position = state.vertices[candidate].position;
        state
            .vtx_info
            .insert(candidate, VertexInfo::new(constraint.clone(), position));
        self.add_compatible_tracks(state, candidate, search_tracks, options)?;
        if !state.vtx_info[&candidate].track_links.is_empty() {
            return Ok(true);
        }

        // Move the candidate onto the nearest seed track in z
        let z = state.vertices[candidate].position.z;
        let nearest = seed_tracks
            .iter()
            .map(|t| state.tracks[*t].position(&options.geometry_context).z)
            .min_by(|a, b| (a - z).abs().total_cmp(&(b - z).abs()));
        let Some(new_z) = nearest else {
            return Ok(false);
        };
        let position = Vector4::new(0.0, 0.0, new_z, 0.0);
        state.vertices[candidate].position = position;
        state.vtx_info.insert(candidate, VertexInfo::new(constraint, position));
        self.add_compatible_tracks(state, candidate, search_tracks, options)?;
        Ok(!state.vtx_info[&candidate].track_links.is_empty())
    }

    fn add_compatible_tracks(
        &self,
        state: &mut AmvFitterState,
        candidate: VertexId,
        search_tracks: &[usize],
        options: &VertexingOptions,
    ) -> Result<(), VertexingError> {
        let mut vertex = state.vertices[candidate].clone();
        if !self.config.use_vertex_cov_for_ip_estimation {
            vertex.covariance = Matrix4::zeros();
        }
        for track in search_tracks {
            let params = &state.tracks[*track];
            let z = params.position(&options.geometry_context).z;
            if (z - vertex.position.z).abs() > self.config.tracks_max_z_interval {
                continue;
            }
            let significance = self.ip_significance(params, &vertex, options)?;
            if significance < self.config.tracks_max_significance {
                state.link_track(*track, candidate)?;
            }
        }
        Ok(())
    }

    fn ip_significance(
        &self,
        params: &BoundTrackParameters,
        vertex: &Vertex,
        options: &VertexingOptions,
    ) -> Result<f64, VertexingError> {
        let ip = self.fitter.ip_estimator().impact_parameters_and_sigma(
            &options.geometry_context,
            &options.magnetic_field_context,
            params,
            vertex,
            self.config.use_time,
        )?;
        if ip.sigma_d0 <= 0.0 || ip.sigma_z0 <= 0.0 {
            return Ok(0.0);
        }
        let mut chi2 = (ip.d0 / ip.sigma_d0).powi(2) + (ip.z0 / ip.sigma_z0).powi(2);
        if self.config.use_time {
            if let (Some(dt), Some(sigma)) = (ip.delta_t, ip.sigma_delta_t) {
                if sigma > 0.0 {
                    chi2 += (dt / sigma).powi(2);
                }
            }
        }
        Ok(chi2.sqrt())
    }

    fn is_compatible(&self, state: &AmvFitterState, track: usize, vertex: VertexId) -> bool {
        state
            .tracks_at_vertices
            .get(&(track, vertex))
            .map(|t| {
                if self.config.use_fast_compatibility {
                    t.vertex_compatibility < self.config.max_vertex_chi2
                } else {
                    t.track_weight > self.config.min_weight && t.chi2_track < self.config.max_vertex_chi2
                }
            })
            .unwrap_or(false)
    }

    /// Number of compatible seed tracks (counting stops once the vertex is
    /// known to be good) and whether the vertex is good.
    fn check_vertex_and_compatible_tracks(
        &self,
        state: &AmvFitterState,
        candidate: VertexId,
        seed_tracks: &[usize],
        use_constraint: bool,
    ) -> (usize, bool) {
        let Some(info) = state.vtx_info.get(&candidate) else {
            return (0, false);
        };
        let mut n_compatible = 0;
        for track in &info.track_links {
            if !self.is_compatible(state, *track, candidate) || !seed_tracks.contains(track) {
                continue;
            }
            n_compatible += 1;
            if (self.config.add_single_track_vertices && use_constraint) || n_compatible > 1 {
                return (n_compatible, true);
            }
        }
        (n_compatible, false)
    }

    fn remove_compatible_tracks(&self, state: &AmvFitterState, candidate: VertexId, seed_tracks: &mut Vec<usize>) {
        if let Some(info) = state.vtx_info.get(&candidate) {
            for track in &info.track_links {
                if self.is_compatible(state, *track, candidate) {
                    seed_tracks.retain(|t| t != track);
                }
            }
        }
    }

    /// Removes the most compatible seed track of the candidate, or failing
    /// that the seed track nearest in z. False if none was removed.
    fn remove_track_if_incompatible(
        &self,
        state: &AmvFitterState,
        candidate: VertexId,
        seed_tracks: &mut Vec<usize>,
        options: &VertexingOptions,
    ) -> bool {
        let mut max_compatibility = 0.0;
        let mut to_remove = None;
        if let Some(info) = state.vtx_info.get(&candidate) {
            for track in &info.track_links {
                let Some(track_at_vertex) = state.tracks_at_vertices.get(&(*track, candidate)) else {
                    continue;
                };
                if track_at_vertex.vertex_compatibility > max_compatibility && seed_tracks.contains(track) {
                    max_compatibility = track_at_vertex.vertex_compatibility;
                    to_remove = Some(*track);
                }
            }
        }

        if to_remove.is_none() {
            let z = state.vertices[candidate].position.z;
            to_remove = seed_tracks.iter().copied().min_by(|a, b| {
                let dz = |t: usize| (state.tracks[t].position(&options.geometry_context).z - z).abs();
                dz(*a).total_cmp(&dz(*b))
            });
        }
        match to_remove {
            Some(track) => {
                seed_tracks.retain(|t| *t != track);
                true
            }
            None => false,
        }
    }

    fn keep_new_vertex(&self, state: &AmvFitterState, candidate: VertexId, all_vertices: &[VertexId]) -> bool {
        let Some(info) = state.vtx_info.get(&candidate) else {
            return false;
        };
        let (numerator, denominator) = info
            .track_links
            .iter()
            .filter_map(|t| state.tracks_at_vertices.get(&(*t, candidate)))
            .fold((0.0, 0.0), |(num, den), t| {
                let w = t.track_weight;
                (num + w * (1.0 - w), den + w * w)
            });
        let contamination = if denominator != 0.0 {
            numerator / denominator
        } else {
            0.0
        };
        if contamination > self.config.maximum_vertex_contamination {
            debug!("Candidate contamination {:.3} too high", contamination);
            return false;
        }
        !self.is_merged_vertex(state, candidate, all_vertices)
    }

    fn is_merged_vertex(&self, state: &AmvFitterState, candidate: VertexId, all_vertices: &[VertexId]) -> bool {
        let vertex = &state.vertices[candidate];
        all_vertices.iter().filter(|id| **id != candidate).any(|id| {
            let other = &state.vertices[*id];
            let significance = if !self.config.do_3d_splitting {
                let sum_var_z = other.covariance[(2, 2)] + vertex.covariance[(2, 2)];
                if sum_var_z <= 0.0 {
                    return true;
                }
                (other.position.z - vertex.position.z).abs() / sum_var_z.sqrt()
            } else if self.config.use_time {
                let delta = other.position - vertex.position;
                match (other.covariance + vertex.covariance).try_inverse() {
                    Some(weight) => delta.dot(&(weight * delta)).sqrt(),
                    None => return true,
                }
            } else {
                let delta = other.position3() - vertex.position3();
                match (other.covariance3() + vertex.covariance3()).try_inverse() {
                    Some(weight) => delta.dot(&(weight * delta)).sqrt(),
                    None => return true,
                }
            };
            significance < self.config.max_merge_vertex_significance
        })
    }
}
