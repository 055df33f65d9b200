//! Adaptive multi-vertex fitter.
//!
//! Vertices that share tracks are fitted together. Every iteration each
//! vertex is reset to its prior and refitted from all its tracks, weighted
//! by the annealing weight of the track's compatibility with the vertex
//! against its compatibilities with the competing vertices. The iteration
//! ends once the temperature schedule reached equilibrium and no vertex
//! moved by more than `max_relative_shift` (in units of its covariance),
//! or after `max_iterations`.

use std::collections::HashMap;

use nalgebra::Vector4;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::annealing::{AnnealingConfig, AnnealingState, AnnealingUtility};
use super::error::VertexingError;
use super::impact_point::ImpactPointEstimator;
use super::kalman_vertex_track_updater::update_track_with_vertex;
use super::kalman_vertex_updater::update_vertex_with_track;
use super::linearizer::TrackLinearizer;
use super::vertex::{TrackAtVertex, Vertex, VertexingOptions};
use crate::track_parameters::BoundTrackParameters;

/// Index of a vertex in [`AmvFitterState::vertices`].
pub type VertexId = usize;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`AdaptiveMultiVertexFitter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmvFitterConfig {
    pub annealing: AnnealingConfig,

    /// Iteration cap (default: 30)
    pub max_iterations: usize,

    /// Transverse distance of the vertex from its linearization point that
    /// triggers relinearization (default: 0.5 mm)
    pub max_distance_to_linearization_point: f64,

    /// Largest vertex shift, as chi2 in the vertex covariance, counted as
    /// converged (default: 0.01)
    pub max_relative_shift: f64,

    /// Tracks at or below this weight are left out of the update
    /// (default: 1e-4)
    pub min_weight: f64,

    /// Refit the tracks with their vertex after the fit (default: false)
    pub do_smoothing: bool,

    /// Fit vertex times as well (default: false)
    pub use_time: bool,
}

impl Default for AmvFitterConfig {
    fn default() -> Self {
        Self {
            annealing: AnnealingConfig::default(),
            max_iterations: 30,
            max_distance_to_linearization_point: 0.5,
            max_relative_shift: 0.01,
            min_weight: 1e-4,
            do_smoothing: false,
            use_time: false,
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Fit bookkeeping of one vertex.
#[derive(Debug, Clone)]
pub struct VertexInfo {
    /// Prior the vertex is reset to at every iteration
    pub constraint: Vertex,

    pub linearization_point: Vector4<f64>,

    /// Position at the start of the current iteration
    pub old_position: Vector4<f64>,

    pub seed_position: Vector4<f64>,

    /// Tracks associated with the vertex
    pub track_links: Vec<usize>,

    /// Track parameters at the 3D PCA to `old_position`
    pub impact_params_3d: HashMap<usize, BoundTrackParameters>,

    pub relinearize: bool,
}

impl VertexInfo {
    pub fn new(constraint: Vertex, position: Vector4<f64>) -> Self {
        Self {
            constraint,
            linearization_point: position,
            old_position: position,
            seed_position: position,
            track_links: Vec::new(),
            impact_params_3d: HashMap::new(),
            relinearize: true,
        }
    }
}

/// Result of [`AdaptiveMultiVertexFitter::fit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmvFitReport {
    pub iterations: usize,
    pub converged: bool,
}

/// Vertices, tracks and their associations for one event.
#[derive(Debug, Clone, Default)]
pub struct AmvFitterState {
    /// Vertex arena; removed vertices leave an empty slot
    pub vertices: Vec<Vertex>,

    /// Vertices fitted by the next call to `fit`
    pub vertex_collection: Vec<VertexId>,

    pub vtx_info: HashMap<VertexId, VertexInfo>,

    /// One entry per associated (track, vertex) pair
    pub tracks_at_vertices: HashMap<(usize, VertexId), TrackAtVertex>,

    /// Vertices each track is associated with
    pub track_to_vertices: HashMap<usize, Vec<VertexId>>,

    pub tracks: Vec<BoundTrackParameters>,

    pub annealing: AnnealingState,
}

impl AmvFitterState {
    pub fn new(tracks: Vec<BoundTrackParameters>) -> Self {
        Self {
            tracks,
            ..Self::default()
        }
    }

    /// Adds `vertex` to the arena without associating anything.
    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexId {
        self.vertices.push(vertex);
        self.vertices.len() - 1
    }

    /// Associates `track` with `vertex` (no-op if already associated).
    ///
    /// # Errors
    /// [`VertexingError::ElementNotFound`] for an unknown vertex or track.
    pub fn link_track(&mut self, track: usize, vertex: VertexId) -> Result<(), VertexingError> {
        let params = self.tracks.get(track).ok_or(VertexingError::ElementNotFound)?;
        let info = self
            .vtx_info
            .get_mut(&vertex)
            .ok_or(VertexingError::ElementNotFound)?;
        if self.tracks_at_vertices.contains_key(&(track, vertex)) {
            return Ok(());
        }
        self.tracks_at_vertices
            .insert((track, vertex), TrackAtVertex::new(track, params.clone()));
        info.track_links.push(track);
        Ok(())
    }

    /// Registers the tracks of `vertex` in the track-to-vertices multimap.
    pub fn add_vertex_to_multimap(&mut self, vertex: VertexId) {
        if let Some(info) = self.vtx_info.get(&vertex) {
            for track in &info.track_links {
                let vertices = self.track_to_vertices.entry(*track).or_default();
                if !vertices.contains(&vertex) {
                    vertices.push(vertex);
                }
            }
        }
    }

    /// Drops `vertex` and all its associations.
    pub fn remove_vertex(&mut self, vertex: VertexId) {
        if let Some(info) = self.vtx_info.remove(&vertex) {
            for track in &info.track_links {
                self.tracks_at_vertices.remove(&(*track, vertex));
                if let Some(vertices) = self.track_to_vertices.get_mut(track) {
                    vertices.retain(|v| *v != vertex);
                }
            }
        }
        self.vertex_collection.retain(|v| *v != vertex);
        if let Some(slot) = self.vertices.get_mut(vertex) {
            *slot = Vertex::default();
        }
    }

    /// Vertices `track` is associated with.
    pub fn vertices_of_track(&self, track: usize) -> &[VertexId] {
        self.track_to_vertices
            .get(&track)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The vertex with its associated tracks attached.
    pub fn vertex_with_tracks(&self, vertex: VertexId) -> Option<Vertex> {
        let mut output = self.vertices.get(vertex)?.clone();
        let info = self.vtx_info.get(&vertex)?;
        output.tracks = info
            .track_links
            .iter()
            .filter_map(|track| self.tracks_at_vertices.get(&(*track, vertex)).cloned())
            .collect();
        Some(output)
    }
}

// ============================================================================
// FITTER
// ============================================================================

pub struct AdaptiveMultiVertexFitter<L: TrackLinearizer> {
    config: AmvFitterConfig,
    linearizer: L,
    ip_estimator: ImpactPointEstimator,
    annealing: AnnealingUtility,
}

impl<L: TrackLinearizer> AdaptiveMultiVertexFitter<L> {
    /// # Errors
    /// [`VertexingError::InvalidInput`] for a zero iteration cap, an invalid
    /// annealing schedule or non-positive thresholds.
    pub fn new(
        config: AmvFitterConfig,
        linearizer: L,
        ip_estimator: ImpactPointEstimator,
    ) -> Result<Self, VertexingError> {
        if config.max_iterations == 0
            || config.max_relative_shift <= 0.0
            || config.max_distance_to_linearization_point <= 0.0
        {
            return Err(VertexingError::InvalidInput);
        }
        let annealing = AnnealingUtility::new(config.annealing.clone())?;
        Ok(Self {
            config,
            linearizer,
            ip_estimator,
            annealing,
        })
    }

    pub fn config(&self) -> &AmvFitterConfig {
        &self.config
    }

    pub fn ip_estimator(&self) -> &ImpactPointEstimator {
        &self.ip_estimator
    }

    fn dimension(&self) -> usize {
        if self.config.use_time {
            4
        } else {
            3
        }
    }

    /// Fits `new_vertex` together with every vertex transitively sharing
    /// tracks with it.
    ///
    /// # Errors
    /// [`VertexingError::EmptyInput`] if the vertex has no tracks.
    pub fn add_vertex_to_fit(
        &self,
        state: &mut AmvFitterState,
        new_vertex: VertexId,
        options: &VertexingOptions,
    ) -> Result<AmvFitReport, VertexingError> {
        let info = state
            .vtx_info
            .get(&new_vertex)
            .ok_or(VertexingError::ElementNotFound)?;
        if info.track_links.is_empty() {
            return Err(VertexingError::EmptyInput);
        }
        self.prepare_vertex_for_fit(state, new_vertex, options)?;

        let mut to_fit = vec![new_vertex];
        let mut next = 0;
        while next < to_fit.len() {
            let current = to_fit[next];
            next += 1;
            let Some(info) = state.vtx_info.get(&current) else {
                continue;
            };
            for track in &info.track_links {
                for other in state.vertices_of_track(*track) {
                    if !to_fit.contains(other) {
                        to_fit.push(*other);
                    }
                }
            }
        }
        debug!("Fitting {} vertices together with vertex {}", to_fit.len(), new_vertex);

        state.vertex_collection = to_fit;
        self.fit(state, options)
    }

    /// Fits all vertices in `state.vertex_collection` simultaneously.
    ///
    /// Hitting the iteration cap is not an error: the report and the
    /// `converged` flag of the fitted vertices record it.
    pub fn fit(
        &self,
        state: &mut AmvFitterState,
        options: &VertexingOptions,
    ) -> Result<AmvFitReport, VertexingError> {
        state.annealing = AnnealingState::default();
        let mut iterations = 0;
        let mut small_shift = false;

        while iterations < self.config.max_iterations
            && (!state.annealing.equilibrium_reached || !small_shift)
        {
            let collection = state.vertex_collection.clone();
            for vertex_id in &collection {
                let vertex = state
                    .vertices
                    .get_mut(*vertex_id)
                    .ok_or(VertexingError::ElementNotFound)?;
                let info = state
                    .vtx_info
                    .get_mut(vertex_id)
                    .ok_or(VertexingError::ElementNotFound)?;
                info.relinearize = false;
                info.old_position = vertex.position;

                let distance = (info.old_position.xy() - info.linearization_point.xy()).norm();
                if distance > self.config.max_distance_to_linearization_point {
                    trace!("Relinearizing vertex {} ({:.3} mm off)", vertex_id, distance);
                    info.relinearize = true;
                    info.linearization_point = info.old_position;
                    self.prepare_vertex_for_fit(state, *vertex_id, options)?;
                }

                let vertex = &mut state.vertices[*vertex_id];
                let info = &state.vtx_info[vertex_id];
                if !info.constraint.has_zero_covariance() {
                    vertex.position = info.constraint.position;
                    vertex.covariance = info.constraint.covariance;
                    vertex.fit_quality = info.constraint.fit_quality;
                } else if vertex.has_zero_covariance() {
                    return Err(VertexingError::NoCovariance);
                }
            }

            for vertex_id in &collection {
                self.set_all_vertex_compatibilities(state, *vertex_id, options)?;
            }
            self.set_weights_and_update(state, options)?;

            if !state.annealing.equilibrium_reached {
                self.annealing.anneal(&mut state.annealing);
            }
            small_shift = self.check_small_shift(state)?;
            iterations += 1;
            trace!(
                "AMV iteration {}: equilibrium {}, small shift {}",
                iterations,
                state.annealing.equilibrium_reached,
                small_shift
            );
        }

        let converged = state.annealing.equilibrium_reached && small_shift;
        if !converged {
            warn!(
                "Adaptive multi-vertex fit stopped after {} iterations without converging",
                iterations
            );
        }
        for vertex_id in &state.vertex_collection {
            if let Some(vertex) = state.vertices.get_mut(*vertex_id) {
                vertex.converged = converged;
            }
        }

        if self.config.do_smoothing {
            self.smooth_tracks(state)?;
        }
        Ok(AmvFitReport {
            iterations,
            converged,
        })
    }

    /// Recomputes the 3D impact parameters of the vertex's tracks at its
    /// current position.
    fn prepare_vertex_for_fit(
        &self,
        state: &mut AmvFitterState,
        vertex_id: VertexId,
        options: &VertexingOptions,
    ) -> Result<(), VertexingError> {
        let info = state
            .vtx_info
            .get_mut(&vertex_id)
            .ok_or(VertexingError::ElementNotFound)?;
        let point = info.old_position.xyz();
        for track in &info.track_links {
            let params = self.ip_estimator.estimate_3d_impact_parameters(
                &options.geometry_context,
                &options.magnetic_field_context,
                &state.tracks[*track],
                &point,
            )?;
            info.impact_params_3d.insert(*track, params);
        }
        Ok(())
    }

    fn set_all_vertex_compatibilities(
        &self,
        state: &mut AmvFitterState,
        vertex_id: VertexId,
        options: &VertexingOptions,
    ) -> Result<(), VertexingError> {
        let info = state
            .vtx_info
            .get_mut(&vertex_id)
            .ok_or(VertexingError::ElementNotFound)?;
        for track in &info.track_links {
            // Tracks added after the last relinearization
            if !info.impact_params_3d.contains_key(track) {
                let params = self.ip_estimator.estimate_3d_impact_parameters(
                    &options.geometry_context,
                    &options.magnetic_field_context,
                    &state.tracks[*track],
                    &info.linearization_point.xyz(),
                )?;
                info.impact_params_3d.insert(*track, params);
            }
            let compatibility = self.ip_estimator.vertex_compatibility(
                &options.geometry_context,
                &info.impact_params_3d[track],
                &info.old_position,
                self.config.use_time,
            )?;
            state
                .tracks_at_vertices
                .get_mut(&(*track, vertex_id))
                .ok_or(VertexingError::ElementNotFound)?
                .vertex_compatibility = compatibility;
        }
        Ok(())
    }

    /// Compatibilities of `track` with the vertices currently being fitted.
    fn collect_track_compatibilities(&self, state: &AmvFitterState, track: usize) -> Vec<f64> {
        state
            .vertices_of_track(track)
            .iter()
            .filter(|v| state.vertex_collection.contains(*v))
            .filter_map(|v| state.tracks_at_vertices.get(&(track, *v)))
            .map(|t| t.vertex_compatibility)
            .collect()
    }

    fn set_weights_and_update(
        &self,
        state: &mut AmvFitterState,
        options: &VertexingOptions,
    ) -> Result<(), VertexingError> {
        let dimension = self.dimension();
        let collection = state.vertex_collection.clone();
        for vertex_id in &collection {
            let (track_links, linearization_point, relinearize) = {
                let info = state
                    .vtx_info
                    .get(vertex_id)
                    .ok_or(VertexingError::ElementNotFound)?;
                (info.track_links.clone(), info.linearization_point, info.relinearize)
            };

            for track in track_links {
                let competing = self.collect_track_compatibilities(state, track);
                let track_at_vertex = state
                    .tracks_at_vertices
                    .get_mut(&(track, *vertex_id))
                    .ok_or(VertexingError::ElementNotFound)?;
                let weight = self.annealing.weight(
                    &state.annealing,
                    track_at_vertex.vertex_compatibility,
                    &competing,
                );
                track_at_vertex.track_weight = weight;
                if weight <= self.config.min_weight {
                    trace!("Track {} weight {:.2e} too low at vertex {}", track, weight, vertex_id);
                    continue;
                }

                if !track_at_vertex.is_linearized() || relinearize {
                    track_at_vertex.linearized_state = Some(self.linearizer.linearize_track(
                        &state.tracks[track],
                        &linearization_point,
                        &options.geometry_context,
                        &options.magnetic_field_context,
                    )?);
                }
                update_vertex_with_track(&mut state.vertices[*vertex_id], track_at_vertex, 1, dimension)?;
            }
            if let Some(info) = state.vtx_info.get_mut(vertex_id) {
                info.relinearize = false;
            }
        }
        Ok(())
    }

    /// True if no vertex moved by more than `max_relative_shift`.
    fn check_small_shift(&self, state: &AmvFitterState) -> Result<bool, VertexingError> {
        for vertex_id in &state.vertex_collection {
            let vertex = &state.vertices[*vertex_id];
            let info = state
                .vtx_info
                .get(vertex_id)
                .ok_or(VertexingError::ElementNotFound)?;
            let shift = info.old_position.xyz() - vertex.position3();
            let weight = vertex
                .covariance3()
                .try_inverse()
                .ok_or(VertexingError::SingularMatrix)?;
            if shift.dot(&(weight * shift)) > self.config.max_relative_shift {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn smooth_tracks(&self, state: &mut AmvFitterState) -> Result<(), VertexingError> {
        let dimension = self.dimension();
        for vertex_id in &state.vertex_collection {
            let vertex = &state.vertices[*vertex_id];
            let Some(info) = state.vtx_info.get(vertex_id) else {
                continue;
            };
            for track in &info.track_links {
                if let Some(track_at_vertex) = state.tracks_at_vertices.get_mut(&(*track, *vertex_id)) {
                    if track_at_vertex.track_weight > self.config.min_weight {
                        update_track_with_vertex(track_at_vertex, vertex, dimension)?;
                    }
                }
            }
        }
        Ok(())
    }
}
