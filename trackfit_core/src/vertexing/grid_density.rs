//! Vertex seeding from a sparse track density grid in z (and t).
//!
//! Each track contributes a Gaussian in its impact parameters (d0, z0, t0),
//! evaluated on the beam axis (d0 = 0) at the centers of the z-t bins it
//! covers. The number of bins per track follows from the track's z (and t)
//! resolution, so a precise track touches few bins and a coarse one many.
//! Only bins that received density are stored.
//!
//! Tracks are expected at a perigee surface on the beam axis.

use std::collections::HashMap;
use std::f64::consts::PI;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::error::VertexingError;
use super::vertex::{Vertex, VertexingOptions};
use super::zscan::VertexSeedFinder;
use crate::track_parameters::{BoundTrackParameters, E_BOUND_LOC0, E_BOUND_LOC1, E_BOUND_TIME};
use crate::units::{MM, NS, UM};

/// (z bin, t bin); the t bin is always 0 without time.
pub type Bin = (i32, i32);

/// Optional lower and upper bound on the number of bins a track covers.
pub type GridSizeRange = (Option<u32>, Option<u32>);

/// FWHM of a Gaussian in units of its sigma
const FWHM_PER_SIGMA: f64 = 2.355;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`AdaptiveGridTrackDensity`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDensityConfig {
    /// Bin width in z (default: 15 um)
    pub spatial_bin_extent: f64,

    /// Track density is filled out to this many sigma in z (default: 3)
    pub n_spatial_trk_sigmas: f64,

    /// Bin width in t, in length units (default: 19 mm)
    pub temporal_bin_extent: f64,

    /// Track density is filled out to this many sigma in t (default: 3)
    pub n_temporal_trk_sigmas: f64,

    /// Bins with centers outside this z range stay empty
    /// (default: -250 mm to 250 mm)
    pub spatial_window: (f64, f64),

    /// Bins with centers outside this t range stay empty
    /// (default: -10 ns to 10 ns)
    pub temporal_window: (f64, f64),

    /// Bounds on the number of z bins per track; bounds must be odd
    /// (default: none)
    pub spatial_trk_grid_size_range: GridSizeRange,

    /// Bounds on the number of t bins per track; bounds must be odd
    /// (default: none)
    pub temporal_trk_grid_size_range: GridSizeRange,

    /// Bin in t as well as z (default: true)
    pub use_time: bool,

    /// Pick among the (up to three) highest bins the one with the highest
    /// density summed over itself and its z neighbours (default: false)
    pub use_highest_sum_z_position: bool,

    /// Bins at most this fraction below the highest one compete in the
    /// summed comparison (default: 0.01)
    pub max_relative_density_dev: f64,
}

impl Default for GridDensityConfig {
    fn default() -> Self {
        Self {
            spatial_bin_extent: 15.0 * UM,
            n_spatial_trk_sigmas: 3.0,
            temporal_bin_extent: 19.0 * MM,
            n_temporal_trk_sigmas: 3.0,
            spatial_window: (-250.0 * MM, 250.0 * MM),
            temporal_window: (-10.0 * NS, 10.0 * NS),
            spatial_trk_grid_size_range: (None, None),
            temporal_trk_grid_size_range: (None, None),
            use_time: true,
            use_highest_sum_z_position: false,
            max_relative_density_dev: 0.01,
        }
    }
}

impl GridDensityConfig {
    fn validate(&self) -> Result<(), VertexingError> {
        let positive = [
            self.spatial_bin_extent,
            self.n_spatial_trk_sigmas,
            self.temporal_bin_extent,
            self.n_temporal_trk_sigmas,
        ];
        if positive.iter().any(|v| !(*v > 0.0))
            || self.spatial_window.0 >= self.spatial_window.1
            || self.temporal_window.0 >= self.temporal_window.1
            || !(self.max_relative_density_dev >= 0.0)
            || !valid_range(self.spatial_trk_grid_size_range)
            || !valid_range(self.temporal_trk_grid_size_range)
        {
            return Err(VertexingError::InvalidInput);
        }
        Ok(())
    }
}

fn valid_range(range: GridSizeRange) -> bool {
    let odd = |size: Option<u32>| size.map_or(true, |s| s % 2 == 1);
    let ordered = match range {
        (Some(min), Some(max)) => min <= max,
        _ => true,
    };
    odd(range.0) && odd(range.1) && ordered
}

// ============================================================================
// DENSITY MAP
// ============================================================================

/// Sparse map from bins to track density.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DensityMap {
    bins: HashMap<Bin, f64>,
}

impl DensityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn contains(&self, bin: Bin) -> bool {
        self.bins.contains_key(&bin)
    }

    /// Density in `bin`, zero if it was never filled.
    pub fn get(&self, bin: Bin) -> f64 {
        self.bins.get(&bin).copied().unwrap_or(0.0)
    }

    /// Adds `density` to `bin`, creating it if needed.
    pub fn add(&mut self, bin: Bin, density: f64) {
        *self.bins.entry(bin).or_insert(0.0) += density;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Bin, f64)> + '_ {
        self.bins.iter().map(|(bin, density)| (*bin, *density))
    }

    /// Sum of all bins.
    pub fn total(&self) -> f64 {
        self.bins.values().sum()
    }

    /// Bins ordered by density, highest first; ties go to the lower bin.
    fn ranked(&self) -> Vec<(Bin, f64)> {
        let mut entries: Vec<(Bin, f64)> = self.iter().collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
    }
}

// ============================================================================
// GRID
// ============================================================================

/// Impact-parameter Gaussian of one track.
struct TrackKernel {
    impact: Vector3<f64>,
    /// Inverse covariance; the t row and column are zero without time
    weight: Matrix3<f64>,
    norm: f64,
}

impl TrackKernel {
    fn density(&self, z: f64, t: f64) -> f64 {
        let offset = Vector3::new(-self.impact.x, z - self.impact.y, t - self.impact.z);
        let exponent = (offset.transpose() * self.weight * offset)[(0, 0)];
        self.norm * (-0.5 * exponent).exp()
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveGridTrackDensity {
    config: GridDensityConfig,
}

impl AdaptiveGridTrackDensity {
    /// # Errors
    /// [`VertexingError::InvalidInput`] for non-positive bin extents or
    /// sigma counts, empty windows, a negative density deviation, or even
    /// or unordered grid size bounds.
    pub fn new(config: GridDensityConfig) -> Result<Self, VertexingError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GridDensityConfig {
        &self.config
    }

    /// Bin containing `value`; bin `n` is centered on `n * extent`.
    pub fn bin(value: f64, extent: f64) -> i32 {
        ((value / extent - 0.5).floor() + 1.0) as i32
    }

    pub fn bin_center(bin: i32, extent: f64) -> f64 {
        bin as f64 * extent
    }

    /// Odd number of bins spanning `n_sigmas` on either side, clamped to
    /// `range`.
    fn trk_grid_size(sigma: f64, n_sigmas: f64, extent: f64, range: GridSizeRange) -> u32 {
        let mut size = (2.0 * n_sigmas * sigma / extent).ceil() as u32;
        if size % 2 == 0 {
            size += 1;
        }
        if let Some(min) = range.0 {
            size = size.max(min);
        }
        if let Some(max) = range.1 {
            size = size.min(max);
        }
        size
    }

    fn spatial_bin(&self, z: f64) -> i32 {
        Self::bin(z, self.config.spatial_bin_extent)
    }

    fn temporal_bin(&self, t: f64) -> i32 {
        if self.config.use_time {
            Self::bin(t, self.config.temporal_bin_extent)
        } else {
            0
        }
    }

    fn spatial_center(&self, bin: i32) -> f64 {
        Self::bin_center(bin, self.config.spatial_bin_extent)
    }

    fn temporal_center(&self, bin: i32) -> f64 {
        if self.config.use_time {
            Self::bin_center(bin, self.config.temporal_bin_extent)
        } else {
            0.0
        }
    }

    fn kernel(&self, track: &BoundTrackParameters) -> Result<TrackKernel, VertexingError> {
        let cov = track.covariance().ok_or(VertexingError::NoCovariance)?;
        let params = track.parameters();
        let idx = [E_BOUND_LOC0, E_BOUND_LOC1, E_BOUND_TIME];
        let impact = Vector3::new(params[idx[0]], params[idx[1]], params[idx[2]]);
        let ip_cov = Matrix3::from_fn(|i, j| cov[(idx[i], idx[j])]);

        let (weight, det, dim) = if self.config.use_time {
            let weight = ip_cov.try_inverse().ok_or(VertexingError::SingularMatrix)?;
            (weight, ip_cov.determinant(), 3)
        } else {
            let spatial = ip_cov.fixed_view::<2, 2>(0, 0).into_owned();
            let inverse = spatial.try_inverse().ok_or(VertexingError::SingularMatrix)?;
            let mut weight = Matrix3::zeros();
            weight.fixed_view_mut::<2, 2>(0, 0).copy_from(&inverse);
            (weight, spatial.determinant(), 2)
        };
        if !(det > 0.0) {
            return Err(VertexingError::MatrixNotPositiveDefinite);
        }
        let norm = 1.0 / ((2.0 * PI).powi(dim) * det).sqrt();
        Ok(TrackKernel { impact, weight, norm })
    }

    /// Adds the density of `track` to `main` and returns the track's own
    /// map. A track whose d0 lies outside its z grid contributes nothing.
    ///
    /// # Errors
    /// [`VertexingError::NoCovariance`] without a covariance, and
    /// [`VertexingError::SingularMatrix`] or
    /// [`VertexingError::MatrixNotPositiveDefinite`] for a degenerate
    /// impact parameter covariance.
    pub fn add_track(
        &self,
        track: &BoundTrackParameters,
        main: &mut DensityMap,
    ) -> Result<DensityMap, VertexingError> {
        let kernel = self.kernel(track)?;
        let cov = track.covariance().ok_or(VertexingError::NoCovariance)?;
        let spatial_size = Self::trk_grid_size(
            cov[(E_BOUND_LOC1, E_BOUND_LOC1)].sqrt(),
            self.config.n_spatial_trk_sigmas,
            self.config.spatial_bin_extent,
            self.config.spatial_trk_grid_size_range,
        ) as i32;
        let temporal_size = if self.config.use_time {
            Self::trk_grid_size(
                cov[(E_BOUND_TIME, E_BOUND_TIME)].sqrt(),
                self.config.n_temporal_trk_sigmas,
                self.config.temporal_bin_extent,
                self.config.temporal_trk_grid_size_range,
            ) as i32
        } else {
            1
        };

        let d_bin = Self::bin(kernel.impact.x, self.config.spatial_bin_extent);
        let half_spatial = (spatial_size - 1) / 2;
        if d_bin.abs() > half_spatial {
            trace!("Track with d0 = {:.4} mm is off the z axis", kernel.impact.x);
            return Ok(DensityMap::new());
        }

        let central_z = self.spatial_bin(kernel.impact.y);
        let central_t = self.temporal_bin(kernel.impact.z);
        let half_temporal = (temporal_size - 1) / 2;
        let mut track_map = DensityMap::new();
        for dz in -half_spatial..=half_spatial {
            let z_bin = central_z + dz;
            let z = self.spatial_center(z_bin);
            if z < self.config.spatial_window.0 || z > self.config.spatial_window.1 {
                continue;
            }
            for dt in -half_temporal..=half_temporal {
                let t_bin = central_t + dt;
                let t = self.temporal_center(t_bin);
                if self.config.use_time
                    && (t < self.config.temporal_window.0 || t > self.config.temporal_window.1)
                {
                    continue;
                }
                let density = kernel.density(z, t);
                if density > 0.0 {
                    track_map.add((z_bin, t_bin), density);
                }
            }
        }

        for (bin, density) in track_map.iter() {
            main.add(bin, density);
        }
        Ok(track_map)
    }

    /// Removes a map returned by [`Self::add_track`] from `main`. Bins
    /// stay in `main` even when they drop to zero.
    pub fn subtract_track(&self, track_map: &DensityMap, main: &mut DensityMap) {
        for (bin, density) in track_map.iter() {
            main.add(bin, -density);
        }
    }

    /// z and t of the highest density; t is zero without time.
    ///
    /// # Errors
    /// [`VertexingError::EmptyInput`] for an empty map.
    pub fn max_zt_position(&self, map: &DensityMap) -> Result<(f64, f64), VertexingError> {
        let bin = self.max_bin(map)?;
        Ok((self.spatial_center(bin.0), self.temporal_center(bin.1)))
    }

    /// As [`Self::max_zt_position`], plus the z width of the peak
    /// estimated from its full width at half maximum. The width is zero
    /// when it cannot be estimated.
    ///
    /// # Errors
    /// [`VertexingError::EmptyInput`] for an empty map.
    pub fn max_zt_position_and_width(
        &self,
        map: &DensityMap,
    ) -> Result<((f64, f64), f64), VertexingError> {
        let bin = self.max_bin(map)?;
        let width = self.estimate_seed_width(map, bin);
        Ok(((self.spatial_center(bin.0), self.temporal_center(bin.1)), width))
    }

    fn max_bin(&self, map: &DensityMap) -> Result<Bin, VertexingError> {
        if self.config.use_highest_sum_z_position {
            return self.highest_density_sum_bin(map);
        }
        map.ranked()
            .first()
            .map(|(bin, _)| *bin)
            .ok_or(VertexingError::EmptyInput)
    }

    /// Density of `bin` plus its two z neighbours.
    fn density_sum(map: &DensityMap, bin: Bin) -> f64 {
        map.get(bin) + map.get((bin.0 - 1, bin.1)) + map.get((bin.0 + 1, bin.1))
    }

    fn highest_density_sum_bin(&self, map: &DensityMap) -> Result<Bin, VertexingError> {
        let ranked = map.ranked();
        let (first_bin, first_density) = *ranked.first().ok_or(VertexingError::EmptyInput)?;
        let deviation = first_density * self.config.max_relative_density_dev;

        let mut best = (first_bin, Self::density_sum(map, first_bin));
        for (bin, density) in ranked.iter().skip(1).take(2) {
            if first_density - density >= deviation {
                break;
            }
            let sum = Self::density_sum(map, *bin);
            if sum > best.1 {
                best = (*bin, sum);
            }
        }
        trace!("Highest summed density in bin {:?}", best.0);
        Ok(best.0)
    }

    /// Sigma in z from the FWHM around `peak`, interpolating linearly
    /// between the bins on either side of each half-maximum crossing.
    fn estimate_seed_width(&self, map: &DensityMap, peak: Bin) -> f64 {
        let half = map.get(peak) / 2.0;
        let crossing = |step: i32| -> f64 {
            let mut inner = peak.0;
            loop {
                let next = (inner + step, peak.1);
                let outer = if map.contains(next) { map.get(next) } else { 0.0 };
                if outer > half && map.contains(next) {
                    inner = next.0;
                    continue;
                }
                let inner_density = map.get((inner, peak.1));
                let fraction = (inner_density - half) / (inner_density - outer);
                return inner as f64 + step as f64 * fraction;
            }
        };
        let fwhm = (crossing(1) - crossing(-1)) * self.config.spatial_bin_extent;
        let width = fwhm / FWHM_PER_SIGMA;
        if width.is_normal() && width > 0.0 {
            width
        } else {
            0.0
        }
    }
}

// ============================================================================
// SEED FINDER
// ============================================================================

/// Configuration for the [`GridDensityVertexFinder`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDensityFinderConfig {
    pub grid: GridDensityConfig,

    /// Tracks with a larger d0 significance are skipped (default: 3.5)
    pub max_d0_significance: f64,

    /// Tracks with a larger z0 significance are skipped (default: 12)
    pub max_z0_significance: f64,

    /// Set the seed z variance from the peak width (default: false)
    pub estimate_seed_width: bool,
}

impl Default for GridDensityFinderConfig {
    fn default() -> Self {
        Self {
            grid: GridDensityConfig::default(),
            max_d0_significance: 3.5,
            max_z0_significance: 12.0,
            estimate_seed_width: false,
        }
    }
}

/// Seeds one vertex at the densest bin of the track density grid.
///
/// The grid is rebuilt from the tracks handed to each call.
#[derive(Debug, Clone)]
pub struct GridDensityVertexFinder {
    config: GridDensityFinderConfig,
    grid: AdaptiveGridTrackDensity,
}

impl GridDensityVertexFinder {
    /// # Errors
    /// [`VertexingError::InvalidInput`] for non-positive significance cuts
    /// or an invalid grid configuration.
    pub fn new(config: GridDensityFinderConfig) -> Result<Self, VertexingError> {
        if !(config.max_d0_significance > 0.0) || !(config.max_z0_significance > 0.0) {
            return Err(VertexingError::InvalidInput);
        }
        let grid = AdaptiveGridTrackDensity::new(config.grid.clone())?;
        Ok(Self { config, grid })
    }

    pub fn config(&self) -> &GridDensityFinderConfig {
        &self.config
    }

    pub fn grid(&self) -> &AdaptiveGridTrackDensity {
        &self.grid
    }

    /// Cut on the d0 and z0 significances.
    fn passes_selection(&self, track: &BoundTrackParameters) -> bool {
        let Some(cov) = track.covariance() else {
            return false;
        };
        let params = track.parameters();
        let d0_sig2 = params[E_BOUND_LOC0].powi(2) / cov[(E_BOUND_LOC0, E_BOUND_LOC0)];
        let z0_sig2 = params[E_BOUND_LOC1].powi(2) / cov[(E_BOUND_LOC1, E_BOUND_LOC1)];
        d0_sig2 <= self.config.max_d0_significance.powi(2)
            && z0_sig2 <= self.config.max_z0_significance.powi(2)
    }

    /// Density map over the selected tracks.
    ///
    /// # Errors
    /// As [`AdaptiveGridTrackDensity::add_track`].
    pub fn fill(&self, tracks: &[BoundTrackParameters]) -> Result<DensityMap, VertexingError> {
        let mut main = DensityMap::new();
        let mut n_used = 0;
        for track in tracks.iter().filter(|t| self.passes_selection(t)) {
            self.grid.add_track(track, &mut main)?;
            n_used += 1;
        }
        trace!(
            "Density grid of {} bins from {} of {} tracks",
            main.len(),
            n_used,
            tracks.len()
        );
        Ok(main)
    }
}

impl VertexSeedFinder for GridDensityVertexFinder {
    fn find(
        &self,
        tracks: &[BoundTrackParameters],
        options: &VertexingOptions,
    ) -> Result<Vec<Vertex>, VertexingError> {
        let main = self.fill(tracks)?;
        if main.is_empty() {
            return Ok(Vec::new());
        }

        let ((z, t), width) = if self.config.estimate_seed_width {
            self.grid.max_zt_position_and_width(&main)?
        } else {
            (self.grid.max_zt_position(&main)?, 0.0)
        };

        let constraint = &options.constraint;
        let mut position = constraint.position;
        position.z = z;
        if self.config.grid.use_time {
            position.w = t;
        }
        let mut covariance = constraint.covariance;
        if width > 0.0 {
            covariance[(2, 2)] = width * width;
        }
        debug!("Grid density seed at z = {:.3} mm, t = {:.3} mm", z, position.w);
        Ok(vec![Vertex::with_covariance(position, covariance)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track_parameters::{BoundMatrix, BoundVector, ParticleHypothesis};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector4};

    /// z-only grid with 0.1 mm bins.
    fn coarse_config() -> GridDensityConfig {
        GridDensityConfig {
            spatial_bin_extent: 0.1,
            use_time: false,
            ..GridDensityConfig::default()
        }
    }

    fn grid(config: GridDensityConfig) -> AdaptiveGridTrackDensity {
        AdaptiveGridTrackDensity::new(config).unwrap()
    }

    fn track_with(d0: f64, z0: f64, t0: f64, variances: [f64; 6]) -> BoundTrackParameters {
        BoundTrackParameters::perigee(
            Vector3::zeros(),
            BoundVector::from_column_slice(&[d0, z0, 0.4, 1.2, 0.5, t0]),
            Some(BoundMatrix::from_diagonal(&BoundVector::from_column_slice(&variances))),
            ParticleHypothesis::pion(),
        )
    }

    /// Unit covariance track.
    fn track(d0: f64, z0: f64) -> BoundTrackParameters {
        track_with(d0, z0, 0.0, [1.0; 6])
    }

    // ========================================================================
    // GRID
    // ========================================================================

    #[test]
    fn test_bins_are_centered_on_multiples_of_extent() {
        assert_eq!(AdaptiveGridTrackDensity::bin(0.0, 0.1), 0);
        assert_eq!(AdaptiveGridTrackDensity::bin(0.049, 0.1), 0);
        assert_eq!(AdaptiveGridTrackDensity::bin(0.051, 0.1), 1);
        assert_eq!(AdaptiveGridTrackDensity::bin(-0.051, 0.1), -1);
        assert_relative_eq!(AdaptiveGridTrackDensity::bin_center(-3, 0.1), -0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_track_grid_size_is_odd_and_clamped() {
        // 6 sigma over 0.1 mm bins
        assert_eq!(AdaptiveGridTrackDensity::trk_grid_size(1.0, 3.0, 0.1, (None, None)), 61);
        assert_eq!(AdaptiveGridTrackDensity::trk_grid_size(1.0, 3.0, 0.12, (None, None)), 51);
        assert_eq!(AdaptiveGridTrackDensity::trk_grid_size(1.0, 3.0, 0.1, (None, Some(21))), 21);
        assert_eq!(AdaptiveGridTrackDensity::trk_grid_size(0.01, 3.0, 0.1, (Some(5), None)), 5);
    }

    #[test]
    fn test_adding_tracks_fills_sparse_bins() {
        let grid = grid(coarse_config());
        let mut main = DensityMap::new();

        // Far from the z axis
        let off_axis = grid.add_track(&track(100.0, -0.4), &mut main).unwrap();
        assert!(off_axis.is_empty());
        assert!(main.is_empty());

        let first = grid.add_track(&track(0.01, -0.4), &mut main).unwrap();
        assert_eq!(first.len(), 61);
        assert_eq!(main.len(), 61);

        // Disjoint from the first track
        grid.add_track(&track(0.01, 12.0), &mut main).unwrap();
        assert_eq!(main.len(), 122);

        // Two bins of overlap with the first track
        grid.add_track(&track(0.01, 5.5), &mut main).unwrap();
        assert_eq!(main.len(), 3 * 61 - 2);

        // The same track again adds no bins
        grid.add_track(&track(0.01, -0.4), &mut main).unwrap();
        assert_eq!(main.len(), 3 * 61 - 2);
    }

    #[test]
    fn test_subtracting_restores_density() {
        let grid = grid(coarse_config());
        let mut main = DensityMap::new();
        let params = track(0.1, -0.45);

        let once = grid.add_track(&params, &mut main).unwrap();
        let single = main.total();
        assert!(single > 0.0);

        grid.add_track(&params, &mut main).unwrap();
        assert_relative_eq!(main.total(), 2.0 * single, max_relative = 1e-12);
        assert_eq!(main.len(), 61);

        grid.subtract_track(&once, &mut main);
        assert_relative_eq!(main.total(), single, max_relative = 1e-12);
        assert_eq!(main.len(), 61);

        grid.subtract_track(&once, &mut main);
        assert_relative_eq!(main.total(), 0.0, epsilon = 1e-12);
        assert_eq!(main.len(), 61);
    }

    #[test]
    fn test_maximum_moves_to_track_closer_to_axis() {
        let grid = grid(coarse_config());
        let mut main = DensityMap::new();

        grid.add_track(&track(0.02, 0.3), &mut main).unwrap();
        let (z, t) = grid.max_zt_position(&main).unwrap();
        assert_relative_eq!(z, 0.3, epsilon = 1e-9);
        assert_relative_eq!(t, 0.0);

        grid.add_track(&track(0.01, -10.9), &mut main).unwrap();
        let (z, _) = grid.max_zt_position(&main).unwrap();
        assert_relative_eq!(z, -10.9, epsilon = 1e-9);

        let ((z, _), width) = grid.max_zt_position_and_width(&main).unwrap();
        assert_relative_eq!(z, -10.9, epsilon = 1e-9);
        assert!(width > 0.0);
    }

    #[test]
    fn test_width_matches_track_resolution() {
        let grid = grid(coarse_config());
        let mut main = DensityMap::new();
        grid.add_track(&track(0.0, 2.0), &mut main).unwrap();
        let ((z, _), width) = grid.max_zt_position_and_width(&main).unwrap();
        assert_relative_eq!(z, 2.0, epsilon = 1e-9);
        // Unit sigma in z, up to the linear interpolation
        assert_relative_eq!(width, 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_empty_map_has_no_maximum() {
        let grid = grid(coarse_config());
        assert!(matches!(
            grid.max_zt_position(&DensityMap::new()),
            Err(VertexingError::EmptyInput)
        ));
    }

    #[test]
    fn test_highest_sum_prefers_broader_peak() {
        let grid = grid(GridDensityConfig {
            use_highest_sum_z_position: true,
            ..coarse_config()
        });
        let mut main = DensityMap::new();

        grid.add_track(&track(0.01, 0.3), &mut main).unwrap();
        assert_relative_eq!(grid.max_zt_position(&main).unwrap().0, 0.3, epsilon = 1e-9);

        // Slightly higher peak
        grid.add_track(&track(0.009, -10.9), &mut main).unwrap();
        assert_relative_eq!(grid.max_zt_position(&main).unwrap().0, -10.9, epsilon = 1e-9);

        // Small additions beside the lower peak outweigh the difference
        main.add((2, 0), 5e-4);
        main.add((4, 0), 5e-4);
        assert_relative_eq!(grid.max_zt_position(&main).unwrap().0, 0.3, epsilon = 1e-9);

        // Without the summed comparison the highest bin wins
        let plain = self::grid(coarse_config());
        assert_relative_eq!(plain.max_zt_position(&main).unwrap().0, -10.9, epsilon = 1e-9);
    }

    #[test]
    fn test_time_binning() {
        let config = GridDensityConfig {
            spatial_bin_extent: 0.1,
            temporal_bin_extent: 10.0,
            ..GridDensityConfig::default()
        };
        let grid = grid(config);
        let mut main = DensityMap::new();
        grid.add_track(&track_with(0.0, 1.0, 200.0, [0.04, 0.04, 1.0, 1.0, 1.0, 100.0]), &mut main)
            .unwrap();
        let (z, t) = grid.max_zt_position(&main).unwrap();
        assert_relative_eq!(z, 1.0, epsilon = 1e-9);
        assert_relative_eq!(t, 200.0, epsilon = 1e-9);
        // 13 z bins by 7 t bins
        assert_eq!(main.len(), 13 * 7);
    }

    #[test]
    fn test_window_limits_filled_bins() {
        let grid = grid(GridDensityConfig {
            spatial_window: (-1.0, 1.0),
            ..coarse_config()
        });
        let mut main = DensityMap::new();
        grid.add_track(&track(0.0, 0.95), &mut main).unwrap();
        assert!(main.iter().all(|((z_bin, _), _)| z_bin <= 10));
        assert!(main.len() < 61);
    }

    #[test]
    fn test_track_without_covariance_is_rejected() {
        let grid = grid(coarse_config());
        let mut params = track(0.0, 1.0);
        params.set_covariance(None);
        assert!(matches!(
            grid.add_track(&params, &mut DensityMap::new()),
            Err(VertexingError::NoCovariance)
        ));
    }

    #[test]
    fn test_rejects_invalid_grid_config() {
        let even_bound = GridDensityConfig {
            spatial_trk_grid_size_range: (Some(4), None),
            ..GridDensityConfig::default()
        };
        assert!(AdaptiveGridTrackDensity::new(even_bound).is_err());
        let no_extent = GridDensityConfig {
            spatial_bin_extent: 0.0,
            ..GridDensityConfig::default()
        };
        assert!(AdaptiveGridTrackDensity::new(no_extent).is_err());
        let inverted = GridDensityConfig {
            temporal_window: (1.0, -1.0),
            ..GridDensityConfig::default()
        };
        assert!(AdaptiveGridTrackDensity::new(inverted).is_err());
    }

    // ========================================================================
    // SEED FINDER
    // ========================================================================

    fn finder(config: GridDensityFinderConfig) -> GridDensityVertexFinder {
        GridDensityVertexFinder::new(config).unwrap()
    }

    fn z_only() -> GridDensityFinderConfig {
        GridDensityFinderConfig {
            grid: GridDensityConfig {
                use_time: false,
                ..GridDensityConfig::default()
            },
            ..GridDensityFinderConfig::default()
        }
    }

    #[test]
    fn test_seed_at_densest_z() {
        let tracks: Vec<_> = [4.9, 5.0, 5.05, 5.1, -8.0, 9.0]
            .iter()
            .map(|z| track(0.0, *z))
            .collect();
        let seeds = finder(z_only()).find(&tracks, &VertexingOptions::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert!((seeds[0].position.z - 5.0).abs() < 0.1, "seed at {}", seeds[0].position.z);
        assert_relative_eq!(seeds[0].position.w, 0.0);
        assert!(seeds[0].has_zero_covariance());
    }

    #[test]
    fn test_insignificant_tracks_give_no_seed() {
        // d0 of 5 sigma, z0 of 20 sigma
        let tracks = vec![track(5.0, 0.0), track(0.0, 20.0)];
        let seeds = finder(z_only()).find(&tracks, &VertexingOptions::default()).unwrap();
        assert!(seeds.is_empty());

        let mut no_cov = track(0.0, 1.0);
        no_cov.set_covariance(None);
        let seeds = finder(z_only()).find(&[no_cov], &VertexingOptions::default()).unwrap();
        assert!(seeds.is_empty());
    }

    #[test]
    fn test_seed_keeps_constraint_and_sets_width() {
        let constraint = Vertex::with_covariance(
            Vector4::new(0.1, -0.1, 0.0, 0.0),
            Matrix4::from_diagonal(&Vector4::new(0.01, 0.01, 100.0, 1.0)),
        );
        let options = VertexingOptions::with_constraint(constraint);
        let config = GridDensityFinderConfig {
            estimate_seed_width: true,
            ..z_only()
        };
        let tracks: Vec<_> = [-2.0, -2.0, -1.95].iter().map(|z| track(0.0, *z)).collect();

        let seeds = finder(config).find(&tracks, &options).unwrap();
        assert_eq!(seeds.len(), 1);
        let seed = &seeds[0];
        assert_relative_eq!(seed.position.x, 0.1);
        assert_relative_eq!(seed.position.y, -0.1);
        assert!((seed.position.z + 2.0).abs() < 0.05);
        assert_relative_eq!(seed.covariance[(0, 0)], 0.01);
        // Three unit-sigma tracks within 50 um
        assert!((seed.covariance[(2, 2)].sqrt() - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_seed_time_from_time_grid() {
        let config = GridDensityFinderConfig {
            grid: GridDensityConfig {
                spatial_bin_extent: 0.1,
                temporal_bin_extent: 10.0,
                ..GridDensityConfig::default()
            },
            ..GridDensityFinderConfig::default()
        };
        let variances = [0.04, 0.04, 1.0, 1.0, 1.0, 100.0];
        let tracks = vec![
            track_with(0.0, 1.0, 300.0, variances),
            track_with(0.0, 1.0, 300.0, variances),
            track_with(0.0, -1.0, -500.0, variances),
        ];
        let seeds = finder(config).find(&tracks, &VertexingOptions::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_relative_eq!(seeds[0].position.z, 1.0, epsilon = 1e-9);
        assert_relative_eq!(seeds[0].position.w, 300.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rejects_invalid_finder_config() {
        let config = GridDensityFinderConfig {
            max_d0_significance: 0.0,
            ..GridDensityFinderConfig::default()
        };
        assert!(GridDensityVertexFinder::new(config).is_err());
    }
}
