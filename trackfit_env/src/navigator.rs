//! Surface navigation for the track fitter.

use crate::context::GeometryContext;
use crate::surface::SurfaceHandle;
use crate::types::{GeometryIdentifier, Intersection};
use nalgebra::Vector3;

/// Finds the next surface a track will cross.
///
/// The fitter calls this repeatedly, passing the surface it currently sits
/// on so it is not found again.
pub trait Navigator: Send + Sync {
    /// Returns the closest surface strictly ahead of `position` along
    /// `direction`, or `None` when the track leaves the detector.
    fn next_surface(
        &self,
        gctx: &GeometryContext,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        current: Option<GeometryIdentifier>,
    ) -> Option<(SurfaceHandle, Intersection)>;
}

/// Navigator over a flat list of surfaces (e.g. a telescope of planes).
#[derive(Debug, Clone)]
pub struct SurfaceSequenceNavigator {
    surfaces: Vec<SurfaceHandle>,
    /// Minimum forward path length for a surface to count as "ahead" (mm)
    tolerance: f64,
}

impl SurfaceSequenceNavigator {
    pub fn new(surfaces: Vec<SurfaceHandle>) -> Self {
        Self {
            surfaces,
            tolerance: 1e-6,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn surfaces(&self) -> &[SurfaceHandle] {
        &self.surfaces
    }
}

impl Navigator for SurfaceSequenceNavigator {
    fn next_surface(
        &self,
        gctx: &GeometryContext,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        current: Option<GeometryIdentifier>,
    ) -> Option<(SurfaceHandle, Intersection)> {
        self.surfaces
            .iter()
            .filter(|s| Some(s.geometry_id()) != current)
            .map(|s| (s, s.intersect(gctx, position, direction, self.tolerance)))
            .filter(|(_, hit)| hit.is_valid() && hit.path_length > self.tolerance)
            .min_by(|(_, a), (_, b)| a.path_length.total_cmp(&b.path_length))
            .map(|(s, hit)| (s.clone(), hit))
    }
}
