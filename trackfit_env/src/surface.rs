//! Reference surfaces for bound track parameters.
//!
//! The core only needs four things from a surface: its identifier, the
//! mapping between local and global coordinates, and straight-line
//! intersection. Two concrete shapes are provided:
//! - **PlaneSurface**: a sensor plane, local frame spanned by two axes
//! - **PerigeeSurface**: a line along z through a reference point, used for
//!   impact parameters (d0, z0)

use crate::context::GeometryContext;
use crate::error::GeometryError;
use crate::types::{GeometryIdentifier, Intersection, IntersectionStatus};
use nalgebra::{Matrix3, Vector2, Vector3};
use std::fmt::Debug;
use std::sync::Arc;

/// Shared, read-only handle to a surface.
pub type SurfaceHandle = Arc<dyn Surface>;

/// Shape of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceType {
    Plane,
    Perigee,
}

/// Surface capability consumed by the fitter and the vertexing code.
///
/// Implementations must be immutable after construction: handles are shared
/// across track states and threads.
pub trait Surface: Send + Sync + Debug {
    /// Detector element identifier.
    fn geometry_id(&self) -> GeometryIdentifier;

    fn surface_type(&self) -> SurfaceType;

    /// Reference point of the surface in global coordinates.
    fn center(&self, gctx: &GeometryContext) -> Vector3<f64>;

    /// Plane normal, or the axis of a line surface.
    fn normal(&self, gctx: &GeometryContext) -> Vector3<f64>;

    /// Maps local (loc0, loc1) to a global position.
    ///
    /// `direction` is needed by line surfaces, where the sign of loc0 depends
    /// on the track direction.
    fn local_to_global(
        &self,
        gctx: &GeometryContext,
        local: &Vector2<f64>,
        direction: &Vector3<f64>,
    ) -> Vector3<f64>;

    /// Maps a global position onto local coordinates.
    ///
    /// Fails with [`GeometryError::NotOnSurface`] if the position is further
    /// than `tolerance` from the surface.
    fn global_to_local(
        &self,
        gctx: &GeometryContext,
        global: &Vector3<f64>,
        direction: &Vector3<f64>,
        tolerance: f64,
    ) -> Result<Vector2<f64>, GeometryError>;

    /// Straight-line intersection starting at `position` along `direction`.
    fn intersect(
        &self,
        gctx: &GeometryContext,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        tolerance: f64,
    ) -> Intersection;
}

// ============================================================================
// PLANE SURFACE
// ============================================================================

/// Planar sensor surface.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneSurface {
    geometry_id: GeometryIdentifier,
    center: Vector3<f64>,
    /// Columns: local x axis, local y axis, normal
    rotation: Matrix3<f64>,
}

impl PlaneSurface {
    /// Creates a plane through `center` with the given normal.
    ///
    /// The local x axis is chosen perpendicular to both the normal and the
    /// global z axis (the global x axis for planes facing along z).
    pub fn new(center: Vector3<f64>, normal: Vector3<f64>, geometry_id: GeometryIdentifier) -> Self {
        let t = normal.normalize();
        let u = if t.z.abs() < 0.999 {
            Vector3::new(-t.y, t.x, 0.0).normalize()
        } else {
            Vector3::x()
        };
        let v = t.cross(&u).normalize();
        Self {
            geometry_id,
            center,
            rotation: Matrix3::from_columns(&[u, v, t]),
        }
    }

    /// Shorthand for a telescope layer: a plane perpendicular to x at `x`.
    pub fn at_x(x: f64, geometry_id: GeometryIdentifier) -> Self {
        Self::new(Vector3::new(x, 0.0, 0.0), Vector3::x(), geometry_id)
    }

    pub fn into_handle(self) -> SurfaceHandle {
        Arc::new(self)
    }
}

impl Surface for PlaneSurface {
    fn geometry_id(&self) -> GeometryIdentifier {
        self.geometry_id
    }

    fn surface_type(&self) -> SurfaceType {
        SurfaceType::Plane
    }

    fn center(&self, _gctx: &GeometryContext) -> Vector3<f64> {
        self.center
    }

    fn normal(&self, _gctx: &GeometryContext) -> Vector3<f64> {
        self.rotation.column(2).into_owned()
    }

    fn local_to_global(
        &self,
        _gctx: &GeometryContext,
        local: &Vector2<f64>,
        _direction: &Vector3<f64>,
    ) -> Vector3<f64> {
        self.center + self.rotation * Vector3::new(local.x, local.y, 0.0)
    }

    fn global_to_local(
        &self,
        _gctx: &GeometryContext,
        global: &Vector3<f64>,
        _direction: &Vector3<f64>,
        tolerance: f64,
    ) -> Result<Vector2<f64>, GeometryError> {
        let local = self.rotation.transpose() * (global - self.center);
        if local.z.abs() > tolerance {
            return Err(GeometryError::NotOnSurface);
        }
        Ok(Vector2::new(local.x, local.y))
    }

    fn intersect(
        &self,
        gctx: &GeometryContext,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        tolerance: f64,
    ) -> Intersection {
        let normal = self.normal(gctx);
        let denom = normal.dot(direction);
        if denom.abs() < f64::EPSILON {
            return Intersection::missed();
        }
        let path_length = normal.dot(&(self.center - position)) / denom;
        let status = if path_length.abs() < tolerance {
            IntersectionStatus::OnSurface
        } else {
            IntersectionStatus::Reachable
        };
        Intersection {
            position: position + path_length * direction,
            path_length,
            status,
        }
    }
}

// ============================================================================
// PERIGEE SURFACE
// ============================================================================

/// Line surface along the global z axis through a reference point.
///
/// Local coordinates are the signed transverse distance of closest approach
/// (d0, positive when the point lies to the left of the track direction) and
/// the longitudinal offset (z0).
#[derive(Debug, Clone, PartialEq)]
pub struct PerigeeSurface {
    geometry_id: GeometryIdentifier,
    center: Vector3<f64>,
}

impl PerigeeSurface {
    pub fn new(center: Vector3<f64>) -> Self {
        Self {
            geometry_id: GeometryIdentifier::default(),
            center,
        }
    }

    pub fn with_geometry_id(mut self, geometry_id: GeometryIdentifier) -> Self {
        self.geometry_id = geometry_id;
        self
    }

    pub fn into_handle(self) -> SurfaceHandle {
        Arc::new(self)
    }

    /// Unit vector along which loc0 is measured for the given direction.
    fn loc0_axis(&self, direction: &Vector3<f64>) -> Option<Vector3<f64>> {
        let axis = Vector3::z().cross(direction);
        let norm = axis.norm();
        if norm < 1e-12 {
            None
        } else {
            Some(axis / norm)
        }
    }
}

impl Surface for PerigeeSurface {
    fn geometry_id(&self) -> GeometryIdentifier {
        self.geometry_id
    }

    fn surface_type(&self) -> SurfaceType {
        SurfaceType::Perigee
    }

    fn center(&self, _gctx: &GeometryContext) -> Vector3<f64> {
        self.center
    }

    fn normal(&self, _gctx: &GeometryContext) -> Vector3<f64> {
        Vector3::z()
    }

    fn local_to_global(
        &self,
        _gctx: &GeometryContext,
        local: &Vector2<f64>,
        direction: &Vector3<f64>,
    ) -> Vector3<f64> {
        // A track parallel to the axis has no defined loc0 direction
        let radial = self.loc0_axis(direction).unwrap_or_else(Vector3::zeros);
        self.center + local.x * radial + local.y * Vector3::z()
    }

    fn global_to_local(
        &self,
        _gctx: &GeometryContext,
        global: &Vector3<f64>,
        direction: &Vector3<f64>,
        _tolerance: f64,
    ) -> Result<Vector2<f64>, GeometryError> {
        let radial = self
            .loc0_axis(direction)
            .ok_or(GeometryError::DegenerateDirection)?;
        let offset = global - self.center;
        let loc1 = offset.z;
        let transverse = Vector3::new(offset.x, offset.y, 0.0);
        let sign = if transverse.dot(&radial) < 0.0 { -1.0 } else { 1.0 };
        Ok(Vector2::new(sign * transverse.norm(), loc1))
    }

    fn intersect(
        &self,
        _gctx: &GeometryContext,
        position: &Vector3<f64>,
        direction: &Vector3<f64>,
        tolerance: f64,
    ) -> Intersection {
        // Closest approach between the track line and the z axis line
        let axis = Vector3::z();
        let ad = axis.dot(direction);
        let denom = 1.0 - ad * ad;
        if denom < 1e-12 {
            return Intersection::missed();
        }
        let w = self.center - position;
        let path_length = w.dot(&(direction - ad * axis)) / denom;
        let status = if path_length.abs() < tolerance {
            IntersectionStatus::OnSurface
        } else {
            IntersectionStatus::Reachable
        };
        Intersection {
            position: position + path_length * direction,
            path_length,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_plane_local_global_round_trip() {
        let gctx = GeometryContext::nominal();
        let plane = PlaneSurface::new(
            Vector3::new(10.0, 2.0, -3.0),
            Vector3::new(1.0, 1.0, 0.0),
            GeometryIdentifier::new(1, 2, 3),
        );
        let dir = Vector3::new(1.0, 0.0, 0.0);
        let local = Vector2::new(0.5, -1.5);

        let global = plane.local_to_global(&gctx, &local, &dir);
        let back = plane.global_to_local(&gctx, &global, &dir, 1e-9).unwrap();

        assert_relative_eq!(back, local, epsilon = 1e-12);
    }

    #[test]
    fn test_plane_rejects_off_surface_point() {
        let gctx = GeometryContext::nominal();
        let plane = PlaneSurface::at_x(100.0, GeometryIdentifier::default());
        let result = plane.global_to_local(
            &gctx,
            &Vector3::new(101.0, 0.0, 0.0),
            &Vector3::x(),
            1e-6,
        );
        assert_eq!(result, Err(GeometryError::NotOnSurface));
    }

    #[test]
    fn test_plane_intersection() {
        let gctx = GeometryContext::nominal();
        let plane = PlaneSurface::at_x(50.0, GeometryIdentifier::default());
        let dir = Vector3::new(1.0, 1.0, 0.0).normalize();

        let hit = plane.intersect(&gctx, &Vector3::zeros(), &dir, 1e-9);

        assert_eq!(hit.status, IntersectionStatus::Reachable);
        assert_relative_eq!(hit.position.x, 50.0, epsilon = 1e-9);
        assert_relative_eq!(hit.path_length, 50.0 * 2f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_perigee_signed_d0() {
        let gctx = GeometryContext::nominal();
        let perigee = PerigeeSurface::new(Vector3::zeros());
        // Track along +x; a point at +y lies to the left of the track
        let dir = Vector3::x();

        let local = perigee
            .global_to_local(&gctx, &Vector3::new(0.0, 2.0, 5.0), &dir, 1e-9)
            .unwrap();
        assert_relative_eq!(local, Vector2::new(2.0, 5.0), epsilon = 1e-12);

        let global = perigee.local_to_global(&gctx, &Vector2::new(-3.0, 1.0), &dir);
        assert_relative_eq!(global, Vector3::new(0.0, -3.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_perigee_degenerate_direction() {
        let gctx = GeometryContext::nominal();
        let perigee = PerigeeSurface::new(Vector3::zeros());
        let result = perigee.global_to_local(&gctx, &Vector3::x(), &Vector3::z(), 1e-9);
        assert_eq!(result, Err(GeometryError::DegenerateDirection));
    }

    #[test]
    fn test_perigee_intersection_is_closest_approach() {
        let gctx = GeometryContext::nominal();
        let perigee = PerigeeSurface::new(Vector3::zeros());
        let start = Vector3::new(-10.0, 1.0, 0.0);

        let hit = perigee.intersect(&gctx, &start, &Vector3::x(), 1e-9);

        assert_relative_eq!(hit.path_length, 10.0, epsilon = 1e-12);
        assert_relative_eq!(hit.position, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }
}
