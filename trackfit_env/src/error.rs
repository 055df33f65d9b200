//! Error types for the geometry capabilities.

use thiserror::Error;

/// Errors that can occur when mapping between global and surface-local frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum GeometryError {
    /// The global position is not on the surface within tolerance
    #[error("Global position is not on the surface.")]
    NotOnSurface,

    /// No forward intersection with the surface exists
    #[error("No intersection with the surface.")]
    NoIntersection,

    /// The direction is parallel to a line surface axis (local frame undefined)
    #[error("Direction is degenerate with respect to the surface.")]
    DegenerateDirection,
}

impl GeometryError {
    /// Stable integer code of this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotOnSurface => 1,
            Self::NoIntersection => 2,
            Self::DegenerateDirection => 3,
        }
    }
}
