//! Common types for the geometry capabilities.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Hierarchical identifier of a detector element.
///
/// Packs volume, layer and sensitive element ids into one 64 bit value so it
/// can be used as a cheap map key for measurement lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeometryIdentifier(pub u64);

impl GeometryIdentifier {
    const VOLUME_MASK: u64 = 0xff00_0000_0000_0000;
    const LAYER_MASK: u64 = 0x0000_fff0_0000_0000;
    const SENSITIVE_MASK: u64 = 0x0000_0000_0fff_ff00;

    /// Builds an identifier from its components.
    ///
    /// Components wider than their field are truncated.
    pub fn new(volume: u64, layer: u64, sensitive: u64) -> Self {
        Self(0)
            .with_field(Self::VOLUME_MASK, volume)
            .with_field(Self::LAYER_MASK, layer)
            .with_field(Self::SENSITIVE_MASK, sensitive)
    }

    pub fn volume(&self) -> u64 {
        self.field(Self::VOLUME_MASK)
    }

    pub fn layer(&self) -> u64 {
        self.field(Self::LAYER_MASK)
    }

    pub fn sensitive(&self) -> u64 {
        self.field(Self::SENSITIVE_MASK)
    }

    /// Returns the raw packed value.
    pub fn value(&self) -> u64 {
        self.0
    }

    fn field(&self, mask: u64) -> u64 {
        (self.0 & mask) >> mask.trailing_zeros()
    }

    fn with_field(self, mask: u64, value: u64) -> Self {
        let shifted = (value << mask.trailing_zeros()) & mask;
        Self((self.0 & !mask) | shifted)
    }
}

impl std::fmt::Display for GeometryIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vol={}|lay={}|sen={}",
            self.volume(),
            self.layer(),
            self.sensitive()
        )
    }
}

/// Reachability of a surface intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntersectionStatus {
    /// The surface cannot be reached along the given direction
    Missed,
    /// The surface is reachable at a finite path length
    Reachable,
    /// The start position is already on the surface
    OnSurface,
}

/// Straight-line intersection of a track with a surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intersection {
    /// Global intersection position
    pub position: Vector3<f64>,

    /// Signed path length from the start position (mm)
    pub path_length: f64,

    pub status: IntersectionStatus,
}

impl Intersection {
    /// An intersection that does not exist.
    pub fn missed() -> Self {
        Self {
            position: Vector3::repeat(f64::NAN),
            path_length: f64::INFINITY,
            status: IntersectionStatus::Missed,
        }
    }

    /// True if the surface can be reached.
    pub fn is_valid(&self) -> bool {
        self.status != IntersectionStatus::Missed
    }
}
