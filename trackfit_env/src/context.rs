//! Opaque calibration contexts passed through to the geometry and field.
//!
//! The core never inspects these; they exist so alignment or field-map
//! conditions can be threaded to the capabilities that need them.

use serde::{Deserialize, Serialize};

/// Alignment conditions for surface transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryContext {
    /// Alignment epoch (0 = nominal geometry)
    pub alignment_epoch: u32,
}

impl GeometryContext {
    /// Nominal (unaligned) geometry.
    pub fn nominal() -> Self {
        Self::default()
    }
}

/// Conditions for the magnetic field map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagneticFieldContext {
    /// Field map epoch (0 = nominal field)
    pub field_epoch: u32,
}
