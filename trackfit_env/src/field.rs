//! Magnetic field capability.

use crate::context::MagneticFieldContext;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Provides the magnetic field at a global position.
///
/// Field values are in native units (GeV / (e·mm)), i.e. a field given in
/// tesla must be multiplied by the tesla unit constant of the core.
pub trait MagneticFieldProvider: Send + Sync {
    fn field_at(&self, mctx: &MagneticFieldContext, position: &Vector3<f64>) -> Vector3<f64>;
}

/// Homogeneous field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantBField {
    field: Vector3<f64>,
}

impl ConstantBField {
    pub fn new(field: Vector3<f64>) -> Self {
        Self { field }
    }

    /// Solenoidal field along the global z axis.
    pub fn along_z(bz: f64) -> Self {
        Self::new(Vector3::new(0.0, 0.0, bz))
    }

    /// Field-free region.
    pub fn zero() -> Self {
        Self::new(Vector3::zeros())
    }

    /// The z component of the field.
    pub fn bz(&self) -> f64 {
        self.field.z
    }

    pub fn field(&self) -> Vector3<f64> {
        self.field
    }
}

impl MagneticFieldProvider for ConstantBField {
    fn field_at(&self, _mctx: &MagneticFieldContext, _position: &Vector3<f64>) -> Vector3<f64> {
        self.field
    }
}
