//! Native unit system.
//!
//! Lengths in millimetres, energies and momenta in GeV, charge in units of the
//! elementary charge. The speed of light is 1, so time is measured in mm and
//! a magnetic field expressed in tesla becomes GeV / (e·mm).

pub const MM: f64 = 1.0;
pub const UM: f64 = 1e-3 * MM;
pub const CM: f64 = 10.0 * MM;
pub const M: f64 = 1e3 * MM;

pub const GEV: f64 = 1.0;
pub const MEV: f64 = 1e-3 * GEV;

/// One nanosecond expressed as a length (c·1ns).
pub const NS: f64 = 299.792458 * MM;

/// One tesla in native units.
pub const T: f64 = 0.000299792458 * GEV / MM;

pub const E: f64 = 1.0;

/// Charged pion mass, the default particle hypothesis.
pub const PION_MASS: f64 = 139.57039 * MEV;
