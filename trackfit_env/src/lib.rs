//! Trackfit Environment Abstraction Layer
//!
//! The capabilities the fitting core consumes but does not own:
//! - Geometry: reference surfaces and their local/global frames
//! - Navigation: the ordered sequence of surfaces a track crosses
//! - Field: the magnetic field used for helix transport
//!
//! Detector description and surface bounds live elsewhere; anything that
//! implements [`Surface`], [`Navigator`] or [`MagneticFieldProvider`] can be
//! plugged in.
//!
//! # Example
//!
//! ```ignore
//! use trackfit_env::{GeometryContext, GeometryIdentifier, PlaneSurface, SurfaceSequenceNavigator};
//!
//! let layers = (1..=5)
//!     .map(|i| PlaneSurface::at_x(i as f64 * 50.0, GeometryIdentifier::new(1, 1, i)).into_handle())
//!     .collect();
//! let navigator = SurfaceSequenceNavigator::new(layers);
//! ```

mod context;
mod error;
mod field;
mod navigator;
mod surface;
mod types;

pub use context::{GeometryContext, MagneticFieldContext};
pub use error::GeometryError;
pub use field::{ConstantBField, MagneticFieldProvider};
pub use navigator::{Navigator, SurfaceSequenceNavigator};
pub use surface::{PerigeeSurface, PlaneSurface, Surface, SurfaceHandle, SurfaceType};
pub use types::{GeometryIdentifier, Intersection, IntersectionStatus};
