//! Measurements and their projection onto the bound parameter space.
//!
//! A measurement constrains between one and six bound parameters. Which ones
//! is described by a [`SubspaceIndices`]: strictly increasing, duplicate free
//! bound indices. The projector `H` (M x 6) picks those components out of a
//! bound vector; its transpose (the expander) embeds an M-vector back.
//!
//! The filter algebra is written once over a const-generic size `M`;
//! [`visit_measurement_size`] is the single runtime switch that turns a
//! stored size into the matching instantiation.

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;
use trackfit_env::GeometryIdentifier;

use crate::track_parameters::{difference_periodic, BoundVector, E_BOUND_PHI, E_BOUND_SIZE};

/// Largest measurement dimension (a full bound vector).
pub const MAX_MEASUREMENT_SIZE: usize = E_BOUND_SIZE;

/// Measurement vector padded to the full bound size.
pub type PaddedMeasurementVector = SVector<f64, MAX_MEASUREMENT_SIZE>;

/// Measurement covariance padded to the full bound size.
pub type PaddedMeasurementMatrix = SMatrix<f64, MAX_MEASUREMENT_SIZE, MAX_MEASUREMENT_SIZE>;

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while building a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MeasurementError {
    #[error("Measurement subspace is empty.")]
    EmptySubspace,

    #[error("Measurement subspace has more than six indices.")]
    SubspaceTooLarge,

    #[error("Measurement subspace index is not a bound parameter index.")]
    IndexOutOfRange,

    #[error("Measurement subspace indices are not strictly increasing.")]
    NotStrictlyOrdered,

    #[error("Measurement dimension does not match its subspace.")]
    DimensionMismatch,
}

impl MeasurementError {
    pub fn code(&self) -> i32 {
        match self {
            Self::EmptySubspace => 1,
            Self::SubspaceTooLarge => 2,
            Self::IndexOutOfRange => 3,
            Self::NotStrictlyOrdered => 4,
            Self::DimensionMismatch => 5,
        }
    }
}

// ============================================================================
// SUBSPACE INDICES
// ============================================================================

/// Ordered, duplicate free set of measured bound parameter indices.
///
/// Stored inline with a bitmask so membership tests are O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubspaceIndices {
    indices: [u8; MAX_MEASUREMENT_SIZE],
    size: u8,
    mask: u8,
}

impl SubspaceIndices {
    /// Validates and stores the measured indices.
    pub fn new(indices: &[usize]) -> Result<Self, MeasurementError> {
        if indices.is_empty() {
            return Err(MeasurementError::EmptySubspace);
        }
        if indices.len() > MAX_MEASUREMENT_SIZE {
            return Err(MeasurementError::SubspaceTooLarge);
        }

        let mut out = Self {
            indices: [0; MAX_MEASUREMENT_SIZE],
            size: indices.len() as u8,
            mask: 0,
        };
        for (i, &idx) in indices.iter().enumerate() {
            if idx >= E_BOUND_SIZE {
                return Err(MeasurementError::IndexOutOfRange);
            }
            if i > 0 && indices[i - 1] >= idx {
                return Err(MeasurementError::NotStrictlyOrdered);
            }
            out.indices[i] = idx as u8;
            out.mask |= 1 << idx;
        }
        Ok(out)
    }

    /// Subspace measuring the full bound vector.
    pub fn full() -> Self {
        Self {
            indices: [0, 1, 2, 3, 4, 5],
            size: MAX_MEASUREMENT_SIZE as u8,
            mask: 0b11_1111,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn contains(&self, bound_index: usize) -> bool {
        bound_index < E_BOUND_SIZE && self.mask & (1 << bound_index) != 0
    }

    /// Position of a bound index within the measurement vector.
    pub fn position_of(&self, bound_index: usize) -> Option<usize> {
        self.iter().position(|i| i == bound_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices[..self.size()].iter().map(|&i| i as usize)
    }

    /// Projector `H` selecting the measured components (M x 6).
    pub fn projector<const M: usize>(&self) -> SMatrix<f64, M, E_BOUND_SIZE> {
        debug_assert_eq!(M, self.size(), "projector size does not match subspace");
        let mut h = SMatrix::<f64, M, E_BOUND_SIZE>::zeros();
        for (row, col) in self.iter().take(M).enumerate() {
            h[(row, col)] = 1.0;
        }
        h
    }

    /// Expander `Hᵀ` embedding a measurement into the bound space (6 x M).
    pub fn expander<const M: usize>(&self) -> SMatrix<f64, E_BOUND_SIZE, M> {
        self.projector::<M>().transpose()
    }

    /// Projector padded to 6 x 6 (unmeasured rows are zero).
    pub fn full_projector(&self) -> SMatrix<f64, E_BOUND_SIZE, E_BOUND_SIZE> {
        let mut h = SMatrix::<f64, E_BOUND_SIZE, E_BOUND_SIZE>::zeros();
        for (row, col) in self.iter().enumerate() {
            h[(row, col)] = 1.0;
        }
        h
    }

    /// Measured components of a bound vector.
    pub fn project_vector<const M: usize>(&self, bound: &BoundVector) -> SVector<f64, M> {
        self.projector::<M>() * bound
    }
}

impl Default for SubspaceIndices {
    fn default() -> Self {
        Self::full()
    }
}

// ============================================================================
// SOURCE LINK & MEASUREMENT
// ============================================================================

/// Opaque reference back to the raw hit a measurement came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLink {
    /// Surface the hit was recorded on
    pub geometry_id: GeometryIdentifier,

    /// Index of the hit in the caller's hit container
    pub index: usize,
}

impl SourceLink {
    pub fn new(geometry_id: GeometryIdentifier, index: usize) -> Self {
        Self { geometry_id, index }
    }
}

/// A calibrated measurement of dimension 1..=6.
///
/// Values are stored padded to six components; only the leading
/// `subspace.size()` entries are meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    source_link: SourceLink,
    subspace: SubspaceIndices,
    parameters: PaddedMeasurementVector,
    covariance: PaddedMeasurementMatrix,
}

impl Measurement {
    /// Creates a measurement of fixed size `M`.
    ///
    /// # Arguments
    /// * `source_link` - Back reference to the raw hit
    /// * `indices` - Measured bound indices, strictly increasing
    /// * `parameters` - Measured values in the order of `indices`
    /// * `covariance` - Measurement covariance
    pub fn new<const M: usize>(
        source_link: SourceLink,
        indices: [usize; M],
        parameters: SVector<f64, M>,
        covariance: SMatrix<f64, M, M>,
    ) -> Result<Self, MeasurementError> {
        let subspace = SubspaceIndices::new(&indices)?;

        let mut padded_params = PaddedMeasurementVector::zeros();
        padded_params.fixed_rows_mut::<M>(0).copy_from(&parameters);
        let mut padded_cov = PaddedMeasurementMatrix::zeros();
        padded_cov.fixed_view_mut::<M, M>(0, 0).copy_from(&covariance);

        Ok(Self {
            source_link,
            subspace,
            parameters: padded_params,
            covariance: padded_cov,
        })
    }

    /// Builds a measurement from padded storage, e.g. read back from a
    /// trajectory.
    pub fn from_padded(
        source_link: SourceLink,
        subspace: SubspaceIndices,
        parameters: PaddedMeasurementVector,
        covariance: PaddedMeasurementMatrix,
    ) -> Self {
        Self {
            source_link,
            subspace,
            parameters,
            covariance,
        }
    }

    pub fn size(&self) -> usize {
        self.subspace.size()
    }

    pub fn source_link(&self) -> &SourceLink {
        &self.source_link
    }

    pub fn subspace(&self) -> &SubspaceIndices {
        &self.subspace
    }

    pub fn parameters<const M: usize>(&self) -> SVector<f64, M> {
        debug_assert_eq!(M, self.size(), "measurement accessed with wrong size");
        self.parameters.fixed_rows::<M>(0).into_owned()
    }

    pub fn covariance<const M: usize>(&self) -> SMatrix<f64, M, M> {
        debug_assert_eq!(M, self.size(), "measurement accessed with wrong size");
        self.covariance.fixed_view::<M, M>(0, 0).into_owned()
    }

    pub fn padded_parameters(&self) -> &PaddedMeasurementVector {
        &self.parameters
    }

    pub fn padded_covariance(&self) -> &PaddedMeasurementMatrix {
        &self.covariance
    }
}

/// Residual `m - H x`, with a measured phi taken along the short arc.
pub fn measurement_residual<const M: usize>(
    subspace: &SubspaceIndices,
    measured: &SVector<f64, M>,
    bound: &BoundVector,
) -> SVector<f64, M> {
    let mut residual = measured - subspace.project_vector::<M>(bound);
    if let Some(i) = subspace.position_of(E_BOUND_PHI) {
        residual[i] = difference_periodic(measured[i], bound[E_BOUND_PHI], 2.0 * PI);
    }
    residual
}

// ============================================================================
// SIZE DISPATCH
// ============================================================================

/// Computation instantiated for one compile-time measurement size.
pub trait MeasurementSizeVisitor {
    type Output;

    fn visit<const M: usize>(self) -> Self::Output;
}

/// Dispatches a runtime measurement size to the matching instantiation.
///
/// # Panics
/// If `size` is outside `1..=6`. Sizes come from validated
/// [`SubspaceIndices`], so this indicates a corrupted store.
pub fn visit_measurement_size<V: MeasurementSizeVisitor>(size: usize, visitor: V) -> V::Output {
    match size {
        1 => visitor.visit::<1>(),
        2 => visitor.visit::<2>(),
        3 => visitor.visit::<3>(),
        4 => visitor.visit::<4>(),
        5 => visitor.visit::<5>(),
        6 => visitor.visit::<6>(),
        _ => panic!("measurement size {size} outside 1..=6"),
    }
}
