//! Views onto a single track state of a [`MultiTrajectory`].
//!
//! A proxy is a `(store, index)` pair. [`TrackStateProxy`] borrows the store
//! shared, [`TrackStateProxyMut`] exclusively, so a proxy can neither outlive
//! the store nor observe a column reallocation.
//!
//! Accessing a component that was never allocated is a programming error:
//! it trips a debug assertion and, in release builds, the column bounds check.

use nalgebra::{SMatrix, SVector};
use trackfit_env::SurfaceHandle;

use crate::measurement::{
    Measurement, PaddedMeasurementMatrix, PaddedMeasurementVector, SourceLink, SubspaceIndices,
};
use crate::multi_trajectory::{
    Component, IndexData, MultiTrajectory, TrackIndex, TrackStatePropMask,
};
use crate::track_parameters::{
    BoundMatrix, BoundToFreeMatrix, BoundTrackParameters, BoundVector, FreeMatrix,
    FreeToBoundMatrix, FreeVector, ParticleHypothesis, E_BOUND_SIZE,
};
use crate::track_state_type::TrackStateType;

/// Accessors shared by both proxy flavours.
macro_rules! read_accessors {
    () => {
        pub fn index(&self) -> TrackIndex {
            self.index
        }

        fn data(&self) -> &IndexData {
            &self.traj.index[self.index]
        }

        fn column(&self, component: Component) -> usize {
            let column = self.data().column(component);
            debug_assert!(
                column != MultiTrajectory::INVALID,
                "track state {} has no {:?} component",
                self.index,
                component
            );
            column
        }

        /// Parent state, `None` for the first state of a trajectory.
        pub fn previous(&self) -> Option<TrackIndex> {
            self.traj.previous(self.index)
        }

        pub fn has_previous(&self) -> bool {
            self.previous().is_some()
        }

        /// Components currently allocated.
        pub fn get_mask(&self) -> TrackStatePropMask {
            self.traj.mask(self.index)
        }

        pub fn has(&self, mask: TrackStatePropMask) -> bool {
            self.get_mask().contains(mask)
        }

        pub fn has_predicted(&self) -> bool {
            self.data().has(Component::BoundPredicted)
        }

        pub fn has_filtered(&self) -> bool {
            self.data().has(Component::BoundFiltered)
        }

        pub fn has_smoothed(&self) -> bool {
            self.data().has(Component::BoundSmoothed)
        }

        pub fn has_jacobian(&self) -> bool {
            self.data().has(Component::JacobianBoundToBound)
        }

        pub fn has_calibrated(&self) -> bool {
            self.data().has(Component::Calibrated)
        }

        pub fn has_uncalibrated_source_link(&self) -> bool {
            self.data().has(Component::SourceLink)
        }

        pub fn has_reference_surface(&self) -> bool {
            self.data().reference_surface.is_some()
        }

        pub fn predicted(&self) -> &BoundVector {
            &self.traj.bound_params[self.column(Component::BoundPredicted)]
        }

        pub fn predicted_covariance(&self) -> &BoundMatrix {
            &self.traj.bound_covs[self.column(Component::BoundPredicted)]
        }

        pub fn filtered(&self) -> &BoundVector {
            &self.traj.bound_params[self.column(Component::BoundFiltered)]
        }

        pub fn filtered_covariance(&self) -> &BoundMatrix {
            &self.traj.bound_covs[self.column(Component::BoundFiltered)]
        }

        pub fn smoothed(&self) -> &BoundVector {
            &self.traj.bound_params[self.column(Component::BoundSmoothed)]
        }

        pub fn smoothed_covariance(&self) -> &BoundMatrix {
            &self.traj.bound_covs[self.column(Component::BoundSmoothed)]
        }

        /// Bound-to-bound transport jacobian from the parent to this state.
        pub fn jacobian(&self) -> &BoundMatrix {
            &self.traj.jac_bound_to_bound[self.column(Component::JacobianBoundToBound)]
        }

        pub fn free_predicted(&self) -> &FreeVector {
            &self.traj.free_params[self.column(Component::FreePredicted)]
        }

        pub fn free_predicted_covariance(&self) -> &FreeMatrix {
            &self.traj.free_covs[self.column(Component::FreePredicted)]
        }

        pub fn free_filtered(&self) -> &FreeVector {
            &self.traj.free_params[self.column(Component::FreeFiltered)]
        }

        pub fn free_filtered_covariance(&self) -> &FreeMatrix {
            &self.traj.free_covs[self.column(Component::FreeFiltered)]
        }

        pub fn free_smoothed(&self) -> &FreeVector {
            &self.traj.free_params[self.column(Component::FreeSmoothed)]
        }

        pub fn free_smoothed_covariance(&self) -> &FreeMatrix {
            &self.traj.free_covs[self.column(Component::FreeSmoothed)]
        }

        pub fn jacobian_bound_to_free(&self) -> &BoundToFreeMatrix {
            &self.traj.jac_bound_to_free[self.column(Component::JacobianBoundToFree)]
        }

        pub fn jacobian_free_to_bound(&self) -> &FreeToBoundMatrix {
            &self.traj.jac_free_to_bound[self.column(Component::JacobianFreeToBound)]
        }

        pub fn jacobian_free_to_free(&self) -> &FreeMatrix {
            &self.traj.jac_free_to_free[self.column(Component::JacobianFreeToFree)]
        }

        /// Best available parameters: smoothed, else filtered, else predicted.
        pub fn parameters(&self) -> &BoundVector {
            if self.has_smoothed() {
                self.smoothed()
            } else if self.has_filtered() {
                self.filtered()
            } else {
                self.predicted()
            }
        }

        /// Covariance matching [`Self::parameters`].
        pub fn covariance(&self) -> &BoundMatrix {
            if self.has_smoothed() {
                self.smoothed_covariance()
            } else if self.has_filtered() {
                self.filtered_covariance()
            } else {
                self.predicted_covariance()
            }
        }

        /// Dimension of the calibrated measurement, 0 if there is none.
        pub fn calibrated_size(&self) -> usize {
            if self.has_calibrated() {
                self.data().subspace.size()
            } else {
                0
            }
        }

        pub fn calibrated<const M: usize>(&self) -> SVector<f64, M> {
            debug_assert_eq!(M, self.calibrated_size());
            self.effective_calibrated().fixed_rows::<M>(0).into_owned()
        }

        pub fn calibrated_covariance<const M: usize>(&self) -> SMatrix<f64, M, M> {
            debug_assert_eq!(M, self.calibrated_size());
            self.effective_calibrated_covariance()
                .fixed_view::<M, M>(0, 0)
                .into_owned()
        }

        /// Calibrated values padded to six entries.
        pub fn effective_calibrated(&self) -> &PaddedMeasurementVector {
            &self.traj.calibrated[self.column(Component::Calibrated)]
        }

        pub fn effective_calibrated_covariance(&self) -> &PaddedMeasurementMatrix {
            &self.traj.calibrated_covs[self.column(Component::Calibrated)]
        }

        pub fn projector_subspace(&self) -> SubspaceIndices {
            self.data().subspace
        }

        pub fn projector<const M: usize>(&self) -> SMatrix<f64, M, E_BOUND_SIZE> {
            self.data().subspace.projector::<M>()
        }

        pub fn uncalibrated_source_link(&self) -> &SourceLink {
            &self.traj.source_links[self.column(Component::SourceLink)]
        }

        pub fn chi2(&self) -> f64 {
            self.data().chi2
        }

        /// Path length from the start of the trajectory (mm).
        pub fn path_length(&self) -> f64 {
            self.data().path_length
        }

        pub fn type_flags(&self) -> TrackStateType {
            self.data().type_flags
        }

        pub fn reference_surface(&self) -> Option<&SurfaceHandle> {
            self.data().reference_surface.as_ref()
        }

        /// Best estimate as standalone parameters on the reference surface.
        ///
        /// `None` if the state has no reference surface.
        pub fn bound_parameters(&self, hypothesis: ParticleHypothesis) -> Option<BoundTrackParameters> {
            let surface = self.reference_surface()?.clone();
            Some(BoundTrackParameters::new(
                surface,
                *self.parameters(),
                Some(*self.covariance()),
                hypothesis,
            ))
        }
    };
}

// ============================================================================
// READ-ONLY PROXY
// ============================================================================

/// Shared view of one track state.
#[derive(Debug, Clone, Copy)]
pub struct TrackStateProxy<'a> {
    traj: &'a MultiTrajectory,
    index: TrackIndex,
}

impl<'a> TrackStateProxy<'a> {
    pub(crate) fn new(traj: &'a MultiTrajectory, index: TrackIndex) -> Self {
        Self { traj, index }
    }

    /// The store this state lives in.
    pub fn trajectory(&self) -> &'a MultiTrajectory {
        self.traj
    }

    read_accessors!();
}

// ============================================================================
// MUTABLE PROXY
// ============================================================================

/// Exclusive view of one track state.
#[derive(Debug)]
pub struct TrackStateProxyMut<'a> {
    traj: &'a mut MultiTrajectory,
    index: TrackIndex,
}

impl<'a> TrackStateProxyMut<'a> {
    pub(crate) fn new(traj: &'a mut MultiTrajectory, index: TrackIndex) -> Self {
        Self { traj, index }
    }

    read_accessors!();

    /// Reborrows as a shared proxy.
    pub fn as_const(&self) -> TrackStateProxy<'_> {
        TrackStateProxy::new(&*self.traj, self.index)
    }

    /// Allocates the components in `mask` that are not present yet.
    pub fn add_components(&mut self, mask: TrackStatePropMask) {
        self.traj.add_track_state_components(self.index, mask);
    }

    /// Copies the components in `mask` (plus metadata) from another state.
    pub fn copy_from(&mut self, source: TrackIndex, mask: TrackStatePropMask) {
        self.traj.copy_components(source, self.index, mask);
    }

    fn data_mut(&mut self) -> &mut IndexData {
        &mut self.traj.index[self.index]
    }

    pub fn predicted_mut(&mut self) -> &mut BoundVector {
        let c = self.column(Component::BoundPredicted);
        &mut self.traj.bound_params[c]
    }

    pub fn predicted_covariance_mut(&mut self) -> &mut BoundMatrix {
        let c = self.column(Component::BoundPredicted);
        &mut self.traj.bound_covs[c]
    }

    pub fn filtered_mut(&mut self) -> &mut BoundVector {
        let c = self.column(Component::BoundFiltered);
        &mut self.traj.bound_params[c]
    }

    pub fn filtered_covariance_mut(&mut self) -> &mut BoundMatrix {
        let c = self.column(Component::BoundFiltered);
        &mut self.traj.bound_covs[c]
    }

    pub fn smoothed_mut(&mut self) -> &mut BoundVector {
        let c = self.column(Component::BoundSmoothed);
        &mut self.traj.bound_params[c]
    }

    pub fn smoothed_covariance_mut(&mut self) -> &mut BoundMatrix {
        let c = self.column(Component::BoundSmoothed);
        &mut self.traj.bound_covs[c]
    }

    pub fn jacobian_mut(&mut self) -> &mut BoundMatrix {
        let c = self.column(Component::JacobianBoundToBound);
        &mut self.traj.jac_bound_to_bound[c]
    }

    pub fn free_predicted_mut(&mut self) -> &mut FreeVector {
        let c = self.column(Component::FreePredicted);
        &mut self.traj.free_params[c]
    }

    pub fn free_predicted_covariance_mut(&mut self) -> &mut FreeMatrix {
        let c = self.column(Component::FreePredicted);
        &mut self.traj.free_covs[c]
    }

    pub fn free_filtered_mut(&mut self) -> &mut FreeVector {
        let c = self.column(Component::FreeFiltered);
        &mut self.traj.free_params[c]
    }

    pub fn free_filtered_covariance_mut(&mut self) -> &mut FreeMatrix {
        let c = self.column(Component::FreeFiltered);
        &mut self.traj.free_covs[c]
    }

    pub fn free_smoothed_mut(&mut self) -> &mut FreeVector {
        let c = self.column(Component::FreeSmoothed);
        &mut self.traj.free_params[c]
    }

    pub fn free_smoothed_covariance_mut(&mut self) -> &mut FreeMatrix {
        let c = self.column(Component::FreeSmoothed);
        &mut self.traj.free_covs[c]
    }

    pub fn jacobian_bound_to_free_mut(&mut self) -> &mut BoundToFreeMatrix {
        let c = self.column(Component::JacobianBoundToFree);
        &mut self.traj.jac_bound_to_free[c]
    }

    pub fn jacobian_free_to_bound_mut(&mut self) -> &mut FreeToBoundMatrix {
        let c = self.column(Component::JacobianFreeToBound);
        &mut self.traj.jac_free_to_bound[c]
    }

    pub fn jacobian_free_to_free_mut(&mut self) -> &mut FreeMatrix {
        let c = self.column(Component::JacobianFreeToFree);
        &mut self.traj.jac_free_to_free[c]
    }

    /// Stores a calibrated measurement together with its projector.
    ///
    /// The source link is recorded too if that component is allocated.
    pub fn set_calibrated(&mut self, measurement: &Measurement) {
        let c = self.column(Component::Calibrated);
        self.traj.calibrated[c] = *measurement.padded_parameters();
        self.traj.calibrated_covs[c] = *measurement.padded_covariance();
        self.data_mut().subspace = *measurement.subspace();
        if self.has_uncalibrated_source_link() {
            self.set_uncalibrated_source_link(*measurement.source_link());
        }
    }

    pub fn set_projector_subspace(&mut self, subspace: SubspaceIndices) {
        self.data_mut().subspace = subspace;
    }

    pub fn set_uncalibrated_source_link(&mut self, link: SourceLink) {
        let c = self.column(Component::SourceLink);
        self.traj.source_links[c] = link;
    }

    pub fn chi2_mut(&mut self) -> &mut f64 {
        &mut self.data_mut().chi2
    }

    pub fn path_length_mut(&mut self) -> &mut f64 {
        &mut self.data_mut().path_length
    }

    pub fn type_flags_mut(&mut self) -> &mut TrackStateType {
        &mut self.data_mut().type_flags
    }

    pub fn set_reference_surface(&mut self, surface: SurfaceHandle) {
        self.data_mut().reference_surface = Some(surface);
    }
}
