//! The multi-trajectory store
//!
//! An arena of track states with column storage:
//! - every track state is a small index record (parent link, one column
//!   index per component, chi2, path length, flags, surface)
//! - the heavy data (parameter vectors, covariances, jacobians, calibrated
//!   measurements) lives in per-kind `Vec` columns
//! - a trajectory is identified by its tip; following parent links from
//!   the tip walks it backwards
//!
//! Many trajectories (e.g. the branches of a combinatorial track finder)
//! can live in one store and share states or individual columns.
//!
//! Component presence is derived from the column indices, so it can only
//! ever grow: [`MultiTrajectory::add_track_state_components`] allocates,
//! nothing deallocates short of [`MultiTrajectory::clear`].

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use trackfit_env::SurfaceHandle;

use crate::measurement::{
    PaddedMeasurementMatrix, PaddedMeasurementVector, SourceLink, SubspaceIndices,
};
use crate::track_parameters::{
    BoundMatrix, BoundToFreeMatrix, BoundVector, FreeMatrix, FreeToBoundMatrix, FreeVector,
};
use crate::track_state::{TrackStateProxy, TrackStateProxyMut};
use crate::track_state_type::TrackStateType;

/// Index of a track state within a [`MultiTrajectory`].
pub type TrackIndex = usize;

// ============================================================================
// COMPONENT MASK
// ============================================================================

/// Bit set naming the optional components of a track state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackStatePropMask(u16);

impl TrackStatePropMask {
    pub const NONE: Self = Self(0);
    pub const BOUND_PREDICTED: Self = Self(1 << 0);
    pub const BOUND_FILTERED: Self = Self(1 << 1);
    pub const BOUND_SMOOTHED: Self = Self(1 << 2);
    pub const FREE_PREDICTED: Self = Self(1 << 3);
    pub const FREE_FILTERED: Self = Self(1 << 4);
    pub const FREE_SMOOTHED: Self = Self(1 << 5);
    pub const JACOBIAN_BOUND_TO_BOUND: Self = Self(1 << 6);
    pub const JACOBIAN_BOUND_TO_FREE: Self = Self(1 << 7);
    pub const JACOBIAN_FREE_TO_BOUND: Self = Self(1 << 8);
    pub const JACOBIAN_FREE_TO_FREE: Self = Self(1 << 9);
    pub const SOURCE_LINK: Self = Self(1 << 10);
    pub const CALIBRATED: Self = Self(1 << 11);
    pub const ALL: Self = Self((1 << 12) - 1);

    pub const PREDICTED: Self = Self::BOUND_PREDICTED;
    pub const FILTERED: Self = Self::BOUND_FILTERED;
    pub const SMOOTHED: Self = Self::BOUND_SMOOTHED;
    pub const JACOBIAN: Self = Self::JACOBIAN_BOUND_TO_BOUND;

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// True if every component of `other` is also in `self`.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TrackStatePropMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TrackStatePropMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TrackStatePropMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

// ============================================================================
// COLUMNS
// ============================================================================

/// One optional component; the discriminant is its bit in the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Component {
    BoundPredicted = 0,
    BoundFiltered,
    BoundSmoothed,
    FreePredicted,
    FreeFiltered,
    FreeSmoothed,
    JacobianBoundToBound,
    JacobianBoundToFree,
    JacobianFreeToBound,
    JacobianFreeToFree,
    SourceLink,
    Calibrated,
}

const COMPONENT_COUNT: usize = 12;

impl Component {
    const ALL: [Component; COMPONENT_COUNT] = [
        Self::BoundPredicted,
        Self::BoundFiltered,
        Self::BoundSmoothed,
        Self::FreePredicted,
        Self::FreeFiltered,
        Self::FreeSmoothed,
        Self::JacobianBoundToBound,
        Self::JacobianBoundToFree,
        Self::JacobianFreeToBound,
        Self::JacobianFreeToFree,
        Self::SourceLink,
        Self::Calibrated,
    ];

    fn mask(self) -> TrackStatePropMask {
        TrackStatePropMask(1 << self as u16)
    }

    fn from_single_bit(mask: TrackStatePropMask) -> Option<Self> {
        if mask.0.count_ones() != 1 {
            return None;
        }
        Self::ALL.get(mask.0.trailing_zeros() as usize).copied()
    }

    /// Column storage a component lives in; components sharing storage can
    /// share columns.
    fn storage(self) -> Storage {
        match self {
            Self::BoundPredicted | Self::BoundFiltered | Self::BoundSmoothed => Storage::Bound,
            Self::FreePredicted | Self::FreeFiltered | Self::FreeSmoothed => Storage::Free,
            Self::JacobianBoundToBound => Storage::JacobianBoundToBound,
            Self::JacobianBoundToFree => Storage::JacobianBoundToFree,
            Self::JacobianFreeToBound => Storage::JacobianFreeToBound,
            Self::JacobianFreeToFree => Storage::JacobianFreeToFree,
            Self::SourceLink => Storage::SourceLink,
            Self::Calibrated => Storage::Calibrated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Bound,
    Free,
    JacobianBoundToBound,
    JacobianBoundToFree,
    JacobianFreeToBound,
    JacobianFreeToFree,
    SourceLink,
    Calibrated,
}

/// Per-state index record.
#[derive(Debug, Clone)]
pub(crate) struct IndexData {
    pub(crate) previous: TrackIndex,
    pub(crate) columns: [usize; COMPONENT_COUNT],
    pub(crate) subspace: SubspaceIndices,
    pub(crate) chi2: f64,
    pub(crate) path_length: f64,
    pub(crate) type_flags: TrackStateType,
    pub(crate) reference_surface: Option<SurfaceHandle>,
}

impl IndexData {
    fn new(previous: TrackIndex) -> Self {
        Self {
            previous,
            columns: [MultiTrajectory::INVALID; COMPONENT_COUNT],
            subspace: SubspaceIndices::full(),
            chi2: 0.0,
            path_length: 0.0,
            type_flags: TrackStateType::new(),
            reference_surface: None,
        }
    }

    pub(crate) fn column(&self, component: Component) -> usize {
        self.columns[component as usize]
    }

    pub(crate) fn has(&self, component: Component) -> bool {
        self.column(component) != MultiTrajectory::INVALID
    }

    fn mask(&self) -> TrackStatePropMask {
        Component::ALL
            .iter()
            .filter(|c| self.has(**c))
            .fold(TrackStatePropMask::NONE, |m, c| m | c.mask())
    }
}

// ============================================================================
// VISIT CONTROL
// ============================================================================

/// Return type of a backward traversal callback.
///
/// `()` always continues; `false` stops the traversal after the current
/// state.
pub trait VisitResult {
    fn keep_going(self) -> bool;
}

impl VisitResult for () {
    fn keep_going(self) -> bool {
        true
    }
}

impl VisitResult for bool {
    fn keep_going(self) -> bool {
        self
    }
}

// ============================================================================
// TRAJECTORY SUMMARY
// ============================================================================

/// Statistics of one trajectory, accumulated from its tip backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryState {
    pub n_states: usize,
    pub n_measurements: usize,
    pub n_outliers: usize,
    pub n_holes: usize,
    pub n_shared_hits: usize,
    /// Sum of the chi2 of all measurement states
    pub chi2_sum: f64,
    /// Number of measured degrees of freedom
    pub ndf: usize,
}

// ============================================================================
// MULTI TRAJECTORY
// ============================================================================

/// Arena of track states with columnar component storage.
#[derive(Debug, Clone, Default)]
pub struct MultiTrajectory {
    pub(crate) index: Vec<IndexData>,
    pub(crate) bound_params: Vec<BoundVector>,
    pub(crate) bound_covs: Vec<BoundMatrix>,
    pub(crate) free_params: Vec<FreeVector>,
    pub(crate) free_covs: Vec<FreeMatrix>,
    pub(crate) jac_bound_to_bound: Vec<BoundMatrix>,
    pub(crate) jac_bound_to_free: Vec<BoundToFreeMatrix>,
    pub(crate) jac_free_to_bound: Vec<FreeToBoundMatrix>,
    pub(crate) jac_free_to_free: Vec<FreeMatrix>,
    pub(crate) source_links: Vec<SourceLink>,
    pub(crate) calibrated: Vec<PaddedMeasurementVector>,
    pub(crate) calibrated_covs: Vec<PaddedMeasurementMatrix>,
}

impl MultiTrajectory {
    /// Sentinel for "no parent" and "component absent".
    pub const INVALID: usize = usize::MAX;

    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with room for `states` track states.
    pub fn with_capacity(states: usize) -> Self {
        Self {
            index: Vec::with_capacity(states),
            bound_params: Vec::with_capacity(states * 3),
            bound_covs: Vec::with_capacity(states * 3),
            jac_bound_to_bound: Vec::with_capacity(states),
            ..Self::default()
        }
    }

    /// Number of track states across all trajectories.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drops all states and columns.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Appends a track state.
    ///
    /// # Arguments
    /// * `mask` - Components to allocate
    /// * `previous` - Parent state, or [`MultiTrajectory::INVALID`] for a root
    ///
    /// # Panics
    /// If `previous` is neither the sentinel nor an existing state. Parents
    /// always precede their children, which makes every backward traversal
    /// terminate.
    pub fn add_track_state(&mut self, mask: TrackStatePropMask, previous: TrackIndex) -> TrackIndex {
        let index = self.index.len();
        assert!(
            previous == Self::INVALID || previous < index,
            "parent {previous} of new track state {index} does not precede it"
        );
        self.index.push(IndexData::new(previous));
        self.add_track_state_components(index, mask);
        index
    }

    /// Allocates the components in `mask` that `index` does not have yet.
    pub fn add_track_state_components(&mut self, index: TrackIndex, mask: TrackStatePropMask) {
        for component in Component::ALL {
            if mask.contains(component.mask()) && !self.index[index].has(component) {
                let column = self.allocate(component.storage());
                self.index[index].columns[component as usize] = column;
            }
        }
    }

    fn allocate(&mut self, storage: Storage) -> usize {
        fn push<T>(column: &mut Vec<T>, value: T) -> usize {
            column.push(value);
            column.len() - 1
        }

        match storage {
            Storage::Bound => {
                self.bound_covs.push(BoundMatrix::zeros());
                push(&mut self.bound_params, BoundVector::zeros())
            }
            Storage::Free => {
                self.free_covs.push(FreeMatrix::zeros());
                push(&mut self.free_params, FreeVector::zeros())
            }
            Storage::JacobianBoundToBound => {
                push(&mut self.jac_bound_to_bound, BoundMatrix::identity())
            }
            Storage::JacobianBoundToFree => {
                push(&mut self.jac_bound_to_free, BoundToFreeMatrix::zeros())
            }
            Storage::JacobianFreeToBound => {
                push(&mut self.jac_free_to_bound, FreeToBoundMatrix::zeros())
            }
            Storage::JacobianFreeToFree => push(&mut self.jac_free_to_free, FreeMatrix::identity()),
            Storage::SourceLink => push(&mut self.source_links, SourceLink::default()),
            Storage::Calibrated => {
                self.calibrated_covs.push(PaddedMeasurementMatrix::zeros());
                push(&mut self.calibrated, PaddedMeasurementVector::zeros())
            }
        }
    }

    /// Components currently allocated for `index`.
    pub fn mask(&self, index: TrackIndex) -> TrackStatePropMask {
        self.index[index].mask()
    }

    pub fn previous(&self, index: TrackIndex) -> Option<TrackIndex> {
        match self.index[index].previous {
            Self::INVALID => None,
            p => Some(p),
        }
    }

    /// Makes a component of `target` alias a component of `source`.
    ///
    /// Writes through either state are then visible in both. Both
    /// components must live in the same kind of storage (e.g. the predicted
    /// state of a branch may alias the filtered state of its parent).
    ///
    /// # Panics
    /// If either mask is not a single component, the storages differ or the
    /// source component is absent.
    pub fn share_component(
        &mut self,
        source: TrackIndex,
        target: TrackIndex,
        source_component: TrackStatePropMask,
        target_component: TrackStatePropMask,
    ) {
        let (Some(src), Some(dst)) = (
            Component::from_single_bit(source_component),
            Component::from_single_bit(target_component),
        ) else {
            panic!("share_component expects single-component masks");
        };
        assert_eq!(
            src.storage(),
            dst.storage(),
            "cannot share {src:?} as {dst:?}: different storage"
        );
        assert!(
            self.index[source].has(src),
            "source state {source} has no {src:?} component"
        );
        let column = self.index[source].column(src);
        self.index[target].columns[dst as usize] = column;
    }

    /// Copies the components in `mask` plus chi2, path length, flags,
    /// surface and projector from `source` to `target`.
    ///
    /// # Panics
    /// If a component in `mask` is missing on either side.
    pub fn copy_components(&mut self, source: TrackIndex, target: TrackIndex, mask: TrackStatePropMask) {
        for component in Component::ALL {
            if !mask.contains(component.mask()) {
                continue;
            }
            let from = self.index[source].column(component);
            let to = self.index[target].column(component);
            assert!(
                from != Self::INVALID && to != Self::INVALID,
                "cannot copy {component:?} from state {source} to state {target}"
            );
            match component.storage() {
                Storage::Bound => {
                    self.bound_params[to] = self.bound_params[from];
                    self.bound_covs[to] = self.bound_covs[from];
                }
                Storage::Free => {
                    self.free_params[to] = self.free_params[from];
                    self.free_covs[to] = self.free_covs[from];
                }
                Storage::JacobianBoundToBound => {
                    self.jac_bound_to_bound[to] = self.jac_bound_to_bound[from]
                }
                Storage::JacobianBoundToFree => {
                    self.jac_bound_to_free[to] = self.jac_bound_to_free[from]
                }
                Storage::JacobianFreeToBound => {
                    self.jac_free_to_bound[to] = self.jac_free_to_bound[from]
                }
                Storage::JacobianFreeToFree => {
                    self.jac_free_to_free[to] = self.jac_free_to_free[from]
                }
                Storage::SourceLink => self.source_links[to] = self.source_links[from],
                Storage::Calibrated => {
                    self.calibrated[to] = self.calibrated[from];
                    self.calibrated_covs[to] = self.calibrated_covs[from];
                }
            }
        }

        let src = self.index[source].clone();
        let dst = &mut self.index[target];
        dst.subspace = src.subspace;
        dst.chi2 = src.chi2;
        dst.path_length = src.path_length;
        dst.type_flags = src.type_flags;
        dst.reference_surface = src.reference_surface;
    }

    /// Read-only view of a track state.
    pub fn get_track_state(&self, index: TrackIndex) -> TrackStateProxy<'_> {
        assert!(index < self.len(), "track state {index} out of range");
        TrackStateProxy::new(self, index)
    }

    /// Mutable view of a track state.
    pub fn get_track_state_mut(&mut self, index: TrackIndex) -> TrackStateProxyMut<'_> {
        assert!(index < self.len(), "track state {index} out of range");
        TrackStateProxyMut::new(self, index)
    }

    /// Calls `f` on every state from `tip` back to the root.
    ///
    /// Returning `false` from `f` stops after the current state.
    pub fn visit_backwards<F, R>(&self, tip: TrackIndex, mut f: F)
    where
        F: FnMut(TrackStateProxy<'_>) -> R,
        R: VisitResult,
    {
        let mut current = tip;
        loop {
            if !f(self.get_track_state(current)).keep_going() {
                break;
            }
            match self.previous(current) {
                Some(p) => current = p,
                None => break,
            }
        }
    }

    /// Mutable counterpart of [`MultiTrajectory::visit_backwards`].
    pub fn apply_backwards<F, R>(&mut self, tip: TrackIndex, mut f: F)
    where
        F: FnMut(TrackStateProxyMut<'_>) -> R,
        R: VisitResult,
    {
        let mut current = tip;
        loop {
            let keep_going = f(self.get_track_state_mut(current)).keep_going();
            // The parent link is read after f returned
            let previous = self.previous(current);
            match previous {
                Some(p) if keep_going => current = p,
                _ => break,
            }
        }
    }

    /// Fallible backward traversal: stops at the first error and returns it.
    pub fn try_apply_backwards<F, E>(&mut self, tip: TrackIndex, mut f: F) -> Result<(), E>
    where
        F: FnMut(TrackStateProxyMut<'_>) -> Result<bool, E>,
    {
        let mut current = tip;
        loop {
            let keep_going = f(self.get_track_state_mut(current))?;
            match self.previous(current) {
                Some(p) if keep_going => current = p,
                _ => return Ok(()),
            }
        }
    }

    /// State indices of the trajectory ending at `tip`, root first.
    pub fn trajectory_indices(&self, tip: TrackIndex) -> Vec<TrackIndex> {
        let mut indices = Vec::new();
        self.visit_backwards(tip, |ts| indices.push(ts.index()));
        indices.reverse();
        indices
    }

    /// Summary statistics of the trajectory ending at `tip`.
    pub fn trajectory_state(&self, tip: TrackIndex) -> TrajectoryState {
        let mut summary = TrajectoryState::default();
        self.visit_backwards(tip, |ts| {
            summary.n_states += 1;
            let flags = ts.type_flags();
            if flags.is_measurement() {
                if flags.is_shared_hit() {
                    summary.n_shared_hits += 1;
                }
                summary.n_measurements += 1;
                summary.chi2_sum += ts.chi2();
                summary.ndf += ts.calibrated_size();
            } else if flags.is_outlier() {
                summary.n_outliers += 1;
            } else if flags.is_hole() {
                summary.n_holes += 1;
            }
        });
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track_state_type::TrackStateFlag;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn chain(traj: &mut MultiTrajectory, n: usize, mask: TrackStatePropMask) -> TrackIndex {
        let mut tip = MultiTrajectory::INVALID;
        for _ in 0..n {
            tip = traj.add_track_state(mask, tip);
        }
        tip
    }

    #[test]
    fn test_mask_operations() {
        let m = TrackStatePropMask::PREDICTED | TrackStatePropMask::FILTERED;
        assert!(m.contains(TrackStatePropMask::PREDICTED));
        assert!(!m.contains(TrackStatePropMask::SMOOTHED));
        assert!(m.intersects(TrackStatePropMask::FILTERED | TrackStatePropMask::SMOOTHED));
        assert!(TrackStatePropMask::ALL.contains(m));
        assert_eq!(m & TrackStatePropMask::FILTERED, TrackStatePropMask::FILTERED);
        assert!(TrackStatePropMask::NONE.is_empty());
    }

    #[test]
    fn test_add_track_state_allocates_requested_components() {
        let mut traj = MultiTrajectory::new();
        let mask = TrackStatePropMask::PREDICTED | TrackStatePropMask::JACOBIAN;

        let i = traj.add_track_state(mask, MultiTrajectory::INVALID);

        assert_eq!(i, 0);
        assert_eq!(traj.mask(i), mask);
        assert_eq!(traj.previous(i), None);
        assert_eq!(traj.bound_params.len(), 1);
        assert_eq!(traj.jac_bound_to_bound.len(), 1);
        assert!(traj.free_params.is_empty());
    }

    #[test]
    fn test_mask_only_grows() {
        let mut traj = MultiTrajectory::new();
        let i = traj.add_track_state(TrackStatePropMask::PREDICTED, MultiTrajectory::INVALID);
        traj.get_track_state_mut(i).predicted_mut()[0] = 4.0;

        traj.add_track_state_components(i, TrackStatePropMask::PREDICTED | TrackStatePropMask::SMOOTHED);

        let ts = traj.get_track_state(i);
        assert!(ts.has_predicted());
        assert!(ts.has_smoothed());
        // Existing data is untouched by a second allocation request
        assert_relative_eq!(ts.predicted()[0], 4.0);
        assert_eq!(traj.bound_params.len(), 2);
    }

    #[test]
    #[should_panic(expected = "does not precede")]
    fn test_parent_must_precede_child() {
        let mut traj = MultiTrajectory::new();
        traj.add_track_state(TrackStatePropMask::NONE, 3);
    }

    #[test]
    fn test_visit_backwards_stops_early() {
        let mut traj = MultiTrajectory::new();
        let tip = chain(&mut traj, 5, TrackStatePropMask::NONE);

        let mut visited = Vec::new();
        traj.visit_backwards(tip, |ts| {
            visited.push(ts.index());
            ts.index() != 2
        });

        assert_eq!(visited, vec![4, 3, 2]);
    }

    #[test]
    fn test_independent_trees_share_a_store() {
        let mut traj = MultiTrajectory::new();
        let root = traj.add_track_state(TrackStatePropMask::PREDICTED, MultiTrajectory::INVALID);
        let branch_a = traj.add_track_state(TrackStatePropMask::PREDICTED, root);
        let branch_b = traj.add_track_state(TrackStatePropMask::PREDICTED, root);
        let other_root = traj.add_track_state(TrackStatePropMask::PREDICTED, MultiTrajectory::INVALID);

        assert_eq!(traj.trajectory_indices(branch_a), vec![root, branch_a]);
        assert_eq!(traj.trajectory_indices(branch_b), vec![root, branch_b]);
        assert_eq!(traj.trajectory_indices(other_root), vec![other_root]);
    }

    #[test]
    fn test_share_component_aliases_storage() {
        let mut traj = MultiTrajectory::new();
        let a = traj.add_track_state(TrackStatePropMask::FILTERED, MultiTrajectory::INVALID);
        let b = traj.add_track_state(TrackStatePropMask::NONE, a);
        traj.get_track_state_mut(a).filtered_mut()[1] = 7.0;

        traj.share_component(a, b, TrackStatePropMask::FILTERED, TrackStatePropMask::PREDICTED);

        assert!(traj.get_track_state(b).has_predicted());
        assert_relative_eq!(traj.get_track_state(b).predicted()[1], 7.0);

        traj.get_track_state_mut(b).predicted_mut()[1] = -1.0;
        assert_relative_eq!(traj.get_track_state(a).filtered()[1], -1.0);
    }

    #[test]
    #[should_panic(expected = "different storage")]
    fn test_share_component_rejects_mismatched_storage() {
        let mut traj = MultiTrajectory::new();
        let a = traj.add_track_state(TrackStatePropMask::FILTERED, MultiTrajectory::INVALID);
        traj.share_component(a, a, TrackStatePropMask::FILTERED, TrackStatePropMask::JACOBIAN);
    }

    #[test]
    fn test_copy_components() {
        let mut traj = MultiTrajectory::new();
        let mask = TrackStatePropMask::PREDICTED | TrackStatePropMask::FILTERED;
        let a = traj.add_track_state(mask, MultiTrajectory::INVALID);
        let b = traj.add_track_state(mask, MultiTrajectory::INVALID);
        {
            let mut ts = traj.get_track_state_mut(a);
            ts.predicted_mut()[0] = 1.0;
            ts.filtered_mut()[0] = 2.0;
            *ts.chi2_mut() = 3.5;
            ts.type_flags_mut().set(TrackStateFlag::Hole);
        }

        traj.copy_components(a, b, TrackStatePropMask::FILTERED);

        let ts = traj.get_track_state(b);
        assert_relative_eq!(ts.filtered()[0], 2.0);
        assert_relative_eq!(ts.predicted()[0], 0.0);
        assert_relative_eq!(ts.chi2(), 3.5);
        assert!(ts.type_flags().is_hole());
    }

    #[test]
    fn test_trajectory_state_summary() {
        let mut traj = MultiTrajectory::new();
        let mask = TrackStatePropMask::PREDICTED | TrackStatePropMask::CALIBRATED;
        let flags = [
            TrackStateFlag::Measurement,
            TrackStateFlag::Hole,
            TrackStateFlag::Outlier,
            TrackStateFlag::Measurement,
        ];
        let mut tip = MultiTrajectory::INVALID;
        for (i, flag) in flags.iter().enumerate() {
            tip = traj.add_track_state(mask, tip);
            let mut ts = traj.get_track_state_mut(tip);
            ts.type_flags_mut().set(*flag);
            *ts.chi2_mut() = i as f64;
            ts.set_projector_subspace(crate::measurement::SubspaceIndices::new(&[0, 1]).unwrap());
        }

        let summary = traj.trajectory_state(tip);

        assert_eq!(summary.n_states, 4);
        assert_eq!(summary.n_measurements, 2);
        assert_eq!(summary.n_holes, 1);
        assert_eq!(summary.n_outliers, 1);
        assert_relative_eq!(summary.chi2_sum, 3.0);
        assert_eq!(summary.ndf, 4);
    }

    #[test]
    fn test_clear() {
        let mut traj = MultiTrajectory::new();
        chain(&mut traj, 3, TrackStatePropMask::ALL);
        traj.clear();
        assert!(traj.is_empty());
        assert!(traj.bound_params.is_empty());
    }

    proptest! {
        #[test]
        fn prop_visit_backwards_visits_every_state_once(n in 1usize..64) {
            let mut traj = MultiTrajectory::new();
            let tip = chain(&mut traj, n, TrackStatePropMask::PREDICTED);

            let mut count = 0;
            traj.visit_backwards(tip, |_| count += 1);
            prop_assert_eq!(count, n);

            let mut applied = 0;
            traj.apply_backwards(tip, |_| applied += 1);
            prop_assert_eq!(applied, n);
        }
    }
}
