//! Global state of the fused map
//!
//! The state is an append-only sequence of entries, one per robot pose (3
//! dimensions) and one per point feature (2 dimensions). Each entry has a
//! stable [`EntryId`] assigned on creation and a current `index` into the
//! state ordering, which changes whenever the fill-reducing reorderer runs.

use std::collections::HashMap;
use std::f64::consts::{PI, TAU};

use nalgebra::{DVector, Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::linalg::{Permutation, Permute, SparseBlockColumn};

/// Block dimension of a pose entry
pub const POSE_DIM: usize = 3;
/// Block dimension of a feature entry
pub const FEATURE_DIM: usize = 2;

/// Normalize angle to [-π, π]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle;
    while a > PI {
        a -= TAU;
    }
    while a < -PI {
        a += TAU;
    }
    a
}

/// A planar robot pose (x, y, theta)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Default for Pose2D {
    fn default() -> Self {
        Self::origin()
    }
}

impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    pub fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.theta)
    }

    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self {
            x: v[0],
            y: v[1],
            theta: normalize_angle(v[2]),
        }
    }

    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn rotation(&self) -> Matrix2<f64> {
        let (s, c) = self.theta.sin_cos();
        Matrix2::new(c, -s, s, c)
    }

    /// self ⊕ other: `other` is expressed in the frame of `self`
    pub fn compose(&self, other: &Pose2D) -> Pose2D {
        let t = self.transform_point(&other.translation());
        Pose2D::new(t.x, t.y, normalize_angle(self.theta + other.theta))
    }

    pub fn inverse(&self) -> Pose2D {
        let t = -(self.rotation().transpose() * self.translation());
        Pose2D::new(t.x, t.y, normalize_angle(-self.theta))
    }

    /// self⁻¹ ⊕ other: `other` expressed in the frame of `self`
    pub fn between(&self, other: &Pose2D) -> Pose2D {
        self.inverse().compose(other)
    }

    /// Local point to global frame
    pub fn transform_point(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.rotation() * point + self.translation()
    }

    /// Global point to local frame
    pub fn inverse_transform_point(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.rotation().transpose() * (point - self.translation())
    }
}

/// Stable identifier of a state entry, unaffected by reordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub usize);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A point feature in the global frame
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEntry {
    pub id: EntryId,
    pub index: usize,
    pub position: Vector2<f64>,
    /// Pose the feature was first observed from (`None` for the fixed origin)
    pub anchor: Option<EntryId>,
}

/// A robot pose at the end of a submap
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEntry {
    pub id: EntryId,
    pub index: usize,
    pub pose: Pose2D,
    /// Largest feature distance of the submap ending at this pose
    pub radius: f64,
}

/// One entry of the global state
#[derive(Debug, Clone, PartialEq)]
pub enum StateEntry {
    Feature(FeatureEntry),
    Pose(PoseEntry),
}

impl StateEntry {
    pub fn id(&self) -> EntryId {
        match self {
            StateEntry::Feature(f) => f.id,
            StateEntry::Pose(p) => p.id,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            StateEntry::Feature(f) => f.index,
            StateEntry::Pose(p) => p.index,
        }
    }

    fn set_index(&mut self, index: usize) {
        match self {
            StateEntry::Feature(f) => f.index = index,
            StateEntry::Pose(p) => p.index = index,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            StateEntry::Feature(_) => FEATURE_DIM,
            StateEntry::Pose(_) => POSE_DIM,
        }
    }

    pub fn is_pose(&self) -> bool {
        matches!(self, StateEntry::Pose(_))
    }

    pub fn estimate(&self) -> DVector<f64> {
        match self {
            StateEntry::Feature(f) => DVector::from_column_slice(f.position.as_slice()),
            StateEntry::Pose(p) => DVector::from_column_slice(p.pose.to_vector().as_slice()),
        }
    }

    /// Overwrite the estimate, returning the largest absolute change
    fn set_estimate(&mut self, values: &[f64]) -> f64 {
        match self {
            StateEntry::Feature(f) => {
                let new = Vector2::new(values[0], values[1]);
                let change = (new - f.position).amax();
                f.position = new;
                change
            }
            StateEntry::Pose(p) => {
                let new = Pose2D::new(values[0], values[1], normalize_angle(values[2]));
                let change = (new.x - p.pose.x)
                    .abs()
                    .max((new.y - p.pose.y).abs())
                    .max(normalize_angle(new.theta - p.pose.theta).abs());
                p.pose = new;
                change
            }
        }
    }
}

/// Ordered global state with an id to index lookup
#[derive(Debug, Clone, Default)]
pub struct GlobalState {
    entries: Vec<StateEntry>,
    positions: HashMap<EntryId, usize>,
    next_id: usize,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&StateEntry> {
        self.entries.get(index)
    }

    /// Current position of entry `id` in the state ordering
    pub fn index_of(&self, id: EntryId) -> FusionResult<usize> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(FusionError::IndexOutOfRange {
                index: id.0,
                len: self.entries.len(),
            })
    }

    pub fn entry(&self, id: EntryId) -> FusionResult<&StateEntry> {
        Ok(&self.entries[self.index_of(id)?])
    }

    /// Block dimension of every entry in state order
    pub fn dims(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.dim()).collect()
    }

    fn push(&mut self, make: impl FnOnce(EntryId, usize) -> StateEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        let index = self.entries.len();
        self.entries.push(make(id, index));
        self.positions.insert(id, index);
        id
    }

    pub fn push_pose(&mut self, pose: Pose2D, radius: f64) -> EntryId {
        self.push(|id, index| {
            StateEntry::Pose(PoseEntry {
                id,
                index,
                pose,
                radius,
            })
        })
    }

    pub fn push_feature(&mut self, position: Vector2<f64>, anchor: Option<EntryId>) -> EntryId {
        self.push(|id, index| {
            StateEntry::Feature(FeatureEntry {
                id,
                index,
                position,
                anchor,
            })
        })
    }

    pub fn pose_entry(&self, id: EntryId) -> FusionResult<&PoseEntry> {
        match self.entry(id)? {
            StateEntry::Pose(p) => Ok(p),
            StateEntry::Feature(_) => Err(FusionError::InvalidSubmap(format!(
                "entry {id} is a feature, expected a pose"
            ))),
        }
    }

    pub fn feature_entry(&self, id: EntryId) -> FusionResult<&FeatureEntry> {
        match self.entry(id)? {
            StateEntry::Feature(f) => Ok(f),
            StateEntry::Pose(_) => Err(FusionError::InvalidSubmap(format!(
                "entry {id} is a pose, expected a feature"
            ))),
        }
    }

    pub fn pose(&self, id: EntryId) -> FusionResult<Pose2D> {
        self.pose_entry(id).map(|p| p.pose)
    }

    pub fn feature(&self, id: EntryId) -> FusionResult<Vector2<f64>> {
        self.feature_entry(id).map(|f| f.position)
    }

    /// Overwrite the estimate of a pose entry (linearization point only)
    pub fn set_pose(&mut self, id: EntryId, pose: Pose2D) -> FusionResult<()> {
        let index = self.index_of(id)?;
        match &mut self.entries[index] {
            StateEntry::Pose(p) => {
                p.pose = pose;
                Ok(())
            }
            StateEntry::Feature(_) => Err(FusionError::InvalidSubmap(format!(
                "entry {id} is a feature, expected a pose"
            ))),
        }
    }

    /// Poses in creation (trajectory) order
    pub fn poses(&self) -> Vec<&PoseEntry> {
        let mut poses: Vec<&PoseEntry> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                StateEntry::Pose(p) => Some(p),
                StateEntry::Feature(_) => None,
            })
            .collect();
        poses.sort_by_key(|p| p.id);
        poses
    }

    /// Features in creation order
    pub fn features(&self) -> Vec<&FeatureEntry> {
        let mut features: Vec<&FeatureEntry> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                StateEntry::Feature(f) => Some(f),
                StateEntry::Pose(_) => None,
            })
            .collect();
        features.sort_by_key(|f| f.id);
        features
    }

    pub fn pose_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pose()).count()
    }

    pub fn feature_count(&self) -> usize {
        self.entries.len() - self.pose_count()
    }

    /// Stacked estimate in state order
    pub fn estimate_vector(&self) -> DVector<f64> {
        let values: Vec<f64> = self
            .entries
            .iter()
            .flat_map(|e| e.estimate().iter().copied().collect::<Vec<_>>())
            .collect();
        DVector::from_vec(values)
    }

    /// Estimate as a block column with the state blocking
    pub fn estimate_column(&self) -> FusionResult<SparseBlockColumn> {
        SparseBlockColumn::from_dvector(self.dims(), &self.estimate_vector())
    }

    /// Replace every estimate with the solved state, returning the largest change
    pub fn apply_estimate(&mut self, solution: &SparseBlockColumn) -> FusionResult<f64> {
        if solution.dims() != self.dims().as_slice() || solution.width() != 1 {
            return Err(FusionError::dimension(
                "state update",
                (self.len(), 1),
                (solution.len(), solution.width()),
            ));
        }
        let mut change: f64 = 0.0;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if let Some(block) = solution.get(i) {
                change = change.max(entry.set_estimate(block.as_dmatrix().as_slice()));
            }
        }
        Ok(change)
    }
}

impl Permute for GlobalState {
    fn permute(&self, permutation: &Permutation) -> FusionResult<Self> {
        if permutation.len() != self.len() {
            return Err(FusionError::InvalidPermutation(format!(
                "permutation over {} indices applied to {} entries",
                permutation.len(),
                self.len()
            )));
        }
        let mut entries = Vec::with_capacity(self.len());
        let mut positions = HashMap::with_capacity(self.len());
        for (new, &old) in permutation.order().iter().enumerate() {
            let mut entry = self.entries[old].clone();
            entry.set_index(new);
            positions.insert(entry.id(), new);
            entries.push(entry);
        }
        Ok(Self {
            entries,
            positions,
            next_id: self.next_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_pose_compose_between() {
        let a = Pose2D::new(1.0, 2.0, FRAC_PI_2);
        let b = Pose2D::new(1.0, 0.0, 0.0);
        let c = a.compose(&b);
        assert_relative_eq!(c.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(c.y, 3.0, epsilon = 1e-12);
        assert_relative_eq!(c.theta, FRAC_PI_2, epsilon = 1e-12);

        let back = a.between(&c);
        assert_relative_eq!(back.x, b.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, b.y, epsilon = 1e-12);
        assert_relative_eq!(back.theta, b.theta, epsilon = 1e-12);
    }

    #[test]
    fn test_point_transform_roundtrip() {
        let pose = Pose2D::new(-3.0, 0.5, 2.5);
        let p = Vector2::new(4.0, -1.0);
        let local = pose.inverse_transform_point(&p);
        assert_relative_eq!(pose.transform_point(&local), p, epsilon = 1e-12);
    }

    #[test]
    fn test_normalize_angle() {
        assert_relative_eq!(normalize_angle(2.5 * PI), FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(normalize_angle(-FRAC_PI_2 - TAU), -FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_push_and_lookup() {
        let mut state = GlobalState::new();
        let p = state.push_pose(Pose2D::new(1.0, 0.0, 0.0), 4.0);
        let f = state.push_feature(Vector2::new(2.0, 1.0), Some(p));
        assert_eq!(state.len(), 2);
        assert_eq!(state.dims(), vec![3, 2]);
        assert_eq!(state.index_of(f).unwrap(), 1);
        assert_eq!(state.pose(p).unwrap(), Pose2D::new(1.0, 0.0, 0.0));
        assert!(state.pose(f).is_err());
        assert_eq!(state.estimate_vector().len(), 5);
        assert_eq!(state.pose_count(), 1);
        assert_eq!(state.feature_count(), 1);
        assert_eq!(state.pose_entry(p).unwrap().radius, 4.0);
        assert_eq!(state.feature_entry(f).unwrap().anchor, Some(p));
        assert!(state.feature_entry(p).is_err());
    }

    #[test]
    fn test_permute_keeps_ids() {
        let mut state = GlobalState::new();
        let ids: Vec<EntryId> = (0..4)
            .map(|i| state.push_feature(Vector2::new(i as f64, 0.0), None))
            .collect();
        let perm = Permutation::from_order(vec![3, 1, 0, 2]).unwrap();
        let permuted = state.permute(&perm).unwrap();
        for (old, id) in ids.iter().enumerate() {
            let new = permuted.index_of(*id).unwrap();
            assert_eq!(new, perm.new_index(old));
            assert_eq!(permuted.get(new).unwrap().index(), new);
            assert_eq!(permuted.feature(*id).unwrap(), state.feature(*id).unwrap());
        }
        // Creation order is preserved
        let xs: Vec<f64> = permuted.features().iter().map(|f| f.position.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_apply_estimate_reports_change() {
        let mut state = GlobalState::new();
        state.push_pose(Pose2D::origin(), 1.0);
        state.push_feature(Vector2::new(1.0, 1.0), None);
        let solved = DVector::from_vec(vec![0.1, 0.0, 0.0, 1.0, 1.5]);
        let column = SparseBlockColumn::from_dvector(state.dims(), &solved).unwrap();
        let change = state.apply_estimate(&column).unwrap();
        assert_relative_eq!(change, 0.5, epsilon = 1e-12);
        assert_relative_eq!(state.estimate_vector(), solved, epsilon = 1e-12);
    }
}
