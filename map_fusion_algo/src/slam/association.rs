//! Data association between a local submap and the global map
//!
//! Two strategies share the [`DataAssociator`] interface:
//!
//! - [`NearestNeighborAssociator`]: each local feature is compared with the
//!   global features near the prior start pose using the Mahalanobis distance
//!   of the relative-position innovation. The closest free candidate within
//!   `gate + estimation_error` is accepted. A joint compatibility test then
//!   prunes the worst pairs until the stacked innovation of all pairs passes
//!   the χ² bound.
//! - [`GridVotingAssociator`]: global relocalization when the pose estimate is
//!   no longer trusted. Every (local, global) feature pair votes, for every
//!   heading hypothesis, for the start pose translation it implies. The most
//!   voted cell wins and its pairs are refined with a least-squares rigid
//!   alignment. The grid extent grows after every attempt so that repeated
//!   failures search a wider area.
//!
//! ## References
//! - [Data Association in Stochastic Mapping Using the Joint Compatibility Test](https://doi.org/10.1109/70.976019)
//! - [Sparse Local Submap Joining Filter](https://doi.org/10.1109/TRO.2008.2003259)

use std::collections::{BTreeSet, HashMap};
use std::f64::consts::TAU;

use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::state::{normalize_angle, EntryId, GlobalState, Pose2D};
use super::submap::LocalSubmap;
use crate::config::{AssociationConfig, GridConfig};
use crate::error::{FusionError, FusionResult};
use crate::linalg::{BlockCholeskyFactor, SparseBlockColumn};

/// Variance added to every feature when no global covariance is available
const APPROXIMATE_VARIANCE_FLOOR: f64 = 1e-2;

/// Chi-squared bounds for gating
pub mod chi_squared {
    /// Chi-squared threshold for 2 DOF at 95%
    pub const DOF_2_95: f64 = 5.991;

    /// Chi-squared threshold for 2 DOF at 99%
    pub const DOF_2_99: f64 = 9.210;

    /// Chi-squared threshold for 4 DOF at 95%
    pub const DOF_4_95: f64 = 9.488;

    /// Chi-squared threshold for 4 DOF at 99%
    pub const DOF_4_99: f64 = 13.277;

    /// Upper χ² quantile for `dof` degrees of freedom at `confidence`
    ///
    /// Tabulated values where available, Wilson-Hilferty approximation otherwise.
    pub fn threshold(dof: usize, confidence: f64) -> f64 {
        match (dof, (confidence * 100.0).round() as u32) {
            (2, 95) => DOF_2_95,
            (2, 99) => DOF_2_99,
            (4, 95) => DOF_4_95,
            (4, 99) => DOF_4_99,
            _ => {
                let z = normal_quantile(confidence);
                let dof_f = dof.max(1) as f64;
                let term = 1.0 - 2.0 / (9.0 * dof_f) + z * (2.0 / (9.0 * dof_f)).sqrt();
                dof_f * term * term * term
            }
        }
    }

    /// Approximate normal quantile (inverse CDF), Abramowitz-Stegun 26.2.23
    pub fn normal_quantile(p: f64) -> f64 {
        let t = if p < 0.5 {
            (-2.0 * p.ln()).sqrt()
        } else {
            (-2.0 * (1.0 - p).ln()).sqrt()
        };

        let c0 = 2.515517;
        let c1 = 0.802853;
        let c2 = 0.010328;
        let d1 = 1.432788;
        let d2 = 0.189269;
        let d3 = 0.001308;

        let result = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);

        if p < 0.5 {
            -result
        } else {
            result
        }
    }
}

/// Which association strategy produced a match set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationStrategy {
    NearestNeighbor,
    GridVoting,
}

impl std::fmt::Display for AssociationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationStrategy::NearestNeighbor => write!(f, "nearest-neighbour"),
            AssociationStrategy::GridVoting => write!(f, "grid-voting"),
        }
    }
}

/// A local feature matched to a global feature
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPair {
    pub local: usize,
    pub global: EntryId,
    /// Mahalanobis distance (nearest neighbour) or alignment residual (grid voting)
    pub distance: f64,
}

/// Outcome of associating one submap
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub pairs: Vec<MatchPair>,
    /// Local feature indices with no global counterpart, ascending
    pub unmatched: Vec<usize>,
    /// Start pose of the submap implied by the match
    pub start_pose: Pose2D,
    pub strategy: AssociationStrategy,
}

impl Association {
    pub fn matched_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn global_for(&self, local: usize) -> Option<EntryId> {
        self.pairs.iter().find(|p| p.local == local).map(|p| p.global)
    }
}

/// What the global map knows when a submap arrives
#[derive(Debug, Clone, Copy)]
pub struct AssociationPrior<'a> {
    pub state: &'a GlobalState,
    /// Current factor of the information matrix; `None` falls back to the
    /// local covariance plus an isotropic estimation-error term
    pub factor: Option<&'a BlockCholeskyFactor>,
    /// Prior estimate of the submap start pose
    pub start_pose: Pose2D,
    /// State entry of the start pose (`None` when it is the fixed origin)
    pub start_id: Option<EntryId>,
    pub estimation_error: f64,
}

/// Matches local submap features to global features
pub trait DataAssociator {
    fn strategy(&self) -> AssociationStrategy;

    fn associate(
        &mut self,
        submap: &LocalSubmap,
        prior: &AssociationPrior<'_>,
    ) -> FusionResult<Association>;
}

/// A global feature considered for matching
#[derive(Debug, Clone)]
struct Candidate {
    id: EntryId,
    index: usize,
    position: Vector2<f64>,
}

/// Covariance blocks among the start pose and the candidates
struct CovarianceLookup {
    /// Column of the inverse information matrix keyed by state index
    columns: HashMap<usize, SparseBlockColumn>,
}

impl CovarianceLookup {
    fn block(&self, row: usize, col: usize) -> DMatrix<f64> {
        match self.columns.get(&col).and_then(|c| c.get(row)) {
            Some(block) => block.as_dmatrix().clone(),
            None => DMatrix::zeros(
                self.columns.get(&row).map(|c| c.width()).unwrap_or(0),
                self.columns.get(&col).map(|c| c.width()).unwrap_or(0),
            ),
        }
    }
}

/// Everything needed to evaluate innovations for one submap
struct Scene<'a> {
    submap: &'a LocalSubmap,
    start: Pose2D,
    start_index: Option<usize>,
    covariance: Option<CovarianceLookup>,
    approximate_variance: f64,
}

impl Scene<'_> {
    /// Stacked innovation and its covariance for a set of (local, candidate) pairs
    fn innovation(&self, pairs: &[(usize, &Candidate)]) -> (DVector<f64>, DMatrix<f64>) {
        let n = pairs.len();
        let mut nu = DVector::zeros(2 * n);
        let mut s = DMatrix::zeros(2 * n, 2 * n);
        let mut jacobians: Vec<(Matrix2x3<f64>, Matrix2<f64>)> = Vec::with_capacity(n);

        for (a, (local, candidate)) in pairs.iter().enumerate() {
            let predicted = self.start.inverse_transform_point(&candidate.position);
            nu.fixed_rows_mut::<2>(2 * a)
                .copy_from(&(self.submap.features[*local] - predicted));
            jacobians.push(super::information::feature_jacobian(
                &self.start,
                &candidate.position,
            ));
            for (b, (other, _)) in pairs.iter().enumerate() {
                let ra = 3 + 2 * local;
                let rb = 3 + 2 * other;
                let local_cov = self.submap.covariance.view((ra, rb), (2, 2));
                let mut block = s.view_mut((2 * a, 2 * b), (2, 2));
                block += local_cov;
            }
        }

        match &self.covariance {
            Some(lookup) => {
                for (a, (_, ca)) in pairs.iter().enumerate() {
                    let (hs_a, hf_a) = &jacobians[a];
                    let hs_a = DMatrix::from_column_slice(2, 3, hs_a.as_slice());
                    let hf_a = DMatrix::from_column_slice(2, 2, hf_a.as_slice());
                    for (b, (_, cb)) in pairs.iter().enumerate() {
                        let (hs_b, hf_b) = &jacobians[b];
                        let hs_b = DMatrix::from_column_slice(2, 3, hs_b.as_slice());
                        let hf_b = DMatrix::from_column_slice(2, 2, hf_b.as_slice());

                        let mut term = &hf_a * lookup.block(ca.index, cb.index) * hf_b.transpose();
                        if let Some(si) = self.start_index {
                            term += &hs_a * lookup.block(si, si) * hs_b.transpose();
                            term += &hs_a * lookup.block(si, cb.index) * hf_b.transpose();
                            term += &hf_a * lookup.block(ca.index, si) * hs_b.transpose();
                        }
                        let mut block = s.view_mut((2 * a, 2 * b), (2, 2));
                        block += term;
                    }
                }
            }
            None => {
                for a in 0..n {
                    let mut block = s.view_mut((2 * a, 2 * a), (2, 2));
                    block += DMatrix::identity(2, 2) * self.approximate_variance;
                }
            }
        }

        (nu, s)
    }

    /// Squared Mahalanobis distance; `None` when the innovation covariance is singular
    fn distance_sq(&self, pairs: &[(usize, &Candidate)]) -> Option<f64> {
        let (nu, s) = self.innovation(pairs);
        let cholesky = s.cholesky()?;
        let solved = cholesky.solve(&nu);
        Some(nu.dot(&solved))
    }
}

/// Gated nearest-neighbour association with joint compatibility pruning
#[derive(Debug, Clone)]
pub struct NearestNeighborAssociator {
    config: AssociationConfig,
}

impl Default for NearestNeighborAssociator {
    fn default() -> Self {
        Self::new()
    }
}

impl NearestNeighborAssociator {
    pub fn new() -> Self {
        Self {
            config: AssociationConfig::default(),
        }
    }

    pub fn with_config(config: AssociationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// Global features within reach of the prior start pose
    ///
    /// The reach covers both the incoming submap and the submap that ended
    /// at the start pose, widened by the gate and the estimation error.
    fn candidates(&self, submap: &LocalSubmap, prior: &AssociationPrior<'_>) -> Vec<Candidate> {
        let start_radius = prior
            .start_id
            .and_then(|id| prior.state.pose_entry(id).ok())
            .map_or(0.0, |p| p.radius);
        let reach = submap.radius().max(start_radius) + self.config.gate + prior.estimation_error;
        let origin = prior.start_pose.translation();
        prior
            .state
            .features()
            .into_iter()
            .filter(|f| (f.position - origin).norm() <= reach)
            .map(|f| Candidate {
                id: f.id,
                index: f.index,
                position: f.position,
            })
            .collect()
    }

    fn scene<'a>(
        &self,
        submap: &'a LocalSubmap,
        prior: &AssociationPrior<'_>,
        candidates: &[Candidate],
    ) -> FusionResult<Scene<'a>> {
        let start_index = match prior.start_id {
            Some(id) => Some(prior.state.index_of(id)?),
            None => None,
        };
        let covariance = match prior.factor {
            Some(factor) => {
                let indices: Vec<usize> = start_index
                    .into_iter()
                    .chain(candidates.iter().map(|c| c.index))
                    .collect();
                let columns = indices
                    .par_iter()
                    .map(|&i| factor.covariance_column(i).map(|column| (i, column)))
                    .collect::<FusionResult<Vec<_>>>()?;
                Some(CovarianceLookup {
                    columns: columns.into_iter().collect(),
                })
            }
            None => None,
        };
        Ok(Scene {
            submap,
            start: prior.start_pose,
            start_index,
            covariance,
            approximate_variance: prior.estimation_error.powi(2) + APPROXIMATE_VARIANCE_FLOOR,
        })
    }

    /// Drop the largest-distance pair until the joint innovation passes the χ² bound
    fn prune_jointly_incompatible(
        &self,
        scene: &Scene<'_>,
        candidates: &[Candidate],
        pairs: &mut Vec<(usize, usize, f64)>,
        unmatched: &mut Vec<usize>,
    ) {
        while pairs.len() >= 2 {
            let joint: Vec<(usize, &Candidate)> =
                pairs.iter().map(|&(l, c, _)| (l, &candidates[c])).collect();
            let bound = chi_squared::threshold(2 * joint.len(), self.config.confidence);
            match scene.distance_sq(&joint) {
                Some(d2) if d2 <= bound => break,
                d2 => {
                    let worst = pairs
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1 .2.total_cmp(&b.1 .2))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    let (local, _, distance) = pairs.remove(worst);
                    debug!(
                        local,
                        distance,
                        joint = ?d2,
                        bound,
                        "Dropping jointly incompatible match"
                    );
                    unmatched.push(local);
                }
            }
        }
    }
}

impl DataAssociator for NearestNeighborAssociator {
    fn strategy(&self) -> AssociationStrategy {
        AssociationStrategy::NearestNeighbor
    }

    fn associate(
        &mut self,
        submap: &LocalSubmap,
        prior: &AssociationPrior<'_>,
    ) -> FusionResult<Association> {
        let candidates = self.candidates(submap, prior);
        let scene = self.scene(submap, prior, &candidates)?;
        let threshold = self.config.gate + prior.estimation_error;

        // Distances are independent per local feature
        let table: Vec<Vec<(usize, f64)>> = (0..submap.feature_count())
            .into_par_iter()
            .map(|local| {
                let mut row: Vec<(usize, f64)> = candidates
                    .iter()
                    .enumerate()
                    .filter_map(|(c, candidate)| {
                        scene
                            .distance_sq(&[(local, candidate)])
                            .map(|d2| (c, d2.max(0.0).sqrt()))
                    })
                    .collect();
                row.sort_by(|a, b| a.1.total_cmp(&b.1));
                row
            })
            .collect();

        // First come, first served
        let mut taken = BTreeSet::new();
        let mut pairs = Vec::new();
        let mut unmatched = Vec::new();
        for (local, row) in table.iter().enumerate() {
            match row.iter().find(|(c, _)| !taken.contains(c)) {
                Some(&(c, distance)) if distance <= threshold => {
                    taken.insert(c);
                    pairs.push((local, c, distance));
                }
                _ => unmatched.push(local),
            }
        }

        if self.config.joint_compatibility {
            self.prune_jointly_incompatible(&scene, &candidates, &mut pairs, &mut unmatched);
        }
        unmatched.sort_unstable();

        debug!(
            candidates = candidates.len(),
            matched = pairs.len(),
            unmatched = unmatched.len(),
            "Nearest-neighbour association"
        );

        Ok(Association {
            pairs: pairs
                .into_iter()
                .map(|(local, c, distance)| MatchPair {
                    local,
                    global: candidates[c].id,
                    distance,
                })
                .collect(),
            unmatched,
            start_pose: prior.start_pose,
            strategy: AssociationStrategy::NearestNeighbor,
        })
    }
}

/// Winning cell of one heading hypothesis
#[derive(Debug, Clone)]
struct Vote {
    step: usize,
    theta: f64,
    cell: (i64, i64),
    /// (local index, global index) pairs that fell into the cell
    pairs: Vec<(usize, usize)>,
}

/// Pairwise heading/translation voting for global relocalization
#[derive(Debug, Clone)]
pub struct GridVotingAssociator {
    config: GridConfig,
    multiplier: f64,
}

impl Default for GridVotingAssociator {
    fn default() -> Self {
        Self::new()
    }
}

impl GridVotingAssociator {
    pub fn new() -> Self {
        Self::with_config(GridConfig::default())
    }

    pub fn with_config(config: GridConfig) -> Self {
        Self {
            multiplier: config.initial_multiplier,
            config,
        }
    }

    /// Current uncertainty multiplier of the grid extent
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn heading_steps(&self) -> usize {
        ((360.0 / self.config.angular_step_deg).round() as usize).max(1)
    }

    fn vote(
        &self,
        submap: &LocalSubmap,
        globals: &[(EntryId, Vector2<f64>)],
        prior: &Pose2D,
        extent: f64,
    ) -> Option<Vote> {
        let steps = self.heading_steps();
        let step_rad = TAU / steps as f64;
        let rate = self.config.sampling_rate;
        let origin = prior.translation();

        let best_per_heading: Vec<Vote> = (0..steps)
            .into_par_iter()
            .filter_map(|step| {
                let theta = normalize_angle(prior.theta + step as f64 * step_rad);
                let rotation = Pose2D::new(0.0, 0.0, theta).rotation();
                let mut grid: HashMap<(i64, i64), Vec<(usize, usize)>> = HashMap::new();
                for (l, local) in submap.features.iter().enumerate() {
                    let rotated = rotation * local;
                    for (g, (_, global)) in globals.iter().enumerate() {
                        let offset = global - rotated - origin;
                        if offset.x.abs() > extent || offset.y.abs() > extent {
                            continue;
                        }
                        // cells centred on the prior translation
                        let cell = (
                            (offset.x / rate).round() as i64,
                            (offset.y / rate).round() as i64,
                        );
                        grid.entry(cell).or_default().push((l, g));
                    }
                }
                grid.into_iter()
                    .max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.0.cmp(&a.0)))
                    .map(|(cell, pairs)| Vote {
                        step,
                        theta,
                        cell,
                        pairs,
                    })
            })
            .collect();

        // Most votes; ties go to the heading closest to the prior
        let angular_distance = |step: usize| step.min(steps - step);
        best_per_heading.into_iter().max_by(|a, b| {
            a.pairs
                .len()
                .cmp(&b.pairs.len())
                .then(angular_distance(b.step).cmp(&angular_distance(a.step)))
                .then(b.step.cmp(&a.step))
        })
    }

    fn relocalize(
        &self,
        submap: &LocalSubmap,
        prior: &AssociationPrior<'_>,
        extent: f64,
    ) -> FusionResult<Association> {
        let globals: Vec<(EntryId, Vector2<f64>)> = prior
            .state
            .features()
            .into_iter()
            .map(|f| (f.id, f.position))
            .collect();
        if submap.features.is_empty() || globals.is_empty() {
            return Err(FusionError::AssociationFailed(
                "no features to vote with".to_string(),
            ));
        }

        let vote = self
            .vote(submap, &globals, &prior.start_pose, extent)
            .ok_or_else(|| {
                FusionError::AssociationFailed(format!(
                    "empty vote set within {extent:.2} m of the prior"
                ))
            })?;

        // One-to-one pairs from the winning cell, closest to the cell centre first
        let rotation = Pose2D::new(0.0, 0.0, vote.theta).rotation();
        let centre = prior.start_pose.translation()
            + Vector2::new(vote.cell.0 as f64, vote.cell.1 as f64) * self.config.sampling_rate;
        let residual =
            |&(l, g): &(usize, usize)| (globals[g].1 - rotation * submap.features[l] - centre).norm();
        let mut ranked = vote.pairs.clone();
        ranked.sort_by(|a, b| residual(a).total_cmp(&residual(b)));

        let mut used_local = BTreeSet::new();
        let mut used_global = BTreeSet::new();
        let pairs: Vec<(usize, usize)> = ranked
            .into_iter()
            .filter(|&(l, g)| {
                if used_local.contains(&l) || used_global.contains(&g) {
                    return false;
                }
                used_local.insert(l);
                used_global.insert(g);
                true
            })
            .collect();
        if pairs.len() < self.config.min_votes {
            return Err(FusionError::AssociationFailed(format!(
                "best cell has {} votes, {} required",
                pairs.len(),
                self.config.min_votes
            )));
        }

        let source: Vec<Vector2<f64>> = pairs.iter().map(|&(l, _)| submap.features[l]).collect();
        let target: Vec<Vector2<f64>> = pairs.iter().map(|&(_, g)| globals[g].1).collect();
        let start_pose = match rigid_transform(&source, &target) {
            Some((theta, t)) => Pose2D::new(t.x, t.y, normalize_angle(theta)),
            None => {
                let rotation = Pose2D::new(0.0, 0.0, vote.theta).rotation();
                let t = target[0] - rotation * source[0];
                Pose2D::new(t.x, t.y, vote.theta)
            }
        };

        debug!(
            votes = vote.pairs.len(),
            matched = pairs.len(),
            cell = ?vote.cell,
            heading = vote.theta,
            x = start_pose.x,
            y = start_pose.y,
            theta = start_pose.theta,
            "Grid voting relocalized submap"
        );

        let matched: BTreeSet<usize> = pairs.iter().map(|&(l, _)| l).collect();
        Ok(Association {
            pairs: pairs
                .into_iter()
                .map(|(l, g)| MatchPair {
                    local: l,
                    global: globals[g].0,
                    distance: (start_pose.transform_point(&submap.features[l]) - globals[g].1)
                        .norm(),
                })
                .collect(),
            unmatched: (0..submap.feature_count())
                .filter(|l| !matched.contains(l))
                .collect(),
            start_pose,
            strategy: AssociationStrategy::GridVoting,
        })
    }
}

impl DataAssociator for GridVotingAssociator {
    fn strategy(&self) -> AssociationStrategy {
        AssociationStrategy::GridVoting
    }

    fn associate(
        &mut self,
        submap: &LocalSubmap,
        prior: &AssociationPrior<'_>,
    ) -> FusionResult<Association> {
        let extent = (submap.radius() * self.multiplier).max(self.config.sampling_rate);
        let result = self.relocalize(submap, prior, extent);
        self.multiplier += self.config.growth_increment;
        result
    }
}

/// Least-squares rotation and translation mapping `source` onto `target` (SVD)
pub fn rigid_transform(
    source: &[Vector2<f64>],
    target: &[Vector2<f64>],
) -> Option<(f64, Vector2<f64>)> {
    if source.len() < 2 || source.len() != target.len() {
        return None;
    }

    let n = source.len() as f64;

    // Compute centroids
    let mut src_centroid = Vector2::<f64>::zeros();
    let mut tgt_centroid = Vector2::<f64>::zeros();
    for (s, t) in source.iter().zip(target.iter()) {
        src_centroid += s;
        tgt_centroid += t;
    }
    src_centroid /= n;
    tgt_centroid /= n;

    // Cross-covariance of the centered sets
    let mut h = Matrix2::<f64>::zeros();
    for (s, t) in source.iter().zip(target.iter()) {
        h += (s - src_centroid) * (t - tgt_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    // R = V Uᵀ, with the reflection case corrected
    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        let mut v_t_corrected = v_t;
        v_t_corrected[(1, 0)] *= -1.0;
        v_t_corrected[(1, 1)] *= -1.0;
        r = v_t_corrected.transpose() * u.transpose();
    }

    let rotation = r[(1, 0)].atan2(r[(0, 0)]);
    let translation = tgt_centroid - r * src_centroid;
    Some((rotation, translation))
}
