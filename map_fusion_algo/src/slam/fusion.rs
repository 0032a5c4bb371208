//! Global map fusion engine
//!
//! Local submaps are fused one at a time into a sparse extended information
//! filter. Each submap is linked to the previous one through its start pose,
//! which is the end pose of the last fused submap. The filter keeps the
//! information matrix `I` and vector `i`; the estimate is recovered by
//! solving `I x = i` with a sparse block Cholesky factorization.
//!
//! Fusing a submap:
//! 1. Associate its features with the global map (nearest neighbour while
//!    the estimation error is small, grid voting otherwise)
//! 2. Append the unmatched features and the new end pose to the state
//! 3. Add the linearized contribution `ΔI`, `Δi` of the submap
//! 4. Reorder with approximate minimum degree when the state grew
//! 5. Factor, solve and relinearize until the estimate settles
//!
//! Every step runs on a copy of the map, so a failed submap leaves the
//! engine exactly as it was.
//!
//! A full refusion replays the recorded submaps into a fresh map with the
//! live associator state. A submap that no longer associates is fused again
//! with the match it was committed with.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector2};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::association::{
    AssociationPrior, AssociationStrategy, DataAssociator, GridVotingAssociator,
    NearestNeighborAssociator,
};
use super::information::{InformationFilterUpdater, SubmapLinkage};
use super::state::{EntryId, GlobalState, Pose2D, POSE_DIM};
use super::submap::LocalSubmap;
use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};
use crate::linalg::{
    BlockCholeskyFactor, MinimumDegreeReorderer, SparseBlockColumn, SparseBlockMatrix,
    SparseCholeskyConfig, SparseCholeskySolver, SparsityStats,
};

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FusionPhase {
    /// No submap fused yet
    Empty,
    /// Only the seed submap is in the map
    Bootstrapped,
    /// At least one submap has been fused against the map
    Fusing,
}

/// A fused submap and the state entries it is linked to
#[derive(Debug, Clone)]
pub struct SubmapRecord {
    /// Arrival order, kept across refusions
    pub sequence: usize,
    pub submap: LocalSubmap,
    /// Association the submap was committed with; `None` for the seed submap
    pub strategy: Option<AssociationStrategy>,
    /// Pose the submap frame starts at; `None` for the seed submap
    pub start: Option<EntryId>,
    pub end: EntryId,
    /// Global feature for every local feature, in local order
    pub features: Vec<EntryId>,
}

/// Outcome of one fused submap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusionReport {
    pub sequence: usize,
    /// Association used; `None` for the seed submap
    pub strategy: Option<AssociationStrategy>,
    pub matched: usize,
    pub new_features: usize,
    /// Relinearization rebuilds after the incremental update
    pub smoothing_iterations: usize,
    pub reordered: bool,
    /// A full refusion ran after this submap
    pub refused: bool,
    /// Largest estimate change of the last solve
    pub estimate_change: f64,
    pub estimation_error: f64,
}

/// Outcome of a full refusion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefusionSummary {
    pub fused: usize,
    /// Sequences fused again with their committed association
    pub replayed: Vec<usize>,
    /// Sequences of submaps that could not be fused again
    pub dropped: Vec<usize>,
    /// Largest end pose translation shift against the previous estimate
    pub max_pose_shift: f64,
}

/// Everything a fusion step mutates
#[derive(Debug, Clone)]
struct MapCore {
    state: GlobalState,
    matrix: SparseBlockMatrix,
    vector: SparseBlockColumn,
    factor: Option<BlockCholeskyFactor>,
    records: Vec<SubmapRecord>,
    estimation_error: f64,
}

impl Default for MapCore {
    fn default() -> Self {
        Self {
            state: GlobalState::new(),
            matrix: SparseBlockMatrix::new(Vec::new()),
            vector: SparseBlockColumn::new(Vec::new(), 1),
            factor: None,
            records: Vec::new(),
            estimation_error: 0.0,
        }
    }
}

struct Integration {
    reordered: bool,
    iterations: usize,
    change: f64,
}

#[derive(Debug, Clone)]
pub struct GlobalMapFusionEngine {
    config: FusionConfig,
    phase: FusionPhase,
    core: MapCore,
    nearest: NearestNeighborAssociator,
    grid: GridVotingAssociator,
    updater: InformationFilterUpdater,
    solver: SparseCholeskySolver,
    reorderer: MinimumDegreeReorderer,
    next_sequence: usize,
    /// Submaps accepted by `consume_local_submap`, drives the refusion schedule
    accepted: usize,
    refusion_enabled: bool,
}

impl Default for GlobalMapFusionEngine {
    fn default() -> Self {
        Self::with_config(FusionConfig::default())
    }
}

impl GlobalMapFusionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FusionConfig) -> Self {
        Self {
            nearest: NearestNeighborAssociator::with_config(config.association.clone()),
            grid: GridVotingAssociator::with_config(config.grid.clone()),
            updater: InformationFilterUpdater::new(),
            solver: SparseCholeskySolver::with_config(SparseCholeskyConfig {
                pivot_tolerance: config.solver.pivot_tolerance,
            }),
            reorderer: MinimumDegreeReorderer::new(),
            phase: FusionPhase::Empty,
            core: MapCore::default(),
            next_sequence: 0,
            accepted: 0,
            refusion_enabled: true,
            config,
        }
    }

    /// Fuse one local submap into the global map
    ///
    /// On error the engine is unchanged. Association failures and invalid
    /// submaps are recoverable: the caller may go on with the next submap.
    pub fn consume_local_submap(&mut self, submap: LocalSubmap) -> FusionResult<FusionReport> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut report = match self.consume_sequenced(submap, sequence) {
            Ok(report) => report,
            Err(err) => {
                if err.is_recoverable() {
                    warn!(sequence, error = %err, "Submap rejected");
                } else {
                    error!(sequence, error = %err, "Submap fusion failed");
                }
                return Err(err);
            }
        };
        self.accepted += 1;

        if self.refusion_due() {
            match self.refuse_all() {
                Ok(summary) => {
                    report.refused = true;
                    report.estimation_error = self.core.estimation_error;
                    debug!(
                        sequence,
                        dropped = summary.dropped.len(),
                        shift = summary.max_pose_shift,
                        "Scheduled refusion done"
                    );
                }
                Err(err) => {
                    warn!(sequence, error = %err, "Refusion failed, keeping incremental estimate");
                }
            }
        }

        info!(
            sequence,
            strategy = ?report.strategy,
            matched = report.matched,
            new_features = report.new_features,
            iterations = report.smoothing_iterations,
            error = report.estimation_error,
            "Fused submap"
        );
        Ok(report)
    }

    /// Fuse every recorded submap again, in order, into a fresh map
    ///
    /// The fresh map associates with the current associator state, so the
    /// grid extent keeps its growth. Submaps that no longer associate are
    /// fused with their committed association, and dropped only when that
    /// fails too. The result replaces the current map only if the whole
    /// pass succeeds.
    pub fn refuse_all(&mut self) -> FusionResult<RefusionSummary> {
        let mut fresh = Self::with_config(self.config.clone());
        fresh.refusion_enabled = false;
        fresh.nearest = self.nearest.clone();
        fresh.grid = self.grid.clone();

        // previous feature id -> feature id in the fresh map
        let mut ids: HashMap<EntryId, EntryId> = HashMap::new();
        let mut replayed = Vec::new();
        let mut dropped = Vec::new();
        for record in &self.core.records {
            match fresh.consume_sequenced(record.submap.clone(), record.sequence) {
                Ok(_) => {}
                Err(err) if err.is_recoverable() => {
                    debug!(sequence = record.sequence, error = %err, "Replaying committed association");
                    match fresh.consume_committed(&self.core.state, record, &ids) {
                        Ok(()) => replayed.push(record.sequence),
                        Err(err) if err.is_recoverable() => {
                            warn!(sequence = record.sequence, error = %err, "Dropping submap from refusion");
                            dropped.push(record.sequence);
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
            if let Some(current) = fresh.core.records.last() {
                for (previous, now) in record.features.iter().zip(&current.features) {
                    ids.entry(*previous).or_insert(*now);
                }
            }
        }

        let mut max_pose_shift: f64 = 0.0;
        for record in &fresh.core.records {
            let previous = self
                .core
                .records
                .iter()
                .find(|r| r.sequence == record.sequence)
                .map(|r| self.core.state.pose(r.end))
                .transpose()?;
            if let Some(previous) = previous {
                let current = fresh.core.state.pose(record.end)?;
                max_pose_shift =
                    max_pose_shift.max((current.translation() - previous.translation()).norm());
            }
        }

        let summary = RefusionSummary {
            fused: fresh.core.records.len(),
            replayed,
            dropped,
            max_pose_shift,
        };
        info!(
            fused = summary.fused,
            replayed = summary.replayed.len(),
            dropped = summary.dropped.len(),
            shift = summary.max_pose_shift,
            "Refused global map"
        );
        self.core = fresh.core;
        self.phase = fresh.phase;
        Ok(summary)
    }

    fn refusion_due(&self) -> bool {
        let schedule = &self.config.refusion;
        self.refusion_enabled
            && self.accepted > 0
            && ((schedule.first_at > 0 && self.accepted == schedule.first_at)
                || (schedule.period > 0 && self.accepted % schedule.period == 0))
    }

    /// Fuse a submap under a given sequence number, committing only on success
    fn consume_sequenced(
        &mut self,
        submap: LocalSubmap,
        sequence: usize,
    ) -> FusionResult<FusionReport> {
        submap.validate(self.config.submap_capacity)?;

        let mut core = self.core.clone();
        let report = match self.phase {
            FusionPhase::Empty => self.bootstrap(&mut core, submap, sequence)?,
            FusionPhase::Bootstrapped | FusionPhase::Fusing => {
                self.fuse(&mut core, submap, sequence)?
            }
        };

        self.core = core;
        self.phase = match self.phase {
            FusionPhase::Empty => FusionPhase::Bootstrapped,
            _ => FusionPhase::Fusing,
        };
        Ok(report)
    }

    /// The seed submap defines the global frame
    fn bootstrap(
        &self,
        core: &mut MapCore,
        submap: LocalSubmap,
        sequence: usize,
    ) -> FusionResult<FusionReport> {
        let end = core.state.push_pose(submap.end_pose, submap.radius());
        let features: Vec<EntryId> = submap
            .features
            .iter()
            .map(|f| core.state.push_feature(*f, None))
            .collect();
        let new_features = features.len();

        let record = SubmapRecord {
            sequence,
            submap,
            strategy: None,
            start: None,
            end,
            features,
        };
        let outcome = self.integrate(core, record, false)?;

        Ok(FusionReport {
            sequence,
            strategy: None,
            matched: 0,
            new_features,
            smoothing_iterations: outcome.iterations,
            reordered: outcome.reordered,
            refused: false,
            estimate_change: outcome.change,
            estimation_error: core.estimation_error,
        })
    }

    fn fuse(
        &mut self,
        core: &mut MapCore,
        submap: LocalSubmap,
        sequence: usize,
    ) -> FusionResult<FusionReport> {
        let start_id = core
            .records
            .last()
            .map(|r| r.end)
            .ok_or_else(|| FusionError::InvalidSubmap("no submap to link to".to_string()))?;
        let prior_start = core.state.pose(start_id)?;

        let association = {
            let prior = AssociationPrior {
                state: &core.state,
                factor: core.factor.as_ref(),
                start_pose: prior_start,
                start_id: Some(start_id),
                estimation_error: core.estimation_error,
            };
            if core.estimation_error < self.config.estimation_error_cutoff {
                self.nearest.associate(&submap, &prior)?
            } else {
                debug!(
                    sequence,
                    error = core.estimation_error,
                    multiplier = self.grid.multiplier(),
                    "Estimation error above cutoff, relocalizing by grid voting"
                );
                self.grid.associate(&submap, &prior)?
            }
        };

        if association.pairs.is_empty() && !self.config.association.allow_unmatched_submaps {
            return Err(FusionError::AssociationFailed(format!(
                "none of {} local features matched the global map",
                submap.feature_count()
            )));
        }

        if association.strategy == AssociationStrategy::GridVoting {
            core.state.set_pose(start_id, association.start_pose)?;
        }
        let matches = (0..submap.feature_count())
            .map(|local| association.global_for(local))
            .collect();
        let (outcome, new_features) = self.link(
            core,
            submap,
            sequence,
            start_id,
            association.strategy,
            matches,
        )?;

        Ok(FusionReport {
            sequence,
            strategy: Some(association.strategy),
            matched: association.matched_count(),
            new_features,
            smoothing_iterations: outcome.iterations,
            reordered: outcome.reordered,
            refused: false,
            estimate_change: outcome.change,
            estimation_error: core.estimation_error,
        })
    }

    /// Fuse a recorded submap with the association it was committed with
    ///
    /// `ids` maps feature ids of `previous` to the ids they got in this map.
    /// Features the submap introduced are added again.
    fn consume_committed(
        &mut self,
        previous: &GlobalState,
        record: &SubmapRecord,
        ids: &HashMap<EntryId, EntryId>,
    ) -> FusionResult<()> {
        let (Some(recorded_start), Some(strategy)) = (record.start, record.strategy) else {
            return Err(FusionError::AssociationFailed(
                "seed submap has no committed association".to_string(),
            ));
        };

        let mut core = self.core.clone();
        let start_id = core
            .records
            .last()
            .map(|r| r.end)
            .ok_or_else(|| FusionError::InvalidSubmap("no submap to link to".to_string()))?;
        if strategy == AssociationStrategy::GridVoting {
            core.state.set_pose(start_id, previous.pose(recorded_start)?)?;
        }

        let matches = record
            .features
            .iter()
            .map(|id| -> FusionResult<Option<EntryId>> {
                if previous.feature_entry(*id)?.anchor == Some(recorded_start) {
                    return Ok(None);
                }
                ids.get(id).copied().map(Some).ok_or_else(|| {
                    FusionError::AssociationFailed(format!(
                        "feature {id} has no counterpart in the refused map"
                    ))
                })
            })
            .collect::<FusionResult<Vec<_>>>()?;
        self.link(
            &mut core,
            record.submap.clone(),
            record.sequence,
            start_id,
            strategy,
            matches,
        )?;

        self.core = core;
        self.phase = FusionPhase::Fusing;
        Ok(())
    }

    /// Add the unmatched features and the end pose, then integrate the submap
    ///
    /// The submap starts at the current estimate of `start_id`; grid voting
    /// has already moved it there, which forces a relinearization.
    fn link(
        &self,
        core: &mut MapCore,
        submap: LocalSubmap,
        sequence: usize,
        start_id: EntryId,
        strategy: AssociationStrategy,
        matches: Vec<Option<EntryId>>,
    ) -> FusionResult<(Integration, usize)> {
        let start = core.state.pose(start_id)?;
        let mut new_features = 0;
        let features: Vec<EntryId> = submap
            .features
            .iter()
            .zip(matches)
            .map(|(local, matched)| match matched {
                Some(id) => id,
                None => {
                    new_features += 1;
                    core.state
                        .push_feature(start.transform_point(local), Some(start_id))
                }
            })
            .collect();
        let end = core
            .state
            .push_pose(start.compose(&submap.end_pose), submap.radius());

        let record = SubmapRecord {
            sequence,
            submap,
            strategy: Some(strategy),
            start: Some(start_id),
            end,
            features,
        };
        let relocalized = strategy == AssociationStrategy::GridVoting;
        let outcome = self.integrate(core, record, relocalized)?;
        Ok((outcome, new_features))
    }

    /// Add the submap's information, solve and relinearize
    fn integrate(
        &self,
        core: &mut MapCore,
        record: SubmapRecord,
        force_rebuild: bool,
    ) -> FusionResult<Integration> {
        let dims = core.state.dims();
        let known = core.matrix.len();
        let grown = dims.len() > known;
        if grown {
            core.matrix.enlarge(&dims[known..]);
            core.vector.enlarge(&dims[known..]);
        }

        let linkage = linkage(&core.state, &record)?;
        let contribution =
            self.updater
                .compute_contribution(&record.submap, &core.state, &linkage)?;
        core.matrix.add_assign(&contribution.matrix)?;
        core.vector.add_assign(&contribution.vector)?;
        core.records.push(record);

        let reordered = grown && self.config.solver.reorder && self.reorder(core)?;
        let mut change = self.solve(core)?;

        let smoothing = &self.config.smoothing;
        let mut iterations = 0;
        let mut pending = force_rebuild;
        while (pending || change > smoothing.convergence_cutoff)
            && iterations < smoothing.max_iterations
        {
            change = self.rebuild(core)?;
            iterations += 1;
            pending = false;
        }
        if change > smoothing.convergence_cutoff {
            debug!(change, iterations, "Relinearization budget exhausted");
        }

        core.estimation_error = latest_pose_error(core)?;
        Ok(Integration {
            reordered,
            iterations,
            change,
        })
    }

    /// Apply a minimum degree ordering to matrix, vector and state at once
    fn reorder(&self, core: &mut MapCore) -> FusionResult<bool> {
        let reordered = self
            .reorderer
            .reorder(&core.matrix, &core.vector, &core.state)?;
        if reordered.permutation.is_identity() {
            return Ok(false);
        }
        core.matrix = reordered.matrix;
        core.vector = reordered.vector;
        core.state = reordered.state;
        core.factor = None;
        debug!(entries = core.state.len(), "Reordered global state");
        Ok(true)
    }

    fn solve(&self, core: &mut MapCore) -> FusionResult<f64> {
        let (factor, solution) = self.solver.solve(&core.matrix, &core.vector)?;
        let change = core.state.apply_estimate(&solution)?;
        core.factor = Some(factor);
        Ok(change)
    }

    /// Relinearize every submap around the current estimate and solve again
    fn rebuild(&self, core: &mut MapCore) -> FusionResult<f64> {
        let dims = core.state.dims();
        let mut matrix = SparseBlockMatrix::new(dims.clone());
        let mut vector = SparseBlockColumn::new(dims, 1);
        for record in &core.records {
            let linkage = linkage(&core.state, record)?;
            let contribution =
                self.updater
                    .compute_contribution(&record.submap, &core.state, &linkage)?;
            matrix.add_assign(&contribution.matrix)?;
            vector.add_assign(&contribution.vector)?;
        }
        core.matrix = matrix;
        core.vector = vector;
        self.solve(core)
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn phase(&self) -> FusionPhase {
        self.phase
    }

    pub fn global_state(&self) -> &GlobalState {
        &self.core.state
    }

    pub fn records(&self) -> &[SubmapRecord] {
        &self.core.records
    }

    /// Sequence number the next submap will get
    pub fn next_sequence(&self) -> usize {
        self.next_sequence
    }

    pub fn submap_count(&self) -> usize {
        self.core.records.len()
    }

    /// Trajectory of submap end poses in fusion order
    pub fn poses(&self) -> FusionResult<Vec<Pose2D>> {
        self.core
            .records
            .iter()
            .map(|r| self.core.state.pose(r.end))
            .collect()
    }

    pub fn latest_pose(&self) -> Option<Pose2D> {
        self.core
            .records
            .last()
            .and_then(|r| self.core.state.pose(r.end).ok())
    }

    /// Global features ordered by creation
    pub fn features(&self) -> Vec<(EntryId, Vector2<f64>)> {
        self.core
            .state
            .features()
            .into_iter()
            .map(|f| (f.id, f.position))
            .collect()
    }

    /// Translational uncertainty of the latest pose, `sqrt(σx² + σy²)`
    pub fn estimation_error(&self) -> f64 {
        self.core.estimation_error
    }

    /// Marginal covariance of a pose
    pub fn pose_covariance(&self, id: EntryId) -> FusionResult<Matrix3<f64>> {
        let entry = self.core.state.entry(id)?;
        if !entry.is_pose() {
            return Err(FusionError::dimension(
                "pose covariance",
                (POSE_DIM, POSE_DIM),
                (entry.dim(), entry.dim()),
            ));
        }
        let factor = self.factor()?;
        let block = factor.marginal_covariance(entry.index())?;
        Ok(block.as_dmatrix().fixed_view::<3, 3>(0, 0).into_owned())
    }

    pub fn information_matrix(&self) -> &SparseBlockMatrix {
        &self.core.matrix
    }

    pub fn information_vector(&self) -> &SparseBlockColumn {
        &self.core.vector
    }

    pub fn sparsity_stats(&self) -> SparsityStats {
        self.core.matrix.sparsity_stats()
    }

    fn factor(&self) -> FusionResult<&BlockCholeskyFactor> {
        self.core
            .factor
            .as_ref()
            .ok_or(FusionError::IndexOutOfRange { index: 0, len: 0 })
    }
}

/// Current state indices of the entries a record is linked to
fn linkage(state: &GlobalState, record: &SubmapRecord) -> FusionResult<SubmapLinkage> {
    Ok(SubmapLinkage {
        start: record.start.map(|id| state.index_of(id)).transpose()?,
        end: state.index_of(record.end)?,
        features: record
            .features
            .iter()
            .map(|id| state.index_of(*id))
            .collect::<FusionResult<_>>()?,
    })
}

fn latest_pose_error(core: &MapCore) -> FusionResult<f64> {
    let (Some(record), Some(factor)) = (core.records.last(), core.factor.as_ref()) else {
        return Ok(0.0);
    };
    let covariance = factor.marginal_covariance(core.state.index_of(record.end)?)?;
    let p = covariance.as_dmatrix();
    Ok((p[(0, 0)] + p[(1, 1)]).max(0.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;
    use approx::assert_relative_eq;

    fn seed() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::origin(),
            vec![
                Vector2::new(1.0, 2.0),
                Vector2::new(3.0, -1.0),
                Vector2::new(-2.0, 1.5),
            ],
            1e-4,
            1e-5,
            1e-4,
        )
    }

    /// Seed features seen again from the seed pose, plus one new feature
    fn second() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::new(1.0, 0.0, 0.0),
            vec![Vector2::new(1.0, 2.0), Vector2::new(4.0, 3.0)],
            1e-4,
            1e-5,
            1e-4,
        )
    }

    /// Seed features seen again from the seed pose
    fn revisit() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::origin(),
            vec![Vector2::new(1.0, 2.0), Vector2::new(3.0, -1.0)],
            1e-4,
            1e-5,
            1e-4,
        )
    }

    /// Nothing in the seed is near these features
    fn stranger() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::new(1.0, 0.0, 0.0),
            vec![Vector2::new(40.0, 40.0), Vector2::new(-30.0, 25.0)],
            1e-4,
            1e-5,
            1e-4,
        )
    }

    /// Seed with a barely known end pose and four features around x = 3
    fn loose_seed() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::origin(),
            vec![
                Vector2::new(2.5, 1.0),
                Vector2::new(3.5, -1.0),
                Vector2::new(4.0, 1.5),
                Vector2::new(2.8, -1.8),
            ],
            100.0,
            1e-5,
            1e-4,
        )
    }

    /// The loose seed features seen from (3, 0, 0), plus one new feature
    fn displaced() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::new(1.0, 0.0, 0.0),
            vec![
                Vector2::new(-0.5, 1.0),
                Vector2::new(0.5, -1.0),
                Vector2::new(1.0, 1.5),
                Vector2::new(-0.2, -1.8),
                Vector2::new(1.5, 0.3),
            ],
            1e-4,
            1e-5,
            1e-4,
        )
    }

    /// Tiny submap whose votes all fall outside the grid extent
    fn speck() -> LocalSubmap {
        LocalSubmap::with_diagonal_covariance(
            Pose2D::new(0.1, 0.0, 0.0),
            vec![Vector2::new(0.1, 0.0), Vector2::new(0.0, 0.1)],
            1e-4,
            1e-5,
            1e-4,
        )
    }

    /// Fuses `displaced` only after two failed relocalizations grew the grid
    fn relocalized_engine() -> GlobalMapFusionEngine {
        let mut engine = engine();
        engine.consume_local_submap(loose_seed()).unwrap();
        for _ in 0..2 {
            let err = engine.consume_local_submap(speck()).unwrap_err();
            assert!(err.to_string().contains("empty vote set"));
        }
        assert_relative_eq!(engine.grid.multiplier(), 2.0);

        let report = engine.consume_local_submap(displaced()).unwrap();
        assert_eq!(report.sequence, 3);
        assert_eq!(report.strategy, Some(AssociationStrategy::GridVoting));
        assert_eq!(report.matched, 4);
        assert_eq!(report.new_features, 1);
        assert_relative_eq!(engine.grid.multiplier(), 2.5);
        engine
    }

    fn engine() -> GlobalMapFusionEngine {
        let mut config = FusionConfig::default();
        config.refusion.first_at = 0;
        config.refusion.period = 0;
        GlobalMapFusionEngine::with_config(config)
    }

    #[test]
    fn test_bootstrap_defines_global_frame() {
        let mut engine = engine();
        assert_eq!(engine.phase(), FusionPhase::Empty);

        let report = engine.consume_local_submap(seed()).unwrap();
        assert_eq!(engine.phase(), FusionPhase::Bootstrapped);
        assert_eq!(report.strategy, None);
        assert_eq!(report.new_features, 3);
        assert_eq!(engine.global_state().feature_count(), 3);
        assert_eq!(engine.global_state().pose_count(), 1);

        let pose = engine.latest_pose().unwrap();
        assert_relative_eq!(pose.to_vector(), Pose2D::origin().to_vector(), epsilon = 1e-9);
        let positions: Vec<_> = engine.features().into_iter().map(|(_, p)| p).collect();
        assert_relative_eq!(positions[1], Vector2::new(3.0, -1.0), epsilon = 1e-9);
        assert!(engine.global_state().features().iter().all(|f| f.anchor.is_none()));
    }

    #[test]
    fn test_second_submap_adds_only_new_feature() {
        let mut engine = engine();
        engine.consume_local_submap(seed()).unwrap();
        let report = engine.consume_local_submap(second()).unwrap();

        assert_eq!(engine.phase(), FusionPhase::Fusing);
        assert_eq!(report.strategy, Some(AssociationStrategy::NearestNeighbor));
        assert_eq!(report.matched, 1);
        assert_eq!(report.new_features, 1);
        assert_eq!(engine.global_state().feature_count(), 4);
        assert_eq!(engine.global_state().pose_count(), 2);

        let pose = engine.latest_pose().unwrap();
        assert_relative_eq!(pose.to_vector(), Pose2D::new(1.0, 0.0, 0.0).to_vector(), epsilon = 1e-6);
        let (_, newest) = engine.features()[3];
        assert_relative_eq!(newest, Vector2::new(4.0, 3.0), epsilon = 1e-6);

        let record = &engine.records()[1];
        assert_eq!(record.start, Some(engine.records()[0].end));
        assert_eq!(record.features[0], engine.records()[0].features[0]);
    }

    #[test]
    fn test_estimation_error_grows_along_chain() {
        let mut engine = engine();
        engine.consume_local_submap(seed()).unwrap();
        let seeded = engine.estimation_error();
        assert_relative_eq!(seeded, (2e-4f64).sqrt(), epsilon = 1e-9);

        engine.consume_local_submap(second()).unwrap();
        assert!(engine.estimation_error() > seeded);

        let end = engine.records()[1].end;
        let covariance = engine.pose_covariance(end).unwrap();
        assert_relative_eq!(covariance, covariance.transpose(), epsilon = 1e-12);
        assert!(covariance[(0, 0)] > 0.0 && covariance[(2, 2)] > 0.0);
    }

    #[test]
    fn test_failed_association_leaves_engine_unchanged() {
        let mut engine = engine();
        engine.consume_local_submap(seed()).unwrap();
        let before_matrix = engine.information_matrix().clone();
        let before_len = engine.global_state().len();

        let err = engine.consume_local_submap(stranger()).unwrap_err();
        assert!(matches!(err, FusionError::AssociationFailed(_)));
        assert!(err.is_recoverable());
        assert_eq!(engine.phase(), FusionPhase::Bootstrapped);
        assert_eq!(engine.global_state().len(), before_len);
        assert_eq!(engine.information_matrix(), &before_matrix);

        // the next good submap still links to the seed
        let report = engine.consume_local_submap(second()).unwrap();
        assert_eq!(report.sequence, 2);
        assert_eq!(engine.submap_count(), 2);
    }

    #[test]
    fn test_unmatched_submap_allowed_by_config() {
        let mut config = FusionConfig::default();
        config.association.allow_unmatched_submaps = true;
        let mut engine = GlobalMapFusionEngine::with_config(config);
        engine.consume_local_submap(seed()).unwrap();

        let stranger = LocalSubmap::with_diagonal_covariance(
            Pose2D::new(1.0, 0.0, 0.0),
            vec![Vector2::new(40.0, 40.0)],
            1e-4,
            1e-5,
            1e-4,
        );
        let report = engine.consume_local_submap(stranger).unwrap();
        assert_eq!(report.matched, 0);
        assert_eq!(engine.global_state().feature_count(), 4);
    }

    #[test]
    fn test_invalid_submap_rejected() {
        let mut config = FusionConfig::default();
        config.submap_capacity = 2;
        let mut engine = GlobalMapFusionEngine::with_config(config);
        let err = engine.consume_local_submap(seed()).unwrap_err();
        assert!(matches!(err, FusionError::InvalidSubmap(_)));
        assert_eq!(engine.phase(), FusionPhase::Empty);
    }

    #[test]
    fn test_information_matches_state_blocking() {
        let mut engine = engine();
        engine.consume_local_submap(seed()).unwrap();
        engine.consume_local_submap(second()).unwrap();

        let state = engine.global_state();
        assert_eq!(engine.information_matrix().dims(), state.dims().as_slice());
        assert_eq!(engine.information_vector().dims(), state.dims().as_slice());
        for (index, entry) in state.entries().iter().enumerate() {
            assert_eq!(entry.index(), index);
        }
        let stats = engine.sparsity_stats();
        assert!(stats.to_string().contains("blocks"));
    }

    #[test]
    fn test_refuse_all_keeps_map() {
        let mut engine = engine();
        engine.consume_local_submap(seed()).unwrap();
        engine.consume_local_submap(second()).unwrap();
        let features = engine.global_state().feature_count();
        let poses = engine.poses().unwrap();

        let summary = engine.refuse_all().unwrap();
        assert_eq!(summary.fused, 2);
        assert!(summary.replayed.is_empty());
        assert!(summary.dropped.is_empty());
        assert!(summary.max_pose_shift < 1e-6);
        assert_eq!(engine.global_state().feature_count(), features);
        let refused = engine.poses().unwrap();
        for (a, b) in poses.iter().zip(&refused) {
            assert_relative_eq!(a.to_vector(), b.to_vector(), epsilon = 1e-6);
        }
        assert_eq!(engine.records()[1].sequence, 1);
    }

    #[test]
    fn test_scheduled_refusion() {
        let mut config = FusionConfig::default();
        config.refusion.first_at = 2;
        config.refusion.period = 0;
        let mut engine = GlobalMapFusionEngine::with_config(config);
        assert!(!engine.consume_local_submap(seed()).unwrap().refused);
        assert!(engine.consume_local_submap(second()).unwrap().refused);
    }

    #[test]
    fn test_refusion_schedule_counts_accepted_submaps() {
        let mut config = FusionConfig::default();
        config.refusion.first_at = 2;
        config.refusion.period = 3;
        let mut engine = GlobalMapFusionEngine::with_config(config);

        assert!(!engine.consume_local_submap(seed()).unwrap().refused);
        assert!(engine.consume_local_submap(stranger()).is_err());
        let refused: Vec<bool> = (0..3)
            .map(|_| engine.consume_local_submap(revisit()).unwrap().refused)
            .collect();
        assert_eq!(refused, vec![true, true, false]);
        assert_eq!(engine.submap_count(), 4);
    }

    #[test]
    fn test_singular_factorization_leaves_engine_unchanged() {
        let mut engine = engine();
        engine.consume_local_submap(seed()).unwrap();
        let before_matrix = engine.information_matrix().clone();
        let before_vector = engine.information_vector().clone();
        let before_len = engine.global_state().len();

        // every pivot falls below a relative tolerance of 1e6
        let solver = engine.solver.clone();
        engine.solver =
            SparseCholeskySolver::with_config(SparseCholeskyConfig { pivot_tolerance: 1e6 });
        let err = engine.consume_local_submap(second()).unwrap_err();
        assert!(matches!(err, FusionError::SingularBlock { .. }));
        assert!(!err.is_recoverable());
        assert_eq!(engine.phase(), FusionPhase::Bootstrapped);
        assert_eq!(engine.global_state().len(), before_len);
        assert_eq!(engine.information_matrix(), &before_matrix);
        assert_eq!(engine.information_vector(), &before_vector);
        assert_eq!(engine.submap_count(), 1);

        engine.solver = solver;
        let report = engine.consume_local_submap(second()).unwrap();
        assert_eq!(report.sequence, 2);
        assert_eq!(engine.phase(), FusionPhase::Fusing);
        assert_eq!(engine.global_state().feature_count(), 4);
    }

    #[test]
    fn test_refusion_keeps_relocalized_submap() {
        let mut engine = relocalized_engine();
        let features = engine.global_state().feature_count();
        assert_eq!(features, 5);
        let end = engine.latest_pose().unwrap();
        assert_relative_eq!(end.to_vector(), Pose2D::new(4.0, 0.0, 0.0).to_vector(), epsilon = 1e-3);

        let summary = engine.refuse_all().unwrap();
        assert_eq!(summary.fused, 2);
        assert!(summary.replayed.is_empty());
        assert!(summary.dropped.is_empty());
        assert!(summary.max_pose_shift < 1e-3);
        assert_eq!(engine.global_state().feature_count(), features);
        assert_eq!(engine.records()[1].sequence, 3);
        // the live grid keeps its own growth
        assert_relative_eq!(engine.grid.multiplier(), 2.5);
    }

    #[test]
    fn test_refusion_replays_committed_association() {
        let mut engine = relocalized_engine();
        let features = engine.global_state().feature_count();
        let end = engine.latest_pose().unwrap();

        // a grid this narrow cannot relocalize the displaced submap again
        let narrow = GridConfig {
            initial_multiplier: 0.01,
            ..engine.config().grid.clone()
        };
        engine.grid = GridVotingAssociator::with_config(narrow);

        let summary = engine.refuse_all().unwrap();
        assert_eq!(summary.fused, 2);
        assert_eq!(summary.replayed, vec![3]);
        assert!(summary.dropped.is_empty());
        assert!(summary.max_pose_shift < 1e-3);
        assert_eq!(engine.global_state().feature_count(), features);
        assert_relative_eq!(
            engine.latest_pose().unwrap().to_vector(),
            end.to_vector(),
            epsilon = 1e-3
        );

        let record = &engine.records()[1];
        assert_eq!(record.strategy, Some(AssociationStrategy::GridVoting));
        let seed_features = &engine.records()[0].features;
        assert_eq!(&record.features[..4], seed_features.as_slice());
        let added = engine.global_state().feature_entry(record.features[4]).unwrap();
        assert_eq!(added.anchor, record.start);
    }
}
