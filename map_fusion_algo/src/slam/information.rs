//! Information-form contribution of one local submap
//!
//! A submap is a measurement of its end pose and features relative to its start
//! pose. With `s` the start pose, `e` the end pose and `f` a feature (all in the
//! global frame), and `R_s` the rotation of `s`:
//!
//! ```text
//! h_e(s, e) = [R_sᵀ (t_e - t_s); θ_e - θ_s]
//! h_f(s, f) =  R_sᵀ (x_f - t_s)
//! ```
//!
//! Linearizing at the current estimate `x̂` gives the Jacobian `H` and the
//! extended information filter update
//!
//! ```text
//! ΔI = Hᵀ Σ⁻¹ H
//! Δi = Hᵀ Σ⁻¹ (z - h(x̂) + H x̂)
//! ```
//!
//! where `Σ` is the submap covariance. The first submap starts at the fixed
//! global origin, which is not a state entry; its start pose is the identity
//! and `H` reduces to the identity on the seeded entries.
//!
//! ## References
//! - [Sparse Local Submap Joining Filter](https://doi.org/10.1109/TRO.2008.2003259)
//! - [Exactly Sparse Delayed-State Filters](https://doi.org/10.1109/TRO.2006.886264)

use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};

use super::state::{normalize_angle, GlobalState, Pose2D, FEATURE_DIM, POSE_DIM};
use super::submap::LocalSubmap;
use crate::error::{FusionError, FusionResult};
use crate::linalg::{BlockMatrix, SparseBlockColumn, SparseBlockMatrix};

/// State indices a submap measurement touches
#[derive(Debug, Clone, PartialEq)]
pub struct SubmapLinkage {
    /// Start pose entry (`None` for the fixed global origin)
    pub start: Option<usize>,
    /// End pose entry
    pub end: usize,
    /// Global entry of each local feature, in submap order
    pub features: Vec<usize>,
}

/// Information matrix and vector increments, blocked like the global state
#[derive(Debug, Clone)]
pub struct InformationContribution {
    pub matrix: SparseBlockMatrix,
    pub vector: SparseBlockColumn,
}

/// One measurement block row of the Jacobian: (state index, partial) pairs
type JacobianRow = Vec<(usize, DMatrix<f64>)>;

/// Partials of the relative end-pose measurement w.r.t. (start, end)
pub fn end_pose_jacobian(start: &Pose2D, end: &Pose2D) -> (Matrix3<f64>, Matrix3<f64>) {
    let (s, c) = start.theta.sin_cos();
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let h_start = Matrix3::new(
        -c,
        -s,
        -s * dx + c * dy,
        s,
        -c,
        -c * dx - s * dy,
        0.0,
        0.0,
        -1.0,
    );
    let h_end = Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0);
    (h_start, h_end)
}

/// Partials of the relative feature measurement w.r.t. (start, feature)
pub fn feature_jacobian(start: &Pose2D, feature: &Vector2<f64>) -> (Matrix2x3<f64>, Matrix2<f64>) {
    let (s, c) = start.theta.sin_cos();
    let fx = feature.x - start.x;
    let fy = feature.y - start.y;
    let h_start = Matrix2x3::new(-c, -s, -s * fx + c * fy, s, -c, -c * fx - s * fy);
    let h_feature = Matrix2::new(c, s, -s, c);
    (h_start, h_feature)
}

fn to_dynamic<const R: usize, const C: usize>(
    m: &nalgebra::SMatrix<f64, R, C>,
) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}

/// Builds the information contribution of a submap
#[derive(Debug, Clone, Default)]
pub struct InformationFilterUpdater;

impl InformationFilterUpdater {
    pub fn new() -> Self {
        Self
    }

    /// Predicted measurement `h(x̂)` and Jacobian rows at the current estimate
    pub fn linearize(
        &self,
        submap: &LocalSubmap,
        state: &GlobalState,
        linkage: &SubmapLinkage,
    ) -> FusionResult<(DVector<f64>, Vec<JacobianRow>)> {
        if linkage.features.len() != submap.feature_count() {
            return Err(FusionError::InvalidSubmap(format!(
                "{} feature links for {} submap features",
                linkage.features.len(),
                submap.feature_count()
            )));
        }

        let start = match linkage.start {
            Some(index) => pose_at(state, index)?,
            None => Pose2D::origin(),
        };
        let end = pose_at(state, linkage.end)?;

        let mut predicted = DVector::zeros(submap.dim());
        let mut rows = Vec::with_capacity(1 + submap.feature_count());

        let relative = start.between(&end);
        predicted
            .fixed_rows_mut::<3>(0)
            .copy_from(&Vector3::new(relative.x, relative.y, end.theta - start.theta));
        let (h_start, h_end) = end_pose_jacobian(&start, &end);
        let mut row = vec![(linkage.end, to_dynamic(&h_end))];
        if let Some(index) = linkage.start {
            row.push((index, to_dynamic(&h_start)));
        }
        rows.push(row);

        for (k, &index) in linkage.features.iter().enumerate() {
            let position = feature_at(state, index)?;
            let offset = POSE_DIM + FEATURE_DIM * k;
            predicted
                .fixed_rows_mut::<2>(offset)
                .copy_from(&start.inverse_transform_point(&position));
            let (h_start, h_feature) = feature_jacobian(&start, &position);
            let mut row = vec![(index, to_dynamic(&h_feature))];
            if let Some(start_index) = linkage.start {
                row.push((start_index, to_dynamic(&h_start)));
            }
            rows.push(row);
        }

        Ok((predicted, rows))
    }

    /// `ΔI = Hᵀ Σ⁻¹ H` and `Δi = Hᵀ Σ⁻¹ (z - h(x̂) + H x̂)` for one submap
    pub fn compute_contribution(
        &self,
        submap: &LocalSubmap,
        state: &GlobalState,
        linkage: &SubmapLinkage,
    ) -> FusionResult<InformationContribution> {
        let information = submap.information()?;
        let (predicted, rows) = self.linearize(submap, state, linkage)?;
        let offsets = submap.measurement_offsets();
        let dims = state.dims();

        // z - h(x̂) + H x̂, heading innovation wrapped
        let mut residual = measurement(submap) - &predicted;
        residual[2] = normalize_angle(residual[2]);
        for (a, row) in rows.iter().enumerate() {
            for (index, partial) in row {
                let estimate = state
                    .get(*index)
                    .map(|e| e.estimate())
                    .ok_or(FusionError::IndexOutOfRange {
                        index: *index,
                        len: state.len(),
                    })?;
                let mut view = residual.rows_mut(offsets[a], partial.nrows());
                view += partial * estimate;
            }
        }
        let residual = DMatrix::from_column_slice(residual.len(), 1, residual.as_slice());
        let weighted = &information * residual;

        let mut matrix = SparseBlockMatrix::new(dims.clone());
        let mut vector = SparseBlockColumn::new(dims, 1);

        for (a, row_a) in rows.iter().enumerate() {
            let rows_a = row_a.first().map(|(_, p)| p.nrows()).unwrap_or(0);
            let w_a = weighted.rows(offsets[a], rows_a);
            for (u, h_au) in row_a {
                vector.add_block(*u, &BlockMatrix::from_dmatrix(h_au.transpose() * w_a))?;
            }

            for (b, row_b) in rows.iter().enumerate() {
                let rows_b = row_b.first().map(|(_, p)| p.nrows()).unwrap_or(0);
                let sigma_ab = information.view((offsets[a], offsets[b]), (rows_a, rows_b));
                for (u, h_au) in row_a {
                    let left = h_au.transpose() * sigma_ab;
                    for (v, h_bv) in row_b {
                        if u >= v {
                            matrix.add_block(*u, *v, &BlockMatrix::from_dmatrix(&left * h_bv))?;
                        }
                    }
                }
            }
        }

        Ok(InformationContribution { matrix, vector })
    }
}

/// Stacked submap measurement `z = [end pose; features]`
fn measurement(submap: &LocalSubmap) -> DVector<f64> {
    let mut z = DVector::zeros(submap.dim());
    z.fixed_rows_mut::<3>(0)
        .copy_from(&submap.end_pose.to_vector());
    for (k, f) in submap.features.iter().enumerate() {
        z.fixed_rows_mut::<2>(POSE_DIM + FEATURE_DIM * k).copy_from(f);
    }
    z
}

fn pose_at(state: &GlobalState, index: usize) -> FusionResult<Pose2D> {
    match state.get(index) {
        Some(super::state::StateEntry::Pose(p)) => Ok(p.pose),
        Some(_) => Err(FusionError::InvalidSubmap(format!(
            "state entry {index} is not a pose"
        ))),
        None => Err(FusionError::IndexOutOfRange {
            index,
            len: state.len(),
        }),
    }
}

fn feature_at(state: &GlobalState, index: usize) -> FusionResult<Vector2<f64>> {
    match state.get(index) {
        Some(super::state::StateEntry::Feature(f)) => Ok(f.position),
        Some(_) => Err(FusionError::InvalidSubmap(format!(
            "state entry {index} is not a feature"
        ))),
        None => Err(FusionError::IndexOutOfRange {
            index,
            len: state.len(),
        }),
    }
}
