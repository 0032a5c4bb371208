//! Local submaps produced by the front end
//!
//! A submap is built in its own frame, whose origin is the robot pose at the
//! start of the submap. It carries the pose at the end of the submap, the
//! features observed meanwhile and the joint covariance of
//! `[end pose (3); features (2 each)]`.

use nalgebra::{DMatrix, Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use super::state::{Pose2D, FEATURE_DIM, POSE_DIM};
use crate::error::{FusionError, FusionResult};

/// Relative asymmetry tolerated in a submap covariance
const SYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSubmap {
    /// Robot pose at the end of the submap, in the submap frame
    pub end_pose: Pose2D,
    /// Features in the submap frame
    pub features: Vec<Vector2<f64>>,
    /// Joint covariance over the end pose and the features
    pub covariance: DMatrix<f64>,
}

impl LocalSubmap {
    pub fn new(
        end_pose: Pose2D,
        features: Vec<Vector2<f64>>,
        covariance: DMatrix<f64>,
    ) -> FusionResult<Self> {
        let submap = Self {
            end_pose,
            features,
            covariance,
        };
        submap.check_covariance()?;
        Ok(submap)
    }

    /// Submap with independent noise on the pose translation, heading and features
    pub fn with_diagonal_covariance(
        end_pose: Pose2D,
        features: Vec<Vector2<f64>>,
        position_variance: f64,
        heading_variance: f64,
        feature_variance: f64,
    ) -> Self {
        let dim = POSE_DIM + FEATURE_DIM * features.len();
        let covariance = DMatrix::from_fn(dim, dim, |r, c| match (r == c, r) {
            (false, _) => 0.0,
            (true, 0) | (true, 1) => position_variance,
            (true, 2) => heading_variance,
            (true, _) => feature_variance,
        });
        Self {
            end_pose,
            features,
            covariance,
        }
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Length of the measurement vector
    pub fn dim(&self) -> usize {
        POSE_DIM + FEATURE_DIM * self.features.len()
    }

    /// Offset of each measurement block: end pose, then one per feature
    pub fn measurement_offsets(&self) -> Vec<usize> {
        std::iter::once(0)
            .chain((0..self.features.len()).map(|k| POSE_DIM + FEATURE_DIM * k))
            .collect()
    }

    /// Largest feature distance from the submap origin
    pub fn radius(&self) -> f64 {
        self.features
            .iter()
            .map(|f| f.norm())
            .fold(self.end_pose.translation().norm(), f64::max)
    }

    /// Local covariance of feature `k`
    pub fn feature_covariance(&self, k: usize) -> Matrix2<f64> {
        let offset = POSE_DIM + FEATURE_DIM * k;
        self.covariance
            .fixed_view::<2, 2>(offset, offset)
            .into_owned()
    }

    /// Inverse of the covariance; fails if it is not positive definite
    pub fn information(&self) -> FusionResult<DMatrix<f64>> {
        let cholesky = self.covariance.clone().cholesky().ok_or_else(|| {
            FusionError::InvalidSubmap("covariance is not positive definite".to_string())
        })?;
        Ok(cholesky.inverse())
    }

    fn check_covariance(&self) -> FusionResult<()> {
        let dim = self.dim();
        if self.covariance.shape() != (dim, dim) {
            return Err(FusionError::dimension(
                "submap covariance",
                (dim, dim),
                self.covariance.shape(),
            ));
        }
        if self.covariance.iter().any(|v| !v.is_finite()) {
            return Err(FusionError::InvalidSubmap(
                "covariance has non-finite entries".to_string(),
            ));
        }
        let scale = self.covariance.amax().max(1.0);
        let asymmetry = (&self.covariance - self.covariance.transpose()).amax();
        if asymmetry > SYMMETRY_TOLERANCE * scale {
            return Err(FusionError::InvalidSubmap(format!(
                "covariance is not symmetric (max asymmetry {asymmetry:e})"
            )));
        }
        Ok(())
    }

    /// Validate shape, capacity and values before fusion
    pub fn validate(&self, capacity: usize) -> FusionResult<()> {
        if self.features.len() > capacity {
            return Err(FusionError::InvalidSubmap(format!(
                "{} features exceed the submap capacity of {capacity}",
                self.features.len()
            )));
        }
        let pose = self.end_pose.to_vector();
        if pose.iter().chain(self.features.iter().flat_map(|f| f.iter())).any(|v| !v.is_finite()) {
            return Err(FusionError::InvalidSubmap(
                "non-finite pose or feature".to_string(),
            ));
        }
        self.check_covariance()?;
        self.information().map(|_| ())
    }
}
