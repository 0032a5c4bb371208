//! Tunable parameters of the fusion engine
//!
//! Every section has defaults, so a YAML file only needs the values it
//! overrides:
//!
//! ```yaml
//! association:
//!   gate: 2.5
//! estimation_error_cutoff: 4.0
//! refusion:
//!   period: 20
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};

/// Nearest-neighbour association settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Mahalanobis gate added to the running estimation error
    pub gate: f64,
    /// Prune matches until the joint innovation passes the χ² test
    pub joint_compatibility: bool,
    /// Confidence level of the joint compatibility test
    pub confidence: f64,
    /// Fuse submaps that match no global feature (pose chain only)
    pub allow_unmatched_submaps: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            gate: 3.0,
            joint_compatibility: true,
            confidence: 0.99,
            allow_unmatched_submaps: false,
        }
    }
}

/// Grid-voting relocalization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cell size of the translation voting grid (meters)
    pub sampling_rate: f64,
    /// Heading hypothesis step (degrees)
    pub angular_step_deg: f64,
    /// Starting multiplier of the submap radius for the grid extent
    pub initial_multiplier: f64,
    /// Multiplier increment after every relocalization attempt
    pub growth_increment: f64,
    /// Minimum one-to-one votes in the winning cell
    pub min_votes: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 0.25,
            angular_step_deg: 5.0,
            initial_multiplier: 1.0,
            growth_increment: 0.5,
            min_votes: 2,
        }
    }
}

/// Relinearization loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Largest estimate change considered converged
    pub convergence_cutoff: f64,
    /// Rebuild budget per fused submap
    pub max_iterations: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            convergence_cutoff: 1e-3,
            max_iterations: 5,
        }
    }
}

/// Full refusion schedule; zero disables a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefusionConfig {
    /// Refuse every `period` fused submaps
    pub period: usize,
    /// Additional refusion once this many submaps are fused
    pub first_at: usize,
}

impl Default for RefusionConfig {
    fn default() -> Self {
        Self {
            period: 25,
            first_at: 5,
        }
    }
}

/// Linear solver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Relative pivot threshold of the block Cholesky factorization
    pub pivot_tolerance: f64,
    /// Run the minimum degree reordering when the state grows
    pub reorder: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            pivot_tolerance: crate::linalg::PIVOT_EPSILON,
            reorder: true,
        }
    }
}

/// Full configuration of the fusion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub association: AssociationConfig,
    /// Estimation error above which grid voting replaces nearest neighbour
    pub estimation_error_cutoff: f64,
    pub grid: GridConfig,
    pub smoothing: SmoothingConfig,
    /// Maximum features per local submap
    pub submap_capacity: usize,
    pub refusion: RefusionConfig,
    pub solver: SolverConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            association: AssociationConfig::default(),
            estimation_error_cutoff: 5.0,
            grid: GridConfig::default(),
            smoothing: SmoothingConfig::default(),
            submap_capacity: 32,
            refusion: RefusionConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl FusionConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> FusionResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse from YAML string and validate
    pub fn from_yaml(yaml: &str) -> FusionResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> FusionResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> FusionResult<()> {
        fn positive(name: &str, value: f64) -> FusionResult<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(FusionError::Config(format!("{name} must be positive, got {value}")))
            }
        }

        positive("association.gate", self.association.gate)?;
        if !(self.association.confidence > 0.0 && self.association.confidence < 1.0) {
            return Err(FusionError::Config(format!(
                "association.confidence must be in (0, 1), got {}",
                self.association.confidence
            )));
        }
        positive("estimation_error_cutoff", self.estimation_error_cutoff)?;
        positive("grid.sampling_rate", self.grid.sampling_rate)?;
        positive("grid.angular_step_deg", self.grid.angular_step_deg)?;
        positive("grid.initial_multiplier", self.grid.initial_multiplier)?;
        if !(self.grid.growth_increment >= 0.0) {
            return Err(FusionError::Config(
                "grid.growth_increment must not be negative".to_string(),
            ));
        }
        if self.grid.min_votes == 0 {
            return Err(FusionError::Config("grid.min_votes must be at least 1".to_string()));
        }
        positive("smoothing.convergence_cutoff", self.smoothing.convergence_cutoff)?;
        if self.submap_capacity == 0 {
            return Err(FusionError::Config("submap_capacity must be at least 1".to_string()));
        }
        positive("solver.pivot_tolerance", self.solver.pivot_tolerance)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FusionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.submap_capacity, 32);
        assert_eq!(config.grid.sampling_rate, 0.25);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
association:
  gate: 2.5
estimation_error_cutoff: 4.0
refusion:
  period: 20
"#;
        let config = FusionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.association.gate, 2.5);
        assert!(config.association.joint_compatibility);
        assert_eq!(config.estimation_error_cutoff, 4.0);
        assert_eq!(config.refusion.period, 20);
        assert_eq!(config.refusion.first_at, 5);
        assert_eq!(config.smoothing, SmoothingConfig::default());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = FusionConfig::default();
        config.grid.min_votes = 3;
        config.solver.reorder = false;
        let yaml = config.to_yaml().unwrap();
        assert_eq!(FusionConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = FusionConfig::from_yaml("grid:\n  sampling_rate: 0.0\n").unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));

        let err = FusionConfig::from_yaml("association:\n  confidence: 1.5\n").unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));

        let err = FusionConfig::from_yaml("submap_capacity: [1, 2]").unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FusionConfig::load(Path::new("/nonexistent/fusion.yaml")).unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));
    }
}
