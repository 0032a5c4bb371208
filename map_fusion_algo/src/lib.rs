//! Fusion of local feature submaps into a global map
//!
//! Submaps arrive from a front end, are associated with the global map and
//! fused into a sparse extended information filter solved by block
//! Cholesky factorization.

pub mod config;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod slam;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{FusionError, FusionResult};
    pub use crate::slam::{
        Association, AssociationStrategy, DataAssociator, EntryId, FusionPhase, FusionReport,
        FusionStatus, FusionWorker, GlobalMapFusionEngine, GlobalState, GridVotingAssociator,
        LocalSubmap, NearestNeighborAssociator, Pose2D, RefusionSummary, SubmapProducer,
        SubmapQueue,
    };
    pub use nalgebra;
    pub use nalgebra::{matrix, vector};
}

pub use logger::{init_logger, init_logger_with_level};
pub use prelude::*;
