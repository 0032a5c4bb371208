pub mod amd;
pub mod block;
pub mod cholesky;
pub mod sparse_block;

pub use amd::*;
pub use block::*;
pub use cholesky::*;
pub use sparse_block::*;
