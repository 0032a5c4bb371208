pub mod association;
pub mod fusion;
pub mod information;
pub mod queue;
pub mod state;
pub mod submap;

pub use association::*;
pub use fusion::*;
pub use information::*;
pub use queue::*;
pub use state::*;
pub use submap::*;
