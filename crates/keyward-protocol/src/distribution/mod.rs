//! Shard distribution from the owner and shard custody on the steward side.

mod coordinator;
mod held;
mod types;

pub use coordinator::DistributionCoordinator;
pub use held::HeldShards;
pub use types::*;
