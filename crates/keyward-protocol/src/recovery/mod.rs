mod coordinator;
mod types;

pub use coordinator::{respond, RecoveryCoordinator};
pub use types::*;
