mod registry;
mod types;

pub use registry::StewardRegistry;
pub use types::{AckOutcome, Steward, StewardStatus};
