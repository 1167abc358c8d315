//! Domain model: identifiers and job outcomes.

pub mod ids;
pub mod result;

pub use ids::{EntryId, Id, IdMarker, LeaseToken, LockToken};
pub use result::JobResult;
