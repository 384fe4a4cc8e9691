//! Multi-Node Operation Coordinator
//!
//! Tracks cluster-wide operations that need an acknowledgement from several
//! satellites, using snapshot rollback as the operation: at most one rollback
//! per resource, outcomes collected per node, recovery on partial failure.

pub mod record;
pub mod rollback;

pub use record::{InflightRollback, InflightSummary, RollbackOutcome, RollbackPhase};
pub use rollback::{ApiCallStream, RollbackCoordinator, RollbackHandle};
