//! The synchronization pipeline: bulk catch-up, realtime tailing, and the
//! supervisor that runs both under a fleet-wide lease.

pub mod bulk;
pub mod processor;
pub mod realtime;
pub mod supervisor;

pub use bulk::{BulkSummary, BulkSyncCoordinator};
pub use processor::ChangeEventProcessor;
pub use realtime::{RealtimeSyncCoordinator, SyncPhase};
pub use supervisor::SyncSupervisor;
