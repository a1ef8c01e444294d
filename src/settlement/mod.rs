// Settlement: worker pool paying out reward jobs, and the lease reaper
pub mod scheduler;
pub mod worker;

pub use scheduler::{LeaseReaper, ReaperConfig};
pub use worker::{SettlementConfig, SettlementDeps, SettlementWorker, WorkerPool};
