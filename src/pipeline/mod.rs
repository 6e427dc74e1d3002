//! Write path: reconciliation, the worker pool and the orchestrating loop.

pub mod orchestrator;
pub mod reconcile;
pub mod worker;

pub use orchestrator::{ExitReason, Orchestrator, RunSummary};
pub use reconcile::ReconciliationEngine;
pub use worker::{spawn_worker_pool, WorkKind, WorkUnit, WorkerPoolHandle};
