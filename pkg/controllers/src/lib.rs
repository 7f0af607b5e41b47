//! Migration quota controller.
//!
//! Keeps the `RejectedByResourceQuota` condition of live VM migrations in
//! line with namespace ResourceQuota headroom and tenant-issued
//! MigrationResourceGrants.

pub mod admission;
pub mod condition;
pub mod controller;
pub mod estimator;
pub mod grants;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod tracker;

pub use controller::{ControllerConfig, MigrationQuotaController, RunningController};
